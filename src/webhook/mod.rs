//! Inbound push messages, their provenance check and the passive reply.

use crate::error::RelayResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Fields of an XML push the relay needs. Unknown elements are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InboundMessage {
    #[serde(rename = "ToUserName")]
    pub to_user: String,
    #[serde(rename = "FromUserName")]
    pub from_user: String,
    #[serde(rename = "CreateTime")]
    pub create_time: i64,
    #[serde(rename = "MsgType")]
    pub msg_type: String,
    #[serde(rename = "MsgId", default)]
    pub msg_id: Option<String>,
    #[serde(rename = "Content", default)]
    pub content: Option<String>,
    #[serde(rename = "Event", default)]
    pub event: Option<String>,
    #[serde(rename = "EventKey", default)]
    pub event_key: Option<String>,
    #[serde(rename = "MediaId", default)]
    pub media_id: Option<String>,
}

impl InboundMessage {
    pub fn from_xml(xml: &str) -> Result<Self, quick_xml::de::DeError> {
        quick_xml::de::from_str(xml)
    }

    /// Key under which this message's reply is de-duplicated.
    pub fn dedup_key(&self, tenant: &str) -> String {
        crate::reply::message_key(
            tenant,
            self.msg_id.as_deref(),
            &self.from_user,
            self.create_time,
        )
    }

    pub fn is_event(&self) -> bool {
        self.msg_type.eq_ignore_ascii_case("event")
    }
}

/// Passive reply. Stored in the reply cache, so every redelivery renders
/// the same bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reply {
    /// Plain `success`: acknowledged, nothing to say.
    Empty,
    Text {
        to: String,
        from: String,
        create_time: i64,
        content: String,
    },
}

impl Reply {
    /// Text reply addressed back to the sender of `inbound`.
    pub fn text_to(inbound: &InboundMessage, content: impl Into<String>) -> Self {
        Self::Text {
            to: inbound.from_user.clone(),
            from: inbound.to_user.clone(),
            create_time: chrono::Utc::now().timestamp(),
            content: content.into(),
        }
    }

    pub fn render(&self) -> String {
        match self {
            Self::Empty => "success".to_string(),
            Self::Text {
                to,
                from,
                create_time,
                content,
            } => format!(
                "<xml><ToUserName>{}</ToUserName><FromUserName>{}</FromUserName>\
<CreateTime>{create_time}</CreateTime><MsgType><![CDATA[text]]></MsgType>\
<Content>{}</Content></xml>",
                cdata(to),
                cdata(from),
                cdata(content)
            ),
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Empty => "text/plain; charset=utf-8",
            Self::Text { .. } => "application/xml; charset=utf-8",
        }
    }
}

fn cdata(text: &str) -> String {
    format!("<![CDATA[{}]]>", text.replace("]]>", "]]]]><![CDATA[>"))
}

/// Query parameters the platform signs a delivery with.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignedRequest {
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub nonce: String,
    #[serde(default)]
    pub echostr: Option<String>,
    #[serde(default)]
    pub encrypt_type: Option<String>,
    #[serde(default)]
    pub msg_signature: Option<String>,
}

/// Confirms a delivery came from the platform and yields the plaintext
/// payload. Encrypted modes are implemented by the embedding application.
pub trait MessageVerifier: Send + Sync {
    /// URL ownership check (the GET handshake).
    fn verify_handshake(&self, request: &SignedRequest) -> bool;

    /// Returns the plaintext XML, or `None` when provenance cannot be
    /// established.
    fn open(&self, request: &SignedRequest, body: &str) -> Option<String>;
}

/// Plaintext mode: SHA-1 over the sorted token, timestamp and nonce.
#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    token: String,
    accept_envelope: bool,
}

impl SignatureVerifier {
    pub fn new(token: &str) -> Self {
        Self {
            token: token.trim().to_string(),
            accept_envelope: false,
        }
    }

    /// Compatible mode: deliveries flagged `encrypt_type=aes` still carry the
    /// plaintext fields next to the ciphertext, so they are accepted.
    pub fn compatible(token: &str) -> Self {
        Self {
            accept_envelope: true,
            ..Self::new(token)
        }
    }

    pub fn sign(&self, timestamp: &str, nonce: &str) -> String {
        let mut parts = [self.token.as_str(), timestamp.trim(), nonce.trim()];
        parts.sort_unstable();

        let mut sha = Sha1::new();
        sha.update(parts.concat());
        hex::encode(sha.finalize())
    }

    fn matches(&self, request: &SignedRequest) -> bool {
        let signature = request.signature.trim();
        !signature.is_empty()
            && self
                .sign(&request.timestamp, &request.nonce)
                .eq_ignore_ascii_case(signature)
    }
}

impl MessageVerifier for SignatureVerifier {
    fn verify_handshake(&self, request: &SignedRequest) -> bool {
        self.matches(request)
    }

    fn open(&self, request: &SignedRequest, body: &str) -> Option<String> {
        let encrypted = request
            .encrypt_type
            .as_deref()
            .is_some_and(|kind| !kind.is_empty() && kind != "raw");
        if encrypted && !self.accept_envelope {
            tracing::warn!("encrypted delivery received but only plaintext mode is configured");
            return None;
        }
        self.matches(request).then(|| body.to_string())
    }
}

/// Business logic behind the webhook.
#[async_trait]
pub trait ReplyHandler: Send + Sync {
    async fn handle(&self, tenant: &str, message: &InboundMessage) -> RelayResult<Reply>;
}

/// Acknowledges every delivery without a reply.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcknowledgeHandler;

#[async_trait]
impl ReplyHandler for AcknowledgeHandler {
    async fn handle(&self, tenant: &str, message: &InboundMessage) -> RelayResult<Reply> {
        tracing::debug!(
            "acknowledging {} for {}",
            message.msg_type,
            crate::config::id_hint(tenant)
        );
        Ok(Reply::Empty)
    }
}
