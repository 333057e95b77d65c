//! Exact-length multipart/form-data bodies for media uploads.
//!
//! The upstream rejects `Transfer-Encoding: chunked`, so bodies are fully
//! materialized and their length declared up front. The body is assembled
//! from an ordered segment list with a running length, so the declared
//! `Content-Length` and the emitted bytes come from the same source.

pub mod sniff;

use aho_corasick::AhoCorasick;
use rand::RngExt;

pub use sniff::{sniff, sniff_mime, MediaKind, GENERIC_BINARY};

const CRLF: &[u8] = b"\r\n";
const DASHES: &[u8] = b"--";
const BOUNDARY_PREFIX: &str = "----WxRelayBoundary";
const BOUNDARY_TOKEN_LEN: usize = 32;
const MAX_BOUNDARY_ATTEMPTS: usize = 8;

/// Optional second part carrying JSON metadata (e.g. a video description).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxiliaryPart {
    pub name: String,
    pub json: String,
}

impl AuxiliaryPart {
    pub fn new(name: impl Into<String>, json: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            json: json.into(),
        }
    }
}

#[derive(Debug, Clone)]
enum Segment<'a> {
    Borrowed(&'a [u8]),
    Owned(Vec<u8>),
}

impl Segment<'_> {
    fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Borrowed(bytes) => bytes,
            Self::Owned(bytes) => bytes,
        }
    }
}

/// Ordered byte segments plus the running total of their lengths.
#[derive(Debug, Default)]
struct BodyBuilder<'a> {
    segments: Vec<Segment<'a>>,
    length: usize,
}

impl<'a> BodyBuilder<'a> {
    fn push_borrowed(&mut self, bytes: &'a [u8]) -> &mut Self {
        self.length += bytes.len();
        self.segments.push(Segment::Borrowed(bytes));
        self
    }

    fn push_owned(&mut self, bytes: Vec<u8>) -> &mut Self {
        self.length += bytes.len();
        self.segments.push(Segment::Owned(bytes));
        self
    }

    fn push_text(&mut self, text: String) -> &mut Self {
        self.push_owned(text.into_bytes())
    }

    fn finish(self, boundary: String) -> ComposedBody<'a> {
        ComposedBody {
            content_type: format!("multipart/form-data; boundary={boundary}"),
            boundary,
            segments: self.segments,
            content_length: self.length,
        }
    }
}

/// A composed request body borrowing the payload it was built from. Emit it
/// with [`ComposedBody::to_bytes`] and declare
/// [`ComposedBody::content_length`].
#[derive(Debug, Clone)]
pub struct ComposedBody<'a> {
    boundary: String,
    content_type: String,
    segments: Vec<Segment<'a>>,
    content_length: usize,
}

impl ComposedBody<'_> {
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// `multipart/form-data; boundary=<token>`.
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn content_length(&self) -> usize {
        self.content_length
    }

    /// The body as the ordered byte chunks it was built from.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.segments.iter().map(Segment::as_bytes)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(self.content_length);
        for chunk in self.chunks() {
            body.extend_from_slice(chunk);
        }
        debug_assert_eq!(body.len(), self.content_length);
        body
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MultipartComposer;

impl MultipartComposer {
    pub fn new() -> Self {
        Self
    }

    /// Composes a body with one binary part and an optional JSON part under
    /// a fresh random boundary that does not occur in either part.
    pub fn compose<'a>(
        &self,
        payload: &'a [u8],
        field_name: &str,
        filename: &str,
        auxiliary: Option<&'a AuxiliaryPart>,
    ) -> ComposedBody<'a> {
        let boundary = fresh_boundary(payload, auxiliary);
        self.compose_with_boundary(boundary, payload, field_name, filename, auxiliary)
    }

    pub fn compose_with_boundary<'a>(
        &self,
        boundary: String,
        payload: &'a [u8],
        field_name: &str,
        filename: &str,
        auxiliary: Option<&'a AuxiliaryPart>,
    ) -> ComposedBody<'a> {
        let mime = sniff_mime(payload);
        let delimiter = format!("--{boundary}");
        let mut body = BodyBuilder::default();

        body.push_text(delimiter.clone())
            .push_borrowed(CRLF)
            .push_text(format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"",
                header_value(field_name),
                header_value(filename)
            ))
            .push_borrowed(CRLF)
            .push_text(format!("Content-Type: {mime}"))
            .push_borrowed(CRLF)
            .push_borrowed(CRLF)
            .push_borrowed(payload)
            .push_borrowed(CRLF)
            .push_text(delimiter.clone());

        if let Some(part) = auxiliary {
            body.push_borrowed(CRLF)
                .push_text(format!(
                    "Content-Disposition: form-data; name=\"{}\";",
                    header_value(&part.name)
                ))
                .push_borrowed(CRLF)
                .push_borrowed(CRLF)
                .push_borrowed(part.json.as_bytes())
                .push_borrowed(CRLF)
                .push_text(delimiter);
        }

        body.push_borrowed(DASHES).push_borrowed(CRLF);
        body.finish(boundary)
    }
}

/// Default filename for a payload with no name of its own.
pub fn default_filename(payload: &[u8]) -> String {
    let extension = sniff(payload).map_or("bin", MediaKind::extension);
    format!("media.{extension}")
}

fn header_value(raw: &str) -> String {
    raw.chars()
        .filter(|ch| *ch != '\r' && *ch != '\n')
        .collect::<String>()
        .replace('"', "%22")
}

fn random_boundary() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::rng();
    let token: String = (0..BOUNDARY_TOKEN_LEN)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect();
    format!("{BOUNDARY_PREFIX}{token}")
}

fn collides(boundary: &str, payload: &[u8], auxiliary: Option<&AuxiliaryPart>) -> bool {
    let Ok(matcher) = AhoCorasick::new([format!("--{boundary}")]) else {
        return false;
    };
    matcher.is_match(payload) || auxiliary.is_some_and(|part| matcher.is_match(&part.json))
}

fn fresh_boundary(payload: &[u8], auxiliary: Option<&AuxiliaryPart>) -> String {
    let mut boundary = random_boundary();
    for _ in 1..MAX_BOUNDARY_ATTEMPTS {
        if !collides(&boundary, payload, auxiliary) {
            break;
        }
        tracing::debug!("multipart boundary collided with payload, regenerating");
        boundary = random_boundary();
    }
    boundary
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_HEAD: &[u8] = b"\x89PNG\r\n\x1a\n";

    fn png_payload(size: usize) -> Vec<u8> {
        let mut payload = PNG_HEAD.to_vec();
        payload.resize(size.max(PNG_HEAD.len()), 0xAB);
        payload
    }

    fn video_description() -> AuxiliaryPart {
        AuxiliaryPart::new(
            "description",
            r#"{"title":"Launch","introduction":"First cut"}"#,
        )
    }

    #[test]
    fn declared_length_matches_emitted_bytes() {
        let composer = MultipartComposer::new();
        let aux = video_description();
        for size in [0usize, 1, 8, 1024, 65_537] {
            for auxiliary in [None, Some(&aux)] {
                let payload = if size == 0 { Vec::new() } else { png_payload(size) };
                let composed = composer.compose(&payload, "media", "clip.png", auxiliary);

                let summed: usize = composed.chunks().map(<[u8]>::len).sum();
                assert_eq!(summed, composed.content_length());
                assert_eq!(composed.to_bytes().len(), composed.content_length());
            }
        }
    }

    #[test]
    fn body_layout_is_byte_exact() {
        let composed = MultipartComposer::new().compose_with_boundary(
            "B".into(),
            b"GIF89a!",
            "media",
            "a.gif",
            None,
        );
        let expected = b"--B\r\n\
Content-Disposition: form-data; name=\"media\"; filename=\"a.gif\"\r\n\
Content-Type: image/gif\r\n\
\r\n\
GIF89a!\r\n\
--B--\r\n";
        assert_eq!(composed.to_bytes(), expected.to_vec());
        assert_eq!(composed.content_length(), expected.len());
        assert_eq!(composed.content_type(), "multipart/form-data; boundary=B");
    }

    #[test]
    fn auxiliary_part_follows_primary_part() {
        let description = AuxiliaryPart::new("description", "{}");
        let composed = MultipartComposer::new().compose_with_boundary(
            "B".into(),
            b"xyz",
            "media",
            "v.mp4",
            Some(&description),
        );
        let expected = b"--B\r\n\
Content-Disposition: form-data; name=\"media\"; filename=\"v.mp4\"\r\n\
Content-Type: application/octet-stream\r\n\
\r\n\
xyz\r\n\
--B\r\n\
Content-Disposition: form-data; name=\"description\";\r\n\
\r\n\
{}\r\n\
--B--\r\n";
        assert_eq!(composed.to_bytes(), expected.to_vec());
        assert_eq!(composed.content_length(), expected.len());
    }

    #[test]
    fn declared_content_type_follows_sniffed_payload() {
        let composer = MultipartComposer::new();
        let cases: &[(&[u8], &str)] = &[
            (b"\x89PNG\r\n\x1a\n....", "image/png"),
            (b"\xFF\xD8\xFF\xE0....", "image/jpeg"),
            (b"BM\x36\x00\x0C\x00\x00\x00\x00\x00\x36\x00", "image/bmp"),
            (b"BMW owners club", GENERIC_BINARY),
            (b"GIF87a..", "image/gif"),
            (b"GIF89a..", "image/gif"),
            (b"ID3\x03....", "audio/mpeg"),
            (b"\x00\x00\x00\x20ftypisom", "video/mp4"),
            (b"no magic here", GENERIC_BINARY),
        ];
        for (payload, mime) in cases {
            let composed = composer.compose(payload, "media", "f", None);
            let text = String::from_utf8_lossy(&composed.to_bytes()).into_owned();
            assert!(
                text.contains(&format!("Content-Type: {mime}\r\n")),
                "expected {mime} in {text:?}"
            );
        }
    }

    #[test]
    fn boundaries_are_fresh_and_absent_from_payload() {
        let composer = MultipartComposer::new();
        let payload = png_payload(64);
        let a = composer.compose(&payload, "media", "a.png", None);
        let b = composer.compose(&payload, "media", "a.png", None);
        assert_ne!(a.boundary(), b.boundary());
        assert!(a.boundary().starts_with(BOUNDARY_PREFIX));
        assert_eq!(a.boundary().len(), BOUNDARY_PREFIX.len() + BOUNDARY_TOKEN_LEN);
    }

    #[test]
    fn collision_check_sees_payload_and_auxiliary() {
        let payload = b"prefix--abc suffix".to_vec();
        assert!(collides("abc", &payload, None));
        assert!(!collides("abd", &payload, None));
        let aux = AuxiliaryPart::new("description", "{\"x\":\"--zzz\"}");
        assert!(collides("zzz", b"", Some(&aux)));
    }

    #[test]
    fn header_values_cannot_break_out_of_quotes() {
        let composed = MultipartComposer::new().compose_with_boundary(
            "B".into(),
            b"",
            "media",
            "evil\".png\r\nX-Injected: 1",
            None,
        );
        let text = String::from_utf8(composed.to_bytes()).unwrap();
        assert!(text.contains("filename=\"evil%22.pngX-Injected: 1\""));
        assert!(!text.contains("\r\nX-Injected"));
    }

    #[test]
    fn default_filename_uses_sniffed_extension() {
        assert_eq!(default_filename(&png_payload(16)), "media.png");
        assert_eq!(default_filename(b"????"), "media.bin");
    }
}
