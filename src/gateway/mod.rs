//! Axum HTTP gateway.
//!
//! - `GET  /wechat/{tenant}`: URL ownership handshake (echoes `echostr`)
//! - `POST /wechat/{tenant}`: push delivery, answered through the reply cache
//! - `GET  /health`
//! - `GET  /metrics`: Prometheus text format

use crate::context::RelayContext;
use crate::error::RelayError;
use crate::webhook::{InboundMessage, ReplyHandler, SignedRequest};
use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

const ACK: &str = "success";

#[derive(Clone)]
pub struct GatewayState {
    context: Arc<RelayContext>,
    handler: Arc<dyn ReplyHandler>,
}

impl GatewayState {
    pub fn new(context: Arc<RelayContext>, handler: Arc<dyn ReplyHandler>) -> Self {
        Self { context, handler }
    }
}

pub fn build_router(state: GatewayState) -> Router {
    let gateway = &state.context.config().gateway;
    let body_limit = gateway.max_body_bytes;
    let timeout = Duration::from_secs(gateway.request_timeout_secs.max(1));

    Router::new()
        .route(
            "/wechat/{tenant}",
            get(handle_handshake).post(handle_delivery),
        )
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            timeout,
        ))
}

/// Binds the configured address and serves until Ctrl-C.
pub async fn serve(context: Arc<RelayContext>, handler: Arc<dyn ReplyHandler>) -> Result<()> {
    let gateway = &context.config().gateway;
    let addr: SocketAddr = format!("{}:{}", gateway.host, gateway.port)
        .parse()
        .with_context(|| format!("invalid gateway address {}:{}", gateway.host, gateway.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("gateway listening on http://{addr}");

    let app = build_router(GatewayState::new(Arc::clone(&context), handler));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server failed")?;
    tracing::info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
}

fn plain(status: StatusCode, body: &'static str) -> Response {
    (status, body).into_response()
}

async fn handle_health() -> impl IntoResponse {
    "OK"
}

async fn handle_metrics(State(state): State<GatewayState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.context.metrics().render(),
    )
}

async fn handle_handshake(
    State(state): State<GatewayState>,
    Path(tenant): Path<String>,
    Query(query): Query<SignedRequest>,
) -> Response {
    if !state.context.is_tenant(&tenant) {
        return plain(StatusCode::NOT_FOUND, "unknown tenant");
    }
    let Some(verifier) = state.context.verifier(&tenant) else {
        return plain(StatusCode::NOT_FOUND, "no verifier for tenant");
    };
    let Some(echostr) = query.echostr.clone() else {
        return plain(StatusCode::BAD_REQUEST, "missing echostr");
    };
    if !verifier.verify_handshake(&query) {
        tracing::warn!(
            "handshake with bad signature for {}",
            crate::config::id_hint(&tenant)
        );
        return plain(StatusCode::UNAUTHORIZED, "invalid signature");
    }
    (StatusCode::OK, echostr).into_response()
}

async fn handle_delivery(
    State(state): State<GatewayState>,
    Path(tenant): Path<String>,
    Query(query): Query<SignedRequest>,
    body: String,
) -> Response {
    if !state.context.is_tenant(&tenant) {
        return plain(StatusCode::NOT_FOUND, "unknown tenant");
    }
    let Some(verifier) = state.context.verifier(&tenant) else {
        return plain(StatusCode::NOT_FOUND, "no verifier for tenant");
    };
    let Some(plaintext) = verifier.open(&query, &body) else {
        tracing::warn!(
            "delivery with bad signature for {}",
            crate::config::id_hint(&tenant)
        );
        return plain(StatusCode::UNAUTHORIZED, "invalid signature");
    };

    let message = match InboundMessage::from_xml(&plaintext) {
        Ok(message) => message,
        Err(err) => {
            // Unparseable pushes are acknowledged so the platform stops retrying.
            tracing::warn!("unparseable delivery for {}: {err}", crate::config::id_hint(&tenant));
            return plain(StatusCode::OK, ACK);
        }
    };

    let key = message.dedup_key(&tenant);
    let handler = Arc::clone(&state.handler);
    let owner = tenant.clone();
    let outcome = state
        .context
        .replies()
        .get_or_compute(&key, move || async move {
            handler.handle(&owner, &message).await
        })
        .await;

    match outcome {
        Ok(reply) => ([(header::CONTENT_TYPE, reply.content_type())], reply.render()).into_response(),
        Err(err) => delivery_error(&tenant, &err),
    }
}

fn delivery_error(tenant: &str, err: &RelayError) -> Response {
    if err.is_retryable() {
        // The platform redelivers on failure; let it.
        tracing::warn!("delivery for {} deferred: {err}", crate::config::id_hint(tenant));
        return plain(StatusCode::SERVICE_UNAVAILABLE, "retry later");
    }
    tracing::error!("delivery for {} failed: {err}", crate::config::id_hint(tenant));
    plain(StatusCode::OK, ACK)
}
