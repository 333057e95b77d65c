//! Resilience layer for WeChat Official Account gateways.
//!
//! - [`credential`]: per-tenant access token cache with single-flight refresh
//!   across instances, coordinated by [`lock::DistributedMutex`]
//! - [`multipart`]: exact-length `multipart/form-data` bodies for uploads
//! - [`reply`]: at-most-once passive replies for redelivered webhooks
//!
//! [`context::RelayContext`] wires them to a [`store::SharedStore`] and the
//! upstream client; [`gateway`] exposes the webhook over HTTP.

pub mod config;
pub mod context;
pub mod credential;
pub mod error;
pub mod gateway;
pub mod lock;
pub mod multipart;
pub mod observability;
pub mod reply;
pub mod store;
pub mod upstream;
pub mod webhook;

pub use context::RelayContext;
pub use error::{ErrorKind, RelayError, RelayResult};
