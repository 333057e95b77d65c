use thiserror::Error;

/// The five failure kinds the relay core can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    LockContention,
    Upstream,
    UpstreamUnavailable,
    Retryable,
    OwnershipViolation,
}

#[derive(Error, Debug, Clone)]
pub enum RelayError {
    /// Another holder owns the lease. Expected under concurrency.
    #[error("lock `{name}` is held by another holder")]
    LockContention { name: String },

    /// The vendor answered, but with a non-zero error code.
    #[error("upstream error {code}: {message}")]
    Upstream { code: i64, message: String },

    #[error("upstream unavailable for tenant `{tenant}`: {reason}")]
    UpstreamUnavailable { tenant: String, reason: String },

    #[error("retryable failure: {0}")]
    Retryable(String),

    /// Only ever logged; `unlock` reports it as an outcome instead.
    #[error("lock `{name}` is owned by `{owner}`, release by `{caller}` ignored")]
    OwnershipViolation {
        name: String,
        owner: String,
        caller: String,
    },
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::LockContention { .. } => ErrorKind::LockContention,
            Self::Upstream { .. } => ErrorKind::Upstream,
            Self::UpstreamUnavailable { .. } => ErrorKind::UpstreamUnavailable,
            Self::Retryable(_) => ErrorKind::Retryable,
            Self::OwnershipViolation { .. } => ErrorKind::OwnershipViolation,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::LockContention | ErrorKind::Retryable
        )
    }

    pub(crate) fn store(op: &str, key: &str, err: impl std::fmt::Display) -> Self {
        Self::Retryable(format!("store {op} `{key}` failed: {err}"))
    }

    pub(crate) fn unavailable(tenant: &str, reason: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            tenant: tenant.to_string(),
            reason: reason.into(),
        }
    }
}

pub type RelayResult<T> = std::result::Result<T, RelayError>;
