//! Error taxonomy shared by providers and the sync coordinator
//!
//! Provider calls return [`ProviderError`]; the coordinator downgrades
//! per-message failures into report entries and only surfaces
//! account-level problems as [`SyncError`].

use std::fmt;

/// Kinds of provider failures worth retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransientKind {
    RateLimited,
    Unavailable,
    Timeout,
    ConnectionReset,
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransientKind::RateLimited => "rate limited",
            TransientKind::Unavailable => "unavailable",
            TransientKind::Timeout => "timeout",
            TransientKind::ConnectionReset => "connection reset",
        };
        f.write_str(name)
    }
}

/// Failure reported by a mail provider
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Credentials are missing, expired or revoked. Never retried.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The stored sync cursor is no longer accepted by the remote.
    #[error("sync checkpoint expired")]
    CheckpointExpired,

    #[error("transient provider error ({kind}): {message}")]
    Transient { kind: TransientKind, message: String },

    /// The message vanished between listing and fetch.
    #[error("message not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("malformed provider response: {0}")]
    Malformed(String),

    #[error("provider configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn transient(kind: TransientKind, message: impl Into<String>) -> Self {
        ProviderError::Transient {
            kind,
            message: message.into(),
        }
    }

    /// Whether a bounded retry may succeed
    pub fn is_retriable(&self) -> bool {
        matches!(self, ProviderError::Transient { .. })
    }
}

/// Account-level failure that aborts a sync run
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("authentication required for {account}: {source}")]
    Auth {
        account: String,
        #[source]
        source: ProviderError,
    },

    #[error("storage failure: {0:#}")]
    Storage(anyhow::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("provider failure for {account}: {source}")]
    Provider {
        account: String,
        #[source]
        source: ProviderError,
    },

    #[error("a sync pass is already running for {0}")]
    AlreadyRunning(String),
}

impl SyncError {
    /// Classify a provider error raised outside per-message handling
    pub fn from_provider(account: &str, error: ProviderError) -> Self {
        match error {
            ProviderError::Auth(_) => SyncError::Auth {
                account: account.to_string(),
                source: error,
            },
            ProviderError::Config(message) => SyncError::Config(message),
            other => SyncError::Provider {
                account: account.to_string(),
                source: other,
            },
        }
    }
}
