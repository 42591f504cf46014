//! Paywarden error types.

use thiserror::Error;

/// Errors that can occur while resolving or consuming entitlements.
///
/// The type is `Clone` because a single in-flight resolution hands the same
/// result to every caller that joined it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaywardenError {
    /// Configuration is invalid.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Compact token is not three well-formed dot-separated segments.
    #[error("Malformed token: {0}")]
    MalformedToken(String),

    /// Failed to interpret an entitlement service payload.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Transport error talking to the entitlement service.
    #[error("Entitlement service transport error: {0}")]
    Transport(String),

    /// Storage backend error.
    #[error("Storage I/O error: {0}")]
    StorageIO(String),

    /// UI collaborator failed to present or dismiss a toast.
    #[error("UI error: {0}")]
    Ui(String),
}
