//! Error types for the key pool.

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors produced by pool construction and key acquisition.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The configured key list was empty.
    #[error("at least one API key must be provided")]
    NoKeys,

    /// Every entry in the configured key list was empty.
    #[error("no valid (non-empty) API keys found")]
    NoValidKeys,

    /// The removal duration was zero.
    #[error("key removal duration must be positive")]
    InvalidRemovalDuration,

    /// Every key in the scope is sidelined and none is due for reactivation.
    #[error("scope '{0}': all keys are temporarily rate limited or failing")]
    AllFailing(String),

    /// The scope has no usable keys for a structural reason.
    #[error("scope '{0}': no keys configured or available")]
    NoneConfigured(String),
}
