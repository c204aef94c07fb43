//! Error types for message authentication.

/// Errors produced when creating, packing, or verifying credentials.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Credential creation failed.
    #[error("credential create error: {0}")]
    Create(String),

    /// The wire blob is truncated or malformed.
    #[error("credential unpack error: {0}")]
    Unpack(String),

    /// The MAC does not verify under the given secret.
    #[error("credential verify failed")]
    BadMac,

    /// The credential is older than the configured time-to-live.
    #[error("credential expired: age {age}s exceeds ttl {ttl}s")]
    Expired {
        /// Credential age in seconds at verification time.
        age: u64,
        /// Configured time-to-live in seconds.
        ttl: u32,
    },
}
