use thiserror::Error;

pub type Result<T> = std::result::Result<T, SoftphoneError>;

/// Failure taxonomy for the softphone core. Device-level errors terminate only
/// the affected session; logging errors never block the UI reset.
#[derive(Debug, Error)]
pub enum SoftphoneError {
    /// No registered signaling device, call attempt aborted.
    #[error("signaling device is not registered")]
    DeviceNotReady,

    /// Adapter-level connect/accept error, session ends with status `failed`.
    #[error("signaling failure: {0}")]
    SignalingFailure(String),

    /// Remote history write failed. Best-effort, not retried.
    #[error("call history write failed: {0}")]
    LoggingFailure(String),

    /// An inbound terminal event without a server correlation id cannot locate
    /// its pre-created history record.
    #[error("inbound call {number} carries no correlation id")]
    CorrelationMissing { number: String },

    /// Persistent, user-visible condition. Manual reload required.
    #[error("credential refresh failed: {0}")]
    CredentialRefreshFailure(String),

    #[error("invalid phone number {0:?}, expected E.164 format")]
    InvalidNumber(String),

    #[error("backend request failed: {0}")]
    Backend(#[from] reqwest::Error),
}
