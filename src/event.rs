use serde::{Deserialize, Serialize};

/// Severity tag carried by every user-visible status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Ready,
    Info,
    Ringing,
    Incoming,
    Connected,
    Warning,
    Error,
}

/// StatusEvent is the single channel through which the core surfaces
/// user-visible conditions to the UI layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub severity: Severity,
    pub message: String,
}

impl StatusEvent {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
        }
    }

    pub fn ready() -> Self {
        Self::new(Severity::Ready, "Ready")
    }
}

/// Type alias for the status sender
pub type StatusSender = tokio::sync::broadcast::Sender<StatusEvent>;

/// Type alias for the status receiver
pub type StatusReceiver = tokio::sync::broadcast::Receiver<StatusEvent>;
