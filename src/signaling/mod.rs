use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod simulated;
pub use simulated::SimulatedDevice;

/// Opaque identifier of one call leg, assigned by the signaling device.
pub type LegId = String;

/// Parameters forwarded to the device on an outbound connect. The backend
/// selects the actual caller id; the client only carries the alternate flag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectParams {
    pub to: String,
    #[serde(default)]
    pub alternate_caller_id: bool,
}

/// Lifecycle events emitted by the signaling device. Each leg gets exactly
/// one terminal event (`Disconnected | Canceled | Rejected | Failed`) per the
/// device contract, but consumers must defend against duplicates.
#[derive(Debug, Clone)]
pub enum LegEvent {
    /// Device registration completed, ready to place and receive calls.
    Registered,
    /// Device-level error, not tied to a single leg.
    DeviceError { message: String },
    /// New inbound leg awaiting an answer/reject decision. `correlation_id`
    /// is already normalized, see [`normalize_correlation_id`].
    Incoming {
        leg: LegId,
        from: String,
        correlation_id: Option<String>,
    },
    Ringing { leg: LegId },
    Accepted { leg: LegId },
    Disconnected { leg: LegId },
    Canceled { leg: LegId },
    Rejected { leg: LegId },
    Failed { leg: LegId, reason: String },
}

pub type LegEventSender = tokio::sync::mpsc::UnboundedSender<LegEvent>;
pub type LegEventReceiver = tokio::sync::mpsc::UnboundedReceiver<LegEvent>;

/// Narrow capability interface over the underlying call device. Operations
/// are direct pass-throughs with no retry; retries belong to the device.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SignalingDevice: Send + Sync {
    /// Place an outbound leg. Fails with `DeviceNotReady` when no registered
    /// device exists.
    async fn connect(&self, params: ConnectParams) -> Result<LegId>;
    async fn accept(&self, leg: &LegId) -> Result<()>;
    async fn reject(&self, leg: &LegId) -> Result<()>;
    /// Tear down every live leg on the device.
    async fn disconnect_all(&self) -> Result<()>;
    async fn mute(&self, leg: &LegId, muted: bool) -> Result<()>;
    async fn send_digits(&self, leg: &LegId, digits: &str) -> Result<()>;
    fn is_registered(&self) -> bool;
    /// Replace the credential in place without dropping live legs.
    fn update_token(&self, token: &str) -> Result<()>;
}

/// Single place where the inbound correlation id is resolved. The id carried
/// in custom signaling metadata is the server-assigned one and takes
/// precedence; the leg parameter is the local leg id and only a fallback.
pub fn normalize_correlation_id(
    custom_metadata: Option<String>,
    leg_parameter: Option<String>,
) -> Option<String> {
    custom_metadata
        .filter(|id| !id.is_empty())
        .or_else(|| leg_parameter.filter(|id| !id.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_metadata_takes_precedence() {
        assert_eq!(
            normalize_correlation_id(Some("CA-server".into()), Some("CA-local".into())),
            Some("CA-server".to_string())
        );
    }

    #[test]
    fn falls_back_to_leg_parameter() {
        assert_eq!(
            normalize_correlation_id(None, Some("CA-local".into())),
            Some("CA-local".to_string())
        );
        assert_eq!(
            normalize_correlation_id(Some(String::new()), Some("CA-local".into())),
            Some("CA-local".to_string())
        );
    }

    #[test]
    fn absent_everywhere_stays_absent() {
        assert_eq!(normalize_correlation_id(None, None), None);
        assert_eq!(normalize_correlation_id(Some(String::new()), None), None);
    }
}
