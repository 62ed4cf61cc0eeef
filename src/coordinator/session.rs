use crate::{history::CallDirection, signaling::LegId, timer::CallTimer};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Dialing,
    Ringing,
    Connected,
    OnHold,
    Ended,
}

/// One call leg and the coordination flags that used to live as ad-hoc
/// mutable fields on the externally-owned leg object. Keyed by leg id in the
/// coordinator's session table.
#[derive(Debug)]
pub struct CallSession {
    pub leg: LegId,
    /// Server-assigned correlation id. Required to finalize inbound history
    /// records; always None for outbound legs.
    pub correlation_id: Option<String>,
    pub direction: CallDirection,
    pub number: String,
    /// Contact snapshot taken at session start, never re-resolved.
    pub display_name: Option<String>,
    pub state: CallState,
    /// Started on the transition to Connected; duration is meaningless
    /// before connection.
    pub timer: CallTimer,
    /// Set exactly once, on the first terminal event observed for this
    /// session, before the logging dispatch.
    pub logged_once: bool,
    /// Guards against re-arming terminal handling when a session is
    /// re-entered, e.g. revived from hold.
    pub end_handlers_attached: bool,
    /// Set synchronously before requesting disconnection so the device's
    /// asynchronous echo is recognized as already handled.
    pub manual_hangup: bool,
    /// Elapsed time while on hold is not tracked; the display reverts to a
    /// placeholder after resume.
    pub resumed_from_hold: bool,
}

impl CallSession {
    pub fn outbound(leg: LegId, number: String, display_name: Option<String>) -> Self {
        Self {
            leg,
            correlation_id: None,
            direction: CallDirection::Outbound,
            number,
            display_name,
            state: CallState::Dialing,
            timer: CallTimer::new(),
            logged_once: false,
            end_handlers_attached: true,
            manual_hangup: false,
            resumed_from_hold: false,
        }
    }

    pub fn inbound(
        leg: LegId,
        number: String,
        display_name: Option<String>,
        correlation_id: Option<String>,
    ) -> Self {
        Self {
            leg,
            correlation_id,
            direction: CallDirection::Inbound,
            number,
            display_name,
            state: CallState::Ringing,
            timer: CallTimer::new(),
            logged_once: false,
            // armed when the leg is answered or merged
            end_handlers_attached: false,
            manual_hangup: false,
            resumed_from_hold: false,
        }
    }

    /// Check-and-set of the at-most-once logging guard. Returns false when
    /// a terminal event has already been acted upon for this session.
    pub fn mark_logged(&mut self) -> bool {
        if self.logged_once {
            return false;
        }
        self.logged_once = true;
        true
    }

    /// Re-arm terminal handling on re-entry; false if already armed.
    pub fn attach_end_handlers(&mut self) -> bool {
        if self.end_handlers_attached {
            return false;
        }
        self.end_handlers_attached = true;
        true
    }

    pub fn connect(&mut self) {
        self.state = CallState::Connected;
        self.timer.start();
    }

    pub fn display_label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.number)
    }
}

/// A leg merged into the active call. Removed from the set on its own
/// disconnect without touching the primary session.
#[derive(Debug, Clone)]
pub struct ConferenceParticipant {
    pub leg: LegId,
    pub number: String,
    pub name: String,
}
