use crate::{
    contacts::ContactDirectory,
    error::{Result, SoftphoneError},
    event::{Severity, StatusEvent, StatusSender},
    history::{CallDirection, CallOutcome, CallRecordUpdate, HistoryEntry, HistorySender, NewCallRecord},
    signaling::{ConnectParams, LegEvent, LegEventReceiver, LegId, SignalingDevice},
    timer::{format_elapsed, HOLD_PLACEHOLDER},
};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{select, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod session;
#[cfg(test)]
mod tests;

pub use session::{CallSession, CallState, ConferenceParticipant};

const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(300);

/// Action surface the UI layer drives. Typed commands over a channel instead
/// of callbacks hung off ambient globals.
#[derive(Debug, Clone)]
pub enum Command {
    Dial {
        number: String,
        alternate_caller_id: bool,
    },
    Hangup,
    Answer,
    Reject,
    HoldAndAnswer,
    MergeToConference,
    SendDigits {
        digits: String,
    },
}

pub type CommandSender = tokio::sync::mpsc::UnboundedSender<Command>;
pub type CommandReceiver = tokio::sync::mpsc::UnboundedReceiver<Command>;

/// Cloneable handle for submitting coordinator commands.
#[derive(Clone)]
pub struct CoordinatorHandle {
    sender: CommandSender,
}

impl CoordinatorHandle {
    pub fn dial(&self, number: impl Into<String>, alternate_caller_id: bool) -> Result<()> {
        self.send(Command::Dial {
            number: number.into(),
            alternate_caller_id,
        })
    }

    pub fn hangup(&self) -> Result<()> {
        self.send(Command::Hangup)
    }

    pub fn answer(&self) -> Result<()> {
        self.send(Command::Answer)
    }

    pub fn reject(&self) -> Result<()> {
        self.send(Command::Reject)
    }

    pub fn hold_and_answer(&self) -> Result<()> {
        self.send(Command::HoldAndAnswer)
    }

    pub fn merge_to_conference(&self) -> Result<()> {
        self.send(Command::MergeToConference)
    }

    pub fn send_digits(&self, digits: impl Into<String>) -> Result<()> {
        self.send(Command::SendDigits {
            digits: digits.into(),
        })
    }

    fn send(&self, command: Command) -> Result<()> {
        self.sender
            .send(command)
            .map_err(|_| SoftphoneError::SignalingFailure("coordinator stopped".to_string()))
    }
}

/// Read-only view of the coordinator for display purposes.
#[derive(Debug, Clone, Serialize)]
pub struct UiSnapshot {
    pub state: Option<CallState>,
    pub call_with: Option<String>,
    pub timer: String,
    pub conference: Vec<String>,
    pub has_incoming: bool,
    pub has_held: bool,
}

pub struct CoordinatorBuilder {
    device: Arc<dyn SignalingDevice>,
    events: LegEventReceiver,
    contacts: Arc<ContactDirectory>,
    history_sender: HistorySender,
    status_sender: StatusSender,
    cancel_token: Option<CancellationToken>,
    settle_delay: Option<Duration>,
}

impl CoordinatorBuilder {
    pub fn new(
        device: Arc<dyn SignalingDevice>,
        events: LegEventReceiver,
        contacts: Arc<ContactDirectory>,
        history_sender: HistorySender,
        status_sender: StatusSender,
    ) -> Self {
        Self {
            device,
            events,
            contacts,
            history_sender,
            status_sender,
            cancel_token: None,
            settle_delay: None,
        }
    }

    pub fn with_cancel_token(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = Some(cancel_token);
        self
    }

    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = Some(settle_delay);
        self
    }

    pub fn build(self) -> (CoordinatorHandle, Coordinator) {
        let (sender, commands) = tokio::sync::mpsc::unbounded_channel();
        (
            CoordinatorHandle { sender },
            Coordinator {
                device: self.device,
                contacts: self.contacts,
                history_sender: self.history_sender,
                status_sender: self.status_sender,
                cancel_token: self.cancel_token.unwrap_or_default(),
                settle_delay: self.settle_delay.unwrap_or(DEFAULT_SETTLE_DELAY),
                events: self.events,
                commands,
                sessions: HashMap::new(),
                active: None,
                held: None,
                incoming: None,
                conference: Vec::new(),
            },
        )
    }
}

/// Owns the session table and the active/held/incoming/conference slots, and
/// guarantees at most one history dispatch per session. All state transitions
/// run on this one event loop; device events and UI commands interleave but
/// every guard is checked-and-set before the first await of its handler.
pub struct Coordinator {
    device: Arc<dyn SignalingDevice>,
    contacts: Arc<ContactDirectory>,
    history_sender: HistorySender,
    status_sender: StatusSender,
    cancel_token: CancellationToken,
    settle_delay: Duration,
    events: LegEventReceiver,
    commands: CommandReceiver,
    sessions: HashMap<LegId, CallSession>,
    active: Option<LegId>,
    held: Option<LegId>,
    incoming: Option<LegId>,
    conference: Vec<ConferenceParticipant>,
}

impl Coordinator {
    pub async fn serve(&mut self) {
        info!("coordinator started");
        loop {
            select! {
                _ = self.cancel_token.cancelled() => {
                    info!("coordinator cancelled");
                    break;
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        info!("signaling event channel closed");
                        break;
                    }
                },
            }
        }
    }

    pub fn snapshot(&self) -> UiSnapshot {
        let active = self.active.as_ref().and_then(|leg| self.sessions.get(leg));
        let call_with = if !self.conference.is_empty() {
            Some("Conference".to_string())
        } else {
            active.map(|s| s.display_label().to_string())
        };
        let timer = match active {
            Some(s) if s.resumed_from_hold => HOLD_PLACEHOLDER.to_string(),
            Some(s) => format_elapsed(s.timer.elapsed_secs()),
            None => format_elapsed(0),
        };
        UiSnapshot {
            state: active.map(|s| s.state),
            call_with,
            timer,
            conference: self.conference.iter().map(|p| p.name.clone()).collect(),
            has_incoming: self.incoming.is_some(),
            has_held: self.held.is_some(),
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Dial {
                number,
                alternate_caller_id,
            } => self.do_dial(number, alternate_caller_id).await,
            Command::Hangup => self.do_hangup().await,
            Command::Answer => self.do_answer().await,
            Command::Reject => self.do_reject().await,
            Command::HoldAndAnswer => self.do_hold_and_answer().await,
            Command::MergeToConference => self.do_merge_to_conference().await,
            Command::SendDigits { digits } => self.do_send_digits(digits).await,
        }
    }

    async fn handle_event(&mut self, event: LegEvent) {
        match event {
            LegEvent::Registered => {
                info!("device registered");
                self.status(StatusEvent::ready());
            }
            LegEvent::DeviceError { message } => {
                error!("device error: {}", message);
                self.status(StatusEvent::new(
                    Severity::Error,
                    format!("Error: {}", message),
                ));
            }
            LegEvent::Incoming {
                leg,
                from,
                correlation_id,
            } => self.on_incoming(leg, from, correlation_id).await,
            LegEvent::Ringing { leg } => self.on_ringing(&leg),
            LegEvent::Accepted { leg } => self.on_accepted(&leg),
            LegEvent::Disconnected { leg } => {
                self.process_terminal(&leg, CallOutcome::Completed).await
            }
            LegEvent::Canceled { leg } => self.process_terminal(&leg, CallOutcome::Canceled).await,
            LegEvent::Rejected { leg } => self.process_terminal(&leg, CallOutcome::Rejected).await,
            LegEvent::Failed { leg, reason } => {
                warn!(%leg, "leg failed: {}", reason);
                self.process_terminal(&leg, CallOutcome::Failed).await
            }
        }
    }

    async fn do_dial(&mut self, number: String, alternate_caller_id: bool) {
        if let Err(e) = validate_e164(&number) {
            warn!("rejected dial: {}", e);
            self.status(StatusEvent::new(Severity::Error, format!("{}", e)));
            return;
        }
        if !self.device.is_registered() {
            let e = SoftphoneError::DeviceNotReady;
            warn!("rejected dial: {}", e);
            self.status(StatusEvent::new(Severity::Error, "Device not ready"));
            return;
        }
        if self.active.is_some() {
            warn!("dial ignored, a call is already active");
            return;
        }
        let params = ConnectParams {
            to: number.clone(),
            alternate_caller_id,
        };
        match self.device.connect(params).await {
            Ok(leg) => {
                let name = self.contacts.name_for(&number);
                let session = CallSession::outbound(leg.clone(), number, name);
                self.status(StatusEvent::new(
                    Severity::Info,
                    format!("Calling {}", session.display_label()),
                ));
                info!(%leg, number = %session.number, "outbound leg created");
                self.sessions.insert(leg.clone(), session);
                self.active = Some(leg);
            }
            Err(e) => {
                error!("connect failed: {}", e);
                self.status(StatusEvent::new(
                    Severity::Error,
                    format!("Call failed: {}", e),
                ));
            }
        }
    }

    /// Manual hangup. The logging guard is set synchronously before the
    /// disconnect request goes out, so the device's asynchronous Disconnected
    /// echo finds the session already gone.
    async fn do_hangup(&mut self) {
        let Some(leg) = self.active.clone() else {
            debug!("hangup with no active call");
            return;
        };
        match self.sessions.get_mut(&leg) {
            Some(session) if !session.logged_once => {
                session.manual_hangup = true;
            }
            _ => {
                debug!(%leg, "hangup on an already-ended session");
                return;
            }
        }
        self.finalize_and_log(&leg, CallOutcome::Completed);
        if let Err(e) = self.device.disconnect_all().await {
            error!("disconnect failed: {}", e);
        }
        self.after_terminal().await;
    }

    /// Answer the pending inbound leg. With an occupied active slot this is
    /// the answer-replacing policy: tear the active call down, wait out the
    /// settle delay, then accept. The device gives no teardown-complete
    /// signal, so the delay is a fixed window.
    async fn do_answer(&mut self) {
        let Some(leg) = self.incoming.clone() else {
            debug!("answer with no incoming call");
            return;
        };
        if self.active.is_some() {
            if let Err(e) = self.device.disconnect_all().await {
                error!("disconnect before answer failed: {}", e);
            }
            // The old leg leaves the slot now; its Disconnected echo still
            // logs it through the terminal path.
            self.active = None;
            sleep(self.settle_delay).await;
        }
        self.promote_incoming(&leg).await;
    }

    async fn do_reject(&mut self) {
        let Some(leg) = self.incoming.clone() else {
            debug!("reject with no incoming call");
            return;
        };
        if let Err(e) = self.device.reject(&leg).await {
            error!(%leg, "reject failed: {}", e);
        }
        // the device's Rejected echo drives logging and slot cleanup
    }

    /// Hold-and-answer: mute and flag the active session, then promote the
    /// inbound leg. The held leg is not disconnected.
    async fn do_hold_and_answer(&mut self) {
        let Some(incoming_leg) = self.incoming.clone() else {
            debug!("hold-and-answer with no incoming call");
            return;
        };
        let Some(active_leg) = self.active.take() else {
            debug!("hold-and-answer without an active call, answering directly");
            self.promote_incoming(&incoming_leg).await;
            return;
        };
        if let Some(session) = self.sessions.get_mut(&active_leg) {
            session.state = CallState::OnHold;
        }
        if let Err(e) = self.device.mute(&active_leg, true).await {
            error!(%active_leg, "mute failed: {}", e);
        }
        info!(%active_leg, %incoming_leg, "holding active call to answer");
        self.held = Some(active_leg);
        self.promote_incoming(&incoming_leg).await;
    }

    /// Merge-to-conference: accept the new leg without disconnecting or
    /// holding the active one. Each leg stays subject to its own terminal
    /// events.
    async fn do_merge_to_conference(&mut self) {
        let Some(incoming_leg) = self.incoming.clone() else {
            debug!("merge with no incoming call");
            return;
        };
        if self.active.is_none() {
            debug!("merge without an active call, answering directly");
            self.promote_incoming(&incoming_leg).await;
            return;
        }
        match self.device.accept(&incoming_leg).await {
            Ok(()) => {
                self.incoming = None;
                if let Some(session) = self.sessions.get_mut(&incoming_leg) {
                    session.attach_end_handlers();
                    self.conference.push(ConferenceParticipant {
                        leg: incoming_leg.clone(),
                        number: session.number.clone(),
                        name: session.display_label().to_string(),
                    });
                }
                info!(%incoming_leg, participants = self.conference.len(), "merged into conference");
                self.status(StatusEvent::new(Severity::Connected, "Conference"));
            }
            Err(e) => {
                error!(%incoming_leg, "accept failed: {}", e);
                self.process_terminal(&incoming_leg, CallOutcome::Failed)
                    .await;
            }
        }
    }

    async fn do_send_digits(&mut self, digits: String) {
        // no-op unless a session is connected
        let Some(leg) = self.active.clone() else {
            return;
        };
        match self.sessions.get(&leg) {
            Some(session) if session.state == CallState::Connected => {
                if let Err(e) = self.device.send_digits(&leg, &digits).await {
                    error!(%leg, "dtmf failed: {}", e);
                }
            }
            _ => debug!(%leg, "dtmf ignored, session not connected"),
        }
    }

    async fn on_incoming(&mut self, leg: LegId, from: String, correlation_id: Option<String>) {
        if self.incoming.is_some() {
            warn!(%leg, "second incoming leg while one is pending, rejecting");
            self.device.reject(&leg).await.ok();
            return;
        }
        if correlation_id.is_none() {
            // logged now so the eventual terminal event's hard failure is
            // no surprise
            warn!(%leg, %from, "inbound leg carries no correlation id");
        }
        let name = self.contacts.name_for(&from);
        let session = CallSession::inbound(leg.clone(), from, name, correlation_id);
        let message = if self.active.is_some() {
            format!("Call waiting: {}", session.display_label())
        } else {
            format!("Incoming call from {}", session.display_label())
        };
        info!(%leg, number = %session.number, "inbound leg created");
        self.sessions.insert(leg.clone(), session);
        self.incoming = Some(leg);
        self.status(StatusEvent::new(Severity::Incoming, message));
    }

    fn on_ringing(&mut self, leg: &LegId) {
        let Some(session) = self.sessions.get_mut(leg) else {
            debug!(%leg, "ringing for unknown leg");
            return;
        };
        if session.state == CallState::Dialing {
            session.state = CallState::Ringing;
            self.status(StatusEvent::new(Severity::Ringing, "Ringing..."));
        }
    }

    fn on_accepted(&mut self, leg: &LegId) {
        let Some(session) = self.sessions.get_mut(leg) else {
            debug!(%leg, "accepted for unknown leg");
            return;
        };
        if !matches!(session.state, CallState::Dialing | CallState::Ringing) {
            // A duplicate echo, or one for a held leg, must not restart the
            // timer or pull the session off hold.
            debug!(%leg, state = ?session.state, "accepted ignored in current state");
            return;
        }
        session.connect();
        info!(%leg, "leg connected");
        let message = if self.held.is_some() {
            "Connected (call on hold)"
        } else {
            "Connected"
        };
        self.status(StatusEvent::new(Severity::Connected, message));
    }

    /// Accept the pending inbound leg and make it the active session.
    async fn promote_incoming(&mut self, leg: &LegId) {
        match self.device.accept(leg).await {
            Ok(()) => {
                self.incoming = None;
                self.active = Some(leg.clone());
                if let Some(session) = self.sessions.get_mut(leg) {
                    if !session.attach_end_handlers() {
                        debug!(%leg, "end handlers already attached");
                    }
                }
                // state flips to Connected on the device's Accepted echo
            }
            Err(e) => {
                error!(%leg, "accept failed: {}", e);
                self.status(StatusEvent::new(
                    Severity::Error,
                    format!("Call failed: {}", e),
                ));
                self.process_terminal(leg, CallOutcome::Failed).await;
            }
        }
    }

    /// Single entry point for every terminal event. Handlers can fire more
    /// than once for the same logical source; the first one wins via the
    /// session's logging guard, checked-and-set before any asynchronous
    /// follow-up.
    async fn process_terminal(&mut self, leg: &LegId, outcome: CallOutcome) {
        if !self.sessions.contains_key(leg) {
            debug!(%leg, "terminal event for unknown or already-ended leg");
            return;
        }
        if self.finalize_and_log(leg, outcome) {
            self.after_terminal().await;
        }
    }

    /// Set the logging guard, stop the timer, drop the session from the
    /// table and every slot, and dispatch exactly one history entry. Returns
    /// false when the session was already finalized.
    fn finalize_and_log(&mut self, leg: &LegId, outcome: CallOutcome) -> bool {
        let Some(mut session) = self.sessions.remove(leg) else {
            return false;
        };
        if !session.mark_logged() {
            return false;
        }
        // A caller-canceled inbound leg that never connected was missed.
        let outcome = if outcome == CallOutcome::Canceled
            && session.direction == CallDirection::Inbound
            && session.state == CallState::Ringing
        {
            CallOutcome::Missed
        } else {
            outcome
        };
        let duration = session.timer.stop();
        session.state = CallState::Ended;
        if self.active.as_ref() == Some(leg) {
            self.active = None;
            // The conference dissolves with its primary leg. Participant
            // sessions stay in the table so their own terminal echoes still
            // log them.
            if !self.conference.is_empty() {
                debug!(
                    participants = self.conference.len(),
                    "conference dissolved with primary leg"
                );
                self.conference.clear();
            }
        }
        if self.held.as_ref() == Some(leg) {
            self.held = None;
        }
        if self.incoming.as_ref() == Some(leg) {
            self.incoming = None;
        }
        self.conference.retain(|p| &p.leg != leg);
        info!(
            %leg,
            number = %session.number,
            status = outcome.as_str(),
            duration,
            manual = session.manual_hangup,
            "session ended"
        );
        self.dispatch_history(&session, outcome, duration);
        true
    }

    fn dispatch_history(&mut self, session: &CallSession, outcome: CallOutcome, duration: u64) {
        let entry = match session.direction {
            CallDirection::Outbound => HistoryEntry::Outbound(NewCallRecord {
                number: session.number.clone(),
                name: session.display_name.clone(),
                direction: CallDirection::Outbound,
                status: outcome,
                duration,
            }),
            CallDirection::Inbound => match &session.correlation_id {
                Some(call_sid) => HistoryEntry::Inbound(CallRecordUpdate {
                    call_sid: call_sid.clone(),
                    status: outcome,
                    duration,
                }),
                None => {
                    // Hard logging failure: without the server correlation id
                    // the record cannot be located, and creating one would
                    // duplicate it. The UI reset is not blocked.
                    let e = SoftphoneError::CorrelationMissing {
                        number: session.number.clone(),
                    };
                    error!("{}", e);
                    self.status(StatusEvent::new(Severity::Error, format!("{}", e)));
                    return;
                }
            },
        };
        if self.history_sender.send(entry).is_err() {
            error!("history logger is gone, call record lost");
        }
    }

    /// Post-terminal bookkeeping: when the active slot empties and a held
    /// session survives, it is un-muted and promoted back; otherwise, once
    /// nothing is left, the UI resets to Ready.
    async fn after_terminal(&mut self) {
        if self.active.is_some() {
            return;
        }
        if let Some(held_leg) = self.held.take() {
            let resumable = match self.sessions.get_mut(&held_leg) {
                Some(session) if session.state != CallState::Ended => {
                    session.state = CallState::Connected;
                    session.resumed_from_hold = true;
                    if !session.attach_end_handlers() {
                        debug!(%held_leg, "end handlers already attached");
                    }
                    true
                }
                _ => false,
            };
            if resumable {
                if let Err(e) = self.device.mute(&held_leg, false).await {
                    error!(%held_leg, "unmute failed: {}", e);
                }
                info!(%held_leg, "resumed held call");
                self.active = Some(held_leg);
                self.status(StatusEvent::new(Severity::Connected, "Resumed from hold"));
                return;
            }
        }
        if self.incoming.is_none() && self.conference.is_empty() {
            self.status(StatusEvent::ready());
        }
    }

    fn status(&self, event: StatusEvent) {
        self.status_sender.send(event).ok();
    }
}

/// E.164: a leading `+` followed by digits only.
pub fn validate_e164(number: &str) -> Result<()> {
    let digits = match number.strip_prefix('+') {
        Some(digits) => digits,
        None => return Err(SoftphoneError::InvalidNumber(number.to_string())),
    };
    if digits.is_empty() || digits.len() > 15 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SoftphoneError::InvalidNumber(number.to_string()));
    }
    Ok(())
}
