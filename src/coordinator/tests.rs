use super::*;
use crate::{
    backend::BackendClient,
    contacts::ContactDirectory,
    event::StatusReceiver,
    history::HistoryReceiver,
    signaling::MockSignalingDevice,
};
use async_trait::async_trait;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Mutex,
};

#[derive(Debug, Clone, PartialEq)]
enum Op {
    Connect(String),
    Accept(LegId),
    Reject(LegId),
    DisconnectAll,
    Mute(LegId, bool),
    SendDigits(LegId, String),
}

/// Always-succeeding device that records every operation in order.
struct RecordingDevice {
    ops: Mutex<Vec<Op>>,
    registered: AtomicBool,
    next_leg: AtomicU32,
}

impl RecordingDevice {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            ops: Mutex::new(Vec::new()),
            registered: AtomicBool::new(true),
            next_leg: AtomicU32::new(0),
        })
    }

    fn ops(&self) -> Vec<Op> {
        self.ops.lock().unwrap().clone()
    }
}

#[async_trait]
impl SignalingDevice for RecordingDevice {
    async fn connect(&self, params: ConnectParams) -> Result<LegId> {
        self.ops.lock().unwrap().push(Op::Connect(params.to));
        let n = self.next_leg.fetch_add(1, Ordering::SeqCst);
        Ok(format!("leg-{}", n))
    }

    async fn accept(&self, leg: &LegId) -> Result<()> {
        self.ops.lock().unwrap().push(Op::Accept(leg.clone()));
        Ok(())
    }

    async fn reject(&self, leg: &LegId) -> Result<()> {
        self.ops.lock().unwrap().push(Op::Reject(leg.clone()));
        Ok(())
    }

    async fn disconnect_all(&self) -> Result<()> {
        self.ops.lock().unwrap().push(Op::DisconnectAll);
        Ok(())
    }

    async fn mute(&self, leg: &LegId, muted: bool) -> Result<()> {
        self.ops.lock().unwrap().push(Op::Mute(leg.clone(), muted));
        Ok(())
    }

    async fn send_digits(&self, leg: &LegId, digits: &str) -> Result<()> {
        self.ops
            .lock()
            .unwrap()
            .push(Op::SendDigits(leg.clone(), digits.to_string()));
        Ok(())
    }

    fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    fn update_token(&self, _token: &str) -> Result<()> {
        Ok(())
    }
}

struct TestBed {
    coordinator: Coordinator,
    device: Arc<RecordingDevice>,
    history_rx: HistoryReceiver,
    status_rx: StatusReceiver,
}

impl TestBed {
    fn new() -> Self {
        let device = RecordingDevice::new();
        let backend = Arc::new(BackendClient::new("http://127.0.0.1:5000").unwrap());
        let contacts = Arc::new(ContactDirectory::new(backend));
        contacts.prime(HashMap::from([(
            "+15551234567".to_string(),
            "Alice".to_string(),
        )]));
        let (history_tx, history_rx) = tokio::sync::mpsc::unbounded_channel();
        let (status_tx, status_rx) = tokio::sync::broadcast::channel(64);
        let (_leg_tx, leg_rx) = tokio::sync::mpsc::unbounded_channel();
        let (_handle, coordinator) = CoordinatorBuilder::new(
            device.clone(),
            leg_rx,
            contacts,
            history_tx,
            status_tx,
        )
        .with_settle_delay(Duration::from_millis(1))
        .build();
        Self {
            coordinator,
            device,
            history_rx,
            status_rx,
        }
    }

    async fn dial(&mut self, number: &str) {
        self.coordinator
            .handle_command(Command::Dial {
                number: number.to_string(),
                alternate_caller_id: false,
            })
            .await;
    }

    async fn command(&mut self, command: Command) {
        self.coordinator.handle_command(command).await;
    }

    async fn event(&mut self, event: LegEvent) {
        self.coordinator.handle_event(event).await;
    }

    async fn incoming(&mut self, leg: &str, from: &str, correlation_id: Option<&str>) {
        self.event(LegEvent::Incoming {
            leg: leg.to_string(),
            from: from.to_string(),
            correlation_id: correlation_id.map(str::to_string),
        })
        .await;
    }

    fn active_leg(&self) -> LegId {
        self.coordinator.active.clone().expect("active leg")
    }

    fn drain_history(&mut self) -> Vec<HistoryEntry> {
        let mut entries = Vec::new();
        while let Ok(entry) = self.history_rx.try_recv() {
            entries.push(entry);
        }
        entries
    }

    fn drain_status(&mut self) -> Vec<StatusEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.status_rx.try_recv() {
            events.push(event);
        }
        events
    }
}

fn expect_outbound(entry: &HistoryEntry) -> &NewCallRecord {
    match entry {
        HistoryEntry::Outbound(record) => record,
        other => panic!("expected outbound entry, got {:?}", other),
    }
}

fn expect_inbound(entry: &HistoryEntry) -> &CallRecordUpdate {
    match entry {
        HistoryEntry::Inbound(update) => update,
        other => panic!("expected inbound entry, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn outbound_call_logs_completed_with_elapsed_duration() {
    let mut t = TestBed::new();
    t.dial("+15551234567").await;
    let leg = t.active_leg();
    assert_eq!(t.device.ops(), vec![Op::Connect("+15551234567".to_string())]);

    t.event(LegEvent::Ringing { leg: leg.clone() }).await;
    assert_eq!(t.coordinator.snapshot().state, Some(CallState::Ringing));

    t.event(LegEvent::Accepted { leg: leg.clone() }).await;
    let snapshot = t.coordinator.snapshot();
    assert_eq!(snapshot.state, Some(CallState::Connected));
    assert_eq!(snapshot.timer, "00:00");
    assert_eq!(snapshot.call_with.as_deref(), Some("Alice"));

    tokio::time::advance(Duration::from_secs(42)).await;
    t.event(LegEvent::Disconnected { leg }).await;

    let entries = t.drain_history();
    assert_eq!(entries.len(), 1);
    let record = expect_outbound(&entries[0]);
    assert_eq!(record.number, "+15551234567");
    assert_eq!(record.name.as_deref(), Some("Alice"));
    assert_eq!(record.status, CallOutcome::Completed);
    assert_eq!(record.duration, 42);
    assert!(t.coordinator.snapshot().state.is_none());
}

#[tokio::test(start_paused = true)]
async fn duplicate_terminal_events_log_exactly_once() {
    let mut t = TestBed::new();
    t.incoming("in-1", "+15559876543", Some("CA1234")).await;
    t.command(Command::Answer).await;
    t.event(LegEvent::Accepted {
        leg: "in-1".to_string(),
    })
    .await;
    tokio::time::advance(Duration::from_secs(10)).await;

    // both terminal events fire for the same leg
    t.event(LegEvent::Failed {
        leg: "in-1".to_string(),
        reason: "transport lost".to_string(),
    })
    .await;
    t.event(LegEvent::Disconnected {
        leg: "in-1".to_string(),
    })
    .await;

    let entries = t.drain_history();
    assert_eq!(entries.len(), 1);
    let update = expect_inbound(&entries[0]);
    assert_eq!(update.call_sid, "CA1234");
    assert_eq!(update.status, CallOutcome::Failed);
    assert_eq!(update.duration, 10);
}

#[tokio::test(start_paused = true)]
async fn inbound_without_correlation_id_never_creates_a_record() {
    let mut t = TestBed::new();
    t.incoming("in-1", "+15559876543", None).await;
    t.command(Command::Answer).await;
    t.event(LegEvent::Accepted {
        leg: "in-1".to_string(),
    })
    .await;
    t.event(LegEvent::Disconnected {
        leg: "in-1".to_string(),
    })
    .await;

    assert!(t.drain_history().is_empty());
    assert!(t
        .drain_status()
        .iter()
        .any(|e| e.severity == Severity::Error && e.message.contains("correlation")));
    // the hard logging failure still does not block the UI reset
    assert!(t.coordinator.snapshot().state.is_none());
}

#[tokio::test(start_paused = true)]
async fn hold_and_answer_resumes_surviving_held_call() {
    let mut t = TestBed::new();
    t.dial("+15551234567").await;
    let held = t.active_leg();
    t.event(LegEvent::Accepted { leg: held.clone() }).await;

    t.incoming("in-b", "+15559876543", Some("CA-B")).await;
    t.command(Command::HoldAndAnswer).await;
    assert!(t.device.ops().contains(&Op::Mute(held.clone(), true)));
    assert!(t.device.ops().contains(&Op::Accept("in-b".to_string())));
    assert!(t.coordinator.snapshot().has_held);

    t.event(LegEvent::Accepted {
        leg: "in-b".to_string(),
    })
    .await;
    tokio::time::advance(Duration::from_secs(5)).await;
    t.event(LegEvent::Disconnected {
        leg: "in-b".to_string(),
    })
    .await;

    let entries = t.drain_history();
    assert_eq!(entries.len(), 1);
    let update = expect_inbound(&entries[0]);
    assert_eq!(update.call_sid, "CA-B");
    assert_eq!(update.status, CallOutcome::Completed);
    assert_eq!(update.duration, 5);

    let snapshot = t.coordinator.snapshot();
    assert_eq!(snapshot.state, Some(CallState::Connected));
    assert_eq!(snapshot.call_with.as_deref(), Some("Alice"));
    assert!(!snapshot.has_held);
    // hold time is not billable, the display reverts to a placeholder
    assert_eq!(snapshot.timer, "--:--");
    assert!(t.device.ops().contains(&Op::Mute(held, false)));
}

#[tokio::test(start_paused = true)]
async fn held_call_that_ended_on_its_own_is_not_resumed() {
    let mut t = TestBed::new();
    t.dial("+15551234567").await;
    let held = t.active_leg();
    t.event(LegEvent::Accepted { leg: held.clone() }).await;
    tokio::time::advance(Duration::from_secs(3)).await;

    t.incoming("in-b", "+15559876543", Some("CA-B")).await;
    t.command(Command::HoldAndAnswer).await;
    t.event(LegEvent::Accepted {
        leg: "in-b".to_string(),
    })
    .await;

    // the held leg ends remotely while the newer call is up
    t.event(LegEvent::Disconnected { leg: held.clone() }).await;
    let entries = t.drain_history();
    assert_eq!(entries.len(), 1);
    assert_eq!(expect_outbound(&entries[0]).status, CallOutcome::Completed);
    // the newer call is untouched
    assert_eq!(t.coordinator.snapshot().state, Some(CallState::Connected));

    t.event(LegEvent::Disconnected {
        leg: "in-b".to_string(),
    })
    .await;
    assert_eq!(t.drain_history().len(), 1);
    let snapshot = t.coordinator.snapshot();
    assert!(snapshot.state.is_none());
    assert!(!snapshot.has_held);
    assert_eq!(
        t.drain_status().last().map(|e| e.severity),
        Some(Severity::Ready)
    );
}

#[tokio::test(start_paused = true)]
async fn conference_participant_leaving_does_not_touch_primary() {
    let mut t = TestBed::new();
    t.dial("+15551234567").await;
    let primary = t.active_leg();
    t.event(LegEvent::Accepted {
        leg: primary.clone(),
    })
    .await;

    t.incoming("in-b", "+15559876543", Some("CA-B")).await;
    t.command(Command::MergeToConference).await;
    t.event(LegEvent::Accepted {
        leg: "in-b".to_string(),
    })
    .await;

    let snapshot = t.coordinator.snapshot();
    assert_eq!(snapshot.call_with.as_deref(), Some("Conference"));
    assert_eq!(snapshot.conference, vec!["+15559876543".to_string()]);

    tokio::time::advance(Duration::from_secs(7)).await;
    t.event(LegEvent::Disconnected {
        leg: "in-b".to_string(),
    })
    .await;

    let entries = t.drain_history();
    assert_eq!(entries.len(), 1);
    let update = expect_inbound(&entries[0]);
    assert_eq!(update.call_sid, "CA-B");
    assert_eq!(update.duration, 7);

    let snapshot = t.coordinator.snapshot();
    assert!(snapshot.conference.is_empty());
    assert_eq!(snapshot.state, Some(CallState::Connected));
    assert_eq!(t.coordinator.active.as_ref(), Some(&primary));
}

#[tokio::test(start_paused = true)]
async fn conference_dissolves_when_the_primary_leg_ends() {
    let mut t = TestBed::new();
    t.dial("+15551234567").await;
    let primary = t.active_leg();
    t.event(LegEvent::Accepted {
        leg: primary.clone(),
    })
    .await;

    t.incoming("in-b", "+15559876543", Some("CA-B")).await;
    t.command(Command::MergeToConference).await;
    t.event(LegEvent::Accepted {
        leg: "in-b".to_string(),
    })
    .await;
    tokio::time::advance(Duration::from_secs(4)).await;

    t.event(LegEvent::Disconnected { leg: primary }).await;
    let snapshot = t.coordinator.snapshot();
    assert!(snapshot.conference.is_empty());
    assert!(snapshot.state.is_none());
    assert_eq!(snapshot.call_with, None);
    let entries = t.drain_history();
    assert_eq!(entries.len(), 1);
    assert_eq!(expect_outbound(&entries[0]).duration, 4);
    assert_eq!(
        t.drain_status().last().map(|e| e.severity),
        Some(Severity::Ready)
    );

    // the participant's own echo still logs it
    t.event(LegEvent::Disconnected {
        leg: "in-b".to_string(),
    })
    .await;
    let entries = t.drain_history();
    assert_eq!(entries.len(), 1);
    assert_eq!(expect_inbound(&entries[0]).call_sid, "CA-B");
}

#[tokio::test(start_paused = true)]
async fn duplicate_accepted_does_not_restart_the_timer() {
    let mut t = TestBed::new();
    t.dial("+15551234567").await;
    let leg = t.active_leg();
    t.event(LegEvent::Accepted { leg: leg.clone() }).await;
    tokio::time::advance(Duration::from_secs(6)).await;

    t.event(LegEvent::Accepted { leg: leg.clone() }).await;
    assert_eq!(t.coordinator.snapshot().timer, "00:06");

    t.event(LegEvent::Disconnected { leg }).await;
    let entries = t.drain_history();
    assert_eq!(expect_outbound(&entries[0]).duration, 6);
}

#[tokio::test(start_paused = true)]
async fn stray_accepted_for_a_held_leg_keeps_it_on_hold() {
    let mut t = TestBed::new();
    t.dial("+15551234567").await;
    let held = t.active_leg();
    t.event(LegEvent::Accepted { leg: held.clone() }).await;

    t.incoming("in-b", "+15559876543", Some("CA-B")).await;
    t.command(Command::HoldAndAnswer).await;
    t.event(LegEvent::Accepted {
        leg: "in-b".to_string(),
    })
    .await;

    t.event(LegEvent::Accepted { leg: held.clone() }).await;
    assert!(t.coordinator.snapshot().has_held);
    assert_eq!(
        t.coordinator.sessions.get(&held).map(|s| s.state),
        Some(CallState::OnHold)
    );
    // no unmute was issued for the held leg
    assert!(!t.device.ops().contains(&Op::Mute(held, false)));
}

#[tokio::test(start_paused = true)]
async fn manual_hangup_is_idempotent_against_the_disconnect_echo() {
    let mut t = TestBed::new();
    t.dial("+15551234567").await;
    let leg = t.active_leg();
    t.event(LegEvent::Accepted { leg: leg.clone() }).await;
    tokio::time::advance(Duration::from_secs(3)).await;

    t.command(Command::Hangup).await;
    assert!(t.device.ops().contains(&Op::DisconnectAll));
    let entries = t.drain_history();
    assert_eq!(entries.len(), 1);
    let record = expect_outbound(&entries[0]);
    assert_eq!(record.status, CallOutcome::Completed);
    assert_eq!(record.duration, 3);

    // the device's asynchronous echo arrives after the manual hangup
    t.event(LegEvent::Disconnected { leg }).await;
    assert!(t.drain_history().is_empty());

    // a second hangup is a no-op
    t.command(Command::Hangup).await;
    assert!(t.drain_history().is_empty());
}

#[tokio::test(start_paused = true)]
async fn caller_canceled_unanswered_inbound_logs_missed() {
    let mut t = TestBed::new();
    t.incoming("in-1", "+15559876543", Some("CA9")).await;
    assert!(t.coordinator.snapshot().has_incoming);

    t.event(LegEvent::Canceled {
        leg: "in-1".to_string(),
    })
    .await;

    let entries = t.drain_history();
    assert_eq!(entries.len(), 1);
    let update = expect_inbound(&entries[0]);
    assert_eq!(update.status, CallOutcome::Missed);
    assert_eq!(update.duration, 0);
    assert!(!t.coordinator.snapshot().has_incoming);
}

#[tokio::test(start_paused = true)]
async fn user_rejected_inbound_logs_rejected() {
    let mut t = TestBed::new();
    t.incoming("in-1", "+15559876543", Some("CA9")).await;
    t.command(Command::Reject).await;
    assert!(t.device.ops().contains(&Op::Reject("in-1".to_string())));

    t.event(LegEvent::Rejected {
        leg: "in-1".to_string(),
    })
    .await;

    let entries = t.drain_history();
    assert_eq!(entries.len(), 1);
    let update = expect_inbound(&entries[0]);
    assert_eq!(update.status, CallOutcome::Rejected);
    assert_eq!(update.duration, 0);
}

#[tokio::test(start_paused = true)]
async fn answer_replacing_disconnects_before_accepting() {
    let mut t = TestBed::new();
    t.dial("+15551234567").await;
    let old = t.active_leg();
    t.event(LegEvent::Accepted { leg: old.clone() }).await;
    tokio::time::advance(Duration::from_secs(2)).await;

    t.incoming("in-b", "+15559876543", Some("CA-B")).await;
    t.command(Command::Answer).await;

    let ops = t.device.ops();
    let disconnect_at = ops.iter().position(|op| *op == Op::DisconnectAll).unwrap();
    let accept_at = ops
        .iter()
        .position(|op| *op == Op::Accept("in-b".to_string()))
        .unwrap();
    assert!(disconnect_at < accept_at);

    // the old leg's echo still logs it through the terminal path
    t.event(LegEvent::Disconnected { leg: old }).await;
    let entries = t.drain_history();
    assert_eq!(entries.len(), 1);
    let record = expect_outbound(&entries[0]);
    assert_eq!(record.status, CallOutcome::Completed);
    assert_eq!(record.duration, 2);

    t.event(LegEvent::Accepted {
        leg: "in-b".to_string(),
    })
    .await;
    let snapshot = t.coordinator.snapshot();
    assert_eq!(snapshot.state, Some(CallState::Connected));
    assert_eq!(t.coordinator.active.as_deref(), Some("in-b"));
}

#[tokio::test]
async fn invalid_number_is_rejected_before_the_device() {
    let mut t = TestBed::new();
    t.dial("12345").await;
    assert!(t.device.ops().is_empty());
    assert!(t
        .drain_status()
        .iter()
        .any(|e| e.severity == Severity::Error));

    t.dial("+1234abc").await;
    assert!(t.device.ops().is_empty());
}

#[tokio::test]
async fn dial_requires_a_registered_device() {
    let mut mock = MockSignalingDevice::new();
    mock.expect_is_registered().return_const(false);
    mock.expect_connect().never();

    let backend = Arc::new(BackendClient::new("http://127.0.0.1:5000").unwrap());
    let contacts = Arc::new(ContactDirectory::new(backend));
    let (history_tx, _history_rx) = tokio::sync::mpsc::unbounded_channel();
    let (status_tx, mut status_rx) = tokio::sync::broadcast::channel(8);
    let (_leg_tx, leg_rx) = tokio::sync::mpsc::unbounded_channel();
    let (_handle, mut coordinator) =
        CoordinatorBuilder::new(Arc::new(mock), leg_rx, contacts, history_tx, status_tx).build();

    coordinator
        .handle_command(Command::Dial {
            number: "+15551234567".to_string(),
            alternate_caller_id: false,
        })
        .await;

    let event = status_rx.try_recv().unwrap();
    assert_eq!(event.severity, Severity::Error);
    assert!(event.message.contains("not ready"));
}

#[tokio::test(start_paused = true)]
async fn dtmf_is_a_noop_unless_connected() {
    let mut t = TestBed::new();
    t.dial("+15551234567").await;
    let leg = t.active_leg();

    t.command(Command::SendDigits {
        digits: "5".to_string(),
    })
    .await;
    assert!(!t
        .device
        .ops()
        .iter()
        .any(|op| matches!(op, Op::SendDigits(..))));

    t.event(LegEvent::Accepted { leg: leg.clone() }).await;
    t.command(Command::SendDigits {
        digits: "5".to_string(),
    })
    .await;
    assert!(t.device.ops().contains(&Op::SendDigits(leg, "5".to_string())));
}

#[tokio::test(start_paused = true)]
async fn second_pending_incoming_leg_is_rejected() {
    let mut t = TestBed::new();
    t.incoming("in-1", "+15559876543", Some("CA1")).await;
    t.incoming("in-2", "+15550001111", Some("CA2")).await;

    assert!(t.device.ops().contains(&Op::Reject("in-2".to_string())));
    assert!(t.coordinator.snapshot().has_incoming);
    assert!(t.drain_history().is_empty());
}

#[test]
fn e164_validation() {
    assert!(validate_e164("+15551234567").is_ok());
    assert!(validate_e164("+972501234567").is_ok());
    assert!(validate_e164("15551234567").is_err());
    assert!(validate_e164("+").is_err());
    assert!(validate_e164("+1555 1234").is_err());
    assert!(validate_e164("+12345678901234567").is_err());
}
