use crate::{
    backend::BackendClient,
    error::{Result, SoftphoneError},
    event::{Severity, StatusEvent, StatusSender},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub type HistorySender = tokio::sync::mpsc::UnboundedSender<HistoryEntry>;
pub type HistoryReceiver = tokio::sync::mpsc::UnboundedReceiver<HistoryEntry>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    #[serde(rename = "incoming")]
    Inbound,
    #[serde(rename = "outgoing")]
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Completed,
    Missed,
    Rejected,
    Canceled,
    Failed,
}

impl CallOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallOutcome::Completed => "completed",
            CallOutcome::Missed => "missed",
            CallOutcome::Rejected => "rejected",
            CallOutcome::Canceled => "canceled",
            CallOutcome::Failed => "failed",
        }
    }
}

/// Payload for `POST /api/call-history`. Outbound legs have no pre-existing
/// record, so the client creates one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCallRecord {
    pub number: String,
    pub name: Option<String>,
    pub direction: CallDirection,
    pub status: CallOutcome,
    pub duration: u64,
}

/// Payload for `POST /api/update-call-history`. Inbound records are created
/// server-side when the call is first routed; the client only finalizes the
/// status by correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecordUpdate {
    pub call_sid: String,
    pub status: CallOutcome,
    pub duration: u64,
}

/// One history write job. Direction fully determines create-vs-update; this is
/// a protocol contract with the backend, not a style choice.
#[derive(Debug, Clone)]
pub enum HistoryEntry {
    Outbound(NewCallRecord),
    Inbound(CallRecordUpdate),
}

/// Drains history entries off an unbounded channel and writes them to the
/// remote store. Writes are best-effort: a failure is reported on the status
/// channel and logged, never retried, and never blocks a call teardown.
pub struct HistoryLogger {
    backend: Arc<BackendClient>,
    receiver: HistoryReceiver,
    status_sender: StatusSender,
    cancel_token: CancellationToken,
}

impl HistoryLogger {
    pub fn new(
        backend: Arc<BackendClient>,
        status_sender: StatusSender,
        cancel_token: CancellationToken,
    ) -> (HistorySender, Self) {
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        (
            sender,
            Self {
                backend,
                receiver,
                status_sender,
                cancel_token,
            },
        )
    }

    pub async fn serve(&mut self) {
        select! {
            _ = self.cancel_token.cancelled() => {
                info!("history logger cancelled");
            }
            _ = Self::recv_loop(
                self.backend.clone(),
                self.status_sender.clone(),
                &mut self.receiver,
            ) => {
                info!("history logger channel closed");
            }
        }
    }

    async fn recv_loop(
        backend: Arc<BackendClient>,
        status_sender: StatusSender,
        receiver: &mut HistoryReceiver,
    ) {
        while let Some(entry) = receiver.recv().await {
            let backend_ref = backend.clone();
            let status_ref = status_sender.clone();
            tokio::spawn(async move {
                match Self::write_entry(backend_ref, &entry).await {
                    Ok(_) => {
                        debug!(?entry, "call history saved");
                    }
                    Err(e) => {
                        error!(?entry, "failed to save call history: {}", e);
                        status_ref
                            .send(StatusEvent::new(
                                Severity::Warning,
                                format!("Call history write failed: {}", e),
                            ))
                            .ok();
                    }
                }
            });
        }
    }

    async fn write_entry(backend: Arc<BackendClient>, entry: &HistoryEntry) -> Result<()> {
        match entry {
            HistoryEntry::Outbound(record) => backend.create_call_record(record).await,
            HistoryEntry::Inbound(update) => {
                // The record to update cannot be located without the server
                // correlation id. Creating a record here would duplicate the
                // server-side one, so this is a hard failure instead.
                if update.call_sid.is_empty() {
                    return Err(SoftphoneError::CorrelationMissing {
                        number: String::new(),
                    });
                }
                backend.update_call_record(update).await
            }
        }
    }
}
