use crate::{
    backend::BackendClient,
    config::Config,
    contacts::ContactDirectory,
    coordinator::{Coordinator, CoordinatorBuilder, CoordinatorHandle},
    credentials::CredentialRefresher,
    event::StatusSender,
    history::HistoryLogger,
    signaling::{LegEventReceiver, SignalingDevice, SimulatedDevice},
};
use anyhow::Result;
use std::{sync::Arc, time::Duration};
use tokio::{select, sync::broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct AppBuilder {
    config: Option<Config>,
    device: Option<(Arc<dyn SignalingDevice>, LegEventReceiver)>,
    cancel_token: Option<CancellationToken>,
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            device: None,
            cancel_token: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Supply the signaling device and its event stream. Without this the app
    /// runs on an in-process [`SimulatedDevice`].
    pub fn device(
        mut self,
        device: Arc<dyn SignalingDevice>,
        events: LegEventReceiver,
    ) -> Self {
        self.device = Some((device, events));
        self
    }

    pub fn cancel_token(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = Some(cancel_token);
        self
    }

    pub fn build(self) -> Result<App> {
        let config = Arc::new(self.config.unwrap_or_default());
        let token = self.cancel_token.unwrap_or_default();

        let backend = Arc::new(BackendClient::new(&config.backend_url)?);
        let contacts = Arc::new(ContactDirectory::new(backend.clone()));
        let (status_sender, _) = broadcast::channel(64);

        let (device, leg_events) = match self.device {
            Some((device, events)) => (device, events),
            None => {
                let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
                let device = Arc::new(SimulatedDevice::new(tx));
                device.register();
                (device as Arc<dyn SignalingDevice>, rx)
            }
        };

        let (history_sender, history) =
            HistoryLogger::new(backend.clone(), status_sender.clone(), token.clone());

        let (handle, coordinator) = CoordinatorBuilder::new(
            device.clone(),
            leg_events,
            contacts.clone(),
            history_sender,
            status_sender.clone(),
        )
        .with_cancel_token(token.clone())
        .with_settle_delay(Duration::from_millis(config.settle_delay_ms))
        .build();

        let refresher = CredentialRefresher::new(
            backend,
            device,
            Duration::from_secs(config.token_refresh_skew_secs),
            status_sender.clone(),
            token.clone(),
        );

        Ok(App {
            config,
            token,
            handle,
            status_sender,
            contacts,
            coordinator,
            history,
            refresher,
        })
    }
}

/// Wires the coordinator, history logger and credential refresher together
/// and serves them until cancellation.
pub struct App {
    pub config: Arc<Config>,
    pub token: CancellationToken,
    pub handle: CoordinatorHandle,
    pub status_sender: StatusSender,
    pub contacts: Arc<ContactDirectory>,
    coordinator: Coordinator,
    history: HistoryLogger,
    refresher: CredentialRefresher,
}

impl App {
    pub async fn run(self) -> Result<()> {
        // A cold contact cache only degrades name resolution, never startup.
        if let Err(e) = self.contacts.refresh().await {
            warn!("contact refresh failed: {}", e);
        }

        let mut status_rx = self.status_sender.subscribe();
        let status_log = async move {
            loop {
                match status_rx.recv().await {
                    Ok(event) => {
                        info!(severity = ?event.severity, "status: {}", event.message)
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(n, "status events dropped")
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };

        let mut coordinator = self.coordinator;
        let mut history = self.history;
        let refresher = self.refresher;
        select! {
            _ = self.token.cancelled() => {
                info!("app cancelled");
            }
            _ = coordinator.serve() => {}
            _ = history.serve() => {}
            _ = refresher.serve() => {}
            _ = status_log => {}
        }
        self.token.cancel();
        Ok(())
    }
}
