use crate::{
    backend::BackendClient,
    event::{Severity, StatusEvent, StatusSender},
    signaling::SignalingDevice,
};
use std::{sync::Arc, time::Duration};
use tokio::{select, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Floor on the refresh interval so a tiny or malformed TTL cannot spin the
/// loop.
const MIN_REFRESH_INTERVAL_SECS: u64 = 30;

/// Re-issues the device credential at `ttl - skew` so registration never
/// lapses mid-session. The token is replaced in place; live legs are not
/// touched. A failed renewal is a persistent condition: it is surfaced once
/// with error severity and the loop parks until shutdown, since retrying
/// silently would eventually drop the registration anyway.
pub struct CredentialRefresher {
    backend: Arc<BackendClient>,
    device: Arc<dyn SignalingDevice>,
    skew: Duration,
    status_sender: StatusSender,
    cancel_token: CancellationToken,
}

impl CredentialRefresher {
    pub fn new(
        backend: Arc<BackendClient>,
        device: Arc<dyn SignalingDevice>,
        skew: Duration,
        status_sender: StatusSender,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            backend,
            device,
            skew,
            status_sender,
            cancel_token,
        }
    }

    pub async fn serve(&self) {
        select! {
            _ = self.cancel_token.cancelled() => {
                info!("credential refresher cancelled");
            }
            _ = async {
                self.refresh_loop().await;
                // Persistent failure: stay parked so the rest of the app
                // (including in-progress calls) keeps running.
                self.cancel_token.cancelled().await;
            } => {}
        }
    }

    async fn refresh_loop(&self) {
        loop {
            match self.backend.fetch_token().await {
                Ok(grant) => {
                    if let Err(e) = self.device.update_token(&grant.token) {
                        self.report_failure(&format!("{}", e));
                        return;
                    }
                    let wait = grant
                        .ttl
                        .saturating_sub(self.skew.as_secs())
                        .max(MIN_REFRESH_INTERVAL_SECS);
                    info!(
                        identity = %grant.identity,
                        ttl = grant.ttl,
                        next_refresh = wait,
                        "credential refreshed"
                    );
                    sleep(Duration::from_secs(wait)).await;
                }
                Err(e) => {
                    self.report_failure(&format!("{}", e));
                    return;
                }
            }
        }
    }

    fn report_failure(&self, reason: &str) {
        error!("credential refresh failed: {}", reason);
        self.status_sender
            .send(StatusEvent::new(
                Severity::Error,
                format!("Credential refresh failed, reload required: {}", reason),
            ))
            .ok();
    }
}
