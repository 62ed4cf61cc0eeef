use super::{
    normalize_correlation_id, ConnectParams, LegEvent, LegEventSender, LegId, SignalingDevice,
};
use crate::error::{Result, SoftphoneError};
use async_trait::async_trait;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};
use tracing::{debug, info};
use uuid::Uuid;

/// In-process signaling device. Commands echo the lifecycle events a real
/// device would emit; remote-side behavior (ringing, accept, hangup) is
/// scripted by the caller through the helper methods.
pub struct SimulatedDevice {
    events: LegEventSender,
    registered: AtomicBool,
    token: Mutex<Option<String>>,
    live_legs: Mutex<HashSet<LegId>>,
    muted: Mutex<HashMap<LegId, bool>>,
}

impl SimulatedDevice {
    pub fn new(events: LegEventSender) -> Self {
        Self {
            events,
            registered: AtomicBool::new(false),
            token: Mutex::new(None),
            live_legs: Mutex::new(HashSet::new()),
            muted: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self) {
        self.registered.store(true, Ordering::SeqCst);
        self.events.send(LegEvent::Registered).ok();
        info!("simulated device registered");
    }

    /// Script a remote-originated event.
    pub fn push(&self, event: LegEvent) {
        self.events.send(event).ok();
    }

    /// Script an inbound leg. Correlation id resolution mirrors a real
    /// device: custom metadata first, leg parameter as fallback.
    pub fn incoming(
        &self,
        from: &str,
        custom_metadata_sid: Option<&str>,
        leg_parameter_sid: Option<&str>,
    ) -> LegId {
        let leg = Uuid::new_v4().to_string();
        let correlation_id = normalize_correlation_id(
            custom_metadata_sid.map(str::to_string),
            leg_parameter_sid.map(str::to_string),
        );
        self.events
            .send(LegEvent::Incoming {
                leg: leg.clone(),
                from: from.to_string(),
                correlation_id,
            })
            .ok();
        leg
    }

    pub fn live_legs(&self) -> Vec<LegId> {
        self.live_legs.lock().unwrap().iter().cloned().collect()
    }

    pub fn is_muted(&self, leg: &LegId) -> bool {
        self.muted.lock().unwrap().get(leg).copied().unwrap_or(false)
    }
}

#[async_trait]
impl SignalingDevice for SimulatedDevice {
    async fn connect(&self, params: ConnectParams) -> Result<LegId> {
        if !self.is_registered() {
            return Err(SoftphoneError::DeviceNotReady);
        }
        let leg = Uuid::new_v4().to_string();
        self.live_legs.lock().unwrap().insert(leg.clone());
        debug!(%leg, to = %params.to, "simulated connect");
        Ok(leg)
    }

    async fn accept(&self, leg: &LegId) -> Result<()> {
        self.live_legs.lock().unwrap().insert(leg.clone());
        self.events.send(LegEvent::Accepted { leg: leg.clone() }).ok();
        Ok(())
    }

    async fn reject(&self, leg: &LegId) -> Result<()> {
        self.events.send(LegEvent::Rejected { leg: leg.clone() }).ok();
        Ok(())
    }

    async fn disconnect_all(&self) -> Result<()> {
        // Pending (not yet accepted) inbound legs survive, as on a real
        // device where disconnect-all only tears down live calls.
        let legs: Vec<LegId> = self.live_legs.lock().unwrap().drain().collect();
        for leg in legs {
            self.muted.lock().unwrap().remove(&leg);
            self.events.send(LegEvent::Disconnected { leg }).ok();
        }
        Ok(())
    }

    async fn mute(&self, leg: &LegId, muted: bool) -> Result<()> {
        self.muted.lock().unwrap().insert(leg.clone(), muted);
        Ok(())
    }

    async fn send_digits(&self, leg: &LegId, digits: &str) -> Result<()> {
        debug!(%leg, digits, "simulated dtmf");
        Ok(())
    }

    fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    fn update_token(&self, token: &str) -> Result<()> {
        *self.token.lock().unwrap() = Some(token.to_string());
        Ok(())
    }
}
