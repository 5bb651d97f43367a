//! Heartbeat Module
//!
//! Keeps the server-side session alive while on the target network, and
//! re-establishes it when the server reports it lost track of the device.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::TokenManager;
use crate::identity::IdentityProvider;
use crate::model::{NewEvent, SyncMode};
use crate::presence::PresenceStateMachine;
use crate::queue::EventQueue;
use crate::sync::{CycleOutcome, CycleReport, SyncEngine};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Not on the target network
    NotConnected,
    /// Offline or logged out; heartbeats are not queued in that case
    Skipped,
    /// Heartbeat could not be written to the queue
    NotQueued,
    /// Heartbeat queued and a sync cycle ran
    Sent(CycleReport),
    /// Server had no session; a connect was re-emitted and synced
    Repaired { reconnect_id: Option<i64>, report: CycleReport },
}

pub struct HeartbeatEngine {
    presence: Arc<PresenceStateMachine>,
    queue: Arc<EventQueue>,
    tokens: Arc<TokenManager>,
    sync: Arc<SyncEngine>,
    identity: Arc<dyn IdentityProvider>,
}

impl HeartbeatEngine {
    pub fn new(
        presence: Arc<PresenceStateMachine>,
        queue: Arc<EventQueue>,
        tokens: Arc<TokenManager>,
        sync: Arc<SyncEngine>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            presence,
            queue,
            tokens,
            sync,
            identity,
        }
    }

    /// Queue a heartbeat for the current session and push it out
    pub async fn beat(&self, now: DateTime<Utc>) -> HeartbeatOutcome {
        let state = self.presence.connection_state();
        if !state.is_connected_to_target {
            return HeartbeatOutcome::NotConnected;
        }
        if self.tokens.mode() == SyncMode::Offline || !self.tokens.is_authenticated() {
            debug!("Skipping heartbeat, no usable session");
            return HeartbeatOutcome::Skipped;
        }

        let event = NewEvent::heartbeat(
            self.presence.target(),
            self.identity.capture(),
            now,
            state.connect_since,
        );
        if let Err(e) = self.queue.append(&event) {
            error!("Failed to queue heartbeat: {}", e);
            return HeartbeatOutcome::NotQueued;
        }

        let report = self.sync.run_cycle().await;
        match self.repair_if_missing(report, now).await {
            Some((reconnect_id, report)) => HeartbeatOutcome::Repaired { reconnect_id, report },
            None => {
                debug!("Heartbeat cycle finished: {:?}", report.outcome);
                HeartbeatOutcome::Sent(report)
            }
        }
    }

    /// Sync cycle that also repairs a missing server session
    pub async fn sync_with_repair(&self) -> CycleReport {
        let report = self.sync.run_cycle().await;
        match self.repair_if_missing(report, Utc::now()).await {
            Some((_, report)) => report,
            None => report,
        }
    }

    async fn repair_if_missing(
        &self,
        report: CycleReport,
        now: DateTime<Utc>,
    ) -> Option<(Option<i64>, CycleReport)> {
        if report.outcome != CycleOutcome::SessionMissing {
            return None;
        }

        warn!("Server has no active session for this device, reconnecting");
        let reconnect_id = self.presence.force_reconnect(now);
        let second = self.sync.run_cycle().await;
        if second.outcome == CycleOutcome::Completed {
            info!("Remote session re-established");
        }

        Some((
            reconnect_id,
            CycleReport {
                uploaded: report.uploaded + second.uploaded,
                outcome: second.outcome,
            },
        ))
    }

    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; the session was just opened.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            // An upload cut short stays pending in the queue.
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.beat(Utc::now()) => {}
            }
        }

        debug!("Heartbeat task stopped");
    }

    /// Periodic queue drain, with the same session repair as heartbeats
    pub async fn run_sync(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.sync_with_repair() => {}
            }
        }

        debug!("Sync task stopped");
    }
}
