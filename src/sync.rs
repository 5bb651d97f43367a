//! Sync Module
//!
//! Drains the durable queue to the remote service, one event at a time,
//! in insertion order.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::api::{ApiError, RemoteApi, TrackPayload};
use crate::auth::TokenManager;
use crate::error::Error;
use crate::model::{PresenceEvent, SyncMode};
use crate::queue::EventQueue;

/// How a sync cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing was pending
    Idle,
    /// Offline or not logged in, nothing attempted
    Skipped,
    /// Every pending event was acknowledged
    Completed,
    /// Stopped on a transport or storage failure; the rest waits for the next cycle
    Interrupted,
    /// The server holds no session for this device
    SessionMissing,
    /// The access token was rejected even after a refresh
    AuthFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub uploaded: usize,
    pub outcome: CycleOutcome,
}

impl CycleReport {
    fn new(uploaded: usize, outcome: CycleOutcome) -> Self {
        Self { uploaded, outcome }
    }
}

enum Upload {
    Acknowledged,
    Rejected(ApiError),
    Stop(CycleOutcome),
}

pub struct SyncEngine {
    queue: Arc<EventQueue>,
    tokens: Arc<TokenManager>,
    api: Arc<dyn RemoteApi>,
    /// Keeps a single upload in flight across every caller
    cycle_lock: tokio::sync::Mutex<()>,
}

impl SyncEngine {
    pub fn new(queue: Arc<EventQueue>, tokens: Arc<TokenManager>, api: Arc<dyn RemoteApi>) -> Self {
        Self {
            queue,
            tokens,
            api,
            cycle_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn pending_count(&self) -> u64 {
        self.queue.pending_count().unwrap_or_else(|e| {
            error!("Failed to count pending events: {}", e);
            0
        })
    }

    /// Upload pending events until the queue is drained or something fails
    pub async fn run_cycle(&self) -> CycleReport {
        let _guard = self.cycle_lock.lock().await;

        if self.tokens.mode() == SyncMode::Offline {
            debug!("Offline, skipping sync cycle");
            return CycleReport::new(0, CycleOutcome::Skipped);
        }
        self.tokens.reload_if_signed_out().await;
        let (mut access, email) = match (self.tokens.current_access_token(), self.tokens.email()) {
            (Ok(access), Some(email)) => (access, email),
            _ => {
                debug!("Not logged in, skipping sync cycle");
                return CycleReport::new(0, CycleOutcome::Skipped);
            }
        };

        let pending = match self.queue.list_pending() {
            Ok(pending) => pending,
            Err(e) => {
                error!("Failed to read pending events: {}", e);
                return CycleReport::new(0, CycleOutcome::Interrupted);
            }
        };
        if pending.is_empty() {
            return CycleReport::new(0, CycleOutcome::Idle);
        }

        debug!("Uploading {} pending events", pending.len());
        let mut uploaded = 0;

        for event in &pending {
            let payload = TrackPayload::from_event(event, &email);

            let outcome = self.upload(&mut access, &payload).await;
            let session_missing = match outcome {
                Upload::Acknowledged => {
                    uploaded += 1;
                    false
                }
                Upload::Rejected(e) => {
                    warn!("Server rejected {} event {}: {}", event.kind, event.id, e);
                    e.is_session_missing()
                }
                Upload::Stop(outcome) => return CycleReport::new(uploaded, outcome),
            };

            // Ordering depends on this mark landing before the next upload
            if !self.mark_synced(event) {
                return CycleReport::new(uploaded, CycleOutcome::Interrupted);
            }
            if session_missing {
                return CycleReport::new(uploaded, CycleOutcome::SessionMissing);
            }
        }

        info!("Synced {} of {} pending events", uploaded, pending.len());
        CycleReport::new(uploaded, CycleOutcome::Completed)
    }

    /// One cycle that gives up at `deadline`, used for the shutdown flush
    pub async fn flush(&self, deadline: Instant) -> Option<CycleReport> {
        match tokio::time::timeout_at(deadline, self.run_cycle()).await {
            Ok(report) => Some(report),
            Err(_) => {
                warn!("Queue flush did not finish before the shutdown deadline");
                None
            }
        }
    }

    /// Send one payload, applying the single refresh-and-retry on a 401
    async fn upload(&self, access: &mut String, payload: &TrackPayload) -> Upload {
        let mut result = self.api.track(access.as_str(), payload).await;

        if let Err(ApiError::Unauthorized(_)) = &result {
            match self.tokens.refresh_after_unauthorized(access.as_str()).await {
                Ok(fresh) => {
                    *access = fresh;
                    result = self.api.track(access.as_str(), payload).await;
                }
                Err(Error::Transport(e)) => {
                    warn!("Refresh failed, stopping sync: {}", e);
                    return Upload::Stop(CycleOutcome::Interrupted);
                }
                Err(e) => {
                    warn!("Could not recover from unauthorized upload: {}", e);
                    return Upload::Stop(CycleOutcome::AuthFailed);
                }
            }
        }

        match result {
            Ok(ack) => {
                debug!(
                    event_id = payload.event_id,
                    record_id = ?ack.record_id,
                    "Event acknowledged"
                );
                Upload::Acknowledged
            }
            Err(ApiError::Transport(e)) => {
                warn!("Upload failed, going offline: {}", e);
                self.tokens.set_mode(SyncMode::Offline);
                Upload::Stop(CycleOutcome::Interrupted)
            }
            Err(ApiError::Unauthorized(m)) => {
                warn!("Access token still rejected after refresh: {}", m);
                Upload::Stop(CycleOutcome::AuthFailed)
            }
            Err(e) => Upload::Rejected(e),
        }
    }

    fn mark_synced(&self, event: &PresenceEvent) -> bool {
        match self.queue.mark_synced(event.id) {
            Ok(_) => true,
            Err(e) => {
                error!("Failed to mark event {} synced: {}", event.id, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::TrackAck;
    use crate::error::TransportError;
    use crate::model::{EventKind, NewEvent, SessionToken};
    use crate::service::NoopObserver;
    use crate::storage::MemoryCredentialStore;
    use crate::test_support::{identity, FakeApi};
    use crate::identity::IdentityProvider;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::time::Duration;

    fn token(expires_in: i64) -> SessionToken {
        SessionToken {
            access_token: "access-1".into(),
            refresh_token: Some("refresh-1".into()),
            expires_at: Utc::now() + ChronoDuration::seconds(expires_in),
            email: "dev@example.com".into(),
        }
    }

    fn setup(expires_in: i64) -> (Arc<FakeApi>, Arc<EventQueue>, Arc<TokenManager>, SyncEngine) {
        let api = Arc::new(FakeApi::new());
        let queue = Arc::new(EventQueue::open_in_memory().unwrap());
        let tokens = Arc::new(TokenManager::new(
            api.clone(),
            Arc::new(MemoryCredentialStore::with_token(token(expires_in))),
            Arc::new(NoopObserver),
            300,
            3600,
        ));
        tokens.restore().unwrap();
        let engine = SyncEngine::new(queue.clone(), tokens.clone(), api.clone());
        (api, queue, tokens, engine)
    }

    fn seed(queue: &EventQueue) -> Vec<i64> {
        let t0 = Utc::now();
        let id = identity().capture();
        vec![
            queue.append(&NewEvent::connect("OfficeNet", id.clone(), t0)).unwrap(),
            queue
                .append(&NewEvent::heartbeat("OfficeNet", id.clone(), t0 + ChronoDuration::seconds(60), Some(t0)))
                .unwrap(),
            queue
                .append(&NewEvent::disconnect("OfficeNet", id, t0 + ChronoDuration::seconds(90), Some(t0)))
                .unwrap(),
        ]
    }

    #[tokio::test]
    async fn uploads_in_insertion_order() {
        let (api, queue, _tokens, engine) = setup(3000);
        seed(&queue);

        let report = engine.run_cycle().await;

        assert_eq!(report, CycleReport::new(3, CycleOutcome::Completed));
        let kinds: Vec<EventKind> = api.tracked().iter().map(|p| p.event_type).collect();
        assert_eq!(kinds, vec![EventKind::Connect, EventKind::Heartbeat, EventKind::Disconnect]);
        assert_eq!(queue.pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn transport_failure_stops_cycle_and_goes_offline() {
        let (api, queue, tokens, engine) = setup(3000);
        let ids = seed(&queue);
        api.script_track(Ok(TrackAck::default()));
        api.script_track(Err(ApiError::Transport(TransportError::Timeout)));

        let report = engine.run_cycle().await;

        assert_eq!(report, CycleReport::new(1, CycleOutcome::Interrupted));
        let pending: Vec<i64> = queue.list_pending().unwrap().iter().map(|e| e.id).collect();
        assert_eq!(pending, vec![ids[1], ids[2]]);
        assert_eq!(tokens.mode(), SyncMode::Offline);

        // Offline cycles do not touch the network
        assert_eq!(engine.run_cycle().await.outcome, CycleOutcome::Skipped);
        assert_eq!(api.tracked().len(), 1);
    }

    #[tokio::test]
    async fn empty_queue_is_idle_and_logged_out_is_skipped() {
        let (_api, queue, tokens, engine) = setup(3000);
        assert_eq!(engine.run_cycle().await.outcome, CycleOutcome::Idle);

        seed(&queue);
        tokens.logout().await.unwrap();
        assert_eq!(engine.run_cycle().await.outcome, CycleOutcome::Skipped);
        assert_eq!(queue.pending_count().unwrap(), 3);
    }

    #[tokio::test]
    async fn unauthorized_upload_is_retried_once_with_fresh_token() {
        let (api, queue, tokens, engine) = setup(3000);
        seed(&queue);
        api.script_track(Err(ApiError::Unauthorized("jwt expired".into())));

        let report = engine.run_cycle().await;

        assert_eq!(report, CycleReport::new(3, CycleOutcome::Completed));
        assert_eq!(api.refresh_calls(), 1);
        let fresh = tokens.current_access_token().unwrap();
        assert!(api.tracked_tokens().iter().all(|t| *t == fresh));
    }

    #[tokio::test]
    async fn second_unauthorized_fails_without_marking() {
        let (api, queue, _tokens, engine) = setup(3000);
        seed(&queue);
        api.script_track(Err(ApiError::Unauthorized("jwt expired".into())));
        api.script_track(Err(ApiError::Unauthorized("jwt expired".into())));

        let report = engine.run_cycle().await;

        assert_eq!(report, CycleReport::new(0, CycleOutcome::AuthFailed));
        assert_eq!(api.refresh_calls(), 1);
        assert_eq!(queue.pending_count().unwrap(), 3);
    }

    #[tokio::test]
    async fn rejected_event_is_marked_and_cycle_continues() {
        let (api, queue, _tokens, engine) = setup(3000);
        seed(&queue);
        api.script_track(Err(ApiError::Rejected("Invalid event".into())));

        let report = engine.run_cycle().await;

        assert_eq!(report, CycleReport::new(2, CycleOutcome::Completed));
        assert_eq!(queue.pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_session_stops_the_cycle() {
        let (api, queue, _tokens, engine) = setup(3000);
        let ids = seed(&queue);
        api.script_track(Ok(TrackAck::default()));
        api.script_track(Err(ApiError::Rejected("No active session found for this device".into())));

        let report = engine.run_cycle().await;

        assert_eq!(report, CycleReport::new(1, CycleOutcome::SessionMissing));
        let pending: Vec<i64> = queue.list_pending().unwrap().iter().map(|e| e.id).collect();
        assert_eq!(pending, vec![ids[2]]);
    }

    #[tokio::test]
    async fn concurrent_unauthorized_during_renewal_refreshes_once() {
        let (api, queue, tokens, engine) = setup(200);
        seed(&queue);
        api.delay_refresh(Duration::from_millis(50));
        api.script_track(Err(ApiError::Unauthorized("jwt expired".into())));

        let (_, report) = tokio::join!(tokens.renewal_cycle(Utc::now()), engine.run_cycle());

        assert_eq!(api.refresh_calls(), 1);
        assert_eq!(report.outcome, CycleOutcome::Completed);
        assert_eq!(queue.pending_count().unwrap(), 0);
    }
}
