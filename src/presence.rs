//! Presence State Machine
//!
//! Turns network probe samples into connect/disconnect events. The machine
//! is the only writer of the connection checkpoint.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::identity::IdentityProvider;
use crate::model::{ConnectionState, EventKind, NewEvent, PresenceState};
use crate::probe::NetworkProbe;
use crate::queue::EventQueue;
use crate::service::PresenceObserver;

/// Result of one evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickOutcome {
    pub state: PresenceState,
    pub emitted: Option<EventKind>,
    /// Queue id of the emitted event, `None` if nothing was emitted or the append failed
    pub event_id: Option<i64>,
}

struct Inner {
    state: PresenceState,
    network_id: Option<String>,
    connect_since: Option<DateTime<Utc>>,
    /// Consecutive samples disagreeing with the current connectedness
    disagreeing: u32,
    /// When the current disagreeing run started; a debounced transition is stamped here
    disagreeing_since: Option<DateTime<Utc>>,
}

impl Inner {
    fn connection_state(&self) -> ConnectionState {
        ConnectionState {
            is_connected_to_target: self.state == PresenceState::ConnectedToTarget,
            network_id: self.network_id.clone(),
            connect_since: self.connect_since,
        }
    }
}

pub struct PresenceStateMachine {
    target: String,
    probe: Arc<dyn NetworkProbe>,
    identity: Arc<dyn IdentityProvider>,
    queue: Arc<EventQueue>,
    observer: Arc<dyn PresenceObserver>,
    probe_timeout: Duration,
    debounce_samples: u32,
    inner: Mutex<Inner>,
}

impl PresenceStateMachine {
    /// Build the machine, seeded from the last checkpoint. A checkpoint that
    /// claims an active session on the target resumes it without a new connect.
    pub fn new(
        target: &str,
        probe: Arc<dyn NetworkProbe>,
        identity: Arc<dyn IdentityProvider>,
        queue: Arc<EventQueue>,
        observer: Arc<dyn PresenceObserver>,
        probe_timeout: Duration,
        debounce_samples: u32,
    ) -> Self {
        let checkpoint = queue.load_connection_state().unwrap_or_else(|e| {
            error!("Failed to load connection checkpoint: {}", e);
            ConnectionState::default()
        });

        let resumed = checkpoint.is_connected_to_target
            && checkpoint.network_id.as_deref() == Some(target);

        let inner = if resumed {
            info!(
                "Resuming session on {} started at {:?}",
                target, checkpoint.connect_since
            );
            Inner {
                state: PresenceState::ConnectedToTarget,
                network_id: checkpoint.network_id,
                connect_since: checkpoint.connect_since,
                disagreeing: 0,
                disagreeing_since: None,
            }
        } else {
            Inner {
                state: PresenceState::Unknown,
                network_id: None,
                connect_since: None,
                disagreeing: 0,
                disagreeing_since: None,
            }
        };

        Self {
            target: target.to_string(),
            probe,
            identity,
            queue,
            observer,
            probe_timeout,
            debounce_samples: debounce_samples.max(1),
            inner: Mutex::new(inner),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn state(&self) -> PresenceState {
        self.lock().state
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.lock().connection_state()
    }

    /// Sample the probe once and evaluate. Probe failures count as "no network".
    pub async fn tick(&self) -> TickOutcome {
        let sample = match tokio::time::timeout(self.probe_timeout, self.probe.current_network_id()).await {
            Ok(Ok(sample)) => sample,
            Ok(Err(e)) => {
                debug!("Network probe failed, treating as no network: {}", e);
                None
            }
            Err(_) => {
                debug!("Network probe timed out, treating as no network");
                None
            }
        };

        self.evaluate(sample, Utc::now())
    }

    /// Transition function for one sample observed at `now`
    pub fn evaluate(&self, sample: Option<String>, now: DateTime<Utc>) -> TickOutcome {
        let mut inner = self.lock();

        let on_target = sample.as_deref() == Some(self.target.as_str());
        let was_connected = inner.state == PresenceState::ConnectedToTarget;

        let at = if on_target != was_connected {
            inner.disagreeing += 1;
            let first_seen = *inner.disagreeing_since.get_or_insert(now);
            if inner.disagreeing < self.debounce_samples {
                debug!(
                    "Holding state, {}/{} disagreeing samples",
                    inner.disagreeing, self.debounce_samples
                );
                let outcome = TickOutcome {
                    state: inner.state,
                    emitted: None,
                    event_id: None,
                };
                drop(inner);
                self.notify();
                return outcome;
            }
            first_seen
        } else {
            now
        };
        inner.disagreeing = 0;
        inner.disagreeing_since = None;

        let mut emitted = None;
        let mut event_id = None;

        match (was_connected, on_target) {
            (false, true) => {
                info!("Connected to target network {}", self.target);
                let event = NewEvent::connect(&self.target, self.identity.capture(), at);
                event_id = self.append(&event);
                emitted = Some(EventKind::Connect);

                inner.state = PresenceState::ConnectedToTarget;
                inner.connect_since = Some(at);
                inner.network_id = sample;
                self.checkpoint(&inner);
            }
            (true, false) => {
                let event = NewEvent::disconnect(
                    &self.target,
                    self.identity.capture(),
                    at,
                    inner.connect_since,
                );
                info!(
                    "Disconnected from target network {} after {}s",
                    self.target,
                    event.duration_seconds.unwrap_or(0)
                );
                event_id = self.append(&event);
                emitted = Some(EventKind::Disconnect);

                inner.state = other_state(&sample);
                inner.connect_since = None;
                inner.network_id = sample;
                self.checkpoint(&inner);
            }
            (true, true) => {
                // Re-persist so session accounting survives a crash
                self.checkpoint(&inner);
            }
            (false, false) => {
                let state = other_state(&sample);
                if state != inner.state || sample != inner.network_id {
                    debug!("Network changed to {:?}", sample);
                    inner.state = state;
                    inner.network_id = sample;
                    self.checkpoint(&inner);
                }
            }
        }

        let outcome = TickOutcome {
            state: inner.state,
            emitted,
            event_id,
        };
        drop(inner);
        self.notify();
        outcome
    }

    /// Re-emit a connect for the current session, restarting its clock.
    /// Used when the server lost track of it. No-op when not connected.
    pub fn force_reconnect(&self, now: DateTime<Utc>) -> Option<i64> {
        let mut inner = self.lock();
        if inner.state != PresenceState::ConnectedToTarget {
            debug!("Not on target network, nothing to reconnect");
            return None;
        }

        warn!("Re-establishing remote session on {}", self.target);
        let event = NewEvent::connect(&self.target, self.identity.capture(), now);
        let id = self.append(&event);

        inner.connect_since = Some(now);
        self.checkpoint(&inner);
        id
    }

    /// Final disconnect on shutdown; the checkpoint is cleared so the next
    /// start opens a fresh session.
    pub fn shutdown_disconnect(&self, now: DateTime<Utc>) -> Option<i64> {
        let mut inner = self.lock();
        if inner.state != PresenceState::ConnectedToTarget {
            return None;
        }

        let event = NewEvent::disconnect(
            &self.target,
            self.identity.capture(),
            now,
            inner.connect_since,
        );
        info!("Shutting down, closing session on {}", self.target);
        let id = self.append(&event);

        inner.state = PresenceState::Disconnected;
        inner.connect_since = None;
        self.checkpoint(&inner);
        id
    }

    /// Probe loop until `cancel` fires
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.tick() => {}
            }
        }

        debug!("Presence monitor stopped");
    }

    // A lost event cannot be retried: there is nowhere durable to keep it.
    fn append(&self, event: &NewEvent) -> Option<i64> {
        match self.queue.append(event) {
            Ok(id) => Some(id),
            Err(e) => {
                error!("Failed to persist {} event, event lost: {}", event.kind, e);
                None
            }
        }
    }

    fn checkpoint(&self, inner: &Inner) {
        if let Err(e) = self.queue.save_connection_state(&inner.connection_state()) {
            error!("Failed to checkpoint connection state: {}", e);
        }
    }

    fn notify(&self) {
        let state = self.connection_state();
        self.observer
            .on_presence_changed(state.is_connected_to_target, state.network_id.as_deref());
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn other_state(sample: &Option<String>) -> PresenceState {
    if sample.is_some() {
        PresenceState::ConnectedToOther
    } else {
        PresenceState::Disconnected
    }
}
