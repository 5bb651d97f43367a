//! Test doubles for the external collaborators.
//!
//! Shared by the unit tests and the integration tests under `tests/`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::api::{ApiError, LoginRequest, RemoteApi, TokenGrant, TrackAck, TrackPayload};
use crate::error::ProbeError;
use crate::identity::StaticIdentity;
use crate::model::{DeviceIdentity, SyncMode};
use crate::probe::NetworkProbe;
use crate::service::PresenceObserver;

pub fn identity() -> StaticIdentity {
    StaticIdentity(DeviceIdentity {
        host_name: "desk-01".into(),
        mac_address: "aa:bb:cc:dd:ee:ff".into(),
        ip_address: "10.0.0.5".into(),
    })
}

/// Probe returning scripted samples; the last one repeats
pub struct FakeProbe {
    samples: Mutex<VecDeque<Result<Option<String>, ProbeError>>>,
    last: Mutex<Option<String>>,
}

impl FakeProbe {
    pub fn new(samples: &[Option<&str>]) -> Self {
        Self {
            samples: Mutex::new(samples.iter().map(|s| Ok(s.map(str::to_string))).collect()),
            last: Mutex::new(None),
        }
    }

    pub fn push(&self, sample: Option<&str>) {
        self.samples
            .lock()
            .unwrap()
            .push_back(Ok(sample.map(str::to_string)));
    }

    pub fn push_error(&self) {
        self.samples
            .lock()
            .unwrap()
            .push_back(Err(ProbeError::Io("probe exploded".into())));
    }
}

#[async_trait]
impl NetworkProbe for FakeProbe {
    async fn current_network_id(&self) -> Result<Option<String>, ProbeError> {
        let next = self.samples.lock().unwrap().pop_front();
        match next {
            Some(Ok(sample)) => {
                *self.last.lock().unwrap() = sample.clone();
                Ok(sample)
            }
            Some(Err(e)) => Err(e),
            None => Ok(self.last.lock().unwrap().clone()),
        }
    }
}

/// Scriptable remote service
#[derive(Default)]
pub struct FakeApi {
    login_failure: Mutex<Option<ApiError>>,
    refresh_failure: Mutex<Option<ApiError>>,
    refresh_delay: Mutex<Option<Duration>>,
    track_script: Mutex<VecDeque<Result<TrackAck, ApiError>>>,
    tracked: Mutex<Vec<(String, TrackPayload)>>,
    refresh_count: AtomicUsize,
    logout_count: AtomicUsize,
    unreachable: AtomicBool,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_login(&self, error: ApiError) {
        *self.login_failure.lock().unwrap() = Some(error);
    }

    pub fn fail_refresh(&self, error: ApiError) {
        *self.refresh_failure.lock().unwrap() = Some(error);
    }

    pub fn delay_refresh(&self, delay: Duration) {
        *self.refresh_delay.lock().unwrap() = Some(delay);
    }

    /// Queue the outcome of the next track call; unscripted calls succeed
    pub fn script_track(&self, outcome: Result<TrackAck, ApiError>) {
        self.track_script.lock().unwrap().push_back(outcome);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_count.load(Ordering::SeqCst)
    }

    pub fn logout_calls(&self) -> usize {
        self.logout_count.load(Ordering::SeqCst)
    }

    /// Payloads the server acknowledged, in arrival order
    pub fn tracked(&self) -> Vec<TrackPayload> {
        self.tracked
            .lock()
            .unwrap()
            .iter()
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Bearer tokens used for acknowledged track calls
    pub fn tracked_tokens(&self) -> Vec<String> {
        self.tracked
            .lock()
            .unwrap()
            .iter()
            .map(|(t, _)| t.clone())
            .collect()
    }
}

#[async_trait]
impl RemoteApi for FakeApi {
    async fn login(&self, request: &LoginRequest) -> Result<TokenGrant, ApiError> {
        if let Some(error) = self.login_failure.lock().unwrap().clone() {
            return Err(error);
        }
        Ok(TokenGrant {
            access_token: "access-1".into(),
            refresh_token: Some("refresh-1".into()),
            expires_in: Some(3600),
            email: Some(request.email.clone()),
        })
    }

    async fn logout(&self, _access_token: &str) -> Result<(), ApiError> {
        self.logout_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant, ApiError> {
        let n = self.refresh_count.fetch_add(1, Ordering::SeqCst) + 2;
        let delay = *self.refresh_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.refresh_failure.lock().unwrap().clone() {
            return Err(error);
        }
        Ok(TokenGrant {
            access_token: format!("access-{n}"),
            refresh_token: Some(format!("refresh-{n}")),
            expires_in: Some(3600),
            email: None,
        })
    }

    async fn track(&self, access_token: &str, payload: &TrackPayload) -> Result<TrackAck, ApiError> {
        let outcome = self
            .track_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(TrackAck::default()));

        if outcome.is_ok() {
            self.tracked
                .lock()
                .unwrap()
                .push((access_token.to_string(), payload.clone()));
        }
        outcome
    }

    async fn health_check(&self) -> Result<(), ApiError> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(ApiError::Transport(crate::error::TransportError::Network(
                "connection refused".into(),
            )))
        } else {
            Ok(())
        }
    }
}

/// Observer that records every callback
#[derive(Default)]
pub struct RecordingObserver {
    presence: Mutex<Vec<(bool, Option<String>)>>,
    modes: Mutex<Vec<SyncMode>>,
    expired: AtomicUsize,
}

impl RecordingObserver {
    pub fn presence(&self) -> Vec<(bool, Option<String>)> {
        self.presence.lock().unwrap().clone()
    }

    pub fn modes(&self) -> Vec<SyncMode> {
        self.modes.lock().unwrap().clone()
    }

    pub fn session_expired_count(&self) -> usize {
        self.expired.load(Ordering::SeqCst)
    }
}

impl PresenceObserver for RecordingObserver {
    fn on_presence_changed(&self, is_connected: bool, network_id: Option<&str>) {
        self.presence
            .lock()
            .unwrap()
            .push((is_connected, network_id.map(str::to_string)));
    }

    fn on_sync_status_changed(&self, mode: SyncMode) {
        self.modes.lock().unwrap().push(mode);
    }

    fn on_session_expired(&self) {
        self.expired.fetch_add(1, Ordering::SeqCst);
    }
}
