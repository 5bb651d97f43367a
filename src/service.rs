//! Presence Service
//!
//! Wires the probe, queue, token manager and engines together and runs
//! the four periodic tasks. UI layers talk to the agent through this type
//! and receive status through a [`PresenceObserver`].

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{ApiClient, LoginRequest, RemoteApi};
use crate::auth::TokenManager;
use crate::config::AgentConfig;
use crate::error::Error;
use crate::heartbeat::HeartbeatEngine;
use crate::identity::{IdentityProvider, SystemIdentity};
use crate::model::{ConnectionState, SessionToken, SyncMode};
use crate::presence::PresenceStateMachine;
use crate::probe::{NetworkProbe, SystemProbe};
use crate::queue::EventQueue;
use crate::storage::{CredentialStore, SecureStorage};
use crate::sync::SyncEngine;

/// Status callbacks for UI collaborators. Every method defaults to a no-op.
pub trait PresenceObserver: Send + Sync {
    /// Fired on every state-machine tick
    fn on_presence_changed(&self, _is_connected: bool, _network_id: Option<&str>) {}

    fn on_sync_status_changed(&self, _mode: SyncMode) {}

    /// The refresh token was rejected; the user must log in again
    fn on_session_expired(&self) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl PresenceObserver for NoopObserver {}

/// Observer that writes changes to the log, for headless runs
#[derive(Default)]
pub struct LogObserver {
    last: Mutex<Option<(bool, Option<String>)>>,
}

impl PresenceObserver for LogObserver {
    fn on_presence_changed(&self, is_connected: bool, network_id: Option<&str>) {
        let current = (is_connected, network_id.map(str::to_string));
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if last.as_ref() != Some(&current) {
            info!(
                connected = is_connected,
                network = network_id.unwrap_or("none"),
                "Presence changed"
            );
            *last = Some(current);
        }
    }

    fn on_sync_status_changed(&self, mode: SyncMode) {
        info!("Sync status: {}", mode);
    }

    fn on_session_expired(&self) {
        warn!("Session expired, run `office-presence login` to sign in again");
    }
}

/// External collaborators injected into the service
pub struct Collaborators {
    pub probe: Arc<dyn NetworkProbe>,
    pub identity: Arc<dyn IdentityProvider>,
    pub credentials: Arc<dyn CredentialStore>,
    pub api: Arc<dyn RemoteApi>,
    pub queue: Arc<EventQueue>,
    pub observer: Arc<dyn PresenceObserver>,
}

/// Snapshot for status displays
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub target_network: String,
    pub connection: ConnectionState,
    pub mode: SyncMode,
    pub authenticated: bool,
    pub email: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub pending_events: u64,
}

pub struct PresenceService {
    config: AgentConfig,
    probe: Arc<dyn NetworkProbe>,
    identity: Arc<dyn IdentityProvider>,
    tokens: Arc<TokenManager>,
    presence: Arc<PresenceStateMachine>,
    sync: Arc<SyncEngine>,
    heartbeat: Arc<HeartbeatEngine>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PresenceService {
    /// Build the service from injected collaborators and restore any stored session
    pub fn new(config: AgentConfig, parts: Collaborators) -> Self {
        let tokens = Arc::new(TokenManager::new(
            parts.api.clone(),
            parts.credentials,
            parts.observer.clone(),
            config.refresh_margin_secs,
            config.default_token_lifetime_secs,
        ));
        if let Err(e) = tokens.restore() {
            error!("Failed to restore stored session: {}", e);
        }

        let presence = Arc::new(PresenceStateMachine::new(
            &config.target_ssid,
            parts.probe.clone(),
            parts.identity.clone(),
            parts.queue.clone(),
            parts.observer,
            config.probe_timeout(),
            config.debounce_samples,
        ));
        let sync = Arc::new(SyncEngine::new(parts.queue.clone(), tokens.clone(), parts.api));
        let heartbeat = Arc::new(HeartbeatEngine::new(
            presence.clone(),
            parts.queue,
            tokens.clone(),
            sync.clone(),
            parts.identity.clone(),
        ));

        Self {
            config,
            probe: parts.probe,
            identity: parts.identity,
            tokens,
            presence,
            sync,
            heartbeat,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Build the service with the real system collaborators
    pub fn open(config: AgentConfig, observer: Arc<dyn PresenceObserver>) -> Result<Self, Error> {
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| Error::Config(format!("{}: {}", config.data_dir.display(), e)))?;

        let queue = Arc::new(EventQueue::open(&config.database_path())?);
        let api = Arc::new(ApiClient::new(&config.api_base_url, config.request_timeout())?);

        info!(
            "Opening presence service for {} against {}",
            config.target_ssid, config.api_base_url
        );

        let parts = Collaborators {
            probe: Arc::new(SystemProbe::new(config.probe_timeout())),
            identity: Arc::new(SystemIdentity),
            credentials: Arc::new(SecureStorage::new(config.credentials_dir())),
            api,
            queue,
            observer,
        };
        Ok(Self::new(config, parts))
    }

    /// Spawn the probe, sync, heartbeat and renewal tasks. Calling it
    /// again while running does nothing.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if !tasks.is_empty() {
            debug!("Presence service already started");
            return;
        }

        tasks.push(tokio::spawn(
            self.presence
                .clone()
                .run(self.config.probe_interval(), self.cancel.child_token()),
        ));
        tasks.push(tokio::spawn(
            self.heartbeat
                .clone()
                .run_sync(self.config.sync_interval(), self.cancel.child_token()),
        ));
        tasks.push(tokio::spawn(
            self.heartbeat
                .clone()
                .run(self.config.heartbeat_interval(), self.cancel.child_token()),
        ));
        tasks.push(tokio::spawn(
            self.tokens
                .clone()
                .run_renewal(self.config.renewal_interval(), self.cancel.child_token()),
        ));

        info!("Presence service started, watching for {}", self.config.target_ssid);
    }

    /// Log in and register this device with the current network
    pub async fn login(&self, email: &str, password: &str) -> Result<SessionToken, Error> {
        let ssid = match tokio::time::timeout(self.config.probe_timeout(), self.probe.current_network_id()).await {
            Ok(Ok(Some(ssid))) => ssid,
            _ => "Unknown".to_string(),
        };

        let request = LoginRequest {
            email: email.trim().to_string(),
            password: password.to_string(),
            mac_address: self.identity.hardware_address(),
            ssid,
        };
        self.tokens.login(request).await
    }

    pub async fn logout(&self) -> Result<(), Error> {
        self.tokens.logout().await
    }

    /// Re-emit a connect for the current session
    pub fn force_reconnect(&self) -> Option<i64> {
        self.presence.force_reconnect(Utc::now())
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            target_network: self.config.target_ssid.clone(),
            connection: self.presence.connection_state(),
            mode: self.tokens.mode(),
            authenticated: self.tokens.is_authenticated(),
            email: self.tokens.email(),
            token_expires_at: self.tokens.expires_at(),
            pending_events: self.sync.pending_count(),
        }
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub fn presence(&self) -> &Arc<PresenceStateMachine> {
        &self.presence
    }

    pub fn sync(&self) -> &Arc<SyncEngine> {
        &self.sync
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatEngine> {
        &self.heartbeat
    }

    /// Stop the tasks, close the session and make one bounded attempt to
    /// deliver what is left. The whole sequence shares one grace period.
    pub async fn shutdown(&self) {
        info!("Shutting down presence service");
        self.cancel.cancel();

        let deadline = Instant::now() + self.config.shutdown_grace();
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for mut handle in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!("Background task did not stop before the shutdown deadline, aborting");
                handle.abort();
            }
        }

        self.presence.shutdown_disconnect(Utc::now());

        if let Some(report) = self.sync.flush(deadline).await {
            debug!("Shutdown flush: {:?}", report);
        }

        if self.config.logout_on_exit && self.tokens.is_authenticated() {
            match tokio::time::timeout_at(deadline, self.tokens.logout()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Logout on exit failed: {}", e),
                Err(_) => warn!("Logout on exit timed out"),
            }
        }

        info!("Presence service stopped");
    }
}
