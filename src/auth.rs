//! Authentication Module
//!
//! Owns the session token: login/logout, proactive renewal, the
//! single-refresh rule for rejected access tokens, and the online/offline
//! mode every other component checks before touching the network.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{ApiError, LoginRequest, RemoteApi, TokenGrant};
use crate::error::{AuthError, Error, StorageError};
use crate::model::{SessionToken, SyncMode};
use crate::service::PresenceObserver;
use crate::storage::CredentialStore;

/// Manages authentication state
pub struct TokenManager {
    api: Arc<dyn RemoteApi>,
    store: Arc<dyn CredentialStore>,
    observer: Arc<dyn PresenceObserver>,
    session: RwLock<Option<SessionToken>>,
    offline: AtomicBool,
    /// Serializes every refresh so concurrent 401s cannot each trigger one
    refresh_lock: tokio::sync::Mutex<()>,
    refresh_margin: chrono::Duration,
    default_lifetime_secs: i64,
}

impl TokenManager {
    pub fn new(
        api: Arc<dyn RemoteApi>,
        store: Arc<dyn CredentialStore>,
        observer: Arc<dyn PresenceObserver>,
        refresh_margin_secs: i64,
        default_lifetime_secs: i64,
    ) -> Self {
        Self {
            api,
            store,
            observer,
            session: RwLock::new(None),
            offline: AtomicBool::new(false),
            refresh_lock: tokio::sync::Mutex::new(()),
            refresh_margin: chrono::Duration::seconds(refresh_margin_secs),
            default_lifetime_secs,
        }
    }

    /// Load a previously stored session. Expired tokens are kept; the
    /// renewal task refreshes them.
    pub fn restore(&self) -> Result<bool, StorageError> {
        match self.store.get()? {
            Some(token) => {
                if token.is_expired() {
                    info!("Stored session is expired, will try to refresh");
                }
                info!("Restored session for {}", token.email);
                self.install(Some(token));
                Ok(true)
            }
            None => {
                debug!("No stored session found");
                Ok(false)
            }
        }
    }

    pub async fn login(&self, request: LoginRequest) -> Result<SessionToken, Error> {
        let _guard = self.refresh_lock.lock().await;

        let grant = match self.api.login(&request).await {
            Ok(grant) => grant,
            Err(e) => {
                warn!("Login failed: {}", e);
                return Err(self.login_error(e));
            }
        };

        self.set_mode(SyncMode::Online);
        let token = self.token_from_grant(grant, None, &request.email);
        self.persist(&token);
        self.install(Some(token.clone()));

        info!("User {} logged in", token.email);
        Ok(token)
    }

    fn login_error(&self, e: ApiError) -> Error {
        match e {
            ApiError::Transport(t) => {
                self.set_mode(SyncMode::Offline);
                Error::Transport(t)
            }
            ApiError::InvalidCredentials(m) | ApiError::Unauthorized(m) => {
                AuthError::InvalidCredentials(m).into()
            }
            ApiError::Rejected(m) => AuthError::Rejected(m).into(),
            ApiError::InvalidRefreshToken => AuthError::InvalidRefreshToken.into(),
        }
    }

    /// Log out on the server (best effort) and forget the session locally
    pub async fn logout(&self) -> Result<(), Error> {
        let _guard = self.refresh_lock.lock().await;

        let token = self.snapshot();
        if let Some(token) = &token {
            if self.mode() == SyncMode::Online {
                match self.api.logout(&token.access_token).await {
                    Ok(()) => {}
                    Err(e) if e.is_transport() => {
                        warn!("Logout request failed, clearing local session anyway: {}", e);
                        self.set_mode(SyncMode::Offline);
                    }
                    Err(e) => warn!("Server refused logout: {}", e),
                }
            } else {
                info!("Offline, skipping server logout");
            }
        }

        self.install(None);
        self.store.clear()?;
        info!("Logged out locally");
        Ok(())
    }

    /// Current access token, if logged in
    pub fn current_access_token(&self) -> Result<String, AuthError> {
        self.read()
            .as_ref()
            .map(|t| t.access_token.clone())
            .ok_or(AuthError::Unauthenticated)
    }

    pub fn email(&self) -> Option<String> {
        self.read().as_ref().map(|t| t.email.clone())
    }

    pub fn is_authenticated(&self) -> bool {
        self.read().is_some()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.read().as_ref().map(|t| t.expires_at)
    }

    pub fn mode(&self) -> SyncMode {
        if self.offline.load(Ordering::SeqCst) {
            SyncMode::Offline
        } else {
            SyncMode::Online
        }
    }

    pub fn set_mode(&self, mode: SyncMode) {
        let offline = mode == SyncMode::Offline;
        let previous = self.offline.swap(offline, Ordering::SeqCst);
        if previous != offline {
            info!("Sync mode changed to {}", mode);
            self.observer.on_sync_status_changed(mode);
        }
    }

    /// Refresh when the access token expires within the margin.
    /// Returns whether a refresh happened.
    pub async fn refresh_if_needed(&self, now: DateTime<Utc>) -> Result<bool, Error> {
        let _guard = self.refresh_lock.lock().await;

        let Some(token) = self.snapshot() else {
            return Ok(false);
        };
        if token.expires_at - now >= self.refresh_margin {
            return Ok(false);
        }
        if token.refresh_token.is_none() {
            debug!("Access token nearing expiry but no refresh token is held");
            return Ok(false);
        }

        info!("Access token expires in {}s, refreshing", token.seconds_left(now));
        self.refresh_locked(&token).await.map(|_| true)
    }

    /// Called after the server rejected `stale_access`. At most one refresh
    /// happens per stale token: if another caller already replaced it, the
    /// replacement is returned without contacting the server.
    pub async fn refresh_after_unauthorized(&self, stale_access: &str) -> Result<String, Error> {
        let _guard = self.refresh_lock.lock().await;

        let token = self.snapshot().ok_or(AuthError::Unauthenticated)?;
        if token.access_token != stale_access {
            debug!("Access token already refreshed by another caller");
            return Ok(token.access_token);
        }
        if token.refresh_token.is_none() {
            return Err(AuthError::Unauthorized.into());
        }

        warn!("Access token rejected, refreshing once");
        self.refresh_locked(&token)
            .await
            .map(|fresh| fresh.access_token)
    }

    /// Must be called with `refresh_lock` held
    async fn refresh_locked(&self, token: &SessionToken) -> Result<SessionToken, Error> {
        let refresh_token = token
            .refresh_token
            .as_deref()
            .ok_or(AuthError::Unauthorized)?;

        match self.api.refresh(refresh_token).await {
            Ok(grant) => {
                let fresh = self.token_from_grant(grant, token.refresh_token.clone(), &token.email);
                self.persist(&fresh);
                self.install(Some(fresh.clone()));
                self.set_mode(SyncMode::Online);
                info!("Token refreshed, valid until {}", fresh.expires_at);
                Ok(fresh)
            }
            Err(ApiError::Transport(t)) => {
                warn!("Token refresh failed, keeping current token: {}", t);
                self.set_mode(SyncMode::Offline);
                Err(Error::Transport(t))
            }
            Err(e) => {
                error!("Refresh token rejected ({}), session terminated", e);
                self.install(None);
                if let Err(se) = self.store.clear() {
                    error!("Failed to clear stored credentials: {}", se);
                }
                self.observer.on_session_expired();
                Err(AuthError::InvalidRefreshToken.into())
            }
        }
    }

    /// Adopt a session stored by another process, such as the `login`
    /// command, while none is held. Returns whether a session is held.
    pub async fn reload_if_signed_out(&self) -> bool {
        if self.is_authenticated() {
            return true;
        }
        // Logout and session termination clear the store under this lock.
        let _guard = self.refresh_lock.lock().await;
        if self.is_authenticated() {
            return true;
        }

        match self.restore() {
            Ok(found) => found,
            Err(e) => {
                warn!("Failed to read stored session: {}", e);
                false
            }
        }
    }

    /// One renewal pass: adopt a newly stored session, leave offline mode
    /// if the server answers again, then refresh when close to expiry.
    pub async fn renewal_cycle(&self, now: DateTime<Utc>) {
        self.reload_if_signed_out().await;

        if self.mode() == SyncMode::Offline {
            match self.api.health_check().await {
                Ok(()) => self.set_mode(SyncMode::Online),
                Err(e) => {
                    debug!("Server still unreachable: {}", e);
                    return;
                }
            }
        }

        if let Err(e) = self.refresh_if_needed(now).await {
            warn!("Token renewal failed: {}", e);
        }
    }

    /// Periodic renewal until `cancel` fires
    pub async fn run_renewal(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            // Dropping a refresh in flight leaves the current token in place.
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.renewal_cycle(Utc::now()) => {}
            }
        }

        debug!("Token renewal task stopped");
    }

    fn token_from_grant(
        &self,
        grant: TokenGrant,
        previous_refresh: Option<String>,
        email: &str,
    ) -> SessionToken {
        let lifetime = grant
            .expires_in
            .filter(|secs| *secs > 0)
            .unwrap_or(self.default_lifetime_secs);

        SessionToken {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token.or(previous_refresh),
            expires_at: Utc::now() + chrono::Duration::seconds(lifetime),
            email: grant.email.unwrap_or_else(|| email.to_string()),
        }
    }

    // A token that could not be persisted still works for this run.
    fn persist(&self, token: &SessionToken) {
        if let Err(e) = self.store.set(token) {
            error!("Failed to save session: {}", e);
        }
    }

    fn install(&self, token: Option<SessionToken>) {
        let mut guard = self.session.write().unwrap_or_else(|e| e.into_inner());
        *guard = token;
    }

    fn snapshot(&self) -> Option<SessionToken> {
        self.read().clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Option<SessionToken>> {
        self.session.read().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::service::NoopObserver;
    use crate::storage::MemoryCredentialStore;
    use crate::test_support::{FakeApi, RecordingObserver};

    fn token(expires_in: i64) -> SessionToken {
        SessionToken {
            access_token: "access-1".into(),
            refresh_token: Some("refresh-1".into()),
            expires_at: Utc::now() + chrono::Duration::seconds(expires_in),
            email: "dev@example.com".into(),
        }
    }

    fn manager(api: Arc<FakeApi>, store: Arc<MemoryCredentialStore>) -> TokenManager {
        TokenManager::new(api, store, Arc::new(NoopObserver), 300, 3600)
    }

    fn login_request() -> LoginRequest {
        LoginRequest {
            email: "dev@example.com".into(),
            password: "hunter2".into(),
            mac_address: "aa:bb:cc:dd:ee:ff".into(),
            ssid: "OfficeNet".into(),
        }
    }

    #[tokio::test]
    async fn login_stores_token_pair() {
        let api = Arc::new(FakeApi::new());
        let store = Arc::new(MemoryCredentialStore::new());
        let tokens = manager(api.clone(), store.clone());

        let session = tokens.login(login_request()).await.unwrap();

        assert_eq!(session.email, "dev@example.com");
        assert_eq!(tokens.current_access_token().unwrap(), session.access_token);
        assert!(store.get().unwrap().is_some());
        assert_eq!(tokens.mode(), SyncMode::Online);
    }

    #[tokio::test]
    async fn invalid_credentials_surface_as_auth_error() {
        let api = Arc::new(FakeApi::new());
        api.fail_login(ApiError::InvalidCredentials("Invalid password".into()));
        let tokens = manager(api, Arc::new(MemoryCredentialStore::new()));

        let err = tokens.login(login_request()).await.unwrap_err();
        assert!(matches!(err, Error::Auth(AuthError::InvalidCredentials(_))));
        assert!(matches!(tokens.current_access_token(), Err(AuthError::Unauthenticated)));
    }

    #[tokio::test]
    async fn token_far_from_expiry_is_not_refreshed() {
        let api = Arc::new(FakeApi::new());
        let store = Arc::new(MemoryCredentialStore::with_token(token(3000)));
        let tokens = manager(api.clone(), store);
        tokens.restore().unwrap();

        assert!(!tokens.refresh_if_needed(Utc::now()).await.unwrap());
        assert_eq!(api.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn token_near_expiry_is_refreshed_once_per_cycle() {
        let api = Arc::new(FakeApi::new());
        let store = Arc::new(MemoryCredentialStore::with_token(token(200)));
        let tokens = manager(api.clone(), store.clone());
        tokens.restore().unwrap();

        tokens.renewal_cycle(Utc::now()).await;
        assert_eq!(api.refresh_calls(), 1);
        assert_ne!(tokens.current_access_token().unwrap(), "access-1");

        // The new token is an hour out, the next cycle leaves it alone
        tokens.renewal_cycle(Utc::now()).await;
        assert_eq!(api.refresh_calls(), 1);

        let stored = store.get().unwrap().unwrap();
        assert_eq!(stored.access_token, tokens.current_access_token().unwrap());
    }

    #[tokio::test]
    async fn transport_failure_keeps_token_and_goes_offline() {
        let api = Arc::new(FakeApi::new());
        api.fail_refresh(ApiError::Transport(TransportError::Timeout));
        let observer = Arc::new(RecordingObserver::default());
        let tokens = TokenManager::new(
            api.clone(),
            Arc::new(MemoryCredentialStore::with_token(token(100))),
            observer.clone(),
            300,
            3600,
        );
        tokens.restore().unwrap();

        assert!(tokens.refresh_if_needed(Utc::now()).await.is_err());
        assert_eq!(tokens.current_access_token().unwrap(), "access-1");
        assert_eq!(tokens.mode(), SyncMode::Offline);
        assert_eq!(observer.modes(), vec![SyncMode::Offline]);
    }

    #[tokio::test]
    async fn invalid_refresh_token_terminates_session() {
        let api = Arc::new(FakeApi::new());
        api.fail_refresh(ApiError::InvalidRefreshToken);
        let store = Arc::new(MemoryCredentialStore::with_token(token(100)));
        let observer = Arc::new(RecordingObserver::default());
        let tokens = TokenManager::new(api, store.clone(), observer.clone(), 300, 3600);
        tokens.restore().unwrap();

        let err = tokens.refresh_if_needed(Utc::now()).await.unwrap_err();
        assert!(matches!(err, Error::Auth(AuthError::InvalidRefreshToken)));
        assert!(!tokens.is_authenticated());
        assert!(store.get().unwrap().is_none());
        assert_eq!(observer.session_expired_count(), 1);
    }

    #[tokio::test]
    async fn stale_unauthorized_does_not_refresh_twice() {
        let api = Arc::new(FakeApi::new());
        let tokens = manager(api.clone(), Arc::new(MemoryCredentialStore::with_token(token(3000))));
        tokens.restore().unwrap();

        let first = tokens.refresh_after_unauthorized("access-1").await.unwrap();
        let second = tokens.refresh_after_unauthorized("access-1").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(api.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn offline_renewal_recovers_through_health_check() {
        let api = Arc::new(FakeApi::new());
        let tokens = manager(api.clone(), Arc::new(MemoryCredentialStore::with_token(token(3000))));
        tokens.restore().unwrap();
        tokens.set_mode(SyncMode::Offline);

        api.set_reachable(false);
        tokens.renewal_cycle(Utc::now()).await;
        assert_eq!(tokens.mode(), SyncMode::Offline);

        api.set_reachable(true);
        tokens.renewal_cycle(Utc::now()).await;
        assert_eq!(tokens.mode(), SyncMode::Online);
    }

    #[tokio::test]
    async fn renewal_adopts_a_session_stored_after_start() {
        let api = Arc::new(FakeApi::new());
        let store = Arc::new(MemoryCredentialStore::new());
        let tokens = manager(api.clone(), store.clone());
        assert!(!tokens.restore().unwrap());

        tokens.renewal_cycle(Utc::now()).await;
        assert!(!tokens.is_authenticated());

        // `office-presence login` ran in another process
        store.set(&token(3000)).unwrap();
        tokens.renewal_cycle(Utc::now()).await;

        assert!(tokens.is_authenticated());
        assert_eq!(tokens.current_access_token().unwrap(), "access-1");
        assert_eq!(api.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn logout_clears_local_session_even_when_offline() {
        let api = Arc::new(FakeApi::new());
        let store = Arc::new(MemoryCredentialStore::with_token(token(3000)));
        let tokens = manager(api.clone(), store.clone());
        tokens.restore().unwrap();
        tokens.set_mode(SyncMode::Offline);

        tokens.logout().await.unwrap();

        assert_eq!(api.logout_calls(), 0);
        assert!(!tokens.is_authenticated());
        assert!(store.get().unwrap().is_none());
    }
}
