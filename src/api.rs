//! Remote API Module
//!
//! HTTP communication with the attendance service.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::TransportError;
use crate::model::{EventKind, PresenceEvent};

/// Remote attendance service
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn login(&self, request: &LoginRequest) -> Result<TokenGrant, ApiError>;

    async fn logout(&self, access_token: &str) -> Result<(), ApiError>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, ApiError>;

    async fn track(&self, access_token: &str, payload: &TrackPayload)
        -> Result<TrackAck, ApiError>;

    /// Cheap reachability check used to leave offline mode
    async fn health_check(&self) -> Result<(), ApiError>;
}

/// reqwest-backed client
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn post<B, T>(&self, path: &str, bearer: Option<&str>, body: Option<&B>) -> Result<Option<T>, ApiError>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let url = self.url(path);
        debug!("POST {}", url);

        let mut request = self.client.post(&url);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;

        read_response(status, &body)
    }
}

#[async_trait]
impl RemoteApi for ApiClient {
    async fn login(&self, request: &LoginRequest) -> Result<TokenGrant, ApiError> {
        let grant = self
            .post::<_, TokenGrant>("login", None, Some(request))
            .await
            .map_err(|e| match e {
                ApiError::Unauthorized(message) => ApiError::InvalidCredentials(message),
                other => other,
            })?
            .ok_or_else(|| ApiError::Transport(TransportError::Parse("login response without data".into())))?;

        info!("Login accepted for {}", request.email);
        Ok(grant)
    }

    async fn logout(&self, access_token: &str) -> Result<(), ApiError> {
        self.post::<(), serde_json::Value>("logout", Some(access_token), None)
            .await?;
        info!("Logged out on server");
        Ok(())
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, ApiError> {
        let body = RefreshRequest { refresh_token };
        self.post::<_, TokenGrant>("refresh-token", None, Some(&body))
            .await
            .map_err(|e| match e {
                ApiError::Unauthorized(_) | ApiError::Rejected(_) => ApiError::InvalidRefreshToken,
                other => other,
            })?
            .ok_or_else(|| ApiError::Transport(TransportError::Parse("refresh response without data".into())))
    }

    async fn track(&self, access_token: &str, payload: &TrackPayload) -> Result<TrackAck, ApiError> {
        let ack = self
            .post::<_, TrackAck>("track-connection", Some(access_token), Some(payload))
            .await?
            .unwrap_or_default();
        Ok(ack)
    }

    async fn health_check(&self) -> Result<(), ApiError> {
        let response = self
            .client
            .get(&self.base_url)
            .send()
            .await
            .map_err(transport_error)?;

        if response.status().is_server_error() {
            return Err(server_error(response.status()));
        }
        Ok(())
    }
}

fn transport_error(e: reqwest::Error) -> ApiError {
    if e.is_timeout() {
        ApiError::Transport(TransportError::Timeout)
    } else {
        ApiError::Transport(TransportError::Network(e.to_string()))
    }
}

/// `{success, message, data}` wrapper used by every endpoint
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

/// Maps a status and raw body to the error classes the agent acts on.
///
/// Only a parsed envelope can reject: `success: false` on 2xx, or a 400/422
/// validation answer. Anything the agent cannot read (HTML from a captive
/// portal, an empty body, 404, 408, 429, 5xx) is transport-class, so the
/// event stays pending and is retried.
fn read_response<T: DeserializeOwned>(status: StatusCode, body: &str) -> Result<Option<T>, ApiError> {
    if status.is_server_error() {
        return Err(server_error(status));
    }

    let envelope = serde_json::from_str::<Envelope>(body);
    let reason = || status.canonical_reason().unwrap_or("Unknown error").to_string();

    if status == StatusCode::UNAUTHORIZED {
        let message = envelope.ok().and_then(|e| e.message).unwrap_or_else(reason);
        return Err(ApiError::Unauthorized(message));
    }

    let rejectable = status.is_success()
        || status == StatusCode::BAD_REQUEST
        || status == StatusCode::UNPROCESSABLE_ENTITY;
    if !rejectable {
        return Err(server_error(status));
    }

    let envelope = match envelope {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!("Unreadable response body ({}): {}", status, e);
            return Err(ApiError::Transport(TransportError::Parse(format!(
                "unexpected response body ({status}): {e}"
            ))));
        }
    };

    if !status.is_success() || !envelope.success {
        return Err(ApiError::Rejected(envelope.message.unwrap_or_else(reason)));
    }

    envelope
        .data
        .filter(|v| !v.is_null())
        .map(|v| serde_json::from_value(v).map_err(|e| ApiError::Transport(TransportError::Parse(e.to_string()))))
        .transpose()
}

fn server_error(status: StatusCode) -> ApiError {
    ApiError::Transport(TransportError::Server {
        status: status.as_u16(),
    })
}

// Request/Response types

#[derive(Serialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    #[serde(rename = "macAddress")]
    pub mac_address: String,
    pub ssid: String,
}

// Password stays out of logs.
impl std::fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginRequest")
            .field("email", &self.email)
            .field("mac_address", &self.mac_address)
            .field("ssid", &self.ssid)
            .finish()
    }
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub email: Option<String>,
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("expires_in", &self.expires_in)
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackAck {
    #[serde(default)]
    pub record_id: Option<serde_json::Value>,
    #[serde(default)]
    pub duration: Option<String>,
}

/// Body of `POST /track-connection`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackPayload {
    pub event_id: i64,
    pub event_type: EventKind,
    pub ssid: String,
    pub email: String,
    pub ip_address: String,
    pub mac_address: String,
    pub computer_name: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_start_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_start_time_formatted: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_duration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_duration_formatted: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_time_formatted: Option<String>,
}

impl TrackPayload {
    pub fn from_event(event: &PresenceEvent, email: &str) -> Self {
        let is_heartbeat = event.kind == EventKind::Heartbeat;

        Self {
            event_id: event.id,
            event_type: event.kind,
            ssid: event.network_id.clone(),
            email: email.to_string(),
            ip_address: event.identity.ip_address.clone(),
            mac_address: event.identity.mac_address.clone(),
            computer_name: event.identity.host_name.clone(),
            timestamp: event.occurred_at.timestamp(),
            connection_start_time: event.connect_since.map(|t| t.timestamp()),
            connection_start_time_formatted: event.connect_since.map(format_local),
            connection_duration: event.duration_seconds,
            connection_duration_formatted: event.duration_seconds.map(format_duration),
            heartbeat_time: is_heartbeat.then(|| event.occurred_at.timestamp()),
            heartbeat_time_formatted: is_heartbeat.then(|| format_local(event.occurred_at)),
        }
    }
}

fn format_local(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

/// `HH:MM:SS`, hours not wrapped at 24
pub fn format_duration(seconds: i64) -> String {
    let seconds = seconds.max(0);
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

/// API errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Invalid refresh token")]
    InvalidRefreshToken,

    #[error("Rejected by server: {0}")]
    Rejected(String),
}

impl ApiError {
    pub fn is_transport(&self) -> bool {
        matches!(self, ApiError::Transport(_))
    }

    /// Server says it holds no active session for this device
    pub fn is_session_missing(&self) -> bool {
        matches!(self, ApiError::Rejected(message) if message.to_lowercase().contains("no active session"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceIdentity, SyncState};
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn read<T: DeserializeOwned>(status: StatusCode, body: serde_json::Value) -> Result<Option<T>, ApiError> {
        read_response(status, &body.to_string())
    }

    #[test]
    fn success_envelope_yields_data() {
        let result: Option<TokenGrant> = read(
            StatusCode::OK,
            json!({
                "success": true,
                "message": "Login successful",
                "data": {"accessToken": "a", "refreshToken": "r", "expiresIn": 3600}
            }),
        )
        .unwrap();

        let grant = result.unwrap();
        assert_eq!(grant.access_token, "a");
        assert_eq!(grant.refresh_token.as_deref(), Some("r"));
        assert_eq!(grant.expires_in, Some(3600));
    }

    #[test]
    fn logical_failure_is_rejected_with_message() {
        let err = read::<TokenGrant>(
            StatusCode::OK,
            json!({"success": false, "message": "User already registered with a different device"}),
        )
        .unwrap_err();
        assert!(matches!(err, ApiError::Rejected(ref m) if m.contains("already registered")));
    }

    #[test]
    fn status_codes_map_to_error_classes() {
        let unauthorized = read_response::<TrackAck>(StatusCode::UNAUTHORIZED, "");
        assert!(matches!(unauthorized, Err(ApiError::Unauthorized(_))));

        let server = read_response::<TrackAck>(StatusCode::BAD_GATEWAY, "");
        assert!(matches!(server, Err(ref e) if e.is_transport()));

        let missing = read::<TrackAck>(
            StatusCode::BAD_REQUEST,
            json!({"success": false, "message": "No active session found for this device"}),
        )
        .unwrap_err();
        assert!(missing.is_session_missing());

        let invalid = read::<TrackAck>(StatusCode::UNPROCESSABLE_ENTITY, json!({"success": false}));
        assert!(matches!(invalid, Err(ApiError::Rejected(_))));
    }

    #[test]
    fn unreadable_or_unexpected_answers_are_transport_errors() {
        let portal = read_response::<TrackAck>(StatusCode::OK, "<html><body>Sign in to Wi-Fi</body></html>");
        assert!(matches!(portal, Err(ApiError::Transport(TransportError::Parse(_)))));

        let empty = read_response::<TrackAck>(StatusCode::OK, "");
        assert!(matches!(empty, Err(ref e) if e.is_transport()));

        let unreadable_validation = read_response::<TrackAck>(StatusCode::BAD_REQUEST, "Bad Request");
        assert!(matches!(unreadable_validation, Err(ref e) if e.is_transport()));

        for status in [
            StatusCode::FORBIDDEN,
            StatusCode::NOT_FOUND,
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::TOO_MANY_REQUESTS,
        ] {
            let result = read::<TrackAck>(status, json!({"success": false, "message": "slow down"}));
            assert!(
                matches!(result, Err(ApiError::Transport(TransportError::Server { status: s })) if s == status.as_u16()),
                "{status} should be retried"
            );
        }
    }

    #[test]
    fn disconnect_payload_carries_duration() {
        let since = Utc::now();
        let event = PresenceEvent {
            id: 7,
            kind: EventKind::Disconnect,
            network_id: "OfficeNet".into(),
            identity: DeviceIdentity {
                host_name: "desk-01".into(),
                mac_address: "aa:bb:cc:dd:ee:ff".into(),
                ip_address: "10.0.0.5".into(),
            },
            occurred_at: since + ChronoDuration::seconds(3725),
            connect_since: Some(since),
            duration_seconds: Some(3725),
            sync_state: SyncState::Pending,
        };

        let payload = TrackPayload::from_event(&event, "dev@example.com");
        let body = serde_json::to_value(&payload).unwrap();

        assert_eq!(body["event_type"], "disconnect");
        assert_eq!(body["event_id"], 7);
        assert_eq!(body["connection_duration"], 3725);
        assert_eq!(body["connection_duration_formatted"], "01:02:05");
        assert_eq!(body["computer_name"], "desk-01");
        assert!(body.get("heartbeat_time").is_none());
    }

    #[test]
    fn duration_format_does_not_wrap_days() {
        assert_eq!(format_duration(0), "00:00:00");
        assert_eq!(format_duration(90_061), "25:01:01");
        assert_eq!(format_duration(-5), "00:00:00");
    }
}
