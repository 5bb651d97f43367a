//! Domain Model
//!
//! Presence events, the session token and the connection checkpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of presence event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Connect,
    Disconnect,
    Heartbeat,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connect => "connect",
            EventKind::Disconnect => "disconnect",
            EventKind::Heartbeat => "heartbeat",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connect" => Ok(EventKind::Connect),
            "disconnect" => Ok(EventKind::Disconnect),
            "heartbeat" => Ok(EventKind::Heartbeat),
            other => Err(format!("unknown event kind: {other}")),
        }
    }
}

/// Identifiers of the reporting device, captured when an event is written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub host_name: String,
    pub mac_address: String,
    pub ip_address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Pending,
    Synced,
}

/// A presence event that has not been stored yet
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub kind: EventKind,
    pub network_id: String,
    pub identity: DeviceIdentity,
    pub occurred_at: DateTime<Utc>,
    /// Start of the session this event belongs to, if any
    pub connect_since: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
}

impl NewEvent {
    pub fn connect(network_id: &str, identity: DeviceIdentity, at: DateTime<Utc>) -> Self {
        Self {
            kind: EventKind::Connect,
            network_id: network_id.to_string(),
            identity,
            occurred_at: at,
            connect_since: Some(at),
            duration_seconds: None,
        }
    }

    /// Disconnect event; duration is 0 when the matching connect is unknown.
    pub fn disconnect(
        network_id: &str,
        identity: DeviceIdentity,
        at: DateTime<Utc>,
        connect_since: Option<DateTime<Utc>>,
    ) -> Self {
        let duration = connect_since
            .map(|since| (at - since).num_seconds().max(0))
            .unwrap_or(0);

        Self {
            kind: EventKind::Disconnect,
            network_id: network_id.to_string(),
            identity,
            occurred_at: at,
            connect_since,
            duration_seconds: Some(duration),
        }
    }

    pub fn heartbeat(
        network_id: &str,
        identity: DeviceIdentity,
        at: DateTime<Utc>,
        connect_since: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            kind: EventKind::Heartbeat,
            network_id: network_id.to_string(),
            identity,
            occurred_at: at,
            connect_since,
            duration_seconds: None,
        }
    }
}

/// A stored presence event
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEvent {
    pub id: i64,
    pub kind: EventKind,
    pub network_id: String,
    pub identity: DeviceIdentity,
    pub occurred_at: DateTime<Utc>,
    pub connect_since: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub sync_state: SyncState,
}

/// Whether the remote service is currently reachable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Online,
    Offline,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::Online => write!(f, "Online"),
            SyncMode::Offline => write!(f, "Offline"),
        }
    }
}

/// Access/refresh token pair, persisted through the credential store
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub email: String,
}

impl SessionToken {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Seconds left before expiry (negative once expired)
    pub fn seconds_left(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds()
    }
}

// Tokens stay out of logs.
impl std::fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionToken")
            .field("email", &self.email)
            .field("expires_at", &self.expires_at)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .finish()
    }
}

/// Current presence hypothesis, checkpointed on every change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ConnectionState {
    pub is_connected_to_target: bool,
    pub network_id: Option<String>,
    pub connect_since: Option<DateTime<Utc>>,
}

impl ConnectionState {
    pub fn connected(network_id: &str, since: DateTime<Utc>) -> Self {
        Self {
            is_connected_to_target: true,
            network_id: Some(network_id.to_string()),
            connect_since: Some(since),
        }
    }

    pub fn not_connected(network_id: Option<String>) -> Self {
        Self {
            is_connected_to_target: false,
            network_id,
            connect_since: None,
        }
    }
}

/// State of the presence state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceState {
    Unknown,
    Disconnected,
    ConnectedToTarget,
    ConnectedToOther,
}
