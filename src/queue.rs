//! Durable Event Queue
//!
//! SQLite-backed append-only store of presence events plus the
//! connection-state checkpoint. Every append is committed before it
//! returns; all writes go through a single connection guarded by a mutex.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use crate::error::StorageError;
use crate::model::{
    ConnectionState, DeviceIdentity, EventKind, NewEvent, PresenceEvent, SyncState,
};

const BUSY_TIMEOUT_MS: u64 = 5_000;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS presence_events (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    kind             TEXT    NOT NULL,
    network_id       TEXT    NOT NULL,
    host_name        TEXT    NOT NULL,
    mac_address      TEXT    NOT NULL,
    ip_address       TEXT    NOT NULL,
    occurred_at      INTEGER NOT NULL,
    connect_since    INTEGER,
    duration_seconds INTEGER,
    synced           INTEGER NOT NULL DEFAULT 0,
    synced_at        INTEGER
);
CREATE INDEX IF NOT EXISTS idx_presence_events_pending
    ON presence_events (synced, id);
CREATE TABLE IF NOT EXISTS connection_state (
    id            INTEGER PRIMARY KEY CHECK (id = 1),
    is_connected  INTEGER NOT NULL,
    network_id    TEXT,
    connect_since INTEGER,
    updated_at    INTEGER NOT NULL
);
";

const EVENT_COLUMNS: &str = "id, kind, network_id, host_name, mac_address, ip_address, \
     occurred_at, connect_since, duration_seconds, synced";

pub struct EventQueue {
    conn: Mutex<Connection>,
}

impl EventQueue {
    /// Open (or create) the queue database at `path`
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Io(e.to_string()))?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;

        let queue = Self::init(conn)?;
        info!("Event queue opened at {:?}", path);
        Ok(queue)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Io("event queue lock poisoned".into()))
    }

    /// Persist `event` and return its id. Ids are never reused.
    pub fn append(&self, event: &NewEvent) -> Result<i64, StorageError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO presence_events (kind, network_id, host_name, mac_address, ip_address, \
             occurred_at, connect_since, duration_seconds, synced) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)",
            params![
                event.kind.as_str(),
                event.network_id,
                event.identity.host_name,
                event.identity.mac_address,
                event.identity.ip_address,
                event.occurred_at.timestamp_millis(),
                event.connect_since.map(|t| t.timestamp_millis()),
                event.duration_seconds,
            ],
        )?;
        let id = conn.last_insert_rowid();

        debug!(event_id = id, kind = %event.kind, network = %event.network_id, "Event queued");
        Ok(id)
    }

    /// Unsynced events in insertion order
    pub fn list_pending(&self) -> Result<Vec<PresenceEvent>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM presence_events WHERE synced = 0 ORDER BY id ASC"
        ))?;
        let events = stmt
            .query_map([], event_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    pub fn get(&self, id: i64) -> Result<Option<PresenceEvent>, StorageError> {
        let conn = self.lock()?;
        let event = conn
            .query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM presence_events WHERE id = ?1"),
                params![id],
                event_from_row,
            )
            .optional()?;
        Ok(event)
    }

    /// Mark `id` synced. Marking an already-synced or unknown id is a no-op;
    /// returns whether a row changed.
    pub fn mark_synced(&self, id: i64) -> Result<bool, StorageError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE presence_events SET synced = 1, synced_at = ?1 WHERE id = ?2 AND synced = 0",
            params![Utc::now().timestamp_millis(), id],
        )?;
        Ok(changed > 0)
    }

    pub fn pending_count(&self) -> Result<u64, StorageError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM presence_events WHERE synced = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Replace the connection-state checkpoint
    pub fn save_connection_state(&self, state: &ConnectionState) -> Result<(), StorageError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO connection_state (id, is_connected, network_id, connect_since, updated_at) \
             VALUES (1, ?1, ?2, ?3, ?4) \
             ON CONFLICT(id) DO UPDATE SET is_connected = excluded.is_connected, \
             network_id = excluded.network_id, connect_since = excluded.connect_since, \
             updated_at = excluded.updated_at",
            params![
                state.is_connected_to_target,
                state.network_id,
                state.connect_since.map(|t| t.timestamp_millis()),
                Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Last checkpoint, default (not connected) when none was written
    pub fn load_connection_state(&self) -> Result<ConnectionState, StorageError> {
        let conn = self.lock()?;
        let state = conn
            .query_row(
                "SELECT is_connected, network_id, connect_since FROM connection_state WHERE id = 1",
                [],
                |row| {
                    Ok(ConnectionState {
                        is_connected_to_target: row.get(0)?,
                        network_id: row.get(1)?,
                        connect_since: row.get::<_, Option<i64>>(2)?.and_then(from_millis),
                    })
                },
            )
            .optional()?;

        Ok(match state {
            // A checkpoint claiming a connection without a start time is unusable
            Some(s) if s.is_connected_to_target && s.connect_since.is_none() => {
                ConnectionState::not_connected(s.network_id)
            }
            Some(s) => s,
            None => ConnectionState::default(),
        })
    }
}

fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<PresenceEvent> {
    let kind: String = row.get(1)?;
    let kind = kind.parse::<EventKind>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })?;
    let occurred_at: i64 = row.get(6)?;
    let synced: bool = row.get(9)?;

    Ok(PresenceEvent {
        id: row.get(0)?,
        kind,
        network_id: row.get(2)?,
        identity: DeviceIdentity {
            host_name: row.get(3)?,
            mac_address: row.get(4)?,
            ip_address: row.get(5)?,
        },
        occurred_at: from_millis(occurred_at).unwrap_or_default(),
        connect_since: row.get::<_, Option<i64>>(7)?.and_then(from_millis),
        duration_seconds: row.get(8)?,
        sync_state: if synced { SyncState::Synced } else { SyncState::Pending },
    })
}
