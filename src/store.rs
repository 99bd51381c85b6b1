use std::path::Path;
use std::sync::{Arc, Mutex};

use log::debug;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::ScanError;
use crate::session::PersistedScanRecord;

/// Well-known key of the single in-flight scan slot
pub const ACTIVE_SCAN_SLOT: &str = "active_scan";

const CREATE_SCAN_STATE_SQL: &str = "
    CREATE TABLE IF NOT EXISTS scan_state (
        slot TEXT PRIMARY KEY,
        record TEXT NOT NULL,
        saved_at INTEGER NOT NULL
    );";

/// Durable slot holding at most one in-flight scan record.
///
/// `save` overwrites whatever the slot held before (last writer wins),
/// `load` returns the slot's content, `clear` empties it.
pub trait ScanStateStore: Send {
    fn save(&self, record: &PersistedScanRecord) -> Result<(), ScanError>;
    fn load(&self) -> Result<Option<PersistedScanRecord>, ScanError>;
    fn clear(&self) -> Result<(), ScanError>;
}

/// SQLite-backed store. Survives process restarts.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(db_path: &Path) -> Result<Self, ScanError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        debug!("Scan state database opened at: {}", db_path.display());
        Self::with_connection(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, ScanError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, ScanError> {
        conn.execute_batch(CREATE_SCAN_STATE_SQL)?;
        Ok(Self { conn })
    }
}

impl ScanStateStore for SqliteStore {
    fn save(&self, record: &PersistedScanRecord) -> Result<(), ScanError> {
        let json = serde_json::to_string(record)?;
        self.conn.execute(
            "INSERT INTO scan_state (slot, record, saved_at) VALUES (?1, ?2, strftime('%s', 'now'))
             ON CONFLICT(slot) DO UPDATE SET record = excluded.record, saved_at = excluded.saved_at",
            params![ACTIVE_SCAN_SLOT, json],
        )?;
        Ok(())
    }

    fn load(&self) -> Result<Option<PersistedScanRecord>, ScanError> {
        let row: Option<(String, i64)> = self
            .conn
            .query_row(
                "SELECT record, saved_at FROM scan_state WHERE slot = ?1",
                [ACTIVE_SCAN_SLOT],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((json, saved_at)) => {
                debug!("Loaded scan state saved at {} (unix seconds)", saved_at);
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    fn clear(&self) -> Result<(), ScanError> {
        self.conn
            .execute("DELETE FROM scan_state WHERE slot = ?1", [ACTIVE_SCAN_SLOT])?;
        Ok(())
    }
}

/// In-process store. Clones share the same slot, which lets tests hand the
/// slot from one orchestrator to the next the way a reload would.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    slot: Arc<Mutex<Option<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ScanStateStore for MemoryStore {
    fn save(&self, record: &PersistedScanRecord) -> Result<(), ScanError> {
        let json = serde_json::to_string(record)?;
        *self.lock_slot()? = Some(json);
        Ok(())
    }

    fn load(&self) -> Result<Option<PersistedScanRecord>, ScanError> {
        match self.lock_slot()?.as_deref() {
            Some(json) => Ok(Some(serde_json::from_str(json)?)),
            None => Ok(None),
        }
    }

    fn clear(&self) -> Result<(), ScanError> {
        *self.lock_slot()? = None;
        Ok(())
    }
}

impl MemoryStore {
    /// Put raw text in the slot, bypassing serialization
    #[cfg(test)]
    pub fn put_raw(&self, json: &str) {
        *self.slot.lock().unwrap() = Some(json.to_string());
    }

    fn lock_slot(&self) -> Result<std::sync::MutexGuard<'_, Option<String>>, ScanError> {
        self.slot
            .lock()
            .map_err(|_| ScanError::Error("Scan state slot lock poisoned".into()))
    }
}
