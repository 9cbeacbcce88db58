//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! The ledger and aggregator call store methods; they never execute SQL directly.

use crate::{
    error::{PayoutError, PayoutResult},
    event::{EventLogEntry, PayoutEvent},
    ledger::ObligationStatus,
};
use chrono::{DateTime, Utc};
use rusqlite::{
    params,
    types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef},
    Connection,
};

mod obligation;
mod statistics;

pub struct PayoutStore {
    conn: Connection,
    /// Path or URI this store was opened from; private in-memory stores have none.
    location: Option<String>,
}

impl PayoutStore {
    /// Open a database file or SQLite URI (e.g. a shared-cache memory URI).
    pub fn open(location: &str) -> PayoutResult<Self> {
        use rusqlite::OpenFlags;
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI;
        let conn = Connection::open_with_flags(location, flags)?;
        // Memory databases answer "memory" instead of switching to WAL.
        let _: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        Self::configure(&conn)?;
        Ok(Self {
            conn,
            location: Some(location.to_string()),
        })
    }

    /// A private in-memory database, visible to this connection only.
    pub fn in_memory() -> PayoutResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        Ok(Self { conn, location: None })
    }

    fn configure(conn: &Connection) -> PayoutResult<()> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(())
    }

    /// A second connection to the same database. Private in-memory
    /// stores cannot be shared and are rejected.
    pub fn reopen(&self) -> PayoutResult<Self> {
        let location = self.location.as_deref().ok_or_else(|| {
            PayoutError::InvalidConfig("a private in-memory store cannot be reopened".into())
        })?;
        Self::open(location)
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> PayoutResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_ledger.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_outcome_stats.sql"))?;
        Ok(())
    }

    // ── Event log ──────────────────────────────────────────────

    pub fn events_for_obligation(&self, obligation_id: &str) -> PayoutResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, obligation_id, event_type, payload, created_at
             FROM payout_event WHERE obligation_id = ?1
             ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![obligation_id], |row| {
                Ok(EventLogEntry {
                    id: Some(row.get(0)?),
                    obligation_id: row.get(1)?,
                    event_type: row.get(2)?,
                    payload: row.get(3)?,
                    created_at: from_millis(row.get(4)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

/// Append one audit event. Takes a bare connection so callers can run it
/// inside the transaction that performs the transition.
fn append_event(conn: &Connection, event: &PayoutEvent, at: DateTime<Utc>) -> PayoutResult<()> {
    conn.execute(
        "INSERT INTO payout_event (obligation_id, event_type, payload, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            event.obligation_id(),
            event.type_name(),
            serde_json::to_string(event)?,
            to_millis(at),
        ],
    )?;
    Ok(())
}

// ── Column encodings ───────────────────────────────────────────

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

impl ToSql for ObligationStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ObligationStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: crate::error::PayoutError| FromSqlError::Other(Box::new(e)))
    }
}
