//! SQLite presence ledger.
//!
//! One `Ledger` wraps one connection. Every component that writes (the D-Bus
//! service, the tracking thread, another daemon instance on the same file)
//! opens its own, and all of them rely on SQLite for mutual exclusion:
//! write paths run in `BEGIN IMMEDIATE` transactions, and a partial unique
//! index allows at most one open record per person. The mutex below only
//! makes the connection shareable across threads.

mod queries;
mod transitions;
mod unknown;

pub use queries::{Page, RecordFilter};

use chrono::{DateTime, Utc};
use presence_core::{PersonKind, PersonRef, PresenceRecord, RecordId, UnknownId};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS people (
    person_kind TEXT    NOT NULL CHECK (person_kind IN ('STUDENT', 'TEACHER')),
    person_id   INTEGER NOT NULL,
    name        TEXT    NOT NULL DEFAULT '',
    PRIMARY KEY (person_kind, person_id)
);

CREATE TABLE IF NOT EXISTS presence_records (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    person_kind TEXT    NOT NULL CHECK (person_kind IN ('STUDENT', 'TEACHER')),
    person_id   INTEGER NOT NULL,
    zone_id     INTEGER,
    entry_time  INTEGER,
    exit_time   INTEGER,
    camera_id   INTEGER,
    CHECK (entry_time IS NOT NULL OR exit_time IS NOT NULL)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_presence_single_open
    ON presence_records(person_kind, person_id) WHERE exit_time IS NULL;
CREATE INDEX IF NOT EXISTS idx_presence_zone ON presence_records(zone_id, exit_time);
CREATE INDEX IF NOT EXISTS idx_presence_entry ON presence_records(entry_time);

CREATE TABLE IF NOT EXISTS unknown_detections (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    zone_id        INTEGER NOT NULL,
    captured_image BLOB    NOT NULL,
    confidence     REAL    NOT NULL DEFAULT 0,
    detected_time  INTEGER NOT NULL,
    status         TEXT    NOT NULL DEFAULT 'PENDING'
                   CHECK (status IN ('PENDING', 'IDENTIFIED', 'IGNORED')),
    notes          TEXT    NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS idx_unknown_detected ON unknown_detections(detected_time);
"#;

const RECORD_COLUMNS: &str =
    "id, person_kind, person_id, zone_id, entry_time, exit_time, camera_id";

/// What a `NotFound` error refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Missing {
    Person(PersonRef),
    Record(RecordId),
    UnknownDetection(UnknownId),
}

impl fmt::Display for Missing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Missing::Person(p) => write!(f, "person {p}"),
            Missing::Record(id) => write!(f, "presence record {id}"),
            Missing::UnknownDetection(id) => write!(f, "unknown detection {id}"),
        }
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("invalid {field}: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },
    #[error("{0} not found")]
    NotFound(Missing),
    #[error("{} already has an active entry (record {})", .existing.person, .existing.id)]
    Conflict { existing: Box<PresenceRecord> },
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to create database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("ledger connection lock poisoned")]
    Poisoned,
}

/// Durable store for presence records, unknown detections and the people registry.
pub struct Ledger {
    conn: Mutex<Connection>,
}

impl Ledger {
    /// Open (creating if needed) the ledger database at `path`.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.execute_batch(SCHEMA)?;

        tracing::debug!(path = %path.display(), journal_mode = %mode, "ledger opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Private in-memory ledger, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, LedgerError> {
        self.conn.lock().map_err(|_| LedgerError::Poisoned)
    }

    /// Add or rename a person in the registry table.
    pub fn register_person(&self, person: PersonRef, name: &str) -> Result<(), LedgerError> {
        self.conn()?.execute(
            "INSERT INTO people (person_kind, person_id, name) VALUES (?1, ?2, ?3)
             ON CONFLICT(person_kind, person_id) DO UPDATE SET name = excluded.name",
            params![person.kind.as_str(), person.id, name],
        )?;
        Ok(())
    }

    pub fn person_name(&self, person: PersonRef) -> Result<Option<String>, LedgerError> {
        let name = self
            .conn()?
            .query_row(
                "SELECT name FROM people WHERE person_kind = ?1 AND person_id = ?2",
                params![person.kind.as_str(), person.id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(name)
    }
}

fn person_exists(conn: &Connection, person: PersonRef) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM people WHERE person_kind = ?1 AND person_id = ?2)",
        params![person.kind.as_str(), person.id],
        |row| row.get(0),
    )
}

fn fetch_record(conn: &Connection, id: RecordId) -> rusqlite::Result<Option<PresenceRecord>> {
    conn.query_row(
        &format!("SELECT {RECORD_COLUMNS} FROM presence_records WHERE id = ?1"),
        params![id],
        record_from_row,
    )
    .optional()
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<PresenceRecord> {
    let kind: String = row.get(1)?;
    let kind = kind
        .parse::<PersonKind>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;

    Ok(PresenceRecord {
        id: row.get(0)?,
        person: PersonRef::new(kind, row.get(2)?),
        zone_id: row.get(3)?,
        entry_time: opt_time(row, 4)?,
        exit_time: opt_time(row, 5)?,
        camera_id: row.get(6)?,
    })
}

pub(crate) fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn time(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    from_millis(idx, row.get(idx)?)
}

fn opt_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<i64>>(idx)?
        .map(|ms| from_millis(idx, ms))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_person_upserts_name() {
        let ledger = Ledger::open_in_memory().unwrap();
        let p = PersonRef::student(2);
        assert_eq!(ledger.person_name(p).unwrap(), None);

        ledger.register_person(p, "Alice").unwrap();
        ledger.register_person(p, "Alice Williams").unwrap();
        assert_eq!(ledger.person_name(p).unwrap().as_deref(), Some("Alice Williams"));
        assert_eq!(ledger.person_name(PersonRef::teacher(2)).unwrap(), None);
    }

    #[test]
    fn test_open_file_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/presence.db");
        let ledger = Ledger::open(&path, Duration::from_millis(500)).unwrap();
        ledger.register_person(PersonRef::teacher(1), "Dr. Chen").unwrap();
        assert!(path.exists());

        // Schema creation is idempotent on reopen.
        let reopened = Ledger::open(&path, Duration::from_millis(500)).unwrap();
        assert!(reopened.person_name(PersonRef::teacher(1)).unwrap().is_some());
    }

    #[test]
    fn test_conflict_message_names_person() {
        let err = LedgerError::Conflict {
            existing: Box::new(PresenceRecord {
                id: 12,
                person: PersonRef::student(2),
                zone_id: Some(1),
                entry_time: None,
                exit_time: None,
                camera_id: None,
            }),
        };
        assert_eq!(
            err.to_string(),
            "STUDENT-2 already has an active entry (record 12)"
        );
    }
}
