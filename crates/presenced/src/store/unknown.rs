//! Unknown-face store and its review lifecycle.
//!
//! Rows are created `PENDING` by the admission path only. Reviewers move
//! them to `IDENTIFIED` or `IGNORED`, or delete them. Nothing changes a
//! status on a timer.

use super::{time, to_millis, Ledger, LedgerError, Missing};
use chrono::{DateTime, Utc};
use presence_core::types::DEFAULT_UNKNOWN_NOTES;
use presence_core::{NewUnknownDetection, UnknownDetection, UnknownId, UnknownStatus};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};

/// Default number of unknown detections returned by a listing.
pub const DEFAULT_UNKNOWN_LIMIT: u32 = 20;

const UNKNOWN_COLUMNS: &str =
    "id, zone_id, captured_image, confidence, detected_time, status, notes";

impl Ledger {
    /// Persist an admitted unknown-face capture as `PENDING`.
    pub fn insert_unknown(
        &self,
        new: NewUnknownDetection,
        at: DateTime<Utc>,
    ) -> Result<UnknownDetection, LedgerError> {
        if new.captured_image.is_empty() {
            return Err(LedgerError::Validation {
                field: "capturedImage",
                message: "image is required".into(),
            });
        }
        if !(0.0..=1.0).contains(&new.confidence) {
            return Err(LedgerError::Validation {
                field: "confidence",
                message: format!("{} is outside 0.0..=1.0", new.confidence),
            });
        }

        let notes = new
            .notes
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| DEFAULT_UNKNOWN_NOTES.to_string());

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO unknown_detections (zone_id, captured_image, confidence, detected_time, status, notes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                new.zone_id,
                new.captured_image,
                new.confidence as f64,
                to_millis(at),
                UnknownStatus::Pending.as_str(),
                notes,
            ],
        )?;
        let id = conn.last_insert_rowid();
        tracing::info!(id, zone = new.zone_id, confidence = new.confidence, "unknown face stored");

        Ok(UnknownDetection {
            id,
            zone_id: new.zone_id,
            captured_image: new.captured_image,
            confidence: new.confidence,
            detected_time: DateTime::from_timestamp_millis(to_millis(at)).unwrap_or(at),
            status: UnknownStatus::Pending,
            notes,
        })
    }

    /// Raw JPEG bytes of one capture.
    pub fn unknown_image(&self, id: UnknownId) -> Result<Vec<u8>, LedgerError> {
        self.conn()?
            .query_row(
                "SELECT captured_image FROM unknown_detections WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(LedgerError::NotFound(Missing::UnknownDetection(id)))
    }

    /// Unknown detections, most recently detected first.
    pub fn list_unknown(
        &self,
        status: Option<UnknownStatus>,
        limit: Option<u32>,
    ) -> Result<Vec<UnknownDetection>, LedgerError> {
        let limit = limit.unwrap_or(DEFAULT_UNKNOWN_LIMIT);
        if limit == 0 {
            return Err(LedgerError::Validation {
                field: "limit",
                message: "must be at least 1".into(),
            });
        }

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {UNKNOWN_COLUMNS} FROM unknown_detections
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY detected_time DESC, id DESC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![status.map(|s| s.as_str()), limit], unknown_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Reviewer action. `notes` replaces the stored notes only when given.
    pub fn update_unknown_status(
        &self,
        id: UnknownId,
        status: UnknownStatus,
        notes: Option<&str>,
    ) -> Result<UnknownDetection, LedgerError> {
        let notes = notes.filter(|n| !n.is_empty());
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE unknown_detections SET status = ?1, notes = COALESCE(?2, notes) WHERE id = ?3",
            params![status.as_str(), notes, id],
        )?;
        if changed == 0 {
            return Err(LedgerError::NotFound(Missing::UnknownDetection(id)));
        }

        tracing::info!(id, status = %status, "unknown face reviewed");
        conn.query_row(
            &format!("SELECT {UNKNOWN_COLUMNS} FROM unknown_detections WHERE id = ?1"),
            params![id],
            unknown_from_row,
        )
        .map_err(Into::into)
    }

    pub fn delete_unknown(&self, id: UnknownId) -> Result<(), LedgerError> {
        let changed = self
            .conn()?
            .execute("DELETE FROM unknown_detections WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(LedgerError::NotFound(Missing::UnknownDetection(id)));
        }
        tracing::info!(id, "unknown face deleted");
        Ok(())
    }

    pub fn unknown_count(&self) -> Result<u64, LedgerError> {
        let n = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM unknown_detections", [], |row| row.get(0))?;
        Ok(n)
    }
}

fn unknown_from_row(row: &Row<'_>) -> rusqlite::Result<UnknownDetection> {
    let status: String = row.get(5)?;
    let status = status
        .parse::<UnknownStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;

    Ok(UnknownDetection {
        id: row.get(0)?,
        zone_id: row.get(1)?,
        captured_image: row.get(2)?,
        confidence: row.get::<_, f64>(3)? as f32,
        detected_time: time(row, 4)?,
        status,
        notes: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn capture(zone: i64) -> NewUnknownDetection {
        NewUnknownDetection {
            zone_id: zone,
            captured_image: vec![0xFF, 0xD8, 0xFF, 0xD9],
            confidence: 0.8,
            notes: None,
        }
    }

    #[test]
    fn test_insert_defaults() {
        let ledger = Ledger::open_in_memory().unwrap();
        let stored = ledger.insert_unknown(capture(1), t(0)).unwrap();
        assert_eq!(stored.status, UnknownStatus::Pending);
        assert_eq!(stored.notes, DEFAULT_UNKNOWN_NOTES);

        let listed = ledger.list_unknown(None, None).unwrap();
        assert_eq!(listed, vec![stored]);
    }

    #[test]
    fn test_insert_validates() {
        let ledger = Ledger::open_in_memory().unwrap();
        let mut bad = capture(1);
        bad.confidence = 1.5;
        assert!(matches!(
            ledger.insert_unknown(bad, t(0)),
            Err(LedgerError::Validation { field: "confidence", .. })
        ));

        let mut empty = capture(1);
        empty.captured_image.clear();
        assert!(matches!(
            ledger.insert_unknown(empty, t(0)),
            Err(LedgerError::Validation { field: "capturedImage", .. })
        ));
        assert_eq!(ledger.unknown_count().unwrap(), 0);
    }

    #[test]
    fn test_list_newest_first_with_status_filter() {
        let ledger = Ledger::open_in_memory().unwrap();
        let a = ledger.insert_unknown(capture(1), t(0)).unwrap();
        let b = ledger.insert_unknown(capture(1), t(20)).unwrap();
        let c = ledger.insert_unknown(capture(2), t(40)).unwrap();
        ledger.update_unknown_status(b.id, UnknownStatus::Ignored, None).unwrap();

        let all: Vec<_> = ledger.list_unknown(None, None).unwrap().iter().map(|d| d.id).collect();
        assert_eq!(all, vec![c.id, b.id, a.id]);

        let pending: Vec<_> = ledger
            .list_unknown(Some(UnknownStatus::Pending), None)
            .unwrap()
            .iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(pending, vec![c.id, a.id]);

        assert_eq!(ledger.list_unknown(None, Some(1)).unwrap().len(), 1);
    }

    #[test]
    fn test_review_keeps_notes_unless_given() {
        let ledger = Ledger::open_in_memory().unwrap();
        let d = ledger.insert_unknown(capture(1), t(0)).unwrap();

        let reviewed = ledger
            .update_unknown_status(d.id, UnknownStatus::Identified, None)
            .unwrap();
        assert_eq!(reviewed.status, UnknownStatus::Identified);
        assert_eq!(reviewed.notes, DEFAULT_UNKNOWN_NOTES);

        let reviewed = ledger
            .update_unknown_status(d.id, UnknownStatus::Ignored, Some("delivery driver"))
            .unwrap();
        assert_eq!(reviewed.notes, "delivery driver");
    }

    #[test]
    fn test_review_and_delete_missing() {
        let ledger = Ledger::open_in_memory().unwrap();
        assert!(matches!(
            ledger.update_unknown_status(5, UnknownStatus::Ignored, None),
            Err(LedgerError::NotFound(Missing::UnknownDetection(5)))
        ));
        assert!(matches!(
            ledger.delete_unknown(5),
            Err(LedgerError::NotFound(Missing::UnknownDetection(5)))
        ));
    }

    #[test]
    fn test_delete() {
        let ledger = Ledger::open_in_memory().unwrap();
        let d = ledger.insert_unknown(capture(1), t(0)).unwrap();
        ledger.delete_unknown(d.id).unwrap();
        assert_eq!(ledger.unknown_count().unwrap(), 0);
    }

    #[test]
    fn test_unknown_image() {
        let ledger = Ledger::open_in_memory().unwrap();
        let d = ledger.insert_unknown(capture(1), t(0)).unwrap();
        assert_eq!(ledger.unknown_image(d.id).unwrap(), vec![0xFF, 0xD8, 0xFF, 0xD9]);
        assert!(matches!(
            ledger.unknown_image(d.id + 1),
            Err(LedgerError::NotFound(Missing::UnknownDetection(_)))
        ));
    }
}
