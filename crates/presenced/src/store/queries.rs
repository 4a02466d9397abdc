//! Read side of the presence ledger: active persons, zone logs, filtered
//! queries and daily analytics.

use super::{fetch_record, record_from_row, to_millis, Ledger, LedgerError, RECORD_COLUMNS};
use chrono::{DateTime, NaiveTime, Utc};
use presence_core::{PersonKind, PresenceRecord, RecordId, ZoneId};
use rusqlite::types::ToSql;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::BTreeMap;

/// Default page size for zone logs and record queries.
pub const DEFAULT_PAGE_LIMIT: u32 = 50;

/// Hard cap on a single page.
pub const MAX_PAGE_LIMIT: u32 = 1000;

/// Newest-first ordering that also places exit-only records by their exit time.
const NEWEST_FIRST: &str = "ORDER BY COALESCE(entry_time, exit_time) DESC, id DESC";

/// Filters for [`Ledger::query_records`]. All fields are optional.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub zone_id: Option<ZoneId>,
    pub person_kind: Option<PersonKind>,
    /// Inclusive lower bound on the record's entry (or exit, for exit-only) time.
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound, same rule as `from`.
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// One page of results plus the total matching row count.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneCount {
    pub zone_id: Option<ZoneId>,
    pub count: u64,
}

/// Presence summary for the current UTC day.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Analytics {
    pub total_entries_today: u64,
    pub active_now: u64,
    pub entries_by_zone: Vec<ZoneCount>,
    pub entries_by_person_kind: BTreeMap<PersonKind, u64>,
}

impl Ledger {
    pub fn get_record(&self, id: RecordId) -> Result<Option<PresenceRecord>, LedgerError> {
        let conn = self.conn()?;
        Ok(fetch_record(&conn, id)?)
    }

    /// Open records in one zone, most recent entry first.
    pub fn active_in_zone(&self, zone_id: ZoneId) -> Result<Vec<PresenceRecord>, LedgerError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM presence_records
             WHERE zone_id = ?1 AND exit_time IS NULL
             ORDER BY entry_time DESC, id DESC"
        ))?;
        let rows = stmt.query_map(params![zone_id], record_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Open records in every zone, most recent entry first.
    pub fn active_persons(&self) -> Result<Vec<PresenceRecord>, LedgerError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM presence_records
             WHERE exit_time IS NULL
             ORDER BY entry_time DESC, id DESC"
        ))?;
        let rows = stmt.query_map([], record_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Activity log for one zone, newest first.
    pub fn zone_log(
        &self,
        zone_id: ZoneId,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<Page<PresenceRecord>, LedgerError> {
        self.query_records(&RecordFilter {
            zone_id: Some(zone_id),
            limit,
            offset,
            ..RecordFilter::default()
        })
    }

    /// Filtered, paginated record listing, newest first.
    pub fn query_records(&self, filter: &RecordFilter) -> Result<Page<PresenceRecord>, LedgerError> {
        let limit = filter.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
        if limit == 0 || limit > MAX_PAGE_LIMIT {
            return Err(LedgerError::Validation {
                field: "limit",
                message: format!("must be between 1 and {MAX_PAGE_LIMIT}"),
            });
        }
        if let (Some(from), Some(to)) = (filter.from, filter.to) {
            if from > to {
                return Err(LedgerError::Validation {
                    field: "from",
                    message: "must not be after `to`".into(),
                });
            }
        }
        let offset = filter.offset.unwrap_or(0);

        let (where_clause, mut values) = filter_clause(filter);
        let conn = self.conn()?;

        let total = count(&conn, &where_clause, &values)?;

        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM presence_records {where_clause} {NEWEST_FIRST} LIMIT ? OFFSET ?"
        );
        values.push(Box::new(limit));
        values.push(Box::new(offset));
        let param_refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();

        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map(param_refs.as_slice(), record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Page {
            items,
            total,
            limit,
            offset,
        })
    }

    /// Entry counts for the UTC day containing `now`, plus who is inside right now.
    pub fn analytics(&self, now: DateTime<Utc>) -> Result<Analytics, LedgerError> {
        let day_start = now.date_naive().and_time(NaiveTime::MIN).and_utc();
        let since = to_millis(day_start);
        let conn = self.conn()?;

        let total_entries_today: u64 = conn.query_row(
            "SELECT COUNT(*) FROM presence_records WHERE entry_time >= ?1",
            params![since],
            |row| row.get(0),
        )?;
        let active_now: u64 = conn.query_row(
            "SELECT COUNT(*) FROM presence_records WHERE exit_time IS NULL",
            [],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(
            "SELECT zone_id, COUNT(*) FROM presence_records
             WHERE entry_time >= ?1 GROUP BY zone_id ORDER BY zone_id",
        )?;
        let entries_by_zone = stmt
            .query_map(params![since], |row| {
                Ok(ZoneCount {
                    zone_id: row.get(0)?,
                    count: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT person_kind, COUNT(*) FROM presence_records
             WHERE entry_time >= ?1 GROUP BY person_kind",
        )?;
        let mut entries_by_person_kind = BTreeMap::new();
        let rows = stmt.query_map(params![since], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;
        for row in rows {
            let (kind, n) = row?;
            match kind.parse::<PersonKind>() {
                Ok(kind) => {
                    entries_by_person_kind.insert(kind, n);
                }
                Err(e) => tracing::warn!(error = %e, "skipping unrecognized person kind in analytics"),
            }
        }

        Ok(Analytics {
            total_entries_today,
            active_now,
            entries_by_zone,
            entries_by_person_kind,
        })
    }
}

fn filter_clause(filter: &RecordFilter) -> (String, Vec<Box<dyn ToSql>>) {
    let mut conditions = Vec::new();
    let mut values: Vec<Box<dyn ToSql>> = Vec::new();

    if let Some(zone) = filter.zone_id {
        conditions.push("zone_id = ?");
        values.push(Box::new(zone));
    }
    if let Some(kind) = filter.person_kind {
        conditions.push("person_kind = ?");
        values.push(Box::new(kind.as_str()));
    }
    if let Some(from) = filter.from {
        conditions.push("COALESCE(entry_time, exit_time) >= ?");
        values.push(Box::new(to_millis(from)));
    }
    if let Some(to) = filter.to {
        conditions.push("COALESCE(entry_time, exit_time) <= ?");
        values.push(Box::new(to_millis(to)));
    }

    let clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };
    (clause, values)
}

fn count(conn: &Connection, where_clause: &str, values: &[Box<dyn ToSql>]) -> rusqlite::Result<u64> {
    let param_refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
    conn.query_row(
        &format!("SELECT COUNT(*) FROM presence_records {where_clause}"),
        param_refs.as_slice(),
        |row| row.get(0),
    )
}
