// 🗄️ Ledger Store - SQLite persistence for history, counters and the event log
// The store owns the single current snapshot; every write runs in one IMMEDIATE transaction

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use crate::collapse::assign_merge_groups;
use crate::merge::{MergeEngine, MergeOutcome};
use crate::model::{AttendanceOverride, CustomerVisitCounter, HistoryRecord, InputRecord, Snapshot};
use crate::recompute::{recompute_all, resequence_customer, RecomputeOutcome};

/// Event for audit trail: every change to the ledger is recorded
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open database: {:?}", path))?;
    setup_database(&conn)?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // History Table (one row per identity key, full record as JSON)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS history (
            identity_key TEXT PRIMARY KEY,
            customer_id TEXT NOT NULL,
            service_date TEXT NOT NULL,
            visit_sequence INTEGER,
            is_attended INTEGER NOT NULL,
            record TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Visit Counters (derived cache, rebuilt by recompute)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS visit_counters (
            customer_id TEXT PRIMARY KEY,
            attended_count INTEGER NOT NULL,
            last_service_date TEXT
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_history_customer ON history(customer_id, service_date)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// SNAPSHOT I/O
// ============================================================================

pub fn load_snapshot(conn: &Connection) -> Result<Snapshot> {
    let mut snapshot = Snapshot::default();

    let mut stmt = conn.prepare("SELECT identity_key, record FROM history")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    for (key, json) in rows {
        let record: HistoryRecord = serde_json::from_str(&json)
            .with_context(|| format!("Corrupt history record: {}", key))?;
        snapshot.history.insert(key, record);
    }

    let mut stmt =
        conn.prepare("SELECT customer_id, attended_count, last_service_date FROM visit_counters")?;
    let counters = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, u32>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    for (customer_id, attended_count, last) in counters {
        let last_service_date = match last {
            Some(text) => Some(
                NaiveDate::parse_from_str(&text, "%Y-%m-%d").with_context(|| {
                    format!("Corrupt counter date for {}: {}", customer_id, text)
                })?,
            ),
            None => None,
        };
        snapshot.counters.insert(
            customer_id.clone(),
            CustomerVisitCounter {
                customer_id,
                attended_count,
                last_service_date,
            },
        );
    }

    debug!(
        records = snapshot.history.len(),
        counters = snapshot.counters.len(),
        "loaded snapshot"
    );
    Ok(snapshot)
}

fn upsert_record(conn: &Connection, record: &HistoryRecord) -> Result<()> {
    let json = serde_json::to_string(record)?;

    conn.execute(
        "INSERT INTO history (
            identity_key, customer_id, service_date, visit_sequence, is_attended, record, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(identity_key) DO UPDATE SET
            customer_id = excluded.customer_id,
            service_date = excluded.service_date,
            visit_sequence = excluded.visit_sequence,
            is_attended = excluded.is_attended,
            record = excluded.record,
            updated_at = excluded.updated_at",
        params![
            record.identity_key,
            record.customer_id,
            record.service_date.format("%Y-%m-%d").to_string(),
            record.visit_sequence,
            record.is_attended,
            json,
            record.updated_at.to_rfc3339(),
        ],
    )?;

    Ok(())
}

fn upsert_counter(conn: &Connection, counter: &CustomerVisitCounter) -> Result<()> {
    conn.execute(
        "INSERT INTO visit_counters (customer_id, attended_count, last_service_date)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(customer_id) DO UPDATE SET
            attended_count = excluded.attended_count,
            last_service_date = excluded.last_service_date",
        params![
            counter.customer_id,
            counter.attended_count,
            counter.last_service_date.map(|d| d.format("%Y-%m-%d").to_string()),
        ],
    )?;

    Ok(())
}

/// Write every record and counter that differs from `before`.
/// Rows are never deleted: history and counters only grow.
/// Returns the number of history rows written.
pub fn save_snapshot(conn: &Connection, before: &Snapshot, after: &Snapshot) -> Result<usize> {
    let mut written = 0;

    for (key, record) in &after.history {
        if before.history.get(key) != Some(record) {
            upsert_record(conn, record)?;
            written += 1;
        }
    }

    for (customer_id, counter) in &after.counters {
        if before.counters.get(customer_id) != Some(counter) {
            upsert_counter(conn, counter)?;
        }
    }

    Ok(written)
}

// ============================================================================
// COMMITS (load, transform, save inside one IMMEDIATE transaction)
// ============================================================================

/// Merge a batch against the stored snapshot and persist the result.
///
/// The IMMEDIATE transaction takes the write lock before the snapshot is
/// read, so two importers can never merge against the same "before" state.
pub fn commit_merge(
    conn: &mut Connection,
    engine: &MergeEngine,
    batch: &[InputRecord],
    now: DateTime<Utc>,
    actor: &str,
) -> Result<MergeOutcome> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("Failed to begin merge transaction")?;

    let before = load_snapshot(&tx)?;
    let mut outcome = engine.merge(&before, batch, now);
    let mut grouped = assign_merge_groups(&outcome.snapshot.history);
    for (key, record) in grouped.iter_mut() {
        let stamped = outcome
            .snapshot
            .history
            .get(key)
            .map_or(false, |merged| merged.merge_group_id != record.merge_group_id);
        if stamped {
            record.updated_at = now;
        }
    }
    outcome.snapshot.history = grouped;

    for (key, record) in &outcome.snapshot.history {
        let event_type = match before.history.get(key) {
            None => "record_inserted",
            Some(prior) if prior != record => "record_updated",
            Some(_) => continue,
        };
        let event = Event::new(
            event_type,
            "booking",
            key,
            serde_json::json!({
                "customer_id": record.customer_id,
                "service_date": record.service_date,
                "visit_sequence": record.visit_sequence,
                "is_attended": record.is_attended,
            }),
            actor,
        )
        .at(now);
        insert_event(&tx, &event)?;
    }

    let written = save_snapshot(&tx, &before, &outcome.snapshot)?;

    let batch_event = Event::new(
        "batch_merged",
        "batch",
        &uuid::Uuid::new_v4().to_string(),
        serde_json::json!({
            "rows": batch.len(),
            "written": written,
            "stats": outcome.stats,
            "skipped": outcome
                .skipped
                .iter()
                .map(|s| {
                    serde_json::json!({ "batch_index": s.batch_index, "reason": s.reason.as_str() })
                })
                .collect::<Vec<_>>(),
        }),
        actor,
    )
    .at(now);
    insert_event(&tx, &batch_event)?;

    tx.commit().context("Failed to commit merge")?;

    info!(written, skipped = outcome.skipped.len(), "committed merge");
    Ok(outcome)
}

/// Full recompute of the stored history. Touched records get `updated_at = now`.
pub fn commit_recompute(
    conn: &mut Connection,
    now: DateTime<Utc>,
    actor: &str,
) -> Result<RecomputeOutcome> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("Failed to begin recompute transaction")?;

    let before = load_snapshot(&tx)?;
    let mut outcome = recompute_all(&before.history);
    outcome.carry_forward(&before.counters);

    for (key, record) in outcome.history.iter_mut() {
        if before.history.get(key) != Some(&*record) {
            record.updated_at = now;
        }
    }

    let after = Snapshot::new(outcome.history.clone(), outcome.counters.clone());
    let written = save_snapshot(&tx, &before, &after)?;

    let event = Event::new(
        "history_recomputed",
        "ledger",
        "history",
        serde_json::json!({ "records": after.history.len(), "changed": written }),
        actor,
    )
    .at(now);
    insert_event(&tx, &event)?;

    tx.commit().context("Failed to commit recompute")?;

    info!(changed = written, "committed recompute");
    Ok(outcome)
}

// ============================================================================
// OPERATOR EDITS (sticky fields)
// ============================================================================

fn edit_record<F>(
    conn: &mut Connection,
    identity_key: &str,
    now: DateTime<Utc>,
    actor: &str,
    event_type: &str,
    resequence: bool,
    edit: F,
) -> Result<HistoryRecord>
where
    F: FnOnce(&mut HistoryRecord) -> serde_json::Value,
{
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("Failed to begin edit transaction")?;

    let before = load_snapshot(&tx)?;
    let mut after = before.clone();

    let record = after
        .history
        .get_mut(identity_key)
        .ok_or_else(|| anyhow!("No booking with identity key {}", identity_key))?;
    let data = edit(record);
    record.updated_at = now;
    let customer_id = record.customer_id.clone();

    // Only the override changes sequencing attendance
    if resequence {
        resequence_customer(&mut after.history, &mut after.counters, &customer_id);
    }

    save_snapshot(&tx, &before, &after)?;
    insert_event(&tx, &Event::new(event_type, "booking", identity_key, data, actor).at(now))?;
    tx.commit().context("Failed to commit edit")?;

    after
        .history
        .remove(identity_key)
        .ok_or_else(|| anyhow!("Edited booking vanished: {}", identity_key))
}

pub fn set_attendance_override(
    conn: &mut Connection,
    identity_key: &str,
    value: AttendanceOverride,
    now: DateTime<Utc>,
    actor: &str,
) -> Result<HistoryRecord> {
    edit_record(conn, identity_key, now, actor, "override_set", true, |record| {
        let previous = record.manual_attendance_override;
        record.manual_attendance_override = value;
        serde_json::json!({ "from": previous, "to": value })
    })
}

pub fn set_excluded(
    conn: &mut Connection,
    identity_key: &str,
    excluded: bool,
    now: DateTime<Utc>,
    actor: &str,
) -> Result<HistoryRecord> {
    edit_record(conn, identity_key, now, actor, "exclusion_set", false, |record| {
        record.is_excluded_from_aggregates = excluded;
        serde_json::json!({ "excluded": excluded })
    })
}

// ============================================================================
// EVENTS + COUNTS
// ============================================================================

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Events for one entity, newest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp DESC, id DESC",
    )?;

    let rows = stmt
        .query_map(params![entity_type, entity_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(event_id, timestamp, event_type, entity_type, entity_id, data, actor)| {
            Ok(Event {
                timestamp: DateTime::parse_from_rfc3339(&timestamp)
                    .with_context(|| format!("Bad event timestamp: {}", timestamp))?
                    .with_timezone(&Utc),
                data: serde_json::from_str(&data).context("Bad event payload")?,
                event_id,
                event_type,
                entity_type,
                entity_id,
                actor,
            })
        })
        .collect()
}

pub fn count_history(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM history", [], |row| row.get(0))?;

    Ok(count)
}

pub fn get_record(conn: &Connection, identity_key: &str) -> Result<Option<HistoryRecord>> {
    let json: Option<String> = conn
        .query_row(
            "SELECT record FROM history WHERE identity_key = ?1",
            params![identity_key],
            |row| row.get(0),
        )
        .optional()?;

    json.map(|j| {
        serde_json::from_str(&j)
            .with_context(|| format!("Corrupt history record: {}", identity_key))
    })
    .transpose()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttendanceStatus, BookingStatus};
    use crate::staff::StaffClassifier;
    use chrono::TimeZone;

    fn create_test_input(id: &str, customer: &str, day: u32, attended: bool) -> InputRecord {
        InputRecord::new(
            customer,
            customer,
            NaiveDate::from_ymd_opt(2024, 12, day).unwrap(),
            BookingStatus::Booked,
            if attended {
                AttendanceStatus::Attended
            } else {
                AttendanceStatus::NotAttended
            },
            NaiveDate::from_ymd_opt(2024, 11, 20).unwrap().and_hms_opt(10, 0, 0).unwrap(),
        )
        .with_booking_id(id)
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 5, 9, 0, 0).single().unwrap()
    }

    fn engine() -> MergeEngine {
        MergeEngine::new(StaffClassifier::with_default_patterns(vec![]))
    }

    fn memory_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    #[test]
    fn test_commit_merge_persists_snapshot() {
        let mut conn = memory_db();
        let batch = vec![
            create_test_input("B1", "F1", 1, true),
            create_test_input("B2", "F1", 5, true),
        ];

        let outcome = commit_merge(&mut conn, &engine(), &batch, now(), "test").unwrap();
        let stored = load_snapshot(&conn).unwrap();

        assert_eq!(stored, outcome.snapshot);
        assert_eq!(count_history(&conn).unwrap(), 2);
        assert_eq!(stored.counters["F1"].attended_count, 2);
        assert_eq!(stored.counters["F1"].last_service_date, NaiveDate::from_ymd_opt(2024, 12, 5));
    }

    #[test]
    fn test_import_twice_writes_nothing_new() {
        let mut conn = memory_db();
        let batch = vec![create_test_input("B1", "F1", 1, true)];

        commit_merge(&mut conn, &engine(), &batch, now(), "test").unwrap();
        let first = load_snapshot(&conn).unwrap();
        commit_merge(&mut conn, &engine(), &batch, now(), "test").unwrap();
        let second = load_snapshot(&conn).unwrap();

        assert_eq!(first, second);
        assert_eq!(count_history(&conn).unwrap(), 1);

        // One insert event, no update event
        let events = get_events_for_entity(&conn, "booking", "B1").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "record_inserted");
    }

    #[test]
    fn test_commit_recompute_heals_gap() {
        let mut conn = memory_db();
        let batch = vec![
            create_test_input("B1", "F1", 1, true),
            create_test_input("B2", "F1", 2, true),
            create_test_input("B3", "F1", 3, true),
        ];
        commit_merge(&mut conn, &engine(), &batch, now(), "test").unwrap();
        let demoted = [create_test_input("B2", "F1", 2, false)];
        commit_merge(&mut conn, &engine(), &demoted, now(), "test").unwrap();

        assert_eq!(get_record(&conn, "B3").unwrap().unwrap().visit_sequence, Some(3));

        let later = now() + chrono::Duration::hours(1);
        commit_recompute(&mut conn, later, "test").unwrap();

        let healed = get_record(&conn, "B3").unwrap().unwrap();
        assert_eq!(healed.visit_sequence, Some(2));
        assert_eq!(healed.updated_at, later);
        assert_eq!(get_record(&conn, "B1").unwrap().unwrap().updated_at, now());
    }

    #[test]
    fn test_override_resequences_customer() {
        let mut conn = memory_db();
        let batch = vec![
            create_test_input("B1", "F1", 1, true),
            create_test_input("B2", "F1", 2, true),
        ];
        commit_merge(&mut conn, &engine(), &batch, now(), "test").unwrap();

        let force_absent = AttendanceOverride::ForceAbsent;
        let edited =
            set_attendance_override(&mut conn, "B1", force_absent, now(), "operator").unwrap();
        assert_eq!(edited.visit_sequence, None);

        let snapshot = load_snapshot(&conn).unwrap();
        assert_eq!(snapshot.history["B2"].visit_sequence, Some(1));
        assert_eq!(snapshot.counters["F1"].attended_count, 1);

        // Sticky across re-import
        commit_merge(&mut conn, &engine(), &batch, now(), "test").unwrap();
        let record = get_record(&conn, "B1").unwrap().unwrap();
        assert_eq!(record.manual_attendance_override, AttendanceOverride::ForceAbsent);
        assert_eq!(record.visit_sequence, None);
    }

    #[test]
    fn test_exclusion_keeps_demotion_gap() {
        let mut conn = memory_db();
        let batch = vec![
            create_test_input("B1", "F1", 1, true),
            create_test_input("B2", "F1", 2, true),
            create_test_input("B3", "F1", 3, true),
        ];
        commit_merge(&mut conn, &engine(), &batch, now(), "test").unwrap();
        let demoted = [create_test_input("B2", "F1", 2, false)];
        commit_merge(&mut conn, &engine(), &demoted, now(), "test").unwrap();

        let edited = set_excluded(&mut conn, "B1", true, now(), "operator").unwrap();
        assert!(edited.is_excluded_from_aggregates);
        assert_eq!(edited.visit_sequence, Some(1));

        // Gap stays until an explicit recompute
        assert_eq!(get_record(&conn, "B3").unwrap().unwrap().visit_sequence, Some(3));
    }

    #[test]
    fn test_merge_group_stamp_updates_timestamp() {
        let mut conn = memory_db();
        commit_merge(&mut conn, &engine(), &[create_test_input("B1", "F1", 1, true)], now(), "test")
            .unwrap();

        let later = now() + chrono::Duration::hours(2);
        let same_day = [create_test_input("B2", "F1", 1, false)];
        commit_merge(&mut conn, &engine(), &same_day, later, "test").unwrap();

        let first = get_record(&conn, "B1").unwrap().unwrap();
        assert!(first.merge_group_id.is_some());
        assert_eq!(first.merge_group_id, get_record(&conn, "B2").unwrap().unwrap().merge_group_id);
        assert_eq!(first.updated_at, later);
        assert_eq!(first.created_at, now());
    }

    #[test]
    fn test_edit_unknown_key_fails() {
        let mut conn = memory_db();
        assert!(set_excluded(&mut conn, "nope", true, now(), "operator").is_err());
    }

    #[test]
    fn test_event_log() {
        let conn = memory_db();

        let event = Event::new(
            "test_event",
            "booking",
            "test_id_123",
            serde_json::json!({"test": "data"}),
            "test_actor",
        );
        insert_event(&conn, &event).unwrap();

        let events = get_events_for_entity(&conn, "booking", "test_id_123").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, event.event_id);
        assert_eq!(events[0].data["test"], "data");
    }
}
