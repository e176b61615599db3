// 🔁 Recompute Engine - deterministic rebuild of visit sequences
// Reference numbering: service date ascending, identity key breaks ties

use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::model::{CounterMap, CustomerVisitCounter, HistoryMap, HistoryRecord, Snapshot};

#[derive(Debug, Clone, PartialEq)]
pub struct RecomputeOutcome {
    pub history: HistoryMap,
    pub counters: CounterMap,

    /// Records whose sequence, label or derived attendance changed
    pub changed_records: usize,
}

impl RecomputeOutcome {
    /// Keep counters that existed before the rebuild. Customers with no
    /// attended records left get a zero-state counter instead of vanishing.
    pub fn carry_forward(&mut self, previous: &CounterMap) {
        for customer_id in previous.keys() {
            self.counters
                .entry(customer_id.clone())
                .or_insert_with(|| CustomerVisitCounter::new(customer_id.clone()));
        }
    }

    pub fn into_snapshot(self) -> Snapshot {
        Snapshot::new(self.history, self.counters)
    }
}

fn ordering(a: &HistoryRecord, b: &HistoryRecord) -> std::cmp::Ordering {
    a.service_date
        .cmp(&b.service_date)
        .then_with(|| a.identity_key.cmp(&b.identity_key))
}

/// Rebuild every visit sequence and counter from the history alone.
///
/// `is_attended` and `cancel_timing` are refreshed from current fields; the
/// manual override, when set, decides whether a record is sequenced. A
/// counter exists for each customer with at least one attended record.
pub fn recompute_all(history: &HistoryMap) -> RecomputeOutcome {
    let mut order: Vec<&HistoryRecord> = history.values().collect();
    order.sort_by(|a, b| ordering(a, b));

    let mut running: BTreeMap<String, CustomerVisitCounter> = BTreeMap::new();
    let mut rebuilt = HistoryMap::new();
    let mut changed_records = 0;

    for original in order {
        let mut record = original.clone();
        record.refresh_derived();

        if record.counts_toward_sequence() {
            let counter = running
                .entry(record.customer_id.clone())
                .or_insert_with(|| CustomerVisitCounter::new(record.customer_id.clone()));
            let sequence = counter.promote(record.service_date);
            record.set_sequence(Some(sequence));
        } else {
            record.set_sequence(None);
        }

        if record != *original {
            changed_records += 1;
            debug!(
                key = %record.identity_key,
                customer = %record.customer_id,
                before = ?original.visit_sequence,
                after = ?record.visit_sequence,
                "recompute changed record"
            );
        }
        rebuilt.insert(record.identity_key.clone(), record);
    }

    info!(
        records = rebuilt.len(),
        customers = running.len(),
        changed = changed_records,
        "recomputed visit sequences"
    );

    RecomputeOutcome {
        history: rebuilt,
        counters: running,
        changed_records,
    }
}

/// Rebuild sequences for a single customer in place, using the same ordering
/// as `recompute_all`. The customer's counter is created if missing.
pub fn resequence_customer(history: &mut HistoryMap, counters: &mut CounterMap, customer_id: &str) {
    let mut keys: Vec<(chrono::NaiveDate, String)> = history
        .values()
        .filter(|r| r.customer_id == customer_id)
        .map(|r| (r.service_date, r.identity_key.clone()))
        .collect();
    keys.sort();

    let mut counter = CustomerVisitCounter::new(customer_id);
    for (_, key) in keys {
        if let Some(record) = history.get_mut(&key) {
            if record.counts_toward_sequence() {
                let sequence = counter.promote(record.service_date);
                record.set_sequence(Some(sequence));
            } else {
                record.set_sequence(None);
            }
        }
    }

    debug!(
        customer = customer_id,
        attended = counter.attended_count,
        "resequenced customer"
    );
    counters.insert(customer_id.to_string(), counter);
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        AttendanceOverride, AttendanceStatus, BookingStatus, InputRecord, VisitLabel,
    };
    use chrono::{NaiveDate, Utc};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn create_test_record(key: &str, customer: &str, day: u32, attended: bool) -> HistoryRecord {
        let input = InputRecord::new(
            customer,
            customer,
            date(2024, 12, day),
            BookingStatus::Booked,
            if attended {
                AttendanceStatus::Attended
            } else {
                AttendanceStatus::NotAttended
            },
            date(2024, 11, 20).and_hms_opt(9, 0, 0).unwrap(),
        );
        HistoryRecord::from_input(key, &input, Utc::now())
    }

    fn history_of(records: Vec<HistoryRecord>) -> HistoryMap {
        records
            .into_iter()
            .map(|r| (r.identity_key.clone(), r))
            .collect()
    }

    fn sequences(history: &HistoryMap, customer: &str) -> Vec<(u32, Option<u32>)> {
        let mut out: Vec<_> = history
            .values()
            .filter(|r| r.customer_id == customer)
            .map(|r| (r.service_date.format("%d").to_string().parse().unwrap(), r.visit_sequence))
            .collect();
        out.sort();
        out
    }

    #[test]
    fn test_contiguous_numbering_by_service_date() {
        let history = history_of(vec![
            create_test_record("k3", "F1", 20, true),
            create_test_record("k1", "F1", 1, true),
            create_test_record("k2", "F1", 10, false),
            create_test_record("k4", "F1", 15, true),
            create_test_record("k5", "F2", 3, true),
        ]);

        let outcome = recompute_all(&history);

        assert_eq!(
            sequences(&outcome.history, "F1"),
            vec![(1, Some(1)), (10, None), (15, Some(2)), (20, Some(3))]
        );
        assert_eq!(outcome.counters["F1"].attended_count, 3);
        assert_eq!(outcome.counters["F1"].last_service_date, Some(date(2024, 12, 20)));
        assert_eq!(outcome.counters["F2"].attended_count, 1);
        assert_eq!(outcome.history["k4"].visit_label, Some(VisitLabel::Second));
    }

    #[test]
    fn test_same_day_ties_break_by_identity_key() {
        let history = history_of(vec![
            create_test_record("b", "F1", 5, true),
            create_test_record("a", "F1", 5, true),
        ]);

        let outcome = recompute_all(&history);
        assert_eq!(outcome.history["a"].visit_sequence, Some(1));
        assert_eq!(outcome.history["b"].visit_sequence, Some(2));
    }

    #[test]
    fn test_heals_gaps_and_duplicates() {
        let mut a = create_test_record("a", "F1", 1, true);
        a.set_sequence(Some(1));
        let mut b = create_test_record("b", "F1", 2, true);
        b.set_sequence(Some(3));
        let mut c = create_test_record("c", "F1", 3, true);
        c.set_sequence(Some(3));

        let outcome = recompute_all(&history_of(vec![a, b, c]));

        assert_eq!(
            sequences(&outcome.history, "F1"),
            vec![(1, Some(1)), (2, Some(2)), (3, Some(3))]
        );
        assert_eq!(outcome.changed_records, 1);
    }

    #[test]
    fn test_respects_manual_override() {
        let mut forced_absent = create_test_record("a", "F1", 1, true);
        forced_absent.manual_attendance_override = AttendanceOverride::ForceAbsent;
        let mut forced_present = create_test_record("b", "F1", 2, false);
        forced_present.manual_attendance_override = AttendanceOverride::ForceAttended;

        let outcome = recompute_all(&history_of(vec![forced_absent, forced_present]));

        assert_eq!(outcome.history["a"].visit_sequence, None);
        assert_eq!(outcome.history["b"].visit_sequence, Some(1));
    }

    #[test]
    fn test_refreshes_derived_attendance() {
        let mut stale = create_test_record("a", "F1", 1, true);
        stale.is_attended = false;

        let outcome = recompute_all(&history_of(vec![stale]));
        assert!(outcome.history["a"].is_attended);
        assert_eq!(outcome.history["a"].visit_sequence, Some(1));
    }

    #[test]
    fn test_is_idempotent() {
        let history = history_of(vec![
            create_test_record("k1", "F1", 1, true),
            create_test_record("k2", "F1", 2, true),
        ]);
        let first = recompute_all(&history);
        let second = recompute_all(&first.history);

        assert_eq!(first.history, second.history);
        assert_eq!(first.counters, second.counters);
        assert_eq!(second.changed_records, 0);
    }

    #[test]
    fn test_carry_forward_keeps_zero_counters() {
        let history = history_of(vec![create_test_record("k1", "F1", 1, false)]);
        let mut previous = CounterMap::new();
        previous.insert("F1".to_string(), CustomerVisitCounter::new("F1"));

        let mut outcome = recompute_all(&history);
        assert!(outcome.counters.is_empty());

        outcome.carry_forward(&previous);
        assert_eq!(outcome.counters["F1"].attended_count, 0);
    }

    #[test]
    fn test_resequence_single_customer() {
        let mut a = create_test_record("a", "F1", 5, true);
        a.set_sequence(Some(1));
        let mut b = create_test_record("b", "F1", 1, true);
        b.set_sequence(Some(2));
        let mut other = create_test_record("z", "F2", 1, true);
        other.set_sequence(Some(7));

        let mut history = history_of(vec![a, b, other]);
        let mut counters = CounterMap::new();
        resequence_customer(&mut history, &mut counters, "F1");

        assert_eq!(history["b"].visit_sequence, Some(1));
        assert_eq!(history["a"].visit_sequence, Some(2));
        assert_eq!(history["z"].visit_sequence, Some(7));
        assert_eq!(counters["F1"].attended_count, 2);
    }
}
