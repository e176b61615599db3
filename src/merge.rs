// 🔀 Merge Engine - idempotent upsert of import batches into canonical history
// Pure: snapshot in, new snapshot out. The caller supplies the clock.
//
// Counter maintenance per row (before → after attendance):
//   false → true   promote: next sequence number
//   true  → true   keep the existing sequence number
//   true  → false  demote: decrement counter, clear sequence
//   false → false  nothing
//
// A demotion does not renumber the customer's other visits, so a gap can
// remain until `recompute_all` runs. `integrity::audit` reports such gaps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use crate::model::{
    CounterMap, CustomerVisitCounter, HistoryMap, HistoryRecord, InputRecord, Snapshot,
};
use crate::recompute::resequence_customer;
use crate::staff::StaffClassifier;

// ============================================================================
// SKIPPED ROWS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    /// No booking id and no usable fallback-key components
    MissingIdentity,

    /// Row has an identity but no customer to sequence against
    MissingCustomer,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::MissingIdentity => "missing-identity",
            SkipReason::MissingCustomer => "missing-customer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedRecord {
    /// Position of the row in the submitted batch
    pub batch_index: usize,
    pub input: InputRecord,
    pub reason: SkipReason,
}

// ============================================================================
// MERGE RESULT
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    pub inserted: usize,
    pub updated: usize,
    pub promoted: usize,
    pub demoted: usize,
    pub skipped: usize,

    /// Customers renumbered after a back-dated promotion
    pub resequenced_customers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub snapshot: Snapshot,
    pub skipped: Vec<SkippedRecord>,
    pub stats: MergeStats,
}

// ============================================================================
// MERGE ENGINE
// ============================================================================

pub struct MergeEngine {
    staff: StaffClassifier,
}

impl MergeEngine {
    pub fn new(staff: StaffClassifier) -> Self {
        MergeEngine { staff }
    }

    /// Merge a batch into a snapshot.
    ///
    /// Rows are applied in ascending service-date order (ties keep batch
    /// order). Re-submitting the same batch with the same `now` returns an
    /// identical snapshot.
    ///
    /// When a promotion lands on or before the customer's latest attended
    /// service date, that customer is renumbered after the batch with the
    /// same ordering `recompute_all` uses, so batch arrival order does not
    /// change the final numbering.
    pub fn merge(
        &self,
        snapshot: &Snapshot,
        batch: &[InputRecord],
        now: DateTime<Utc>,
    ) -> MergeOutcome {
        let mut history = snapshot.history.clone();
        let mut counters = snapshot.counters.clone();
        let mut skipped = Vec::new();
        let mut stats = MergeStats::default();
        let mut resequence: BTreeSet<String> = BTreeSet::new();

        let mut order: Vec<usize> = (0..batch.len()).collect();
        order.sort_by_key(|&i| batch[i].service_date);

        for index in order {
            let input = &batch[index];

            let key = match input.identity_key() {
                Some(key) => key,
                None => {
                    warn!(batch_index = index, "skipping row without identity");
                    skipped.push(SkippedRecord {
                        batch_index: index,
                        input: input.clone(),
                        reason: SkipReason::MissingIdentity,
                    });
                    continue;
                }
            };

            if input.customer_id.trim().is_empty() {
                warn!(batch_index = index, key = %key, "skipping row without customer");
                skipped.push(SkippedRecord {
                    batch_index: index,
                    input: input.clone(),
                    reason: SkipReason::MissingCustomer,
                });
                continue;
            }

            let existing = history.get(&key);
            let mut record = self.build_record(&key, input, existing, now);

            match existing {
                Some(_) => stats.updated += 1,
                None => stats.inserted += 1,
            }

            let transition = apply_counters(existing, &mut record, &mut counters, &mut resequence);
            match transition {
                Transition::Promoted => stats.promoted += 1,
                Transition::Demoted => stats.demoted += 1,
                Transition::Moved => {
                    stats.promoted += 1;
                    stats.demoted += 1;
                }
                Transition::Kept | Transition::Untouched => {}
            }

            debug!(
                key = %key,
                customer = %record.customer_id,
                transition = ?transition,
                sequence = ?record.visit_sequence,
                "merged record"
            );
            history.insert(key, record);
        }

        for customer_id in &resequence {
            resequence_and_stamp(&mut history, &mut counters, customer_id, now);
        }

        stats.skipped = skipped.len();
        stats.resequenced_customers = resequence.into_iter().collect();

        info!(
            batch = batch.len(),
            inserted = stats.inserted,
            updated = stats.updated,
            promoted = stats.promoted,
            demoted = stats.demoted,
            skipped = stats.skipped,
            "merged batch"
        );

        MergeOutcome {
            snapshot: Snapshot::new(history, counters),
            skipped,
            stats,
        }
    }

    /// New version of a record: imported fields from the row, sticky fields
    /// and the current sequence from the prior version.
    fn build_record(
        &self,
        key: &str,
        input: &InputRecord,
        existing: Option<&HistoryRecord>,
        now: DateTime<Utc>,
    ) -> HistoryRecord {
        let mut record = HistoryRecord::from_input(key, input, now);

        let staff = self.staff.classify(input.staff_text.as_deref());
        record.resolved_staff = staff.resolved_staff;
        record.was_unassigned_pool = staff.was_unassigned_pool;

        if let Some(prior) = existing {
            record.is_excluded_from_aggregates = prior.is_excluded_from_aggregates;
            record.manual_attendance_override = prior.manual_attendance_override;
            record.merge_group_id = prior.merge_group_id.clone();
            record.created_at = prior.created_at;
            record.set_sequence(prior.visit_sequence);
        }

        record.updated_at = now;
        record
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Promoted,
    Kept,
    Demoted,
    /// Attended before and after, but under a different customer
    Moved,
    Untouched,
}

fn promote(
    record: &mut HistoryRecord,
    counters: &mut CounterMap,
    resequence: &mut BTreeSet<String>,
) {
    let counter = counters
        .entry(record.customer_id.clone())
        .or_insert_with(|| CustomerVisitCounter::new(record.customer_id.clone()));

    if counter.is_back_dated(record.service_date) {
        resequence.insert(record.customer_id.clone());
    }

    let sequence = counter.promote(record.service_date);
    record.set_sequence(Some(sequence));
}

fn demote(customer_id: &str, counters: &mut CounterMap) {
    if let Some(counter) = counters.get_mut(customer_id) {
        counter.demote();
    }
}

fn apply_counters(
    existing: Option<&HistoryRecord>,
    record: &mut HistoryRecord,
    counters: &mut CounterMap,
    resequence: &mut BTreeSet<String>,
) -> Transition {
    let was_attended = existing.map_or(false, |r| r.counts_toward_sequence());
    let is_attended = record.counts_toward_sequence();

    match (was_attended, is_attended) {
        (false, true) => {
            promote(record, counters, resequence);
            Transition::Promoted
        }
        (true, true) => {
            let previous_customer = existing.map(|r| r.customer_id.as_str()).unwrap_or_default();
            if previous_customer == record.customer_id {
                Transition::Kept
            } else {
                demote(previous_customer, counters);
                promote(record, counters, resequence);
                Transition::Moved
            }
        }
        (true, false) => {
            let previous_customer = existing.map(|r| r.customer_id.as_str()).unwrap_or_default();
            demote(previous_customer, counters);
            record.set_sequence(None);
            Transition::Demoted
        }
        (false, false) => {
            record.set_sequence(None);
            Transition::Untouched
        }
    }
}

/// Renumber one customer. Records outside the batch whose sequence moved
/// are stamped with `now` like any other merge touch.
fn resequence_and_stamp(
    history: &mut HistoryMap,
    counters: &mut CounterMap,
    customer_id: &str,
    now: DateTime<Utc>,
) {
    let before: Vec<(String, Option<u32>)> = history
        .values()
        .filter(|r| r.customer_id == customer_id)
        .map(|r| (r.identity_key.clone(), r.visit_sequence))
        .collect();

    resequence_customer(history, counters, customer_id);

    for (key, sequence) in before {
        if let Some(record) = history.get_mut(&key) {
            if record.visit_sequence != sequence {
                record.updated_at = now;
            }
        }
    }
}

/// Convenience wrapper for callers holding separate maps
pub fn merge(
    engine: &MergeEngine,
    history: &HistoryMap,
    counters: &CounterMap,
    batch: &[InputRecord],
    now: DateTime<Utc>,
) -> MergeOutcome {
    let snapshot = Snapshot::new(history.clone(), counters.clone());
    engine.merge(&snapshot, batch, now)
}

// ============================================================================
// TESTS
// ============================================================================
