// 🧹 Same-Day Collapse - one representative per customer per service day
// Read-time view: canonical history is never modified by the collapse itself

use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::model::{HistoryMap, HistoryRecord};

type GroupKey = (String, NaiveDate);

fn group_key(record: &HistoryRecord) -> GroupKey {
    (record.customer_id.clone(), record.service_date)
}

/// Ranking inside a same-day group. `Less` means `a` is the better
/// representative: included before excluded, then attended, then earliest
/// submission, then key.
fn rank(a: &HistoryRecord, b: &HistoryRecord) -> Ordering {
    a.is_excluded_from_aggregates
        .cmp(&b.is_excluded_from_aggregates)
        .then_with(|| b.counts_toward_sequence().cmp(&a.counts_toward_sequence()))
        .then_with(|| a.submitted_at.cmp(&b.submitted_at))
        .then_with(|| a.identity_key.cmp(&b.identity_key))
}

/// Collapse same-day bookings by one customer into a single representative.
///
/// Identity when `enabled` is false. Representatives keep their position
/// from `records`; the other group members are dropped from the view.
pub fn collapse_same_day<'a>(
    records: &[&'a HistoryRecord],
    enabled: bool,
) -> Vec<&'a HistoryRecord> {
    if !enabled {
        return records.to_vec();
    }

    let mut winners: BTreeMap<GroupKey, &'a HistoryRecord> = BTreeMap::new();
    for &record in records {
        winners
            .entry(group_key(record))
            .and_modify(|current| {
                if rank(record, current) == Ordering::Less {
                    *current = record;
                }
            })
            .or_insert(record);
    }

    records
        .iter()
        .copied()
        .filter(|record| {
            winners
                .get(&group_key(record))
                .map_or(false, |winner| std::ptr::eq(*winner, *record))
        })
        .collect()
}

// ============================================================================
// MERGE GROUPS
// ============================================================================

/// Deterministic group id for a customer's bookings on one service day
pub fn merge_group_id_for(customer_id: &str, service_date: NaiveDate) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}|{}", customer_id, service_date.format("%Y-%m-%d")));
    let digest = format!("{:x}", hasher.finalize());
    format!("grp:{}", &digest[..16])
}

/// Stamp a merge group id on every member of a multi-record same-day group.
///
/// Records that already carry an id keep it, so an operator's manual
/// grouping survives.
pub fn assign_merge_groups(history: &HistoryMap) -> HistoryMap {
    let mut sizes: BTreeMap<GroupKey, usize> = BTreeMap::new();
    for record in history.values() {
        *sizes.entry(group_key(record)).or_insert(0) += 1;
    }

    history
        .iter()
        .map(|(key, record)| {
            let mut record = record.clone();
            let size = sizes.get(&group_key(&record)).copied().unwrap_or(0);
            if size > 1 && record.merge_group_id.is_none() {
                record.merge_group_id =
                    Some(merge_group_id_for(&record.customer_id, record.service_date));
            }
            (key.clone(), record)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttendanceStatus, BookingStatus, InputRecord};
    use chrono::Utc;

    fn create_test_record(
        key: &str,
        customer: &str,
        day: u32,
        hour: u32,
        attended: bool,
    ) -> HistoryRecord {
        let input = InputRecord::new(
            customer,
            customer,
            NaiveDate::from_ymd_opt(2024, 12, day).unwrap(),
            BookingStatus::Booked,
            if attended {
                AttendanceStatus::Attended
            } else {
                AttendanceStatus::NotAttended
            },
            NaiveDate::from_ymd_opt(2024, 11, 30)
                .unwrap()
                .and_hms_opt(hour, 0, 0)
                .unwrap(),
        );
        HistoryRecord::from_input(key, &input, Utc::now())
    }

    fn keys(records: &[&HistoryRecord]) -> Vec<String> {
        records.iter().map(|r| r.identity_key.clone()).collect()
    }

    #[test]
    fn test_disabled_is_identity() {
        let a = create_test_record("a", "F1", 1, 9, true);
        let b = create_test_record("b", "F1", 1, 10, true);
        let records = vec![&a, &b];

        assert_eq!(keys(&collapse_same_day(&records, false)), vec!["a", "b"]);
    }

    #[test]
    fn test_attended_beats_earlier_submission() {
        let not_attended = create_test_record("early", "F1", 1, 8, false);
        let attended = create_test_record("late", "F1", 1, 17, true);

        let forward = collapse_same_day(&[&not_attended, &attended], true);
        let backward = collapse_same_day(&[&attended, &not_attended], true);

        assert_eq!(keys(&forward), vec!["late"]);
        assert_eq!(keys(&backward), vec!["late"]);
    }

    #[test]
    fn test_excluded_record_never_hides_included_sibling() {
        let mut excluded = create_test_record("att", "F1", 1, 8, true);
        excluded.is_excluded_from_aggregates = true;
        let included = create_test_record("abs", "F1", 1, 12, false);

        let view = collapse_same_day(&[&excluded, &included], true);
        assert_eq!(keys(&view), vec!["abs"]);
    }

    #[test]
    fn test_earliest_submission_wins_tie() {
        let first = create_test_record("x2", "F1", 1, 8, true);
        let second = create_test_record("x1", "F1", 1, 11, true);

        let view = collapse_same_day(&[&second, &first], true);
        assert_eq!(keys(&view), vec!["x2"]);
    }

    #[test]
    fn test_groups_are_per_customer_and_day() {
        let a = create_test_record("a", "F1", 1, 9, true);
        let b = create_test_record("b", "F1", 2, 9, true);
        let c = create_test_record("c", "F2", 1, 9, false);
        let d = create_test_record("d", "F2", 1, 10, false);

        let view = collapse_same_day(&[&a, &b, &c, &d], true);
        assert_eq!(keys(&view), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_assign_merge_groups_only_multi_record_groups() {
        let mut history = HistoryMap::new();
        for record in [
            create_test_record("a", "F1", 1, 9, true),
            create_test_record("b", "F1", 1, 12, false),
            create_test_record("c", "F1", 2, 9, true),
        ] {
            history.insert(record.identity_key.clone(), record);
        }
        history.get_mut("b").unwrap().merge_group_id = Some("manual".to_string());

        let grouped = assign_merge_groups(&history);
        let expected = merge_group_id_for("F1", NaiveDate::from_ymd_opt(2024, 12, 1).unwrap());

        assert_eq!(grouped["a"].merge_group_id.as_deref(), Some(expected.as_str()));
        assert_eq!(grouped["b"].merge_group_id.as_deref(), Some("manual"));
        assert_eq!(grouped["c"].merge_group_id, None);
        assert!(expected.starts_with("grp:"));
    }
}
