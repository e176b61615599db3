// 🏷️ Classification Primitives - attendance, cancellation timing, visit labels
// Total functions: every input has a defined outcome, nothing here fails

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::model::{AttendanceStatus, BookingStatus, CancelTiming, HistoryRecord, VisitLabel};

// ============================================================================
// ATTENDANCE RULE
// ============================================================================

/// How late cancellations are treated by every aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttendanceRule {
    /// Late cancellations never count as attended
    Strict,

    /// Same-day and previous-day cancellations count as attended
    #[default]
    IncludeLateCancel,
}

impl AttendanceRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceRule::Strict => "strict",
            AttendanceRule::IncludeLateCancel => "include-late-cancel",
        }
    }
}

impl std::str::FromStr for AttendanceRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "strict" => Ok(AttendanceRule::Strict),
            "include-late-cancel" | "include-late" | "late-cancel" => {
                Ok(AttendanceRule::IncludeLateCancel)
            }
            other => Err(format!("unknown attendance rule: {}", other)),
        }
    }
}

// ============================================================================
// DETAIL STATUS
// ============================================================================

const SAME_DAY_CANCEL_TAGS: &[&str] = &["same-day-cancel", "当日キャンセル"];
const PREVIOUS_DAY_CANCEL_TAGS: &[&str] = &["previous-day-cancel", "前日キャンセル"];

/// Interpret a free-text detail status as a late-cancel tag.
///
/// Matching ignores case, surrounding whitespace, and treats `_` and spaces as
/// `-`, so "Same Day Cancel" and "same_day_cancel" are both recognised.
pub fn late_cancel_kind(detail_status: Option<&str>) -> Option<CancelTiming> {
    let detail = detail_status?.trim();
    if detail.is_empty() {
        return None;
    }

    let normalized = detail.to_lowercase().replace(['_', ' '], "-");
    if SAME_DAY_CANCEL_TAGS.contains(&normalized.as_str()) {
        Some(CancelTiming::SameDay)
    } else if PREVIOUS_DAY_CANCEL_TAGS.contains(&normalized.as_str()) {
        Some(CancelTiming::PreviousDay)
    } else {
        None
    }
}

pub fn is_late_cancel_detail(detail_status: Option<&str>) -> bool {
    late_cancel_kind(detail_status).is_some()
}

// ============================================================================
// ATTENDANCE PREDICATES
// ============================================================================

/// Automatic attendance: late cancellations count as a completed visit,
/// otherwise the booking must be booked and attended.
pub fn is_attended(
    booking_status: BookingStatus,
    attendance_status: AttendanceStatus,
    detail_status: Option<&str>,
) -> bool {
    if is_late_cancel_detail(detail_status) {
        return true;
    }

    booking_status == BookingStatus::Booked && attendance_status == AttendanceStatus::Attended
}

/// The predicate every aggregate uses.
///
/// Precedence, first hit wins:
/// 1. excluded from aggregates -> false
/// 2. manual override -> its value
/// 3. late cancellation -> depends on `rule`
/// 4. automatic `is_attended`
pub fn should_count_as_attended(record: &HistoryRecord, rule: AttendanceRule) -> bool {
    if record.is_excluded_from_aggregates {
        return false;
    }

    if let Some(forced) = record.manual_attendance_override.as_option() {
        return forced;
    }

    if record.is_late_cancel() {
        return rule == AttendanceRule::IncludeLateCancel;
    }

    is_attended(
        record.booking_status,
        record.attendance_status,
        record.detail_status.as_deref(),
    )
}

// ============================================================================
// CANCELLATION TIMING
// ============================================================================

/// Classify how far ahead of the service date a cancellation was submitted.
///
/// Both dates are compared at midnight. A submission after the service date
/// (negative day difference) is classified as `Early`.
pub fn classify_cancel_timing(
    service_date: NaiveDate,
    submitted_at: NaiveDateTime,
    booking_status: BookingStatus,
) -> CancelTiming {
    if booking_status != BookingStatus::Cancelled {
        return CancelTiming::None;
    }

    let day_diff = (service_date - submitted_at.date()).num_days();
    match day_diff {
        0 => CancelTiming::SameDay,
        1 => CancelTiming::PreviousDay,
        _ => CancelTiming::Early,
    }
}

// ============================================================================
// VISIT LABEL
// ============================================================================

pub fn visit_label_of(sequence: u32) -> VisitLabel {
    match sequence {
        1 => VisitLabel::First,
        2 => VisitLabel::Second,
        _ => VisitLabel::ThirdOrMore,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttendanceOverride, InputRecord};
    use chrono::Utc;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn at(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        date(y, m, d).and_hms_opt(h, 0, 0).unwrap()
    }

    fn create_test_record(
        booking: BookingStatus,
        attendance: AttendanceStatus,
        detail: Option<&str>,
    ) -> HistoryRecord {
        let mut input = InputRecord::new(
            "C-001",
            "Test Customer",
            date(2024, 12, 5),
            booking,
            attendance,
            at(2024, 12, 1, 10),
        );
        input.detail_status = detail.map(str::to_string);
        HistoryRecord::from_input("BK-1", &input, Utc::now())
    }

    #[test]
    fn test_cancel_timing_boundaries() {
        let service = date(2024, 12, 5);
        let cancelled = BookingStatus::Cancelled;

        let timing =
            |d: u32, h: u32| classify_cancel_timing(service, at(2024, 12, d, h), cancelled);

        assert_eq!(timing(5, 23), CancelTiming::SameDay);
        assert_eq!(timing(4, 0), CancelTiming::PreviousDay);
        assert_eq!(timing(1, 12), CancelTiming::Early);
        assert_eq!(timing(3, 12), CancelTiming::Early);
    }

    #[test]
    fn test_cancel_timing_booked_is_none() {
        let service = date(2024, 12, 5);
        assert_eq!(
            classify_cancel_timing(service, at(2024, 12, 5, 9), BookingStatus::Booked),
            CancelTiming::None
        );
        assert_eq!(
            classify_cancel_timing(service, at(2024, 11, 1, 9), BookingStatus::Booked),
            CancelTiming::None
        );
    }

    #[test]
    fn test_cancel_submitted_after_service_is_early() {
        let timing =
            classify_cancel_timing(date(2024, 12, 5), at(2024, 12, 7, 8), BookingStatus::Cancelled);
        assert_eq!(timing, CancelTiming::Early);
    }

    #[test]
    fn test_late_cancel_detail_recognition() {
        assert_eq!(late_cancel_kind(Some("same-day-cancel")), Some(CancelTiming::SameDay));
        assert_eq!(
            late_cancel_kind(Some(" Previous Day Cancel ")),
            Some(CancelTiming::PreviousDay)
        );
        assert_eq!(late_cancel_kind(Some("前日キャンセル")), Some(CancelTiming::PreviousDay));
        assert_eq!(late_cancel_kind(Some("early-cancel")), None);
        assert_eq!(late_cancel_kind(Some("")), None);
        assert_eq!(late_cancel_kind(None), None);
    }

    #[test]
    fn test_is_attended() {
        use AttendanceStatus::*;
        use BookingStatus::*;

        assert!(is_attended(Booked, Attended, None));
        assert!(!is_attended(Booked, NotAttended, None));
        assert!(!is_attended(Cancelled, Attended, None));
        assert!(is_attended(Cancelled, NotAttended, Some("same-day-cancel")));
        assert!(is_attended(Cancelled, NotAttended, Some("previous-day-cancel")));
        assert!(!is_attended(Cancelled, NotAttended, Some("customer request")));
    }

    #[test]
    fn test_exclusion_beats_everything() {
        let mut record =
            create_test_record(BookingStatus::Booked, AttendanceStatus::Attended, None);
        record.is_excluded_from_aggregates = true;
        record.manual_attendance_override = AttendanceOverride::ForceAttended;

        assert!(!should_count_as_attended(&record, AttendanceRule::IncludeLateCancel));
        assert!(!should_count_as_attended(&record, AttendanceRule::Strict));
    }

    #[test]
    fn test_override_false_beats_is_attended() {
        let mut record =
            create_test_record(BookingStatus::Booked, AttendanceStatus::Attended, None);
        assert!(record.is_attended);

        record.manual_attendance_override = AttendanceOverride::ForceAbsent;
        assert!(!should_count_as_attended(&record, AttendanceRule::IncludeLateCancel));
    }

    #[test]
    fn test_override_true_beats_strict_rule() {
        let mut record = create_test_record(
            BookingStatus::Cancelled,
            AttendanceStatus::NotAttended,
            Some("same-day-cancel"),
        );
        assert!(!should_count_as_attended(&record, AttendanceRule::Strict));

        record.manual_attendance_override = AttendanceOverride::ForceAttended;
        assert!(should_count_as_attended(&record, AttendanceRule::Strict));
    }

    #[test]
    fn test_late_cancel_follows_rule() {
        let record = create_test_record(
            BookingStatus::Cancelled,
            AttendanceStatus::NotAttended,
            Some("previous-day-cancel"),
        );
        assert!(should_count_as_attended(&record, AttendanceRule::IncludeLateCancel));
        assert!(!should_count_as_attended(&record, AttendanceRule::Strict));
    }

    #[test]
    fn test_visit_labels() {
        assert_eq!(visit_label_of(1), VisitLabel::First);
        assert_eq!(visit_label_of(2), VisitLabel::Second);
        assert_eq!(visit_label_of(3), VisitLabel::ThirdOrMore);
        assert_eq!(visit_label_of(40), VisitLabel::ThirdOrMore);
    }

    #[test]
    fn test_rule_parse() {
        assert_eq!("strict".parse::<AttendanceRule>(), Ok(AttendanceRule::Strict));
        assert_eq!(
            "include_late_cancel".parse::<AttendanceRule>(),
            Ok(AttendanceRule::IncludeLateCancel)
        );
        assert!("lenient".parse::<AttendanceRule>().is_err());
    }
}
