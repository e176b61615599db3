// 📇 Booking Model - canonical history records and visit counters
// One HistoryRecord per booking event, upserted by identity key across re-imports

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::classify;

// ============================================================================
// STATUS ENUMS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BookingStatus {
    Booked,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Booked => "booked",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttendanceStatus {
    Attended,
    NotAttended,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Attended => "attended",
            AttendanceStatus::NotAttended => "not-attended",
        }
    }
}

/// Label derived from a visit sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VisitLabel {
    First,
    Second,
    ThirdOrMore,
}

impl VisitLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            VisitLabel::First => "first",
            VisitLabel::Second => "second",
            VisitLabel::ThirdOrMore => "third-or-more",
        }
    }
}

/// Timing of a cancellation relative to the service date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CancelTiming {
    #[default]
    None,
    SameDay,
    PreviousDay,
    Early,
}

impl CancelTiming {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelTiming::None => "none",
            CancelTiming::SameDay => "same-day",
            CancelTiming::PreviousDay => "previous-day",
            CancelTiming::Early => "early",
        }
    }
}

/// Manual attendance override set by an operator.
///
/// `Auto` leaves the decision to the classification rules; the other two
/// variants force the outcome regardless of imported statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttendanceOverride {
    #[default]
    Auto,
    ForceAttended,
    ForceAbsent,
}

impl AttendanceOverride {
    pub fn as_option(&self) -> Option<bool> {
        match self {
            AttendanceOverride::Auto => None,
            AttendanceOverride::ForceAttended => Some(true),
            AttendanceOverride::ForceAbsent => Some(false),
        }
    }

    pub fn from_option(value: Option<bool>) -> Self {
        match value {
            None => AttendanceOverride::Auto,
            Some(true) => AttendanceOverride::ForceAttended,
            Some(false) => AttendanceOverride::ForceAbsent,
        }
    }

    pub fn is_set(&self) -> bool {
        *self != AttendanceOverride::Auto
    }
}

/// Which date a campaign period filters on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DateAxis {
    SubmittedAt,
    #[default]
    ServiceDate,
}

impl std::str::FromStr for DateAxis {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "submitted-at" | "submitted" => Ok(DateAxis::SubmittedAt),
            "service-date" | "service" => Ok(DateAxis::ServiceDate),
            other => Err(format!("unknown date axis: {}", other)),
        }
    }
}

// ============================================================================
// INPUT RECORD (handoff from the import collaborator)
// ============================================================================

/// One parsed row of an import batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputRecord {
    /// Stable booking key from the source, if any
    pub booking_id: Option<String>,
    pub customer_id: String,
    pub display_name: String,
    pub service_date: NaiveDate,
    pub booking_status: BookingStatus,
    pub attendance_status: AttendanceStatus,
    pub submitted_at: NaiveDateTime,
    /// Submission timestamp exactly as exported; feeds the fallback key
    pub submitted_raw: String,
    pub detail_status: Option<String>,
    pub staff_text: Option<String>,
    pub course: Option<String>,
}

impl InputRecord {
    pub fn new(
        customer_id: impl Into<String>,
        display_name: impl Into<String>,
        service_date: NaiveDate,
        booking_status: BookingStatus,
        attendance_status: AttendanceStatus,
        submitted_at: NaiveDateTime,
    ) -> Self {
        InputRecord {
            booking_id: None,
            customer_id: customer_id.into(),
            display_name: display_name.into(),
            service_date,
            booking_status,
            attendance_status,
            submitted_at,
            submitted_raw: submitted_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            detail_status: None,
            staff_text: None,
            course: None,
        }
    }

    pub fn with_booking_id(mut self, booking_id: impl Into<String>) -> Self {
        self.booking_id = Some(booking_id.into());
        self
    }

    pub fn with_detail_status(mut self, detail: impl Into<String>) -> Self {
        self.detail_status = Some(detail.into());
        self
    }

    pub fn with_staff_text(mut self, text: impl Into<String>) -> Self {
        self.staff_text = Some(text.into());
        self
    }

    pub fn with_course(mut self, course: impl Into<String>) -> Self {
        self.course = Some(course.into());
        self
    }

    pub fn with_submitted_raw(mut self, raw: impl Into<String>) -> Self {
        self.submitted_raw = raw.into();
        self
    }

    /// Resolve the identity key: the booking id when present, otherwise the
    /// fallback composite. `None` when neither can be formed.
    pub fn identity_key(&self) -> Option<String> {
        if let Some(id) = self.booking_id.as_deref().map(str::trim) {
            if !id.is_empty() {
                return Some(id.to_string());
            }
        }

        let customer = self.customer_id.trim();
        let raw = self.submitted_raw.trim();
        if customer.is_empty() || raw.is_empty() {
            return None;
        }

        Some(fallback_identity_key(customer, self.service_date, raw))
    }
}

/// Deterministic key for rows exported without a booking id.
pub fn fallback_identity_key(
    customer_id: &str,
    service_date: NaiveDate,
    submitted_raw: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!(
        "{}|{}|{}",
        customer_id.trim(),
        service_date.format("%Y-%m-%d"),
        submitted_raw.trim()
    ));
    format!("fb:{:x}", hasher.finalize())
}

// ============================================================================
// HISTORY RECORD (canonical, one per identity key)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    // ========================================================================
    // IDENTITY
    // ========================================================================
    pub identity_key: String,

    #[serde(default)]
    pub booking_id: Option<String>,

    pub customer_id: String,
    pub display_name: String,

    // ========================================================================
    // DATE AXES
    // ========================================================================
    /// When the service occurs/occurred
    pub service_date: NaiveDate,

    /// When the booking or cancellation request was made
    pub submitted_at: NaiveDateTime,

    #[serde(default)]
    pub submitted_raw: String,

    // ========================================================================
    // STATUS + DERIVED
    // ========================================================================
    pub booking_status: BookingStatus,
    pub attendance_status: AttendanceStatus,

    #[serde(default)]
    pub detail_status: Option<String>,

    pub is_attended: bool,

    /// 1-based ordinal within the customer's attended history; None when unset
    #[serde(default)]
    pub visit_sequence: Option<u32>,

    #[serde(default)]
    pub visit_label: Option<VisitLabel>,

    #[serde(default)]
    pub cancel_timing: CancelTiming,

    // ========================================================================
    // STAFF + COURSE
    // ========================================================================
    #[serde(default)]
    pub raw_staff_text: Option<String>,

    #[serde(default)]
    pub resolved_staff: Option<String>,

    #[serde(default)]
    pub was_unassigned_pool: bool,

    #[serde(default)]
    pub course: Option<String>,

    // ========================================================================
    // MANUAL OVERRIDES (sticky across re-imports)
    // ========================================================================
    #[serde(default)]
    pub is_excluded_from_aggregates: bool,

    #[serde(default)]
    pub manual_attendance_override: AttendanceOverride,

    #[serde(default)]
    pub merge_group_id: Option<String>,

    // ========================================================================
    // AUDIT
    // ========================================================================
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl HistoryRecord {
    /// Build a first-sighting record from an input row. Derived fields are
    /// filled from the row; sequence fields start unset.
    pub fn from_input(key: &str, input: &InputRecord, now: DateTime<Utc>) -> Self {
        let detail = input.detail_status.as_deref().map(str::trim).filter(|d| !d.is_empty());

        HistoryRecord {
            identity_key: key.to_string(),
            booking_id: input
                .booking_id
                .as_deref()
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string),
            customer_id: input.customer_id.trim().to_string(),
            display_name: input.display_name.trim().to_string(),
            service_date: input.service_date,
            submitted_at: input.submitted_at,
            submitted_raw: input.submitted_raw.clone(),
            booking_status: input.booking_status,
            attendance_status: input.attendance_status,
            detail_status: detail.map(str::to_string),
            is_attended: classify::is_attended(
                input.booking_status,
                input.attendance_status,
                detail,
            ),
            visit_sequence: None,
            visit_label: None,
            cancel_timing: classify::classify_cancel_timing(
                input.service_date,
                input.submitted_at,
                input.booking_status,
            ),
            raw_staff_text: input.staff_text.clone(),
            resolved_staff: None,
            was_unassigned_pool: false,
            course: input
                .course
                .as_deref()
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string),
            is_excluded_from_aggregates: false,
            manual_attendance_override: AttendanceOverride::Auto,
            merge_group_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Attendance as used for visit sequencing: the manual override when set,
    /// otherwise the automatic `is_attended` value.
    pub fn counts_toward_sequence(&self) -> bool {
        self.manual_attendance_override
            .as_option()
            .unwrap_or(self.is_attended)
    }

    /// Detail status marks this booking as a same-day or previous-day cancel
    pub fn is_late_cancel(&self) -> bool {
        classify::is_late_cancel_detail(self.detail_status.as_deref())
    }

    /// Recompute `is_attended` and `cancel_timing` from the current fields
    pub fn refresh_derived(&mut self) {
        self.is_attended = classify::is_attended(
            self.booking_status,
            self.attendance_status,
            self.detail_status.as_deref(),
        );
        self.cancel_timing = classify::classify_cancel_timing(
            self.service_date,
            self.submitted_at,
            self.booking_status,
        );
    }

    /// Set or clear the visit sequence, keeping the label in step.
    pub fn set_sequence(&mut self, sequence: Option<u32>) {
        self.visit_sequence = sequence;
        self.visit_label = sequence.map(classify::visit_label_of);
    }

    /// Calendar date of this record on the given axis
    pub fn date_on(&self, axis: DateAxis) -> NaiveDate {
        match axis {
            DateAxis::ServiceDate => self.service_date,
            DateAxis::SubmittedAt => self.submitted_at.date(),
        }
    }
}

// ============================================================================
// CUSTOMER VISIT COUNTER (derived cache)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerVisitCounter {
    pub customer_id: String,

    /// Highest visit sequence handed out for this customer
    pub attended_count: u32,

    #[serde(default)]
    pub last_service_date: Option<NaiveDate>,
}

impl CustomerVisitCounter {
    pub fn new(customer_id: impl Into<String>) -> Self {
        CustomerVisitCounter {
            customer_id: customer_id.into(),
            attended_count: 0,
            last_service_date: None,
        }
    }

    /// Count a newly attended visit and return its sequence number
    pub fn promote(&mut self, service_date: NaiveDate) -> u32 {
        self.attended_count += 1;
        self.last_service_date = Some(match self.last_service_date {
            Some(last) if last > service_date => last,
            _ => service_date,
        });
        self.attended_count
    }

    pub fn demote(&mut self) {
        self.attended_count = self.attended_count.saturating_sub(1);
    }

    /// True when a promotion on `service_date` would not be the latest visit
    pub fn is_back_dated(&self, service_date: NaiveDate) -> bool {
        self.attended_count > 0
            && self
                .last_service_date
                .map_or(false, |last| service_date <= last)
    }
}

// ============================================================================
// SNAPSHOT
// ============================================================================

pub type HistoryMap = BTreeMap<String, HistoryRecord>;
pub type CounterMap = BTreeMap<String, CustomerVisitCounter>;

/// Canonical state handed to and returned from the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub history: HistoryMap,
    pub counters: CounterMap,
}

impl Snapshot {
    pub fn new(history: HistoryMap, counters: CounterMap) -> Self {
        Snapshot { history, counters }
    }

    /// All records for one customer, ordered by service date then key
    pub fn records_for_customer(&self, customer_id: &str) -> Vec<&HistoryRecord> {
        let mut records: Vec<&HistoryRecord> = self
            .history
            .values()
            .filter(|r| r.customer_id == customer_id)
            .collect();
        records.sort_by(|a, b| {
            a.service_date
                .cmp(&b.service_date)
                .then_with(|| a.identity_key.cmp(&b.identity_key))
        });
        records
    }

    pub fn counter(&self, customer_id: &str) -> Option<&CustomerVisitCounter> {
        self.counters.get(customer_id)
    }
}

// ============================================================================
// CAMPAIGN PERIOD
// ============================================================================

/// Read-only filter window, inclusive on both ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignPeriod {
    pub period_from: NaiveDate,
    pub period_to: NaiveDate,
    #[serde(default)]
    pub date_axis: DateAxis,
}

impl CampaignPeriod {
    pub fn new(period_from: NaiveDate, period_to: NaiveDate, date_axis: DateAxis) -> Self {
        CampaignPeriod {
            period_from,
            period_to,
            date_axis,
        }
    }

    /// `[period_from 00:00, end_of_day(period_to)]` on the configured axis
    pub fn contains(&self, record: &HistoryRecord) -> bool {
        let day = record.date_on(self.date_axis);
        day >= self.period_from && day <= self.period_to
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn input(booking_id: Option<&str>) -> InputRecord {
        let mut row = InputRecord::new(
            "C-001",
            "Hanako",
            date(2024, 12, 5),
            BookingStatus::Booked,
            AttendanceStatus::Attended,
            date(2024, 12, 1).and_hms_opt(9, 30, 0).unwrap(),
        );
        row.booking_id = booking_id.map(str::to_string);
        row
    }

    #[test]
    fn test_identity_prefers_booking_id() {
        assert_eq!(input(Some("  BK-9 ")).identity_key(), Some("BK-9".to_string()));
    }

    #[test]
    fn test_fallback_key_is_stable() {
        let a = input(None).identity_key().unwrap();
        let b = input(Some("   ")).identity_key().unwrap();

        assert!(a.starts_with("fb:"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 3 + 64);
    }

    #[test]
    fn test_fallback_key_depends_on_raw_submission() {
        let a = input(None).identity_key().unwrap();
        let b = input(None).with_submitted_raw("2024/12/01 9:30").identity_key().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_missing_identity() {
        let mut row = input(None).with_submitted_raw("");
        assert_eq!(row.identity_key(), None);

        row.submitted_raw = "2024-12-01".to_string();
        row.customer_id = " ".to_string();
        assert_eq!(row.identity_key(), None);
    }

    #[test]
    fn test_override_tri_state() {
        assert_eq!(AttendanceOverride::from_option(None), AttendanceOverride::Auto);
        assert_eq!(AttendanceOverride::ForceAbsent.as_option(), Some(false));
        assert!(!AttendanceOverride::Auto.is_set());
    }

    #[test]
    fn test_counter_promote_and_demote() {
        let mut counter = CustomerVisitCounter::new("C-001");
        assert_eq!(counter.promote(date(2024, 12, 5)), 1);
        assert_eq!(counter.promote(date(2024, 12, 1)), 2);
        assert_eq!(counter.last_service_date, Some(date(2024, 12, 5)));
        assert!(counter.is_back_dated(date(2024, 12, 5)));
        assert!(!counter.is_back_dated(date(2024, 12, 6)));

        counter.demote();
        counter.demote();
        counter.demote();
        assert_eq!(counter.attended_count, 0);
    }

    #[test]
    fn test_campaign_period_end_of_day() {
        let now = Utc::now();
        let mut record = HistoryRecord::from_input("k", &input(None), now);
        record.submitted_at = date(2024, 12, 31).and_hms_opt(23, 59, 59).unwrap();

        let period =
            CampaignPeriod::new(date(2024, 12, 1), date(2024, 12, 31), DateAxis::SubmittedAt);
        assert!(period.contains(&record));

        record.submitted_at = date(2025, 1, 1).and_hms_opt(0, 0, 0).unwrap();
        assert!(!period.contains(&record));
    }

    #[test]
    fn test_date_axis_parse() {
        assert_eq!("submitted_at".parse::<DateAxis>(), Ok(DateAxis::SubmittedAt));
        assert_eq!("service-date".parse::<DateAxis>(), Ok(DateAxis::ServiceDate));
        assert!("booking".parse::<DateAxis>().is_err());
    }
}
