// 📊 Aggregation Layer - period filters, summaries and grouped summaries
// Every variant goes through the same Tally so predicates can never diverge

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::classify::{should_count_as_attended, AttendanceRule};
use crate::collapse::collapse_same_day;
use crate::model::{
    BookingStatus, CampaignPeriod, CancelTiming, DateAxis, HistoryMap, HistoryRecord,
};

pub const UNASSIGNED_POOL_KEY: &str = "(unassigned pool)";
pub const UNATTRIBUTED_KEY: &str = "(unattributed)";
pub const NO_COURSE_KEY: &str = "(no course)";

// ============================================================================
// SUMMARY
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    /// Records not excluded from aggregates
    pub total: usize,
    pub excluded: usize,
    pub attended: usize,

    /// Cancelled and not counted as attended
    pub cancelled: usize,
    pub same_day_cancels: usize,
    pub previous_day_cancels: usize,

    pub first_visits: usize,
    pub repeat_visits: usize,

    /// attended / total, percent with one decimal
    pub attendance_rate: f64,

    /// first_visits / attended, percent with one decimal
    pub first_visit_rate: f64,
}

/// Percentage rounded half-up at the tenths digit, computed on integers so
/// 1/8 = 12.5% and 1/3 = 33.3% come out exact. Zero denominator gives 0.0.
pub fn percentage(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        return 0.0;
    }

    let num = numerator as u64;
    let den = denominator as u64;
    let tenths = (2 * num * 1000 + den) / (2 * den);
    tenths as f64 / 10.0
}

#[derive(Debug, Default)]
struct Tally {
    total: usize,
    excluded: usize,
    attended: usize,
    cancelled: usize,
    same_day_cancels: usize,
    previous_day_cancels: usize,
    first_visits: usize,
    repeat_visits: usize,
}

impl Tally {
    fn add(&mut self, record: &HistoryRecord, rule: AttendanceRule) {
        if record.is_excluded_from_aggregates {
            self.excluded += 1;
            return;
        }

        self.total += 1;
        let counted = should_count_as_attended(record, rule);

        if counted {
            self.attended += 1;
            match record.visit_sequence {
                Some(1) => self.first_visits += 1,
                Some(_) => self.repeat_visits += 1,
                None => {}
            }
        } else if record.booking_status == BookingStatus::Cancelled {
            self.cancelled += 1;
        }

        match record.cancel_timing {
            CancelTiming::SameDay => self.same_day_cancels += 1,
            CancelTiming::PreviousDay => self.previous_day_cancels += 1,
            CancelTiming::Early | CancelTiming::None => {}
        }
    }

    fn finish(self) -> Summary {
        Summary {
            total: self.total,
            excluded: self.excluded,
            attended: self.attended,
            cancelled: self.cancelled,
            same_day_cancels: self.same_day_cancels,
            previous_day_cancels: self.previous_day_cancels,
            first_visits: self.first_visits,
            repeat_visits: self.repeat_visits,
            attendance_rate: percentage(self.attended, self.total),
            first_visit_rate: percentage(self.first_visits, self.attended),
        }
    }
}

// ============================================================================
// FILTER + SUMMARIZE
// ============================================================================

/// Records inside the period on its date axis, in key order. Nothing else is
/// filtered here; exclusion and overrides are applied by the summaries.
pub fn filter_by_period<'a>(
    history: &'a HistoryMap,
    period: &CampaignPeriod,
) -> Vec<&'a HistoryRecord> {
    history.values().filter(|r| period.contains(r)).collect()
}

pub fn summarize(records: &[&HistoryRecord], rule: AttendanceRule) -> Summary {
    let mut tally = Tally::default();
    for &record in records {
        tally.add(record, rule);
    }
    tally.finish()
}

// ============================================================================
// GROUPED SUMMARIES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroupDimension {
    Day,
    Month,
    Staff,
    Course,
    Customer,
}

impl GroupDimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupDimension::Day => "day",
            GroupDimension::Month => "month",
            GroupDimension::Staff => "staff",
            GroupDimension::Course => "course",
            GroupDimension::Customer => "customer",
        }
    }
}

impl std::str::FromStr for GroupDimension {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "day" | "daily" => Ok(GroupDimension::Day),
            "month" | "monthly" => Ok(GroupDimension::Month),
            "staff" => Ok(GroupDimension::Staff),
            "course" => Ok(GroupDimension::Course),
            "customer" => Ok(GroupDimension::Customer),
            other => Err(format!("unknown group dimension: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSummary {
    /// Sort key of the group (date, month, staff name, course, customer id)
    pub key: String,

    /// Human-readable name; the display name for customer groups
    pub label: String,

    pub summary: Summary,
}

/// Single pass over `records`, bucketing by `key_of` -> (key, label).
/// The first label seen for a key is kept. Groups come out in key order.
pub fn group_by<F>(records: &[&HistoryRecord], rule: AttendanceRule, key_of: F) -> Vec<GroupSummary>
where
    F: Fn(&HistoryRecord) -> (String, String),
{
    let mut groups: BTreeMap<String, (String, Tally)> = BTreeMap::new();

    for &record in records {
        let (key, label) = key_of(record);
        groups
            .entry(key)
            .or_insert_with(|| (label, Tally::default()))
            .1
            .add(record, rule);
    }

    groups
        .into_iter()
        .map(|(key, (label, tally))| GroupSummary {
            key,
            label,
            summary: tally.finish(),
        })
        .collect()
}

fn same(key: String) -> (String, String) {
    (key.clone(), key)
}

pub fn staff_group_key(record: &HistoryRecord) -> String {
    match &record.resolved_staff {
        Some(name) => name.clone(),
        None if record.was_unassigned_pool => UNASSIGNED_POOL_KEY.to_string(),
        None => UNATTRIBUTED_KEY.to_string(),
    }
}

pub fn summarize_by_day(
    records: &[&HistoryRecord],
    rule: AttendanceRule,
    axis: DateAxis,
) -> Vec<GroupSummary> {
    group_by(records, rule, |r| same(r.date_on(axis).format("%Y-%m-%d").to_string()))
}

pub fn summarize_by_month(
    records: &[&HistoryRecord],
    rule: AttendanceRule,
    axis: DateAxis,
) -> Vec<GroupSummary> {
    group_by(records, rule, |r| same(r.date_on(axis).format("%Y-%m").to_string()))
}

pub fn summarize_by_staff(records: &[&HistoryRecord], rule: AttendanceRule) -> Vec<GroupSummary> {
    group_by(records, rule, |r| same(staff_group_key(r)))
}

pub fn summarize_by_course(records: &[&HistoryRecord], rule: AttendanceRule) -> Vec<GroupSummary> {
    group_by(records, rule, |r| {
        same(r.course.clone().unwrap_or_else(|| NO_COURSE_KEY.to_string()))
    })
}

pub fn summarize_by_customer(
    records: &[&HistoryRecord],
    rule: AttendanceRule,
) -> Vec<GroupSummary> {
    group_by(records, rule, |r| (r.customer_id.clone(), r.display_name.clone()))
}

pub fn summarize_by(
    records: &[&HistoryRecord],
    rule: AttendanceRule,
    dimension: GroupDimension,
    axis: DateAxis,
) -> Vec<GroupSummary> {
    match dimension {
        GroupDimension::Day => summarize_by_day(records, rule, axis),
        GroupDimension::Month => summarize_by_month(records, rule, axis),
        GroupDimension::Staff => summarize_by_staff(records, rule),
        GroupDimension::Course => summarize_by_course(records, rule),
        GroupDimension::Customer => summarize_by_customer(records, rule),
    }
}

// ============================================================================
// REPORT SELECTION (shared by the CLI and the JSON API)
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportOptions {
    pub period: Option<CampaignPeriod>,
    pub rule: AttendanceRule,
    pub collapse_same_day: bool,
}

/// Period filter followed by the optional same-day collapse
pub fn select_records<'a>(
    history: &'a HistoryMap,
    options: &ReportOptions,
) -> Vec<&'a HistoryRecord> {
    let in_period: Vec<&HistoryRecord> = match &options.period {
        Some(period) => filter_by_period(history, period),
        None => history.values().collect(),
    };
    collapse_same_day(&in_period, options.collapse_same_day)
}
