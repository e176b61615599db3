// 📤 Export - flattened record views and grouped summaries as CSV

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

use crate::aggregate::GroupSummary;
use crate::model::HistoryRecord;

/// One row per booking with human-readable dates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordView {
    pub identity_key: String,
    pub customer_id: String,
    pub display_name: String,
    pub service_date: String,
    pub submitted_at: String,
    pub booking_status: String,
    pub attendance_status: String,
    pub detail_status: String,
    pub is_attended: bool,
    pub visit_sequence: Option<u32>,
    pub visit_label: String,
    pub cancel_timing: String,
    pub staff: String,
    pub was_unassigned_pool: bool,
    pub course: String,
    pub excluded: bool,
    pub manual_override: String,
    pub merge_group_id: String,
}

impl From<&HistoryRecord> for RecordView {
    fn from(record: &HistoryRecord) -> Self {
        RecordView {
            identity_key: record.identity_key.clone(),
            customer_id: record.customer_id.clone(),
            display_name: record.display_name.clone(),
            service_date: record.service_date.format("%Y-%m-%d").to_string(),
            submitted_at: record.submitted_at.format("%Y-%m-%d %H:%M").to_string(),
            booking_status: record.booking_status.as_str().to_string(),
            attendance_status: record.attendance_status.as_str().to_string(),
            detail_status: record.detail_status.clone().unwrap_or_default(),
            is_attended: record.is_attended,
            visit_sequence: record.visit_sequence,
            visit_label: record.visit_label.map(|l| l.as_str().to_string()).unwrap_or_default(),
            cancel_timing: record.cancel_timing.as_str().to_string(),
            staff: record.resolved_staff.clone().unwrap_or_default(),
            was_unassigned_pool: record.was_unassigned_pool,
            course: record.course.clone().unwrap_or_default(),
            excluded: record.is_excluded_from_aggregates,
            manual_override: match record.manual_attendance_override.as_option() {
                None => String::new(),
                Some(true) => "attended".to_string(),
                Some(false) => "absent".to_string(),
            },
            merge_group_id: record.merge_group_id.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Serialize)]
struct GroupRow<'a> {
    key: &'a str,
    label: &'a str,
    total: usize,
    excluded: usize,
    attended: usize,
    cancelled: usize,
    same_day_cancels: usize,
    previous_day_cancels: usize,
    first_visits: usize,
    repeat_visits: usize,
    attendance_rate: f64,
    first_visit_rate: f64,
}

pub fn write_records_csv<W: Write>(writer: W, records: &[&HistoryRecord]) -> Result<usize> {
    let mut wtr = csv::Writer::from_writer(writer);
    for record in records {
        wtr.serialize(RecordView::from(*record))
            .with_context(|| format!("Failed to write record {}", record.identity_key))?;
    }
    wtr.flush().context("Failed to flush record CSV")?;
    Ok(records.len())
}

pub fn write_groups_csv<W: Write>(writer: W, groups: &[GroupSummary]) -> Result<usize> {
    let mut wtr = csv::Writer::from_writer(writer);
    for group in groups {
        let s = &group.summary;
        wtr.serialize(GroupRow {
            key: &group.key,
            label: &group.label,
            total: s.total,
            excluded: s.excluded,
            attended: s.attended,
            cancelled: s.cancelled,
            same_day_cancels: s.same_day_cancels,
            previous_day_cancels: s.previous_day_cancels,
            first_visits: s.first_visits,
            repeat_visits: s.repeat_visits,
            attendance_rate: s.attendance_rate,
            first_visit_rate: s.first_visit_rate,
        })
        .with_context(|| format!("Failed to write group {}", group.key))?;
    }
    wtr.flush().context("Failed to flush group CSV")?;
    Ok(groups.len())
}

pub fn export_records(path: &Path, records: &[&HistoryRecord]) -> Result<usize> {
    let file = std::fs::File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
    write_records_csv(file, records)
}
