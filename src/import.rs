// 📥 CSV Import - booking exports into merge-ready InputRecords
// Rows missing required fields are rejected here and never reach the merge engine

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use serde::Deserialize;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

use crate::model::{AttendanceStatus, BookingStatus, InputRecord};

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("line {line}: missing required field `{field}`")]
    MissingField { line: u64, field: &'static str },

    #[error("line {line}: cannot parse {field} {value:?}")]
    InvalidDate {
        line: u64,
        field: &'static str,
        value: String,
    },

    #[error("line {line}: unknown {field} {value:?}")]
    UnknownStatus {
        line: u64,
        field: &'static str,
        value: String,
    },

    #[error("line {line}: malformed row: {source}")]
    Malformed {
        line: u64,
        #[source]
        source: csv::Error,
    },
}

#[derive(Debug)]
pub struct RejectedRow {
    pub line: u64,
    pub error: ImportError,
}

#[derive(Debug, Default)]
pub struct ImportReport {
    pub records: Vec<InputRecord>,
    pub rejected: Vec<RejectedRow>,
}

impl ImportReport {
    pub fn summary(&self) -> String {
        format!("{} rows accepted, {} rejected", self.records.len(), self.rejected.len())
    }
}

// ============================================================================
// CSV ROW
// ============================================================================

/// Header names accepted for each column (English export or Japanese export)
#[derive(Debug, Deserialize)]
struct CsvRow {
    #[serde(default, alias = "予約ID", alias = "reservation_id")]
    booking_id: Option<String>,

    #[serde(default, alias = "顧客ID", alias = "customer")]
    customer_id: Option<String>,

    #[serde(default, alias = "氏名", alias = "name")]
    display_name: Option<String>,

    #[serde(default, alias = "来店日", alias = "date")]
    service_date: Option<String>,

    #[serde(default, alias = "予約ステータス", alias = "status")]
    booking_status: Option<String>,

    #[serde(default, alias = "来店ステータス", alias = "attendance")]
    attendance_status: Option<String>,

    #[serde(default, alias = "受付日時", alias = "submitted")]
    submitted_at: Option<String>,

    #[serde(default, alias = "詳細ステータス", alias = "detail")]
    detail_status: Option<String>,

    #[serde(default, alias = "担当", alias = "staff_text")]
    staff: Option<String>,

    #[serde(default, alias = "コース")]
    course: Option<String>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn status_token(value: &str) -> String {
    value.trim().to_lowercase().replace(['_', ' '], "-")
}

pub fn parse_booking_status(value: &str) -> Option<BookingStatus> {
    match status_token(value).as_str() {
        "booked" | "reserved" | "confirmed" => Some(BookingStatus::Booked),
        "予約" | "予約済" | "予約済み" | "確定" => Some(BookingStatus::Booked),
        "cancelled" | "canceled" | "cancel" => Some(BookingStatus::Cancelled),
        "キャンセル" | "キャンセル済" | "取消" => Some(BookingStatus::Cancelled),
        _ => None,
    }
}

pub fn parse_attendance_status(value: &str) -> Option<AttendanceStatus> {
    match status_token(value).as_str() {
        "attended" | "present" | "visited" | "yes" | "来店" | "来店済" | "来店済み" => {
            Some(AttendanceStatus::Attended)
        }
        "not-attended" | "absent" | "no-show" | "no" | "未来店" | "" => {
            Some(AttendanceStatus::NotAttended)
        }
        _ => None,
    }
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%Y年%m月%d日", "%Y.%m.%d"];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
    "%Y年%m月%d日 %H:%M",
];

pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
        .or_else(|| parse_datetime(value).map(|dt| dt.date()))
}

/// Date-only values are read as midnight
pub fn parse_datetime(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn required(value: Option<String>, line: u64, field: &'static str) -> Result<String, ImportError> {
    non_blank(value).ok_or(ImportError::MissingField { line, field })
}

fn convert(row: CsvRow, line: u64) -> Result<InputRecord, ImportError> {
    let customer_id = required(row.customer_id, line, "customer_id")?;

    let service_raw = required(row.service_date, line, "service_date")?;
    let service_date = parse_date(&service_raw).ok_or_else(|| ImportError::InvalidDate {
        line,
        field: "service_date",
        value: service_raw.clone(),
    })?;

    let booking_raw = required(row.booking_status, line, "booking_status")?;
    let booking_status =
        parse_booking_status(&booking_raw).ok_or_else(|| ImportError::UnknownStatus {
            line,
            field: "booking_status",
            value: booking_raw.clone(),
        })?;

    let attendance_raw = row.attendance_status.unwrap_or_default();
    let attendance_status =
        parse_attendance_status(&attendance_raw).ok_or_else(|| ImportError::UnknownStatus {
            line,
            field: "attendance_status",
            value: attendance_raw.clone(),
        })?;

    let submitted_raw = required(row.submitted_at, line, "submitted_at")?;
    let submitted_at = parse_datetime(&submitted_raw).ok_or_else(|| ImportError::InvalidDate {
        line,
        field: "submitted_at",
        value: submitted_raw.clone(),
    })?;

    let display_name = non_blank(row.display_name).unwrap_or_else(|| customer_id.clone());

    Ok(InputRecord {
        booking_id: non_blank(row.booking_id),
        customer_id,
        display_name,
        service_date,
        booking_status,
        attendance_status,
        submitted_at,
        submitted_raw,
        detail_status: non_blank(row.detail_status),
        staff_text: non_blank(row.staff),
        course: non_blank(row.course),
    })
}

// ============================================================================
// ENTRY POINTS
// ============================================================================

pub fn read_batch<R: Read>(reader: R) -> Result<ImportReport> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);

    // Fail early on an unreadable header rather than rejecting every row
    rdr.headers().context("Failed to read CSV header")?;

    let mut report = ImportReport::default();

    for (index, result) in rdr.deserialize::<CsvRow>().enumerate() {
        let line = index as u64 + 2;

        let converted = result
            .map_err(|source| ImportError::Malformed { line, source })
            .and_then(|row| convert(row, line));

        match converted {
            Ok(record) => report.records.push(record),
            Err(error) => {
                warn!(line, "rejected import row: {}", error);
                report.rejected.push(RejectedRow { line, error });
            }
        }
    }

    info!("import: {}", report.summary());
    Ok(report)
}

pub fn load_batch(path: &Path) -> Result<ImportReport> {
    let file = File::open(path).with_context(|| format!("Failed to open CSV file: {:?}", path))?;
    read_batch(file).with_context(|| format!("Failed to import {:?}", path))
}
