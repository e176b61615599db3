// Visit Ledger - Core Library
// Booking history merge, visit sequencing and attendance aggregation.
// Exposes all modules for use in the CLI, the API server, and tests.

pub mod model;
pub mod classify;
pub mod staff;          // Staff text classification against the roster
pub mod merge;          // Incremental, idempotent merge engine
pub mod recompute;      // Reference full rebuild of visit sequences
pub mod collapse;       // Same-day collapse (read-time view)
pub mod aggregate;
pub mod integrity;
pub mod import;
pub mod export;
pub mod store;
pub mod config;

// Re-export commonly used types
pub use model::{
    AttendanceOverride, AttendanceStatus, BookingStatus, CampaignPeriod, CancelTiming,
    CounterMap, CustomerVisitCounter, DateAxis, HistoryMap, HistoryRecord, InputRecord,
    Snapshot, VisitLabel, fallback_identity_key,
};
pub use classify::{
    AttendanceRule, classify_cancel_timing, is_attended, is_late_cancel_detail,
    should_count_as_attended, visit_label_of,
};
pub use staff::{
    StaffClassification, StaffClassifier, StaffPattern, StaffPatternSet,
    classify_staff_text, normalize_staff_name,
};
pub use merge::{MergeEngine, MergeOutcome, MergeStats, SkipReason, SkippedRecord};
pub use recompute::{RecomputeOutcome, recompute_all, resequence_customer};
pub use collapse::{assign_merge_groups, collapse_same_day};
pub use aggregate::{
    GroupDimension, GroupSummary, ReportOptions, Summary,
    filter_by_period, select_records, summarize, summarize_by,
};
pub use integrity::{IntegrityIssue, IntegrityReport, IssueKind, Severity, audit};
pub use import::{ImportError, ImportReport, RejectedRow, load_batch, read_batch};
pub use export::{RecordView, write_groups_csv, write_records_csv};
pub use store::{
    Event, commit_merge, commit_recompute, count_history, get_events_for_entity,
    insert_event, load_snapshot, save_snapshot, setup_database,
};
pub use config::LedgerConfig;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
