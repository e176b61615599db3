// ✅ Integrity Audit - consistency checks on sequences and counters
// Reports what incremental merges can leave behind; recompute_all heals all of it

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

use crate::classify::visit_label_of;
use crate::model::{HistoryRecord, Snapshot};

// ============================================================================
// ISSUES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Critical, // Two visits claim the same number
    Warning,  // Numbering is stale and needs a recompute
    Info,     // Cosmetic: derived label out of step
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssueKind {
    SequenceGap,
    DuplicateSequence,
    OrderInversion,
    CounterMismatch,
    MissingCounter,
    SequenceOnNonAttended,
    MissingSequence,
    LabelMismatch,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::SequenceGap => "sequence-gap",
            IssueKind::DuplicateSequence => "duplicate-sequence",
            IssueKind::OrderInversion => "order-inversion",
            IssueKind::CounterMismatch => "counter-mismatch",
            IssueKind::MissingCounter => "missing-counter",
            IssueKind::SequenceOnNonAttended => "sequence-on-non-attended",
            IssueKind::MissingSequence => "missing-sequence",
            IssueKind::LabelMismatch => "label-mismatch",
        }
    }

    fn severity(&self) -> Severity {
        match self {
            IssueKind::DuplicateSequence => Severity::Critical,
            IssueKind::LabelMismatch => Severity::Info,
            _ => Severity::Warning,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityIssue {
    pub severity: Severity,
    pub kind: IssueKind,
    pub customer_id: String,
    pub identity_key: Option<String>,
    pub message: String,
}

impl IntegrityIssue {
    fn new(
        kind: IssueKind,
        customer_id: &str,
        identity_key: Option<&str>,
        message: String,
    ) -> Self {
        IntegrityIssue {
            severity: kind.severity(),
            kind,
            customer_id: customer_id.to_string(),
            identity_key: identity_key.map(str::to_string),
            message,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub customers_checked: usize,
    pub records_checked: usize,
    pub issues: Vec<IntegrityIssue>,
}

impl IntegrityReport {
    pub fn summary(&self) -> String {
        format!(
            "{} records / {} customers: {} issues ({} critical, {} warnings)",
            self.records_checked,
            self.customers_checked,
            self.issues.len(),
            self.count(Severity::Critical),
            self.count(Severity::Warning)
        )
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.issues.iter().filter(|i| i.severity == severity).count()
    }

    pub fn has_critical_issues(&self) -> bool {
        self.count(Severity::Critical) > 0
    }

    /// Any issue at all is healed by a full recompute
    pub fn needs_recompute(&self) -> bool {
        !self.issues.is_empty()
    }

    pub fn issues_of(&self, kind: IssueKind) -> Vec<&IntegrityIssue> {
        self.issues.iter().filter(|i| i.kind == kind).collect()
    }
}

// ============================================================================
// AUDIT
// ============================================================================

pub fn audit(snapshot: &Snapshot) -> IntegrityReport {
    let customers: BTreeSet<&str> = snapshot
        .history
        .values()
        .map(|r| r.customer_id.as_str())
        .collect();

    let mut report = IntegrityReport {
        customers_checked: customers.len(),
        records_checked: snapshot.history.len(),
        issues: Vec::new(),
    };

    for customer_id in customers {
        let records = snapshot.records_for_customer(customer_id);
        check_customer(snapshot, customer_id, &records, &mut report.issues);
    }

    for issue in &report.issues {
        if issue.severity != Severity::Info {
            warn!(
                kind = issue.kind.as_str(),
                customer = %issue.customer_id,
                key = ?issue.identity_key,
                "{}",
                issue.message
            );
        }
    }
    info!("integrity audit: {}", report.summary());

    report
}

fn check_customer(
    snapshot: &Snapshot,
    customer_id: &str,
    records: &[&HistoryRecord],
    issues: &mut Vec<IntegrityIssue>,
) {
    let mut attended = 0u32;
    let mut seen: BTreeMap<u32, &str> = BTreeMap::new();
    let mut highest_so_far: Option<(u32, &HistoryRecord)> = None;

    for &record in records {
        let key = record.identity_key.as_str();
        let counts = record.counts_toward_sequence();

        match (counts, record.visit_sequence) {
            (true, None) => issues.push(IntegrityIssue::new(
                IssueKind::MissingSequence,
                customer_id,
                Some(key),
                format!("attended visit on {} has no sequence", record.service_date),
            )),
            (false, Some(sequence)) => issues.push(IntegrityIssue::new(
                IssueKind::SequenceOnNonAttended,
                customer_id,
                Some(key),
                format!("non-attended booking carries sequence {}", sequence),
            )),
            _ => {}
        }

        if record.visit_label != record.visit_sequence.map(visit_label_of) {
            issues.push(IntegrityIssue::new(
                IssueKind::LabelMismatch,
                customer_id,
                Some(key),
                format!(
                    "label {:?} does not match sequence {:?}",
                    record.visit_label, record.visit_sequence
                ),
            ));
        }

        if !counts {
            continue;
        }
        attended += 1;

        let Some(sequence) = record.visit_sequence else {
            continue;
        };

        if let Some(first) = seen.insert(sequence, key) {
            issues.push(IntegrityIssue::new(
                IssueKind::DuplicateSequence,
                customer_id,
                Some(key),
                format!("sequence {} also used by {}", sequence, first),
            ));
        }

        match highest_so_far {
            Some((highest, earlier))
                if sequence < highest && earlier.service_date < record.service_date =>
            {
                issues.push(IntegrityIssue::new(
                    IssueKind::OrderInversion,
                    customer_id,
                    Some(key),
                    format!(
                        "sequence {} on {} comes after sequence {} on {}",
                        sequence, record.service_date, highest, earlier.service_date
                    ),
                ));
            }
            Some((highest, _)) if sequence <= highest => {}
            _ => highest_so_far = Some((sequence, record)),
        }
    }

    let expected: BTreeSet<u32> = (1..=attended).collect();
    let actual: BTreeSet<u32> = seen.keys().copied().collect();
    let missing: Vec<u32> = expected.difference(&actual).copied().collect();
    if !missing.is_empty() && attended > 0 {
        issues.push(IntegrityIssue::new(
            IssueKind::SequenceGap,
            customer_id,
            None,
            format!("{} attended visits but sequences {:?} are unused", attended, missing),
        ));
    }

    match snapshot.counter(customer_id) {
        Some(counter) if counter.attended_count != attended => issues.push(IntegrityIssue::new(
            IssueKind::CounterMismatch,
            customer_id,
            None,
            format!(
                "counter says {} attended visits, history has {}",
                counter.attended_count, attended
            ),
        )),
        None if attended > 0 => issues.push(IntegrityIssue::new(
            IssueKind::MissingCounter,
            customer_id,
            None,
            format!("{} attended visits but no counter", attended),
        )),
        _ => {}
    }
}

// ============================================================================
// TESTS
// ============================================================================
