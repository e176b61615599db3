// 👤 Staff Attribution - Rules as Data
// Free-text slot descriptions → roster name, unassigned pool, or nothing

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

// ============================================================================
// PATTERN DEFINITIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffPattern {
    /// Pattern ID for tracking which rule fired
    pub id: String,

    /// Regular expression matched anywhere in the raw text
    pub pattern: String,

    #[serde(default)]
    pub description: Option<String>,
}

impl StaffPattern {
    pub fn new(id: &str, pattern: &str) -> Self {
        StaffPattern {
            id: id.to_string(),
            pattern: pattern.to_string(),
            description: None,
        }
    }
}

/// Ordered pattern lists. Earlier entries win within a list; the
/// assign-later list is always evaluated before the remark list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffPatternSet {
    #[serde(default = "default_assign_later_patterns")]
    pub assign_later: Vec<StaffPattern>,

    #[serde(default = "default_remark_patterns")]
    pub remark: Vec<StaffPattern>,
}

impl Default for StaffPatternSet {
    fn default() -> Self {
        StaffPatternSet {
            assign_later: default_assign_later_patterns(),
            remark: default_remark_patterns(),
        }
    }
}

impl StaffPatternSet {
    /// Load pattern lists from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read staff pattern file: {:?}", path.as_ref()))?;

        serde_json::from_str(&content).context("Failed to parse staff pattern JSON")
    }
}

fn default_assign_later_patterns() -> Vec<StaffPattern> {
    vec![
        StaffPattern::new(
            "schedule-adjusted",
            r"(?i)schedule\s+(may\s+be|will\s+be|to\s+be)\s+adjusted",
        ),
        StaffPattern::new(
            "will-be-arranged",
            r"(?i)\b(will|to)\s+be\s+(arranged|assigned|decided|determined|confirmed)\b",
        ),
        StaffPattern::new("assign-later", r"(?i)\bassign(ed)?\s+later\b"),
        StaffPattern::new("tbd", r"(?i)\b(tbd|tba)\b"),
        StaffPattern::new("no-preference", r"(?i)\b(no\s+preference|any\s+available\s+staff)\b"),
        StaffPattern::new("jp-adjusting", r"調整"),
        StaffPattern::new("jp-later-date", r"後日"),
        StaffPattern::new("jp-undecided", r"未定|決定次第"),
        StaffPattern::new("jp-leave-to-us", r"お任せ|おまかせ|指名なし"),
    ]
}

fn default_remark_patterns() -> Vec<StaffPattern> {
    vec![
        StaffPattern::new("leading-marker", r"^\s*[※＊*]"),
        StaffPattern::new("time-change", r"(?i)\btime\s+(change|changed|moved)\b"),
        StaffPattern::new("jp-time-change", r"時間変更|時間の変更"),
        StaffPattern::new("note-prefix", r"(?i)^\s*(note|memo|remark)s?\s*[:：]"),
    ]
}

// ============================================================================
// NORMALIZATION
// ============================================================================

/// Normalize staff text for roster comparison.
///
/// Folds full-width ASCII-range characters (U+FF01..U+FF5E) and the
/// ideographic space to half-width, drops everything from the first opening
/// parenthesis onward, and trims. Roster names go through the same function.
pub fn normalize_staff_name(text: &str) -> String {
    let folded: String = text
        .chars()
        .map(|c| match c {
            '\u{3000}' => ' ',
            '\u{FF01}'..='\u{FF5E}' => char::from_u32(c as u32 - 0xFEE0).unwrap_or(c),
            _ => c,
        })
        .collect();

    let head = match folded.find('(') {
        Some(pos) => &folded[..pos],
        None => folded.as_str(),
    };

    head.trim().to_string()
}

// ============================================================================
// CLASSIFICATION RESULT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StaffClassification {
    pub resolved_staff: Option<String>,
    pub was_unassigned_pool: bool,
}

impl StaffClassification {
    fn unmatched() -> Self {
        StaffClassification::default()
    }

    fn unassigned_pool() -> Self {
        StaffClassification {
            resolved_staff: None,
            was_unassigned_pool: true,
        }
    }

    fn staff(name: &str) -> Self {
        StaffClassification {
            resolved_staff: Some(name.to_string()),
            was_unassigned_pool: false,
        }
    }
}

/// Which list a pattern came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatternKind {
    AssignLater,
    Remark,
}

// ============================================================================
// STAFF CLASSIFIER
// ============================================================================

#[derive(Debug, Clone)]
struct CompiledPattern {
    id: String,
    regex: Regex,
}

fn compile(patterns: &[StaffPattern]) -> Result<Vec<CompiledPattern>> {
    patterns
        .iter()
        .map(|p| {
            let regex = Regex::new(&p.pattern)
                .with_context(|| format!("Invalid staff pattern {}: {}", p.id, p.pattern))?;
            Ok(CompiledPattern {
                id: p.id.clone(),
                regex,
            })
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct StaffClassifier {
    roster: Vec<String>,
    normalized_roster: Vec<String>,
    assign_later: Vec<CompiledPattern>,
    remark: Vec<CompiledPattern>,
}

impl StaffClassifier {
    /// Build a classifier from a roster and pattern lists.
    /// Fails only when a pattern is not a valid regular expression.
    pub fn new(roster: Vec<String>, patterns: &StaffPatternSet) -> Result<Self> {
        let normalized_roster = roster.iter().map(|name| normalize_staff_name(name)).collect();

        Ok(StaffClassifier {
            roster,
            normalized_roster,
            assign_later: compile(&patterns.assign_later)?,
            remark: compile(&patterns.remark)?,
        })
    }

    /// Classifier with the built-in pattern lists
    pub fn with_default_patterns(roster: Vec<String>) -> Self {
        let normalized_roster = roster.iter().map(|name| normalize_staff_name(name)).collect();

        StaffClassifier {
            roster,
            normalized_roster,
            assign_later: DEFAULT_PATTERNS.0.clone(),
            remark: DEFAULT_PATTERNS.1.clone(),
        }
    }

    pub fn roster(&self) -> &[String] {
        &self.roster
    }

    /// First pattern (assign-later list first) matching `text`
    pub fn matching_pattern(&self, text: &str) -> Option<(PatternKind, &str)> {
        if let Some(p) = self.assign_later.iter().find(|p| p.regex.is_match(text)) {
            return Some((PatternKind::AssignLater, p.id.as_str()));
        }
        self.remark
            .iter()
            .find(|p| p.regex.is_match(text))
            .map(|p| (PatternKind::Remark, p.id.as_str()))
    }

    /// Classify a raw slot description.
    ///
    /// Adjustment language wins over a roster name appearing in the same
    /// text; remark-only text never resolves to staff; otherwise the
    /// normalized text must equal a normalized roster name exactly.
    pub fn classify(&self, raw_text: Option<&str>) -> StaffClassification {
        let text = match raw_text.map(str::trim) {
            Some(t) if !t.is_empty() => t,
            _ => return StaffClassification::unmatched(),
        };

        match self.matching_pattern(text) {
            Some((PatternKind::AssignLater, _)) => return StaffClassification::unassigned_pool(),
            Some((PatternKind::Remark, _)) => return StaffClassification::unmatched(),
            None => {}
        }

        let normalized = normalize_staff_name(text);
        if normalized.is_empty() {
            return StaffClassification::unmatched();
        }

        self.normalized_roster
            .iter()
            .position(|name| *name == normalized)
            .map(|idx| StaffClassification::staff(&self.roster[idx]))
            .unwrap_or_else(StaffClassification::unmatched)
    }
}

static DEFAULT_PATTERNS: Lazy<(Vec<CompiledPattern>, Vec<CompiledPattern>)> = Lazy::new(|| {
    let set = StaffPatternSet::default();
    (
        compile(&set.assign_later).expect("built-in assign-later patterns compile"),
        compile(&set.remark).expect("built-in remark patterns compile"),
    )
});

/// Classify with the built-in pattern lists against an ad-hoc roster
pub fn classify_staff_text(raw_text: &str, roster: &[String]) -> StaffClassification {
    StaffClassifier::with_default_patterns(roster.to_vec()).classify(Some(raw_text))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn roster() -> Vec<String> {
        vec![
            "Jane Doe".to_string(),
            "佐藤 花子".to_string(),
            "ＡＩ Tanaka".to_string(),
        ]
    }

    #[test]
    fn test_blank_text() {
        let classifier = StaffClassifier::with_default_patterns(roster());
        assert_eq!(classifier.classify(None), StaffClassification::default());
        assert_eq!(classifier.classify(Some("   ")), StaffClassification::default());
    }

    #[test]
    fn test_adjustment_wins_over_roster_name() {
        let result = classify_staff_text("Jane Doe (schedule may be adjusted)", &roster());
        assert_eq!(result.resolved_staff, None);
        assert!(result.was_unassigned_pool);
    }

    #[test]
    fn test_roster_name_with_parenthetical() {
        let result = classify_staff_text("Jane Doe (main room)", &roster());
        assert_eq!(result.resolved_staff, Some("Jane Doe".to_string()));
        assert!(!result.was_unassigned_pool);
    }

    #[test]
    fn test_full_width_folding() {
        // Full-width letters, ideographic space and full-width parenthesis
        let result = classify_staff_text("Ｊａｎｅ\u{3000}Ｄｏｅ（指名）", &roster());
        assert_eq!(result.resolved_staff, Some("Jane Doe".to_string()));

        // Roster entries are normalized the same way
        let result = classify_staff_text("AI Tanaka", &roster());
        assert_eq!(result.resolved_staff, Some("ＡＩ Tanaka".to_string()));
    }

    #[test]
    fn test_exact_match_only() {
        assert_eq!(classify_staff_text("Jane", &roster()).resolved_staff, None);
        assert_eq!(classify_staff_text("Jane Doe Jr", &roster()).resolved_staff, None);
        assert_eq!(classify_staff_text("jane doe", &roster()).resolved_staff, None);
    }

    #[test]
    fn test_remark_text_is_not_staff() {
        let classifier = StaffClassifier::with_default_patterns(roster());

        let result = classifier.classify(Some("※Jane Doe"));
        assert_eq!(result, StaffClassification::default());

        let result = classifier.classify(Some("Time changed to 15:00"));
        assert_eq!(result, StaffClassification::default());
        assert_eq!(
            classifier.matching_pattern("Time changed to 15:00"),
            Some((PatternKind::Remark, "time-change"))
        );
    }

    #[test]
    fn test_japanese_assign_later() {
        let classifier = StaffClassifier::with_default_patterns(roster());
        let result = classifier.classify(Some("佐藤 花子（調整中）"));
        assert!(result.was_unassigned_pool);
        assert_eq!(result.resolved_staff, None);

        let result = classifier.classify(Some("佐藤　花子"));
        assert_eq!(result.resolved_staff, Some("佐藤 花子".to_string()));
    }

    #[test]
    fn test_each_default_pattern_compiles_and_fires() {
        let samples = [
            ("schedule-adjusted", "Schedule may be adjusted"),
            ("will-be-arranged", "staff will be arranged"),
            ("assign-later", "assigned later"),
            ("tbd", "TBD"),
            ("no-preference", "no preference"),
            ("jp-adjusting", "調整中"),
            ("jp-later-date", "後日連絡"),
            ("jp-undecided", "担当未定"),
            ("jp-leave-to-us", "おまかせ"),
        ];
        let classifier = StaffClassifier::with_default_patterns(vec![]);
        for (id, text) in samples {
            assert_eq!(
                classifier.matching_pattern(text),
                Some((PatternKind::AssignLater, id)),
                "pattern {} should match {:?}",
                id,
                text
            );
        }
    }

    #[test]
    fn test_custom_pattern_set() {
        let patterns = StaffPatternSet {
            assign_later: vec![StaffPattern::new("floating", r"(?i)floater")],
            remark: vec![],
        };
        let classifier = StaffClassifier::new(roster(), &patterns).unwrap();

        assert!(classifier.classify(Some("Floater")).was_unassigned_pool);
        // Built-in phrases are not active in a custom set
        assert!(!classifier.classify(Some("TBD")).was_unassigned_pool);
    }

    #[test]
    fn test_invalid_pattern_is_reported() {
        let patterns = StaffPatternSet {
            assign_later: vec![StaffPattern::new("broken", r"(unclosed")],
            remark: vec![],
        };
        let err = StaffClassifier::new(roster(), &patterns).unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_pattern_set_from_json_uses_defaults_for_missing_lists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patterns.json");
        fs::write(&path, r#"{"remark": [{"id": "memo", "pattern": "^memo"}]}"#).unwrap();

        let set = StaffPatternSet::from_file(&path).unwrap();
        assert_eq!(set.remark.len(), 1);
        assert_eq!(set.assign_later, default_assign_later_patterns());
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_staff_name("  Ｊａｎｅ Ｄｏｅ  "), "Jane Doe");
        assert_eq!(normalize_staff_name("Jane Doe (A)"), "Jane Doe");
        assert_eq!(normalize_staff_name("(only remark)"), "");
    }
}
