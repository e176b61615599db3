// ⚙️ Ledger Configuration - JSON file with environment overrides
// Roster and staff patterns are configuration, never engine state

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::aggregate::ReportOptions;
use crate::classify::AttendanceRule;
use crate::merge::MergeEngine;
use crate::model::CampaignPeriod;
use crate::staff::{StaffClassifier, StaffPatternSet};

pub const ENV_DATABASE: &str = "VISIT_LEDGER_DB";
pub const ENV_RULE: &str = "VISIT_LEDGER_RULE";
pub const ENV_COLLAPSE: &str = "VISIT_LEDGER_COLLAPSE";
pub const ENV_LOG: &str = "VISIT_LEDGER_LOG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Valid staff display names, in roster order
    #[serde(default)]
    pub roster: Vec<String>,

    #[serde(default)]
    pub staff_patterns: StaffPatternSet,

    #[serde(default)]
    pub attendance_rule: AttendanceRule,

    #[serde(default)]
    pub collapse_same_day: bool,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("visit_ledger.db")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            database_path: default_database_path(),
            roster: Vec::new(),
            staff_patterns: StaffPatternSet::default(),
            attendance_rule: AttendanceRule::default(),
            collapse_same_day: false,
            log_level: default_log_level(),
        }
    }
}

impl LedgerConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config JSON: {:?}", path.as_ref()))
    }

    /// File (or defaults when no path is given) followed by env overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => LedgerConfig::from_file(path)?,
            None => LedgerConfig::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any variable source. Blank values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(path) = get(ENV_DATABASE) {
            self.database_path = PathBuf::from(path);
        }
        if let Some(rule) = get(ENV_RULE) {
            self.attendance_rule = rule
                .parse::<AttendanceRule>()
                .map_err(|e| anyhow!("Invalid {}: {}", ENV_RULE, e))?;
        }
        if let Some(flag) = get(ENV_COLLAPSE) {
            self.collapse_same_day = matches!(flag.trim(), "1" | "true" | "TRUE" | "True" | "yes");
        }
        if let Some(level) = get(ENV_LOG) {
            self.log_level = level;
        }
        Ok(())
    }

    pub fn staff_classifier(&self) -> Result<StaffClassifier> {
        StaffClassifier::new(self.roster.clone(), &self.staff_patterns)
            .context("Failed to compile staff patterns")
    }

    pub fn merge_engine(&self) -> Result<MergeEngine> {
        Ok(MergeEngine::new(self.staff_classifier()?))
    }

    /// Report options from config defaults, optionally narrowed to a period
    pub fn report_options(&self, period: Option<CampaignPeriod>) -> ReportOptions {
        ReportOptions {
            period,
            rule: self.attendance_rule,
            collapse_same_day: self.collapse_same_day,
        }
    }
}
