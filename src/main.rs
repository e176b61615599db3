// Visit Ledger - Command Line Interface
// import → merge into SQLite, then recompute / audit / summarize / export

use anyhow::{bail, Result};
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use rusqlite::Connection;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use visit_ledger::aggregate::{select_records, summarize, summarize_by, ReportOptions};
use visit_ledger::export::{export_records, write_groups_csv};
use visit_ledger::store::{self, get_events_for_entity};
use visit_ledger::{
    audit, load_batch, AttendanceOverride, AttendanceRule, CampaignPeriod, DateAxis,
    GroupDimension, LedgerConfig, RecordView, Severity,
};

const ACTOR: &str = "visit-ledger-cli";

#[derive(Parser, Debug)]
#[command(name = "visit-ledger", version, about = "Booking history merge and visit sequencing")]
struct Cli {
    /// JSON config file (roster, staff patterns, defaults)
    #[arg(long, global = true, env = "VISIT_LEDGER_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database path; overrides the config file
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Merge a CSV export into the ledger
    Import { csv: PathBuf },
    /// Rebuild every visit sequence and counter
    Recompute,
    /// Check sequences and counters for drift
    Audit,
    /// Print attendance summary, optionally grouped
    Summary {
        #[command(flatten)]
        report: ReportArgs,
        #[arg(long)]
        group: Option<GroupDimension>,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Write records (or grouped summaries) to CSV
    Export {
        out: PathBuf,
        #[command(flatten)]
        report: ReportArgs,
        #[arg(long)]
        group: Option<GroupDimension>,
    },
    /// Show one customer's visit history
    Customer { id: String },
    /// Force attendance for a booking (auto | attended | absent)
    Override {
        key: String,
        #[arg(value_parser = parse_override)]
        value: AttendanceOverride,
    },
    /// Exclude a booking from every aggregate
    Exclude {
        key: String,
        /// Include it again
        #[arg(long)]
        undo: bool,
    },
}

#[derive(Args, Debug)]
struct ReportArgs {
    #[arg(long)]
    from: Option<NaiveDate>,
    #[arg(long)]
    to: Option<NaiveDate>,
    #[arg(long, default_value = "service-date")]
    axis: DateAxis,
    /// strict | include-late-cancel; defaults to the config value
    #[arg(long)]
    rule: Option<AttendanceRule>,
    /// Collapse same-day bookings per customer
    #[arg(long)]
    collapse: bool,
}

impl ReportArgs {
    fn options(&self, config: &LedgerConfig) -> ReportOptions {
        let period = match (self.from, self.to) {
            (None, None) => None,
            (from, to) => Some(CampaignPeriod::new(
                from.unwrap_or(NaiveDate::MIN),
                to.unwrap_or(NaiveDate::MAX),
                self.axis,
            )),
        };

        let mut options = config.report_options(period);
        if let Some(rule) = self.rule {
            options.rule = rule;
        }
        options.collapse_same_day |= self.collapse;
        options
    }
}

fn parse_override(value: &str) -> Result<AttendanceOverride, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "auto" | "none" => Ok(AttendanceOverride::Auto),
        "attended" | "yes" | "true" => Ok(AttendanceOverride::ForceAttended),
        "absent" | "no" | "false" => Ok(AttendanceOverride::ForceAbsent),
        other => Err(format!("expected auto, attended or absent, got {}", other)),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = LedgerConfig::load(cli.config.as_deref())?;
    if let Some(db) = &cli.db {
        config.database_path = db.clone();
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("visit_ledger={}", config.log_level)));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut conn = store::open(&config.database_path)?;

    match &cli.command {
        Command::Import { csv } => run_import(&mut conn, &config, csv),
        Command::Recompute => run_recompute(&mut conn),
        Command::Audit => run_audit(&conn),
        Command::Summary { report, group, json } => {
            run_summary(&conn, &config, report, *group, *json)
        }
        Command::Export { out, report, group } => run_export(&conn, &config, out, report, *group),
        Command::Customer { id } => run_customer(&conn, id),
        Command::Override { key, value } => {
            let record =
                store::set_attendance_override(&mut conn, key, *value, Utc::now(), ACTOR)?;
            println!(
                "✓ {} override = {:?}, sequence = {:?}",
                key, record.manual_attendance_override, record.visit_sequence
            );
            Ok(())
        }
        Command::Exclude { key, undo } => {
            let record = store::set_excluded(&mut conn, key, !*undo, Utc::now(), ACTOR)?;
            println!("✓ {} excluded = {}", key, record.is_excluded_from_aggregates);
            Ok(())
        }
    }
}

fn run_import(conn: &mut Connection, config: &LedgerConfig, csv: &PathBuf) -> Result<()> {
    println!("📂 Loading {}...", csv.display());
    let report = load_batch(csv)?;
    println!("✓ {}", report.summary());
    for rejected in &report.rejected {
        println!("   ⚠ {}", rejected.error);
    }

    let engine = config.merge_engine()?;
    let outcome = store::commit_merge(conn, &engine, &report.records, Utc::now(), ACTOR)?;

    let stats = &outcome.stats;
    println!(
        "✓ Merged: {} inserted, {} updated, {} promoted, {} demoted, {} skipped",
        stats.inserted, stats.updated, stats.promoted, stats.demoted, stats.skipped
    );
    for skipped in &outcome.skipped {
        println!("   ⚠ row {} skipped: {}", skipped.batch_index + 1, skipped.reason.as_str());
    }
    if !stats.resequenced_customers.is_empty() {
        println!("✓ Renumbered customers: {}", stats.resequenced_customers.join(", "));
    }
    if stats.demoted > 0 {
        println!(
            "ℹ Demotions can leave sequence gaps; run `visit-ledger recompute` to renumber."
        );
    }
    println!("✓ Ledger contains {} bookings", store::count_history(conn)?);
    Ok(())
}

fn run_recompute(conn: &mut Connection) -> Result<()> {
    let outcome = store::commit_recompute(conn, Utc::now(), ACTOR)?;
    println!(
        "✓ Recomputed {} bookings for {} customers ({} changed)",
        outcome.history.len(),
        outcome.counters.len(),
        outcome.changed_records
    );
    Ok(())
}

fn run_audit(conn: &Connection) -> Result<()> {
    let snapshot = store::load_snapshot(conn)?;
    let report = audit(&snapshot);

    println!("🔍 {}", report.summary());
    for issue in &report.issues {
        let marker = match issue.severity {
            Severity::Critical => "❌",
            Severity::Warning => "⚠",
            Severity::Info => "ℹ",
        };
        println!(
            "   {} [{}] {}: {}",
            marker,
            issue.kind.as_str(),
            issue.customer_id,
            issue.message
        );
    }
    if report.needs_recompute() {
        println!("→ run `visit-ledger recompute` to heal");
    }
    Ok(())
}

fn run_summary(
    conn: &Connection,
    config: &LedgerConfig,
    args: &ReportArgs,
    group: Option<GroupDimension>,
    json: bool,
) -> Result<()> {
    let snapshot = store::load_snapshot(conn)?;
    let options = args.options(config);
    let records = select_records(&snapshot.history, &options);

    match group {
        None => {
            let summary = summarize(&records, options.rule);
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("📊 Rule: {}", options.rule.as_str());
                println!("   Bookings:        {}", summary.total);
                println!(
                    "   Attended:        {} ({:.1}%)",
                    summary.attended, summary.attendance_rate
                );
                println!("   Cancelled:       {}", summary.cancelled);
                println!(
                    "   First visits:    {} ({:.1}%)",
                    summary.first_visits, summary.first_visit_rate
                );
                println!("   Repeat visits:   {}", summary.repeat_visits);
                println!("   Excluded:        {}", summary.excluded);
            }
        }
        Some(dimension) => {
            let groups = summarize_by(&records, options.rule, dimension, args.axis);
            if json {
                println!("{}", serde_json::to_string_pretty(&groups)?);
            } else {
                println!("📊 By {} (rule: {})", dimension.as_str(), options.rule.as_str());
                for g in &groups {
                    println!(
                        "   {:<24} total {:>5}  attended {:>5} ({:>5.1}%)  first {:>4}",
                        g.label,
                        g.summary.total,
                        g.summary.attended,
                        g.summary.attendance_rate,
                        g.summary.first_visits
                    );
                }
            }
        }
    }
    Ok(())
}

fn run_export(
    conn: &Connection,
    config: &LedgerConfig,
    out: &PathBuf,
    args: &ReportArgs,
    group: Option<GroupDimension>,
) -> Result<()> {
    let snapshot = store::load_snapshot(conn)?;
    let options = args.options(config);
    let records = select_records(&snapshot.history, &options);

    let written = match group {
        None => export_records(out, &records)?,
        Some(dimension) => {
            let groups = summarize_by(&records, options.rule, dimension, args.axis);
            let file = std::fs::File::create(out)?;
            write_groups_csv(file, &groups)?
        }
    };
    println!("✓ Wrote {} rows to {}", written, out.display());
    Ok(())
}

fn run_customer(conn: &Connection, customer_id: &str) -> Result<()> {
    let snapshot = store::load_snapshot(conn)?;
    let records = snapshot.records_for_customer(customer_id);
    if records.is_empty() {
        bail!("No bookings for customer {}", customer_id);
    }

    match snapshot.counter(customer_id) {
        Some(counter) => {
            println!("👤 {}: {} attended visits", customer_id, counter.attended_count)
        }
        None => println!("👤 {}: no attended visits", customer_id),
    }

    for record in records {
        let view = RecordView::from(record);
        let history = get_events_for_entity(conn, "booking", &record.identity_key)?;
        println!(
            "   {} #{:<3} {:<14} {:<10} {:<14} {} ({} events)",
            view.service_date,
            view.visit_sequence.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
            view.visit_label,
            view.booking_status,
            view.cancel_timing,
            view.staff,
            history.len()
        );
    }
    Ok(())
}
