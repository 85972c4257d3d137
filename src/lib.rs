//! Incident Ledger: an append-only incident log with threshold sanctions.
//!
//! Records live in one CSV file that is rewritten atomically on every
//! mutation and optionally mirrored to a versioned remote store. Tallies and
//! alerts are recomputed from the full snapshot on every read.
//!
//! # Architecture
//!
//! ## The Thin Waist
//!
//! All writes route through [`core::broker::MutationBroker`] for:
//! - Serialization (in-process mutex plus a lock file next to the data file)
//! - Audit logging (`ledger.events.jsonl`)
//!
//! ## Subsystems (Plugins)
//!
//! - `incidents`: record store and resolution flags
//! - `mirror`: best-effort remote replication
//! - `tally`: per-subject counts and report summaries
//! - `sanctions`: threshold rules and alert evaluation
//!
//! # Examples
//!
//! ```bash
//! incident-ledger add --subject "A. Learner" --group 8B --category 4 --kind Fighting
//! incident-ledger alerts
//! incident-ledger resolve --subject "A. Learner" --category 4
//! incident-ledger summary --period week --format json
//! ```

pub mod core;
pub mod plugins;

use crate::core::broker;
use crate::core::config::{self, LedgerConfig};
use crate::core::error::{LedgerError, LedgerResult};
use crate::core::output::{cell, compact_line};
use crate::core::schemas;
use crate::core::store::{Store, find_store_root};
use crate::core::time::command_envelope;
use crate::plugins::incidents::{
    self, Category, IncidentLog, IncidentRecord, Mutation, NewIncident, Snapshot, SnapshotSource,
};
use crate::plugins::mirror::{self, SyncReport};
use crate::plugins::sanctions;
use crate::plugins::tally::{self, Dimension, Period, RecordFilter};

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use serde_json::Value as JsonValue;
use std::path::PathBuf;

/// Environment variable naming the store root when `--root` is absent.
pub const ROOT_ENV: &str = "INCIDENT_LEDGER_ROOT";
/// Environment variable naming the actor recorded in the audit log.
pub const ACTOR_ENV: &str = "INCIDENT_LEDGER_ACTOR";

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[clap(
    name = "incident-ledger",
    version = env!("CARGO_PKG_VERSION"),
    about = "Append-only incident log with threshold sanctions"
)]
struct Cli {
    /// Store directory (holds ledger.toml and the data file).
    #[clap(long, global = true)]
    root: Option<PathBuf>,
    /// Output format: 'text' or 'json'.
    #[clap(long, global = true, value_enum, default_value = "text")]
    format: OutputFormat,
    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug, Default)]
struct FilterArgs {
    #[clap(long)]
    subject: Option<String>,
    #[clap(long)]
    group: Option<String>,
    #[clap(long)]
    reporter: Option<String>,
    #[clap(long)]
    kind: Option<String>,
    #[clap(long)]
    category: Option<String>,
    /// Only records whose alert has not been acknowledged.
    #[clap(long)]
    unresolved: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record a new incident dated today.
    Add {
        #[clap(long, default_value = "")]
        subject: String,
        #[clap(long, default_value = "")]
        group: String,
        #[clap(long, default_value = "")]
        reporter: String,
        /// What happened.
        #[clap(long, default_value = "")]
        kind: String,
        /// Severity level; anything outside the configured set becomes the default.
        #[clap(long, default_value = "")]
        category: String,
        #[clap(long, default_value = "")]
        note: String,
    },
    /// List records in store order.
    #[clap(visible_alias = "ls")]
    List(FilterArgs),
    /// Delete one record.
    Delete {
        #[clap(long, required_unless_present = "ordinal", conflicts_with = "ordinal")]
        id: Option<String>,
        /// Zero-based position in the current listing.
        #[clap(long, allow_negative_numbers = true)]
        ordinal: Option<i64>,
    },
    /// Acknowledge every record of a (subject, category) pair.
    Resolve {
        #[clap(long)]
        subject: String,
        #[clap(long)]
        category: String,
    },
    /// Show active alerts.
    Alerts {
        /// Include inactive and acknowledged pairs.
        #[clap(long)]
        all: bool,
    },
    /// Per-subject category counts.
    Tally,
    /// Record counts along one dimension.
    Count {
        #[clap(long, value_enum, default_value = "category")]
        by: Dimension,
    },
    /// Category counts per calendar period.
    Summary {
        #[clap(long, value_enum, default_value = "month")]
        period: Period,
    },
    /// Records that occurred today.
    Today,
    /// Remote mirror operations.
    Mirror(MirrorCli),
    /// Configuration.
    Config(ConfigCli),
    /// Show the mutation audit log.
    Audit,
    /// Print subsystem schemas.
    Schema,
}

#[derive(clap::Args, Debug)]
struct MirrorCli {
    #[clap(subcommand)]
    command: MirrorCommand,
}

#[derive(Subcommand, Debug)]
enum MirrorCommand {
    /// Upload the current data file.
    Push,
}

#[derive(clap::Args, Debug)]
struct ConfigCli {
    #[clap(subcommand)]
    command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print the effective configuration.
    Show,
}

fn resolve_root(flag: Option<PathBuf>) -> LedgerResult<PathBuf> {
    if let Some(root) = flag {
        return Ok(root);
    }
    if let Some(root) = std::env::var_os(ROOT_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(root));
    }
    let current_dir = std::env::current_dir()?;
    Ok(find_store_root(&current_dir).unwrap_or(current_dir))
}

pub fn run() -> Result<(), LedgerError> {
    let cli = Cli::parse();
    let store = Store::new(resolve_root(cli.root)?);
    let config = config::load_config(&store.root)?;
    let actor = std::env::var(ACTOR_ENV).unwrap_or_else(|_| "operator".to_string());
    let log = IncidentLog::open(&store, &config)?.with_actor(&actor);
    tracing::debug!(root = %store.root.display(), data = %log.data_path().display(), "store opened");

    let mut pending: Option<LedgerError> = None;
    let out = match &cli.command {
        Command::Add {
            subject,
            group,
            reporter,
            kind,
            category,
            note,
        } => {
            let mutation = log.append(NewIncident {
                subject_name: subject.clone(),
                group: group.clone(),
                reporter: reporter.clone(),
                kind: kind.clone(),
                category: category.clone(),
                note: note.clone(),
            })?;
            let record = mutation.snapshot.records.last().cloned();
            let alert = record.as_ref().and_then(|r| {
                sanctions::evaluate(&mutation.snapshot, &config.rule_table().ok()?)
                    .into_iter()
                    .find(|a| a.subject == r.subject_name && a.category == r.category)
            });
            mutation_envelope("incidents.add", mutation, &mut pending, serde_json::json!({
                "record": record,
                "alert": alert,
            }))
        }
        Command::List(args) => {
            let snapshot = load_reporting(&log);
            let filter = record_filter(&config, args)?;
            let rows: Vec<JsonValue> = tally::filter(&snapshot, &filter)
                .into_iter()
                .map(|(ordinal, r)| row_json(ordinal, r))
                .collect();
            command_envelope("incidents.list", "ok", serde_json::json!({
                "source": snapshot.source,
                "total": snapshot.len(),
                "items": rows,
            }))
        }
        Command::Delete { id, ordinal } => {
            let mutation = match (id, ordinal) {
                (Some(id), _) => log.delete_by_id(id)?,
                (None, Some(ordinal)) => log.delete_at(*ordinal)?,
                (None, None) => {
                    return Err(LedgerError::ValidationError(
                        "delete needs --id or --ordinal".into(),
                    ));
                }
            };
            mutation_envelope("incidents.delete", mutation, &mut pending, serde_json::json!({}))
        }
        Command::Resolve { subject, category } => {
            let category = config.categories.parse_strict(category)?;
            let mutation = log.mark_resolved(subject, category)?;
            mutation_envelope("incidents.resolve", mutation, &mut pending, serde_json::json!({
                "subject": subject.trim(),
                "category": category,
            }))
        }
        Command::Alerts { all } => {
            let snapshot = load_reporting(&log);
            let table = config.rule_table()?;
            if *all {
                command_envelope("sanctions.states", "ok", serde_json::json!({
                    "source": snapshot.source,
                    "pairs": sanctions::evaluate_states(&snapshot, &table),
                }))
            } else {
                command_envelope("sanctions.alerts", "ok", serde_json::json!({
                    "source": snapshot.source,
                    "alerts": sanctions::evaluate(&snapshot, &table),
                }))
            }
        }
        Command::Tally => {
            let snapshot = load_reporting(&log);
            command_envelope("tally.subjects", "ok", serde_json::json!({
                "source": snapshot.source,
                "tally": tally::tally_by_subject_and_category(&snapshot),
            }))
        }
        Command::Count { by } => {
            let snapshot = load_reporting(&log);
            command_envelope("tally.count", "ok", serde_json::json!({
                "by": by,
                "counts": tally::count_by(&snapshot, *by),
            }))
        }
        Command::Summary { period } => {
            let snapshot = load_reporting(&log);
            let summary: serde_json::Map<String, JsonValue> =
                tally::summarize_by_period(&snapshot, *period)
                    .into_iter()
                    .map(|(start, counts)| {
                        (
                            start.format(schemas::DATE_FORMAT).to_string(),
                            serde_json::json!(counts),
                        )
                    })
                    .collect();
            command_envelope("tally.summary", "ok", serde_json::json!({
                "period": period,
                "summary": summary,
            }))
        }
        Command::Today => {
            let snapshot = load_reporting(&log);
            let today = log.clock().today();
            let rows: Vec<JsonValue> = tally::on_date(&snapshot, today)
                .into_iter()
                .filter_map(|r| Some(row_json(snapshot.position_of(&r.id)?, r)))
                .collect();
            command_envelope("incidents.today", "ok", serde_json::json!({
                "date": today.format(schemas::DATE_FORMAT).to_string(),
                "items": rows,
            }))
        }
        Command::Mirror(mirror_cli) => match mirror_cli.command {
            MirrorCommand::Push => {
                let report = log.push_mirror();
                let status = if matches!(report, SyncReport::Failed { .. }) {
                    "error"
                } else {
                    "ok"
                };
                command_envelope("mirror.push", status, serde_json::json!({ "sync": report }))
            }
        },
        Command::Config(config_cli) => match config_cli.command {
            ConfigCommand::Show => command_envelope("config.show", "ok", serde_json::json!({
                "path": store.config_path(),
                "exists": store.config_path().is_file(),
                "config": config,
                "rules": config.rule_table()?.rules(),
            })),
        },
        Command::Audit => {
            let events = log.broker().read_events()?;
            command_envelope("broker.audit", "ok", serde_json::json!({ "events": events }))
        }
        Command::Schema => command_envelope("schema", "ok", serde_json::json!({
            "schemas": [
                incidents::schema(),
                mirror::schema(),
                tally::schema(),
                sanctions::schema(),
                broker::schema(),
                schemas::schema(),
            ]
        })),
    };

    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&out)?),
        OutputFormat::Text => render_text(&cli.command, &out, &config)?,
    }

    match pending {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn load_reporting(log: &IncidentLog) -> Snapshot {
    let snapshot = log.load();
    match &snapshot.source {
        SnapshotSource::Corrupt { reason } => {
            eprintln!("{} data file is corrupt, showing no records: {}", "warning:".yellow().bold(), reason);
        }
        SnapshotSource::Unreadable { reason } => {
            eprintln!("{} data file unreadable, showing no records: {}", "warning:".yellow().bold(), reason);
        }
        _ => {}
    }
    snapshot
}

fn record_filter(config: &LedgerConfig, args: &FilterArgs) -> LedgerResult<RecordFilter> {
    let category = args
        .category
        .as_deref()
        .map(|c| config.categories.parse_strict(c))
        .transpose()?;
    Ok(RecordFilter {
        subject: args.subject.clone(),
        group: args.group.clone(),
        reporter: args.reporter.clone(),
        kind: args.kind.clone(),
        category,
        unresolved_only: args.unresolved,
    })
}

fn row_json(ordinal: usize, record: &IncidentRecord) -> JsonValue {
    let mut value = serde_json::json!(record);
    if let Some(obj) = value.as_object_mut() {
        obj.insert("ordinal".to_string(), serde_json::json!(ordinal));
    }
    value
}

/// Envelope for a mutation. A persist failure is parked in `pending` so the
/// snapshot is still printed before the command fails.
fn mutation_envelope(
    cmd: &str,
    mut mutation: Mutation,
    pending: &mut Option<LedgerError>,
    extra: JsonValue,
) -> JsonValue {
    let durable = mutation.is_durable();
    let persist_error = mutation.persist_error.take();
    let mut out = command_envelope(
        cmd,
        if durable { "ok" } else { "persist_failed" },
        serde_json::json!({
            "changed": mutation.changed,
            "records": mutation.snapshot.len(),
            "durable": durable,
            "persist_error": persist_error.as_ref().map(|e| e.to_string()),
            "sync": mutation.sync,
        }),
    );
    if let (Some(base), Some(extra)) = (out.as_object_mut(), extra.as_object()) {
        for (k, v) in extra {
            base.insert(k.clone(), v.clone());
        }
    }
    *pending = persist_error;
    out
}

fn str_field<'a>(v: &'a JsonValue, key: &str) -> &'a str {
    v.get(key).and_then(|x| x.as_str()).unwrap_or("")
}

fn u64_field(v: &JsonValue, key: &str) -> u64 {
    v.get(key).and_then(|x| x.as_u64()).unwrap_or(0)
}

fn render_rows(items: &[JsonValue]) {
    println!(
        "{} {} {} {} {} {} {}",
        cell("#", 4).bold(),
        cell("date", 10).bold(),
        cell("subject", 20).bold(),
        cell("group", 8).bold(),
        cell("cat", 3).bold(),
        cell("kind", 18).bold(),
        "note".bold()
    );
    for v in items {
        let resolved = v.get("resolved").and_then(|x| x.as_bool()).unwrap_or(false);
        let line = format!(
            "{} {} {} {} {} {} {}",
            cell(&u64_field(v, "ordinal").to_string(), 4),
            cell(str_field(v, "occurredOn"), 10),
            cell(str_field(v, "subjectName"), 20),
            cell(str_field(v, "group"), 8),
            cell(&u64_field(v, "category").to_string(), 3),
            cell(str_field(v, "kind"), 18),
            compact_line(str_field(v, "note"), 40)
        );
        if resolved {
            println!("{}", line.dimmed());
        } else {
            println!("{}", line);
        }
    }
}

fn render_mutation(out: &JsonValue) {
    let changed = u64_field(out, "changed");
    let records = u64_field(out, "records");
    if changed == 0 {
        println!("No records changed ({} in store).", records);
    } else {
        println!("{} record(s) changed, {} in store.", changed, records);
    }
    if let Some(err) = out.get("persist_error").and_then(|e| e.as_str()) {
        eprintln!(
            "{} change applied in memory only, NOT saved: {}",
            "error:".red().bold(),
            err
        );
    }
    let sync = out.get("sync").cloned().unwrap_or(JsonValue::Null);
    match str_field(&sync, "outcome") {
        "failed" => eprintln!(
            "{} remote mirror not updated: {}",
            "warning:".yellow().bold(),
            str_field(&sync, "reason")
        ),
        "created" | "updated" => println!("Mirrored ({}).", str_field(&sync, "version")),
        _ => {}
    }
}

fn render_text(command: &Command, out: &JsonValue, config: &LedgerConfig) -> LedgerResult<()> {
    let empty = Vec::new();
    let items = |key: &str| out.get(key).and_then(|x| x.as_array()).unwrap_or(&empty);
    match command {
        Command::Add { .. } => {
            if let Some(record) = out.get("record").filter(|r| !r.is_null()) {
                println!(
                    "Recorded {} for {} (category {}).",
                    str_field(record, "id"),
                    str_field(record, "subjectName").bold(),
                    u64_field(record, "category")
                );
            }
            render_mutation(out);
            if let Some(alert) = out.get("alert").filter(|a| !a.is_null()) {
                println!(
                    "{} {} has {} category {} incident(s): {}",
                    "ALERT".red().bold(),
                    str_field(alert, "subject"),
                    u64_field(alert, "count"),
                    u64_field(alert, "category"),
                    str_field(alert, "sanction")
                );
            }
        }
        Command::Delete { .. } | Command::Resolve { .. } => render_mutation(out),
        Command::List(_) | Command::Today => {
            let rows = items("items");
            if rows.is_empty() {
                println!("No incidents found.");
            } else {
                render_rows(rows);
            }
        }
        Command::Alerts { all: false } => {
            let alerts = items("alerts");
            if alerts.is_empty() {
                println!("{}", "No active alerts.".green());
            }
            for a in alerts {
                println!(
                    "{} {} category {} x{}: {}",
                    "ALERT".red().bold(),
                    cell(str_field(a, "subject"), 20),
                    u64_field(a, "category"),
                    u64_field(a, "count"),
                    str_field(a, "sanction")
                );
            }
        }
        Command::Alerts { all: true } => {
            for p in items("pairs") {
                let state = match str_field(p, "state") {
                    "active_unresolved" => "active".red().bold(),
                    "active_resolved" => "resolved".green(),
                    _ => "inactive".dimmed(),
                };
                println!(
                    "{} category {} count {} unresolved {} [{}]",
                    cell(str_field(p, "subject"), 20),
                    u64_field(p, "category"),
                    u64_field(p, "count"),
                    u64_field(p, "unresolved"),
                    state
                );
            }
        }
        Command::Tally => {
            let levels: Vec<Category> = config.categories.valid.iter().map(|c| Category(*c)).collect();
            let header: Vec<String> = levels.iter().map(|c| cell(&format!("c{}", c), 4)).collect();
            println!("{} {}", cell("subject", 20).bold(), header.join(" ").bold());
            if let Some(map) = out.get("tally").and_then(|t| t.as_object()) {
                for (subject, counts) in map {
                    let cols: Vec<String> = levels
                        .iter()
                        .map(|c| cell(&u64_field(counts, &c.to_string()).to_string(), 4))
                        .collect();
                    println!("{} {}", cell(subject, 20), cols.join(" "));
                }
            }
        }
        Command::Count { .. } => {
            if let Some(map) = out.get("counts").and_then(|t| t.as_object()) {
                for (key, count) in map {
                    println!("{} {}", cell(key, 24), count);
                }
            }
        }
        Command::Summary { .. } => {
            if let Some(map) = out.get("summary").and_then(|t| t.as_object()) {
                for (start, counts) in map {
                    let parts: Vec<String> = counts
                        .as_object()
                        .map(|c| c.iter().map(|(k, v)| format!("c{}={}", k, v)).collect())
                        .unwrap_or_default();
                    println!("{} {}", start.bold(), parts.join(" "));
                }
            }
        }
        Command::Mirror(_) => {
            let sync = out.get("sync").cloned().unwrap_or(JsonValue::Null);
            let outcome = str_field(&sync, "outcome");
            match outcome {
                "failed" => println!("{} {}", "Mirror push failed:".red().bold(), str_field(&sync, "reason")),
                "disabled" => println!("Mirror is disabled in ledger.toml."),
                "skipped" => println!("Mirror skipped: {}", str_field(&sync, "reason")),
                _ => println!("{} ({})", "Mirror up to date".green(), str_field(&sync, "version")),
            }
        }
        Command::Config(_) => {
            let rendered = toml::to_string_pretty(config)
                .map_err(|e| LedgerError::ConfigError(e.to_string()))?;
            println!("# {}", str_field(out, "path"));
            println!("{}", rendered);
        }
        Command::Audit => {
            for e in items("events") {
                println!(
                    "{} {} {} {} changed={} records={} sync={}",
                    str_field(e, "ts"),
                    cell(str_field(e, "actor"), 10),
                    cell(str_field(e, "op"), 20),
                    cell(str_field(e, "status"), 14),
                    u64_field(e, "changed"),
                    u64_field(e, "records"),
                    e.get("sync").and_then(|s| s.as_str()).unwrap_or("-")
                );
            }
        }
        Command::Schema => println!("{}", serde_json::to_string_pretty(out)?),
    }
    Ok(())
}
