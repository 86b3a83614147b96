//! CLI entry point for `mailledger`.

use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{Duration, Utc};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};

use mailledger::config::{self, Config};
use mailledger::coordinator::{BatchSummary, Coordinator};
use mailledger::error::LedgerError;
use mailledger::fingerprint::Fingerprinter;
use mailledger::ledger::{ContentTable, ProcessingTable};
use mailledger::lock::RunLock;
use mailledger::maintenance::{self, PurgeStats};
use mailledger::model::address::EmailAddress;
use mailledger::model::record::ProcessingStatus;
use mailledger::notify::{JsonLinesSink, LogSink, NotificationSink};
use mailledger::parser::date::parse_date;
use mailledger::source::{EmlDirectory, MessageSource};
use mailledger::store::documents::DirectoryStore;
use mailledger::store::quota::QuotaStore;

#[derive(Parser)]
#[command(
    name = "mailledger",
    version,
    about = "Store mailed documents once, log every delivery",
    after_help = "Ledgers live in the data directory (see `mailledger config`)."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Override the data directory
    #[arg(long, global = true, value_name = "DIR", env = "MAILLEDGER_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Process every .eml file in a directory
    Ingest {
        dir: PathBuf,
        /// Emit one JSON notification per delivery, then a JSON summary
        #[arg(long)]
        json: bool,
    },
    /// Print the content key for a set of document attributes
    Fingerprint {
        #[arg(long)]
        sender: String,
        /// Send time (RFC 2822, RFC 3339 or `YYYY-MM-DD HH:MM:SS`)
        #[arg(long)]
        date: Option<String>,
        #[arg(long, default_value = "")]
        subject: String,
        /// Attachment file name (repeatable)
        #[arg(long = "attachment", value_name = "NAME")]
        attachments: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Print a ledger
    Report {
        #[arg(value_enum)]
        ledger: LedgerKind,
        /// Only the most recent N rows
        #[arg(long, value_name = "N")]
        limit: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Show ledger and quota statistics
    Stats {
        #[arg(long)]
        json: bool,
    },
    /// Delete processing records so deliveries are reconsidered
    Purge {
        /// Delete records older than this many days
        #[arg(long, value_name = "DAYS")]
        older_than: Option<u32>,
        /// Delete failed deliveries so the next run retries them. Failed
        /// deliveries count as handled, and are never retried, until purged
        #[arg(long)]
        failed: bool,
    },
    /// Print the effective configuration
    Config {
        /// Write the configuration file if none exists
        #[arg(long)]
        init: bool,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate a man page
    Manpage,
}

#[derive(Clone, Copy, ValueEnum)]
enum LedgerKind {
    Content,
    Processing,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = config::load_config();
    if let Some(dir) = cli.data_dir {
        config.general.data_dir = Some(dir);
    }
    config.validate()?;

    // Configure logging: stderr + optional log file
    let log_level = match cli.verbose {
        0 => config.general.log_level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    setup_logging(log_level, &config);

    match cli.command {
        Commands::Ingest { dir, json } => cmd_ingest(&config, &dir, json),
        Commands::Fingerprint {
            sender,
            date,
            subject,
            attachments,
            json,
        } => cmd_fingerprint(&config, &sender, date.as_deref(), &subject, &attachments, json),
        Commands::Report {
            ledger,
            limit,
            json,
        } => cmd_report(&config, ledger, limit, json),
        Commands::Stats { json } => cmd_stats(&config, json),
        Commands::Purge { older_than, failed } => cmd_purge(&config, older_than, failed),
        Commands::Config { init } => cmd_config(&config, init),
        Commands::Completions { shell } => cmd_completions(shell),
        Commands::Manpage => cmd_manpage(),
    }
}

/// Set up tracing with stderr output and optional file logging.
fn setup_logging(level: &str, config: &Config) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let log_dir = config::data_dir(config);
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = tracing_appender::rolling::never(&log_dir, "mailledger.log");
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
    }
}

fn open_ledgers(config: &Config) -> anyhow::Result<(ContentTable, ProcessingTable)> {
    let content = ContentTable::open(
        config::content_ledger_path(config),
        config.ledger.csv_separator,
        config.ledger.lookup_cache_size,
    )?;
    let processing =
        ProcessingTable::open(config::processing_ledger_path(config), config.ledger.csv_separator)?;
    Ok((content, processing))
}

/// Ingest a directory of messages.
fn cmd_ingest(config: &Config, dir: &Path, json: bool) -> anyhow::Result<()> {
    if !dir.is_dir() {
        anyhow::bail!("Not a directory: {}", dir.display());
    }

    let _lock = match RunLock::acquire(config::lock_file_path(config)) {
        Ok(lock) => lock,
        Err(LedgerError::Locked(path)) => {
            tracing::warn!(path = %path.display(), "Another ingest run is active, skipping");
            eprintln!("  Another run is in progress ({}); nothing done.", path.display());
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let source = EmlDirectory::new(dir);
    let messages = source.fetch()?;
    let (content, processing) = open_ledgers(config)?;
    let quota = QuotaStore::open(config::quota_snapshot_path(config), &config.quota);
    let documents = DirectoryStore::new(config::artifact_dir(config));

    let json_sink = JsonLinesSink::new(std::io::stdout());
    let sink: &dyn NotificationSink = if json { &json_sink } else { &LogSink };

    let coordinator = Coordinator::new(
        Fingerprinter::from_config(&config.fingerprint),
        &quota,
        &content,
        &processing,
        &documents,
        sink,
    );

    let pb = ProgressBar::new(messages.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} Ingesting [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            .expect("valid template")
            .progress_chars("#>-"),
    );

    let start = Instant::now();
    let summary = coordinator.process_batch(
        &source,
        &messages,
        Some(&|current, total| {
            pb.set_length(total as u64);
            pb.set_position(current as u64);
        }),
    );
    pb.finish_and_clear();

    if let Err(e) = quota.save() {
        // The ledgers are authoritative; a lost snapshot only costs lookups.
        tracing::warn!(error = %e, "Could not save quota snapshot");
    }

    if json {
        println!("{}", serde_json::json!({ "summary": summary }));
    } else {
        print_summary_table(dir, &summary, start.elapsed());
    }
    Ok(())
}

fn print_summary_table(dir: &Path, summary: &BatchSummary, elapsed: std::time::Duration) {
    println!();
    println!("  {:<20} {}", "Source", dir.display());
    println!("  {:<20} {}", "Messages", summary.messages);
    println!("  {:<20} {}", "Deliveries", summary.deliveries);
    println!("  {:<20} {}", "New content", summary.novel);
    println!("  {:<20} {}", "Duplicates", summary.duplicate);
    println!("  {:<20} {}", "Already handled", summary.already_handled);
    println!("  {:<20} {}", "Failed", summary.failed);
    println!("  {:<20} {}", "Skipped", summary.skipped);
    println!("  {:<20} {:.2?}", "Elapsed", elapsed);
    println!();
}

/// Compute a content key from the command line.
fn cmd_fingerprint(
    config: &Config,
    sender: &str,
    date: Option<&str>,
    subject: &str,
    attachments: &[String],
    json: bool,
) -> anyhow::Result<()> {
    let sent_at = match date {
        Some(d) => Some(parse_date(d).ok_or_else(|| anyhow::anyhow!("Unrecognized date '{d}'"))?),
        None => None,
    };
    let sender = EmailAddress::parse(sender);
    let fingerprinter = Fingerprinter::from_config(&config.fingerprint);
    let fp = fingerprinter.fingerprint(&sender.address, sent_at, subject, attachments);

    if json {
        let out = serde_json::json!({
            "content_key": fp.key,
            "fallback": fp.fallback,
            "key_length": fingerprinter.key_length(),
            "sender": sender.normalized(),
            "sent_at": sent_at.map(|t| t.to_rfc3339()),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("{}", fp.key);
        if fp.fallback {
            eprintln!("  (fallback key: sender or date missing, duplicates will not be detected)");
        }
    }
    Ok(())
}

/// Print one of the ledgers.
fn cmd_report(
    config: &Config,
    ledger: LedgerKind,
    limit: Option<usize>,
    json: bool,
) -> anyhow::Result<()> {
    let (content, processing) = open_ledgers(config)?;
    let tail = |len: usize| len.saturating_sub(limit.unwrap_or(len));

    match ledger {
        LedgerKind::Content => {
            let records = content.records()?;
            let records = &records[tail(records.len())..];
            if json {
                println!("{}", serde_json::to_string_pretty(records)?);
                return Ok(());
            }
            println!(
                "  {:<20} {:<17} {:<28} {:<30} {:>5}",
                "First seen", "Content key", "Sender", "Subject", "Files"
            );
            println!("  {}", "-".repeat(104));
            for r in records {
                println!(
                    "  {:<20} {:<17} {:<28} {:<30} {:>5}",
                    r.first_seen_at.format("%Y-%m-%d %H:%M:%S"),
                    truncate(r.content_key.as_str(), 16),
                    truncate(&r.sender, 27),
                    truncate(&r.subject, 29),
                    r.artifact_locations.len()
                );
            }
            println!("\n  {} record(s)", records.len());
        }
        LedgerKind::Processing => {
            let records = processing.records()?;
            let records = &records[tail(records.len())..];
            if json {
                println!("{}", serde_json::to_string_pretty(records)?);
                return Ok(());
            }
            println!(
                "  {:<20} {:<32} {:<26} {:<8} {:<17}",
                "Processed", "Message-ID", "Recipient", "Status", "Content key"
            );
            println!("  {}", "-".repeat(106));
            for r in records {
                println!(
                    "  {:<20} {:<32} {:<26} {:<8} {:<17}",
                    r.processed_at.format("%Y-%m-%d %H:%M:%S"),
                    truncate(&r.message_id, 31),
                    truncate(&r.recipient, 25),
                    r.status.as_str(),
                    r.content_key.as_ref().map(|k| k.as_str()).unwrap_or("-")
                );
                if let Some(err) = &r.error {
                    println!("  {:<20} ! {}", "", err);
                }
            }
            println!("\n  {} record(s)", records.len());
        }
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
        out.push('…');
        out
    }
}

/// Show ledger sizes and counts.
fn cmd_stats(config: &Config, json: bool) -> anyhow::Result<()> {
    use humansize::{format_size, BINARY};

    let (content, processing) = open_ledgers(config)?;
    let quota = QuotaStore::open(config::quota_snapshot_path(config), &config.quota);

    let content_records = content.records()?;
    let processing_records = processing.records()?;
    let failed = processing_records
        .iter()
        .filter(|r| r.status == ProcessingStatus::Error)
        .count();
    let file_size = |p: &Path| std::fs::metadata(p).map(|m| m.len()).unwrap_or(0);
    let quota_path = config::quota_snapshot_path(config);

    if json {
        let stats = serde_json::json!({
            "data_dir": config::data_dir(config).to_string_lossy(),
            "content_ledger": {
                "path": content.path().to_string_lossy(),
                "size": file_size(content.path()),
                "records": content_records.len(),
            },
            "processing_ledger": {
                "path": processing.path().to_string_lossy(),
                "size": file_size(processing.path()),
                "records": processing_records.len(),
                "failed": failed,
            },
            "quota": {
                "path": quota_path.to_string_lossy(),
                "size": file_size(&quota_path),
                "entries": quota.len(),
                "capacity": quota.capacity(),
            },
        });
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!();
    println!("  {:<22} {}", "Data directory", config::data_dir(config).display());
    println!(
        "  {:<22} {} record(s), {}",
        "Content ledger",
        content_records.len(),
        format_size(file_size(content.path()), BINARY)
    );
    println!(
        "  {:<22} {} record(s) ({} failed), {}",
        "Processing ledger",
        processing_records.len(),
        failed,
        format_size(file_size(processing.path()), BINARY)
    );
    println!(
        "  {:<22} {}/{} entries, {}",
        "Quota store",
        quota.len(),
        quota.capacity(),
        format_size(file_size(&quota_path), BINARY)
    );
    if let Some(newest) = content_records.iter().map(|r| r.first_seen_at).max() {
        println!("  {:<22} {}", "Newest content", newest.format("%Y-%m-%d %H:%M"));
    }
    println!();
    Ok(())
}

/// Remove processing records by age and/or failure.
fn cmd_purge(config: &Config, older_than: Option<u32>, failed: bool) -> anyhow::Result<()> {
    let _lock = RunLock::acquire(config::lock_file_path(config))?;
    let (_, processing) = open_ledgers(config)?;
    let quota = QuotaStore::open(config::quota_snapshot_path(config), &config.quota);

    let mut total = PurgeStats::default();
    if failed {
        let stats = maintenance::purge_failed(&processing, &quota)?;
        total.processing_rows += stats.processing_rows;
        total.quota_entries += stats.quota_entries;
    }
    if older_than.is_some() || !failed {
        let days = older_than.unwrap_or(config.maintenance.default_max_age_days);
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        let stats = maintenance::purge_older_than(&processing, &quota, cutoff)?;
        total.processing_rows += stats.processing_rows;
        total.quota_entries += stats.quota_entries;
    }
    quota.save()?;

    println!(
        "  Removed {} processing record(s) and {} quota entr{}",
        total.processing_rows,
        total.quota_entries,
        if total.quota_entries == 1 { "y" } else { "ies" }
    );
    Ok(())
}

/// Print the effective configuration, or write it with `--init`.
fn cmd_config(config: &Config, init: bool) -> anyhow::Result<()> {
    if init {
        let path = config::config_file_path()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config file path"))?;
        if path.exists() {
            anyhow::bail!("Config file already exists: {}", path.display());
        }
        config::save_config(config)?;
        println!("  Wrote {}", path.display());
        return Ok(());
    }
    if let Some(path) = config::config_file_path() {
        println!("# {}", path.display());
    }
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

/// Generate shell completions and print to stdout.
fn cmd_completions(shell: clap_complete::Shell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "mailledger", &mut std::io::stdout());
    Ok(())
}

/// Generate a man page and print to stdout.
fn cmd_manpage() -> anyhow::Result<()> {
    let cmd = Cli::command();
    let man = clap_mangen::Man::new(cmd);
    let mut buf = Vec::new();
    man.render(&mut buf)?;
    std::io::Write::write_all(&mut std::io::stdout(), &buf)?;
    Ok(())
}
