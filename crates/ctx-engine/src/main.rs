mod config;
mod daemon;
mod logging;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use config::{EngineConfig, Overrides};
use ctx_core::memory_contracts::{AlertClass, Significance};
use ctx_mind::{
    BootstrapCoordinator, CorrectionScope, DegradationMonitor, DeterministicReasoner,
    PipelineScheduler, PortGateway, SessionDraft, SessionRange, TickOutcome, TieredMemoryStore,
    ToolSurface,
};
use ctx_storage::{DataDirLock, LocalArchiveIndex};
use std::{
    io::Read,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
};
use tracing::{error, info};

const LOCK_FILE_NAME: &str = "ctx-engine.lock";
const ARCHIVE_DB_NAME: &str = "archive.db";

#[derive(Parser, Debug)]
#[command(name = "ctx-engine", version, about = "Tiered memory pipeline for assistant sessions")]
struct Cli {
    /// TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the tick loop and serve /health until ctrl-c.
    Run {
        #[arg(long)]
        health_addr: Option<String>,
        #[arg(long, default_value_t = false)]
        learning_mode: bool,
    },
    /// Run scheduler ticks in the foreground.
    Tick {
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
    Scaffold,
    /// Re-queue cold sessions created within the range.
    Reprocess {
        /// RFC 3339 lower bound (inclusive).
        #[arg(long)]
        from: Option<String>,
        /// RFC 3339 upper bound (inclusive).
        #[arg(long)]
        to: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    RebuildMaster,
    Status,
    /// Print the health snapshot as JSON.
    Health,
    Load {
        #[arg(long)]
        topic: Option<String>,
    },
    /// Save a session from --text, --file or stdin.
    Save {
        #[arg(long)]
        text: Option<String>,
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long, default_value = "medium")]
        significance: String,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    Checkpoint {
        session_id: String,
        note: String,
        #[arg(long, default_value = "medium")]
        significance: String,
    },
    Search {
        query: String,
        #[arg(long = "collection")]
        collections: Vec<String>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    Correct {
        item: String,
        correction: String,
        /// hot, archive or both.
        #[arg(long, default_value = "both")]
        scope: String,
    },
    /// Dismiss active nudges or anomalies whose subject contains the text.
    Dismiss {
        needle: String,
        #[arg(long, default_value = "nudge")]
        class: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let overrides = Overrides {
        data_dir: cli.data_dir.clone(),
        log_dir: cli.log_dir.clone(),
        health_addr: match &cli.command {
            Command::Run { health_addr, .. } => health_addr.clone(),
            _ => None,
        },
        learning_mode: matches!(
            cli.command,
            Command::Run {
                learning_mode: true,
                ..
            }
        ),
    };
    let config = match EngineConfig::load(cli.config.as_deref(), &overrides) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("config_error: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    // One-shot commands print their results; keep their log output quiet.
    let default_level = match cli.command {
        Command::Run { .. } => config.log_level.clone(),
        _ => config
            .log_level
            .clone()
            .or_else(|| (!cli.debug).then(|| "warn".to_string())),
    };
    let _log_guard = logging::init_logging(
        default_level.as_deref(),
        cli.debug,
        config.log_dir.as_deref(),
    );

    match execute(cli.command, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(event = "command_failed", error = %format!("{err:#}"));
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn execute(command: Command, config: &EngineConfig) -> Result<()> {
    let data_dir = config.resolved_data_dir();
    let now = Utc::now();
    match command {
        Command::Run { .. } => {
            let lock = acquire_lock(&data_dir)?;
            let scheduler = open_scheduler(config, &data_dir)?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("starting async runtime")?;
            runtime.block_on(daemon::run(scheduler, &config.health_addr, lock))
        }
        Command::Tick { count } => {
            let _lock = acquire_lock(&data_dir)?;
            let scheduler = open_scheduler(config, &data_dir)?;
            for _ in 0..count.max(1) {
                let report = scheduler.tick(Utc::now())?;
                println!(
                    "{:<10} session={} revision={} outbox_pending={}",
                    outcome_label(&report.outcome),
                    report.session_id.as_deref().unwrap_or("-"),
                    report
                        .revision
                        .map_or_else(|| "-".to_string(), |revision| revision.to_string()),
                    report.outbox.pending
                );
                if report.outcome == TickOutcome::Idle {
                    break;
                }
            }
            Ok(())
        }
        Command::Scaffold => {
            let _lock = acquire_lock(&data_dir)?;
            let report = coordinator(config, &data_dir)?.scaffold(now)?;
            println!(
                "{} revision {}",
                if report.created { "created" } else { "existing" },
                report.document.revision
            );
            Ok(())
        }
        Command::Reprocess { from, to, limit } => {
            let _lock = acquire_lock(&data_dir)?;
            let range = SessionRange {
                from: from.as_deref().map(parse_timestamp).transpose()?,
                to: to.as_deref().map(parse_timestamp).transpose()?,
                limit,
            };
            let report = coordinator(config, &data_dir)?.reprocess(&range, now)?;
            println!(
                "scanned={} enqueued={} requeued={} skipped_pending={} errors={}",
                report.scanned,
                report.enqueued,
                report.requeued,
                report.skipped_pending,
                report.errors.len()
            );
            print_errors(&report.errors);
            Ok(())
        }
        Command::RebuildMaster => {
            let _lock = acquire_lock(&data_dir)?;
            let report = coordinator(config, &data_dir)?.rebuild_master(now)?;
            println!(
                "revision={} sessions={} records_applied={} records_skipped={}",
                report.revision, report.sessions, report.records_applied, report.records_skipped
            );
            print_errors(&report.errors);
            Ok(())
        }
        Command::Status => {
            let status = coordinator(config, &data_dir)?.status(now)?;
            println!("level:            {}", status.level.as_str());
            println!(
                "hot:              {}",
                match (status.hot_source, status.revision) {
                    (Some(source), Some(revision)) =>
                        format!("revision {revision} from {}", source.as_str()),
                    _ => "unreadable".to_string(),
                }
            );
            if let (Some(tokens), Some(budget)) = (status.hot_tokens, status.hot_budget) {
                println!("hot tokens:       {tokens} / {budget}");
            }
            println!("cold sessions:    {}", status.cold_sessions);
            println!(
                "queue:            queued={} in_progress={} completed={} failed_terminal={}",
                status.queue.queued,
                status.queue.in_progress,
                status.queue.completed,
                status.queue.failed_terminal
            );
            println!(
                "ledger:           total={} hot={} undelivered={}",
                status.ledger.total, status.ledger.hot, status.ledger.undelivered
            );
            println!(
                "alerts:           nudges={} anomalies={}",
                status.active_nudges, status.active_anomalies
            );
            Ok(())
        }
        Command::Health => {
            let scheduler = open_scheduler(config, &data_dir)?;
            let snapshot = daemon::health_snapshot(&scheduler);
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(())
        }
        Command::Load { topic } => {
            let _lock = acquire_lock(&data_dir)?;
            let scheduler = open_scheduler(config, &data_dir)?;
            let loaded = ToolSurface::new(&scheduler).load_context(topic.as_deref(), now)?;
            print!("{}", loaded.markdown);
            if !loaded.related.is_empty() {
                println!("\n## Related");
                for hit in &loaded.related {
                    println!("- [{}] {}", hit.collection, hit.text);
                }
            }
            println!(
                "\n<!-- revision {} from {}, level {} -->",
                loaded.revision,
                loaded.source.as_str(),
                loaded.level.as_str()
            );
            Ok(())
        }
        Command::Save {
            text,
            file,
            significance,
            tags,
        } => {
            let _lock = acquire_lock(&data_dir)?;
            let text = match (text, file) {
                (Some(text), _) => text,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                (None, None) => {
                    let mut buffer = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buffer)
                        .context("reading session text from stdin")?;
                    buffer
                }
            };
            let scheduler = open_scheduler(config, &data_dir)?;
            let draft = SessionDraft {
                text,
                significance: parse_significance(&significance)?,
                tags,
                source: Some("cli".to_string()),
            };
            let session_id = ToolSurface::new(&scheduler).save_session(draft, now)?;
            println!("{session_id}");
            Ok(())
        }
        Command::Checkpoint {
            session_id,
            note,
            significance,
        } => {
            let _lock = acquire_lock(&data_dir)?;
            let scheduler = open_scheduler(config, &data_dir)?;
            let checkpoint_id = ToolSurface::new(&scheduler).checkpoint(
                &session_id,
                &note,
                parse_significance(&significance)?,
                now,
            )?;
            println!("{checkpoint_id}");
            Ok(())
        }
        Command::Search {
            query,
            collections,
            limit,
        } => {
            let _lock = acquire_lock(&data_dir)?;
            let scheduler = open_scheduler(config, &data_dir)?;
            let collections = collections.iter().map(String::as_str).collect::<Vec<_>>();
            let results =
                ToolSurface::new(&scheduler).search_archive(&query, &collections, limit, now)?;
            for hit in &results.hits {
                println!("{:.3}  [{}] {}  {}", hit.score, hit.collection, hit.id, hit.text);
            }
            info!(event = "search_done", hits = results.hits.len(), source = ?results.source);
            Ok(())
        }
        Command::Correct {
            item,
            correction,
            scope,
        } => {
            let _lock = acquire_lock(&data_dir)?;
            let scope = CorrectionScope::parse(&scope)
                .ok_or_else(|| anyhow!("unknown correction scope {scope:?}"))?;
            let scheduler = open_scheduler(config, &data_dir)?;
            let report = ToolSurface::new(&scheduler).correct_fact(&item, &correction, scope, now)?;
            println!(
                "hot_entries={} revision={} archive_records={} ledger_records={}{}",
                report.hot_entries,
                report
                    .revision
                    .map_or_else(|| "-".to_string(), |revision| revision.to_string()),
                report.archive_records,
                report.ledger_records,
                if report.archive_unavailable {
                    " (archive unavailable)"
                } else {
                    ""
                }
            );
            Ok(())
        }
        Command::Dismiss { needle, class } => {
            let _lock = acquire_lock(&data_dir)?;
            let class = AlertClass::parse(class.trim())
                .ok_or_else(|| anyhow!("unknown alert class {class:?} (nudge, anomaly)"))?;
            let scheduler = open_scheduler(config, &data_dir)?;
            let dismissed = ToolSurface::new(&scheduler).dismiss(class, &needle, now)?;
            println!("dismissed {dismissed} {}", class.as_str());
            Ok(())
        }
    }
}

/// Every command that mutates or reads through the scheduler owns the data
/// directory for its duration; a running daemon makes them fail fast.
fn acquire_lock(data_dir: &Path) -> Result<DataDirLock> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating {}", data_dir.display()))?;
    DataDirLock::try_acquire(data_dir.join(LOCK_FILE_NAME), Utc::now())
        .with_context(|| format!("data directory {} is in use", data_dir.display()))
}

fn open_store(config: &EngineConfig, data_dir: &Path) -> Result<TieredMemoryStore> {
    let store = TieredMemoryStore::open(data_dir)
        .with_context(|| format!("opening data directory {}", data_dir.display()))?;
    Ok(store.with_revision_retention(config.revision_retention))
}

fn open_scheduler(config: &EngineConfig, data_dir: &Path) -> Result<PipelineScheduler> {
    let store = open_store(config, data_dir)?;
    let reasoner = DeterministicReasoner::new().context("compiling reasoning patterns")?;
    let archive = LocalArchiveIndex::open(data_dir.join(ARCHIVE_DB_NAME))
        .context("opening local archive")?;
    let gateway = PortGateway::new(
        Arc::new(reasoner),
        Arc::new(archive),
        DegradationMonitor::new(config.circuit),
        config.scheduler.timeouts,
    );
    Ok(PipelineScheduler::new(
        store,
        gateway,
        config.scheduler.clone(),
        Utc::now(),
    )?)
}

fn coordinator(config: &EngineConfig, data_dir: &Path) -> Result<BootstrapCoordinator> {
    Ok(BootstrapCoordinator::new(
        open_store(config, data_dir)?,
        DegradationMonitor::new(config.circuit),
        config.scheduler.budget,
    ))
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|parsed| parsed.with_timezone(&Utc))
        .with_context(|| format!("invalid timestamp {value:?}"))
}

fn parse_significance(value: &str) -> Result<Significance> {
    match Significance::parse(value.trim()) {
        Some(significance) => Ok(significance),
        None => bail!("unknown significance {value:?} (low, medium, high)"),
    }
}

fn outcome_label(outcome: &TickOutcome) -> &'static str {
    match outcome {
        TickOutcome::Idle => "idle",
        TickOutcome::Busy => "busy",
        TickOutcome::Completed => "completed",
        TickOutcome::Skipped => "skipped",
        TickOutcome::Deferred { .. } => "deferred",
        TickOutcome::Retried { .. } => "retried",
        TickOutcome::Interrupted { .. } => "interrupted",
        TickOutcome::Terminal => "terminal",
    }
}

fn print_errors(errors: &[String]) {
    for err in errors {
        eprintln!("  {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn cli_parses_subcommands_and_global_flags() {
        let cli = Cli::try_parse_from([
            "ctx-engine",
            "--data-dir",
            "/tmp/ctx",
            "reprocess",
            "--from",
            "2026-03-01T00:00:00Z",
            "--limit",
            "10",
        ])
        .expect("parse");
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/ctx")));
        match cli.command {
            Command::Reprocess { from, to, limit } => {
                assert_eq!(from.as_deref(), Some("2026-03-01T00:00:00Z"));
                assert_eq!(to, None);
                assert_eq!(limit, 10);
            }
            other => panic!("unexpected command {other:?}"),
        }

        let cli = Cli::try_parse_from(["ctx-engine", "correct", "atlas", "Atlas v2", "--scope", "hot"])
            .expect("parse");
        assert!(matches!(cli.command, Command::Correct { ref scope, .. } if scope == "hot"));
    }

    #[test]
    fn timestamps_and_significance_are_validated() {
        assert_eq!(
            parse_timestamp("2026-03-02T10:00:00+01:00").expect("timestamp"),
            Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0)
                .single()
                .expect("valid timestamp")
        );
        assert!(parse_timestamp("yesterday").is_err());
        assert_eq!(parse_significance("High").ok(), None);
        assert_eq!(parse_significance("high").ok(), Some(Significance::High));
    }

    #[test]
    fn one_shot_commands_share_the_data_directory() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = EngineConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..EngineConfig::default()
        };

        execute(
            Command::Save {
                text: Some("Decided to ship project atlas behind a flag.".to_string()),
                file: None,
                significance: "high".to_string(),
                tags: Vec::new(),
            },
            &config,
        )
        .expect("save");
        execute(Command::Tick { count: 3 }, &config).expect("tick");

        let scheduler = open_scheduler(&config, dir.path()).expect("scheduler");
        let hot = scheduler.store().read_hot().expect("hot document");
        assert_eq!(hot.document.revision, 1);
        assert!(hot.document.render_markdown().contains("atlas"));

        let _lock = acquire_lock(dir.path()).expect("lock");
        let err = execute(Command::Scaffold, &config).expect_err("lock held");
        assert!(format!("{err:#}").contains("in use"));
    }
}
