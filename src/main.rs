//! Commsmap CLI entry point. Thin by design: every subcommand binds one
//! programmatic entry point and one output mode.

use clap::{Parser, Subcommand};
use commsmap::config::Config;
use commsmap::store::jobs::JobKind;
use commsmap::store::proposals::ProposalStatus;
use commsmap::store::Store;
use commsmap::sync::{background, webhook, Orchestrator, Selector};
use commsmap::{Channel, Error};
use serde::Serialize;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "commsmap", version)]
#[command(about = "Personal communications cartographer")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to config file (defaults to the per-user config directory)
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit JSON instead of text
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest from external channels
    #[command(subcommand)]
    Sync(SyncCommand),
    /// Run the AI analysis/embedding pipeline
    #[command(subcommand)]
    Compute(ComputeCommand),
    /// Identity resolution and merge review
    #[command(subcommand)]
    Identify(IdentifyCommand),
    /// Conversation chunking
    #[command(subcommand)]
    Chunk(ChunkCommand),
    /// Structured extraction over stored events
    #[command(subcommand)]
    Extract(ExtractCommand),
}

#[derive(Subcommand)]
enum SyncCommand {
    /// Run sync for one adapter or all enabled adapters
    Run {
        /// Adapter instance name; omit for all
        adapter: Option<String>,
        /// Re-read from channel origin instead of resuming the cursor
        #[arg(long)]
        full: bool,
        /// Detach and run in the background
        #[arg(long)]
        background: bool,
    },
    /// Show per-adapter job status
    Status,
    /// Serve the webhook trigger receiver
    Webhook,
}

#[derive(Subcommand)]
enum ComputeCommand {
    /// Queue analysis or embedding jobs
    Enqueue {
        /// Job kind: analysis, embedding_conversation, embedding_facet, embedding_person
        kind: String,
        /// Restrict to specific entity ids
        #[arg(long, value_delimiter = ',')]
        ids: Option<Vec<String>>,
    },
    /// Drain the job queue through the LLM API
    Run,
}

#[derive(Subcommand)]
enum IdentifyCommand {
    /// Run the resolver phases; optionally execute auto-eligible merges
    Resolve {
        #[arg(long)]
        auto: bool,
    },
    /// List merge proposals
    List {
        /// Filter by status (pending, accepted, rejected, executed, expired)
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Accept a proposal and execute the merge
    Accept { id: String },
    /// Reject a proposal
    Reject { id: String },
    /// Execute every pending auto-eligible merge
    Auto,
    /// Resolution statistics
    Stats,
}

#[derive(Subcommand)]
enum ChunkCommand {
    /// Create or update a chunk definition
    Define {
        name: String,
        /// Strategy: time_gap or native_thread
        #[arg(long)]
        strategy: String,
        #[arg(long)]
        channel: Option<String>,
        #[arg(long)]
        gap_seconds: Option<i64>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Run a stored definition
    Run { name: String },
}

#[derive(Subcommand)]
enum ExtractCommand {
    /// Scan event content for email addresses and phone numbers
    Pii {
        #[arg(long)]
        channel: Option<String>,
        /// Only events at or after this unix timestamp
        #[arg(long)]
        since: Option<i64>,
        #[arg(long)]
        dry_run: bool,
    },
}

/// Output context bound once at startup and threaded to every handler.
#[derive(Clone, Copy)]
struct Output {
    json: bool,
}

impl Output {
    fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce() -> String) {
        if self.json {
            match serde_json::to_string_pretty(value) {
                Ok(rendered) => println!("{rendered}"),
                Err(error) => eprintln!("failed to render JSON: {error}"),
            }
        } else {
            println!("{}", text());
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("error: {error}");
            return ExitCode::from(2);
        }
    };

    if background::is_background_child() {
        commsmap::logging::init_background(&config.log_dir(), cli.debug);
    } else {
        commsmap::logging::init_foreground(cli.debug);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("error: failed to start runtime: {error}");
            return ExitCode::FAILURE;
        }
    };

    let output = Output { json: cli.json };
    match runtime.block_on(dispatch(cli, config, output)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error}");
            if error.is_fatal() {
                tracing::error!(%error, "fatal storage failure");
            }
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> commsmap::Result<Config> {
    match &cli.config {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    }
}

async fn dispatch(cli: Cli, config: Config, output: Output) -> commsmap::Result<()> {
    let store = Store::open(&config.db_path()).await?;

    match cli.command {
        Command::Sync(command) => run_sync(command, store, config, output).await,
        Command::Compute(command) => run_compute(command, store, config, output).await,
        Command::Identify(command) => run_identify(command, store, output).await,
        Command::Chunk(command) => run_chunk(command, store, output).await,
        Command::Extract(command) => run_extract(command, store, output).await,
    }
}

async fn run_sync(
    command: SyncCommand,
    store: Store,
    config: Config,
    output: Output,
) -> commsmap::Result<()> {
    match command {
        SyncCommand::Run {
            adapter,
            full,
            background: true,
        } => {
            // Relaunch with the background flag stripped; the child does the
            // actual work against the same job rows.
            let mut args: Vec<String> = vec!["sync".to_string(), "run".to_string()];
            if let Some(adapter) = adapter {
                args.push(adapter);
            }
            if full {
                args.push("--full".to_string());
            }
            let handle = background::spawn(&args, &config.log_dir())?;
            output.emit(&handle, || {
                format!(
                    "sync running in background (pid {}), log: {}",
                    handle.pid,
                    handle.log_path.display()
                )
            });
            Ok(())
        }
        SyncCommand::Run {
            adapter,
            full,
            background: false,
        } => {
            let selector = match adapter {
                Some(name) => Selector::One(name),
                None => Selector::All,
            };
            let orchestrator = Orchestrator::new(store, config);
            let cancel = cancel_on_ctrl_c();
            let result = orchestrator.run(&selector, full, cancel).await?;
            output.emit(&result, || {
                let mut lines = vec![format!("ok: {}", result.ok)];
                for report in &result.adapters {
                    let line = match (&report.result, &report.error) {
                        (Some(counts), _) => format!(
                            "  {}: ok ({} events, {} persons, {} ms)",
                            report.adapter,
                            counts.events_created,
                            counts.persons_created,
                            counts.duration_ms
                        ),
                        (None, Some(error)) => format!("  {}: error: {error}", report.adapter),
                        (None, None) => format!("  {}: no result", report.adapter),
                    };
                    lines.push(line);
                }
                lines.join("\n")
            });
            if result.ok {
                Ok(())
            } else {
                Err(Error::Other(anyhow::anyhow!("one or more adapters failed")))
            }
        }
        SyncCommand::Status => {
            let jobs = store.list_sync_jobs().await?;
            output.emit(&jobs, || {
                if jobs.is_empty() {
                    return "no sync jobs yet".to_string();
                }
                jobs.iter()
                    .map(|job| {
                        format!(
                            "{}: {} (phase: {}, error: {})",
                            job.adapter,
                            job.status,
                            job.phase.as_deref().unwrap_or("-"),
                            job.last_error.as_deref().unwrap_or("-")
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            });
            Ok(())
        }
        SyncCommand::Webhook => {
            let orchestrator = Arc::new(Orchestrator::new(store, config));
            let state = Arc::new(webhook::WebhookState::new(orchestrator));
            let cancel = cancel_on_ctrl_c();
            let handle = webhook::serve(state, cancel).await?;
            handle.await.map_err(|error| anyhow::anyhow!(error))?;
            Ok(())
        }
    }
}

async fn run_compute(
    command: ComputeCommand,
    store: Store,
    config: Config,
    output: Output,
) -> commsmap::Result<()> {
    match command {
        ComputeCommand::Enqueue { kind, ids } => {
            let kind = JobKind::parse(&kind).ok_or_else(|| {
                commsmap::error::ConfigError::Invalid(format!("unknown job kind: {kind}"))
            })?;
            let queued = match kind {
                JobKind::Analysis => commsmap::compute::enqueue_analysis(&store, &config, ids).await?,
                _ => commsmap::compute::enqueue_embeddings(&store, &config, kind, ids).await?,
            };
            output.emit(&serde_json::json!({ "queued": queued }), || {
                format!("queued {queued} jobs")
            });
            Ok(())
        }
        ComputeCommand::Run => {
            let engine = Arc::new(commsmap::compute::ComputeEngine::new(
                store,
                config.compute.clone(),
                config.llm.clone(),
            )?);
            let cancel = cancel_on_ctrl_c();
            let snapshot = engine.run(cancel).await?;
            output.emit(&snapshot, || {
                serde_json::to_string_pretty(&snapshot.0).unwrap_or_default()
            });
            Ok(())
        }
    }
}

async fn run_identify(
    command: IdentifyCommand,
    store: Store,
    output: Output,
) -> commsmap::Result<()> {
    let resolver = commsmap::resolve::Resolver::new(store);
    match command {
        IdentifyCommand::Resolve { auto } => {
            let report = resolver.resolve(auto).await?;
            output.emit(&report, || {
                format!(
                    "proposals: {}, auto merges: {}, facts attributed: {}, active persons: {}",
                    report.proposals_written,
                    report.auto_merges_executed,
                    report.facts_attributed,
                    report.stats.active_persons
                )
            });
            Ok(())
        }
        IdentifyCommand::List { status, limit } => {
            let status = match status.as_deref() {
                Some(raw) => Some(ProposalStatus::parse(raw).ok_or_else(|| {
                    commsmap::error::ConfigError::Invalid(format!("unknown status: {raw}"))
                })?),
                None => None,
            };
            let proposals = resolver.list_suggestions(status, limit).await?;
            output.emit(&proposals, || {
                proposals
                    .iter()
                    .map(|p| {
                        format!(
                            "{} [{}] {:.2} {} -> {} ({})",
                            p.id,
                            p.status,
                            p.score,
                            p.source_person_id,
                            p.target_person_id,
                            p.proposal_type
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            });
            Ok(())
        }
        IdentifyCommand::Accept { id } => {
            resolver.accept(&id).await?;
            output.emit(&serde_json::json!({ "accepted": id }), || {
                format!("accepted {id}")
            });
            Ok(())
        }
        IdentifyCommand::Reject { id } => {
            resolver.reject(&id).await?;
            output.emit(&serde_json::json!({ "rejected": id }), || {
                format!("rejected {id}")
            });
            Ok(())
        }
        IdentifyCommand::Auto => {
            let executed = resolver.execute_auto_merges().await?;
            output.emit(&serde_json::json!({ "merged": executed }), || {
                format!("executed {executed} auto merges")
            });
            Ok(())
        }
        IdentifyCommand::Stats => {
            let stats = resolver.resolution_stats().await?;
            output.emit(&stats, || {
                format!(
                    "persons: {} active / {} tombstoned, facts: {}, identities: {}, proposals: {} pending ({} auto), unresolved facts: {}, cross-channel: {}",
                    stats.active_persons,
                    stats.tombstoned_persons,
                    stats.total_facts,
                    stats.hard_identifiers,
                    stats.pending_proposals,
                    stats.auto_eligible_proposals,
                    stats.unresolved_facts,
                    stats.cross_channel_persons
                )
            });
            Ok(())
        }
    }
}

async fn run_chunk(command: ChunkCommand, store: Store, output: Output) -> commsmap::Result<()> {
    match command {
        ChunkCommand::Define {
            name,
            strategy,
            channel,
            gap_seconds,
            description,
        } => {
            let mut config = serde_json::Map::new();
            if let Some(gap) = gap_seconds {
                config.insert("gap_seconds".to_string(), serde_json::json!(gap));
            }
            commsmap::chunker::define(
                &store,
                &name,
                channel.as_deref(),
                &strategy,
                serde_json::Value::Object(config),
                description.as_deref(),
            )
            .await?;
            output.emit(&serde_json::json!({ "defined": name }), || {
                format!("defined {name}")
            });
            Ok(())
        }
        ChunkCommand::Run { name } => {
            let report = commsmap::chunker::run(&store, &name).await?;
            output.emit(&report, || {
                format!(
                    "{}: {} conversations over {} events",
                    report.definition, report.conversations, report.events
                )
            });
            Ok(())
        }
    }
}

async fn run_extract(
    command: ExtractCommand,
    store: Store,
    output: Output,
) -> commsmap::Result<()> {
    match command {
        ExtractCommand::Pii {
            channel,
            since,
            dry_run,
        } => {
            let channel = match channel.as_deref() {
                Some(raw) => Some(Channel::parse(raw).ok_or_else(|| {
                    commsmap::error::ConfigError::Invalid(format!("unknown channel: {raw}"))
                })?),
                None => None,
            };
            let report = commsmap::extract::pii(
                &store,
                &commsmap::extract::PiiFilter { channel, since },
                dry_run,
            )
            .await?;
            output.emit(&report, || {
                format!(
                    "scanned {} events: {} facts{}, {} unattributed",
                    report.events_scanned,
                    report.facts_written,
                    if report.dry_run { " (dry run)" } else { "" },
                    report.unattributed
                )
            });
            Ok(())
        }
    }
}

/// Cancellation token wired to Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, cancelling");
            trigger.cancel();
        }
    });
    cancel
}
