//! caseflow CLI: run pipelines and inspect work items.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use caseflow::config::secrets::redact_url;
use caseflow::config::{self, Config, Overrides, PipelineRegistry};
use caseflow::db::Db;
use caseflow::engine::runner::DEFAULT_MAX_ATTEMPTS;
use caseflow::engine::{BatchRunner, RunOutcome};
use caseflow::model::{NewWorkItem, StatusName, WorkId};
use caseflow::store::{ListQuery, SubmitResult, WorkStore};
use caseflow::telemetry::metrics;
use caseflow::telemetry::{TelemetryConfig, init_telemetry};
use chrono::Utc;
use clap::{Parser, Subcommand};
use opentelemetry::KeyValue;
use secrecy::ExposeSecret;

#[derive(Parser)]
#[command(name = "caseflow", about = "Status-driven batch pipeline runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a pipeline until its queue drains
    Run {
        /// Pipeline name
        pipeline: String,
        /// Pipelines file (default: $CASEFLOW_PIPELINES or pipelines.toml)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Items per claim
        #[arg(long)]
        limit: Option<u32>,
        /// Minimum wait between items, seconds
        #[arg(long)]
        min_wait: Option<u64>,
        /// Maximum wait between items, seconds
        #[arg(long)]
        max_wait: Option<u64>,
        /// Stop after this many claim cycles
        #[arg(long)]
        max_iterations: Option<u64>,
        /// Stop after this many seconds
        #[arg(long)]
        max_runtime: Option<u64>,
    },
    /// List configured pipelines
    Pipelines {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Work item operations
    Work {
        #[command(subcommand)]
        action: WorkAction,
    },
}

#[derive(Subcommand)]
enum WorkAction {
    /// Submit a new work item
    Submit {
        /// Queue (usually the pipeline name)
        queue: String,
        /// JSON payload
        #[arg(long)]
        payload: Option<String>,
        /// Ingestion dedup key, e.g. the case id
        #[arg(long)]
        dedup_key: Option<String>,
        /// Priority (higher = more urgent)
        #[arg(long, default_value_t = 0)]
        priority: i32,
        /// Attempt bound for this item
        #[arg(long)]
        max_attempts: Option<u32>,
    },
    /// List work items
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
        /// Filter by queue
        #[arg(long)]
        queue: Option<String>,
        /// Maximum items to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show a work item and its artifacts
    Show {
        /// Work item ID (full UUID or prefix)
        id: String,
    },
    /// Return stale claims to the queue
    Reclaim {
        /// Claims older than this many seconds
        #[arg(long, default_value_t = 600)]
        older_than: u64,
        /// Only this queue
        #[arg(long)]
        queue: Option<String>,
        /// Attempt bound for items without their own
        #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
        max_attempts: u32,
    },
    /// Per-status counts for a queue
    Stats { queue: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            pipeline,
            config,
            limit,
            min_wait,
            max_wait,
            max_iterations,
            max_runtime,
        } => {
            let overrides = Overrides {
                batch_size: limit,
                min_wait_secs: min_wait,
                max_wait_secs: max_wait,
                max_iterations,
                max_runtime_secs: max_runtime,
            };
            cmd_run(pipeline, config, overrides).await
        }
        Command::Pipelines { config } => {
            cmd_pipelines(config)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Work { action } => {
            let config = Config::from_env()?;
            let db = Db::connect(config.database_url.expose_secret()).await?;
            db.migrate().await?;

            match action {
                WorkAction::Submit {
                    queue,
                    payload,
                    dedup_key,
                    priority,
                    max_attempts,
                } => cmd_work_submit(&db, queue, payload, dedup_key, priority, max_attempts).await?,
                WorkAction::List {
                    status,
                    queue,
                    limit,
                } => cmd_work_list(&db, status, queue, limit).await?,
                WorkAction::Show { id } => cmd_work_show(&db, id).await?,
                WorkAction::Reclaim {
                    older_than,
                    queue,
                    max_attempts,
                } => cmd_work_reclaim(&db, older_than, queue, max_attempts).await?,
                WorkAction::Stats { queue } => cmd_work_stats(&db, queue).await?,
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_registry(config: &Config, path: Option<PathBuf>) -> anyhow::Result<PipelineRegistry> {
    let path = path.unwrap_or_else(|| config.pipelines_path.clone());
    Ok(PipelineRegistry::load(&path)?)
}

async fn cmd_run(
    pipeline: String,
    path: Option<PathBuf>,
    overrides: Overrides,
) -> anyhow::Result<ExitCode> {
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "caseflow".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let registry = load_registry(&config, path)?;
    let mut def = registry
        .get(&pipeline)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("unknown pipeline '{pipeline}'"))?;
    def.apply(&overrides);
    def.validate()?;

    tracing::info!(
        pipeline = %def.name,
        database = %redact_url(&config.database_url),
        "starting run"
    );

    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;

    let step = def.build_step(config.anthropic_api_key.as_ref(), config.s3.as_ref())?;
    let runner = BatchRunner::new(
        Arc::new(db),
        step,
        def.claim_strategy(),
        def.backoff(),
        def.runner_config(),
    );

    let cancel = runner.cancellation_token();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("interrupt received, stopping after releasing claims");
        cancel.cancel();
    });

    let report = runner.run().await;
    let s = &report.summary;

    println!(
        "{}: done {}  failed {}  skipped {}  requeued {}",
        def.name, s.done, s.failed, s.skipped, s.requeued
    );
    if s.released + s.claims_lost + s.reclaimed > 0 {
        println!(
            "released {}  claims lost {}  reclaimed {}",
            s.released, s.claims_lost, s.reclaimed
        );
    }
    match &report.outcome {
        RunOutcome::Drained => println!("drained after {} batch(es)", s.batches),
        RunOutcome::Aborted(reason) => println!("aborted: {reason:?}"),
    }

    Ok(ExitCode::from(report.outcome.exit_code() as u8))
}

fn cmd_pipelines(path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = path.unwrap_or_else(config::pipelines_path);
    let registry = PipelineRegistry::load(&path)?;

    println!(
        "{:<12}  {:<12}  {:<9}  {:<5}  {:<7}  REQUIRES",
        "NAME", "QUEUE", "STEP", "BATCH", "WAIT"
    );
    println!("{}", "-".repeat(64));
    for name in registry.names() {
        let Some(def) = registry.get(name) else {
            continue;
        };
        println!(
            "{:<12}  {:<12}  {:<9}  {:<5}  {:<7}  {}",
            def.name,
            def.queue(),
            format!("{:?}", def.step).to_lowercase(),
            def.batch_size,
            format!("{}-{}s", def.min_wait_secs, def.max_wait_secs),
            def.require_field.join(",")
        );
    }
    Ok(())
}

async fn cmd_work_submit(
    db: &Db,
    queue: String,
    payload: Option<String>,
    dedup_key: Option<String>,
    priority: i32,
    max_attempts: Option<u32>,
) -> anyhow::Result<()> {
    let payload: serde_json::Value = match payload {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::json!({}),
    };

    let mut new = NewWorkItem::new(&queue).payload(payload).priority(priority);
    if let Some(key) = dedup_key {
        new = new.dedup_key(key);
    }
    if let Some(n) = max_attempts {
        new = new.max_attempts(n);
    }

    let result = db.submit(new).await?;
    let label = match &result {
        SubmitResult::Created(_) => "ok",
        SubmitResult::Duplicate { .. } => "duplicate",
    };
    metrics::items_submitted().add(
        1,
        &[KeyValue::new("queue", queue), KeyValue::new("result", label)],
    );

    match result {
        SubmitResult::Created(item) => {
            println!("Created: {} (status: {})", item.id, item.status);
        }
        SubmitResult::Duplicate { existing } => {
            println!("Duplicate: already queued as {existing}");
        }
    }
    Ok(())
}

async fn cmd_work_list(
    db: &Db,
    status: Option<String>,
    queue: Option<String>,
    limit: i64,
) -> anyhow::Result<()> {
    let status: Option<StatusName> = match status {
        Some(s) => Some(
            s.parse()
                .map_err(|_| anyhow::anyhow!("invalid status: {s}"))?,
        ),
        None => None,
    };

    let items = db
        .list(&ListQuery {
            status,
            queue,
            limit,
        })
        .await?;

    if items.is_empty() {
        println!("No work items found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<10}  {:<26}  {:<4}  {:<3}  {:<24}  CREATED",
        "ID", "QUEUE", "STATUS", "PRI", "TRY", "DEDUP_KEY"
    );
    println!("{}", "-".repeat(104));

    for item in &items {
        let dedup: String = item
            .dedup_key
            .as_deref()
            .unwrap_or("-")
            .chars()
            .take(24)
            .collect();
        println!(
            "{:<8}  {:<10}  {:<26}  {:<4}  {:<3}  {:<24}  {}",
            item.id,
            item.queue,
            item.status.to_string(),
            item.priority,
            item.attempts,
            dedup,
            item.created_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!("\n{} item(s)", items.len());
    Ok(())
}

async fn cmd_work_show(db: &Db, id_str: String) -> anyhow::Result<()> {
    let id = if id_str.len() < 36 {
        // Prefix search
        let items = db
            .list(&ListQuery {
                limit: 10_000,
                ..ListQuery::default()
            })
            .await?;
        let matches: Vec<_> = items
            .iter()
            .filter(|item| item.id.0.to_string().starts_with(&id_str))
            .collect();
        match matches.len() {
            0 => anyhow::bail!("no work item matching prefix '{id_str}'"),
            1 => matches[0].id,
            n => anyhow::bail!("{n} work items match prefix '{id_str}', be more specific"),
        }
    } else {
        WorkId(uuid::Uuid::parse_str(&id_str)?)
    };

    let item = db.get(id).await?;

    println!("ID:          {}", item.id.0);
    println!("Queue:       {}", item.queue);
    println!("Status:      {}", item.status);
    println!("Priority:    {}", item.priority);
    println!("Dedup Key:   {}", item.dedup_key.as_deref().unwrap_or("-"));
    println!("Payload:     {}", serde_json::to_string_pretty(&item.payload)?);
    println!(
        "Attempts:    {} / {}",
        item.attempts,
        item.max_attempts
            .map(|n| n.to_string())
            .unwrap_or("default".to_string())
    );
    println!("Available:   {}", item.available_at);
    if let Some(claimed) = item.claimed_at {
        println!("Claimed:     {claimed}");
    }
    println!("Created:     {}", item.created_at);
    println!("Updated:     {}", item.updated_at);
    if let Some(completed) = item.completed_at {
        println!("Completed:   {completed}");
    }
    if let Some(ref error) = item.last_error {
        println!("Last Error:  {error}");
    }
    if let Some(ref output) = item.output {
        println!("---");
        println!("Output:      {}", serde_json::to_string_pretty(output)?);
    }

    let artifacts = db.artifacts(id).await?;
    if !artifacts.is_empty() {
        println!("---");
        for artifact in &artifacts {
            println!("{:<6}  {}", artifact.kind, artifact.key);
        }
    }
    Ok(())
}

async fn cmd_work_reclaim(
    db: &Db,
    older_than: u64,
    queue: Option<String>,
    max_attempts: u32,
) -> anyhow::Result<()> {
    let cutoff = Utc::now() - chrono::Duration::from_std(std::time::Duration::from_secs(older_than))?;
    let reclaimed = db
        .reclaim_stale(queue.as_deref(), cutoff, max_attempts)
        .await?;
    println!(
        "Reclaimed {} claim(s): {} requeued, {} out of attempts",
        reclaimed.total(),
        reclaimed.requeued,
        reclaimed.exhausted
    );
    Ok(())
}

async fn cmd_work_stats(db: &Db, queue: String) -> anyhow::Result<()> {
    let counts = db.counts(&queue).await?;
    println!("Queue:    {queue}");
    println!("Pending:  {}", counts.pending);
    println!("Claimed:  {}", counts.claimed);
    println!("Done:     {}", counts.done);
    println!("Failed:   {}", counts.failed);
    println!("Skipped:  {}", counts.skipped);
    println!("Total:    {}", counts.total());
    Ok(())
}
