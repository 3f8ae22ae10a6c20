//! workqueue CLI: run workers and operate on the queue.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use workqueue::config::Config;
use workqueue::config::secrets::ExposeSecret;
use workqueue::db::Db;
use workqueue::engine::{QueueConfig, Reaper, ReaperConfig, WorkQueue, Worker, WorkerConfig};
use workqueue::model::{NewWorkItem, Pagination, WorkFilter, WorkId, WorkItem, WorkStatus};
use workqueue::registry::WorkerRegistry;
use workqueue::store::{InMemoryWorkStore, WorkStore};
use workqueue::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "workqueue", about = "Background work queue")]
struct Cli {
    /// Directory of per-type TOML defaults
    #[arg(long, global = true, default_value = "work-types")]
    work_types_dir: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a worker and the lease reaper
    Serve {
        /// Use a process-local store instead of Postgres
        #[arg(long)]
        in_memory: bool,
        /// Work types to accept (default: every registered type)
        #[arg(long, value_delimiter = ',')]
        types: Vec<String>,
        /// Maximum items executing at once
        #[arg(long, default_value_t = 4)]
        max_concurrent: usize,
    },
    /// Work item operations
    Work {
        #[command(subcommand)]
        action: WorkAction,
    },
    /// Run a handler inline, without queueing
    Do {
        work_type: String,
        /// JSON input
        #[arg(long)]
        input: Option<String>,
    },
}

#[derive(Subcommand)]
enum WorkAction {
    /// Enqueue a new work item
    Add {
        work_type: String,
        /// JSON input
        #[arg(long)]
        input: Option<String>,
        /// Priority (higher = more urgent)
        #[arg(long)]
        priority: Option<i32>,
        /// Retry budget
        #[arg(long)]
        retries: Option<u32>,
        /// Lease timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Not eligible until this many milliseconds from now
        #[arg(long)]
        delay_ms: Option<u64>,
    },
    /// List work items
    List {
        /// Filter by status (repeatable)
        #[arg(long)]
        status: Vec<String>,
        /// Filter by work type (repeatable)
        #[arg(long = "type")]
        work_type: Vec<String>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
    /// Show a work item
    Show {
        /// Work item ID (full UUID or prefix)
        id: String,
    },
    /// Remove a work item that is not currently allocated
    Remove { id: String },
    /// Spawn a successor for a failed work item
    Retry { id: String },
    /// Show every attempt in an item's retry chain
    Chain { id: String },
    /// Work types present in the queue
    Types,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;
    let registry = Arc::new(load_registry(&cli.work_types_dir)?);

    match cli.command {
        Command::Serve {
            in_memory,
            types,
            max_concurrent,
        } => cmd_serve(config, registry, in_memory, types, max_concurrent).await,
        Command::Do { work_type, input } => {
            let queue = WorkQueue::new(Arc::new(InMemoryWorkStore::new()), registry);
            let outcome = queue.do_work(&work_type, parse_input(input)?).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Command::Work { action } => {
            let store = connect(&config).await?;
            let queue = WorkQueue::new(store, registry).with_config(QueueConfig::from_config(&config));
            cmd_work(&queue, action).await
        }
    }
}

fn load_registry(dir: &Path) -> anyhow::Result<WorkerRegistry> {
    let mut registry = WorkerRegistry::with_builtins();
    if dir.is_dir() {
        registry.load_defaults_from_dir(dir)?;
    }
    Ok(registry)
}

async fn connect(config: &Config) -> anyhow::Result<Arc<dyn WorkStore>> {
    let db = Db::connect(config.database_url()?.expose_secret()).await?;
    db.migrate().await?;
    Ok(Arc::new(db))
}

fn parse_input(input: Option<String>) -> anyhow::Result<serde_json::Value> {
    Ok(match input {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::json!({}),
    })
}

async fn cmd_serve(
    config: Config,
    registry: Arc<WorkerRegistry>,
    in_memory: bool,
    types: Vec<String>,
    max_concurrent: usize,
) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig::from_config(&config, "workqueue"))?;

    let store: Arc<dyn WorkStore> = if in_memory {
        Arc::new(InMemoryWorkStore::new())
    } else {
        connect(&config).await?
    };
    let queue = WorkQueue::new(store, registry).with_config(QueueConfig::from_config(&config));

    let worker = Worker::new(
        queue.clone(),
        WorkerConfig::new(config.worker_id.clone())
            .types(types)
            .poll_interval(config.poll_interval)
            .max_concurrent(max_concurrent),
    );
    let reaper = Reaper::new(
        queue,
        ReaperConfig {
            interval: config.reaper_interval,
            ..ReaperConfig::default()
        },
    );

    let (w, r) = (worker.clone(), reaper.clone());
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        w.shutdown();
        r.shutdown();
    });

    let reaper_task = tokio::spawn(async move { reaper.run().await });
    worker.run().await?;
    reaper_task.await??;
    Ok(())
}

async fn cmd_work(queue: &WorkQueue, action: WorkAction) -> anyhow::Result<()> {
    match action {
        WorkAction::Add {
            work_type,
            input,
            priority,
            retries,
            timeout_ms,
            delay_ms,
        } => {
            let mut new = NewWorkItem::new(work_type).input(parse_input(input)?);
            if let Some(priority) = priority {
                new = new.priority(priority);
            }
            if let Some(retries) = retries {
                new = new.retries(retries);
            }
            if let Some(timeout_ms) = timeout_ms {
                new = new.timeout_ms(timeout_ms);
            }
            if let Some(delay_ms) = delay_ms {
                let delay = chrono::Duration::milliseconds(i64::try_from(delay_ms)?);
                new = new.scheduled(queue.now() + delay);
            }
            let item = queue.add_work(new).await?;
            println!("Created: {} (scheduled: {})", item.id, item.scheduled);
        }
        WorkAction::List {
            status,
            work_type,
            limit,
            offset,
        } => {
            let statuses = status
                .iter()
                .map(|s| s.parse::<WorkStatus>())
                .collect::<Result<Vec<_>, _>>()?;
            let filter = WorkFilter::default().statuses(statuses).types(work_type);
            let items = queue
                .work_queue(&filter, Pagination::new(limit, offset))
                .await?;
            print_table(queue, &items);
        }
        WorkAction::Show { id } => {
            let id = resolve_id(queue, &id).await?;
            let item = queue
                .work(id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("no work item {id}"))?;
            print_item(queue, &item)?;
        }
        WorkAction::Remove { id } => {
            let id = resolve_id(queue, &id).await?;
            let item = queue.remove_work(id).await?;
            println!("Removed: {}", item.id);
        }
        WorkAction::Retry { id } => {
            let id = resolve_id(queue, &id).await?;
            let item = queue.retry_work(id).await?;
            println!("Retrying as: {} (retries left: {})", item.id, item.retries);
        }
        WorkAction::Chain { id } => {
            let id = resolve_id(queue, &id).await?;
            let chain = queue.retry_chain(id).await?;
            print_table(queue, &chain);
        }
        WorkAction::Types => {
            for work_type in queue.queued_work_types().await? {
                let registered = if queue.registry().contains(&work_type) {
                    ""
                } else {
                    "  (no local handler)"
                };
                println!("{work_type}{registered}");
            }
        }
    }
    Ok(())
}

/// Accept a full UUID or a unique prefix of one.
async fn resolve_id(queue: &WorkQueue, raw: &str) -> anyhow::Result<WorkId> {
    if let Ok(id) = raw.parse::<WorkId>() {
        return Ok(id);
    }
    let filter = WorkFilter::default().statuses(WorkStatus::ALL);
    let items = queue.work_queue(&filter, Pagination::new(1000, 0)).await?;
    let matches: Vec<_> = items
        .iter()
        .filter(|item| item.id.to_string().starts_with(raw))
        .collect();
    match matches.as_slice() {
        [] => anyhow::bail!("no work item matching prefix '{raw}'"),
        [one] => Ok(one.id),
        many => anyhow::bail!("{} work items match prefix '{raw}', be more specific", many.len()),
    }
}

fn print_table(queue: &WorkQueue, items: &[WorkItem]) {
    if items.is_empty() {
        println!("No work items found.");
        return;
    }
    let now = queue.now();
    println!(
        "{:<8}  {:<16}  {:<9}  {:<4}  {:<7}  {:<16}  CREATED",
        "ID", "TYPE", "STATUS", "PRI", "RETRIES", "WORKER"
    );
    println!("{}", "-".repeat(90));
    for item in items {
        println!(
            "{:<8}  {:<16}  {:<9}  {:<4}  {:<7}  {:<16}  {}",
            item.id.short(),
            item.work_type,
            item.status(now),
            item.priority,
            item.retries,
            item.worker.as_deref().unwrap_or("-"),
            item.created.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!("\n{} item(s)", items.len());
}

fn print_item(queue: &WorkQueue, item: &WorkItem) -> anyhow::Result<()> {
    let opt = |t: Option<chrono::DateTime<chrono::Utc>>| t.map_or("-".to_string(), |t| t.to_string());

    println!("ID:         {}", item.id);
    println!("Type:       {}", item.work_type);
    println!("Status:     {}", item.status(queue.now()));
    println!("Priority:   {}", item.priority);
    println!("Retries:    {}", item.retries);
    println!("Timeout:    {}ms", item.timeout_ms);
    println!("Input:      {}", serde_json::to_string_pretty(&item.input)?);
    println!("Scheduled:  {}", item.scheduled);
    println!("Created:    {}", item.created);
    println!("Updated:    {}", opt(item.updated));
    println!("Started:    {}", opt(item.started));
    println!("Stopped:    {}", opt(item.stopped));
    println!("Worker:     {}", item.worker.as_deref().unwrap_or("-"));
    if let Some(deleted) = item.deleted {
        println!("Deleted:    {deleted}");
    }
    if let Some(original) = item.original {
        println!("Original:   {original}");
    }
    if let Some(ref result) = item.result {
        println!("Result:     {}", serde_json::to_string_pretty(result)?);
    }
    if let Some(ref error) = item.error {
        println!("Error:      {}", serde_json::to_string_pretty(error)?);
    }
    Ok(())
}
