// Portfolio Orchestrator - CLI
//
//   run       execute one or more cycles over a registry file
//   status    latest persisted snapshot
//   records   run records of a persisted cycle
//   validate  load and check a registry file without running anything

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use portfolio_orchestrator::{
    AggregateSnapshot, EntityRegistry, MemoryStore, MetricFeed, Orchestrator,
    OrchestratorConfig, OrchestratorError, OperationRouter, RunRecord, RunStatus, SnapshotStore,
    SqliteStore,
};

#[derive(Parser, Debug)]
#[command(name = "portfolio-orchestrator")]
#[command(about = "Runs operations across a portfolio of entities and publishes aggregate metrics")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run cycles over a registry
    Run {
        /// Registry file (.csv or .json)
        #[arg(long)]
        registry: PathBuf,

        /// TOML configuration
        #[arg(long)]
        config: Option<PathBuf>,

        /// SQLite database for snapshots and run records
        #[arg(long)]
        db: Option<PathBuf>,

        /// JSON metric feed read by the built-in operations
        #[arg(long)]
        feed: Option<PathBuf>,

        /// Number of cycles to run
        #[arg(long, default_value_t = 1)]
        cycles: usize,

        /// Keep running cycles every `cycle_interval_seconds` until Ctrl+C
        #[arg(long)]
        watch: bool,
    },

    /// Show the latest persisted snapshot
    Status {
        #[arg(long)]
        db: PathBuf,
    },

    /// Show run records of one cycle
    Records {
        #[arg(long)]
        db: PathBuf,

        #[arg(long)]
        cycle: u64,
    },

    /// Check a registry file
    Validate {
        #[arg(long)]
        registry: PathBuf,

        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            registry,
            config,
            db,
            feed,
            cycles,
            watch,
        } => run(&registry, config.as_deref(), db.as_deref(), feed.as_deref(), cycles, watch).await,
        Command::Status { db } => status(&db),
        Command::Records { db, cycle } => records(&db, cycle),
        Command::Validate { registry, config } => validate(&registry, config.as_deref()),
    }
}

fn load_config(path: Option<&Path>) -> Result<OrchestratorConfig> {
    match path {
        Some(path) => OrchestratorConfig::from_path(path),
        None => Ok(OrchestratorConfig::default()),
    }
}

fn build_registry(path: &Path, config: &OrchestratorConfig) -> Result<EntityRegistry> {
    EntityRegistry::from_path(path, &config.accounts)
        .with_context(|| format!("Invalid registry {}", path.display()))
}

async fn run(
    registry_path: &Path,
    config_path: Option<&Path>,
    db_path: Option<&Path>,
    feed_path: Option<&Path>,
    cycles: usize,
    watch: bool,
) -> Result<()> {
    println!("🎛️  Portfolio Orchestrator v{}", portfolio_orchestrator::VERSION);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let config = load_config(config_path)?;
    let registry = Arc::new(build_registry(registry_path, &config)?);
    println!(
        "✓ Loaded {} entities across {} accounts",
        registry.len(),
        registry.accounts().len()
    );

    let feed = match feed_path {
        Some(path) => MetricFeed::from_path(path)?,
        None => MetricFeed::default(),
    };
    let router = OperationRouter::with_builtins(config.operations.clone(), Arc::new(feed));

    let store: Arc<dyn SnapshotStore> = match db_path {
        Some(path) => {
            let store = SqliteStore::open(path)?;
            println!("✓ Database opened: {:?}", path);
            Arc::new(store)
        }
        None => Arc::new(MemoryStore::new()),
    };

    let orchestrator = Orchestrator::new(registry, Arc::new(router), config)?.with_store(store)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Ctrl+C received, cancelling");
                cancel.cancel();
            }
        });
    }

    if watch {
        let limit = (cycles > 1).then_some(cycles);
        println!("\n👀 Watch mode, press Ctrl+C to stop\n");
        let published = orchestrator.run_periodically(cancel, limit).await?;
        println!("\n✓ Published {} snapshots", published);
        return Ok(());
    }

    for _ in 0..cycles {
        match orchestrator.run_cycle_with_cancel(cancel.child_token()).await {
            Ok(snapshot) => print_snapshot(&snapshot),
            Err(OrchestratorError::CycleCancelled {
                cycle_id,
                dispatched,
            }) => {
                println!(
                    "\n⚠️  Cycle {} cancelled after dispatching {} entities",
                    cycle_id, dispatched
                );
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

fn status(db_path: &Path) -> Result<()> {
    let store = SqliteStore::open(db_path)?;

    match store.latest_snapshot()? {
        Some(snapshot) => print_snapshot(&snapshot),
        None => {
            println!("❌ No completed cycle in {:?}", db_path);
            println!("   Run: portfolio-orchestrator run --registry <file> --db {:?}", db_path);
        }
    }

    Ok(())
}

fn records(db_path: &Path, cycle_id: u64) -> Result<()> {
    let store = SqliteStore::open(db_path)?;
    let records = store.load_run_records(cycle_id)?;

    if records.is_empty() {
        println!("❌ No run records for cycle {}", cycle_id);
        return Ok(());
    }

    println!("🧾 Cycle {} ({} entities)", cycle_id, records.len());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for record in &records {
        print_record(record);
    }

    for event in store.events_for_cycle(cycle_id)? {
        println!("   📝 {} by {} at {}", event.event_type, event.actor, event.timestamp);
    }

    Ok(())
}

fn validate(registry_path: &Path, config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let registry = build_registry(registry_path, &config)?;

    println!("✅ Registry valid: {}", registry_path.display());
    for account in registry.accounts() {
        let entities = registry.by_account(account);
        let value: f64 = entities.iter().map(|e| e.value).sum();
        println!("   {:<24} {:>4} entities  {:>14.2}", account, entities.len(), value);
    }
    for id in &config.excluded_entity_ids {
        if !registry.contains(id) {
            println!("   ⚠️  excluded id {} is not in the registry", id);
        }
    }

    Ok(())
}

fn print_snapshot(snapshot: &AggregateSnapshot) {
    println!("\n📊 Cycle {} at {}", snapshot.cycle_id, snapshot.generated_at);
    println!("   Total value:      {:>14.2}", snapshot.total_value);
    println!("   Potential value:  {:>14.2}", snapshot.total_potential_value);
    println!("   Completion:       {:>13.1}%", snapshot.overall_completion * 100.0);
    println!("   Automation:       {:>13.1}%", snapshot.automation_level * 100.0);
    println!(
        "   Entities: {} ({} included, {} failed, {} skipped)",
        snapshot.entity_count,
        snapshot.included_count,
        snapshot.failure_count,
        snapshot.skipped_count
    );
    for subtotal in &snapshot.account_subtotals {
        println!(
            "   └─ {:<20} {:>14.2}  ({} entities, {} failed)",
            subtotal.account, subtotal.value, subtotal.entity_count, subtotal.failure_count
        );
    }
}

fn print_record(record: &RunRecord) {
    let icon = match record.status {
        RunStatus::Succeeded => "✓",
        RunStatus::Failed => "✗",
        RunStatus::Skipped => "⏭",
        RunStatus::Pending | RunStatus::Running => "…",
    };
    match &record.error {
        Some(error) => println!(
            "{} {:<24} {:<10} attempts={} error={}",
            icon, record.entity_id, record.status.as_str(), record.attempts, error
        ),
        None => println!(
            "{} {:<24} {:<10} attempts={}",
            icon, record.entity_id, record.status.as_str(), record.attempts
        ),
    }
}
