use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

use biokg_reconcile::app::{CancellationFlag, ReconcileInput, ReconciliationUseCase, RunOutcome};
use biokg_reconcile::config::Config;
use biokg_reconcile::error::ReconcileError;
use biokg_reconcile::infra::run_output_adapter::read_stats;
use biokg_reconcile::infra::{RunOutputAdapter, StaticAliases};
use biokg_reconcile::logging;
use biokg_reconcile::observability::metrics;
use biokg_reconcile::pipeline::ingestion::{read_entities, read_relationships};
use biokg_reconcile::pipeline::processing::conflation::merge;
use biokg_reconcile::pipeline::processing::normalize::normalize;
use biokg_reconcile::pipeline::processing::registry::{LookupOutcome, Registry};
use biokg_reconcile::pipeline::storage::{EntityStore, NdjsonEntityStore};

#[derive(Parser)]
#[command(name = "biokg-reconcile")]
#[command(about = "Entity resolution and relationship reconciliation for biomedical knowledge graphs")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to $BIOKG_CONFIG, then config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print Prometheus metrics when the command finishes
    #[arg(long, global = true)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deduplicate entities, rebuild the registry and resolve relationships
    Reconcile {
        /// NDJSON entity batches
        #[arg(long = "entities", num_args = 1..)]
        entities: Vec<PathBuf>,
        /// NDJSON relationship batches, resolved in the order given
        #[arg(long = "relationships", num_args = 1..)]
        relationships: Vec<PathBuf>,
        /// Compute everything but persist nothing
        #[arg(long)]
        dry_run: bool,
        /// Override the configured output directory
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Show the normalization ladder for identifiers
    Normalize {
        #[arg(required = true)]
        identifiers: Vec<String>,
    },
    /// Resolve references against the persisted entity set
    Lookup {
        #[arg(required = true)]
        references: Vec<String>,
        /// Extra entity batches to include before building the registry
        #[arg(long = "entities", num_args = 1..)]
        entities: Vec<PathBuf>,
    },
    /// Print the match-rate report of a run (defaults to the latest)
    Report {
        #[arg(long)]
        run: Option<PathBuf>,
    },
    /// Retire an entity in favour of another; the retired id keeps resolving
    Supersede {
        #[arg(long)]
        retired: String,
        #[arg(long)]
        replacement: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ {}", e);
            return Ok(ExitCode::from(2));
        }
    };
    let _log_guard = logging::init_logging(&config.logging);

    if cli.print_metrics {
        if let Err(e) = metrics::init() {
            warn!("Metrics disabled: {}", e);
        }
    }

    let result = match cli.command {
        Commands::Reconcile {
            entities,
            relationships,
            dry_run,
            output_dir,
        } => run_reconcile(config, &entities, &relationships, dry_run, output_dir).await,
        Commands::Normalize { identifiers } => {
            for identifier in &identifiers {
                println!("{}", identifier);
                for candidate in normalize(identifier) {
                    println!("   {:<12} {}", candidate.stage, candidate.key);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Lookup { references, entities } => run_lookup(&config, &references, &entities)
            .await
            .map(|_| ExitCode::SUCCESS),
        Commands::Report { run } => run_report(&config, run).await.map(|_| ExitCode::SUCCESS),
        Commands::Supersede { retired, replacement } => {
            run_supersede(&config, &retired, &replacement).await.map(|_| ExitCode::SUCCESS)
        }
    };

    if cli.print_metrics {
        if let Some(rendered) = metrics::render() {
            println!("{}", rendered);
        }
    }

    // Exit codes are returned, never `process::exit`ed, so the log guard drops and flushes
    match result {
        Ok(code) => Ok(code),
        Err(e) => match e.downcast_ref::<ReconcileError>().and_then(ReconcileError::integrity_fault) {
            Some(fault) => {
                error!("Integrity fault: {}", fault);
                eprintln!("❌ Integrity fault, nothing was published: {}", fault);
                Ok(ExitCode::from(2))
            }
            None => Err(e),
        },
    }
}

async fn run_reconcile(
    mut config: Config,
    entity_paths: &[PathBuf],
    relationship_paths: &[PathBuf],
    dry_run: bool,
    output_dir: Option<PathBuf>,
) -> Result<ExitCode> {
    if let Some(dir) = output_dir {
        config.output.dir = dir;
    }
    config.reconcile.dry_run |= dry_run;

    let mut entities = Vec::new();
    for path in entity_paths {
        entities.extend(read_entities(path).await?);
    }
    let mut relationships = Vec::new();
    for path in relationship_paths {
        relationships.extend(read_relationships(path).await?);
    }
    info!(
        entities = entities.len(),
        relationships = relationships.len(),
        "Loaded extraction batches"
    );

    let store = Arc::new(NdjsonEntityStore::new(config.store_dir()));
    let output = Arc::new(RunOutputAdapter::new(&config.output.dir));
    let mut use_case = ReconciliationUseCase::new(store, output, config.settings())?;
    if let Some(path) = &config.input.aliases_path {
        use_case = use_case.with_aliases(Arc::new(StaticAliases::load(path).await?));
    }

    let cancel = CancellationFlag::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current batch");
            on_signal.cancel();
        }
    });

    println!("🔄 Reconciling {} entities and {} relationships...", entities.len(), relationships.len());
    let input = ReconcileInput::new(entities, relationships);
    match use_case.run(&input, &cancel).await? {
        RunOutcome::Completed(run) => {
            println!("{}", run.stats.render_report());
            match &run.run_dir {
                Some(dir) => println!("✅ Run written to {}", dir.display()),
                None => println!("✅ Dry run complete, nothing persisted"),
            }
        }
        RunOutcome::Cancelled(partial) => {
            println!(
                "⚠️  Cancelled before batch {} ({} relationships resolved so far); nothing persisted",
                partial.checkpoint.next_batch,
                partial.resolution.resolved.len()
            );
            return Ok(ExitCode::from(130));
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_supersede(config: &Config, retired: &str, replacement: &str) -> Result<()> {
    let store = NdjsonEntityStore::new(config.store_dir());
    let outcome = store.supersede(retired, replacement).await?;
    println!("✅ {} now resolves to {}", outcome.record.retired, outcome.record.replacement);
    for collision in &outcome.source_id_collisions {
        println!(
            "   {} id {} kept; {} stays resolvable as an alias",
            collision.source_name, collision.kept, collision.discarded
        );
    }
    for conflict in &outcome.attribute_conflicts {
        println!(
            "   {}: kept {} over {} ({:?})",
            conflict.attribute, conflict.kept, conflict.discarded, conflict.rule
        );
    }
    Ok(())
}

async fn run_lookup(config: &Config, references: &[String], entity_paths: &[PathBuf]) -> Result<()> {
    let store = NdjsonEntityStore::new(config.store_dir());
    let mut entities = store.load_entities().await?;
    for path in entity_paths {
        entities.extend(read_entities(path).await?);
    }
    let supersessions = store.load_supersessions().await?;
    let (entities, _) = merge(entities);
    let registry = Registry::build_with(&entities, &supersessions, config.settings().registry)
        .map_err(ReconcileError::from)?;

    for reference in references {
        match registry.lookup(reference) {
            LookupOutcome::Found { canonical_id, stage } => {
                println!("{} -> {} ({}, {})", reference, canonical_id, stage.match_stage(), stage)
            }
            LookupOutcome::Ambiguous { stage, candidates } => {
                println!("{} -> AMBIGUOUS at {}: {}", reference, stage, candidates.join(", "))
            }
            LookupOutcome::NotFound => println!("{} -> NO_CANDIDATE", reference),
        }
    }
    Ok(())
}

async fn run_report(config: &Config, run: Option<PathBuf>) -> Result<()> {
    let run_dir = match run {
        Some(dir) => dir,
        None => RunOutputAdapter::new(&config.output.dir)
            .latest_run_dir()
            .await?
            .with_context(|| format!("No runs recorded under {}", config.output.dir.display()))?,
    };
    let stats = read_stats(&run_dir).await?;
    println!("📊 Report for {}", run_dir.display());
    println!("{}", stats.render_report());
    Ok(())
}
