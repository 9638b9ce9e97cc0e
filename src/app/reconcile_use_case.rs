use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::app::ports::{ReconciliationOutputPort, RunArtifacts};
use crate::app::stats::ReconciliationStats;
use crate::domain::{Entity, RawRelationship, Supersession};
use crate::error::{IntegrityFault, ReconcileError};
use crate::observability::metrics;
use crate::pipeline::processing::conflation::{Conflator, ContentKeyConflator, MergeReport};
use crate::pipeline::processing::registry::{Registry, RegistryConfig, SharedRegistry};
use crate::pipeline::processing::resolve::{ReferenceAliases, RelationshipResolver, ResolutionOutcome};
use crate::pipeline::storage::EntityStore;

/// Tunables for a reconciliation run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileSettings {
    /// Relationships resolved between cancellation checks
    pub batch_size: usize,
    /// Size of the data-parallel pool; 0 lets rayon decide
    pub worker_threads: usize,
    pub registry: RegistryConfig,
    /// Compute everything, persist nothing
    pub dry_run: bool,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            batch_size: 1_000,
            worker_threads: 0,
            registry: RegistryConfig::default(),
            dry_run: false,
        }
    }
}

/// Cooperative cancellation, checked between relationship batches
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// New extraction output handed to a run
#[derive(Debug, Clone, Default)]
pub struct ReconcileInput {
    pub entities: Vec<Entity>,
    pub relationships: Arc<Vec<RawRelationship>>,
}

impl ReconcileInput {
    pub fn new(entities: Vec<Entity>, relationships: Vec<RawRelationship>) -> Self {
        Self {
            entities,
            relationships: Arc::new(relationships),
        }
    }
}

/// Where a cancelled run stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Index of the first relationship batch not yet resolved
    pub next_batch: usize,
    pub batch_size: usize,
    /// Digest of the input the committed batches were resolved from
    pub input_digest: String,
}

/// State of a run stopped between batches. Holds only committed work; hand it
/// back to [`ReconciliationUseCase::resume`] with the same input to finish.
#[derive(Debug, Clone)]
pub struct PartialRun {
    pub checkpoint: Checkpoint,
    pub entities: Vec<Entity>,
    pub merge: MergeReport,
    pub resolution: ResolutionOutcome,
    pub started_at: DateTime<Utc>,
    registry: Arc<Registry>,
}

impl PartialRun {
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[derive(Debug, Clone)]
pub struct CompletedRun {
    pub input_digest: String,
    pub entities: Vec<Entity>,
    pub merge: MergeReport,
    pub resolution: ResolutionOutcome,
    pub stats: ReconciliationStats,
    /// Run directory; `None` for dry runs
    pub run_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed(CompletedRun),
    Cancelled(PartialRun),
}

/// Coordinates one reconciliation: deduplicate the accumulated entity set,
/// build and publish the registry, resolve pending relationships in batches,
/// then persist the result.
pub struct ReconciliationUseCase {
    store: Arc<dyn EntityStore>,
    output_port: Arc<dyn ReconciliationOutputPort>,
    conflator: Arc<dyn Conflator>,
    resolver: RelationshipResolver,
    registry: Arc<SharedRegistry>,
    pool: Arc<rayon::ThreadPool>,
    settings: ReconcileSettings,
}

impl ReconciliationUseCase {
    pub fn new(
        store: Arc<dyn EntityStore>,
        output_port: Arc<dyn ReconciliationOutputPort>,
        settings: ReconcileSettings,
    ) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(settings.worker_threads)
            .thread_name(|index| format!("reconcile-{}", index))
            .build()
            .context("Failed to build reconciliation thread pool")?;
        Ok(Self {
            store,
            output_port,
            conflator: Arc::new(ContentKeyConflator::new()),
            resolver: RelationshipResolver::new(),
            registry: Arc::new(SharedRegistry::default()),
            pool: Arc::new(pool),
            settings,
        })
    }

    pub fn with_conflator(mut self, conflator: Arc<dyn Conflator>) -> Self {
        self.conflator = conflator;
        self
    }

    pub fn with_aliases(mut self, aliases: Arc<dyn ReferenceAliases>) -> Self {
        self.resolver = RelationshipResolver::with_aliases(aliases);
        self
    }

    /// Handle readers can use to see the registry published by the last run.
    pub fn shared_registry(&self) -> Arc<SharedRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn settings(&self) -> &ReconcileSettings {
        &self.settings
    }

    pub async fn run(&self, input: &ReconcileInput, cancel: &CancellationFlag) -> Result<RunOutcome> {
        self.observe(self.execute(input, None, cancel)).await
    }

    /// Continue a cancelled run. The checkpoint is refused when the input or
    /// the persisted entity set changed since it was taken.
    pub async fn resume(
        &self,
        input: &ReconcileInput,
        partial: PartialRun,
        cancel: &CancellationFlag,
    ) -> Result<RunOutcome> {
        self.observe(self.execute(input, Some(partial), cancel)).await
    }

    async fn observe(&self, run: impl std::future::Future<Output = Result<RunOutcome>>) -> Result<RunOutcome> {
        let start = Instant::now();
        metrics::run::started();
        let result = run.await;
        match &result {
            Ok(RunOutcome::Completed(_)) => metrics::run::completed(start.elapsed().as_secs_f64()),
            Ok(RunOutcome::Cancelled(_)) => metrics::run::cancelled(),
            Err(e) => {
                let kind = match e.downcast_ref::<ReconcileError>() {
                    Some(ReconcileError::Integrity(_)) => "integrity",
                    Some(ReconcileError::Checkpoint(_)) => "checkpoint",
                    _ => "other",
                };
                error!("Reconciliation failed: {:#}", e);
                metrics::run::failed(kind);
            }
        }
        result
    }

    async fn execute(
        &self,
        input: &ReconcileInput,
        resume_from: Option<PartialRun>,
        cancel: &CancellationFlag,
    ) -> Result<RunOutcome> {
        let stored = self
            .store
            .load_entities()
            .await
            .context("Failed to load persisted entities")?;
        let supersessions = self
            .store
            .load_supersessions()
            .await
            .context("Failed to load supersession records")?;
        let digest = input_digest(&stored, &supersessions, input)?;

        let mut partial = match resume_from {
            Some(partial) => {
                if partial.checkpoint.input_digest != digest {
                    return Err(ReconcileError::Checkpoint(format!(
                        "checkpoint was taken for input {} but current input is {}",
                        partial.checkpoint.input_digest, digest
                    ))
                    .into());
                }
                if partial.checkpoint.batch_size != self.settings.batch_size.max(1) {
                    return Err(ReconcileError::Checkpoint(format!(
                        "checkpoint batch size {} does not match configured {}",
                        partial.checkpoint.batch_size, self.settings.batch_size
                    ))
                    .into());
                }
                info!(
                    next_batch = partial.checkpoint.next_batch,
                    resolved = partial.resolution.resolved.len(),
                    "Resuming reconciliation from checkpoint"
                );
                self.registry.swap(Arc::clone(&partial.registry));
                partial
            }
            None => self.prepare(stored, supersessions, input, digest).await?,
        };

        let relationships = &input.relationships;
        let batch_size = partial.checkpoint.batch_size;
        let total_batches = relationships.len().div_ceil(batch_size);
        info!(
            relationships = relationships.len(),
            batches = total_batches,
            batch_size,
            "Resolving relationships"
        );

        while partial.checkpoint.next_batch < total_batches {
            if cancel.is_cancelled() {
                warn!(
                    next_batch = partial.checkpoint.next_batch,
                    batches = total_batches,
                    "Reconciliation cancelled between batches"
                );
                return Ok(RunOutcome::Cancelled(partial));
            }

            let first = partial.checkpoint.next_batch * batch_size;
            let last = (first + batch_size).min(relationships.len());
            let batch_relationships = Arc::clone(relationships);
            let registry = Arc::clone(&partial.registry);
            let resolver = self.resolver.clone();
            let pool = Arc::clone(&self.pool);
            let outcome = tokio::task::spawn_blocking(move || {
                pool.install(|| resolver.resolve_batch(&batch_relationships[first..last], first as u64, &registry))
            })
            .await
            .context("Relationship resolution task failed")?;

            partial.resolution.extend(outcome);
            partial.checkpoint.next_batch += 1;
        }

        self.finish(partial).await.map(RunOutcome::Completed)
    }

    /// Deduplicate, build the registry and publish it.
    async fn prepare(
        &self,
        stored: Vec<Entity>,
        supersessions: Vec<Supersession>,
        input: &ReconcileInput,
        digest: String,
    ) -> Result<PartialRun> {
        let started_at = Utc::now();
        let accumulated = retire_superseded_ids(
            stored.into_iter().chain(input.entities.iter().cloned()).collect(),
            &supersessions,
        );
        info!(
            entities = accumulated.len(),
            supersessions = supersessions.len(),
            digest = %digest,
            "Starting reconciliation"
        );

        let conflator = Arc::clone(&self.conflator);
        let config = self.settings.registry.clone();
        let pool = Arc::clone(&self.pool);
        let (entities, merge, registry) = tokio::task::spawn_blocking(move || {
            pool.install(|| {
                let (entities, merge) = conflator.conflate(accumulated);
                let registry = Registry::build_with(&entities, &supersessions, config)?;
                Ok::<_, ReconcileError>((entities, merge, registry))
            })
        })
        .await
        .context("Deduplication task failed")??;

        let registry = Arc::new(registry);
        self.registry.swap(Arc::clone(&registry));

        Ok(PartialRun {
            checkpoint: Checkpoint {
                next_batch: 0,
                batch_size: self.settings.batch_size.max(1),
                input_digest: digest,
            },
            entities,
            merge,
            resolution: ResolutionOutcome::default(),
            started_at,
            registry,
        })
    }

    async fn finish(&self, partial: PartialRun) -> Result<CompletedRun> {
        check_endpoints(&partial.entities, &partial.resolution)?;

        let stats = ReconciliationStats::compute(&partial.merge, partial.registry.stats(), &partial.resolution);
        info!(
            entities = stats.entities_out,
            relationships = stats.totals.relationships,
            resolved = stats.totals.resolved.total(),
            unresolved = stats.totals.unresolved_relationships,
            "Resolution rate {:.1}%",
            stats.resolution_rate() * 100.0
        );

        let run_dir = if self.settings.dry_run {
            info!("Dry run: nothing persisted");
            None
        } else {
            let run_dir = self
                .output_port
                .write_run(RunArtifacts {
                    input_digest: &partial.checkpoint.input_digest,
                    started_at: partial.started_at,
                    finished_at: Utc::now(),
                    entities: &partial.entities,
                    resolved: &partial.resolution.resolved,
                    unresolved: &partial.resolution.unresolved,
                    stats: &stats,
                })
                .await
                .context("Failed to write run output")?;
            self.store
                .save_entities(&partial.entities)
                .await
                .context("Failed to persist entity set")?;
            info!("Run written to {}", run_dir.display());
            Some(run_dir)
        };

        Ok(CompletedRun {
            input_digest: partial.checkpoint.input_digest,
            entities: partial.entities,
            merge: partial.merge,
            resolution: partial.resolution,
            stats,
            run_dir,
        })
    }
}

/// Rewrite entities still carrying a retired id onto its replacement so they
/// merge with it instead of reviving the retired id.
fn retire_superseded_ids(mut entities: Vec<Entity>, supersessions: &[Supersession]) -> Vec<Entity> {
    if supersessions.is_empty() {
        return entities;
    }
    let replacements: BTreeMap<&str, &str> = supersessions
        .iter()
        .map(|s| (s.retired.as_str(), s.replacement.as_str()))
        .collect();
    for entity in &mut entities {
        if let Some(replacement) = replacements.get(entity.canonical_id.as_str()) {
            debug!(retired = %entity.canonical_id, replacement, "Entity arrived under a retired id");
            entity.canonical_id = replacement.to_string();
        }
    }
    entities
}

/// Every resolved endpoint must name an entity in the published set.
fn check_endpoints(entities: &[Entity], resolution: &ResolutionOutcome) -> std::result::Result<(), ReconcileError> {
    let known: HashSet<&str> = entities.iter().map(|e| e.canonical_id.as_str()).collect();
    for resolved in &resolution.resolved {
        for id in [&resolved.from_canonical_id, &resolved.to_canonical_id] {
            if !known.contains(id.as_str()) {
                return Err(IntegrityFault::DanglingEndpoint(id.clone()).into());
            }
        }
    }
    Ok(())
}

/// Digest of everything a run's output depends on: the persisted entity set,
/// supersession records, new entities (order-insensitive) and relationships
/// (in order, since ordinals follow it).
pub fn input_digest(
    stored: &[Entity],
    supersessions: &[Supersession],
    input: &ReconcileInput,
) -> std::result::Result<String, serde_json::Error> {
    let mut entity_lines = stored
        .iter()
        .chain(input.entities.iter())
        .map(serde_json::to_string)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    entity_lines.sort();

    let mut hasher = Sha256::new();
    hasher.update(b"entities\n");
    for line in &entity_lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    hasher.update(b"supersessions\n");
    let mut ordered: Vec<&Supersession> = supersessions.iter().collect();
    ordered.sort();
    for supersession in ordered {
        hasher.update(serde_json::to_string(supersession)?.as_bytes());
        hasher.update(b"\n");
    }
    hasher.update(b"relationships\n");
    for relationship in input.relationships.iter() {
        hasher.update(serde_json::to_string(relationship)?.as_bytes());
        hasher.update(b"\n");
    }
    Ok(hex::encode(hasher.finalize()))
}
