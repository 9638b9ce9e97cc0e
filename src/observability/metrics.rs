//! Metrics for reconciliation runs
//!
//! Every metric the crate records is named by [`MetricName`]; the phase
//! modules below are the only places that call into the `metrics` macros.
//! Without an installed recorder the calls are no-ops.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::fmt;
use std::sync::OnceLock;
use tracing::info;

/// Enum representing all metric names used in the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    // Deduplication metrics
    DedupEntitiesIn,
    DedupEntitiesOut,
    DedupMergedAway,
    DedupMintedIds,
    DedupAttributeConflicts,
    DedupSourceIdCollisions,
    DedupDuration,

    // Registry metrics
    RegistryBuildsSuccess,
    RegistryBuildsError,
    RegistryEntities,
    RegistryKeysIndexed,
    RegistryTiesBroken,
    RegistryContestedKeys,
    RegistryBuildDuration,

    // Resolution metrics
    ResolveBatchesProcessed,
    ResolveBatchSize,
    ResolveRelationshipsResolved,
    ResolveReferencesUnresolved,
    ResolveAliasHits,
    ResolveBatchDuration,

    // Run metrics
    RunStarted,
    RunCompleted,
    RunCancelled,
    RunFailed,
    RunDuration,
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::DedupEntitiesIn => "biokg_dedup_entities_in_total",
            MetricName::DedupEntitiesOut => "biokg_dedup_entities_out_total",
            MetricName::DedupMergedAway => "biokg_dedup_merged_away_total",
            MetricName::DedupMintedIds => "biokg_dedup_minted_ids_total",
            MetricName::DedupAttributeConflicts => "biokg_dedup_attribute_conflicts_total",
            MetricName::DedupSourceIdCollisions => "biokg_dedup_source_id_collisions_total",
            MetricName::DedupDuration => "biokg_dedup_duration_seconds",

            MetricName::RegistryBuildsSuccess => "biokg_registry_builds_success_total",
            MetricName::RegistryBuildsError => "biokg_registry_builds_error_total",
            MetricName::RegistryEntities => "biokg_registry_current_entities",
            MetricName::RegistryKeysIndexed => "biokg_registry_current_keys_indexed",
            MetricName::RegistryTiesBroken => "biokg_registry_current_ties_broken",
            MetricName::RegistryContestedKeys => "biokg_registry_current_contested_keys",
            MetricName::RegistryBuildDuration => "biokg_registry_build_duration_seconds",

            MetricName::ResolveBatchesProcessed => "biokg_resolve_batches_processed_total",
            MetricName::ResolveBatchSize => "biokg_resolve_batch_size",
            MetricName::ResolveRelationshipsResolved => "biokg_resolve_relationships_resolved_total",
            MetricName::ResolveReferencesUnresolved => "biokg_resolve_references_unresolved_total",
            MetricName::ResolveAliasHits => "biokg_resolve_alias_hits_total",
            MetricName::ResolveBatchDuration => "biokg_resolve_batch_duration_seconds",

            MetricName::RunStarted => "biokg_run_started_total",
            MetricName::RunCompleted => "biokg_run_completed_total",
            MetricName::RunCancelled => "biokg_run_cancelled_total",
            MetricName::RunFailed => "biokg_run_failed_total",
            MetricName::RunDuration => "biokg_run_duration_seconds",
        }
    }

    pub fn all_metrics() -> impl Iterator<Item = MetricName> {
        use MetricName::*;
        [
            DedupEntitiesIn,
            DedupEntitiesOut,
            DedupMergedAway,
            DedupMintedIds,
            DedupAttributeConflicts,
            DedupSourceIdCollisions,
            DedupDuration,
            RegistryBuildsSuccess,
            RegistryBuildsError,
            RegistryEntities,
            RegistryKeysIndexed,
            RegistryTiesBroken,
            RegistryContestedKeys,
            RegistryBuildDuration,
            ResolveBatchesProcessed,
            ResolveBatchSize,
            ResolveRelationshipsResolved,
            ResolveReferencesUnresolved,
            ResolveAliasHits,
            ResolveBatchDuration,
            RunStarted,
            RunCompleted,
            RunCancelled,
            RunFailed,
            RunDuration,
        ]
        .into_iter()
    }

    /// Returns (phase, description, unit)
    pub fn metadata(&self) -> (&'static str, &'static str, Option<&'static str>) {
        match self {
            MetricName::DedupEntitiesIn => ("dedup", "Entities handed to deduplication", None),
            MetricName::DedupEntitiesOut => ("dedup", "Entities surviving deduplication", None),
            MetricName::DedupMergedAway => ("dedup", "Entities folded into another entity", None),
            MetricName::DedupMintedIds => ("dedup", "Canonical ids minted for blank entities", None),
            MetricName::DedupAttributeConflicts => ("dedup", "Attribute disagreements settled during merge", None),
            MetricName::DedupSourceIdCollisions => ("dedup", "Source ids discarded on merge", None),
            MetricName::DedupDuration => ("dedup", "Deduplication duration", Some("s")),

            MetricName::RegistryBuildsSuccess => ("registry", "Successful registry builds", None),
            MetricName::RegistryBuildsError => ("registry", "Registry builds aborted by an integrity fault", None),
            MetricName::RegistryEntities => ("registry", "Entities in the registry in force", None),
            MetricName::RegistryKeysIndexed => ("registry", "Normalized keys in the registry in force", None),
            MetricName::RegistryTiesBroken => ("registry", "Keys settled by canonical id order", None),
            MetricName::RegistryContestedKeys => ("registry", "Keys reported as ambiguous", None),
            MetricName::RegistryBuildDuration => ("registry", "Registry build duration", Some("s")),

            MetricName::ResolveBatchesProcessed => ("resolve", "Relationship batches resolved", None),
            MetricName::ResolveBatchSize => ("resolve", "Relationships per batch", None),
            MetricName::ResolveRelationshipsResolved => ("resolve", "Relationships resolved, by match stage", None),
            MetricName::ResolveReferencesUnresolved => ("resolve", "Endpoints left unresolved, by reason", None),
            MetricName::ResolveAliasHits => ("resolve", "Endpoints resolved through an alias", None),
            MetricName::ResolveBatchDuration => ("resolve", "Batch resolution duration", Some("s")),

            MetricName::RunStarted => ("run", "Reconciliation runs started", None),
            MetricName::RunCompleted => ("run", "Reconciliation runs completed", None),
            MetricName::RunCancelled => ("run", "Reconciliation runs cancelled", None),
            MetricName::RunFailed => ("run", "Reconciliation runs failed", None),
            MetricName::RunDuration => ("run", "Reconciliation run duration", Some("s")),
        }
    }
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Safe to call more than once; later calls
/// return the handle installed by the first.
pub fn init() -> Result<PrometheusHandle, Box<dyn std::error::Error + Send + Sync>> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus recorder: {}", e))?;
    let handle = METRICS_HANDLE.get_or_init(|| handle).clone();
    info!("Metrics system initialized");
    Ok(handle)
}

/// Prometheus text rendering of everything recorded so far, if a recorder
/// was installed through [`init`].
pub fn render() -> Option<String> {
    METRICS_HANDLE.get().map(|handle| handle.render())
}

// ============================================================================
// Phase recorders
// ============================================================================

pub mod dedup {
    use super::MetricName;
    use crate::pipeline::processing::conflation::MergeReport;

    pub fn completed(report: &MergeReport, secs: f64) {
        ::metrics::counter!(MetricName::DedupEntitiesIn.as_str()).increment(report.input_entities as u64);
        ::metrics::counter!(MetricName::DedupEntitiesOut.as_str()).increment(report.output_entities as u64);
        ::metrics::counter!(MetricName::DedupMergedAway.as_str()).increment(report.merged_away() as u64);
        ::metrics::counter!(MetricName::DedupMintedIds.as_str()).increment(report.minted_ids as u64);
        ::metrics::counter!(MetricName::DedupAttributeConflicts.as_str())
            .increment(report.attribute_conflicts.len() as u64);
        ::metrics::counter!(MetricName::DedupSourceIdCollisions.as_str())
            .increment(report.source_id_collisions.len() as u64);
        ::metrics::histogram!(MetricName::DedupDuration.as_str()).record(secs);
    }
}

pub mod registry {
    use super::MetricName;
    use crate::pipeline::processing::registry::RegistryStats;

    pub fn build_completed(stats: &RegistryStats, secs: f64) {
        ::metrics::counter!(MetricName::RegistryBuildsSuccess.as_str()).increment(1);
        ::metrics::gauge!(MetricName::RegistryEntities.as_str()).set(stats.entities as f64);
        ::metrics::gauge!(MetricName::RegistryKeysIndexed.as_str()).set(stats.keys_indexed as f64);
        ::metrics::gauge!(MetricName::RegistryTiesBroken.as_str()).set(stats.ties_broken as f64);
        ::metrics::gauge!(MetricName::RegistryContestedKeys.as_str()).set(stats.contested_keys as f64);
        ::metrics::histogram!(MetricName::RegistryBuildDuration.as_str()).record(secs);
    }

    pub fn build_failed() {
        ::metrics::counter!(MetricName::RegistryBuildsError.as_str()).increment(1);
    }
}

pub mod resolve {
    use super::MetricName;
    use crate::pipeline::processing::resolve::ResolutionOutcome;

    pub fn batch_completed(outcome: &ResolutionOutcome, secs: f64) {
        ::metrics::counter!(MetricName::ResolveBatchesProcessed.as_str()).increment(1);
        ::metrics::histogram!(MetricName::ResolveBatchSize.as_str())
            .record(outcome.relationships_accounted() as f64);
        for resolved in &outcome.resolved {
            ::metrics::counter!(
                MetricName::ResolveRelationshipsResolved.as_str(),
                "stage" => resolved.match_stage.as_str()
            )
            .increment(1);
        }
        for unresolved in &outcome.unresolved {
            ::metrics::counter!(
                MetricName::ResolveReferencesUnresolved.as_str(),
                "reason" => unresolved.reason.as_str()
            )
            .increment(1);
        }
        ::metrics::counter!(MetricName::ResolveAliasHits.as_str()).increment(outcome.alias_hits as u64);
        ::metrics::histogram!(MetricName::ResolveBatchDuration.as_str()).record(secs);
    }
}

pub mod run {
    use super::MetricName;

    pub fn started() {
        ::metrics::counter!(MetricName::RunStarted.as_str()).increment(1);
    }

    pub fn completed(secs: f64) {
        ::metrics::counter!(MetricName::RunCompleted.as_str()).increment(1);
        ::metrics::histogram!(MetricName::RunDuration.as_str()).record(secs);
    }

    pub fn cancelled() {
        ::metrics::counter!(MetricName::RunCancelled.as_str()).increment(1);
    }

    pub fn failed(kind: &str) {
        ::metrics::counter!(MetricName::RunFailed.as_str(), "kind" => kind.to_string()).increment(1);
    }
}
