use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;

use crate::app::stats::ReconciliationStats;
use crate::domain::{Entity, ResolvedRelationship, UnresolvedReference};

/// Everything a completed run hands to the graph loader and to audit
#[derive(Debug, Clone, Copy)]
pub struct RunArtifacts<'a> {
    pub input_digest: &'a str,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub entities: &'a [Entity],
    pub resolved: &'a [ResolvedRelationship],
    pub unresolved: &'a [UnresolvedReference],
    pub stats: &'a ReconciliationStats,
}

#[async_trait]
pub trait ReconciliationOutputPort: Send + Sync {
    /// Persist one run's artifacts, returning where they were written.
    async fn write_run(&self, artifacts: RunArtifacts<'_>) -> anyhow::Result<PathBuf>;
}
