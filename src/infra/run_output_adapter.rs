use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::app::ports::{ReconciliationOutputPort, RunArtifacts};
use crate::app::stats::ReconciliationStats;

pub const ENTITIES_FILE: &str = "entities.ndjson";
pub const RESOLVED_FILE: &str = "resolved.ndjson";
pub const UNRESOLVED_FILE: &str = "unresolved.ndjson";
pub const STATS_FILE: &str = "stats.json";
pub const MANIFEST_FILE: &str = "manifest.json";
const LATEST_FILE: &str = "LATEST";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDigest {
    pub sha256: String,
    pub bytes: u64,
    /// Line count for NDJSON artifacts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records: Option<u64>,
}

/// Describes one run directory. The only artifact that changes between runs
/// over unchanged input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub input_digest: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub artifacts: BTreeMap<String, ArtifactDigest>,
}

/// Writes each run to a fresh `{output_dir}/runs/{timestamp}-{digest12}/`
/// directory of sorted NDJSON files plus stats and a manifest.
pub struct RunOutputAdapter {
    pub output_dir: PathBuf,
}

impl RunOutputAdapter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.output_dir.join("runs")
    }

    fn run_id(started_at: &DateTime<Utc>, input_digest: &str) -> String {
        let short = &input_digest[..input_digest.len().min(12)];
        format!("{}-{}", started_at.format("%Y%m%dT%H%M%S%3fZ"), short)
    }

    /// Create a directory no earlier run used.
    async fn allocate_run_dir(&self, run_id: &str) -> Result<(String, PathBuf)> {
        let runs_dir = self.runs_dir();
        tokio::fs::create_dir_all(&runs_dir)
            .await
            .with_context(|| format!("Failed to create runs directory {}", runs_dir.display()))?;

        let mut attempt = 0;
        loop {
            let candidate_id = if attempt == 0 {
                run_id.to_string()
            } else {
                format!("{}-{}", run_id, attempt)
            };
            let candidate = runs_dir.join(&candidate_id);
            match tokio::fs::create_dir(&candidate).await {
                Ok(()) => return Ok((candidate_id, candidate)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to create run directory {}", candidate.display()))
                }
            }
        }
    }

    /// Most recent run directory recorded under `output_dir`, if any.
    pub async fn latest_run_dir(&self) -> Result<Option<PathBuf>> {
        let pointer = self.runs_dir().join(LATEST_FILE);
        match tokio::fs::read_to_string(&pointer).await {
            Ok(run_id) => Ok(Some(self.runs_dir().join(run_id.trim()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", pointer.display())),
        }
    }
}

/// Serialize records one per line, sorted, so output does not depend on the
/// order work finished in.
fn sorted_lines<T: Serialize>(records: &[T]) -> Result<(String, u64)> {
    let mut lines = records
        .iter()
        .map(serde_json::to_string)
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to serialize run record")?;
    lines.sort();
    let count = lines.len() as u64;
    let mut content = String::new();
    for line in lines {
        content.push_str(&line);
        content.push('\n');
    }
    Ok((content, count))
}

async fn write_artifact(dir: &Path, name: &str, content: &str, records: Option<u64>) -> Result<ArtifactDigest> {
    let path = dir.join(name);
    tokio::fs::write(&path, content.as_bytes())
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    debug!("Wrote {} ({} bytes)", path.display(), content.len());
    Ok(ArtifactDigest {
        sha256: hex::encode(Sha256::digest(content.as_bytes())),
        bytes: content.len() as u64,
        records,
    })
}

pub async fn read_stats(run_dir: &Path) -> Result<ReconciliationStats> {
    let path = run_dir.join(STATS_FILE);
    let content = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

pub async fn read_manifest(run_dir: &Path) -> Result<RunManifest> {
    let path = run_dir.join(MANIFEST_FILE);
    let content = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

#[async_trait]
impl ReconciliationOutputPort for RunOutputAdapter {
    async fn write_run(&self, artifacts: RunArtifacts<'_>) -> Result<PathBuf> {
        let (run_id, run_dir) = self
            .allocate_run_dir(&Self::run_id(&artifacts.started_at, artifacts.input_digest))
            .await?;

        let mut digests = BTreeMap::new();
        let (entities, count) = sorted_lines(artifacts.entities)?;
        digests.insert(
            ENTITIES_FILE.to_string(),
            write_artifact(&run_dir, ENTITIES_FILE, &entities, Some(count)).await?,
        );
        let (resolved, count) = sorted_lines(artifacts.resolved)?;
        digests.insert(
            RESOLVED_FILE.to_string(),
            write_artifact(&run_dir, RESOLVED_FILE, &resolved, Some(count)).await?,
        );
        let (unresolved, count) = sorted_lines(artifacts.unresolved)?;
        digests.insert(
            UNRESOLVED_FILE.to_string(),
            write_artifact(&run_dir, UNRESOLVED_FILE, &unresolved, Some(count)).await?,
        );
        let mut stats = serde_json::to_string_pretty(artifacts.stats).context("Failed to serialize stats")?;
        stats.push('\n');
        digests.insert(
            STATS_FILE.to_string(),
            write_artifact(&run_dir, STATS_FILE, &stats, None).await?,
        );

        let manifest = RunManifest {
            run_id: run_id.clone(),
            input_digest: artifacts.input_digest.to_string(),
            started_at: artifacts.started_at,
            finished_at: artifacts.finished_at,
            artifacts: digests,
        };
        let mut manifest_json = serde_json::to_string_pretty(&manifest).context("Failed to serialize manifest")?;
        manifest_json.push('\n');
        write_artifact(&run_dir, MANIFEST_FILE, &manifest_json, None).await?;

        // Written last so the pointer never names an incomplete run
        let pointer = self.runs_dir().join(LATEST_FILE);
        tokio::fs::write(&pointer, format!("{}\n", run_id))
            .await
            .with_context(|| format!("Failed to write {}", pointer.display()))?;

        info!(run_id = %run_id, "Run output written to {}", run_dir.display());
        Ok(run_dir)
    }
}
