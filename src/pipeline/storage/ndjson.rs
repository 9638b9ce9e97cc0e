use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{apply_supersession, EntityStore, SupersedeOutcome};
use crate::domain::{Entity, Supersession};
use crate::error::{IntegrityFault, Result};

const ENTITIES_FILE: &str = "entities.ndjson";
const SUPERSESSIONS_FILE: &str = "supersessions.ndjson";

/// File-backed entity store: one NDJSON file for entities and one for
/// supersession records, both sorted so unchanged sets rewrite identically.
pub struct NdjsonEntityStore {
    dir: PathBuf,
    // Serializes read-modify-write cycles such as supersede
    write_lock: Mutex<()>,
}

impl NdjsonEntityStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entities_path(&self) -> PathBuf {
        self.dir.join(ENTITIES_FILE)
    }

    fn supersessions_path(&self) -> PathBuf {
        self.dir.join(SUPERSESSIONS_FILE)
    }

    async fn write_entities(&self, entities: &[Entity]) -> Result<()> {
        let mut sorted: Vec<&Entity> = entities.iter().collect();
        sorted.sort_by(|a, b| a.canonical_id.cmp(&b.canonical_id));
        write_lines(&self.entities_path(), &sorted).await
    }

    async fn write_supersessions(&self, supersessions: &[Supersession]) -> Result<()> {
        let mut sorted: Vec<&Supersession> = supersessions.iter().collect();
        sorted.sort();
        write_lines(&self.supersessions_path(), &sorted).await
    }
}

#[async_trait]
impl EntityStore for NdjsonEntityStore {
    async fn load_entities(&self) -> Result<Vec<Entity>> {
        let mut entities: Vec<Entity> = read_lines(&self.entities_path(), "entity").await?;
        entities.sort_by(|a, b| a.canonical_id.cmp(&b.canonical_id));
        debug!("Loaded {} entities from {:?}", entities.len(), self.entities_path());
        Ok(entities)
    }

    async fn save_entities(&self, entities: &[Entity]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write_entities(entities).await?;
        info!("Saved {} entities to {:?}", entities.len(), self.entities_path());
        Ok(())
    }

    async fn load_supersessions(&self) -> Result<Vec<Supersession>> {
        read_lines(&self.supersessions_path(), "supersession").await
    }

    async fn supersede(&self, retired: &str, replacement: &str) -> Result<SupersedeOutcome> {
        let _guard = self.write_lock.lock().await;
        let mut entities = self.load_entities().await?;
        let mut supersessions = self.load_supersessions().await?;
        let outcome = apply_supersession(&mut entities, &mut supersessions, retired, replacement)?;

        // Supersessions first: a crash in between leaves the retired entity
        // live, which the registry tolerates by ignoring the alias
        self.write_supersessions(&supersessions).await?;
        self.write_entities(&entities).await?;
        info!(
            retired,
            replacement,
            aliases = outcome.record.aliases.len(),
            "Entity superseded"
        );
        Ok(outcome)
    }
}

/// Read an NDJSON file; a missing file reads as empty.
async fn read_lines<T: DeserializeOwned>(path: &Path, kind: &str) -> Result<Vec<T>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(line).map_err(|e| IntegrityFault::MalformedInput {
            kind: kind.to_string(),
            location: format!("{}:{}", path.display(), index + 1),
            detail: e.to_string(),
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Write records one per line through a temporary file and rename it into
/// place, so readers never see a half-written set.
async fn write_lines<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut buffer = String::new();
    for record in records {
        buffer.push_str(&serde_json::to_string(record)?);
        buffer.push('\n');
    }
    let staging = path.with_extension("ndjson.tmp");
    tokio::fs::write(&staging, buffer.as_bytes()).await?;
    tokio::fs::rename(&staging, path).await?;
    Ok(())
}
