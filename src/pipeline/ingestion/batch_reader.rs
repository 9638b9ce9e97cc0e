use jsonschema::JSONSchema;
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::Path;
use tracing::{debug, warn};

use crate::domain::{Entity, RawRelationship};
use crate::error::{IntegrityFault, Result};

const ENTITY_SCHEMA_SRC: &str = include_str!("../../../schemas/entity.v1.json");
const RELATIONSHIP_SCHEMA_SRC: &str = include_str!("../../../schemas/relationship.v1.json");

// jsonschema 0.17 borrows the schema document for the validator's lifetime;
// the embedded schemas live for the whole process
fn compile(source: &'static str) -> JSONSchema {
    let document: Value = serde_json::from_str(source).expect("embedded schema is valid JSON");
    let document: &'static Value = Box::leak(Box::new(document));
    JSONSchema::options()
        .compile(document)
        .expect("embedded schema compiles")
}

static ENTITY_SCHEMA: Lazy<JSONSchema> = Lazy::new(|| compile(ENTITY_SCHEMA_SRC));
static RELATIONSHIP_SCHEMA: Lazy<JSONSchema> = Lazy::new(|| compile(RELATIONSHIP_SCHEMA_SRC));

/// Kind of record carried by a batch file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Entity,
    Relationship,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Entity => "entity",
            RecordKind::Relationship => "relationship",
        }
    }

    fn schema(&self) -> &'static JSONSchema {
        match self {
            RecordKind::Entity => &ENTITY_SCHEMA,
            RecordKind::Relationship => &RELATIONSHIP_SCHEMA,
        }
    }
}

/// Every problem found on one line of a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// 1-based line number
    pub line: usize,
    pub messages: Vec<String>,
}

/// Reads NDJSON batches, validating each line against the record kind's
/// schema before deserializing it.
#[derive(Debug, Clone, Copy)]
pub struct BatchReader {
    kind: RecordKind,
}

impl BatchReader {
    pub fn new(kind: RecordKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    /// Read a batch file. The first malformed line aborts the read.
    pub async fn read<T: DeserializeOwned>(&self, path: &Path) -> Result<Vec<T>> {
        let content = tokio::fs::read_to_string(path).await?;
        let records = self.parse(&content, &path.display().to_string())?;
        debug!(
            kind = self.kind.as_str(),
            records = records.len(),
            "Read batch {}",
            path.display()
        );
        Ok(records)
    }

    /// Parse batch content; `location` names the batch in error reports.
    pub fn parse<T: DeserializeOwned>(&self, content: &str, location: &str) -> std::result::Result<Vec<T>, IntegrityFault> {
        let mut records = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let malformed = |detail: String| IntegrityFault::MalformedInput {
                kind: self.kind.as_str().to_string(),
                location: format!("{}:{}", location, index + 1),
                detail,
            };

            let value: Value = serde_json::from_str(line).map_err(|e| malformed(e.to_string()))?;
            let messages = self.check(&value);
            if !messages.is_empty() {
                warn!(kind = self.kind.as_str(), line = index + 1, "Rejected batch {}", location);
                return Err(malformed(messages.join("; ")));
            }
            records.push(serde_json::from_value(value).map_err(|e| malformed(e.to_string()))?);
        }
        Ok(records)
    }

    /// Collect every violation in the content instead of stopping at the first.
    pub fn violations(&self, content: &str) -> Vec<Violation> {
        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .filter_map(|(index, line)| {
                let messages = match serde_json::from_str::<Value>(line) {
                    Ok(value) => self.check(&value),
                    Err(e) => vec![format!("not valid JSON: {}", e)],
                };
                (!messages.is_empty()).then(|| Violation {
                    line: index + 1,
                    messages,
                })
            })
            .collect()
    }

    fn check(&self, value: &Value) -> Vec<String> {
        match self.kind.schema().validate(value) {
            Ok(()) => Vec::new(),
            Err(errors) => errors
                .map(|error| {
                    let path = error.instance_path.to_string();
                    if path.is_empty() {
                        error.to_string()
                    } else {
                        format!("{} at {}", error, path)
                    }
                })
                .collect(),
        }
    }
}

pub async fn read_entities(path: &Path) -> Result<Vec<Entity>> {
    BatchReader::new(RecordKind::Entity).read(path).await
}

pub async fn read_relationships(path: &Path) -> Result<Vec<RawRelationship>> {
    BatchReader::new(RecordKind::Relationship).read(path).await
}
