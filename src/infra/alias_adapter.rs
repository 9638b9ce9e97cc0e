use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use crate::pipeline::processing::resolve::ReferenceAliases;

/// Alias file layout. Either a flat object applying to every source, or an
/// object keyed by source name whose values are flat objects.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AliasFile {
    PerSource(BTreeMap<String, BTreeMap<String, String>>),
    Flat(BTreeMap<String, String>),
}

/// Reference aliases loaded once from a JSON file, e.g. an extractor's
/// URL to content-hash cache. Per-source entries win over global ones.
#[derive(Debug, Clone, Default)]
pub struct StaticAliases {
    global: BTreeMap<String, String>,
    per_source: BTreeMap<String, BTreeMap<String, String>>,
}

impl StaticAliases {
    pub fn new(global: BTreeMap<String, String>) -> Self {
        Self {
            global,
            per_source: BTreeMap::new(),
        }
    }

    pub fn with_source(mut self, source_name: impl Into<String>, aliases: BTreeMap<String, String>) -> Self {
        self.per_source.insert(source_name.into(), aliases);
        self
    }

    pub fn parse(content: &str) -> Result<Self> {
        let file: AliasFile = serde_json::from_str(content).context("Alias file must be a JSON object")?;
        Ok(match file {
            AliasFile::PerSource(per_source) => Self {
                global: BTreeMap::new(),
                per_source,
            },
            AliasFile::Flat(global) => Self::new(global),
        })
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read alias file {}", path.display()))?;
        let aliases = Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))?;
        info!(
            global = aliases.global.len(),
            sources = aliases.per_source.len(),
            "Loaded reference aliases from {}",
            path.display()
        );
        Ok(aliases)
    }

    pub fn len(&self) -> usize {
        self.global.len() + self.per_source.values().map(BTreeMap::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReferenceAliases for StaticAliases {
    fn alias_for(&self, source_name: &str, raw_ref: &str) -> Option<String> {
        self.per_source
            .get(source_name)
            .and_then(|aliases| aliases.get(raw_ref))
            .or_else(|| self.global.get(raw_ref))
            .cloned()
    }
}
