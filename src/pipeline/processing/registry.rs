use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::domain::{Entity, MatchStage, Supersession};
use crate::error::IntegrityFault;
use crate::observability::metrics;
use crate::pipeline::processing::normalize::{normalize, Candidate, NormalizationStage};

/// Tunables for registry construction
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Report case-fold ties as ambiguous instead of settling them by
    /// canonical id order. Adding an entity can then unresolve a reference
    /// that resolved before, so resolution is no longer monotonic.
    pub contest_fuzzy_ties: bool,
}

impl RegistryConfig {
    fn breaks_ties_at(&self, stage: NormalizationStage) -> bool {
        stage != NormalizationStage::CaseFold || !self.contest_fuzzy_ties
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub entities: usize,
    pub aliases: usize,
    pub keys_indexed: usize,
    /// Keys claimed by several entities at the same rung, settled by canonical id order
    pub ties_broken: usize,
    /// Keys claimed by several entities that lookups report as ambiguous
    pub contested_keys: usize,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    stage: NormalizationStage,
    ids: BTreeSet<String>,
}

/// Result of probing the registry with a reference's candidate ladder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupOutcome {
    Found {
        canonical_id: String,
        stage: NormalizationStage,
    },
    Ambiguous {
        stage: NormalizationStage,
        candidates: Vec<String>,
    },
    NotFound,
}

impl LookupOutcome {
    pub fn match_stage(&self) -> Option<MatchStage> {
        match self {
            LookupOutcome::Found { stage, .. } => Some(stage.match_stage()),
            _ => None,
        }
    }
}

/// Immutable index from normalized identifier keys to canonical ids.
///
/// Built from the current entity set and never mutated afterwards; when the
/// entity set changes a new registry is built and swapped in through
/// [`SharedRegistry`].
#[derive(Debug, Clone)]
pub struct Registry {
    index: HashMap<String, IndexEntry>,
    canonical_ids: BTreeSet<String>,
    config: RegistryConfig,
    stats: RegistryStats,
}

impl Registry {
    pub fn empty() -> Self {
        Self {
            index: HashMap::new(),
            canonical_ids: BTreeSet::new(),
            config: RegistryConfig::default(),
            stats: RegistryStats::default(),
        }
    }

    /// Build with default configuration and no supersession aliases.
    pub fn build(entities: &[Entity]) -> Result<Self, IntegrityFault> {
        Self::build_with(entities, &[], RegistryConfig::default())
    }

    pub fn build_with(
        entities: &[Entity],
        supersessions: &[Supersession],
        config: RegistryConfig,
    ) -> Result<Self, IntegrityFault> {
        let start = Instant::now();
        let result = Self::index_entities(entities, supersessions, config);

        match &result {
            Ok(registry) => {
                info!(
                    entities = registry.stats.entities,
                    aliases = registry.stats.aliases,
                    keys = registry.stats.keys_indexed,
                    ties_broken = registry.stats.ties_broken,
                    contested = registry.stats.contested_keys,
                    "Registry built in {:.2}ms",
                    start.elapsed().as_secs_f64() * 1000.0
                );
                metrics::registry::build_completed(&registry.stats, start.elapsed().as_secs_f64());
            }
            Err(fault) => {
                warn!("Registry build aborted: {}", fault);
                metrics::registry::build_failed();
            }
        }
        result
    }

    fn index_entities(
        entities: &[Entity],
        supersessions: &[Supersession],
        config: RegistryConfig,
    ) -> Result<Self, IntegrityFault> {
        let mut ordered: Vec<&Entity> = entities.iter().collect();
        ordered.sort_by(|a, b| a.canonical_id.cmp(&b.canonical_id));

        let mut canonical_ids = BTreeSet::new();
        for entity in &ordered {
            if !canonical_ids.insert(entity.canonical_id.clone()) {
                return Err(IntegrityFault::DuplicateCanonicalId(entity.canonical_id.clone()));
            }
        }

        let mut index: HashMap<String, IndexEntry> = HashMap::new();
        for entity in &ordered {
            for identifier in entity.identifiers() {
                for candidate in normalize(identifier) {
                    insert(&mut index, candidate, &entity.canonical_id)?;
                }
            }
        }

        let mut aliases = 0;
        let mut ordered_supersessions: Vec<&Supersession> = supersessions.iter().collect();
        ordered_supersessions.sort();
        for supersession in ordered_supersessions {
            if canonical_ids.contains(&supersession.retired) {
                warn!(
                    retired = %supersession.retired,
                    "Superseded id is still carried by a live entity; alias ignored"
                );
                continue;
            }
            if !canonical_ids.contains(&supersession.replacement) {
                warn!(
                    retired = %supersession.retired,
                    replacement = %supersession.replacement,
                    "Replacement for superseded id is not in the entity set; alias ignored"
                );
                continue;
            }
            for retired in supersession.retired_identifiers() {
                for candidate in normalize(retired) {
                    insert(&mut index, candidate, &supersession.replacement)?;
                }
            }
            aliases += 1;
        }

        let mut stats = RegistryStats {
            entities: canonical_ids.len(),
            aliases,
            keys_indexed: index.len(),
            ..RegistryStats::default()
        };
        for (key, entry) in &index {
            if entry.ids.len() > 1 {
                if config.breaks_ties_at(entry.stage) {
                    stats.ties_broken += 1;
                    debug!(key = %key, stage = %entry.stage, candidates = ?entry.ids, "Tie broken by canonical id order");
                } else {
                    stats.contested_keys += 1;
                    debug!(key = %key, stage = %entry.stage, candidates = ?entry.ids, "Key left contested");
                }
            }
        }

        Ok(Self {
            index,
            canonical_ids,
            config,
            stats,
        })
    }

    /// Resolve a raw reference string.
    pub fn lookup(&self, reference: &str) -> LookupOutcome {
        self.lookup_candidates(&normalize(reference))
    }

    /// Probe with an already-computed ladder, strongest rung first. The first
    /// probe that hits decides; its stage is the weaker of the probe rung and
    /// the rung the key was indexed under.
    pub fn lookup_candidates(&self, candidates: &[Candidate]) -> LookupOutcome {
        for probe in candidates {
            if probe.key.is_empty() {
                continue;
            }
            let Some(entry) = self.index.get(&probe.key) else {
                continue;
            };
            let stage = probe.stage.max(entry.stage);
            let unique = entry.ids.len() == 1;
            if unique || self.config.breaks_ties_at(entry.stage) {
                if let Some(canonical_id) = entry.ids.iter().next() {
                    return LookupOutcome::Found {
                        canonical_id: canonical_id.clone(),
                        stage,
                    };
                }
            }
            return LookupOutcome::Ambiguous {
                stage,
                candidates: entry.ids.iter().cloned().collect(),
            };
        }
        LookupOutcome::NotFound
    }

    pub fn contains(&self, canonical_id: &str) -> bool {
        self.canonical_ids.contains(canonical_id)
    }

    pub fn canonical_ids(&self) -> impl Iterator<Item = &str> {
        self.canonical_ids.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.canonical_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.canonical_ids.is_empty()
    }

    pub fn stats(&self) -> &RegistryStats {
        &self.stats
    }
}

fn insert(
    index: &mut HashMap<String, IndexEntry>,
    candidate: Candidate,
    canonical_id: &str,
) -> Result<(), IntegrityFault> {
    if candidate.key.is_empty() {
        return Ok(());
    }
    match index.get_mut(&candidate.key) {
        None => {
            index.insert(
                candidate.key,
                IndexEntry {
                    stage: candidate.stage,
                    ids: BTreeSet::from([canonical_id.to_string()]),
                },
            );
        }
        Some(entry) if candidate.stage < entry.stage => {
            entry.stage = candidate.stage;
            entry.ids = BTreeSet::from([canonical_id.to_string()]);
        }
        Some(entry) if candidate.stage == entry.stage => {
            if entry.ids.contains(canonical_id) {
                return Ok(());
            }
            if candidate.stage == NormalizationStage::Verbatim {
                let first = entry.ids.iter().next().cloned().unwrap_or_default();
                return Err(IntegrityFault::VerbatimCollision {
                    key: candidate.key,
                    first,
                    second: canonical_id.to_string(),
                });
            }
            entry.ids.insert(canonical_id.to_string());
        }
        Some(_) => {}
    }
    Ok(())
}

/// Read-mostly handle to the registry in force. Readers take a cheap `Arc`
/// snapshot; a rebuilt registry replaces the old one in a single swap.
#[derive(Debug)]
pub struct SharedRegistry {
    current: RwLock<Arc<Registry>>,
}

impl SharedRegistry {
    pub fn new(registry: Registry) -> Self {
        Self {
            current: RwLock::new(Arc::new(registry)),
        }
    }

    pub fn current(&self) -> Arc<Registry> {
        let guard = self.current.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    /// Publish a new registry, returning the one it replaced.
    pub fn swap(&self, registry: impl Into<Arc<Registry>>) -> Arc<Registry> {
        let mut guard = self.current.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *guard, registry.into())
    }
}

impl Default for SharedRegistry {
    fn default() -> Self {
        Self::new(Registry::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EntityType;

    fn compound(id: &str, source: &str, raw: &str) -> Entity {
        Entity::new(id, EntityType::Compound).with_source_id(source, raw)
    }

    #[test]
    fn test_verbatim_lookup_is_direct() {
        let registry = Registry::build(&[compound("Compound-1", "chembl", "CHEMBL25")]).unwrap();
        assert_eq!(
            registry.lookup("CHEMBL25"),
            LookupOutcome::Found {
                canonical_id: "Compound-1".into(),
                stage: NormalizationStage::Verbatim
            }
        );
        assert_eq!(registry.lookup("Compound-1").match_stage(), Some(MatchStage::Direct));
    }

    #[test]
    fn test_separator_variant_resolves_normalized() {
        let doc = Entity::new("RegulatoryDocument-003-28-2019", EntityType::RegulatoryDocument)
            .with_source_id("fda", "REG-03/28/2019");
        let registry = Registry::build(&[doc]).unwrap();
        let outcome = registry.lookup("REG 03-28-2019");
        assert_eq!(outcome.match_stage(), Some(MatchStage::Normalized));
    }

    #[test]
    fn test_case_variant_resolves_fuzzy() {
        let registry = Registry::build(&[compound("Compound-1", "chembl", "CHEMBL25")]).unwrap();
        assert_eq!(
            registry.lookup("chembl25"),
            LookupOutcome::Found {
                canonical_id: "Compound-1".into(),
                stage: NormalizationStage::CaseFold
            }
        );
    }

    #[test]
    fn test_unknown_reference_is_not_found() {
        let registry = Registry::build(&[compound("Compound-1", "chembl", "CHEMBL25")]).unwrap();
        assert_eq!(registry.lookup("CHEMBL26"), LookupOutcome::NotFound);
        assert_eq!(registry.lookup(""), LookupOutcome::NotFound);
    }

    #[test]
    fn test_verbatim_collision_is_integrity_fault() {
        let entities = vec![
            compound("Compound-1", "chembl", "CHEMBL25"),
            compound("Compound-2", "drugbank", "CHEMBL25"),
        ];
        let fault = Registry::build(&entities).unwrap_err();
        assert_eq!(
            fault,
            IntegrityFault::VerbatimCollision {
                key: "CHEMBL25".into(),
                first: "Compound-1".into(),
                second: "Compound-2".into(),
            }
        );
    }

    #[test]
    fn test_duplicate_canonical_id_is_integrity_fault() {
        let entities = vec![
            compound("Compound-1", "chembl", "CHEMBL25"),
            compound("Compound-1", "drugbank", "DB00945"),
        ];
        assert_eq!(
            Registry::build(&entities).unwrap_err(),
            IntegrityFault::DuplicateCanonicalId("Compound-1".into())
        );
    }

    #[test]
    fn test_normalized_tie_prefers_smaller_canonical_id() {
        let entities = vec![
            compound("Compound-b", "a", "X/1"),
            compound("Compound-a", "b", "X_1"),
        ];
        let registry = Registry::build(&entities).unwrap();
        assert_eq!(registry.stats().ties_broken, 1);
        assert_eq!(
            registry.lookup("X 1"),
            LookupOutcome::Found {
                canonical_id: "Compound-a".into(),
                stage: NormalizationStage::Separators
            }
        );
    }

    #[test]
    fn test_earlier_rung_beats_later_rung() {
        let entities = vec![
            compound("Compound-1", "a", "abc"),
            compound("Compound-2", "b", "ABC"),
        ];
        let registry = Registry::build(&entities).unwrap();
        assert_eq!(
            registry.lookup("abc"),
            LookupOutcome::Found {
                canonical_id: "Compound-1".into(),
                stage: NormalizationStage::Verbatim
            }
        );
        assert_eq!(registry.stats().ties_broken, 0);
        assert_eq!(registry.stats().contested_keys, 0);
    }

    #[test]
    fn test_case_fold_tie_prefers_smaller_canonical_id() {
        let entities = vec![
            compound("Compound-2", "b", "aBC"),
            compound("Compound-1", "a", "Abc"),
        ];
        let registry = Registry::build(&entities).unwrap();
        assert_eq!(registry.stats().ties_broken, 1);
        assert_eq!(registry.stats().contested_keys, 0);
        assert_eq!(
            registry.lookup("ABC"),
            LookupOutcome::Found {
                canonical_id: "Compound-1".into(),
                stage: NormalizationStage::CaseFold
            }
        );
    }

    #[test]
    fn test_case_fold_tie_contested_when_configured() {
        let entities = vec![
            compound("Compound-1", "a", "Abc"),
            compound("Compound-2", "b", "aBC"),
        ];
        let config = RegistryConfig { contest_fuzzy_ties: true };
        let registry = Registry::build_with(&entities, &[], config).unwrap();
        assert_eq!(registry.stats().contested_keys, 1);
        assert_eq!(
            registry.lookup("ABC"),
            LookupOutcome::Ambiguous {
                stage: NormalizationStage::CaseFold,
                candidates: vec!["Compound-1".into(), "Compound-2".into()],
            }
        );
    }

    #[test]
    fn test_added_entity_never_unresolves_a_reference() {
        let before = vec![
            Entity::new("Gene-1", EntityType::Gene).with_source_id("a", "Abc"),
            Entity::new("Gene-9", EntityType::Gene).with_source_id("a", "Z9"),
        ];
        let mut after = before.clone();
        after.push(Entity::new("Gene-2", EntityType::Gene).with_source_id("b", "aBC"));

        let before = Registry::build(&before).unwrap();
        let after = Registry::build(&after).unwrap();
        assert_eq!(before.lookup("ABC").match_stage(), Some(MatchStage::Fuzzy));
        assert_eq!(after.lookup("ABC"), before.lookup("ABC"));
    }

    #[test]
    fn test_superseded_id_resolves_to_replacement() {
        let entities = vec![compound("Compound-2", "chembl", "CHEMBL25")];
        let mut supersession = Supersession::new("Compound-1", "Compound-2");
        supersession.aliases.push("CHEMBL24".into());
        let supersessions = vec![supersession];
        let registry =
            Registry::build_with(&entities, &supersessions, RegistryConfig::default()).unwrap();
        assert_eq!(registry.stats().aliases, 1);
        assert_eq!(
            registry.lookup("Compound-1"),
            LookupOutcome::Found {
                canonical_id: "Compound-2".into(),
                stage: NormalizationStage::Verbatim
            }
        );
        assert_eq!(
            registry.lookup("CHEMBL24"),
            LookupOutcome::Found {
                canonical_id: "Compound-2".into(),
                stage: NormalizationStage::Verbatim
            }
        );
        assert!(!registry.contains("Compound-1"));
    }

    #[test]
    fn test_lookup_only_returns_ids_from_entity_set() {
        let entities = vec![
            compound("Compound-1", "chembl", "CHEMBL25"),
            compound("Compound-2", "chembl", "CHEMBL-26"),
            Entity::new("Target-1", EntityType::Target).with_content_key("uniprot_accession", "P23219"),
        ];
        let registry = Registry::build(&entities).unwrap();
        for reference in ["CHEMBL25", "chembl 26", "p23219", "Target-1", "nothing"] {
            if let LookupOutcome::Found { canonical_id, .. } = registry.lookup(reference) {
                assert!(entities.iter().any(|e| e.canonical_id == canonical_id));
            }
        }
    }

    #[test]
    fn test_shared_registry_swaps_atomically() {
        let shared = SharedRegistry::default();
        let before = shared.current();
        assert!(before.is_empty());

        let registry = Registry::build(&[compound("Compound-1", "chembl", "CHEMBL25")]).unwrap();
        let previous = shared.swap(registry);
        assert!(previous.is_empty());
        assert_eq!(shared.current().len(), 1);
        // snapshots taken earlier are unaffected
        assert!(before.is_empty());
    }
}
