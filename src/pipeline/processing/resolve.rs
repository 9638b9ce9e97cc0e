use rayon::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::domain::{
    Endpoint, RawRelationship, ResolvedRelationship, UnresolvedReason, UnresolvedReference,
};
use crate::observability::metrics;
use crate::pipeline::processing::normalize::NormalizationStage;
use crate::pipeline::processing::registry::{LookupOutcome, Registry};

/// Read-only translation of a raw reference into another identifier the
/// registry may know, e.g. an extractor's URL to content-hash cache.
/// Consulted only after the candidate ladder finds nothing.
pub trait ReferenceAliases: Send + Sync {
    fn alias_for(&self, source_name: &str, raw_ref: &str) -> Option<String>;
}

/// Resolved and unresolved output of one resolution pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolutionOutcome {
    pub resolved: Vec<ResolvedRelationship>,
    pub unresolved: Vec<UnresolvedReference>,
    /// Endpoints that resolved only through an alias
    pub alias_hits: usize,
}

impl ResolutionOutcome {
    /// Number of input relationships this outcome accounts for: every resolved
    /// record plus every distinct relationship that left unresolved endpoints.
    pub fn relationships_accounted(&self) -> usize {
        let unresolved: BTreeSet<u64> = self
            .unresolved
            .iter()
            .map(|reference| reference.relationship_ordinal)
            .collect();
        self.resolved.len() + unresolved.len()
    }

    pub fn extend(&mut self, other: ResolutionOutcome) {
        self.resolved.extend(other.resolved);
        self.unresolved.extend(other.unresolved);
        self.alias_hits += other.alias_hits;
    }
}

enum Resolution {
    Resolved(ResolvedRelationship, usize),
    Unresolved(Vec<UnresolvedReference>, usize),
}

struct EndpointMatch {
    outcome: LookupOutcome,
    via_alias: bool,
}

/// Rewrites relationship endpoints onto canonical ids using a built registry
#[derive(Clone, Default)]
pub struct RelationshipResolver {
    aliases: Option<Arc<dyn ReferenceAliases>>,
}

impl RelationshipResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_aliases(aliases: Arc<dyn ReferenceAliases>) -> Self {
        Self {
            aliases: Some(aliases),
        }
    }

    /// Resolve a complete relationship set; ordinals start at zero.
    pub fn resolve(&self, relationships: &[RawRelationship], registry: &Registry) -> ResolutionOutcome {
        self.resolve_batch(relationships, 0, registry)
    }

    /// Resolve one batch. `first_ordinal` is the position of the batch's first
    /// relationship in the full pending stream, so unresolved references can be
    /// grouped back onto their relationships across batches.
    pub fn resolve_batch(
        &self,
        relationships: &[RawRelationship],
        first_ordinal: u64,
        registry: &Registry,
    ) -> ResolutionOutcome {
        let start = Instant::now();

        let resolutions: Vec<Resolution> = relationships
            .par_iter()
            .enumerate()
            .map(|(offset, relationship)| {
                self.resolve_relationship(relationship, first_ordinal + offset as u64, registry)
            })
            .collect();

        let mut outcome = ResolutionOutcome::default();
        for resolution in resolutions {
            match resolution {
                Resolution::Resolved(resolved, alias_hits) => {
                    outcome.resolved.push(resolved);
                    outcome.alias_hits += alias_hits;
                }
                Resolution::Unresolved(references, alias_hits) => {
                    outcome.unresolved.extend(references);
                    outcome.alias_hits += alias_hits;
                }
            }
        }

        debug!(
            first_ordinal,
            relationships = relationships.len(),
            resolved = outcome.resolved.len(),
            unresolved = outcome.unresolved.len(),
            "Batch resolved in {:.2}ms",
            start.elapsed().as_secs_f64() * 1000.0
        );
        metrics::resolve::batch_completed(&outcome, start.elapsed().as_secs_f64());
        outcome
    }

    fn resolve_relationship(
        &self,
        relationship: &RawRelationship,
        ordinal: u64,
        registry: &Registry,
    ) -> Resolution {
        let from = self.resolve_endpoint(&relationship.from_ref, &relationship.source_name, registry);
        let to = self.resolve_endpoint(&relationship.to_ref, &relationship.source_name, registry);
        let alias_hits = usize::from(from.via_alias) + usize::from(to.via_alias);

        match (from.outcome, to.outcome) {
            (
                LookupOutcome::Found {
                    canonical_id: from_id,
                    stage: from_stage,
                },
                LookupOutcome::Found {
                    canonical_id: to_id,
                    stage: to_stage,
                },
            ) => Resolution::Resolved(
                ResolvedRelationship {
                    relationship: relationship.clone(),
                    from_canonical_id: from_id,
                    to_canonical_id: to_id,
                    match_stage: from_stage.match_stage().max(to_stage.match_stage()),
                },
                alias_hits,
            ),
            (from_outcome, to_outcome) => {
                let references = [
                    (Endpoint::From, &relationship.from_ref, from_outcome),
                    (Endpoint::To, &relationship.to_ref, to_outcome),
                ]
                .into_iter()
                .filter_map(|(endpoint, raw_ref, outcome)| {
                    let (reason, candidates) = match outcome {
                        LookupOutcome::Found { .. } => return None,
                        LookupOutcome::NotFound => (UnresolvedReason::NoCandidate, Vec::new()),
                        LookupOutcome::Ambiguous { candidates, .. } => {
                            (UnresolvedReason::Ambiguous, candidates)
                        }
                    };
                    Some(UnresolvedReference {
                        raw_ref: raw_ref.clone(),
                        relation_type: relationship.relation_type.clone(),
                        source_name: relationship.source_name.clone(),
                        reason,
                        endpoint,
                        relationship_ordinal: ordinal,
                        candidates,
                    })
                })
                .collect();
                Resolution::Unresolved(references, alias_hits)
            }
        }
    }

    fn resolve_endpoint(&self, raw_ref: &str, source_name: &str, registry: &Registry) -> EndpointMatch {
        let outcome = registry.lookup(raw_ref);
        if outcome != LookupOutcome::NotFound {
            return EndpointMatch {
                outcome,
                via_alias: false,
            };
        }

        let alias = self
            .aliases
            .as_ref()
            .and_then(|aliases| aliases.alias_for(source_name, raw_ref));
        let Some(alias) = alias else {
            return EndpointMatch {
                outcome,
                via_alias: false,
            };
        };

        // An alias is a translation, not the reference itself: never report
        // it as a direct match
        let outcome = match registry.lookup(&alias) {
            LookupOutcome::Found { canonical_id, stage } => LookupOutcome::Found {
                canonical_id,
                stage: stage.max(NormalizationStage::Separators),
            },
            LookupOutcome::Ambiguous { stage, candidates } => LookupOutcome::Ambiguous {
                stage: stage.max(NormalizationStage::Separators),
                candidates,
            },
            LookupOutcome::NotFound => LookupOutcome::NotFound,
        };
        let via_alias = matches!(outcome, LookupOutcome::Found { .. });
        EndpointMatch { outcome, via_alias }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Entity, EntityType, MatchStage, RelationType};
    use crate::pipeline::processing::registry::RegistryConfig;
    use std::collections::HashMap;

    struct MapAliases(HashMap<String, String>);

    impl ReferenceAliases for MapAliases {
        fn alias_for(&self, _source_name: &str, raw_ref: &str) -> Option<String> {
            self.0.get(raw_ref).cloned()
        }
    }

    fn registry() -> Registry {
        Registry::build(&[
            Entity::new("Compound-1", EntityType::Compound)
                .with_source_id("chembl", "CHEMBL25")
                .with_content_key("inchikey", "BSYNRYMUTXBXSQ-UHFFFAOYSA-N"),
            Entity::new("Target-1", EntityType::Target)
                .with_source_id("chembl", "CHEMBL221")
                .with_content_key("uniprot_accession", "P23219"),
            Entity::new("Person-o_4", EntityType::Person).with_source_id("web", "Person-o_4"),
        ])
        .unwrap()
    }

    #[test]
    fn test_both_endpoints_direct() {
        let rels = vec![RawRelationship::new("CHEMBL25", "P23219", RelationType::Inhibits, "chembl")];
        let outcome = RelationshipResolver::new().resolve(&rels, &registry());
        assert_eq!(outcome.resolved.len(), 1);
        assert!(outcome.unresolved.is_empty());
        let edge = &outcome.resolved[0];
        assert_eq!(edge.from_canonical_id, "Compound-1");
        assert_eq!(edge.to_canonical_id, "Target-1");
        assert_eq!(edge.match_stage, MatchStage::Direct);
        assert_eq!(edge.relationship, rels[0]);
    }

    #[test]
    fn test_match_stage_is_the_weaker_endpoint() {
        let rels = vec![RawRelationship::new("CHEMBL25", "p23219", RelationType::Inhibits, "chembl")];
        let outcome = RelationshipResolver::new().resolve(&rels, &registry());
        assert_eq!(outcome.resolved[0].match_stage, MatchStage::Fuzzy);
    }

    #[test]
    fn test_punctuation_variant_resolves_normalized() {
        let rels = vec![RawRelationship::new("Person-(o)_(4)", "CHEMBL25", "mentions", "web")];
        let outcome = RelationshipResolver::new().resolve(&rels, &registry());
        assert_eq!(outcome.resolved[0].from_canonical_id, "Person-o_4");
        assert_eq!(outcome.resolved[0].match_stage, MatchStage::Normalized);
    }

    #[test]
    fn test_each_failing_endpoint_is_reported_once() {
        let rels = vec![
            RawRelationship::new("CHEMBL25", "missing-target", RelationType::Inhibits, "chembl"),
            RawRelationship::new("missing-a", "missing-b", RelationType::Binds, "chembl"),
        ];
        let outcome = RelationshipResolver::new().resolve(&rels, &registry());
        assert!(outcome.resolved.is_empty());
        assert_eq!(outcome.unresolved.len(), 3);

        let first = &outcome.unresolved[0];
        assert_eq!(first.raw_ref, "missing-target");
        assert_eq!(first.endpoint, Endpoint::To);
        assert_eq!(first.reason, UnresolvedReason::NoCandidate);
        assert_eq!(first.relationship_ordinal, 0);

        assert!(outcome.unresolved[1..].iter().all(|u| u.relationship_ordinal == 1));
        assert_eq!(outcome.relationships_accounted(), rels.len());
    }

    #[test]
    fn test_ambiguous_endpoint_is_never_guessed() {
        let registry = Registry::build_with(
            &[
                Entity::new("Gene-1", EntityType::Gene).with_source_id("a", "Snca"),
                Entity::new("Gene-2", EntityType::Gene).with_source_id("b", "SNCA"),
            ],
            &[],
            RegistryConfig { contest_fuzzy_ties: true },
        )
        .unwrap();
        let rels = vec![RawRelationship::new("snca", "Gene-1", RelationType::InteractsWith, "string")];
        let outcome = RelationshipResolver::new().resolve(&rels, &registry);
        assert!(outcome.resolved.is_empty());
        assert_eq!(outcome.unresolved.len(), 1);
        assert_eq!(outcome.unresolved[0].reason, UnresolvedReason::Ambiguous);
        assert_eq!(outcome.unresolved[0].candidates, vec!["Gene-1".to_string(), "Gene-2".to_string()]);
    }

    #[test]
    fn test_batch_ordinals_continue_from_offset() {
        let rels = vec![RawRelationship::new("nope", "CHEMBL25", RelationType::Cites, "pubmed")];
        let outcome = RelationshipResolver::new().resolve_batch(&rels, 40, &registry());
        assert_eq!(outcome.unresolved[0].relationship_ordinal, 40);
    }

    #[test]
    fn test_alias_is_consulted_after_ladder_fails() {
        let aliases = MapAliases(HashMap::from([(
            "https://example.org/aspirin".to_string(),
            "BSYNRYMUTXBXSQ-UHFFFAOYSA-N".to_string(),
        )]));
        let resolver = RelationshipResolver::with_aliases(Arc::new(aliases));
        let rels = vec![RawRelationship::new(
            "https://example.org/aspirin",
            "CHEMBL221",
            RelationType::Mentions,
            "web",
        )];
        let outcome = resolver.resolve(&rels, &registry());
        assert_eq!(outcome.resolved.len(), 1);
        assert_eq!(outcome.resolved[0].from_canonical_id, "Compound-1");
        assert_eq!(outcome.resolved[0].match_stage, MatchStage::Normalized);
        assert_eq!(outcome.alias_hits, 1);
    }

    #[test]
    fn test_output_order_follows_input_order() {
        let rels: Vec<RawRelationship> = (0..200)
            .map(|i| {
                let from = if i % 2 == 0 { "CHEMBL25".to_string() } else { format!("unknown-{}", i) };
                RawRelationship::new(from, "CHEMBL221", RelationType::Binds, "chembl")
            })
            .collect();
        let outcome = RelationshipResolver::new().resolve(&rels, &registry());
        assert_eq!(outcome.resolved.len(), 100);
        let ordinals: Vec<u64> = outcome.unresolved.iter().map(|u| u.relationship_ordinal).collect();
        let mut sorted = ordinals.clone();
        sorted.sort();
        assert_eq!(ordinals, sorted);
    }
}
