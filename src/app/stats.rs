use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use crate::domain::{MatchStage, UnresolvedReason};
use crate::pipeline::processing::conflation::MergeReport;
use crate::pipeline::processing::registry::RegistryStats;
use crate::pipeline::processing::resolve::ResolutionOutcome;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    pub direct: u64,
    pub normalized: u64,
    pub fuzzy: u64,
}

impl StageCounts {
    fn record(&mut self, stage: MatchStage) {
        match stage {
            MatchStage::Direct => self.direct += 1,
            MatchStage::Normalized => self.normalized += 1,
            MatchStage::Fuzzy => self.fuzzy += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.direct + self.normalized + self.fuzzy
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasonCounts {
    pub no_candidate: u64,
    pub ambiguous: u64,
}

impl ReasonCounts {
    fn record(&mut self, reason: UnresolvedReason) {
        match reason {
            UnresolvedReason::NoCandidate => self.no_candidate += 1,
            UnresolvedReason::Ambiguous => self.ambiguous += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.no_candidate + self.ambiguous
    }
}

/// Match-rate figures for one slice of the relationship stream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolutionBreakdown {
    pub relationships: u64,
    pub resolved: StageCounts,
    pub unresolved_relationships: u64,
    /// One count per failing endpoint
    pub unresolved_references: ReasonCounts,
}

impl ResolutionBreakdown {
    /// Resolved share of relationships; 1.0 for an empty slice.
    pub fn resolution_rate(&self) -> f64 {
        if self.relationships == 0 {
            1.0
        } else {
            self.resolved.total() as f64 / self.relationships as f64
        }
    }
}

/// Everything a match-rate report needs, computed once per run and persisted
/// alongside the run's records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationStats {
    pub entities_in: u64,
    pub entities_out: u64,
    pub minted_ids: u64,
    pub merge_groups: u64,
    pub attribute_conflicts: u64,
    pub source_id_collisions: u64,
    pub registry: RegistryStats,
    pub alias_hits: u64,
    pub totals: ResolutionBreakdown,
    pub by_source: BTreeMap<String, ResolutionBreakdown>,
    pub by_relation_type: BTreeMap<String, ResolutionBreakdown>,
}

impl ReconciliationStats {
    pub fn compute(merge: &MergeReport, registry: &RegistryStats, resolution: &ResolutionOutcome) -> Self {
        let mut stats = Self {
            entities_in: merge.input_entities as u64,
            entities_out: merge.output_entities as u64,
            minted_ids: merge.minted_ids as u64,
            merge_groups: merge.groups.len() as u64,
            attribute_conflicts: merge.attribute_conflicts.len() as u64,
            source_id_collisions: merge.source_id_collisions.len() as u64,
            registry: registry.clone(),
            alias_hits: resolution.alias_hits as u64,
            ..Self::default()
        };

        for resolved in &resolution.resolved {
            let source = &resolved.relationship.source_name;
            let relation_type = resolved.relationship.relation_type.as_str();
            for breakdown in stats.slices(source, relation_type) {
                breakdown.relationships += 1;
                breakdown.resolved.record(resolved.match_stage);
            }
        }

        let mut counted: BTreeSet<u64> = BTreeSet::new();
        for reference in &resolution.unresolved {
            let first_for_relationship = counted.insert(reference.relationship_ordinal);
            for breakdown in stats.slices(&reference.source_name, reference.relation_type.as_str()) {
                if first_for_relationship {
                    breakdown.relationships += 1;
                    breakdown.unresolved_relationships += 1;
                }
                breakdown.unresolved_references.record(reference.reason);
            }
        }
        stats
    }

    fn slices(&mut self, source: &str, relation_type: &str) -> [&mut ResolutionBreakdown; 3] {
        [
            &mut self.totals,
            self.by_source.entry(source.to_string()).or_default(),
            self.by_relation_type.entry(relation_type.to_string()).or_default(),
        ]
    }

    pub fn resolution_rate(&self) -> f64 {
        self.totals.resolution_rate()
    }

    /// Plain-text match-rate report.
    pub fn render_report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Entities: {} in, {} out ({} merge groups, {} minted ids)",
            self.entities_in, self.entities_out, self.merge_groups, self.minted_ids);
        let _ = writeln!(out, "Merge conflicts: {} attribute, {} source id",
            self.attribute_conflicts, self.source_id_collisions);
        let _ = writeln!(out, "Registry: {} entities, {} aliases, {} keys, {} ties broken, {} contested",
            self.registry.entities, self.registry.aliases, self.registry.keys_indexed,
            self.registry.ties_broken, self.registry.contested_keys);
        let _ = writeln!(out);
        let _ = writeln!(out, "{:<28} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>7}",
            "slice", "total", "direct", "normal", "fuzzy", "unres", "no_cand", "ambig", "rate");
        write_row(&mut out, "ALL", &self.totals);
        for (source, breakdown) in &self.by_source {
            write_row(&mut out, &format!("source:{}", source), breakdown);
        }
        for (relation_type, breakdown) in &self.by_relation_type {
            write_row(&mut out, &format!("type:{}", relation_type), breakdown);
        }
        if self.alias_hits > 0 {
            let _ = writeln!(out);
            let _ = writeln!(out, "Endpoints resolved through aliases: {}", self.alias_hits);
        }
        out
    }
}

fn write_row(out: &mut String, label: &str, breakdown: &ResolutionBreakdown) {
    let _ = writeln!(
        out,
        "{:<28} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>6.1}%",
        label,
        breakdown.relationships,
        breakdown.resolved.direct,
        breakdown.resolved.normalized,
        breakdown.resolved.fuzzy,
        breakdown.unresolved_relationships,
        breakdown.unresolved_references.no_candidate,
        breakdown.unresolved_references.ambiguous,
        breakdown.resolution_rate() * 100.0
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Endpoint, RawRelationship, RelationType, ResolvedRelationship, UnresolvedReference};

    fn resolved(source: &str, stage: MatchStage) -> ResolvedRelationship {
        ResolvedRelationship {
            relationship: RawRelationship::new("a", "b", RelationType::Inhibits, source),
            from_canonical_id: "Compound-1".into(),
            to_canonical_id: "Target-1".into(),
            match_stage: stage,
        }
    }

    fn unresolved(ordinal: u64, endpoint: Endpoint, reason: UnresolvedReason) -> UnresolvedReference {
        UnresolvedReference {
            raw_ref: "x".into(),
            relation_type: RelationType::Cites,
            source_name: "pubmed".into(),
            reason,
            endpoint,
            relationship_ordinal: ordinal,
            candidates: Vec::new(),
        }
    }

    fn outcome() -> ResolutionOutcome {
        ResolutionOutcome {
            resolved: vec![
                resolved("chembl", MatchStage::Direct),
                resolved("chembl", MatchStage::Fuzzy),
                resolved("pubmed", MatchStage::Normalized),
            ],
            unresolved: vec![
                unresolved(3, Endpoint::From, UnresolvedReason::NoCandidate),
                unresolved(3, Endpoint::To, UnresolvedReason::Ambiguous),
                unresolved(4, Endpoint::To, UnresolvedReason::NoCandidate),
            ],
            alias_hits: 0,
        }
    }

    #[test]
    fn test_totals_count_relationships_not_endpoints() {
        let stats = ReconciliationStats::compute(&MergeReport::default(), &RegistryStats::default(), &outcome());
        assert_eq!(stats.totals.relationships, 5);
        assert_eq!(stats.totals.resolved.total(), 3);
        assert_eq!(stats.totals.unresolved_relationships, 2);
        assert_eq!(stats.totals.unresolved_references.no_candidate, 2);
        assert_eq!(stats.totals.unresolved_references.ambiguous, 1);
        assert!((stats.resolution_rate() - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_breakdown_per_source_and_relation_type() {
        let stats = ReconciliationStats::compute(&MergeReport::default(), &RegistryStats::default(), &outcome());
        let chembl = &stats.by_source["chembl"];
        assert_eq!(chembl.relationships, 2);
        assert_eq!(chembl.resolved.direct, 1);
        assert_eq!(chembl.resolved.fuzzy, 1);

        let pubmed = &stats.by_source["pubmed"];
        assert_eq!(pubmed.relationships, 3);
        assert_eq!(pubmed.unresolved_relationships, 2);

        assert_eq!(stats.by_relation_type["inhibits"].relationships, 3);
        assert_eq!(stats.by_relation_type["cites"].relationships, 2);
    }

    #[test]
    fn test_report_survives_json_round_trip() {
        let stats = ReconciliationStats::compute(&MergeReport::default(), &RegistryStats::default(), &outcome());
        let json = serde_json::to_string_pretty(&stats).unwrap();
        let back: ReconciliationStats = serde_json::from_str(&json).unwrap();
        assert_eq!(back, stats);
        let report = back.render_report();
        assert!(report.contains("source:chembl"));
        assert!(report.contains("type:cites"));
        assert!(report.contains("60.0%"));
    }

    #[test]
    fn test_empty_run_rate_is_one() {
        let stats = ReconciliationStats::default();
        assert_eq!(stats.resolution_rate(), 1.0);
    }
}
