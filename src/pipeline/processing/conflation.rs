use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::{Entity, EntityType, Origin};
use crate::observability::metrics;
use crate::pipeline::processing::normalize::loosest_key;

/// Which rule settled an attribute disagreement during a merge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictRule {
    PreferNonNull,
    PreferLonger,
    FirstSeen,
}

/// Two merged records disagreed on an attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeConflict {
    pub canonical_id: String,
    pub attribute: String,
    pub kept: Value,
    pub discarded: Value,
    pub rule: ConflictRule,
}

/// Two merged records carried different raw ids for the same source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceIdCollision {
    pub canonical_id: String,
    pub source_name: String,
    pub kept: String,
    pub discarded: String,
}

/// One set of records collapsed into a single canonical entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeGroup {
    pub canonical_id: String,
    pub entity_type: EntityType,
    /// Canonical ids of every member, survivor first
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeReport {
    pub input_entities: usize,
    pub output_entities: usize,
    pub minted_ids: usize,
    pub groups: Vec<MergeGroup>,
    pub attribute_conflicts: Vec<AttributeConflict>,
    pub source_id_collisions: Vec<SourceIdCollision>,
}

impl MergeReport {
    pub fn merged_away(&self) -> usize {
        self.input_entities - self.output_entities
    }

    fn absorb(&mut self, other: MergeReport) {
        self.groups.extend(other.groups);
        self.attribute_conflicts.extend(other.attribute_conflicts);
        self.source_id_collisions.extend(other.source_id_collisions);
    }
}

/// Collapses independently extracted records of the same real-world object
pub trait Conflator: Send + Sync {
    fn conflate(&self, entities: Vec<Entity>) -> (Vec<Entity>, MergeReport);
}

/// Merges entities of the same type that share a content key (or a canonical
/// id). Entities carrying neither signal in common are left alone; names and
/// other free-text attributes are never compared.
#[derive(Debug, Clone, Default)]
pub struct ContentKeyConflator;

impl ContentKeyConflator {
    pub fn new() -> Self {
        Self
    }
}

/// Deduplicate with the default conflator.
pub fn merge(entities: Vec<Entity>) -> (Vec<Entity>, MergeReport) {
    ContentKeyConflator::new().conflate(entities)
}

impl Conflator for ContentKeyConflator {
    fn conflate(&self, entities: Vec<Entity>) -> (Vec<Entity>, MergeReport) {
        let start = Instant::now();
        let mut report = MergeReport {
            input_entities: entities.len(),
            ..MergeReport::default()
        };

        let mut partitions: BTreeMap<EntityType, Vec<Entity>> = BTreeMap::new();
        for mut entity in entities {
            if entity.canonical_id.trim().is_empty() {
                entity.canonical_id = mint_canonical_id(&entity);
                report.minted_ids += 1;
            }
            partitions.entry(entity.entity_type.clone()).or_default().push(entity);
        }

        // Types never merge with each other, so each partition is independent
        let partitions: Vec<(EntityType, Vec<Entity>)> = partitions.into_iter().collect();
        let merged: Vec<(Vec<Entity>, MergeReport)> = partitions
            .into_par_iter()
            .map(|(_, members)| conflate_partition(members))
            .collect();

        let mut output = Vec::with_capacity(report.input_entities);
        for (entities, partial) in merged {
            output.extend(entities);
            report.absorb(partial);
        }
        report.output_entities = output.len();

        info!(
            input = report.input_entities,
            output = report.output_entities,
            groups = report.groups.len(),
            attribute_conflicts = report.attribute_conflicts.len(),
            source_id_collisions = report.source_id_collisions.len(),
            minted = report.minted_ids,
            "Deduplication finished in {:.2}ms",
            start.elapsed().as_secs_f64() * 1000.0
        );
        metrics::dedup::completed(&report, start.elapsed().as_secs_f64());

        (output, report)
    }
}

/// Deterministic id for an entity an extractor left unnamed, derived from its
/// type and identity signals so reruns mint the same id.
pub fn mint_canonical_id(entity: &Entity) -> String {
    let mut name = entity.entity_type.as_str().to_string();
    for key in &entity.content_keys {
        name.push('|');
        name.push_str(&key.kind);
        name.push('=');
        name.push_str(&key.value);
    }
    for (source, raw) in &entity.source_ids {
        name.push('|');
        name.push_str(source);
        name.push(':');
        name.push_str(raw);
    }
    if entity.content_keys.is_empty() && entity.source_ids.is_empty() {
        name.push('|');
        name.push_str(&serde_json::to_string(&entity.attributes).unwrap_or_default());
    }
    let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes());
    format!("{}-{}", entity.entity_type.label(), id)
}

fn conflate_partition(mut members: Vec<Entity>) -> (Vec<Entity>, MergeReport) {
    // Stable order makes "first seen" independent of arrival order
    let mut keyed: Vec<(String, Entity)> = members
        .drain(..)
        .map(|entity| (serde_json::to_string(&entity.attributes).unwrap_or_default(), entity))
        .collect();
    keyed.sort_by(|(attrs_a, a), (attrs_b, b)| {
        a.first_source()
            .cmp(&b.first_source())
            .then_with(|| a.canonical_id.cmp(&b.canonical_id))
            .then_with(|| attrs_a.cmp(attrs_b))
    });
    let ordered: Vec<Entity> = keyed.into_iter().map(|(_, entity)| entity).collect();

    let mut sets = DisjointSets::new(ordered.len());
    let mut first_holder: HashMap<(String, String), usize> = HashMap::new();
    for (position, entity) in ordered.iter().enumerate() {
        let signals = entity
            .content_keys
            .iter()
            .map(|key| (key.kind.trim().to_lowercase(), loosest_key(&key.value)))
            .chain(std::iter::once(("#canonical_id".to_string(), entity.canonical_id.clone())));
        for signal in signals {
            match first_holder.get(&signal) {
                Some(&holder) => sets.union(holder, position),
                None => {
                    first_holder.insert(signal, position);
                }
            }
        }
    }

    let mut components: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for position in 0..ordered.len() {
        let root = sets.find(position);
        components.entry(root).or_default().push(position);
    }
    // Order components by their first member so output order is stable
    let mut groups: Vec<Vec<usize>> = components.into_values().collect();
    groups.sort_by_key(|positions| positions[0]);

    let slots: Vec<(&Entity, Vec<&Entity>)> = groups
        .iter()
        .map(|positions| {
            let rest = positions[1..].iter().map(|&p| &ordered[p]).collect();
            (&ordered[positions[0]], rest)
        })
        .collect();

    let merged: Vec<(Entity, MergeReport)> = slots
        .into_par_iter()
        .map(|(first, rest)| merge_group(first, &rest))
        .collect();

    let mut report = MergeReport::default();
    let mut output = Vec::with_capacity(merged.len());
    for (entity, partial) in merged {
        output.push(entity);
        report.absorb(partial);
    }
    output.sort_by(|a, b| a.canonical_id.cmp(&b.canonical_id));
    (output, report)
}

fn merge_group(first: &Entity, rest: &[&Entity]) -> (Entity, MergeReport) {
    let mut report = MergeReport::default();
    if rest.is_empty() {
        return (first.clone(), report);
    }
    let members: Vec<&Entity> = std::iter::once(first).chain(rest.iter().copied()).collect();

    let mut survivor = Entity::new(first.canonical_id.clone(), first.entity_type.clone());
    for member in &members {
        survivor.content_keys.extend(member.content_keys.iter().cloned());
    }
    let source_origins = settle_source_ids(&mut survivor, &members, &mut report);
    let attribute_origins = settle_attributes(&mut survivor, &members, &mut report);

    survivor.record_provenance(source_origins, attribute_origins);

    let group = MergeGroup {
        canonical_id: survivor.canonical_id.clone(),
        entity_type: survivor.entity_type.clone(),
        members: members.iter().map(|m| m.canonical_id.clone()).collect(),
    };
    debug!(
        canonical_id = %group.canonical_id,
        members = ?group.members,
        "Merged {} records",
        group.members.len()
    );
    report.groups.push(group);
    (survivor, report)
}

/// Each source keeps the raw id held by the highest-ranked record. Ranking by
/// the record a value originally came from keeps the outcome the same however
/// the members were grouped into earlier merges.
fn settle_source_ids(
    survivor: &mut Entity,
    members: &[&Entity],
    report: &mut MergeReport,
) -> BTreeMap<String, Origin> {
    let mut claims: BTreeMap<&str, Vec<(Origin, &str)>> = BTreeMap::new();
    for member in members {
        for (source_name, raw_id) in &member.source_ids {
            claims
                .entry(source_name.as_str())
                .or_default()
                .push((member.source_id_origin(source_name), raw_id.as_str()));
        }
    }

    let mut origins = BTreeMap::new();
    for (source_name, mut held) in claims {
        held.sort();
        let (origin, kept) = held[0].clone();
        let mut discarded_ids: Vec<&str> = Vec::new();
        for (_, discarded) in &held[1..] {
            if *discarded == kept || discarded_ids.contains(discarded) {
                continue;
            }
            discarded_ids.push(*discarded);
            debug!(
                canonical_id = %survivor.canonical_id,
                source = %source_name,
                kept = %kept,
                discarded = %discarded,
                "Source id collision during merge"
            );
            report.source_id_collisions.push(SourceIdCollision {
                canonical_id: survivor.canonical_id.clone(),
                source_name: source_name.to_string(),
                kept: kept.to_string(),
                discarded: discarded.to_string(),
            });
        }
        survivor.source_ids.insert(source_name.to_string(), kept.to_string());
        origins.insert(source_name.to_string(), origin);
    }
    origins
}

/// Settle every attribute over all members at once: non-null beats null, a
/// longer string beats a shorter one, then the higher-ranked record wins.
/// Non-string values count as zero length.
fn settle_attributes(
    survivor: &mut Entity,
    members: &[&Entity],
    report: &mut MergeReport,
) -> BTreeMap<String, Origin> {
    let mut claims: BTreeMap<&str, Vec<(Origin, &Value)>> = BTreeMap::new();
    for member in members {
        for (attribute, value) in &member.attributes {
            claims
                .entry(attribute.as_str())
                .or_default()
                .push((member.attribute_origin(attribute), value));
        }
    }

    let mut origins = BTreeMap::new();
    for (attribute, mut held) in claims {
        held.sort_by(|a, b| precedence(a, b));
        let (origin, kept) = held[0].clone();
        let mut discarded_values: Vec<&Value> = Vec::new();
        for (_, discarded) in &held[1..] {
            if *discarded == kept || discarded_values.contains(discarded) {
                continue;
            }
            discarded_values.push(*discarded);
            let rule = deciding_rule(kept, discarded);
            debug!(
                canonical_id = %survivor.canonical_id,
                attribute = %attribute,
                rule = ?rule,
                "Attribute conflict settled"
            );
            report.attribute_conflicts.push(AttributeConflict {
                canonical_id: survivor.canonical_id.clone(),
                attribute: attribute.to_string(),
                kept: kept.clone(),
                discarded: (*discarded).clone(),
                rule,
            });
        }
        survivor.attributes.insert(attribute.to_string(), kept.clone());
        origins.insert(attribute.to_string(), origin);
    }
    origins
}

fn text_len(value: &Value) -> usize {
    match value {
        Value::String(text) => text.chars().count(),
        _ => 0,
    }
}

/// Total order over candidate values, best first.
fn precedence(a: &(Origin, &Value), b: &(Origin, &Value)) -> Ordering {
    a.1.is_null()
        .cmp(&b.1.is_null())
        .then_with(|| text_len(b.1).cmp(&text_len(a.1)))
        .then_with(|| a.0.cmp(&b.0))
        .then_with(|| a.1.to_string().cmp(&b.1.to_string()))
}

fn deciding_rule(kept: &Value, discarded: &Value) -> ConflictRule {
    if discarded.is_null() {
        ConflictRule::PreferNonNull
    } else if text_len(kept) != text_len(discarded) {
        ConflictRule::PreferLonger
    } else {
        ConflictRule::FirstSeen
    }
}

/// Union-find over positions in a partition
struct DisjointSets {
    parent: Vec<usize>,
}

impl DisjointSets {
    fn new(size: usize) -> Self {
        Self {
            parent: (0..size).collect(),
        }
    }

    fn find(&mut self, mut node: usize) -> usize {
        while self.parent[node] != node {
            self.parent[node] = self.parent[self.parent[node]];
            node = self.parent[node];
        }
        node
    }

    /// Join two sets, keeping the smaller root so roots point at the
    /// earliest member
    fn union(&mut self, a: usize, b: usize) {
        let (root_a, root_b) = (self.find(a), self.find(b));
        if root_a != root_b {
            let (low, high) = if root_a < root_b { (root_a, root_b) } else { (root_b, root_a) };
            self.parent[high] = low;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn aspirin(id: &str, source: &str, raw: &str) -> Entity {
        Entity::new(id, EntityType::Compound)
            .with_content_key("inchikey", "BSYNRYMUTXBXSQ-UHFFFAOYSA-N")
            .with_source_id(source, raw)
    }

    #[test]
    fn test_shared_content_key_merges_and_unions_source_ids() {
        let (entities, report) = merge(vec![
            aspirin("Compound-chembl-25", "chembl", "CHEMBL25"),
            aspirin("Compound-pubchem-2244", "pubchem", "2244"),
        ]);

        assert_eq!(entities.len(), 1);
        let merged = &entities[0];
        assert_eq!(merged.source_ids.get("chembl").map(String::as_str), Some("CHEMBL25"));
        assert_eq!(merged.source_ids.get("pubchem").map(String::as_str), Some("2244"));
        // chembl sorts before pubchem, so its record is first seen
        assert_eq!(merged.canonical_id, "Compound-chembl-25");
        assert_eq!(report.groups.len(), 1);
        assert_eq!(report.merged_away(), 1);
    }

    #[test]
    fn test_entities_without_content_keys_stay_singletons() {
        let (entities, report) = merge(vec![
            Entity::new("Person-1", EntityType::Person).with_attribute("name", json!("J. Smith")),
            Entity::new("Person-2", EntityType::Person).with_attribute("name", json!("J. Smith")),
        ]);
        assert_eq!(entities.len(), 2);
        assert!(report.groups.is_empty());
    }

    #[test]
    fn test_same_key_in_different_types_does_not_merge() {
        let (entities, _) = merge(vec![
            Entity::new("Compound-1", EntityType::Compound).with_content_key("content_hash", "abc"),
            Entity::new("Document-1", EntityType::Document).with_content_key("content_hash", "abc"),
        ]);
        assert_eq!(entities.len(), 2);
    }

    #[test]
    fn test_merges_are_transitive_across_key_kinds() {
        let (entities, report) = merge(vec![
            Entity::new("Target-a", EntityType::Target)
                .with_content_key("uniprot_accession", "P23219")
                .with_source_id("chembl", "CHEMBL221"),
            Entity::new("Target-b", EntityType::Target)
                .with_content_key("uniprot_accession", "P23219")
                .with_content_key("hgnc", "PTGS1")
                .with_source_id("uniprot", "P23219"),
            Entity::new("Target-c", EntityType::Target)
                .with_content_key("hgnc", "PTGS1")
                .with_source_id("hgnc", "HGNC:9604"),
        ]);
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].source_ids.len(), 3);
        assert_eq!(entities[0].content_keys.len(), 2);
        assert_eq!(report.groups[0].members.len(), 3);
    }

    #[test]
    fn test_attribute_conflicts_follow_policy_and_are_recorded() {
        let first = aspirin("Compound-1", "chembl", "CHEMBL25")
            .with_attribute("name", json!("Aspirin"))
            .with_attribute("description", json!(null))
            .with_attribute("mass", json!(180.16))
            .with_attribute("class", json!("NSAID"));
        let second = aspirin("Compound-2", "pubchem", "2244")
            .with_attribute("name", json!("Acetylsalicylic acid"))
            .with_attribute("description", json!("Analgesic"))
            .with_attribute("mass", json!(180.2))
            .with_attribute("class", json!("nsaid"));

        let (entities, report) = merge(vec![second, first]);
        let merged = &entities[0];
        assert_eq!(merged.attributes["name"], json!("Acetylsalicylic acid"));
        assert_eq!(merged.attributes["description"], json!("Analgesic"));
        assert_eq!(merged.attributes["mass"], json!(180.16));
        assert_eq!(merged.attributes["class"], json!("NSAID"));

        let rules: BTreeMap<&str, ConflictRule> = report
            .attribute_conflicts
            .iter()
            .map(|c| (c.attribute.as_str(), c.rule))
            .collect();
        assert_eq!(rules["name"], ConflictRule::PreferLonger);
        assert_eq!(rules["description"], ConflictRule::PreferNonNull);
        assert_eq!(rules["mass"], ConflictRule::FirstSeen);
        assert_eq!(rules["class"], ConflictRule::FirstSeen);
    }

    #[test]
    fn test_source_id_collision_keeps_first_seen() {
        let (entities, report) = merge(vec![
            aspirin("Compound-1", "chembl", "CHEMBL25"),
            aspirin("Compound-2", "chembl", "CHEMBL25.1"),
        ]);
        assert_eq!(entities[0].source_ids["chembl"], "CHEMBL25");
        assert_eq!(
            report.source_id_collisions,
            vec![SourceIdCollision {
                canonical_id: "Compound-1".into(),
                source_name: "chembl".into(),
                kept: "CHEMBL25".into(),
                discarded: "CHEMBL25.1".into(),
            }]
        );
    }

    #[test]
    fn test_merge_is_independent_of_arrival_order() {
        let records = vec![
            aspirin("Compound-3", "drugbank", "DB00945").with_attribute("name", json!("ASA")),
            aspirin("Compound-1", "chembl", "CHEMBL25").with_attribute("name", json!("Aspirin")),
            aspirin("Compound-2", "pubchem", "2244").with_attribute("name", json!("Aspirin!")),
            Entity::new("Compound-9", EntityType::Compound).with_source_id("chembl", "CHEMBL1"),
        ];
        let mut reversed = records.clone();
        reversed.reverse();
        let mut rotated = records.clone();
        rotated.rotate_left(2);

        let (a, _) = merge(records);
        let (b, _) = merge(reversed);
        let (c, _) = merge(rotated);
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_merging_in_steps_matches_merging_at_once() {
        let one = aspirin("Compound-1", "chembl", "CHEMBL25").with_attribute("name", json!("Aspirin"));
        let two = aspirin("Compound-2", "pubchem", "2244").with_attribute("name", json!("Acetylsalicylic acid"));
        let three = aspirin("Compound-3", "drugbank", "DB00945").with_attribute("mass", json!(180.16));

        let (all_at_once, _) = merge(vec![one.clone(), two.clone(), three.clone()]);
        let (partial, _) = merge(vec![one, two]);
        let mut stepwise_input = partial;
        stepwise_input.push(three);
        let (stepwise, _) = merge(stepwise_input);
        assert_eq!(all_at_once, stepwise);
    }

    #[test]
    fn test_conflicting_values_settle_the_same_under_any_grouping() {
        let a = aspirin("Compound-a", "a", "1").with_attribute("x", json!(null));
        let b = aspirin("Compound-b", "c", "1").with_attribute("x", json!(1));
        let c = aspirin("Compound-c", "b", "1").with_attribute("x", json!(2));

        let (all_at_once, report) = merge(vec![a.clone(), b.clone(), c.clone()]);
        assert_eq!(all_at_once[0].attributes["x"], json!(2));
        assert_eq!(report.attribute_conflicts.len(), 2);

        let in_steps = |pair: [&Entity; 2], last: &Entity| {
            let (mut partial, _) = merge(vec![pair[0].clone(), pair[1].clone()]);
            partial.push(last.clone());
            merge(partial).0
        };
        assert_eq!(in_steps([&a, &b], &c), all_at_once);
        assert_eq!(in_steps([&b, &c], &a), all_at_once);
        assert_eq!(in_steps([&a, &c], &b), all_at_once);
    }

    #[test]
    fn test_values_taken_from_other_records_carry_their_origin() {
        let (entities, _) = merge(vec![
            aspirin("Compound-1", "chembl", "CHEMBL25").with_attribute("name", json!("Aspirin")),
            aspirin("Compound-2", "pubchem", "2244").with_attribute("name", json!("Acetylsalicylic acid")),
        ]);
        let merged = &entities[0];
        let from_pubchem = Origin {
            source: Some(("pubchem".into(), "2244".into())),
            canonical_id: "Compound-2".into(),
        };
        assert_eq!(merged.provenance.attributes.get("name"), Some(&from_pubchem));
        assert_eq!(merged.provenance.source_ids.get("pubchem"), Some(&from_pubchem));
        assert!(!merged.provenance.source_ids.contains_key("chembl"));
    }

    #[test]
    fn test_content_key_values_compare_on_loosest_rung() {
        let (entities, _) = merge(vec![
            Entity::new("Compound-1", EntityType::Compound)
                .with_content_key("InChIKey", "BSYNRYMUTXBXSQ-UHFFFAOYSA-N"),
            Entity::new("Compound-2", EntityType::Compound)
                .with_content_key("inchikey", "bsynrymutxbxsq-uhfffaoysa-n"),
        ]);
        assert_eq!(entities.len(), 1);
    }

    #[test]
    fn test_blank_canonical_ids_are_minted_deterministically() {
        let record = Entity::new("", EntityType::Pathway).with_source_id("reactome", "R-HSA-109581");
        let (first, report) = merge(vec![record.clone()]);
        let (second, _) = merge(vec![record]);
        assert_eq!(report.minted_ids, 1);
        assert!(first[0].canonical_id.starts_with("Pathway-"));
        assert_eq!(first[0].canonical_id, second[0].canonical_id);
    }

    #[test]
    fn test_reextracted_entity_with_same_canonical_id_is_folded_in() {
        let stored = aspirin("Compound-1", "chembl", "CHEMBL25");
        let reextracted = Entity::new("Compound-1", EntityType::Compound).with_source_id("chebi", "CHEBI:15365");
        let (entities, _) = merge(vec![stored, reextracted]);
        assert_eq!(entities.len(), 1);
        let sources: BTreeSet<&str> = entities[0].source_ids.keys().map(String::as_str).collect();
        assert_eq!(sources, BTreeSet::from(["chebi", "chembl"]));
    }
}
