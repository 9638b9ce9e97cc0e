use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Attribute bag carried by entities and relationships. Ordered so that
/// serialized output is stable between runs.
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Kind of real-world object an entity describes. Source extractors may emit
/// kinds this crate does not know about; those are kept verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EntityType {
    Compound,
    Target,
    Protein,
    Gene,
    Pathway,
    Disease,
    RegulatoryDocument,
    Document,
    Person,
    Organization,
    Other(String),
}

impl EntityType {
    pub fn as_str(&self) -> &str {
        match self {
            EntityType::Compound => "compound",
            EntityType::Target => "target",
            EntityType::Protein => "protein",
            EntityType::Gene => "gene",
            EntityType::Pathway => "pathway",
            EntityType::Disease => "disease",
            EntityType::RegulatoryDocument => "regulatory_document",
            EntityType::Document => "document",
            EntityType::Person => "person",
            EntityType::Organization => "organization",
            EntityType::Other(name) => name.as_str(),
        }
    }

    /// Label used as the prefix of minted canonical ids, e.g. `RegulatoryDocument`.
    pub fn label(&self) -> String {
        self.as_str()
            .split(|c: char| c == '_' || c == '-' || c.is_whitespace())
            .filter(|part| !part.is_empty())
            .map(|part| {
                let mut chars = part.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                    None => String::new(),
                }
            })
            .collect()
    }
}

impl From<String> for EntityType {
    fn from(value: String) -> Self {
        let folded: String = value
            .trim()
            .chars()
            .filter(|c| *c != '_' && *c != '-' && !c.is_whitespace())
            .collect::<String>()
            .to_ascii_lowercase();
        match folded.as_str() {
            "compound" => EntityType::Compound,
            "target" => EntityType::Target,
            "protein" => EntityType::Protein,
            "gene" => EntityType::Gene,
            "pathway" => EntityType::Pathway,
            "disease" => EntityType::Disease,
            "regulatorydocument" => EntityType::RegulatoryDocument,
            "document" => EntityType::Document,
            "person" => EntityType::Person,
            "organization" => EntityType::Organization,
            _ => EntityType::Other(value),
        }
    }
}

impl From<&str> for EntityType {
    fn from(value: &str) -> Self {
        EntityType::from(value.to_string())
    }
}

impl From<EntityType> for String {
    fn from(value: EntityType) -> Self {
        match value {
            EntityType::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relationship kinds emitted by extractors. Unknown kinds survive as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RelationType {
    Targets,
    Inhibits,
    Activates,
    Binds,
    Treats,
    ParticipatesIn,
    Regulates,
    InteractsWith,
    Cites,
    Mentions,
    AuthoredBy,
    ApprovedBy,
    Other(String),
}

impl RelationType {
    pub fn as_str(&self) -> &str {
        match self {
            RelationType::Targets => "targets",
            RelationType::Inhibits => "inhibits",
            RelationType::Activates => "activates",
            RelationType::Binds => "binds",
            RelationType::Treats => "treats",
            RelationType::ParticipatesIn => "participates_in",
            RelationType::Regulates => "regulates",
            RelationType::InteractsWith => "interacts_with",
            RelationType::Cites => "cites",
            RelationType::Mentions => "mentions",
            RelationType::AuthoredBy => "authored_by",
            RelationType::ApprovedBy => "approved_by",
            RelationType::Other(name) => name.as_str(),
        }
    }
}

impl From<String> for RelationType {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "targets" => RelationType::Targets,
            "inhibits" => RelationType::Inhibits,
            "activates" => RelationType::Activates,
            "binds" => RelationType::Binds,
            "treats" => RelationType::Treats,
            "participates_in" => RelationType::ParticipatesIn,
            "regulates" => RelationType::Regulates,
            "interacts_with" => RelationType::InteractsWith,
            "cites" => RelationType::Cites,
            "mentions" => RelationType::Mentions,
            "authored_by" => RelationType::AuthoredBy,
            "approved_by" => RelationType::ApprovedBy,
            _ => RelationType::Other(value),
        }
    }
}

impl From<&str> for RelationType {
    fn from(value: &str) -> Self {
        RelationType::from(value.to_string())
    }
}

impl From<RelationType> for String {
    fn from(value: RelationType) -> Self {
        match value {
            RelationType::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A strong identity signal declared by a source extractor, such as an
/// InChIKey for a compound or a UniProt accession for a target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentKey {
    pub kind: String,
    pub value: String,
}

impl ContentKey {
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            value: value.into(),
        }
    }
}

/// Rank of the extracted record a value came from. Orders the same way merge
/// members are ordered: smallest `(source_name, raw_id)` first, then
/// canonical id. Records without source ids sort first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Origin {
    pub source: Option<(String, String)>,
    pub canonical_id: String,
}

/// Where merged-in values came from. Only values taken from a record other
/// than the one an entity carries its canonical id from are listed, so an
/// entity that never absorbed another has no provenance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Origin>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub source_ids: BTreeMap<String, Origin>,
}

impl Provenance {
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty() && self.source_ids.is_empty()
    }
}

/// A graph node as emitted by extraction and, after deduplication, as handed
/// to the graph loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Stable identifier; blank means "let the reconciler mint one"
    pub canonical_id: String,
    pub entity_type: EntityType,
    #[serde(default)]
    pub content_keys: BTreeSet<ContentKey>,
    /// source_name -> raw identifier in that source's native scheme
    #[serde(default)]
    pub source_ids: BTreeMap<String, String>,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default, skip_serializing_if = "Provenance::is_empty")]
    pub provenance: Provenance,
}

impl Entity {
    pub fn new(canonical_id: impl Into<String>, entity_type: impl Into<EntityType>) -> Self {
        Self {
            canonical_id: canonical_id.into(),
            entity_type: entity_type.into(),
            content_keys: BTreeSet::new(),
            source_ids: BTreeMap::new(),
            attributes: Attributes::new(),
            provenance: Provenance::default(),
        }
    }

    pub fn with_content_key(mut self, kind: impl Into<String>, value: impl Into<String>) -> Self {
        self.content_keys.insert(ContentKey::new(kind, value));
        self
    }

    pub fn with_source_id(mut self, source_name: impl Into<String>, raw_id: impl Into<String>) -> Self {
        self.source_ids.insert(source_name.into(), raw_id.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    /// Every raw identifier this entity is known by: its canonical id, each
    /// source identifier and each content-key value.
    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.canonical_id.as_str())
            .chain(self.source_ids.values().map(String::as_str))
            .chain(self.content_keys.iter().map(|key| key.value.as_str()))
    }

    /// Smallest `(source_name, raw_id)` pair, used as the stable tiebreak
    /// when ordering members of a merge group.
    pub fn first_source(&self) -> Option<(&str, &str)> {
        self.source_ids
            .iter()
            .next()
            .map(|(name, raw)| (name.as_str(), raw.as_str()))
    }

    /// Rank of the record this entity carries its canonical id from.
    pub fn origin(&self) -> Origin {
        Origin {
            source: self
                .first_source()
                .map(|(name, raw)| (name.to_string(), raw.to_string())),
            canonical_id: self.canonical_id.clone(),
        }
    }

    pub fn attribute_origin(&self, attribute: &str) -> Origin {
        self.provenance
            .attributes
            .get(attribute)
            .cloned()
            .unwrap_or_else(|| self.origin())
    }

    pub fn source_id_origin(&self, source_name: &str) -> Origin {
        self.provenance
            .source_ids
            .get(source_name)
            .cloned()
            .unwrap_or_else(|| self.origin())
    }

    /// Replace the provenance with the given origins, keeping only those that
    /// differ from this entity's own origin.
    pub fn record_provenance(
        &mut self,
        source_ids: BTreeMap<String, Origin>,
        attributes: BTreeMap<String, Origin>,
    ) {
        let own = self.origin();
        self.provenance = Provenance {
            source_ids: source_ids.into_iter().filter(|(_, from)| *from != own).collect(),
            attributes: attributes.into_iter().filter(|(_, from)| *from != own).collect(),
        };
    }
}

/// A relationship exactly as produced by an extractor. Never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRelationship {
    pub from_ref: String,
    pub to_ref: String,
    pub relation_type: RelationType,
    pub source_name: String,
    #[serde(default)]
    pub attributes: Attributes,
}

impl RawRelationship {
    pub fn new(
        from_ref: impl Into<String>,
        to_ref: impl Into<String>,
        relation_type: impl Into<RelationType>,
        source_name: impl Into<String>,
    ) -> Self {
        Self {
            from_ref: from_ref.into(),
            to_ref: to_ref.into(),
            relation_type: relation_type.into(),
            source_name: source_name.into(),
            attributes: Attributes::new(),
        }
    }
}

/// How much normalization was needed to resolve a reference. Ordered from
/// strongest to weakest guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchStage {
    Direct,
    Normalized,
    Fuzzy,
}

impl MatchStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStage::Direct => "DIRECT",
            MatchStage::Normalized => "NORMALIZED",
            MatchStage::Fuzzy => "FUZZY",
        }
    }
}

impl fmt::Display for MatchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A relationship whose endpoints both map onto canonical ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRelationship {
    #[serde(flatten)]
    pub relationship: RawRelationship,
    pub from_canonical_id: String,
    pub to_canonical_id: String,
    /// The weaker of the two endpoint stages
    pub match_stage: MatchStage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnresolvedReason {
    NoCandidate,
    Ambiguous,
}

impl UnresolvedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnresolvedReason::NoCandidate => "NO_CANDIDATE",
            UnresolvedReason::Ambiguous => "AMBIGUOUS",
        }
    }
}

impl fmt::Display for UnresolvedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    From,
    To,
}

/// One relationship endpoint that could not be mapped to a canonical id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedReference {
    pub raw_ref: String,
    pub relation_type: RelationType,
    pub source_name: String,
    pub reason: UnresolvedReason,
    pub endpoint: Endpoint,
    /// Position of the owning relationship in the pending relationship stream
    pub relationship_ordinal: u64,
    /// Contending canonical ids when the reason is AMBIGUOUS
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<String>,
}

/// Record of an entity retired in favour of another. The retired id stays
/// resolvable and is never handed out again.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Supersession {
    pub retired: String,
    pub replacement: String,
    /// Raw ids of the retired entity the replacement could not carry because
    /// it already holds another id for the same source; they resolve to the
    /// replacement like the retired id does
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
}

impl Supersession {
    pub fn new(retired: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self {
            retired: retired.into(),
            replacement: replacement.into(),
            aliases: Vec::new(),
        }
    }

    /// Every retired identifier that resolves to the replacement.
    pub fn retired_identifiers(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.retired.as_str()).chain(self.aliases.iter().map(String::as_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entity_type_parsing_accepts_label_and_snake_case() {
        assert_eq!(EntityType::from("RegulatoryDocument"), EntityType::RegulatoryDocument);
        assert_eq!(EntityType::from("regulatory_document"), EntityType::RegulatoryDocument);
        assert_eq!(EntityType::from("Compound"), EntityType::Compound);
        assert_eq!(
            EntityType::from("clinical_trial"),
            EntityType::Other("clinical_trial".to_string())
        );
        assert_eq!(EntityType::RegulatoryDocument.label(), "RegulatoryDocument");
        assert_eq!(EntityType::Other("clinical_trial".into()).label(), "ClinicalTrial");
    }

    #[test]
    fn test_entity_round_trips_every_field() {
        let entity = Entity::new("Compound-aspirin", EntityType::Compound)
            .with_content_key("inchikey", "BSYNRYMUTXBXSQ-UHFFFAOYSA-N")
            .with_source_id("chembl", "CHEMBL25")
            .with_source_id("pubchem", "2244")
            .with_attribute("name", json!("aspirin"))
            .with_attribute("mass", json!(180.16))
            .with_attribute("synonyms", json!(["ASA", "acetylsalicylic acid"]))
            .with_attribute("withdrawn", json!(null));

        let line = serde_json::to_string(&entity).unwrap();
        let back: Entity = serde_json::from_str(&line).unwrap();
        assert_eq!(back, entity);
    }

    #[test]
    fn test_unknown_relation_type_survives_serialization() {
        let rel = RawRelationship::new("a", "b", "co_occurs_with", "pubmed");
        let line = serde_json::to_string(&rel).unwrap();
        assert!(line.contains("\"relation_type\":\"co_occurs_with\""));
        let back: RawRelationship = serde_json::from_str(&line).unwrap();
        assert_eq!(back.relation_type, RelationType::Other("co_occurs_with".into()));
    }

    #[test]
    fn test_resolved_relationship_flattens_raw_fields() {
        let resolved = ResolvedRelationship {
            relationship: RawRelationship::new("CHEMBL25", "P23219", RelationType::Inhibits, "chembl"),
            from_canonical_id: "Compound-1".into(),
            to_canonical_id: "Target-1".into(),
            match_stage: MatchStage::Normalized,
        };
        let value = serde_json::to_value(&resolved).unwrap();
        assert_eq!(value["from_ref"], "CHEMBL25");
        assert_eq!(value["match_stage"], "NORMALIZED");
        let back: ResolvedRelationship = serde_json::from_value(value).unwrap();
        assert_eq!(back, resolved);
    }

    #[test]
    fn test_match_stage_orders_from_strongest_to_weakest() {
        assert!(MatchStage::Direct < MatchStage::Normalized);
        assert!(MatchStage::Normalized < MatchStage::Fuzzy);
        assert_eq!(MatchStage::Direct.max(MatchStage::Fuzzy), MatchStage::Fuzzy);
    }
}
