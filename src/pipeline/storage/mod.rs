// Durable canonical entity set: the entities of the last completed run plus
// the supersession records that keep retired ids resolvable

pub mod in_memory;
pub mod ndjson;

pub use in_memory::InMemoryEntityStore;
pub use ndjson::NdjsonEntityStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

use crate::domain::{Entity, Origin, Supersession};
use crate::error::{ReconcileError, Result};
use crate::pipeline::processing::conflation::{AttributeConflict, ConflictRule, SourceIdCollision};

/// A recorded supersession plus whatever of the retired entity did not fit
/// onto the replacement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupersedeOutcome {
    pub record: Supersession,
    /// Retired raw ids that lost to the replacement's own id for the same
    /// source. Each stays resolvable through an alias on `record`.
    pub source_id_collisions: Vec<SourceIdCollision>,
    pub attribute_conflicts: Vec<AttributeConflict>,
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    /// The persisted entity set, ordered by canonical id.
    async fn load_entities(&self) -> Result<Vec<Entity>>;

    /// Replace the persisted entity set.
    async fn save_entities(&self, entities: &[Entity]) -> Result<()>;

    async fn load_supersessions(&self) -> Result<Vec<Supersession>>;

    /// Retire `retired` in favour of `replacement`. The retired entity is
    /// removed and its identifiers move onto the replacement, so references
    /// to either keep resolving. Where both carry an id for the same source,
    /// the replacement's is kept and the retired one becomes an alias.
    async fn supersede(&self, retired: &str, replacement: &str) -> Result<SupersedeOutcome>;
}

/// Apply a supersession to an in-memory entity set and record list. Shared by
/// every store so they agree on what a supersession does.
pub(crate) fn apply_supersession(
    entities: &mut Vec<Entity>,
    supersessions: &mut Vec<Supersession>,
    retired: &str,
    replacement: &str,
) -> Result<SupersedeOutcome> {
    if retired == replacement {
        return Err(ReconcileError::Supersession(format!(
            "'{}' cannot supersede itself",
            retired
        )));
    }
    if supersessions.iter().any(|s| s.retired == replacement) {
        return Err(ReconcileError::Supersession(format!(
            "replacement '{}' is itself retired",
            replacement
        )));
    }
    let Some(position) = entities.iter().position(|e| e.canonical_id == retired) else {
        return Err(ReconcileError::Supersession(format!(
            "'{}' is not in the entity set",
            retired
        )));
    };
    if !entities.iter().any(|e| e.canonical_id == replacement) {
        return Err(ReconcileError::Supersession(format!(
            "replacement '{}' is not in the entity set",
            replacement
        )));
    }

    let retired_entity = entities.remove(position);
    let mut record = Supersession::new(retired, replacement);
    let mut source_id_collisions = Vec::new();
    let mut attribute_conflicts = Vec::new();

    if let Some(target) = entities.iter_mut().find(|e| e.canonical_id == replacement) {
        let mut source_origins: BTreeMap<String, Origin> = target
            .source_ids
            .keys()
            .map(|name| (name.clone(), target.source_id_origin(name)))
            .collect();
        let mut attribute_origins: BTreeMap<String, Origin> = target
            .attributes
            .keys()
            .map(|name| (name.clone(), target.attribute_origin(name)))
            .collect();

        target.content_keys.extend(retired_entity.content_keys.iter().cloned());

        for (source_name, raw_id) in &retired_entity.source_ids {
            match target.source_ids.get(source_name) {
                None => {
                    target.source_ids.insert(source_name.clone(), raw_id.clone());
                    source_origins.insert(source_name.clone(), retired_entity.source_id_origin(source_name));
                }
                Some(kept) if kept != raw_id => {
                    warn!(
                        retired,
                        replacement,
                        source = %source_name,
                        kept = %kept,
                        discarded = %raw_id,
                        "Retired source id kept as a supersession alias"
                    );
                    source_id_collisions.push(SourceIdCollision {
                        canonical_id: replacement.to_string(),
                        source_name: source_name.clone(),
                        kept: kept.clone(),
                        discarded: raw_id.clone(),
                    });
                    record.aliases.push(raw_id.clone());
                }
                Some(_) => {}
            }
        }

        for (name, value) in &retired_entity.attributes {
            match target.attributes.get(name) {
                None => {
                    target.attributes.insert(name.clone(), value.clone());
                    attribute_origins.insert(name.clone(), retired_entity.attribute_origin(name));
                }
                Some(kept) if kept.is_null() && !value.is_null() => {
                    attribute_conflicts.push(AttributeConflict {
                        canonical_id: replacement.to_string(),
                        attribute: name.clone(),
                        kept: value.clone(),
                        discarded: kept.clone(),
                        rule: ConflictRule::PreferNonNull,
                    });
                    target.attributes.insert(name.clone(), value.clone());
                    attribute_origins.insert(name.clone(), retired_entity.attribute_origin(name));
                }
                Some(kept) if kept != value => {
                    // Otherwise the replacement's own value stands
                    let rule = if value.is_null() {
                        ConflictRule::PreferNonNull
                    } else {
                        ConflictRule::FirstSeen
                    };
                    attribute_conflicts.push(AttributeConflict {
                        canonical_id: replacement.to_string(),
                        attribute: name.clone(),
                        kept: kept.clone(),
                        discarded: value.clone(),
                        rule,
                    });
                }
                Some(_) => {}
            }
        }

        target.record_provenance(source_origins, attribute_origins);
    }
    record.aliases.sort();
    record.aliases.dedup();

    // Earlier supersessions that pointed at the retired id follow it
    for earlier in supersessions.iter_mut() {
        if earlier.replacement == retired {
            earlier.replacement = replacement.to_string();
        }
    }

    supersessions.push(record.clone());
    supersessions.sort();
    Ok(SupersedeOutcome {
        record,
        source_id_collisions,
        attribute_conflicts,
    })
}
