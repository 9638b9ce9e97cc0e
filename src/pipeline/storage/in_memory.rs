use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::{apply_supersession, EntityStore, SupersedeOutcome};
use crate::domain::{Entity, Supersession};
use crate::error::Result;

#[derive(Debug, Default)]
struct State {
    entities: Vec<Entity>,
    supersessions: Vec<Supersession>,
}

/// In-memory entity store for development/testing
#[derive(Debug, Default)]
pub struct InMemoryEntityStore {
    state: RwLock<State>,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entities(mut entities: Vec<Entity>) -> Self {
        entities.sort_by(|a, b| a.canonical_id.cmp(&b.canonical_id));
        Self {
            state: RwLock::new(State {
                entities,
                supersessions: Vec::new(),
            }),
        }
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn load_entities(&self) -> Result<Vec<Entity>> {
        Ok(self.state.read().await.entities.clone())
    }

    async fn save_entities(&self, entities: &[Entity]) -> Result<()> {
        let mut sorted = entities.to_vec();
        sorted.sort_by(|a, b| a.canonical_id.cmp(&b.canonical_id));
        debug!("Saved {} entities in memory", sorted.len());
        self.state.write().await.entities = sorted;
        Ok(())
    }

    async fn load_supersessions(&self) -> Result<Vec<Supersession>> {
        Ok(self.state.read().await.supersessions.clone())
    }

    async fn supersede(&self, retired: &str, replacement: &str) -> Result<SupersedeOutcome> {
        let mut state = self.state.write().await;
        let State {
            entities,
            supersessions,
        } = &mut *state;
        apply_supersession(entities, supersessions, retired, replacement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EntityType;

    #[tokio::test]
    async fn test_save_then_load_is_sorted() {
        let store = InMemoryEntityStore::new();
        store
            .save_entities(&[
                Entity::new("Gene-b", EntityType::Gene),
                Entity::new("Gene-a", EntityType::Gene),
            ])
            .await
            .unwrap();
        let ids: Vec<String> = store
            .load_entities()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.canonical_id)
            .collect();
        assert_eq!(ids, vec!["Gene-a", "Gene-b"]);
    }

    #[tokio::test]
    async fn test_supersede_is_visible_to_later_loads() {
        let store = InMemoryEntityStore::with_entities(vec![
            Entity::new("Gene-a", EntityType::Gene).with_source_id("hgnc", "HGNC:11138"),
            Entity::new("Gene-b", EntityType::Gene),
        ]);
        store.supersede("Gene-a", "Gene-b").await.unwrap();

        let entities = store.load_entities().await.unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].source_ids.get("hgnc").map(String::as_str), Some("HGNC:11138"));
        assert_eq!(store.load_supersessions().await.unwrap().len(), 1);
    }
}
