//! Lookup of entity stores by entity type.

use super::{EntityStore, MemoryEntityStore};
use crate::error::{SyncError, SyncResult};
use mobisync_protocol::EntityType;
use std::collections::HashMap;
use std::sync::Arc;

/// Maps each entity type to the store that owns it.
///
/// Every component resolves stores here instead of switching on type names.
/// Domain services plug in their own [`EntityStore`] with [`register`].
///
/// [`register`]: EntityRegistry::register
#[derive(Clone, Default)]
pub struct EntityRegistry {
    stores: HashMap<EntityType, Arc<dyn EntityStore>>,
}

impl EntityRegistry {
    /// Creates a registry with no stores.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Creates a registry backing every entity type with a [`MemoryEntityStore`].
    pub fn in_memory() -> Self {
        let mut registry = Self::empty();
        for entity_type in EntityType::ALL {
            registry.register(Arc::new(MemoryEntityStore::new(entity_type)));
        }
        registry
    }

    /// Registers a store, replacing any store for the same type.
    pub fn register(&mut self, store: Arc<dyn EntityStore>) -> &mut Self {
        self.stores.insert(store.entity_type(), store);
        self
    }

    /// Returns the store for `entity_type`.
    pub fn store(&self, entity_type: EntityType) -> SyncResult<&Arc<dyn EntityStore>> {
        self.stores.get(&entity_type).ok_or_else(|| {
            SyncError::InvalidRequest(format!("unsupported data type: {entity_type}"))
        })
    }

    /// Returns true if a store is registered for `entity_type`.
    pub fn supports(&self, entity_type: EntityType) -> bool {
        self.stores.contains_key(&entity_type)
    }

    /// Returns the registered types in canonical order.
    pub fn entity_types(&self) -> Vec<EntityType> {
        EntityType::ALL
            .into_iter()
            .filter(|t| self.supports(*t))
            .collect()
    }
}
