// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Parent existence checks.
//!
//! A parent referenced by an event from the legacy side exists in the target
//! once its legacy id is mapped; from the modern side, once its UUID is. The
//! mapping row is written in the same transaction as the replayed entity, so
//! a mapping always implies the target row was written at least once.

use crate::error::{BoxFuture, SyncError};
use crate::event::{EntityType, SourceSystem};
use crate::sync::MappingRepository;
use std::collections::HashSet;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Answers whether a referenced parent aggregate already exists in the target.
pub trait DependencyChecker: Send + Sync {
    /// `id` is the parent's id as written in the source payload.
    ///
    /// An id that cannot be an id of `source` yields [`SyncError::Decode`].
    fn exists(&self, entity: EntityType, id: &str, source: SourceSystem) -> BoxFuture<'_, bool>;
}

/// Checks the mapping tables in the modern database.
#[derive(Clone)]
pub struct MappingDependencyChecker {
    mappings: MappingRepository,
}

impl MappingDependencyChecker {
    pub fn new(mappings: MappingRepository) -> Self {
        Self { mappings }
    }
}

impl DependencyChecker for MappingDependencyChecker {
    fn exists(&self, entity: EntityType, id: &str, source: SourceSystem) -> BoxFuture<'_, bool> {
        let id = id.to_string();
        Box::pin(async move {
            match source {
                SourceSystem::Legacy => {
                    let old_id: i64 = id
                        .parse()
                        .map_err(|_| SyncError::decode(entity.as_str(), format!("'{id}' is not a legacy id")))?;
                    Ok(self.mappings.new_id_for(entity, old_id).await?.is_some())
                }
                SourceSystem::Modern => {
                    let new_id = Uuid::parse_str(&id)
                        .map_err(|_| SyncError::decode(entity.as_str(), format!("'{id}' is not a modern id")))?;
                    Ok(self.mappings.old_id_for(entity, new_id).await?.is_some())
                }
            }
        })
    }
}

type CacheKey = (SourceSystem, EntityType, String);

/// Parents confirmed present, so repeat checks skip the database.
///
/// Bounded: when full, the cache is cleared and refills from checks.
pub struct DependencyCache {
    entries: RwLock<HashSet<CacheKey>>,
    capacity: usize,
}

impl DependencyCache {
    pub const DEFAULT_CAPACITY: usize = 100_000;

    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashSet::new()),
            capacity: capacity.max(1),
        }
    }

    pub async fn contains(&self, source: SourceSystem, entity: EntityType, id: &str) -> bool {
        self.entries
            .read()
            .await
            .contains(&(source, entity, id.to_string()))
    }

    pub async fn insert(&self, source: SourceSystem, entity: EntityType, id: &str) {
        let mut entries = self.entries.write().await;
        if entries.len() >= self.capacity {
            entries.clear();
        }
        entries.insert((source, entity, id.to_string()));
    }

    pub async fn evict(&self, source: SourceSystem, entity: EntityType, id: &str) {
        self.entries
            .write()
            .await
            .remove(&(source, entity, id.to_string()));
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for DependencyCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabasesConfig;
    use crate::sync::Databases;

    #[tokio::test]
    async fn test_cache_insert_evict() {
        let cache = DependencyCache::new(10);
        assert!(cache.is_empty().await);
        cache.insert(SourceSystem::Legacy, EntityType::Invoice, "7").await;
        assert!(cache.contains(SourceSystem::Legacy, EntityType::Invoice, "7").await);
        assert!(!cache.contains(SourceSystem::Modern, EntityType::Invoice, "7").await);
        cache.evict(SourceSystem::Legacy, EntityType::Invoice, "7").await;
        assert!(!cache.contains(SourceSystem::Legacy, EntityType::Invoice, "7").await);
    }

    #[tokio::test]
    async fn test_cache_is_bounded() {
        let cache = DependencyCache::new(3);
        for i in 0..3 {
            cache.insert(SourceSystem::Legacy, EntityType::Address, &i.to_string()).await;
        }
        assert_eq!(cache.len().await, 3);
        cache.insert(SourceSystem::Legacy, EntityType::Address, "99").await;
        assert_eq!(cache.len().await, 1);
        assert!(cache.contains(SourceSystem::Legacy, EntityType::Address, "99").await);
    }

    #[tokio::test]
    async fn test_mapping_checker() {
        let dbs = Databases::connect(&DatabasesConfig::in_memory()).await.unwrap();
        let mappings = dbs.mappings();
        let checker = MappingDependencyChecker::new(mappings.clone());
        let new_id = Uuid::new_v4();

        assert!(!checker.exists(EntityType::Invoice, "5", SourceSystem::Legacy).await.unwrap());
        mappings.insert(EntityType::Invoice, 5, new_id).await.unwrap();
        assert!(checker.exists(EntityType::Invoice, "5", SourceSystem::Legacy).await.unwrap());
        assert!(checker
            .exists(EntityType::Invoice, &new_id.to_string(), SourceSystem::Modern)
            .await
            .unwrap());
        assert!(!checker
            .exists(EntityType::Customer, &new_id.to_string(), SourceSystem::Modern)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_mapping_checker_rejects_foreign_ids() {
        let dbs = Databases::connect(&DatabasesConfig::in_memory()).await.unwrap();
        let checker = MappingDependencyChecker::new(dbs.mappings());
        let err = checker
            .exists(EntityType::Invoice, "not-a-number", SourceSystem::Legacy)
            .await
            .unwrap_err();
        assert!(err.is_decode());
        let err = checker
            .exists(EntityType::Invoice, "12", SourceSystem::Modern)
            .await
            .unwrap_err();
        assert!(err.is_decode());
    }
}
