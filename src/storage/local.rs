//! # Local Storage
//!
//! `LocalStorage` wires one storage directory together: the file registry,
//! the shared page cache, the atomic-operations manager with its commit
//! journal, the conflict-strategy registry and the configuration root that
//! records every cluster living in the directory. Clusters receive an
//! `Arc<LocalStorage>` at configuration time and reach all collaborators
//! through it.
//!
//! Opening a directory replays any committed journal frames a crash left
//! behind before a single page can be cached, so clusters always open onto
//! rolled-forward state.

use std::path::Path;
use std::sync::Arc;

use eyre::Result;
use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::cluster::config::{ClusterConfig, ClusterStatus};
use crate::cluster::conflict::ConflictStrategyRegistry;
use crate::config::DEFAULT_CACHE_CAPACITY;
use crate::stats::SessionStoragePerformanceStatistic;

use super::atomic::AtomicOperationsManager;
use super::cache::PageCache;
use super::registry::FileRegistry;

#[derive(Debug, Default)]
struct StorageConfigRoot {
    clusters: Vec<Option<ClusterConfig>>,
    by_name: HashMap<String, i32>,
}

pub struct LocalStorage {
    registry: Arc<FileRegistry>,
    cache: Arc<PageCache>,
    atomics: Arc<AtomicOperationsManager>,
    conflict_strategies: ConflictStrategyRegistry,
    statistics: RwLock<Option<Arc<SessionStoragePerformanceStatistic>>>,
    config_root: RwLock<StorageConfigRoot>,
    track_record_changes: bool,
}

impl LocalStorage {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Arc<Self>> {
        Self::open_with_cache_capacity(dir, DEFAULT_CACHE_CAPACITY)
    }

    pub fn open_with_cache_capacity<P: AsRef<Path>>(dir: P, cache_capacity: usize) -> Result<Arc<Self>> {
        let registry = Arc::new(FileRegistry::new(dir)?);
        let cache = Arc::new(PageCache::new(Arc::clone(&registry), cache_capacity)?);
        let atomics = Arc::new(AtomicOperationsManager::new(&registry, Arc::clone(&cache))?);

        atomics.recover(&registry)?;

        Ok(Arc::new(Self {
            registry,
            cache,
            atomics,
            conflict_strategies: ConflictStrategyRegistry::new(),
            statistics: RwLock::new(None),
            config_root: RwLock::new(StorageConfigRoot::default()),
            track_record_changes: true,
        }))
    }

    pub fn registry(&self) -> &Arc<FileRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    pub fn atomics(&self) -> &Arc<AtomicOperationsManager> {
        &self.atomics
    }

    pub fn conflict_strategies(&self) -> &ConflictStrategyRegistry {
        &self.conflict_strategies
    }

    pub fn track_record_changes(&self) -> bool {
        self.track_record_changes
    }

    pub fn session_statistics(&self) -> Option<Arc<SessionStoragePerformanceStatistic>> {
        self.statistics.read().clone()
    }

    pub fn set_session_statistics(&self, stats: Option<Arc<SessionStoragePerformanceStatistic>>) {
        *self.statistics.write() = stats;
    }

    /// Registers or replaces a cluster descriptor in the configuration root.
    pub fn store_cluster_config(&self, config: ClusterConfig) {
        let mut root = self.config_root.write();
        let id = config.id as usize;

        if root.clusters.len() <= id {
            root.clusters.resize(id + 1, None);
        }
        if let Some(Some(old)) = root.clusters.get(id) {
            let old_name = old.name.clone();
            root.by_name.remove(&old_name);
        }
        root.by_name.insert(config.name.clone(), config.id);
        root.clusters[id] = Some(config);
    }

    pub fn cluster_config(&self, id: i32) -> Option<ClusterConfig> {
        self.config_root
            .read()
            .clusters
            .get(id as usize)
            .and_then(|slot| slot.clone())
    }

    pub fn cluster_id_by_name(&self, name: &str) -> Option<i32> {
        self.config_root.read().by_name.get(name).copied()
    }

    /// Rebinds the cluster-name index after a rename.
    pub fn rename_cluster(&self, old_name: &str, new_name: &str) -> Result<()> {
        let mut root = self.config_root.write();
        let Some(id) = root.by_name.remove(old_name) else {
            eyre::bail!("cluster '{}' is not registered", old_name);
        };
        root.by_name.insert(new_name.to_string(), id);
        if let Some(Some(config)) = root.clusters.get_mut(id as usize) {
            config.name = new_name.to_string();
        }
        Ok(())
    }

    pub fn set_cluster_status(&self, id: i32, status: ClusterStatus) -> Result<ClusterStatus> {
        let mut root = self.config_root.write();
        let slot = root
            .clusters
            .get_mut(id as usize)
            .and_then(|slot| slot.as_mut());

        match slot {
            Some(config) => {
                config.status = status;
                Ok(status)
            }
            None => eyre::bail!("cluster with id {} is not registered", id),
        }
    }

    /// Flushes every file and the cache-backed state to disk.
    pub fn synch(&self) -> Result<()> {
        self.registry.flush_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn cluster_configs_are_indexed_by_id_and_name() {
        let dir = tempdir().unwrap();
        let storage = LocalStorage::open(dir.path()).unwrap();

        storage.store_cluster_config(ClusterConfig::new(2, "users"));

        assert_eq!(storage.cluster_config(2).unwrap().name, "users");
        assert_eq!(storage.cluster_id_by_name("users"), Some(2));
        assert!(storage.cluster_config(0).is_none());
    }

    #[test]
    fn rename_rebinds_the_name_index() {
        let dir = tempdir().unwrap();
        let storage = LocalStorage::open(dir.path()).unwrap();

        storage.store_cluster_config(ClusterConfig::new(0, "old"));
        storage.rename_cluster("old", "new").unwrap();

        assert_eq!(storage.cluster_id_by_name("new"), Some(0));
        assert_eq!(storage.cluster_id_by_name("old"), None);
        assert_eq!(storage.cluster_config(0).unwrap().name, "new");
    }

    #[test]
    fn status_switch_requires_registered_cluster() {
        let dir = tempdir().unwrap();
        let storage = LocalStorage::open(dir.path()).unwrap();

        assert!(storage.set_cluster_status(5, ClusterStatus::Offline).is_err());

        storage.store_cluster_config(ClusterConfig::new(5, "c"));
        let status = storage.set_cluster_status(5, ClusterStatus::Offline).unwrap();
        assert_eq!(status, ClusterStatus::Offline);
        assert_eq!(storage.cluster_config(5).unwrap().status, ClusterStatus::Offline);
    }
}
