//! Plan-keyed cache of materialized query results
//!
//! The manager maps plan fingerprints to cache entries. Every mutation takes
//! the map's write lock, lookups take the read lock, and no lock is held
//! while a plan executes: materialization and blocking releases happen after
//! the map has been updated.

use crate::accumulator::AccumulatorRegistry;
use crate::config::CacheConfig;
use crate::partition_set::{CacheResources, MaterializedPartitionSet};
use crate::stats::CacheStats;
use crate::storage::{BlockStore, EntryId, StorageLevel};
use parking_lot::RwLock;
use query_core::{Partitioning, QueryError, Result};
use query_planner::{
    fingerprint, subtree_keys, CachedRelation, Catalog, LogicalPlan, LogicalPlanKey, PlanExecutor,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// One cached plan and the names that resolve to it
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: LogicalPlanKey,
    pub partition_set: Arc<MaterializedPartitionSet>,
    /// Table and view names cached through this entry
    pub dependents: BTreeSet<String>,
}

impl CacheEntry {
    pub fn id(&self) -> EntryId {
        self.partition_set.id()
    }

    pub fn plan(&self) -> &LogicalPlan {
        self.partition_set.plan()
    }
}

/// Introspection record for a cache entry
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntryInfo {
    pub id: EntryId,
    pub key: LogicalPlanKey,
    pub names: Vec<String>,
    pub storage_level: StorageLevel,
    pub partitioning: Partitioning,
    pub materialized: bool,
    pub size_in_bytes: Option<u64>,
    pub num_partitions: usize,
}

/// Cache of materialized plans, owned by one engine context
#[derive(Debug)]
pub struct CacheManager {
    entries: RwLock<HashMap<LogicalPlanKey, CacheEntry>>,
    config: CacheConfig,
    resources: CacheResources,
}

impl CacheManager {
    /// Create an empty cache with its own block store, accumulators and stats
    pub fn new(config: CacheConfig) -> Self {
        let resources = CacheResources {
            blocks: Arc::new(BlockStore::new(config.spill_dir.clone())),
            accumulators: Arc::new(AccumulatorRegistry::new()),
            stats: Arc::new(CacheStats::new()),
        };
        Self {
            entries: RwLock::new(HashMap::new()),
            config,
            resources,
        }
    }

    /// Create a cache with the default configuration
    pub fn with_defaults() -> Self {
        Self::new(CacheConfig::default())
    }

    /// Get the configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Whether lookups may be answered from the cache
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Get the shared statistics
    pub fn stats(&self) -> Arc<CacheStats> {
        self.resources.stats.clone()
    }

    /// Get the block registry
    pub fn block_store(&self) -> &Arc<BlockStore> {
        &self.resources.blocks
    }

    /// Get the accumulator registry
    pub fn accumulators(&self) -> &Arc<AccumulatorRegistry> {
        &self.resources.accumulators
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no entry is cached
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Cache the plan a table or view name resolves to
    pub fn cache_table(
        &self,
        catalog: &Catalog,
        name: &str,
        storage_level: StorageLevel,
        eager: bool,
        executor: &dyn PlanExecutor,
    ) -> Result<Arc<MaterializedPartitionSet>> {
        let plan = catalog.resolve(name)?;
        self.insert(plan, Some(name), storage_level, eager, executor)
    }

    /// Cache an ad-hoc plan, optionally recording `name` as a dependent
    pub fn cache_query(
        &self,
        plan: LogicalPlan,
        name: Option<&str>,
        storage_level: StorageLevel,
        eager: bool,
        executor: &dyn PlanExecutor,
    ) -> Result<Arc<MaterializedPartitionSet>> {
        self.insert(plan, name, storage_level, eager, executor)
    }

    fn insert(
        &self,
        plan: LogicalPlan,
        name: Option<&str>,
        storage_level: StorageLevel,
        eager: bool,
        executor: &dyn PlanExecutor,
    ) -> Result<Arc<MaterializedPartitionSet>> {
        let key = fingerprint(&plan);

        if let Some(existing) = self.add_dependent(&key, name) {
            tracing::debug!("Plan {} already cached as {}", key, existing.id());
            if eager {
                existing.materialize(executor)?;
            }
            return Ok(existing);
        }

        // Layout is decided before taking the write lock; planning may read
        // other cache entries.
        let (partitioning, ordering) = executor.output_properties(&plan, &key)?;

        let set = {
            let mut entries = self.entries.write();
            if let Some(entry) = entries.get_mut(&key) {
                if let Some(name) = name {
                    entry.dependents.insert(name.to_string());
                }
                let existing = entry.partition_set.clone();
                drop(entries);
                if eager {
                    existing.materialize(executor)?;
                }
                return Ok(existing);
            }

            let set = Arc::new(MaterializedPartitionSet::new(
                plan,
                key.clone(),
                partitioning,
                ordering,
                storage_level,
                &self.resources,
            ));
            let dependents = name.map(|n| n.to_string()).into_iter().collect();
            entries.insert(
                key.clone(),
                CacheEntry {
                    key: key.clone(),
                    partition_set: set.clone(),
                    dependents,
                },
            );
            self.resources.stats.set_entry_count(entries.len() as u64);
            set
        };

        tracing::info!(
            "Cached {} as {} ({}, {}, {})",
            name.unwrap_or("query"),
            set.id(),
            storage_level,
            set.output_partitioning(),
            if eager { "eager" } else { "lazy" }
        );

        if eager {
            if let Err(e) = set.materialize(executor) {
                self.remove_failed(&key, &set);
                return Err(e);
            }
        }
        Ok(set)
    }

    fn add_dependent(
        &self,
        key: &LogicalPlanKey,
        name: Option<&str>,
    ) -> Option<Arc<MaterializedPartitionSet>> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(key)?;
        if let Some(name) = name {
            entry.dependents.insert(name.to_string());
        }
        Some(entry.partition_set.clone())
    }

    fn remove_failed(&self, key: &LogicalPlanKey, set: &Arc<MaterializedPartitionSet>) {
        let removed = {
            let mut entries = self.entries.write();
            let ours = entries
                .get(key)
                .map(|entry| Arc::ptr_eq(&entry.partition_set, set))
                .unwrap_or(false);
            if !ours {
                return;
            }
            let removed = Self::remove_cascade(&mut entries, key);
            self.resources.stats.set_entry_count(entries.len() as u64);
            removed
        };
        tracing::warn!("Removed {} after failed eager materialization", set.id());
        self.release_entries(removed, false);
    }

    /// Remove the entry cached for `name` along with every entry derived
    /// from it
    pub fn uncache_table(&self, catalog: &Catalog, name: &str) -> Result<()> {
        let removed = {
            let mut entries = self.entries.write();
            let key = Self::find_key(&entries, catalog, name)
                .ok_or_else(|| QueryError::NotCached(name.to_string()))?;
            let removed = Self::remove_cascade(&mut entries, &key);
            self.resources.stats.set_entry_count(entries.len() as u64);
            removed
        };
        tracing::info!("Uncached {} ({} entries)", name, removed.len());
        self.release_entries(removed, false);
        Ok(())
    }

    /// Remove the entry cached for `plan`, if any. Returns whether one existed.
    pub fn uncache_query(&self, plan: &LogicalPlan, blocking: bool) -> bool {
        let key = fingerprint(plan);
        let removed = {
            let mut entries = self.entries.write();
            if !entries.contains_key(&key) {
                return false;
            }
            let removed = Self::remove_cascade(&mut entries, &key);
            self.resources.stats.set_entry_count(entries.len() as u64);
            removed
        };
        tracing::info!("Uncached query {} ({} entries)", key, removed.len());
        self.release_entries(removed, blocking);
        true
    }

    /// Exact-match lookup of a plan's materialization
    pub fn lookup(&self, plan: &LogicalPlan) -> Option<Arc<MaterializedPartitionSet>> {
        self.lookup_key(&fingerprint(plan))
    }

    /// Lookup by fingerprint; always a miss while the cache is disabled
    pub fn lookup_key(&self, key: &LogicalPlanKey) -> Option<Arc<MaterializedPartitionSet>> {
        if !self.config.enabled {
            return None;
        }
        self.entries
            .read()
            .get(key)
            .map(|entry| entry.partition_set.clone())
    }

    /// Whether `name`, or the plan it resolves to, has an entry
    pub fn is_cached(&self, catalog: &Catalog, name: &str) -> bool {
        Self::find_key(&self.entries.read(), catalog, name).is_some()
    }

    /// Drop every entry
    pub fn clear_all(&self) {
        let removed: Vec<CacheEntry> = {
            let mut entries = self.entries.write();
            let removed = entries.drain().map(|(_, entry)| entry).collect();
            self.resources.stats.set_entry_count(0);
            removed
        };
        tracing::info!("Cleared cache ({} entries)", removed.len());
        self.release_entries(removed, false);
    }

    /// Forget `name` as a dependent; the entry goes away with its last name.
    /// Returns whether an entry was invalidated.
    pub fn drop_name(&self, name: &str) -> bool {
        let removed = {
            let mut entries = self.entries.write();
            let mut orphaned = Vec::new();
            for (key, entry) in entries.iter_mut() {
                if entry.dependents.remove(name) && entry.dependents.is_empty() {
                    orphaned.push(key.clone());
                }
            }
            let mut removed = Vec::new();
            for key in orphaned {
                removed.extend(Self::remove_cascade(&mut entries, &key));
            }
            self.resources.stats.set_entry_count(entries.len() as u64);
            removed
        };
        if removed.is_empty() {
            return false;
        }
        tracing::info!("Dropped {}, invalidated {} entries", name, removed.len());
        self.release_entries(removed, false);
        true
    }

    /// Uncache every entry whose plan scans `table_name`. Returns the number
    /// of entries removed.
    pub fn invalidate_table(&self, table_name: &str) -> usize {
        let removed = {
            let mut entries = self.entries.write();
            let stale: Vec<LogicalPlanKey> = entries
                .iter()
                .filter(|(_, entry)| entry.plan().references_table(table_name))
                .map(|(key, _)| key.clone())
                .collect();
            let mut removed = Vec::new();
            for key in stale {
                removed.extend(Self::remove_cascade(&mut entries, &key));
            }
            self.resources.stats.set_entry_count(entries.len() as u64);
            removed
        };
        let count = removed.len();
        if count > 0 {
            tracing::info!("Invalidated {} entries reading {}", count, table_name);
        }
        self.release_entries(removed, false);
        count
    }

    /// Drop the entry cached for `name` and cache the name's current plan
    /// again, lazily, with the same names and storage level
    pub fn refresh_table(
        &self,
        catalog: &Catalog,
        name: &str,
        executor: &dyn PlanExecutor,
    ) -> Result<Arc<MaterializedPartitionSet>> {
        let (removed, dependents, storage_level) = {
            let mut entries = self.entries.write();
            let key = Self::find_key(&entries, catalog, name)
                .ok_or_else(|| QueryError::NotCached(name.to_string()))?;
            let (dependents, storage_level) = entries
                .get(&key)
                .map(|entry| (entry.dependents.clone(), entry.partition_set.storage_level()))
                .unwrap_or_else(|| (BTreeSet::new(), self.config.default_storage_level));
            let removed = Self::remove_cascade(&mut entries, &key);
            self.resources.stats.set_entry_count(entries.len() as u64);
            (removed, dependents, storage_level)
        };
        self.release_entries(removed, true);

        let plan = catalog.resolve(name)?;
        let set = self.insert(plan, Some(name), storage_level, false, executor)?;
        for dependent in dependents.iter().filter(|d| d.as_str() != name) {
            self.add_dependent(set.key(), Some(dependent));
        }
        tracing::info!("Refreshed {} as {}", name, set.id());
        Ok(set)
    }

    /// Snapshot of every entry, ordered by first name
    pub fn entries(&self) -> Vec<CachedEntryInfo> {
        let mut infos: Vec<CachedEntryInfo> =
            self.entries.read().values().map(Self::info).collect();
        infos.sort_by(|a, b| {
            a.names
                .cmp(&b.names)
                .then_with(|| a.key.canonical().cmp(b.key.canonical()))
        });
        infos
    }

    /// Entry registered for `plan`, whether or not the cache is serving reads
    pub fn entry_info(&self, plan: &LogicalPlan) -> Option<CachedEntryInfo> {
        self.entries.read().get(&fingerprint(plan)).map(Self::info)
    }

    fn info(entry: &CacheEntry) -> CachedEntryInfo {
        let set = &entry.partition_set;
        CachedEntryInfo {
            id: set.id(),
            key: entry.key.clone(),
            names: entry.dependents.iter().cloned().collect(),
            storage_level: set.storage_level(),
            partitioning: set.output_partitioning(),
            materialized: set.is_materialized(),
            size_in_bytes: set.size_in_bytes(),
            num_partitions: set.num_partitions(),
        }
    }

    /// Key of the entry for `name`: its current plan, else any entry that
    /// lists it as a dependent
    fn find_key(
        entries: &HashMap<LogicalPlanKey, CacheEntry>,
        catalog: &Catalog,
        name: &str,
    ) -> Option<LogicalPlanKey> {
        catalog
            .resolve(name)
            .ok()
            .map(|plan| fingerprint(&plan))
            .filter(|key| entries.contains_key(key))
            .or_else(|| {
                entries
                    .values()
                    .find(|entry| entry.dependents.contains(name))
                    .map(|entry| entry.key.clone())
            })
    }

    /// Remove `key` and, transitively, every entry whose plan contains a
    /// removed plan
    fn remove_cascade(
        entries: &mut HashMap<LogicalPlanKey, CacheEntry>,
        key: &LogicalPlanKey,
    ) -> Vec<CacheEntry> {
        let mut removed = Vec::new();
        let mut pending = vec![key.clone()];
        while let Some(key) = pending.pop() {
            let Some(entry) = entries.remove(&key) else {
                continue;
            };
            let derived = entries
                .iter()
                .filter(|(_, other)| subtree_keys(other.plan()).contains(&key))
                .map(|(k, _)| k.clone());
            pending.extend(derived);
            removed.push(entry);
        }
        removed
    }

    fn release_entries(&self, removed: Vec<CacheEntry>, blocking: bool) {
        for entry in removed {
            let set = &entry.partition_set;
            let bytes = set.release(blocking);
            let memory = if set.storage_level().uses_memory() { bytes } else { 0 };
            self.resources.accumulators.release_owner(set.id());
            self.resources.stats.record_invalidation(memory);
            tracing::debug!("Released {} ({} bytes)", set.id(), bytes);
        }
    }
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::record_batch::RecordBatch;
    use query_core::{DataType, Field, Partition, Schema, SortKey};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Executes every plan as one partition of two rows
    #[derive(Default)]
    struct SingleExecutor {
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    impl PlanExecutor for SingleExecutor {
        fn output_properties(
            &self,
            _plan: &LogicalPlan,
            _populating: &LogicalPlanKey,
        ) -> Result<(Partitioning, Vec<SortKey>)> {
            Ok((Partitioning::Single, vec![]))
        }

        fn execute_partitions(
            &self,
            plan: &LogicalPlan,
            _populating: &LogicalPlanKey,
            _partitioning: &Partitioning,
        ) -> Result<Vec<Partition>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(QueryError::ExecutionError("boom".into()));
            }
            let batch = RecordBatch::try_new(
                plan.schema().to_arrow_ref(),
                vec![Arc::new(Int64Array::from(vec![1, 2]))],
            )
            .unwrap();
            Ok(vec![Partition::with_batches(0, vec![batch])])
        }
    }

    fn catalog() -> Catalog {
        let catalog = Catalog::new();
        catalog.register_table(
            "t",
            Schema::new(vec![Field::new("a", DataType::Int64, false)]),
        );
        catalog.register_table(
            "u",
            Schema::new(vec![Field::new("a", DataType::Int64, false)]),
        );
        catalog
    }

    fn limit_over(plan: LogicalPlan) -> LogicalPlan {
        LogicalPlan::Limit {
            input: Arc::new(plan),
            skip: 0,
            fetch: Some(1),
        }
    }

    #[test]
    fn test_cache_table_is_idempotent() {
        let catalog = catalog();
        let manager = CacheManager::with_defaults();
        let executor = SingleExecutor::default();

        let first = manager
            .cache_table(&catalog, "t", StorageLevel::MemoryOnly, false, &executor)
            .unwrap();
        let second = manager
            .cache_table(&catalog, "t", StorageLevel::MemoryOnly, false, &executor)
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.len(), 1);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
        assert!(manager.is_cached(&catalog, "t"));
        assert!(!manager.is_cached(&catalog, "u"));
    }

    #[test]
    fn test_eager_cache_materializes() {
        let catalog = catalog();
        let manager = CacheManager::with_defaults();
        let executor = SingleExecutor::default();

        let set = manager
            .cache_table(&catalog, "t", StorageLevel::MemoryOnly, true, &executor)
            .unwrap();

        assert!(set.is_materialized());
        assert_eq!(set.size_in_bytes(), Some(16));
        assert_eq!(manager.stats().memory_bytes(), 16);
        assert_eq!(manager.block_store().len(), 1);
    }

    #[test]
    fn test_disk_only_is_not_memory() {
        let catalog = catalog();
        let manager = CacheManager::with_defaults();
        let executor = SingleExecutor::default();

        let set = manager
            .cache_table(&catalog, "t", StorageLevel::DiskOnly, true, &executor)
            .unwrap();

        assert_eq!(set.size_in_bytes(), Some(16));
        assert_eq!(manager.stats().memory_bytes(), 0);
        assert_eq!(manager.block_store().disk_bytes(), 16);

        manager.uncache_table(&catalog, "t").unwrap();
        assert_eq!(manager.stats().memory_bytes(), 0);
        assert_eq!(manager.stats().invalidations(), 1);
    }

    #[test]
    fn test_eager_failure_removes_entry() {
        let catalog = catalog();
        let manager = CacheManager::with_defaults();
        let executor = SingleExecutor::default();
        executor.fail.store(true, Ordering::SeqCst);

        let err = manager
            .cache_table(&catalog, "t", StorageLevel::MemoryOnly, true, &executor)
            .unwrap_err();

        assert!(err.is_materialization_failure());
        assert!(manager.is_empty());
        assert!(!manager.is_cached(&catalog, "t"));
        assert!(manager.accumulators().is_empty());
    }

    #[test]
    fn test_uncache_twice_reports_not_cached() {
        let catalog = catalog();
        let manager = CacheManager::with_defaults();
        let executor = SingleExecutor::default();
        let set = manager
            .cache_table(&catalog, "t", StorageLevel::MemoryOnly, true, &executor)
            .unwrap();

        manager.uncache_table(&catalog, "t").unwrap();
        assert!(manager.lookup(&catalog.resolve("t").unwrap()).is_none());
        assert!(set.is_released());
        assert_eq!(manager.accumulators().count_for(set.id()), 0);
        assert_eq!(manager.stats().memory_bytes(), 0);

        let err = manager.uncache_table(&catalog, "t").unwrap_err();
        assert!(matches!(err, QueryError::NotCached(name) if name == "t"));
    }

    #[test]
    fn test_uncache_cascades_to_derived() {
        let catalog = catalog();
        let manager = CacheManager::with_defaults();
        let executor = SingleExecutor::default();
        let base = catalog.resolve("t").unwrap();

        manager
            .cache_table(&catalog, "t", StorageLevel::MemoryOnly, false, &executor)
            .unwrap();
        manager
            .cache_query(limit_over(base.clone()), Some("top"), StorageLevel::MemoryOnly, false, &executor)
            .unwrap();
        manager
            .cache_table(&catalog, "u", StorageLevel::MemoryOnly, false, &executor)
            .unwrap();

        manager.uncache_table(&catalog, "t").unwrap();

        assert!(manager.lookup(&limit_over(base)).is_none());
        assert!(manager.is_cached(&catalog, "u"));
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.stats().invalidations(), 2);
    }

    #[test]
    fn test_drop_name_keeps_entry_with_other_names() {
        let catalog = catalog();
        let manager = CacheManager::with_defaults();
        let executor = SingleExecutor::default();
        let plan = catalog.resolve("t").unwrap();

        manager
            .cache_query(plan.clone(), Some("a"), StorageLevel::MemoryOnly, false, &executor)
            .unwrap();
        manager
            .cache_query(plan.clone(), Some("b"), StorageLevel::MemoryOnly, false, &executor)
            .unwrap();

        assert!(!manager.drop_name("unrelated"));
        assert!(!manager.drop_name("a"));
        assert!(manager.lookup(&plan).is_some());
        assert!(manager.drop_name("b"));
        assert!(manager.lookup(&plan).is_none());
    }

    #[test]
    fn test_invalidate_table() {
        let catalog = catalog();
        let manager = CacheManager::with_defaults();
        let executor = SingleExecutor::default();
        manager
            .cache_query(
                limit_over(catalog.resolve("t").unwrap()),
                None,
                StorageLevel::MemoryOnly,
                false,
                &executor,
            )
            .unwrap();
        manager
            .cache_table(&catalog, "u", StorageLevel::MemoryOnly, false, &executor)
            .unwrap();

        assert_eq!(manager.invalidate_table("missing"), 0);
        assert_eq!(manager.invalidate_table("t"), 1);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_refresh_keeps_names_and_level() {
        let catalog = catalog();
        let manager = CacheManager::with_defaults();
        let executor = SingleExecutor::default();
        let plan = catalog.resolve("t").unwrap();
        let old = manager
            .cache_query(plan.clone(), Some("t"), StorageLevel::DiskOnly, true, &executor)
            .unwrap();
        manager
            .cache_query(plan, Some("alias"), StorageLevel::DiskOnly, false, &executor)
            .unwrap();

        let new = manager.refresh_table(&catalog, "t", &executor).unwrap();

        assert!(old.is_released());
        assert!(!new.is_materialized());
        let infos = manager.entries();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].names, vec!["alias".to_string(), "t".to_string()]);
        assert_eq!(infos[0].storage_level, StorageLevel::DiskOnly);
    }

    #[test]
    fn test_disabled_cache_misses() {
        let catalog = catalog();
        let manager = CacheManager::new(CacheConfig::disabled());
        let executor = SingleExecutor::default();
        manager
            .cache_table(&catalog, "t", StorageLevel::MemoryOnly, false, &executor)
            .unwrap();

        assert!(manager.is_cached(&catalog, "t"));
        assert!(manager.lookup(&catalog.resolve("t").unwrap()).is_none());
    }

    #[test]
    fn test_clear_all_releases_everything() {
        let catalog = catalog();
        let manager = CacheManager::with_defaults();
        let executor = SingleExecutor::default();
        for name in ["t", "u"] {
            manager
                .cache_table(&catalog, name, StorageLevel::MemoryOnly, true, &executor)
                .unwrap();
        }
        assert_eq!(manager.block_store().len(), 2);

        manager.clear_all();

        assert!(manager.is_empty());
        assert!(manager.block_store().is_empty());
        assert!(manager.accumulators().is_empty());
        assert_eq!(manager.stats().entry_count(), 0);
    }
}
