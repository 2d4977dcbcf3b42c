//! Plan-keyed cache of materialized query results
//!
//! This crate keeps the partitions a query plan produced so that later
//! queries containing an equivalent plan can read them instead of
//! recomputing.
//!
//! # Features
//!
//! - **Plan fingerprints**: entries are keyed by the canonical form of the
//!   resolved plan, not by query text
//! - **Eager and lazy materialization**: lazy entries are computed once, by
//!   the first reader, even under concurrent first reads
//! - **Physical layout**: partitioning and ordering are kept with the data
//! - **Storage levels**: memory or Arrow IPC files on disk
//! - **Invalidation**: uncache, table changes and name drops cascade to
//!   derived entries
//!
//! # Example
//!
//! ```ignore
//! use query_cache::{CacheManager, StorageLevel};
//!
//! let manager = CacheManager::with_defaults();
//! manager.cache_table(&catalog, "orders", StorageLevel::MemoryOnly, true, &executor)?;
//! assert!(manager.is_cached(&catalog, "orders"));
//! manager.uncache_table(&catalog, "orders")?;
//! ```

pub mod accumulator;
pub mod config;
pub mod invalidation;
pub mod manager;
pub mod partition_set;
pub mod size;
pub mod stats;
pub mod storage;

pub use accumulator::{AccumulatorHandle, AccumulatorRegistry, EntryAccumulators};
pub use config::CacheConfig;
pub use invalidation::{CacheInvalidator, InvalidationEvent};
pub use manager::{CacheEntry, CacheManager, CachedEntryInfo};
pub use partition_set::{CacheResources, MaterializedData, MaterializedPartitionSet};
pub use size::{estimate_batch_size, estimate_partition_size, estimate_partitions_size};
pub use stats::CacheStats;
pub use storage::{BlockId, BlockInfo, BlockStore, EntryId, StorageLevel, StoredBlock};
