//! Counters attached to cache entries
//!
//! Every cache entry owns a few process-wide accumulators (rows, batches and
//! bytes materialized, reads served). They live in the engine's registry until
//! the entry is invalidated, at which point the registry drops them. Handles
//! held elsewhere keep working but are no longer reachable from the registry.

use crate::storage::EntryId;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct Accumulator {
    id: u64,
    name: String,
    owner: EntryId,
    value: AtomicU64,
}

/// Shared handle to a registered accumulator
#[derive(Debug, Clone)]
pub struct AccumulatorHandle {
    inner: Arc<Accumulator>,
}

impl AccumulatorHandle {
    pub fn add(&self, delta: u64) {
        self.inner.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.inner.value.load(Ordering::Relaxed)
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn owner(&self) -> EntryId {
        self.inner.owner
    }
}

/// Registry of accumulators, scoped to cache entries
#[derive(Debug, Default)]
pub struct AccumulatorRegistry {
    accumulators: DashMap<u64, Arc<Accumulator>>,
    next_id: AtomicU64,
}

impl AccumulatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new zeroed accumulator owned by `owner`
    pub fn register(&self, owner: EntryId, name: impl Into<String>) -> AccumulatorHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new(Accumulator {
            id,
            name: name.into(),
            owner,
            value: AtomicU64::new(0),
        });
        self.accumulators.insert(id, inner.clone());
        AccumulatorHandle { inner }
    }

    /// Drop every accumulator owned by `owner`; returns how many were removed
    pub fn release_owner(&self, owner: EntryId) -> usize {
        let before = self.accumulators.len();
        self.accumulators.retain(|_, acc| acc.owner != owner);
        let released = before.saturating_sub(self.accumulators.len());
        if released > 0 {
            tracing::debug!("Released {} accumulators of {}", released, owner);
        }
        released
    }

    pub fn contains(&self, id: u64) -> bool {
        self.accumulators.contains_key(&id)
    }

    /// Number of accumulators owned by `owner`
    pub fn count_for(&self, owner: EntryId) -> usize {
        self.accumulators
            .iter()
            .filter(|item| item.value().owner == owner)
            .count()
    }

    pub fn len(&self) -> usize {
        self.accumulators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accumulators.is_empty()
    }
}

/// The accumulators every cache entry carries
#[derive(Debug, Clone)]
pub struct EntryAccumulators {
    pub rows: AccumulatorHandle,
    pub batches: AccumulatorHandle,
    pub bytes: AccumulatorHandle,
    pub reads: AccumulatorHandle,
}

impl EntryAccumulators {
    pub fn register(registry: &AccumulatorRegistry, owner: EntryId) -> Self {
        Self {
            rows: registry.register(owner, "rows_materialized"),
            batches: registry.register(owner, "batches_materialized"),
            bytes: registry.register(owner, "bytes_materialized"),
            reads: registry.register(owner, "reads"),
        }
    }
}
