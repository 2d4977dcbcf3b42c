//! Cache statistics tracking

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics for cache performance monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Plan lookups answered from the cache
    hits: AtomicU64,
    /// Plan lookups with no cached match
    misses: AtomicU64,
    /// Completed materializations
    materializations: AtomicU64,
    /// Failed materializations
    materialization_failures: AtomicU64,
    /// Entries removed by uncache, invalidation or clear
    invalidations: AtomicU64,
    /// Current number of entries
    entry_count: AtomicU64,
    /// Bytes held by materialized entries
    memory_bytes: AtomicU64,
}

impl CacheStats {
    /// Create new cache statistics
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_materialization(&self, bytes: u64) {
        self.materializations.fetch_add(1, Ordering::Relaxed);
        self.memory_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_materialization_failure(&self) {
        self.materialization_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record a removed entry and the bytes it released
    pub fn record_invalidation(&self, released_bytes: u64) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .memory_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(released_bytes))
            });
    }

    pub fn set_entry_count(&self, count: u64) {
        self.entry_count.store(count, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn materializations(&self) -> u64 {
        self.materializations.load(Ordering::Relaxed)
    }

    pub fn materialization_failures(&self) -> u64 {
        self.materialization_failures.load(Ordering::Relaxed)
    }

    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count.load(Ordering::Relaxed)
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory_bytes.load(Ordering::Relaxed)
    }

    /// Calculate hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Reset lookup and lifecycle counters; gauges are left as they are
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.materializations.store(0, Ordering::Relaxed);
        self.materialization_failures.store(0, Ordering::Relaxed);
        self.invalidations.store(0, Ordering::Relaxed);
    }
}

impl Clone for CacheStats {
    fn clone(&self) -> Self {
        Self {
            hits: AtomicU64::new(self.hits()),
            misses: AtomicU64::new(self.misses()),
            materializations: AtomicU64::new(self.materializations()),
            materialization_failures: AtomicU64::new(self.materialization_failures()),
            invalidations: AtomicU64::new(self.invalidations()),
            entry_count: AtomicU64::new(self.entry_count()),
            memory_bytes: AtomicU64::new(self.memory_bytes()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats::new();
        assert_eq!(stats.hit_rate(), 0.0);

        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        stats.record_miss();

        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_memory_accounting() {
        let stats = CacheStats::new();
        stats.record_materialization(100);
        stats.record_materialization(50);
        assert_eq!(stats.memory_bytes(), 150);

        stats.record_invalidation(100);
        assert_eq!(stats.memory_bytes(), 50);
        stats.record_invalidation(500);
        assert_eq!(stats.memory_bytes(), 0);
        assert_eq!(stats.invalidations(), 2);
    }

    #[test]
    fn test_reset_keeps_gauges() {
        let stats = CacheStats::new();
        stats.record_hit();
        stats.record_materialization(10);
        stats.set_entry_count(3);

        stats.reset();

        assert_eq!(stats.hits(), 0);
        assert_eq!(stats.materializations(), 0);
        assert_eq!(stats.entry_count(), 3);
        assert_eq!(stats.memory_bytes(), 10);
    }

    #[test]
    fn test_clone() {
        let stats = CacheStats::new();
        stats.record_hit();
        stats.record_miss();

        let cloned = stats.clone();
        assert_eq!(cloned.hits(), 1);
        assert_eq!(cloned.misses(), 1);
    }
}
