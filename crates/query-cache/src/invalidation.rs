//! Cache invalidation support
//!
//! Data changes are reported as [`InvalidationEvent`]s; anything implementing
//! [`CacheInvalidator`] drops the cached results they make stale.

use crate::manager::CacheManager;

/// Trait for components that drop cached results when data changes
pub trait CacheInvalidator: Send + Sync {
    /// Invalidate every cached result that reads `table_name`; returns the
    /// number of entries removed
    fn invalidate_table(&self, table_name: &str) -> usize;

    /// Invalidate all cached results
    fn invalidate_all(&self);

    fn is_enabled(&self) -> bool;

    /// Apply an event
    fn handle(&self, event: &InvalidationEvent) -> usize {
        match event.table_name() {
            Some(table_name) => self.invalidate_table(table_name),
            None => {
                self.invalidate_all();
                0
            }
        }
    }
}

/// Events that can trigger cache invalidation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationEvent {
    /// A table's data was modified (insert, update, delete)
    TableModified { table_name: String },
    /// A table was dropped
    TableDropped { table_name: String },
    SchemaChanged { table_name: String },
    InvalidateAll,
}

impl InvalidationEvent {
    pub fn table_modified(table_name: impl Into<String>) -> Self {
        Self::TableModified {
            table_name: table_name.into(),
        }
    }

    pub fn table_dropped(table_name: impl Into<String>) -> Self {
        Self::TableDropped {
            table_name: table_name.into(),
        }
    }

    pub fn schema_changed(table_name: impl Into<String>) -> Self {
        Self::SchemaChanged {
            table_name: table_name.into(),
        }
    }

    /// Table the event concerns, `None` for a global invalidation
    pub fn table_name(&self) -> Option<&str> {
        match self {
            Self::TableModified { table_name }
            | Self::TableDropped { table_name }
            | Self::SchemaChanged { table_name } => Some(table_name),
            Self::InvalidateAll => None,
        }
    }
}

impl CacheInvalidator for CacheManager {
    fn invalidate_table(&self, table_name: &str) -> usize {
        CacheManager::invalidate_table(self, table_name)
    }

    fn invalidate_all(&self) {
        self.clear_all();
    }

    fn is_enabled(&self) -> bool {
        CacheManager::is_enabled(self)
    }
}
