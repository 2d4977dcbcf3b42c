//! Engine context tying the catalog, the cache and the executor together

use crate::dataset::Dataset;
use crate::statement::CacheStatement;
use arrow::record_batch::RecordBatch;
use query_cache::{
    CacheConfig, CacheInvalidator, CacheManager, InvalidationEvent, MaterializedPartitionSet,
};
use query_core::{QueryError, Result};
use query_executor::{DataSource, QueryExecutor};
use query_planner::{Catalog, LogicalPlan};
use std::sync::Arc;
use tracing::{info, warn};

/// One engine context. The cache it owns is never shared with another
/// session.
#[derive(Debug)]
pub struct Session {
    catalog: Catalog,
    cache: Arc<CacheManager>,
    executor: QueryExecutor,
}

impl Session {
    pub fn new() -> Self {
        Self::from_manager(CacheManager::with_defaults())
    }

    pub fn with_config(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_manager(CacheManager::new(config)))
    }

    fn from_manager(manager: CacheManager) -> Self {
        let cache = Arc::new(manager);
        Self {
            catalog: Catalog::new(),
            executor: QueryExecutor::new(cache.clone()),
            cache,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn cache_manager(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn executor(&self) -> &QueryExecutor {
        &self.executor
    }

    /// Make `source` queryable as `name`
    pub fn register_table(&self, name: &str, source: Arc<dyn DataSource>) {
        self.catalog.register_table(name, source.schema().clone());
        self.executor.register_table(name, source);
    }

    /// Replace the data behind an existing table. Cached plans reading it are
    /// invalidated; returns how many.
    pub fn update_table(&self, name: &str, source: Arc<dyn DataSource>) -> Result<usize> {
        if self.catalog.table_schema(name).is_none() {
            return Err(QueryError::TableNotFound(name.to_string()));
        }
        self.register_table(name, source);
        Ok(self
            .cache
            .handle(&InvalidationEvent::table_modified(name)))
    }

    pub fn drop_table(&self, name: &str) -> Result<()> {
        if !self.catalog.deregister_table(name) {
            return Err(QueryError::TableNotFound(name.to_string()));
        }
        self.executor.deregister_table(name);
        self.cache.handle(&InvalidationEvent::table_dropped(name));
        for view in self.catalog.views_referencing(name) {
            warn!("View {} still reads dropped table {}", view, name);
        }
        Ok(())
    }

    pub fn register_view(&self, name: &str, plan: LogicalPlan, replace: bool) -> Result<()> {
        self.catalog.register_view(name, plan, replace)
    }

    /// Drop a temporary view; the cache entry goes with its last name
    pub fn drop_view(&self, name: &str) -> bool {
        let dropped = self.catalog.drop_view(name);
        if dropped {
            self.cache.drop_name(name);
        }
        dropped
    }

    pub fn table(&self, name: &str) -> Result<Dataset<'_>> {
        Ok(Dataset::new(self, self.catalog.resolve(name)?))
    }

    pub fn dataset(&self, plan: LogicalPlan) -> Dataset<'_> {
        Dataset::new(self, plan)
    }

    pub fn execute(&self, plan: &LogicalPlan) -> Result<Vec<RecordBatch>> {
        self.executor.execute(plan)
    }

    pub fn execute_statement(&self, statement: CacheStatement) -> Result<()> {
        info!("{}", statement);
        match statement {
            CacheStatement::CacheTable {
                name,
                lazy,
                query,
                storage_level,
            } => {
                let level =
                    storage_level.unwrap_or(self.cache.config().default_storage_level);
                match query {
                    Some(query) => {
                        self.catalog.register_view(name.as_str(), query.clone(), false)?;
                        if let Err(e) =
                            self.cache
                                .cache_query(query, Some(&name), level, !lazy, &self.executor)
                        {
                            // The view only exists for the cache entry; a retry must not
                            // find it registered.
                            self.catalog.drop_view(&name);
                            return Err(e);
                        }
                    }
                    None => {
                        self.cache
                            .cache_table(&self.catalog, &name, level, !lazy, &self.executor)?;
                    }
                }
                Ok(())
            }
            CacheStatement::UncacheTable { name, if_exists } => {
                match self.cache.uncache_table(&self.catalog, &name) {
                    Err(QueryError::NotCached(_)) if if_exists => Ok(()),
                    other => other,
                }
            }
            CacheStatement::ClearCache => {
                self.cache.clear_all();
                Ok(())
            }
        }
    }

    pub fn is_cached(&self, name: &str) -> bool {
        self.cache.is_cached(&self.catalog, name)
    }

    /// Re-cache `name` lazily from its current plan and data
    pub fn refresh_table(&self, name: &str) -> Result<Arc<MaterializedPartitionSet>> {
        self.cache.refresh_table(&self.catalog, name, &self.executor)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
