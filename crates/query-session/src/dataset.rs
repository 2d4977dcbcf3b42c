use crate::session::Session;
use arrow::record_batch::RecordBatch;
use query_cache::StorageLevel;
use query_core::{Result, Schema};
use query_executor::PhysicalPlan;
use query_planner::{Expr, JoinType, LogicalPlan, LogicalPlanBuilder};
use std::sync::Arc;
use tracing::warn;

/// A logical plan bound to the session that runs it
#[derive(Debug, Clone)]
pub struct Dataset<'a> {
    session: &'a Session,
    plan: LogicalPlan,
}

impl<'a> Dataset<'a> {
    pub(crate) fn new(session: &'a Session, plan: LogicalPlan) -> Self {
        Self { session, plan }
    }

    pub fn plan(&self) -> &LogicalPlan {
        &self.plan
    }

    pub fn schema(&self) -> &Schema {
        self.plan.schema()
    }

    fn derive(
        &self,
        build: impl FnOnce(LogicalPlanBuilder) -> Result<LogicalPlanBuilder>,
    ) -> Result<Self> {
        let builder = build(LogicalPlanBuilder::from_plan(self.plan.clone()))?;
        Ok(Self::new(self.session, builder.build()))
    }

    pub fn filter(&self, predicate: Expr) -> Result<Self> {
        self.derive(|b| b.filter(predicate))
    }

    pub fn select(&self, exprs: Vec<Expr>) -> Result<Self> {
        self.derive(|b| b.project(exprs))
    }

    pub fn aggregate(&self, group_exprs: Vec<Expr>, aggr_exprs: Vec<Expr>) -> Result<Self> {
        self.derive(|b| b.aggregate(group_exprs, aggr_exprs))
    }

    pub fn join(
        &self,
        right: &Dataset<'_>,
        join_type: JoinType,
        left_keys: &[&str],
        right_keys: &[&str],
    ) -> Result<Self> {
        let right = right.plan.clone();
        self.derive(|b| b.join(right, join_type, left_keys, right_keys))
    }

    pub fn sort(&self, keys: Vec<(Expr, bool)>) -> Result<Self> {
        self.derive(|b| b.sort(keys))
    }

    pub fn limit(&self, fetch: usize) -> Result<Self> {
        self.derive(|b| b.limit(0, Some(fetch)))
    }

    /// Hash partition on `columns`, or round-robin when empty
    pub fn repartition(&self, num_partitions: usize, columns: &[&str]) -> Result<Self> {
        self.derive(|b| b.repartition(num_partitions, columns))
    }

    pub fn alias(&self, alias: &str) -> Result<Self> {
        self.derive(|b| b.alias(alias))
    }

    /// Cache lazily at the configured default storage level
    pub fn cache(&self) -> Result<&Self> {
        let level = self.session.cache_manager().config().default_storage_level;
        self.persist(level)
    }

    /// Cache lazily at `level`. A dataset that is already cached keeps its
    /// existing storage level.
    pub fn persist(&self, level: StorageLevel) -> Result<&Self> {
        let cache = self.session.cache_manager();
        if let Some(existing) = cache.entry_info(&self.plan) {
            if existing.storage_level != level {
                warn!(
                    "Dataset already cached as {} at {}; ignoring {}",
                    existing.id, existing.storage_level, level
                );
            }
            return Ok(self);
        }
        cache.cache_query(
            self.plan.clone(),
            None,
            level,
            false,
            self.session.executor(),
        )?;
        Ok(self)
    }

    /// Drop this dataset's cache entry and everything derived from it.
    /// With `blocking`, waits for an in-flight materialization to settle.
    pub fn unpersist(&self, blocking: bool) -> &Self {
        self.session
            .cache_manager()
            .uncache_query(&self.plan, blocking);
        self
    }

    pub fn is_cached(&self) -> bool {
        self.session
            .cache_manager()
            .entry_info(&self.plan)
            .is_some()
    }

    pub fn storage_level(&self) -> Option<StorageLevel> {
        self.session
            .cache_manager()
            .entry_info(&self.plan)
            .map(|info| info.storage_level)
    }

    /// Physical plan this dataset would run with, after cache substitution
    pub fn physical_plan(&self) -> Result<Arc<PhysicalPlan>> {
        self.session.executor().create_physical_plan(&self.plan)
    }

    pub fn collect(&self) -> Result<Vec<RecordBatch>> {
        self.session.execute(&self.plan)
    }

    pub fn count(&self) -> Result<usize> {
        Ok(self.collect()?.iter().map(|b| b.num_rows()).sum())
    }
}
