//! Seams between logical plans, cached data and execution

use crate::fingerprint::LogicalPlanKey;
use crate::logical_plan::LogicalPlan;
use query_core::{Partition, Partitioning, Result, Schema, SortKey};
use std::fmt::Debug;
use std::sync::Arc;

/// A materialization that can stand in for the plan it was computed from
pub trait CachedRelation: Debug + Send + Sync {
    /// Fingerprint of the plan this relation materializes
    fn key(&self) -> &LogicalPlanKey;

    /// The plan this relation materializes
    fn plan(&self) -> &LogicalPlan;

    fn schema(&self) -> &Schema;

    fn output_partitioning(&self) -> Partitioning;

    fn output_ordering(&self) -> Vec<SortKey>;

    /// Estimated size of the stored data, known once materialized
    fn size_in_bytes(&self) -> Option<u64>;

    fn is_materialized(&self) -> bool;

    /// Read all partitions, computing them through `executor` on first use
    fn scan(&self, executor: &dyn PlanExecutor) -> Result<Arc<[Partition]>>;
}

/// Physical compilation and execution of logical plans
///
/// The cache never executes plans itself; it is handed an executor for every
/// operation that needs one.
pub trait PlanExecutor: Send + Sync {
    /// Partitioning and ordering the compiled plan will produce
    fn output_properties(
        &self,
        plan: &LogicalPlan,
        populating: &LogicalPlanKey,
    ) -> Result<(Partitioning, Vec<SortKey>)>;

    /// Execute `plan` to populate the cache entry `populating`, laid out as
    /// `partitioning`.
    ///
    /// The entry being populated must not be read while computing it.
    fn execute_partitions(
        &self,
        plan: &LogicalPlan,
        populating: &LogicalPlanKey,
        partitioning: &Partitioning,
    ) -> Result<Vec<Partition>>;
}
