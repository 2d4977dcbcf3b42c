//! Physical leaf over a cached materialization

use query_core::{Partition, Partitioning, Result, Schema, SortKey};
use query_planner::{CachedRelation, LogicalPlanKey, PlanExecutor};
use std::sync::Arc;

/// Reads the partitions of a cached relation.
///
/// Partitioning and ordering are reported exactly as stored, which is what
/// lets the exchange planner skip shuffles over cached data. Every scan of
/// the same relation sees the same immutable partitions.
#[derive(Debug, Clone)]
pub struct CachedScanNode {
    relation: Arc<dyn CachedRelation>,
    scan_id: usize,
}

impl CachedScanNode {
    pub fn new(relation: Arc<dyn CachedRelation>, scan_id: usize) -> Self {
        Self { relation, scan_id }
    }

    pub fn relation(&self) -> &Arc<dyn CachedRelation> {
        &self.relation
    }

    pub fn scan_id(&self) -> usize {
        self.scan_id
    }

    pub fn key(&self) -> &LogicalPlanKey {
        self.relation.key()
    }

    pub fn schema(&self) -> &Schema {
        self.relation.schema()
    }

    pub fn output_partitioning(&self) -> Partitioning {
        self.relation.output_partitioning()
    }

    pub fn output_ordering(&self) -> Vec<SortKey> {
        self.relation.output_ordering()
    }

    pub fn size_in_bytes(&self) -> Option<u64> {
        self.relation.size_in_bytes()
    }

    /// Read every partition; the first read of a lazy relation computes it
    pub fn scan(&self, executor: &dyn PlanExecutor) -> Result<Arc<[Partition]>> {
        tracing::debug!("Cached scan #{} of {}", self.scan_id, self.relation.key());
        self.relation.scan(executor)
    }
}
