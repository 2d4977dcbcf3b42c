//! Table data behind catalog names

use arrow::record_batch::RecordBatch;
use parking_lot::RwLock;
use query_core::{Partition, Partitioning, QueryError, Result, Schema};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

pub trait DataSource: Debug + Send + Sync {
    fn schema(&self) -> &Schema;

    /// Layout of the partitions returned by [`DataSource::scan`]
    fn partitioning(&self) -> Partitioning;

    fn scan(&self) -> Result<Vec<Partition>>;
}

/// In-memory table made of already partitioned record batches
#[derive(Debug, Clone)]
pub struct MemoryTable {
    schema: Schema,
    partitions: Vec<Vec<RecordBatch>>,
    partitioning: Partitioning,
}

impl MemoryTable {
    /// Single-partition table
    pub fn new(schema: Schema, batches: Vec<RecordBatch>) -> Self {
        Self {
            schema,
            partitions: vec![batches],
            partitioning: Partitioning::Single,
        }
    }

    /// Table whose partitions carry no key relationship
    pub fn partitioned(schema: Schema, partitions: Vec<Vec<RecordBatch>>) -> Result<Self> {
        let partitioning = match partitions.len() {
            0 => {
                return Err(QueryError::ExecutionError(
                    "a table needs at least one partition".to_string(),
                ))
            }
            1 => Partitioning::Single,
            n => Partitioning::RoundRobin { num_partitions: n },
        };
        Ok(Self {
            schema,
            partitions,
            partitioning,
        })
    }

    /// Declare how the existing partitions are laid out
    pub fn with_partitioning(mut self, partitioning: Partitioning) -> Result<Self> {
        if partitioning.num_partitions() != self.partitions.len() {
            return Err(QueryError::ExecutionError(format!(
                "{} does not describe {} partitions",
                partitioning,
                self.partitions.len()
            )));
        }
        self.partitioning = partitioning;
        Ok(self)
    }

    pub fn row_count(&self) -> usize {
        self.partitions
            .iter()
            .flatten()
            .map(|batch| batch.num_rows())
            .sum()
    }
}

impl DataSource for MemoryTable {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn partitioning(&self) -> Partitioning {
        self.partitioning.clone()
    }

    fn scan(&self) -> Result<Vec<Partition>> {
        Ok(self
            .partitions
            .iter()
            .enumerate()
            .map(|(index, batches)| Partition::with_batches(index, batches.clone()))
            .collect())
    }
}

/// Data sources by table name
#[derive(Debug, Default)]
pub struct SourceRegistry {
    sources: RwLock<HashMap<String, Arc<dyn DataSource>>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the data behind `name`
    pub fn register(&self, name: impl Into<String>, source: Arc<dyn DataSource>) {
        self.sources.write().insert(name.into(), source);
    }

    pub fn deregister(&self, name: &str) -> Option<Arc<dyn DataSource>> {
        self.sources.write().remove(name)
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn DataSource>> {
        self.sources
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| QueryError::TableNotFound(name.to_string()))
    }
}
