//! Row redistribution for exchanges

use crate::operators::evaluate_expr;
use crate::physical_plan::PhysicalExpr;
use ahash::RandomState;
use arrow::array::*;
use arrow::array::AsArray;
use arrow::datatypes::{
    DataType as ArrowDataType, Date32Type, Date64Type, Float32Type, Float64Type, Int16Type,
    Int32Type, Int64Type, Int8Type, UInt16Type, UInt32Type, UInt64Type, UInt8Type,
};
use arrow::record_batch::RecordBatch;
use query_core::{Partition, Partitioning, QueryError, Result};
use std::hash::{BuildHasher, Hash, Hasher};

/// Fixed seeds so every exchange in the process places equal keys alike
const SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

/// Distributes rows according to a [`Partitioning`]
#[derive(Debug, Clone)]
pub struct Partitioner {
    partitioning: Partitioning,
    keys: Vec<PhysicalExpr>,
    state: RandomState,
}

impl Partitioner {
    /// `keys` are evaluated per row for hash partitioning and ignored otherwise
    pub fn new(partitioning: Partitioning, keys: Vec<PhysicalExpr>) -> Self {
        Self {
            partitioning,
            keys,
            state: RandomState::with_seeds(SEEDS[0], SEEDS[1], SEEDS[2], SEEDS[3]),
        }
    }

    pub fn num_partitions(&self) -> usize {
        self.partitioning.num_partitions()
    }

    pub fn partition(&self, input: Vec<Partition>) -> Result<Vec<Partition>> {
        let batches = input.into_iter().flat_map(|p| p.batches);
        match &self.partitioning {
            Partitioning::Single => {
                let mut partition = Partition::new(0);
                for batch in batches {
                    partition.add_batch(batch);
                }
                Ok(vec![partition])
            }
            Partitioning::RoundRobin { num_partitions } => {
                let mut partitions: Vec<Partition> =
                    (0..*num_partitions).map(Partition::new).collect();
                for (batch_idx, batch) in batches.enumerate() {
                    partitions[batch_idx % num_partitions].add_batch(batch);
                }
                Ok(partitions)
            }
            Partitioning::Hash { num_partitions, .. } => {
                let mut partitions: Vec<Partition> =
                    (0..*num_partitions).map(Partition::new).collect();
                for batch in batches {
                    self.hash_batch(&batch, *num_partitions, &mut partitions)?;
                }
                Ok(partitions)
            }
        }
    }

    fn hash_batch(
        &self,
        batch: &RecordBatch,
        num_partitions: usize,
        partitions: &mut [Partition],
    ) -> Result<()> {
        if self.keys.is_empty() {
            return Err(QueryError::ExecutionError(
                "hash exchange without key expressions".to_string(),
            ));
        }
        let key_arrays = self
            .keys
            .iter()
            .map(|key| evaluate_expr(key, batch))
            .collect::<Result<Vec<_>>>()?;

        let mut assignments: Vec<Vec<u32>> = vec![Vec::new(); num_partitions];
        for row in 0..batch.num_rows() {
            let hash = self.row_hash(&key_arrays, row)?;
            assignments[(hash % num_partitions as u64) as usize].push(row as u32);
        }

        for (partition_idx, rows) in assignments.into_iter().enumerate() {
            if rows.is_empty() {
                continue;
            }
            let indices = UInt32Array::from(rows);
            let columns = batch
                .columns()
                .iter()
                .map(|col| arrow::compute::take(col.as_ref(), &indices, None))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            partitions[partition_idx].add_batch(RecordBatch::try_new(batch.schema(), columns)?);
        }
        Ok(())
    }

    /// Hash of one row's key values. Integers hash by value regardless of
    /// width so differently typed join keys still meet.
    pub fn row_hash(&self, columns: &[ArrayRef], row: usize) -> Result<u64> {
        let mut hasher = self.state.build_hasher();
        for column in columns {
            hash_value(column, row, &mut hasher)?;
        }
        Ok(hasher.finish())
    }
}

fn hash_value(column: &ArrayRef, row: usize, hasher: &mut impl Hasher) -> Result<()> {
    if column.is_null(row) {
        0u8.hash(hasher);
        return Ok(());
    }
    1u8.hash(hasher);
    match column.data_type() {
        ArrowDataType::Boolean => column.as_boolean().value(row).hash(hasher),
        ArrowDataType::Int8 => (column.as_primitive::<Int8Type>().value(row) as i64).hash(hasher),
        ArrowDataType::Int16 => (column.as_primitive::<Int16Type>().value(row) as i64).hash(hasher),
        ArrowDataType::Int32 => (column.as_primitive::<Int32Type>().value(row) as i64).hash(hasher),
        ArrowDataType::Int64 => column.as_primitive::<Int64Type>().value(row).hash(hasher),
        ArrowDataType::UInt8 => (column.as_primitive::<UInt8Type>().value(row) as i64).hash(hasher),
        ArrowDataType::UInt16 => {
            (column.as_primitive::<UInt16Type>().value(row) as i64).hash(hasher)
        }
        ArrowDataType::UInt32 => {
            (column.as_primitive::<UInt32Type>().value(row) as i64).hash(hasher)
        }
        ArrowDataType::UInt64 => {
            (column.as_primitive::<UInt64Type>().value(row) as i64).hash(hasher)
        }
        ArrowDataType::Float32 => {
            float_bits(column.as_primitive::<Float32Type>().value(row) as f64).hash(hasher)
        }
        ArrowDataType::Float64 => {
            float_bits(column.as_primitive::<Float64Type>().value(row)).hash(hasher)
        }
        ArrowDataType::Date32 => {
            (column.as_primitive::<Date32Type>().value(row) as i64).hash(hasher)
        }
        ArrowDataType::Date64 => column.as_primitive::<Date64Type>().value(row).hash(hasher),
        ArrowDataType::Utf8 => column.as_string::<i32>().value(row).hash(hasher),
        ArrowDataType::LargeUtf8 => column.as_string::<i64>().value(row).hash(hasher),
        ArrowDataType::Binary => column.as_binary::<i32>().value(row).hash(hasher),
        ArrowDataType::LargeBinary => column.as_binary::<i64>().value(row).hash(hasher),
        other => {
            return Err(QueryError::ExecutionError(format!(
                "cannot hash values of type {}",
                other
            )))
        }
    }
    Ok(())
}

/// Bit pattern with both zeros folded together
fn float_bits(v: f64) -> u64 {
    if v == 0.0 {
        0
    } else {
        v.to_bits()
    }
}
