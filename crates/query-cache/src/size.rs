//! Size statistics for materialized data
//!
//! Sizes are computed from row contents, not from Arrow buffer capacity, so
//! they are stable across batch layouts: each row contributes the fixed width
//! of every fixed-size column (nulls included) plus `4 + len` for every
//! variable-length value. A null variable-length value contributes only its
//! 4-byte offset.

use arrow::array::{Array, ArrayRef, AsArray};
use arrow::datatypes::DataType as ArrowDataType;
use arrow::record_batch::RecordBatch;
use query_core::{DataType, Partition};

const OFFSET_WIDTH: u64 = 4;

/// Estimated size of a set of partitions
pub fn estimate_partitions_size(partitions: &[Partition]) -> u64 {
    partitions.iter().map(estimate_partition_size).sum()
}

pub fn estimate_partition_size(partition: &Partition) -> u64 {
    partition.batches.iter().map(estimate_batch_size).sum()
}

pub fn estimate_batch_size(batch: &RecordBatch) -> u64 {
    batch.columns().iter().map(column_size).sum()
}

fn column_size(column: &ArrayRef) -> u64 {
    let rows = column.len() as u64;
    match column.data_type() {
        ArrowDataType::Utf8 => {
            variable_size(rows, column.as_string::<i32>().iter().map(|v| v.map(str::len)))
        }
        ArrowDataType::LargeUtf8 => {
            variable_size(rows, column.as_string::<i64>().iter().map(|v| v.map(str::len)))
        }
        ArrowDataType::Binary => {
            variable_size(rows, column.as_binary::<i32>().iter().map(|v| v.map(<[u8]>::len)))
        }
        ArrowDataType::LargeBinary => {
            variable_size(rows, column.as_binary::<i64>().iter().map(|v| v.map(<[u8]>::len)))
        }
        other => {
            let width = DataType::from_arrow(other)
                .fixed_width()
                .or_else(|| other.primitive_width())
                .unwrap_or(0);
            rows * width as u64
        }
    }
}

fn variable_size(rows: u64, lengths: impl Iterator<Item = Option<usize>>) -> u64 {
    let payload: u64 = lengths.map(|len| len.unwrap_or(0) as u64).sum();
    rows * OFFSET_WIDTH + payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{BinaryArray, Int32Array, Int64Array, StringArray};
    use arrow::datatypes::{Field, Schema};
    use std::sync::Arc;

    #[test]
    fn test_fixed_width_counts_nulls() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("a", ArrowDataType::Int64, true),
            Field::new("b", ArrowDataType::Int32, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![Some(1), None, Some(3)])),
                Arc::new(Int32Array::from(vec![None, None, Some(1)])),
            ],
        )
        .unwrap();

        assert_eq!(estimate_batch_size(&batch), 3 * 8 + 3 * 4);
    }

    #[test]
    fn test_variable_width() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("s", ArrowDataType::Utf8, true),
            Field::new("b", ArrowDataType::Binary, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec![Some("abc"), None, Some("")])),
                Arc::new(BinaryArray::from(vec![Some(&b"xy"[..]), Some(&b"z"[..]), None])),
            ],
        )
        .unwrap();

        // strings: 3 offsets + 3 bytes, binary: 3 offsets + 3 bytes
        assert_eq!(estimate_batch_size(&batch), (12 + 3) + (12 + 3));
    }

    #[test]
    fn test_partitions_sum() {
        let schema = Arc::new(Schema::new(vec![Field::new(
            "a",
            ArrowDataType::Int64,
            false,
        )]));
        let batch =
            RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![1, 2]))]).unwrap();
        let partitions = vec![
            Partition::with_batches(0, vec![batch.clone()]),
            Partition::with_batches(1, vec![batch.clone(), batch]),
            Partition::new(2),
        ];

        assert_eq!(estimate_partitions_size(&partitions), 16 + 32);
    }
}
