use crate::physical_plan::{AggregateExpr, BinaryOp, PhysicalExpr, PhysicalSortExpr};
use ahash::RandomState;
use arrow::array::*;
use arrow::compute;
use arrow::compute::kernels::cmp::{eq, gt, gt_eq, lt, lt_eq, neq};
use arrow::compute::kernels::numeric::{add, div, mul, sub};
use arrow::compute::{SortColumn, SortOptions};
use arrow::datatypes::{DataType as ArrowDataType, Field as ArrowField, Schema as ArrowSchema};
use arrow::record_batch::RecordBatch;
use arrow::row::{RowConverter, SortField};
use query_core::{QueryError, Result};
use query_planner::{AggregateFunction, JoinType, ScalarValue};
use std::collections::HashMap;
use std::sync::Arc;

pub fn evaluate_expr(expr: &PhysicalExpr, batch: &RecordBatch) -> Result<ArrayRef> {
    match expr {
        PhysicalExpr::Column { index, .. } => {
            if *index >= batch.num_columns() {
                return Err(QueryError::ExecutionError(format!(
                    "Column index {} out of bounds",
                    index
                )));
            }
            Ok(batch.column(*index).clone())
        }
        PhysicalExpr::Literal(val) => Ok(create_literal_array(val, batch.num_rows())),
        PhysicalExpr::BinaryExpr { left, op, right } => {
            let left_array = evaluate_expr(left, batch)?;
            let right_array = evaluate_expr(right, batch)?;
            evaluate_binary_op(&left_array, *op, &right_array)
        }
        PhysicalExpr::Not(expr) => {
            let array = evaluate_expr(expr, batch)?;
            let bool_array = array.as_any().downcast_ref::<BooleanArray>().ok_or_else(|| {
                QueryError::ExecutionError("NOT operator requires boolean array".to_string())
            })?;
            Ok(Arc::new(compute::not(bool_array)?) as ArrayRef)
        }
        PhysicalExpr::Alias { expr, .. } => evaluate_expr(expr, batch),
    }
}

pub fn create_literal_array(val: &ScalarValue, size: usize) -> ArrayRef {
    match val {
        ScalarValue::Boolean(v) => Arc::new(BooleanArray::from(vec![*v; size])),
        ScalarValue::Int32(v) => Arc::new(Int32Array::from(vec![*v; size])),
        ScalarValue::Int64(v) => Arc::new(Int64Array::from(vec![*v; size])),
        ScalarValue::Float64(v) => Arc::new(Float64Array::from(vec![*v; size])),
        ScalarValue::Utf8(v) => Arc::new(StringArray::from(vec![v.as_deref(); size])),
        ScalarValue::Null => Arc::new(NullArray::new(size)),
    }
}

/// Build a column of `data_type` from one scalar per row
pub fn scalars_to_array(values: &[ScalarValue], data_type: &ArrowDataType) -> Result<ArrayRef> {
    if values.is_empty() {
        return Ok(new_empty_array(data_type));
    }
    let arrays = values
        .iter()
        .map(|value| compute::cast(&create_literal_array(value, 1), data_type))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let refs: Vec<&dyn Array> = arrays.iter().map(|a| a.as_ref()).collect();
    Ok(compute::concat(&refs)?)
}

fn is_float(data_type: &ArrowDataType) -> bool {
    matches!(
        data_type,
        ArrowDataType::Float16 | ArrowDataType::Float32 | ArrowDataType::Float64
    )
}

/// Bring mismatched numeric operands to a common type
fn coerce_numeric(left: &ArrayRef, right: &ArrayRef) -> Result<(ArrayRef, ArrayRef)> {
    if left.data_type() == right.data_type() {
        return Ok((left.clone(), right.clone()));
    }
    let target = if is_float(left.data_type()) || is_float(right.data_type()) {
        ArrowDataType::Float64
    } else if left.data_type().is_integer() && right.data_type().is_integer() {
        ArrowDataType::Int64
    } else if left.data_type() == &ArrowDataType::Null {
        right.data_type().clone()
    } else if right.data_type() == &ArrowDataType::Null {
        left.data_type().clone()
    } else {
        return Err(QueryError::ExecutionError(format!(
            "cannot combine {} with {}",
            left.data_type(),
            right.data_type()
        )));
    };
    Ok((
        compute::cast(left, &target)?,
        compute::cast(right, &target)?,
    ))
}

fn evaluate_binary_op(left: &ArrayRef, op: BinaryOp, right: &ArrayRef) -> Result<ArrayRef> {
    if matches!(op, BinaryOp::And | BinaryOp::Or) {
        let l = left.as_any().downcast_ref::<BooleanArray>().ok_or_else(|| {
            QueryError::ExecutionError(format!("{:?} requires boolean arrays", op))
        })?;
        let r = right.as_any().downcast_ref::<BooleanArray>().ok_or_else(|| {
            QueryError::ExecutionError(format!("{:?} requires boolean arrays", op))
        })?;
        let result = match op {
            BinaryOp::And => compute::and_kleene(l, r)?,
            _ => compute::or_kleene(l, r)?,
        };
        return Ok(Arc::new(result) as ArrayRef);
    }

    let (left, right) = coerce_numeric(left, right)?;
    let result: ArrayRef = match op {
        BinaryOp::Add => add(&left, &right)?,
        BinaryOp::Subtract => sub(&left, &right)?,
        BinaryOp::Multiply => mul(&left, &right)?,
        BinaryOp::Divide => div(&left, &right)?,
        BinaryOp::Equal => Arc::new(eq(&left, &right)?),
        BinaryOp::NotEqual => Arc::new(neq(&left, &right)?),
        BinaryOp::Less => Arc::new(lt(&left, &right)?),
        BinaryOp::LessEqual => Arc::new(lt_eq(&left, &right)?),
        BinaryOp::Greater => Arc::new(gt(&left, &right)?),
        BinaryOp::GreaterEqual => Arc::new(gt_eq(&left, &right)?),
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    };
    Ok(result)
}

pub fn evaluate_aggregate(func: AggregateFunction, array: &ArrayRef) -> Result<ScalarValue> {
    match func {
        AggregateFunction::Count => {
            let nulls = array.logical_nulls().map_or(0, |n| n.null_count());
            let non_null_count = array.len() - nulls;
            Ok(ScalarValue::Int64(Some(non_null_count as i64)))
        }
        AggregateFunction::Sum => {
            if is_float(array.data_type()) {
                let values = compute::cast(array, &ArrowDataType::Float64)?;
                let values = values.as_any().downcast_ref::<Float64Array>().ok_or_else(|| {
                    QueryError::ExecutionError("Unsupported type for SUM".to_string())
                })?;
                Ok(ScalarValue::Float64(compute::sum(values)))
            } else if array.data_type().is_integer() {
                let values = compute::cast(array, &ArrowDataType::Int64)?;
                let values = values.as_any().downcast_ref::<Int64Array>().ok_or_else(|| {
                    QueryError::ExecutionError("Unsupported type for SUM".to_string())
                })?;
                Ok(ScalarValue::Int64(compute::sum(values)))
            } else {
                Err(QueryError::ExecutionError(format!(
                    "Unsupported type for SUM: {}",
                    array.data_type()
                )))
            }
        }
        AggregateFunction::Min | AggregateFunction::Max => min_max(func, array),
    }
}

fn min_max(func: AggregateFunction, array: &ArrayRef) -> Result<ScalarValue> {
    let is_min = func == AggregateFunction::Min;
    if let Some(arr) = array.as_any().downcast_ref::<StringArray>() {
        let value = if is_min {
            compute::min_string(arr)
        } else {
            compute::max_string(arr)
        };
        return Ok(ScalarValue::Utf8(value.map(str::to_string)));
    }
    if let Some(arr) = array.as_any().downcast_ref::<Int32Array>() {
        let value = if is_min { compute::min(arr) } else { compute::max(arr) };
        return Ok(ScalarValue::Int32(value));
    }
    if let Some(arr) = array.as_any().downcast_ref::<BooleanArray>() {
        let value = if is_min {
            compute::min_boolean(arr)
        } else {
            compute::max_boolean(arr)
        };
        return Ok(ScalarValue::Boolean(value));
    }
    if is_float(array.data_type()) {
        let values = compute::cast(array, &ArrowDataType::Float64)?;
        if let Some(arr) = values.as_any().downcast_ref::<Float64Array>() {
            let value = if is_min { compute::min(arr) } else { compute::max(arr) };
            return Ok(ScalarValue::Float64(value));
        }
    }
    if array.data_type().is_integer() {
        let values = compute::cast(array, &ArrowDataType::Int64)?;
        if let Some(arr) = values.as_any().downcast_ref::<Int64Array>() {
            let value = if is_min { compute::min(arr) } else { compute::max(arr) };
            return Ok(ScalarValue::Int64(value));
        }
    }
    Err(QueryError::ExecutionError(format!(
        "Unsupported type for {}: {}",
        func,
        array.data_type()
    )))
}

/// Output schema whose names come from the plan and types from the arrays
pub fn output_schema(names: &[String], columns: &[ArrayRef]) -> Arc<ArrowSchema> {
    let fields: Vec<ArrowField> = names
        .iter()
        .zip(columns)
        .map(|(name, column)| ArrowField::new(name, column.data_type().clone(), true))
        .collect();
    Arc::new(ArrowSchema::new(fields))
}

/// Equi-join one co-partitioned pair of inputs.
///
/// Rows whose keys contain a null never match. Returns `None` when the
/// output would be empty.
pub fn hash_join(
    left: &RecordBatch,
    right: &RecordBatch,
    on: &[(PhysicalExpr, PhysicalExpr)],
    join_type: JoinType,
    names: &[String],
) -> Result<Option<RecordBatch>> {
    if left.num_rows() == 0 || (right.num_rows() == 0 && join_type == JoinType::Inner) {
        return Ok(None);
    }

    let left_keys = on
        .iter()
        .map(|(l, _)| evaluate_expr(l, left))
        .collect::<Result<Vec<_>>>()?;
    let right_keys = on
        .iter()
        .zip(&left_keys)
        .map(|((_, r), left_key)| {
            let key = evaluate_expr(r, right)?;
            if key.data_type() == left_key.data_type() {
                Ok(key)
            } else {
                Ok(compute::cast(&key, left_key.data_type())?)
            }
        })
        .collect::<Result<Vec<_>>>()?;

    let converter = RowConverter::new(
        left_keys
            .iter()
            .map(|k| SortField::new(k.data_type().clone()))
            .collect(),
    )?;
    let left_rows = converter.convert_columns(&left_keys)?;
    let right_rows = converter.convert_columns(&right_keys)?;

    let has_null = |keys: &[ArrayRef], row: usize| keys.iter().any(|k| k.is_null(row));

    let mut build: HashMap<_, Vec<u32>, RandomState> = HashMap::default();
    for row in 0..right.num_rows() {
        if !has_null(&right_keys, row) {
            build.entry(right_rows.row(row)).or_default().push(row as u32);
        }
    }

    let mut left_indices: Vec<u32> = Vec::new();
    let mut right_indices: Vec<Option<u32>> = Vec::new();
    for row in 0..left.num_rows() {
        let matches = if has_null(&left_keys, row) {
            None
        } else {
            build.get(&left_rows.row(row))
        };
        match matches {
            Some(rows) => {
                for &r in rows {
                    left_indices.push(row as u32);
                    right_indices.push(Some(r));
                }
            }
            None if join_type == JoinType::Left => {
                left_indices.push(row as u32);
                right_indices.push(None);
            }
            None => {}
        }
    }
    if left_indices.is_empty() {
        return Ok(None);
    }

    let left_take = UInt32Array::from(left_indices);
    let right_take = UInt32Array::from(right_indices);
    let mut columns = Vec::with_capacity(names.len());
    for column in left.columns() {
        columns.push(compute::take(column.as_ref(), &left_take, None)?);
    }
    for column in right.columns() {
        columns.push(compute::take(column.as_ref(), &right_take, None)?);
    }
    Ok(Some(RecordBatch::try_new(
        output_schema(names, &columns),
        columns,
    )?))
}

/// Aggregate one partition whose groups are wholly contained in it.
///
/// A global aggregate always yields exactly one row, even over no input.
pub fn hash_aggregate(
    batch: &RecordBatch,
    group_exprs: &[PhysicalExpr],
    aggr_exprs: &[AggregateExpr],
    names: &[String],
    output_types: &[ArrowDataType],
) -> Result<Option<RecordBatch>> {
    let aggr_inputs = aggr_exprs
        .iter()
        .map(|aggr| evaluate_expr(&aggr.expr, batch))
        .collect::<Result<Vec<_>>>()?;
    let aggr_types = &output_types[group_exprs.len()..];

    if group_exprs.is_empty() {
        let columns = aggr_exprs
            .iter()
            .zip(&aggr_inputs)
            .zip(aggr_types)
            .map(|((aggr, input), data_type)| {
                let value = evaluate_aggregate(aggr.func, input)?;
                scalars_to_array(&[value], data_type)
            })
            .collect::<Result<Vec<_>>>()?;
        return Ok(Some(RecordBatch::try_new(
            output_schema(names, &columns),
            columns,
        )?));
    }

    if batch.num_rows() == 0 {
        return Ok(None);
    }

    let group_arrays = group_exprs
        .iter()
        .map(|expr| evaluate_expr(expr, batch))
        .collect::<Result<Vec<_>>>()?;
    let converter = RowConverter::new(
        group_arrays
            .iter()
            .map(|a| SortField::new(a.data_type().clone()))
            .collect(),
    )?;
    let rows = converter.convert_columns(&group_arrays)?;

    let mut group_ids: HashMap<_, usize, RandomState> = HashMap::default();
    let mut members: Vec<Vec<u32>> = Vec::new();
    for row in 0..batch.num_rows() {
        let next = members.len();
        let group = *group_ids.entry(rows.row(row)).or_insert(next);
        if group == next {
            members.push(Vec::new());
        }
        members[group].push(row as u32);
    }

    let first_rows = UInt32Array::from(members.iter().map(|m| m[0]).collect::<Vec<_>>());
    let mut columns = Vec::with_capacity(names.len());
    for array in &group_arrays {
        columns.push(compute::take(array.as_ref(), &first_rows, None)?);
    }
    for ((aggr, input), data_type) in aggr_exprs.iter().zip(&aggr_inputs).zip(aggr_types) {
        let values = members
            .iter()
            .map(|rows| {
                let group_values = compute::take(input.as_ref(), &UInt32Array::from(rows.clone()), None)?;
                evaluate_aggregate(aggr.func, &group_values)
            })
            .collect::<Result<Vec<_>>>()?;
        columns.push(scalars_to_array(&values, data_type)?);
    }
    Ok(Some(RecordBatch::try_new(
        output_schema(names, &columns),
        columns,
    )?))
}

pub fn sort_batch(batch: &RecordBatch, exprs: &[PhysicalSortExpr]) -> Result<RecordBatch> {
    if batch.num_rows() == 0 {
        return Ok(batch.clone());
    }
    let sort_columns = exprs
        .iter()
        .map(|sort| {
            Ok(SortColumn {
                values: evaluate_expr(&sort.expr, batch)?,
                options: Some(SortOptions {
                    descending: !sort.ascending,
                    nulls_first: sort.nulls_first,
                }),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let indices = compute::lexsort_to_indices(&sort_columns, None)?;
    Ok(compute::take_record_batch(batch, &indices)?)
}

pub fn limit_batches(batches: Vec<RecordBatch>, skip: usize, fetch: Option<usize>) -> Vec<RecordBatch> {
    let mut total_rows = 0;
    let mut result_batches = Vec::new();
    let mut remaining_skip = skip;

    for batch in batches {
        let batch_rows = batch.num_rows();

        if remaining_skip >= batch_rows {
            remaining_skip -= batch_rows;
            continue;
        }

        let start = remaining_skip;
        remaining_skip = 0;

        let end = if let Some(limit) = fetch {
            let remaining = limit.saturating_sub(total_rows);
            (start + remaining).min(batch_rows)
        } else {
            batch_rows
        };

        if start < end {
            let sliced = batch.slice(start, end - start);
            total_rows += sliced.num_rows();
            result_batches.push(sliced);

            if let Some(limit) = fetch {
                if total_rows >= limit {
                    break;
                }
            }
        }
    }

    result_batches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, index: usize) -> PhysicalExpr {
        PhysicalExpr::Column {
            name: name.to_string(),
            index,
        }
    }

    fn batch(ids: Vec<Option<i64>>, tags: Vec<&str>) -> RecordBatch {
        let schema = Arc::new(ArrowSchema::new(vec![
            ArrowField::new("id", ArrowDataType::Int64, true),
            ArrowField::new("tag", ArrowDataType::Utf8, false),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(ids)),
                Arc::new(StringArray::from(tags)),
            ],
        )
        .unwrap()
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_mixed_width_arithmetic() {
        let input = batch(vec![Some(1), Some(2)], vec!["a", "b"]);
        let expr = PhysicalExpr::BinaryExpr {
            left: Box::new(column("id", 0)),
            op: BinaryOp::Add,
            right: Box::new(PhysicalExpr::Literal(ScalarValue::Int32(Some(10)))),
        };
        let result = evaluate_expr(&expr, &input).unwrap();
        let values = result.as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(values.values(), &[11, 12]);
    }

    #[test]
    fn test_aggregates() {
        let values: ArrayRef = Arc::new(Int32Array::from(vec![Some(3), None, Some(5)]));
        assert_eq!(
            evaluate_aggregate(AggregateFunction::Count, &values).unwrap(),
            ScalarValue::Int64(Some(2))
        );
        assert_eq!(
            evaluate_aggregate(AggregateFunction::Sum, &values).unwrap(),
            ScalarValue::Int64(Some(8))
        );
        assert_eq!(
            evaluate_aggregate(AggregateFunction::Min, &values).unwrap(),
            ScalarValue::Int32(Some(3))
        );

        let tags: ArrayRef = Arc::new(StringArray::from(vec!["b", "a", "c"]));
        assert_eq!(
            evaluate_aggregate(AggregateFunction::Max, &tags).unwrap(),
            ScalarValue::Utf8(Some("c".to_string()))
        );
    }

    #[test]
    fn test_inner_join_skips_null_keys() {
        let left = batch(vec![Some(1), Some(2), None], vec!["a", "b", "c"]);
        let right = batch(vec![Some(2), Some(2), None], vec!["x", "y", "z"]);
        let on = vec![(column("id", 0), column("id", 0))];

        let joined = hash_join(
            &left,
            &right,
            &on,
            JoinType::Inner,
            &names(&["id", "tag", "rid", "rtag"]),
        )
        .unwrap()
        .unwrap();

        assert_eq!(joined.num_rows(), 2);
        assert_eq!(joined.schema().field(2).name(), "rid");
    }

    #[test]
    fn test_left_join_keeps_unmatched() {
        let left = batch(vec![Some(1), Some(2)], vec!["a", "b"]);
        let right = batch(vec![Some(2)], vec!["x"]);
        let on = vec![(column("id", 0), column("id", 0))];

        let joined = hash_join(
            &left,
            &right,
            &on,
            JoinType::Left,
            &names(&["id", "tag", "rid", "rtag"]),
        )
        .unwrap()
        .unwrap();

        assert_eq!(joined.num_rows(), 2);
        assert_eq!(joined.column(3).null_count(), 1);
    }

    #[test]
    fn test_grouped_aggregate() {
        let input = batch(
            vec![Some(1), Some(2), Some(3), None],
            vec!["a", "b", "a", "a"],
        );
        let aggrs = vec![
            AggregateExpr {
                func: AggregateFunction::Sum,
                expr: column("id", 0),
            },
            AggregateExpr {
                func: AggregateFunction::Count,
                expr: column("id", 0),
            },
        ];

        let result = hash_aggregate(
            &input,
            &[column("tag", 1)],
            &aggrs,
            &names(&["tag", "total", "n"]),
            &[ArrowDataType::Utf8, ArrowDataType::Int64, ArrowDataType::Int64],
        )
        .unwrap()
        .unwrap();

        assert_eq!(result.num_rows(), 2);
        let tags = result.column(0).as_any().downcast_ref::<StringArray>().unwrap();
        let totals = result.column(1).as_any().downcast_ref::<Int64Array>().unwrap();
        let counts = result.column(2).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(tags.value(0), "a");
        assert_eq!(totals.value(0), 4);
        assert_eq!(counts.value(0), 2);
        assert_eq!(totals.value(1), 2);
    }

    #[test]
    fn test_global_aggregate_over_empty_input() {
        let input = batch(vec![], vec![]);
        let aggrs = vec![AggregateExpr {
            func: AggregateFunction::Count,
            expr: column("id", 0),
        }];

        let result = hash_aggregate(&input, &[], &aggrs, &names(&["n"]), &[ArrowDataType::Int64])
            .unwrap()
            .unwrap();

        assert_eq!(result.num_rows(), 1);
        let counts = result.column(0).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(counts.value(0), 0);
    }

    #[test]
    fn test_sort_nulls_last_ascending() {
        let input = batch(vec![Some(3), None, Some(1)], vec!["c", "n", "a"]);
        let sorted = sort_batch(&input, &[PhysicalSortExpr::new(column("id", 0), true)]).unwrap();

        let ids = sorted.column(0).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(ids.value(0), 1);
        assert_eq!(ids.value(1), 3);
        assert!(ids.is_null(2));
    }

    #[test]
    fn test_limit_across_batches() {
        let batches = vec![
            batch(vec![Some(1), Some(2)], vec!["a", "b"]),
            batch(vec![Some(3), Some(4)], vec!["c", "d"]),
        ];
        let limited = limit_batches(batches, 1, Some(2));
        let rows: usize = limited.iter().map(|b| b.num_rows()).sum();
        assert_eq!(rows, 2);
        let first = limited[0].column(0).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(first.value(0), 2);
    }
}
