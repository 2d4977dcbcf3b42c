use crate::exchange::ExchangePlanner;
use crate::operators::{
    evaluate_expr, hash_aggregate, hash_join, limit_batches, output_schema, sort_batch,
};
use crate::partition::Partitioner;
use crate::physical_plan::{PhysicalExpr, PhysicalPlan};
use crate::physical_planner::{enforce_partitioning, PhysicalPlanner};
use crate::rewriter::PlanRewriter;
use crate::source::{DataSource, SourceRegistry};
use arrow::array::*;
use arrow::compute::concat_batches;
use arrow::compute::kernels::filter::filter_record_batch;
use arrow::datatypes::DataType as ArrowDataType;
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use query_cache::CacheManager;
use query_core::{Partition, Partitioning, QueryError, Result, Schema, SortKey};
use query_planner::{LogicalPlan, LogicalPlanKey, PlanExecutor};
use std::sync::Arc;
use tracing::debug;

/// Executes logical plans partition by partition, reading cached
/// materializations wherever the plan contains a cached subtree.
///
/// The executor is also the [`PlanExecutor`] the cache is handed to compute
/// lazy entries.
#[derive(Debug)]
pub struct QueryExecutor {
    cache: Arc<CacheManager>,
    sources: SourceRegistry,
    exchange: ExchangePlanner,
    rewriter: PlanRewriter,
}

impl QueryExecutor {
    pub fn new(cache: Arc<CacheManager>) -> Self {
        let exchange = ExchangePlanner::new(cache.config().default_shuffle_partitions);
        Self {
            rewriter: PlanRewriter::new(cache.clone()),
            cache,
            sources: SourceRegistry::new(),
            exchange,
        }
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn exchange_planner(&self) -> &ExchangePlanner {
        &self.exchange
    }

    pub fn rewriter(&self) -> &PlanRewriter {
        &self.rewriter
    }

    pub fn register_table(&self, name: impl Into<String>, source: Arc<dyn DataSource>) {
        self.sources.register(name, source);
    }

    pub fn deregister_table(&self, name: &str) -> bool {
        self.sources.deregister(name).is_some()
    }

    /// Rewrite `plan` against the cache and lower it
    pub fn create_physical_plan(&self, plan: &LogicalPlan) -> Result<Arc<PhysicalPlan>> {
        let rewritten = self.rewriter.rewrite(plan)?;
        self.lower(&rewritten)
    }

    fn lower(&self, plan: &LogicalPlan) -> Result<Arc<PhysicalPlan>> {
        PhysicalPlanner::new(&self.sources, &self.exchange).create_physical_plan(plan)
    }

    /// Run `plan` and return its rows, partition by partition in order
    pub fn execute(&self, plan: &LogicalPlan) -> Result<Vec<RecordBatch>> {
        let physical = self.create_physical_plan(plan)?;
        debug!("Executing physical plan:\n{}", physical);
        let partitions = self.execute_physical(&physical)?;
        Ok(partitions.into_iter().flat_map(|p| p.batches).collect())
    }

    pub fn execute_physical(&self, plan: &PhysicalPlan) -> Result<Vec<Partition>> {
        match plan {
            PhysicalPlan::Scan { source, .. } => source.scan(),
            PhysicalPlan::CachedScan(node) => Ok(node.scan(self)?.to_vec()),
            PhysicalPlan::Empty { .. } => Ok(vec![Partition::new(0)]),
            PhysicalPlan::Projection {
                input,
                exprs,
                schema,
            } => {
                let input = self.execute_physical(input)?;
                map_batches(input, |batch| {
                    self.execute_projection(&batch, exprs, schema).map(Some)
                })
            }
            PhysicalPlan::Filter { input, predicate } => {
                let input = self.execute_physical(input)?;
                map_batches(input, |batch| self.execute_filter(&batch, predicate))
            }
            PhysicalPlan::HashJoin {
                left,
                right,
                join_type,
                on,
                schema,
            } => {
                let left_parts = self.execute_physical(left)?;
                let right_parts = self.execute_physical(right)?;
                if left_parts.len() != right_parts.len() {
                    return Err(QueryError::ExecutionError(format!(
                        "join inputs have {} and {} partitions",
                        left_parts.len(),
                        right_parts.len()
                    )));
                }
                let names = field_names(schema);
                left_parts
                    .into_iter()
                    .zip(right_parts)
                    .enumerate()
                    .map(|(index, (l, r))| {
                        let l = concat_partition(&l.batches, left.schema())?;
                        let r = concat_partition(&r.batches, right.schema())?;
                        let joined = hash_join(&l, &r, on, *join_type, &names)?;
                        Ok(Partition::with_batches(index, joined.into_iter().collect()))
                    })
                    .collect()
            }
            PhysicalPlan::HashAggregate {
                input,
                group_exprs,
                aggr_exprs,
                schema,
            } => {
                let input_schema = input.schema().clone();
                let parts = self.execute_physical(input)?;
                let names = field_names(schema);
                let output_types: Vec<ArrowDataType> = schema
                    .to_arrow()
                    .fields()
                    .iter()
                    .map(|f| f.data_type().clone())
                    .collect();
                parts
                    .into_iter()
                    .map(|part| {
                        let batch = concat_partition(&part.batches, &input_schema)?;
                        let result =
                            hash_aggregate(&batch, group_exprs, aggr_exprs, &names, &output_types)?;
                        Ok(Partition::with_batches(part.index, result.into_iter().collect()))
                    })
                    .collect()
            }
            PhysicalPlan::Sort { input, exprs } => {
                let input_schema = input.schema().clone();
                let parts = self.execute_physical(input)?;
                parts
                    .into_iter()
                    .map(|part| {
                        if part.batches.is_empty() {
                            return Ok(part);
                        }
                        let batch = concat_partition(&part.batches, &input_schema)?;
                        Ok(Partition::with_batches(part.index, vec![sort_batch(&batch, exprs)?]))
                    })
                    .collect()
            }
            PhysicalPlan::Limit { input, skip, fetch } => {
                let parts = self.execute_physical(input)?;
                Ok(parts
                    .into_iter()
                    .map(|part| {
                        Partition::with_batches(part.index, limit_batches(part.batches, *skip, *fetch))
                    })
                    .collect())
            }
            PhysicalPlan::Exchange {
                input,
                partitioning,
                keys,
            } => {
                let parts = self.execute_physical(input)?;
                debug!("Exchange of {} partition(s) into {}", parts.len(), partitioning);
                Partitioner::new(partitioning.clone(), keys.clone()).partition(parts)
            }
        }
    }

    fn execute_projection(
        &self,
        batch: &RecordBatch,
        exprs: &[PhysicalExpr],
        schema: &Schema,
    ) -> Result<RecordBatch> {
        let arrays = exprs
            .iter()
            .map(|expr| evaluate_expr(expr, batch))
            .collect::<Result<Vec<_>>>()?;

        let options = RecordBatchOptions::new().with_row_count(Some(batch.num_rows()));
        Ok(RecordBatch::try_new_with_options(
            output_schema(&field_names(schema), &arrays),
            arrays,
            &options,
        )?)
    }

    fn execute_filter(
        &self,
        batch: &RecordBatch,
        predicate: &PhysicalExpr,
    ) -> Result<Option<RecordBatch>> {
        let filter_array = evaluate_expr(predicate, batch)?;
        let boolean_array = filter_array
            .as_any()
            .downcast_ref::<BooleanArray>()
            .ok_or_else(|| {
                QueryError::ExecutionError("Filter predicate must return boolean".to_string())
            })?;

        let filtered_batch = filter_record_batch(batch, boolean_array)?;
        Ok((filtered_batch.num_rows() > 0).then_some(filtered_batch))
    }

    fn plan_for_cache(
        &self,
        plan: &LogicalPlan,
        populating: &LogicalPlanKey,
    ) -> Result<Arc<PhysicalPlan>> {
        let (rewritten, _) = self.rewriter.substitute(plan, Some(populating))?;
        self.lower(&rewritten)
    }
}

impl PlanExecutor for QueryExecutor {
    fn output_properties(
        &self,
        plan: &LogicalPlan,
        populating: &LogicalPlanKey,
    ) -> Result<(Partitioning, Vec<SortKey>)> {
        let physical = self.plan_for_cache(plan, populating)?;
        Ok((physical.output_partitioning(), physical.output_ordering()))
    }

    fn execute_partitions(
        &self,
        plan: &LogicalPlan,
        populating: &LogicalPlanKey,
        partitioning: &Partitioning,
    ) -> Result<Vec<Partition>> {
        let rewritten = self.rewriter.rewrite_excluding(plan, Some(populating))?;
        let physical = enforce_partitioning(self.lower(&rewritten)?, partitioning)?;
        debug!("Populating {} from:\n{}", populating, physical);
        self.execute_physical(&physical)
    }
}

/// Apply `f` to every batch, keeping partition boundaries
fn map_batches<F>(parts: Vec<Partition>, mut f: F) -> Result<Vec<Partition>>
where
    F: FnMut(RecordBatch) -> Result<Option<RecordBatch>>,
{
    parts
        .into_iter()
        .map(|part| {
            let mut out = Partition::new(part.index);
            for batch in part.batches {
                if let Some(batch) = f(batch)? {
                    out.add_batch(batch);
                }
            }
            Ok(out)
        })
        .collect()
}

/// One batch holding all of a partition's rows
fn concat_partition(batches: &[RecordBatch], schema: &Schema) -> Result<RecordBatch> {
    match batches.first() {
        None => Ok(RecordBatch::new_empty(schema.to_arrow_ref())),
        Some(first) if batches.len() == 1 => Ok(first.clone()),
        Some(first) => Ok(concat_batches(&first.schema(), batches)?),
    }
}

fn field_names(schema: &Schema) -> Vec<String> {
    schema.fields().iter().map(|f| f.name().to_string()).collect()
}
