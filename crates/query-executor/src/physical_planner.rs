//! Lowers logical plans to partition-wise physical plans
//!
//! Exchanges are placed from the partitioning each child reports, so cached
//! relations that are already laid out on the right keys are never shuffled.

use crate::cached_scan::CachedScanNode;
use crate::exchange::ExchangePlanner;
use crate::physical_plan::{AggregateExpr, PhysicalExpr, PhysicalPlan, PhysicalSortExpr};
use crate::source::SourceRegistry;
use query_core::{Partitioning, QueryError, Result};
use query_planner::{LogicalExpr, LogicalPlan};
use std::sync::Arc;

pub struct PhysicalPlanner<'a> {
    sources: &'a SourceRegistry,
    exchange: &'a ExchangePlanner,
}

impl<'a> PhysicalPlanner<'a> {
    pub fn new(sources: &'a SourceRegistry, exchange: &'a ExchangePlanner) -> Self {
        Self { sources, exchange }
    }

    pub fn create_physical_plan(&self, plan: &LogicalPlan) -> Result<Arc<PhysicalPlan>> {
        let physical = match plan {
            LogicalPlan::TableScan { table_name, .. } => PhysicalPlan::Scan {
                table_name: table_name.clone(),
                source: self.sources.get(table_name)?,
            },
            LogicalPlan::CachedRelation { relation, scan_id } => {
                PhysicalPlan::CachedScan(CachedScanNode::new(relation.clone(), *scan_id))
            }
            LogicalPlan::EmptyRelation { schema } => PhysicalPlan::Empty {
                schema: schema.clone(),
            },
            LogicalPlan::Projection {
                input,
                exprs,
                schema,
            } => PhysicalPlan::Projection {
                input: self.create_physical_plan(input)?,
                exprs: exprs
                    .iter()
                    .map(create_physical_expr)
                    .collect::<Result<Vec<_>>>()?,
                schema: schema.clone(),
            },
            LogicalPlan::Filter { input, predicate } => PhysicalPlan::Filter {
                input: self.create_physical_plan(input)?,
                predicate: create_physical_expr(predicate)?,
            },
            LogicalPlan::Join {
                left,
                right,
                join_type,
                on,
                schema,
            } => {
                let left = self.create_physical_plan(left)?;
                let right = self.create_physical_plan(right)?;
                let left_keys = on
                    .iter()
                    .map(|(l, _)| create_physical_expr(l))
                    .collect::<Result<Vec<_>>>()?;
                let right_keys = on
                    .iter()
                    .map(|(_, r)| create_physical_expr(r))
                    .collect::<Result<Vec<_>>>()?;

                let decision = self.exchange.plan_join(
                    &left.output_partitioning(),
                    &right.output_partitioning(),
                    &key_names(on.iter().map(|(l, _)| l)),
                    &key_names(on.iter().map(|(_, r)| r)),
                );
                let left = with_exchange(left, decision.left, left_keys.clone());
                let right = with_exchange(right, decision.right, right_keys.clone());

                PhysicalPlan::HashJoin {
                    left,
                    right,
                    join_type: *join_type,
                    on: left_keys.into_iter().zip(right_keys).collect(),
                    schema: schema.clone(),
                }
            }
            LogicalPlan::Aggregate {
                input,
                group_exprs,
                aggr_exprs,
                schema,
            } => {
                let input = self.create_physical_plan(input)?;
                let group_keys = group_exprs
                    .iter()
                    .map(create_physical_expr)
                    .collect::<Result<Vec<_>>>()?;
                let decision = self
                    .exchange
                    .plan_aggregate(&input.output_partitioning(), &key_names(group_exprs.iter()));
                let input = with_exchange(input, decision, group_keys.clone());

                PhysicalPlan::HashAggregate {
                    input,
                    group_exprs: group_keys,
                    aggr_exprs: aggr_exprs
                        .iter()
                        .map(create_aggregate_expr)
                        .collect::<Result<Vec<_>>>()?,
                    schema: schema.clone(),
                }
            }
            LogicalPlan::Sort {
                input,
                exprs,
                ascending,
            } => {
                let input = self.gather(self.create_physical_plan(input)?);
                PhysicalPlan::Sort {
                    input,
                    exprs: exprs
                        .iter()
                        .zip(ascending)
                        .map(|(expr, asc)| Ok(PhysicalSortExpr::new(create_physical_expr(expr)?, *asc)))
                        .collect::<Result<Vec<_>>>()?,
                }
            }
            LogicalPlan::Limit { input, skip, fetch } => PhysicalPlan::Limit {
                input: self.gather(self.create_physical_plan(input)?),
                skip: *skip,
                fetch: *fetch,
            },
            LogicalPlan::Repartition {
                input,
                partitioning,
            } => {
                let input = self.create_physical_plan(input)?;
                return enforce_partitioning(input, partitioning);
            }
            LogicalPlan::SubqueryAlias { input, .. } => return self.create_physical_plan(input),
        };
        Ok(Arc::new(physical))
    }

    fn gather(&self, input: Arc<PhysicalPlan>) -> Arc<PhysicalPlan> {
        let decision = self.exchange.plan_gather(&input.output_partitioning());
        with_exchange(input, decision, vec![])
    }
}

/// Wrap `plan` in an exchange to `partitioning` unless it already has it.
///
/// Hash keys are resolved by name against the plan's output schema.
pub fn enforce_partitioning(
    plan: Arc<PhysicalPlan>,
    partitioning: &Partitioning,
) -> Result<Arc<PhysicalPlan>> {
    if &plan.output_partitioning() == partitioning {
        return Ok(plan);
    }
    let keys = match partitioning {
        Partitioning::Hash { key_columns, .. } => key_columns
            .iter()
            .map(|name| {
                Ok(PhysicalExpr::Column {
                    name: name.clone(),
                    index: plan.schema().index_of(name)?,
                })
            })
            .collect::<Result<Vec<_>>>()?,
        _ => vec![],
    };
    Ok(Arc::new(PhysicalPlan::Exchange {
        input: plan,
        partitioning: partitioning.clone(),
        keys,
    }))
}

fn with_exchange(
    input: Arc<PhysicalPlan>,
    partitioning: Option<Partitioning>,
    keys: Vec<PhysicalExpr>,
) -> Arc<PhysicalPlan> {
    match partitioning {
        Some(partitioning) => Arc::new(PhysicalPlan::Exchange {
            input,
            partitioning,
            keys,
        }),
        None => input,
    }
}

fn key_names<'e>(exprs: impl Iterator<Item = &'e LogicalExpr>) -> Vec<String> {
    exprs
        .map(|expr| match expr.as_column() {
            Some((name, _)) => name.to_string(),
            None => expr.output_name(),
        })
        .collect()
}

pub fn create_physical_expr(expr: &LogicalExpr) -> Result<PhysicalExpr> {
    match expr {
        LogicalExpr::Column { name, index } => Ok(PhysicalExpr::Column {
            name: name.clone(),
            index: *index,
        }),
        LogicalExpr::Literal(value) => Ok(PhysicalExpr::Literal(value.clone())),
        LogicalExpr::BinaryExpr { left, op, right } => Ok(PhysicalExpr::BinaryExpr {
            left: Box::new(create_physical_expr(left)?),
            op: (*op).into(),
            right: Box::new(create_physical_expr(right)?),
        }),
        LogicalExpr::Not(inner) => Ok(PhysicalExpr::Not(Box::new(create_physical_expr(inner)?))),
        LogicalExpr::Alias { expr, alias } => Ok(PhysicalExpr::Alias {
            expr: Box::new(create_physical_expr(expr)?),
            alias: alias.clone(),
        }),
        LogicalExpr::AggregateFunction { .. } => Err(QueryError::PlanningError(format!(
            "aggregate {} outside of an aggregation",
            expr
        ))),
    }
}

fn create_aggregate_expr(expr: &LogicalExpr) -> Result<AggregateExpr> {
    match expr {
        LogicalExpr::Alias { expr, .. } => create_aggregate_expr(expr),
        LogicalExpr::AggregateFunction { func, expr } => Ok(AggregateExpr {
            func: *func,
            expr: create_physical_expr(expr)?,
        }),
        other => Err(QueryError::PlanningError(format!(
            "{} is not an aggregate expression",
            other
        ))),
    }
}
