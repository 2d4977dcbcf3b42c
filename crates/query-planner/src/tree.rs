//! Generic traversal and rewriting of logical plan trees

use crate::logical_plan::LogicalPlan;
use query_core::{QueryError, Result};
use std::sync::Arc;

/// Result of applying a rewrite rule to one node
#[derive(Debug)]
pub enum Transformed<T> {
    Yes(T),
    No(T),
}

impl<T> Transformed<T> {
    pub fn into_inner(self) -> T {
        match self {
            Transformed::Yes(t) | Transformed::No(t) => t,
        }
    }

    pub fn is_transformed(&self) -> bool {
        matches!(self, Transformed::Yes(_))
    }
}

impl LogicalPlan {
    /// Direct inputs of this node. Cached relations are leaves.
    pub fn children(&self) -> Vec<&LogicalPlan> {
        match self {
            LogicalPlan::Projection { input, .. }
            | LogicalPlan::Filter { input, .. }
            | LogicalPlan::Aggregate { input, .. }
            | LogicalPlan::Sort { input, .. }
            | LogicalPlan::Limit { input, .. }
            | LogicalPlan::Repartition { input, .. }
            | LogicalPlan::SubqueryAlias { input, .. } => vec![input.as_ref()],
            LogicalPlan::Join { left, right, .. } => vec![left.as_ref(), right.as_ref()],
            LogicalPlan::TableScan { .. }
            | LogicalPlan::CachedRelation { .. }
            | LogicalPlan::EmptyRelation { .. } => vec![],
        }
    }

    /// Copy of this node over new inputs, which must match `children()` in number
    pub fn with_new_children(&self, children: Vec<Arc<LogicalPlan>>) -> Result<LogicalPlan> {
        let expected = self.children().len();
        if children.len() != expected {
            return Err(QueryError::PlanningError(format!(
                "{} expects {} children, got {}",
                self.name(),
                expected,
                children.len()
            )));
        }

        let mut children = children.into_iter();
        let mut next = || {
            children
                .next()
                .ok_or_else(|| QueryError::PlanningError("missing child".to_string()))
        };

        let plan = match self {
            LogicalPlan::Projection { exprs, schema, .. } => LogicalPlan::Projection {
                input: next()?,
                exprs: exprs.clone(),
                schema: schema.clone(),
            },
            LogicalPlan::Filter { predicate, .. } => LogicalPlan::Filter {
                input: next()?,
                predicate: predicate.clone(),
            },
            LogicalPlan::Join {
                join_type,
                on,
                schema,
                ..
            } => LogicalPlan::Join {
                left: next()?,
                right: next()?,
                join_type: *join_type,
                on: on.clone(),
                schema: schema.clone(),
            },
            LogicalPlan::Aggregate {
                group_exprs,
                aggr_exprs,
                schema,
                ..
            } => LogicalPlan::Aggregate {
                input: next()?,
                group_exprs: group_exprs.clone(),
                aggr_exprs: aggr_exprs.clone(),
                schema: schema.clone(),
            },
            LogicalPlan::Sort {
                exprs, ascending, ..
            } => LogicalPlan::Sort {
                input: next()?,
                exprs: exprs.clone(),
                ascending: ascending.clone(),
            },
            LogicalPlan::Limit { skip, fetch, .. } => LogicalPlan::Limit {
                input: next()?,
                skip: *skip,
                fetch: *fetch,
            },
            LogicalPlan::Repartition { partitioning, .. } => LogicalPlan::Repartition {
                input: next()?,
                partitioning: partitioning.clone(),
            },
            LogicalPlan::SubqueryAlias { alias, .. } => LogicalPlan::SubqueryAlias {
                input: next()?,
                alias: alias.clone(),
            },
            leaf => leaf.clone(),
        };
        Ok(plan)
    }

    /// Apply `rule` to every node, children before parents
    pub fn transform_up<F>(&self, rule: &mut F) -> Result<Transformed<LogicalPlan>>
    where
        F: FnMut(LogicalPlan) -> Result<Transformed<LogicalPlan>>,
    {
        let mut any_child_changed = false;
        let mut new_children = Vec::new();
        for child in self.children() {
            let transformed = child.transform_up(rule)?;
            any_child_changed |= transformed.is_transformed();
            new_children.push(Arc::new(transformed.into_inner()));
        }

        let node = if any_child_changed {
            self.with_new_children(new_children)?
        } else {
            self.clone()
        };

        match rule(node)? {
            Transformed::No(plan) if any_child_changed => Ok(Transformed::Yes(plan)),
            other => Ok(other),
        }
    }

    /// Pre-order visit of every node
    pub fn for_each_node<'a, F>(&'a self, visit: &mut F)
    where
        F: FnMut(&'a LogicalPlan),
    {
        visit(self);
        for child in self.children() {
            child.for_each_node(visit);
        }
    }
}
