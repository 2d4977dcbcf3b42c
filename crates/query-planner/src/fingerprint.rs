//! Plan fingerprints
//!
//! A fingerprint is the canonical text of a resolved logical plan. Cosmetic
//! differences are normalized away: subquery aliases are transparent and
//! column references are compared by ordinal, not by name. Output schemas are
//! part of the key, so two plans with equal keys produce the same columns and
//! the same rows.
//!
//! Equality compares the full canonical text; the digest only speeds up
//! hashing, so a digest collision can never produce a false cache hit.

use crate::logical_plan::{LogicalExpr, LogicalPlan, ScalarValue};
use ahash::AHasher;
use query_core::Schema;
use std::fmt::{self, Write};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Key identifying a logical plan for cache matching
#[derive(Clone)]
pub struct LogicalPlanKey {
    digest: u64,
    canonical: Arc<str>,
}

impl LogicalPlanKey {
    fn from_canonical(canonical: String) -> Self {
        let mut hasher = AHasher::default();
        canonical.hash(&mut hasher);
        Self {
            digest: hasher.finish(),
            canonical: canonical.into(),
        }
    }

    pub fn digest(&self) -> u64 {
        self.digest
    }

    pub fn canonical(&self) -> &str {
        &self.canonical
    }
}

impl PartialEq for LogicalPlanKey {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest && self.canonical == other.canonical
    }
}

impl Eq for LogicalPlanKey {}

impl Hash for LogicalPlanKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.digest.hash(state);
    }
}

impl fmt::Debug for LogicalPlanKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogicalPlanKey({:016x})", self.digest)
    }
}

impl fmt::Display for LogicalPlanKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.digest)
    }
}

/// Fingerprint a resolved logical plan
pub fn fingerprint(plan: &LogicalPlan) -> LogicalPlanKey {
    let mut subtrees = Vec::new();
    LogicalPlanKey::from_canonical(canonical_form(plan, &mut subtrees))
}

/// Keys of every subtree of `plan`, including the plan itself and the plans
/// behind cached relations
pub fn subtree_keys(plan: &LogicalPlan) -> Vec<LogicalPlanKey> {
    let mut subtrees = Vec::new();
    canonical_form(plan, &mut subtrees);
    subtrees
        .into_iter()
        .map(LogicalPlanKey::from_canonical)
        .collect()
}

fn canonical_form(plan: &LogicalPlan, subtrees: &mut Vec<String>) -> String {
    let mut out = String::new();
    match plan {
        LogicalPlan::TableScan { table_name, schema } => {
            let _ = write!(out, "scan:{}", table_name);
            write_schema(&mut out, schema);
        }
        LogicalPlan::Projection {
            input,
            exprs,
            schema,
        } => {
            out.push_str("project[");
            write_exprs(&mut out, exprs);
            out.push(']');
            write_schema(&mut out, schema);
            write_child(&mut out, input, subtrees);
        }
        LogicalPlan::Filter { input, predicate } => {
            out.push_str("filter[");
            write_expr(&mut out, predicate);
            out.push(']');
            write_child(&mut out, input, subtrees);
        }
        LogicalPlan::Join {
            left,
            right,
            join_type,
            on,
            schema,
        } => {
            let _ = write!(out, "join:{:?}[", join_type);
            for (i, (l, r)) in on.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_expr(&mut out, l);
                out.push('=');
                write_expr(&mut out, r);
            }
            out.push(']');
            write_schema(&mut out, schema);
            write_child(&mut out, left, subtrees);
            write_child(&mut out, right, subtrees);
        }
        LogicalPlan::Aggregate {
            input,
            group_exprs,
            aggr_exprs,
            schema,
        } => {
            out.push_str("aggregate[");
            write_exprs(&mut out, group_exprs);
            out.push_str("][");
            write_exprs(&mut out, aggr_exprs);
            out.push(']');
            write_schema(&mut out, schema);
            write_child(&mut out, input, subtrees);
        }
        LogicalPlan::Sort {
            input,
            exprs,
            ascending,
        } => {
            out.push_str("sort[");
            for (i, expr) in exprs.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_expr(&mut out, expr);
                let asc = ascending.get(i).copied().unwrap_or(true);
                out.push_str(if asc { " asc" } else { " desc" });
            }
            out.push(']');
            write_child(&mut out, input, subtrees);
        }
        LogicalPlan::Limit { input, skip, fetch } => {
            let _ = write!(out, "limit[{},{:?}]", skip, fetch);
            write_child(&mut out, input, subtrees);
        }
        LogicalPlan::Repartition {
            input,
            partitioning,
        } => {
            let _ = write!(out, "repartition[{}]", partitioning);
            write_child(&mut out, input, subtrees);
        }
        // Aliases only qualify names; the aliased plan is the key.
        LogicalPlan::SubqueryAlias { input, .. } => return canonical_form(input, subtrees),
        // A cached relation stands for exactly the plan it materializes.
        LogicalPlan::CachedRelation { relation, .. } => {
            return canonical_form(relation.plan(), subtrees)
        }
        LogicalPlan::EmptyRelation { schema } => {
            out.push_str("empty");
            write_schema(&mut out, schema);
        }
    }
    subtrees.push(out.clone());
    out
}

fn write_child(out: &mut String, child: &LogicalPlan, subtrees: &mut Vec<String>) {
    out.push('(');
    out.push_str(&canonical_form(child, subtrees));
    out.push(')');
}

fn write_schema(out: &mut String, schema: &Schema) {
    out.push('{');
    for (i, field) in schema.fields().iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let _ = write!(
            out,
            "{}:{}{}",
            field.name(),
            field.data_type(),
            if field.nullable() { "?" } else { "" }
        );
    }
    out.push('}');
}

fn write_exprs(out: &mut String, exprs: &[LogicalExpr]) {
    for (i, expr) in exprs.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_expr(out, expr);
    }
}

fn write_expr(out: &mut String, expr: &LogicalExpr) {
    match expr {
        LogicalExpr::Column { index, .. } => {
            let _ = write!(out, "#{}", index);
        }
        LogicalExpr::Literal(value) => write_literal(out, value),
        LogicalExpr::BinaryExpr { left, op, right } => {
            out.push('(');
            write_expr(out, left);
            let _ = write!(out, " {} ", op);
            write_expr(out, right);
            out.push(')');
        }
        LogicalExpr::Not(inner) => {
            out.push_str("NOT ");
            write_expr(out, inner);
        }
        LogicalExpr::AggregateFunction { func, expr } => {
            let _ = write!(out, "{}(", func);
            write_expr(out, expr);
            out.push(')');
        }
        // Output names are part of the node's schema.
        LogicalExpr::Alias { expr, .. } => write_expr(out, expr),
    }
}

fn write_literal(out: &mut String, value: &ScalarValue) {
    let _ = write!(out, "{}:{}", value.data_type(), value);
}
