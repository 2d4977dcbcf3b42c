use crate::cached_scan::CachedScanNode;
use crate::source::DataSource;
use query_core::{Partitioning, Schema, SortKey};
use query_planner::{AggregateFunction, BinaryOperator, JoinType, ScalarValue};
use std::fmt;
use std::sync::Arc;

/// Partition-wise physical operator tree
#[derive(Debug, Clone)]
pub enum PhysicalPlan {
    Scan {
        table_name: String,
        source: Arc<dyn DataSource>,
    },
    /// Read of a cached materialization
    CachedScan(CachedScanNode),
    Empty {
        schema: Schema,
    },
    Projection {
        input: Arc<PhysicalPlan>,
        exprs: Vec<PhysicalExpr>,
        schema: Schema,
    },
    Filter {
        input: Arc<PhysicalPlan>,
        predicate: PhysicalExpr,
    },
    /// Partition-wise equi-join; both inputs must be co-partitioned
    HashJoin {
        left: Arc<PhysicalPlan>,
        right: Arc<PhysicalPlan>,
        join_type: JoinType,
        on: Vec<(PhysicalExpr, PhysicalExpr)>,
        schema: Schema,
    },
    /// Partition-wise aggregation; groups must not span partitions
    HashAggregate {
        input: Arc<PhysicalPlan>,
        group_exprs: Vec<PhysicalExpr>,
        aggr_exprs: Vec<AggregateExpr>,
        schema: Schema,
    },
    Sort {
        input: Arc<PhysicalPlan>,
        exprs: Vec<PhysicalSortExpr>,
    },
    Limit {
        input: Arc<PhysicalPlan>,
        skip: usize,
        fetch: Option<usize>,
    },
    /// Redistribute rows; `keys` are evaluated for hash partitioning
    Exchange {
        input: Arc<PhysicalPlan>,
        partitioning: Partitioning,
        keys: Vec<PhysicalExpr>,
    },
}

impl PhysicalPlan {
    pub fn schema(&self) -> &Schema {
        match self {
            PhysicalPlan::Scan { source, .. } => source.schema(),
            PhysicalPlan::CachedScan(node) => node.schema(),
            PhysicalPlan::Empty { schema } => schema,
            PhysicalPlan::Projection { schema, .. } => schema,
            PhysicalPlan::Filter { input, .. } => input.schema(),
            PhysicalPlan::HashJoin { schema, .. } => schema,
            PhysicalPlan::HashAggregate { schema, .. } => schema,
            PhysicalPlan::Sort { input, .. } => input.schema(),
            PhysicalPlan::Limit { input, .. } => input.schema(),
            PhysicalPlan::Exchange { input, .. } => input.schema(),
        }
    }

    pub fn children(&self) -> Vec<&Arc<PhysicalPlan>> {
        match self {
            PhysicalPlan::Scan { .. } | PhysicalPlan::CachedScan(_) | PhysicalPlan::Empty { .. } => {
                vec![]
            }
            PhysicalPlan::Projection { input, .. }
            | PhysicalPlan::Filter { input, .. }
            | PhysicalPlan::HashAggregate { input, .. }
            | PhysicalPlan::Sort { input, .. }
            | PhysicalPlan::Limit { input, .. }
            | PhysicalPlan::Exchange { input, .. } => vec![input],
            PhysicalPlan::HashJoin { left, right, .. } => vec![left, right],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PhysicalPlan::Scan { .. } => "Scan",
            PhysicalPlan::CachedScan(_) => "CachedScan",
            PhysicalPlan::Empty { .. } => "Empty",
            PhysicalPlan::Projection { .. } => "Projection",
            PhysicalPlan::Filter { .. } => "Filter",
            PhysicalPlan::HashJoin { .. } => "HashJoin",
            PhysicalPlan::HashAggregate { .. } => "HashAggregate",
            PhysicalPlan::Sort { .. } => "Sort",
            PhysicalPlan::Limit { .. } => "Limit",
            PhysicalPlan::Exchange { .. } => "Exchange",
        }
    }

    /// How the operator's output rows are distributed
    pub fn output_partitioning(&self) -> Partitioning {
        match self {
            PhysicalPlan::Scan { source, .. } => source.partitioning(),
            PhysicalPlan::CachedScan(node) => node.output_partitioning(),
            PhysicalPlan::Empty { .. } => Partitioning::Single,
            PhysicalPlan::Projection { input, exprs, .. } => {
                input.output_partitioning().project(|key| rename(exprs, key))
            }
            PhysicalPlan::Filter { input, .. } => input.output_partitioning(),
            PhysicalPlan::HashJoin { left, .. } => left.output_partitioning(),
            PhysicalPlan::HashAggregate {
                input, group_exprs, ..
            } => input
                .output_partitioning()
                .project(|key| rename(group_exprs, key)),
            PhysicalPlan::Sort { input, .. } | PhysicalPlan::Limit { input, .. } => {
                input.output_partitioning()
            }
            PhysicalPlan::Exchange { partitioning, .. } => partitioning.clone(),
        }
    }

    /// Sort order every output partition follows
    pub fn output_ordering(&self) -> Vec<SortKey> {
        match self {
            PhysicalPlan::Scan { .. } | PhysicalPlan::Empty { .. } => vec![],
            PhysicalPlan::CachedScan(node) => node.output_ordering(),
            PhysicalPlan::Projection { input, exprs, .. } => input
                .output_ordering()
                .into_iter()
                .map_while(|key| {
                    rename(exprs, &key.column).map(|column| SortKey { column, ..key })
                })
                .collect(),
            PhysicalPlan::Filter { input, .. } | PhysicalPlan::Limit { input, .. } => {
                input.output_ordering()
            }
            PhysicalPlan::Sort { exprs, .. } => exprs
                .iter()
                .map_while(|sort| {
                    sort.expr.column_name().map(|column| SortKey {
                        column: column.to_string(),
                        ascending: sort.ascending,
                        nulls_first: sort.nulls_first,
                    })
                })
                .collect(),
            PhysicalPlan::Exchange {
                input,
                partitioning,
                ..
            } => {
                if matches!(partitioning, Partitioning::Single)
                    && matches!(input.output_partitioning(), Partitioning::Single)
                {
                    input.output_ordering()
                } else {
                    vec![]
                }
            }
            PhysicalPlan::HashJoin { .. } | PhysicalPlan::HashAggregate { .. } => vec![],
        }
    }

    /// Number of exchange operators in the tree
    pub fn exchange_count(&self) -> usize {
        let own = usize::from(matches!(self, PhysicalPlan::Exchange { .. }));
        own + self
            .children()
            .iter()
            .map(|child| child.exchange_count())
            .sum::<usize>()
    }

    /// Cached scans in the tree, left to right
    pub fn cached_scans(&self) -> Vec<&CachedScanNode> {
        match self {
            PhysicalPlan::CachedScan(node) => vec![node],
            other => other
                .children()
                .into_iter()
                .flat_map(|child| child.cached_scans())
                .collect(),
        }
    }
}

/// Output name of the projection expression that passes `column` through
fn rename(exprs: &[PhysicalExpr], column: &str) -> Option<String> {
    exprs.iter().find_map(|expr| match expr {
        PhysicalExpr::Alias { expr, alias } if expr.column_name() == Some(column) => {
            Some(alias.clone())
        }
        PhysicalExpr::Column { name, .. } if name == column => Some(name.clone()),
        _ => None,
    })
}

impl fmt::Display for PhysicalPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn walk(plan: &PhysicalPlan, depth: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:indent$}{}", "", plan.name(), indent = depth * 2)?;
            match plan {
                PhysicalPlan::Scan { table_name, .. } => write!(f, ": {}", table_name)?,
                PhysicalPlan::CachedScan(node) => write!(
                    f,
                    "#{}: {} [{}]",
                    node.scan_id(),
                    node.output_partitioning(),
                    node.key()
                )?,
                PhysicalPlan::Exchange { partitioning, .. } => write!(f, ": {}", partitioning)?,
                _ => {}
            }
            writeln!(f)?;
            for child in plan.children() {
                walk(child, depth + 1, f)?;
            }
            Ok(())
        }
        walk(self, 0, f)
    }
}

#[derive(Debug, Clone)]
pub enum PhysicalExpr {
    Column {
        name: String,
        index: usize,
    },
    Literal(ScalarValue),
    BinaryExpr {
        left: Box<PhysicalExpr>,
        op: BinaryOp,
        right: Box<PhysicalExpr>,
    },
    Not(Box<PhysicalExpr>),
    /// Renames its input; evaluation is the input's
    Alias {
        expr: Box<PhysicalExpr>,
        alias: String,
    },
}

impl PhysicalExpr {
    /// Column read directly by this expression, looking through aliases
    pub fn column_name(&self) -> Option<&str> {
        match self {
            PhysicalExpr::Column { name, .. } => Some(name),
            PhysicalExpr::Alias { expr, .. } => expr.column_name(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    And,
    Or,
}

impl From<BinaryOperator> for BinaryOp {
    fn from(op: BinaryOperator) -> Self {
        match op {
            BinaryOperator::Plus => BinaryOp::Add,
            BinaryOperator::Minus => BinaryOp::Subtract,
            BinaryOperator::Multiply => BinaryOp::Multiply,
            BinaryOperator::Divide => BinaryOp::Divide,
            BinaryOperator::Equal => BinaryOp::Equal,
            BinaryOperator::NotEqual => BinaryOp::NotEqual,
            BinaryOperator::Less => BinaryOp::Less,
            BinaryOperator::LessEqual => BinaryOp::LessEqual,
            BinaryOperator::Greater => BinaryOp::Greater,
            BinaryOperator::GreaterEqual => BinaryOp::GreaterEqual,
            BinaryOperator::And => BinaryOp::And,
            BinaryOperator::Or => BinaryOp::Or,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AggregateExpr {
    pub func: AggregateFunction,
    pub expr: PhysicalExpr,
}

#[derive(Debug, Clone)]
pub struct PhysicalSortExpr {
    pub expr: PhysicalExpr,
    pub ascending: bool,
    pub nulls_first: bool,
}

impl PhysicalSortExpr {
    /// Ascending sorts put nulls last, descending sorts put them first
    pub fn new(expr: PhysicalExpr, ascending: bool) -> Self {
        Self {
            expr,
            ascending,
            nulls_first: !ascending,
        }
    }
}
