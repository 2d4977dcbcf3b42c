use crate::relation::CachedRelation;
use query_core::{DataType, Partitioning, Schema};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum LogicalPlan {
    TableScan {
        table_name: String,
        schema: Schema,
    },
    Projection {
        input: Arc<LogicalPlan>,
        exprs: Vec<LogicalExpr>,
        schema: Schema,
    },
    Filter {
        input: Arc<LogicalPlan>,
        predicate: LogicalExpr,
    },
    /// Equi-join; each `on` pair is (left column, right column)
    Join {
        left: Arc<LogicalPlan>,
        right: Arc<LogicalPlan>,
        join_type: JoinType,
        on: Vec<(LogicalExpr, LogicalExpr)>,
        schema: Schema,
    },
    Aggregate {
        input: Arc<LogicalPlan>,
        group_exprs: Vec<LogicalExpr>,
        aggr_exprs: Vec<LogicalExpr>,
        schema: Schema,
    },
    Sort {
        input: Arc<LogicalPlan>,
        exprs: Vec<LogicalExpr>,
        ascending: Vec<bool>,
    },
    Limit {
        input: Arc<LogicalPlan>,
        skip: usize,
        fetch: Option<usize>,
    },
    /// Explicit redistribution of the input rows
    Repartition {
        input: Arc<LogicalPlan>,
        partitioning: Partitioning,
    },
    /// Named subquery or view; the alias only qualifies names
    SubqueryAlias {
        input: Arc<LogicalPlan>,
        alias: String,
    },
    /// Read of a cached materialization, substituted by the plan rewriter
    CachedRelation {
        relation: Arc<dyn CachedRelation>,
        scan_id: usize,
    },
    EmptyRelation {
        schema: Schema,
    },
}

impl LogicalPlan {
    pub fn schema(&self) -> &Schema {
        match self {
            LogicalPlan::TableScan { schema, .. } => schema,
            LogicalPlan::Projection { schema, .. } => schema,
            LogicalPlan::Filter { input, .. } => input.schema(),
            LogicalPlan::Join { schema, .. } => schema,
            LogicalPlan::Aggregate { schema, .. } => schema,
            LogicalPlan::Sort { input, .. } => input.schema(),
            LogicalPlan::Limit { input, .. } => input.schema(),
            LogicalPlan::Repartition { input, .. } => input.schema(),
            LogicalPlan::SubqueryAlias { input, .. } => input.schema(),
            LogicalPlan::CachedRelation { relation, .. } => relation.schema(),
            LogicalPlan::EmptyRelation { schema } => schema,
        }
    }

    /// Short operator name used in logs and plan displays
    pub fn name(&self) -> &'static str {
        match self {
            LogicalPlan::TableScan { .. } => "TableScan",
            LogicalPlan::Projection { .. } => "Projection",
            LogicalPlan::Filter { .. } => "Filter",
            LogicalPlan::Join { .. } => "Join",
            LogicalPlan::Aggregate { .. } => "Aggregate",
            LogicalPlan::Sort { .. } => "Sort",
            LogicalPlan::Limit { .. } => "Limit",
            LogicalPlan::Repartition { .. } => "Repartition",
            LogicalPlan::SubqueryAlias { .. } => "SubqueryAlias",
            LogicalPlan::CachedRelation { .. } => "CachedRelation",
            LogicalPlan::EmptyRelation { .. } => "EmptyRelation",
        }
    }

    /// Whether any node scans `table_name`, looking through cached relations
    pub fn references_table(&self, table_name: &str) -> bool {
        match self {
            LogicalPlan::TableScan { table_name: t, .. } => t == table_name,
            LogicalPlan::CachedRelation { relation, .. } => {
                relation.plan().references_table(table_name)
            }
            other => other
                .children()
                .iter()
                .any(|child| child.references_table(table_name)),
        }
    }

    /// Number of cached relation reads in the plan
    pub fn cached_relation_count(&self) -> usize {
        match self {
            LogicalPlan::CachedRelation { .. } => 1,
            other => other
                .children()
                .iter()
                .map(|child| child.cached_relation_count())
                .sum(),
        }
    }
}

impl fmt::Display for LogicalPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn walk(plan: &LogicalPlan, depth: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:indent$}{}", "", plan.name(), indent = depth * 2)?;
            match plan {
                LogicalPlan::TableScan { table_name, .. } => write!(f, ": {}", table_name)?,
                LogicalPlan::SubqueryAlias { alias, .. } => write!(f, ": {}", alias)?,
                LogicalPlan::Repartition { partitioning, .. } => {
                    write!(f, ": {}", partitioning)?
                }
                LogicalPlan::CachedRelation { relation, scan_id } => {
                    write!(f, "#{}: {}", scan_id, relation.output_partitioning())?
                }
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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinType {
    Inner,
    Left,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOperator {
    Plus,
    Minus,
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

impl BinaryOperator {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOperator::Equal
                | BinaryOperator::NotEqual
                | BinaryOperator::Less
                | BinaryOperator::LessEqual
                | BinaryOperator::Greater
                | BinaryOperator::GreaterEqual
        )
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, BinaryOperator::And | BinaryOperator::Or)
    }
}

impl fmt::Display for BinaryOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOperator::Plus => "+",
            BinaryOperator::Minus => "-",
            BinaryOperator::Multiply => "*",
            BinaryOperator::Divide => "/",
            BinaryOperator::Equal => "=",
            BinaryOperator::NotEqual => "!=",
            BinaryOperator::Less => "<",
            BinaryOperator::LessEqual => "<=",
            BinaryOperator::Greater => ">",
            BinaryOperator::GreaterEqual => ">=",
            BinaryOperator::And => "AND",
            BinaryOperator::Or => "OR",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateFunction {
    Count,
    Sum,
    Min,
    Max,
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AggregateFunction::Count => "COUNT",
            AggregateFunction::Sum => "SUM",
            AggregateFunction::Min => "MIN",
            AggregateFunction::Max => "MAX",
        };
        write!(f, "{}", s)
    }
}

/// Resolved expression; columns refer to the input schema by ordinal
#[derive(Debug, Clone, PartialEq)]
pub enum LogicalExpr {
    Column {
        name: String,
        index: usize,
    },
    Literal(ScalarValue),
    BinaryExpr {
        left: Box<LogicalExpr>,
        op: BinaryOperator,
        right: Box<LogicalExpr>,
    },
    Not(Box<LogicalExpr>),
    AggregateFunction {
        func: AggregateFunction,
        expr: Box<LogicalExpr>,
    },
    Alias {
        expr: Box<LogicalExpr>,
        alias: String,
    },
}

impl LogicalExpr {
    /// Output column name of this expression
    pub fn output_name(&self) -> String {
        match self {
            LogicalExpr::Alias { alias, .. } => alias.clone(),
            LogicalExpr::Column { name, .. } => name.clone(),
            other => other.to_string(),
        }
    }

    pub fn data_type(&self, input: &Schema) -> DataType {
        match self {
            LogicalExpr::Column { index, .. } => input
                .field(*index)
                .map(|f| *f.data_type())
                .unwrap_or(DataType::Null),
            LogicalExpr::Literal(value) => value.data_type(),
            LogicalExpr::BinaryExpr { left, op, .. } => {
                if op.is_comparison() || op.is_logical() {
                    DataType::Boolean
                } else {
                    left.data_type(input)
                }
            }
            LogicalExpr::Not(_) => DataType::Boolean,
            LogicalExpr::AggregateFunction { func, expr } => match func {
                AggregateFunction::Count => DataType::Int64,
                AggregateFunction::Sum => match expr.data_type(input) {
                    DataType::Float32 | DataType::Float64 => DataType::Float64,
                    _ => DataType::Int64,
                },
                AggregateFunction::Min | AggregateFunction::Max => expr.data_type(input),
            },
            LogicalExpr::Alias { expr, .. } => expr.data_type(input),
        }
    }

    /// Column this expression reads directly, looking through aliases
    pub fn as_column(&self) -> Option<(&str, usize)> {
        match self {
            LogicalExpr::Column { name, index } => Some((name, *index)),
            LogicalExpr::Alias { expr, .. } => expr.as_column(),
            _ => None,
        }
    }
}

impl fmt::Display for LogicalExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalExpr::Column { name, .. } => write!(f, "{}", name),
            LogicalExpr::Literal(value) => write!(f, "{}", value),
            LogicalExpr::BinaryExpr { left, op, right } => {
                write!(f, "({} {} {})", left, op, right)
            }
            LogicalExpr::Not(expr) => write!(f, "NOT {}", expr),
            LogicalExpr::AggregateFunction { func, expr } => write!(f, "{}({})", func, expr),
            LogicalExpr::Alias { expr, alias } => write!(f, "{} AS {}", expr, alias),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Boolean(Option<bool>),
    Int32(Option<i32>),
    Int64(Option<i64>),
    Float64(Option<f64>),
    Utf8(Option<String>),
    Null,
}

impl ScalarValue {
    pub fn data_type(&self) -> DataType {
        match self {
            ScalarValue::Boolean(_) => DataType::Boolean,
            ScalarValue::Int32(_) => DataType::Int32,
            ScalarValue::Int64(_) => DataType::Int64,
            ScalarValue::Float64(_) => DataType::Float64,
            ScalarValue::Utf8(_) => DataType::Utf8,
            ScalarValue::Null => DataType::Null,
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Boolean(Some(v)) => write!(f, "{}", v),
            ScalarValue::Int32(Some(v)) => write!(f, "{}", v),
            ScalarValue::Int64(Some(v)) => write!(f, "{}", v),
            ScalarValue::Float64(Some(v)) => write!(f, "{:?}", v),
            ScalarValue::Utf8(Some(v)) => write!(f, "'{}'", v.replace('\'', "''")),
            _ => write!(f, "NULL"),
        }
    }
}
