//! Unresolved expressions
//!
//! Expressions are written against column names and resolved to ordinals
//! when a plan node is built over a concrete input schema. Unknown names fail
//! with an analysis error before the plan can reach the cache.

use crate::logical_plan::{AggregateFunction, BinaryOperator, LogicalExpr, ScalarValue};
use query_core::{QueryError, Result, Schema};

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(String),
    Literal(ScalarValue),
    Binary {
        left: Box<Expr>,
        op: BinaryOperator,
        right: Box<Expr>,
    },
    Not(Box<Expr>),
    Aggregate {
        func: AggregateFunction,
        expr: Box<Expr>,
    },
    Alias {
        expr: Box<Expr>,
        alias: String,
    },
}

pub fn col(name: impl Into<String>) -> Expr {
    Expr::Column(name.into())
}

pub fn lit(value: impl Into<ScalarValue>) -> Expr {
    Expr::Literal(value.into())
}

pub fn count(expr: Expr) -> Expr {
    Expr::Aggregate {
        func: AggregateFunction::Count,
        expr: Box::new(expr),
    }
}

/// COUNT over a constant, counting every row
pub fn count_star() -> Expr {
    count(lit(1i64))
}

pub fn sum(expr: Expr) -> Expr {
    Expr::Aggregate {
        func: AggregateFunction::Sum,
        expr: Box::new(expr),
    }
}

pub fn min(expr: Expr) -> Expr {
    Expr::Aggregate {
        func: AggregateFunction::Min,
        expr: Box::new(expr),
    }
}

pub fn max(expr: Expr) -> Expr {
    Expr::Aggregate {
        func: AggregateFunction::Max,
        expr: Box::new(expr),
    }
}

impl Expr {
    fn binary(self, op: BinaryOperator, other: Expr) -> Expr {
        Expr::Binary {
            left: Box::new(self),
            op,
            right: Box::new(other),
        }
    }

    pub fn eq(self, other: Expr) -> Expr {
        self.binary(BinaryOperator::Equal, other)
    }

    pub fn not_eq(self, other: Expr) -> Expr {
        self.binary(BinaryOperator::NotEqual, other)
    }

    pub fn lt(self, other: Expr) -> Expr {
        self.binary(BinaryOperator::Less, other)
    }

    pub fn lt_eq(self, other: Expr) -> Expr {
        self.binary(BinaryOperator::LessEqual, other)
    }

    pub fn gt(self, other: Expr) -> Expr {
        self.binary(BinaryOperator::Greater, other)
    }

    pub fn gt_eq(self, other: Expr) -> Expr {
        self.binary(BinaryOperator::GreaterEqual, other)
    }

    pub fn and(self, other: Expr) -> Expr {
        self.binary(BinaryOperator::And, other)
    }

    pub fn or(self, other: Expr) -> Expr {
        self.binary(BinaryOperator::Or, other)
    }

    pub fn add(self, other: Expr) -> Expr {
        self.binary(BinaryOperator::Plus, other)
    }

    pub fn mul(self, other: Expr) -> Expr {
        self.binary(BinaryOperator::Multiply, other)
    }

    pub fn alias(self, alias: impl Into<String>) -> Expr {
        Expr::Alias {
            expr: Box::new(self),
            alias: alias.into(),
        }
    }

    pub fn is_aggregate(&self) -> bool {
        match self {
            Expr::Aggregate { .. } => true,
            Expr::Alias { expr, .. } | Expr::Not(expr) => expr.is_aggregate(),
            Expr::Binary { left, right, .. } => left.is_aggregate() || right.is_aggregate(),
            Expr::Column(_) | Expr::Literal(_) => false,
        }
    }

    /// Bind column names to ordinals of `schema`
    pub fn resolve(&self, schema: &Schema) -> Result<LogicalExpr> {
        Ok(match self {
            Expr::Column(name) => {
                let index = schema.index_of(name).map_err(|_| {
                    QueryError::AnalysisError(format!("cannot resolve column '{}'", name))
                })?;
                LogicalExpr::Column {
                    name: name.clone(),
                    index,
                }
            }
            Expr::Literal(value) => LogicalExpr::Literal(value.clone()),
            Expr::Binary { left, op, right } => LogicalExpr::BinaryExpr {
                left: Box::new(left.resolve(schema)?),
                op: *op,
                right: Box::new(right.resolve(schema)?),
            },
            Expr::Not(expr) => LogicalExpr::Not(Box::new(expr.resolve(schema)?)),
            Expr::Aggregate { func, expr } => LogicalExpr::AggregateFunction {
                func: *func,
                expr: Box::new(expr.resolve(schema)?),
            },
            Expr::Alias { expr, alias } => LogicalExpr::Alias {
                expr: Box::new(expr.resolve(schema)?),
                alias: alias.clone(),
            },
        })
    }
}

impl std::ops::Not for Expr {
    type Output = Expr;

    fn not(self) -> Expr {
        Expr::Not(Box::new(self))
    }
}

impl From<i64> for ScalarValue {
    fn from(v: i64) -> Self {
        ScalarValue::Int64(Some(v))
    }
}

impl From<i32> for ScalarValue {
    fn from(v: i32) -> Self {
        ScalarValue::Int32(Some(v))
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        ScalarValue::Float64(Some(v))
    }
}

impl From<bool> for ScalarValue {
    fn from(v: bool) -> Self {
        ScalarValue::Boolean(Some(v))
    }
}

impl From<&str> for ScalarValue {
    fn from(v: &str) -> Self {
        ScalarValue::Utf8(Some(v.to_string()))
    }
}
