//! Fluent construction of analyzed logical plans

use crate::catalog::Catalog;
use crate::expr::Expr;
use crate::logical_plan::{JoinType, LogicalExpr, LogicalPlan};
use query_core::{Field, Partitioning, QueryError, Result, Schema};
use std::sync::Arc;

pub struct LogicalPlanBuilder {
    plan: LogicalPlan,
}

impl LogicalPlanBuilder {
    pub fn from_plan(plan: LogicalPlan) -> Self {
        Self { plan }
    }

    /// Start from a table or view registered in `catalog`
    pub fn scan(catalog: &Catalog, name: &str) -> Result<Self> {
        Ok(Self::from_plan(catalog.resolve(name)?))
    }

    pub fn schema(&self) -> &Schema {
        self.plan.schema()
    }

    pub fn filter(self, predicate: Expr) -> Result<Self> {
        let predicate = predicate.resolve(self.schema())?;
        Ok(Self::from_plan(LogicalPlan::Filter {
            input: Arc::new(self.plan),
            predicate,
        }))
    }

    pub fn project(self, exprs: Vec<Expr>) -> Result<Self> {
        let input_schema = self.schema().clone();
        let exprs = exprs
            .iter()
            .map(|e| e.resolve(&input_schema))
            .collect::<Result<Vec<_>>>()?;
        let schema = Schema::new(
            exprs
                .iter()
                .map(|e| output_field(e, &input_schema))
                .collect(),
        );
        Ok(Self::from_plan(LogicalPlan::Projection {
            input: Arc::new(self.plan),
            exprs,
            schema,
        }))
    }

    /// Equi-join on pairs of column names
    pub fn join(
        self,
        right: LogicalPlan,
        join_type: JoinType,
        left_keys: &[&str],
        right_keys: &[&str],
    ) -> Result<Self> {
        if left_keys.len() != right_keys.len() || left_keys.is_empty() {
            return Err(QueryError::AnalysisError(
                "join requires the same non-zero number of keys on both sides".to_string(),
            ));
        }
        let mut on = Vec::with_capacity(left_keys.len());
        for (l, r) in left_keys.iter().zip(right_keys) {
            let l = Expr::Column(l.to_string()).resolve(self.schema())?;
            let r = Expr::Column(r.to_string()).resolve(right.schema())?;
            on.push((l, r));
        }

        let right_fields = right.schema().fields().iter().map(|f| match join_type {
            JoinType::Inner => f.clone(),
            JoinType::Left => Field::new(f.name(), *f.data_type(), true),
        });
        let schema = Schema::new(
            self.schema()
                .fields()
                .iter()
                .cloned()
                .chain(right_fields)
                .collect(),
        );

        Ok(Self::from_plan(LogicalPlan::Join {
            left: Arc::new(self.plan),
            right: Arc::new(right),
            join_type,
            on,
            schema,
        }))
    }

    pub fn aggregate(self, group_exprs: Vec<Expr>, aggr_exprs: Vec<Expr>) -> Result<Self> {
        let input_schema = self.schema().clone();
        if let Some(bad) = aggr_exprs.iter().find(|e| !e.is_aggregate()) {
            return Err(QueryError::AnalysisError(format!(
                "expression is not an aggregate: {:?}",
                bad
            )));
        }
        let group_exprs = group_exprs
            .iter()
            .map(|e| e.resolve(&input_schema))
            .collect::<Result<Vec<_>>>()?;
        let aggr_exprs = aggr_exprs
            .iter()
            .map(|e| e.resolve(&input_schema))
            .collect::<Result<Vec<_>>>()?;
        let schema = Schema::new(
            group_exprs
                .iter()
                .chain(aggr_exprs.iter())
                .map(|e| output_field(e, &input_schema))
                .collect(),
        );
        Ok(Self::from_plan(LogicalPlan::Aggregate {
            input: Arc::new(self.plan),
            group_exprs,
            aggr_exprs,
            schema,
        }))
    }

    /// Sort by `(expression, ascending)` pairs
    pub fn sort(self, keys: Vec<(Expr, bool)>) -> Result<Self> {
        let mut exprs = Vec::with_capacity(keys.len());
        let mut ascending = Vec::with_capacity(keys.len());
        for (expr, asc) in keys {
            exprs.push(expr.resolve(self.schema())?);
            ascending.push(asc);
        }
        Ok(Self::from_plan(LogicalPlan::Sort {
            input: Arc::new(self.plan),
            exprs,
            ascending,
        }))
    }

    pub fn limit(self, skip: usize, fetch: Option<usize>) -> Result<Self> {
        Ok(Self::from_plan(LogicalPlan::Limit {
            input: Arc::new(self.plan),
            skip,
            fetch,
        }))
    }

    /// Hash-redistribute rows on `columns` into `num_partitions` partitions
    pub fn repartition(self, num_partitions: usize, columns: &[&str]) -> Result<Self> {
        if num_partitions == 0 {
            return Err(QueryError::AnalysisError(
                "number of partitions must be positive".to_string(),
            ));
        }
        for column in columns {
            Expr::Column(column.to_string()).resolve(self.schema())?;
        }
        let partitioning = if columns.is_empty() {
            Partitioning::RoundRobin { num_partitions }
        } else {
            Partitioning::hash(columns.iter().map(|c| c.to_string()).collect(), num_partitions)
        };
        Ok(Self::from_plan(LogicalPlan::Repartition {
            input: Arc::new(self.plan),
            partitioning,
        }))
    }

    pub fn alias(self, alias: impl Into<String>) -> Result<Self> {
        Ok(Self::from_plan(LogicalPlan::SubqueryAlias {
            input: Arc::new(self.plan),
            alias: alias.into(),
        }))
    }

    pub fn build(self) -> LogicalPlan {
        self.plan
    }
}

fn output_field(expr: &LogicalExpr, input: &Schema) -> Field {
    let nullable = match expr.as_column() {
        Some((_, index)) => input.field(index).map(|f| f.nullable()).unwrap_or(true),
        None => true,
    };
    Field::new(expr.output_name(), expr.data_type(input), nullable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{col, count_star, lit};
    use crate::fingerprint::fingerprint;
    use query_core::DataType;

    fn catalog() -> Catalog {
        let catalog = Catalog::new();
        catalog.register_table(
            "orders",
            Schema::new(vec![
                Field::new("id", DataType::Int64, false),
                Field::new("customer", DataType::Int64, false),
                Field::new("amount", DataType::Float64, true),
            ]),
        );
        catalog
    }

    #[test]
    fn test_projection_schema() {
        let plan = LogicalPlanBuilder::scan(&catalog(), "orders")
            .unwrap()
            .project(vec![col("customer").alias("c"), col("amount")])
            .unwrap()
            .build();
        let schema = plan.schema();
        assert_eq!(schema.field(0).unwrap().name(), "c");
        assert_eq!(*schema.field(1).unwrap().data_type(), DataType::Float64);
    }

    #[test]
    fn test_aggregate_schema() {
        let plan = LogicalPlanBuilder::scan(&catalog(), "orders")
            .unwrap()
            .aggregate(vec![col("customer")], vec![count_star().alias("n")])
            .unwrap()
            .build();
        assert_eq!(plan.schema().len(), 2);
        assert_eq!(*plan.schema().field(1).unwrap().data_type(), DataType::Int64);
    }

    #[test]
    fn test_rejects_non_aggregate() {
        let result = LogicalPlanBuilder::scan(&catalog(), "orders")
            .unwrap()
            .aggregate(vec![], vec![col("id")]);
        assert!(matches!(result, Err(QueryError::AnalysisError(_))));
    }

    #[test]
    fn test_same_query_built_twice_matches() {
        let build = || {
            LogicalPlanBuilder::scan(&catalog(), "orders")
                .unwrap()
                .filter(col("amount").gt(lit(10.0)))
                .unwrap()
                .limit(0, Some(5))
                .unwrap()
                .build()
        };
        assert_eq!(fingerprint(&build()), fingerprint(&build()));
    }

    #[test]
    fn test_repartition_requires_known_columns() {
        let result = LogicalPlanBuilder::scan(&catalog(), "orders")
            .unwrap()
            .repartition(4, &["nope"]);
        assert!(matches!(result, Err(QueryError::AnalysisError(_))));
    }
}
