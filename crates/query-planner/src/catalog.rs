//! Registry of base tables and temporary views
//!
//! Resolving a name yields an analyzed logical plan. Views resolve to their
//! defining plan under a subquery alias, which fingerprints like the plan
//! itself.

use crate::logical_plan::LogicalPlan;
use parking_lot::RwLock;
use query_core::{QueryError, Result, Schema};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct Catalog {
    tables: RwLock<HashMap<String, Schema>>,
    views: RwLock<HashMap<String, Arc<LogicalPlan>>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_table(&self, name: impl Into<String>, schema: Schema) {
        self.tables.write().insert(name.into(), schema);
    }

    pub fn deregister_table(&self, name: &str) -> bool {
        self.tables.write().remove(name).is_some()
    }

    pub fn table_schema(&self, name: &str) -> Option<Schema> {
        self.tables.read().get(name).cloned()
    }

    /// Register a temporary view; fails if the name is taken and `replace` is false
    pub fn register_view(
        &self,
        name: impl Into<String>,
        plan: LogicalPlan,
        replace: bool,
    ) -> Result<()> {
        let name = name.into();
        let mut views = self.views.write();
        if !replace && (views.contains_key(&name) || self.tables.read().contains_key(&name)) {
            return Err(QueryError::AnalysisError(format!(
                "relation '{}' already exists",
                name
            )));
        }
        tracing::debug!("Registered view {}", name);
        views.insert(name, Arc::new(plan));
        Ok(())
    }

    pub fn drop_view(&self, name: &str) -> bool {
        let dropped = self.views.write().remove(name).is_some();
        if dropped {
            tracing::debug!("Dropped view {}", name);
        }
        dropped
    }

    pub fn contains(&self, name: &str) -> bool {
        self.views.read().contains_key(name) || self.tables.read().contains_key(name)
    }

    /// Analyzed plan for a table or view name. Views shadow tables.
    pub fn resolve(&self, name: &str) -> Result<LogicalPlan> {
        if let Some(plan) = self.views.read().get(name) {
            return Ok(LogicalPlan::SubqueryAlias {
                input: Arc::clone(plan),
                alias: name.to_string(),
            });
        }
        if let Some(schema) = self.tables.read().get(name) {
            return Ok(LogicalPlan::TableScan {
                table_name: name.to_string(),
                schema: schema.clone(),
            });
        }
        Err(QueryError::AnalysisError(format!(
            "table or view not found: {}",
            name
        )))
    }

    /// Names of views whose definition scans `table_name`
    pub fn views_referencing(&self, table_name: &str) -> Vec<String> {
        self.views
            .read()
            .iter()
            .filter(|(_, plan)| plan.references_table(table_name))
            .map(|(name, _)| name.clone())
            .collect()
    }
}
