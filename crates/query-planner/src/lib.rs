pub mod builder;
pub mod catalog;
pub mod expr;
pub mod fingerprint;
pub mod logical_plan;
pub mod relation;
pub mod tree;

pub use builder::LogicalPlanBuilder;
pub use catalog::Catalog;
pub use expr::{col, count, count_star, lit, max, min, sum, Expr};
pub use fingerprint::{fingerprint, subtree_keys, LogicalPlanKey};
pub use logical_plan::*;
pub use relation::{CachedRelation, PlanExecutor};
pub use tree::Transformed;
