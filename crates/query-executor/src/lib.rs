//! Partition-wise execution of logical plans over tables and cached data
//!
//! Plans are first rewritten so that every subtree with a cache entry reads
//! that entry, then lowered to a physical plan whose exchanges are placed
//! from the partitioning each input reports.

pub mod cached_scan;
pub mod exchange;
pub mod executor;
pub mod operators;
pub mod partition;
pub mod physical_plan;
pub mod physical_planner;
pub mod rewriter;
pub mod source;

pub use cached_scan::CachedScanNode;
pub use exchange::{ExchangePlanner, JoinExchange};
pub use executor::QueryExecutor;
pub use partition::Partitioner;
pub use physical_plan::{AggregateExpr, BinaryOp, PhysicalExpr, PhysicalPlan, PhysicalSortExpr};
pub use physical_planner::{enforce_partitioning, PhysicalPlanner};
pub use rewriter::PlanRewriter;
pub use source::{DataSource, MemoryTable, SourceRegistry};
