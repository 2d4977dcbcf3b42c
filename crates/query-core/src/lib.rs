pub mod error;
pub mod partition;
pub mod properties;
pub mod schema;
pub mod types;

pub use error::{QueryError, Result};
pub use partition::Partition;
pub use properties::{Partitioning, SortKey};
pub use schema::{Field, Schema};
pub use types::*;
