//! Physical properties of partitioned data
//!
//! Describes how rows are distributed across partitions and which sort order
//! they are guaranteed to follow. Cached relations carry these descriptors so
//! that the planner can skip exchanges over data that is already laid out.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How rows are distributed across partitions
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Partitioning {
    /// Rows are placed by hashing the key columns, in this order
    Hash {
        key_columns: Vec<String>,
        num_partitions: usize,
    },

    /// Rows are spread without any key relationship
    RoundRobin { num_partitions: usize },

    /// All rows live in one partition
    Single,
}

impl Partitioning {
    pub fn hash(key_columns: Vec<String>, num_partitions: usize) -> Self {
        Partitioning::Hash {
            key_columns,
            num_partitions,
        }
    }

    pub fn num_partitions(&self) -> usize {
        match self {
            Partitioning::Hash { num_partitions, .. } => *num_partitions,
            Partitioning::RoundRobin { num_partitions } => *num_partitions,
            Partitioning::Single => 1,
        }
    }

    /// Whether rows with equal values in `keys` are guaranteed to share a
    /// partition, with keys matched position for position.
    pub fn is_hash_on(&self, keys: &[String]) -> bool {
        match self {
            Partitioning::Hash { key_columns, .. } => key_columns.as_slice() == keys,
            Partitioning::Single => true,
            Partitioning::RoundRobin { .. } => false,
        }
    }

    /// Rename key columns through `map`; keys that do not survive make the
    /// distribution unknown.
    pub fn project(&self, map: impl Fn(&str) -> Option<String>) -> Partitioning {
        match self {
            Partitioning::Hash {
                key_columns,
                num_partitions,
            } => {
                let projected: Option<Vec<String>> =
                    key_columns.iter().map(|k| map(k)).collect();
                match projected {
                    Some(key_columns) => Partitioning::Hash {
                        key_columns,
                        num_partitions: *num_partitions,
                    },
                    None => Partitioning::RoundRobin {
                        num_partitions: *num_partitions,
                    },
                }
            }
            other => other.clone(),
        }
    }
}

impl fmt::Display for Partitioning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Partitioning::Hash {
                key_columns,
                num_partitions,
            } => write!(f, "hash({}; {})", key_columns.join(", "), num_partitions),
            Partitioning::RoundRobin { num_partitions } => {
                write!(f, "round_robin({})", num_partitions)
            }
            Partitioning::Single => write!(f, "single"),
        }
    }
}

/// One column of a sort order
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortKey {
    pub column: String,
    pub ascending: bool,
    pub nulls_first: bool,
}

impl SortKey {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: true,
            nulls_first: false,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: false,
            nulls_first: true,
        }
    }
}
