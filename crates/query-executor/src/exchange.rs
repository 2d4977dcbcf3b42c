//! Exchange placement
//!
//! Decides, from the partitioning children already have, where rows must be
//! redistributed before joins, aggregations, sorts and limits. Decisions are
//! pure; the physical planner inserts the exchange operators.

use query_core::Partitioning;
use std::collections::HashSet;

/// Exchanges required on the two sides of a join
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JoinExchange {
    pub left: Option<Partitioning>,
    pub right: Option<Partitioning>,
}

impl JoinExchange {
    pub fn count(&self) -> usize {
        usize::from(self.left.is_some()) + usize::from(self.right.is_some())
    }
}

#[derive(Debug, Clone)]
pub struct ExchangePlanner {
    default_partitions: usize,
}

impl ExchangePlanner {
    pub fn new(default_partitions: usize) -> Self {
        Self {
            default_partitions: default_partitions.max(1),
        }
    }

    pub fn default_partitions(&self) -> usize {
        self.default_partitions
    }

    /// Plan the exchanges for an equi-join on `left_keys[i] = right_keys[i]`.
    ///
    /// A side is usable as is when it is hash partitioned on exactly its join
    /// keys, in order, or is a single partition. When both sides are usable
    /// with the same partition count nothing moves. Otherwise the usable side
    /// with the most partitions is kept and the other side is hashed to match
    /// it; when neither side is usable both are hashed to the default count.
    pub fn plan_join(
        &self,
        left: &Partitioning,
        right: &Partitioning,
        left_keys: &[String],
        right_keys: &[String],
    ) -> JoinExchange {
        let left_ok = !left_keys.is_empty() && left.is_hash_on(left_keys);
        let right_ok = !right_keys.is_empty() && right.is_hash_on(right_keys);
        let (ln, rn) = (left.num_partitions(), right.num_partitions());

        let hash_left = |n| Some(Partitioning::hash(left_keys.to_vec(), n));
        let hash_right = |n| Some(Partitioning::hash(right_keys.to_vec(), n));

        let decision = match (left_ok, right_ok) {
            (true, true) if ln == rn => JoinExchange::default(),
            (true, true) if ln > rn => JoinExchange {
                left: None,
                right: hash_right(ln),
            },
            (true, true) => JoinExchange {
                left: hash_left(rn),
                right: None,
            },
            (true, false) => JoinExchange {
                left: None,
                right: hash_right(ln),
            },
            (false, true) => JoinExchange {
                left: hash_left(rn),
                right: None,
            },
            (false, false) => JoinExchange {
                left: hash_left(self.default_partitions),
                right: hash_right(self.default_partitions),
            },
        };
        tracing::debug!(
            "Join exchange for {} / {}: {} side(s) reshuffled",
            left,
            right,
            decision.count()
        );
        decision
    }

    /// Exchange before aggregating `input` by `group_columns`, if any.
    ///
    /// Hash partitioning on any subset of the grouping columns already keeps
    /// every group in one partition.
    pub fn plan_aggregate(
        &self,
        input: &Partitioning,
        group_columns: &[String],
    ) -> Option<Partitioning> {
        if group_columns.is_empty() {
            return self.plan_gather(input);
        }
        match input {
            Partitioning::Single => None,
            Partitioning::Hash { key_columns, .. } if !key_columns.is_empty() => {
                let groups: HashSet<&String> = group_columns.iter().collect();
                if key_columns.iter().all(|k| groups.contains(k)) {
                    None
                } else {
                    Some(Partitioning::hash(
                        group_columns.to_vec(),
                        self.default_partitions,
                    ))
                }
            }
            _ => Some(Partitioning::hash(
                group_columns.to_vec(),
                self.default_partitions,
            )),
        }
    }

    /// Exchange that brings all rows into one partition, if needed
    pub fn plan_gather(&self, input: &Partitioning) -> Option<Partitioning> {
        match input {
            Partitioning::Single => None,
            _ => Some(Partitioning::Single),
        }
    }
}

impl Default for ExchangePlanner {
    fn default() -> Self {
        Self::new(8)
    }
}
