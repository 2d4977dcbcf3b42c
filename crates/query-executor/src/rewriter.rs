//! Substitutes cached materializations into logical plans

use query_cache::CacheManager;
use query_core::Result;
use query_planner::{fingerprint, CachedRelation, LogicalPlan, LogicalPlanKey, Transformed};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Replaces every subtree that has a cache entry with a read of that entry.
///
/// Rewriting is bottom-up, so an outer cached subtree wins over the cached
/// subtrees inside it. Each substitution gets its own scan id, which keeps
/// the two sides of a self-join distinct.
#[derive(Debug)]
pub struct PlanRewriter {
    cache: Arc<CacheManager>,
    next_scan_id: AtomicUsize,
}

impl PlanRewriter {
    pub fn new(cache: Arc<CacheManager>) -> Self {
        Self {
            cache,
            next_scan_id: AtomicUsize::new(0),
        }
    }

    pub fn rewrite(&self, plan: &LogicalPlan) -> Result<LogicalPlan> {
        self.rewrite_excluding(plan, None)
    }

    /// Rewrite without substituting the entry `excluded`, which is the one
    /// being populated when a cache entry materializes itself.
    pub fn rewrite_excluding(
        &self,
        plan: &LogicalPlan,
        excluded: Option<&LogicalPlanKey>,
    ) -> Result<LogicalPlan> {
        let (rewritten, substitutions) = self.substitute(plan, excluded)?;
        let stats = self.cache.stats();
        if substitutions == 0 {
            stats.record_miss();
        }
        for _ in 0..substitutions {
            stats.record_hit();
        }
        Ok(rewritten)
    }

    /// Rewrite without touching the hit and miss counters; returns the
    /// number of substitutions made
    pub fn substitute(
        &self,
        plan: &LogicalPlan,
        excluded: Option<&LogicalPlanKey>,
    ) -> Result<(LogicalPlan, usize)> {
        if !self.cache.is_enabled() || self.cache.is_empty() {
            return Ok((plan.clone(), 0));
        }

        let mut substitutions = 0usize;
        let rewritten = plan
            .transform_up(&mut |node: LogicalPlan| {
                // Aliases share their input's key; the input is substituted instead.
                if matches!(
                    node,
                    LogicalPlan::CachedRelation { .. } | LogicalPlan::SubqueryAlias { .. }
                ) {
                    return Ok(Transformed::No(node));
                }
                let key = fingerprint(&node);
                if excluded == Some(&key) {
                    return Ok(Transformed::No(node));
                }
                match self.cache.lookup_key(&key) {
                    Some(set) => {
                        let scan_id = self.next_scan_id.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            "Substituting cached {} for {} (scan #{})",
                            set.id(),
                            node.name(),
                            scan_id
                        );
                        substitutions += 1;
                        Ok(Transformed::Yes(LogicalPlan::CachedRelation {
                            relation: set as Arc<dyn CachedRelation>,
                            scan_id,
                        }))
                    }
                    None => Ok(Transformed::No(node)),
                }
            })?
            .into_inner();
        Ok((rewritten, substitutions))
    }
}
