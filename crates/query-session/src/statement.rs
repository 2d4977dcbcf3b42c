//! Cache management statements

use query_cache::StorageLevel;
use query_planner::LogicalPlan;
use std::fmt;

/// `CACHE [LAZY] TABLE`, `UNCACHE TABLE` and `CLEAR CACHE`, already analyzed
#[derive(Debug, Clone)]
pub enum CacheStatement {
    /// `CACHE [LAZY] TABLE name [OPTIONS ('storageLevel' ...)] [AS query]`
    CacheTable {
        name: String,
        lazy: bool,
        /// With a query, `name` is registered as a temporary view over it
        query: Option<LogicalPlan>,
        /// Falls back to the configured default level
        storage_level: Option<StorageLevel>,
    },
    /// `UNCACHE TABLE [IF EXISTS] name`
    UncacheTable { name: String, if_exists: bool },
    /// `CLEAR CACHE`
    ClearCache,
}

impl CacheStatement {
    pub fn cache_table(name: impl Into<String>) -> Self {
        CacheStatement::CacheTable {
            name: name.into(),
            lazy: false,
            query: None,
            storage_level: None,
        }
    }

    pub fn cache_lazy(name: impl Into<String>) -> Self {
        CacheStatement::CacheTable {
            name: name.into(),
            lazy: true,
            query: None,
            storage_level: None,
        }
    }

    /// `CACHE TABLE name AS query`
    pub fn cache_as(name: impl Into<String>, query: LogicalPlan) -> Self {
        CacheStatement::CacheTable {
            name: name.into(),
            lazy: false,
            query: Some(query),
            storage_level: None,
        }
    }

    pub fn uncache(name: impl Into<String>) -> Self {
        CacheStatement::UncacheTable {
            name: name.into(),
            if_exists: false,
        }
    }

    pub fn uncache_if_exists(name: impl Into<String>) -> Self {
        CacheStatement::UncacheTable {
            name: name.into(),
            if_exists: true,
        }
    }

    /// Set the storage level of a `CACHE TABLE` statement; other statements
    /// are returned unchanged
    pub fn with_storage_level(mut self, level: StorageLevel) -> Self {
        if let CacheStatement::CacheTable { storage_level, .. } = &mut self {
            *storage_level = Some(level);
        }
        self
    }

    /// Make a `CACHE TABLE` statement lazy
    pub fn lazy(mut self) -> Self {
        if let CacheStatement::CacheTable { lazy, .. } = &mut self {
            *lazy = true;
        }
        self
    }
}

impl fmt::Display for CacheStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheStatement::CacheTable {
                name,
                lazy,
                query,
                storage_level,
            } => {
                write!(f, "CACHE {}TABLE {}", if *lazy { "LAZY " } else { "" }, name)?;
                if let Some(level) = storage_level {
                    write!(f, " OPTIONS ('storageLevel' '{}')", level)?;
                }
                if query.is_some() {
                    write!(f, " AS <query>")?;
                }
                Ok(())
            }
            CacheStatement::UncacheTable { name, if_exists } => write!(
                f,
                "UNCACHE TABLE {}{}",
                if *if_exists { "IF EXISTS " } else { "" },
                name
            ),
            CacheStatement::ClearCache => write!(f, "CLEAR CACHE"),
        }
    }
}
