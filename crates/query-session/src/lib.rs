//! Session layer: catalog, cache and executor behind one context
//!
//! Cache management is reachable two ways: as [`CacheStatement`]s
//! (`CACHE TABLE`, `UNCACHE TABLE`, `CLEAR CACHE`) and through
//! [`Dataset::cache`], [`Dataset::persist`] and [`Dataset::unpersist`].

pub mod dataset;
pub mod session;
pub mod statement;

pub use dataset::Dataset;
pub use session::Session;
pub use statement::CacheStatement;
