use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Analysis error: {0}")]
    AnalysisError(String),

    #[error("Planning error: {0}")]
    PlanningError(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Schema error: {0}")]
    SchemaError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Arrow error: {0}")]
    ArrowError(#[from] arrow::error::ArrowError),

    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    #[error("Table or view not found: {0}")]
    TableNotFound(String),

    #[error("Table or view is not cached: {0}")]
    NotCached(String),

    #[error("Materialization failed: {0}")]
    MaterializationFailed(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl QueryError {
    /// True for errors that leave a cache entry retryable rather than broken
    pub fn is_materialization_failure(&self) -> bool {
        matches!(self, QueryError::MaterializationFailed(_))
    }
}

pub type Result<T> = std::result::Result<T, QueryError>;
