//! Typed error enums for each component, per the error taxonomy.
//!
//! Each enum models one *kind* of failure, not a single type hierarchy:
//! config errors are fatal at startup, parse/schema errors are fatal during
//! reconciliation, upstream/partial-write errors are retried or recorded and
//! skipped. Collector boundaries convert all of these into `anyhow::Error`
//! and push them onto the run's error list rather than aborting the process.

use thiserror::Error;

/// Failures from the time-literal and unit parser (component A).
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("no numeric portion found in '{0}'")]
    NoNumber(String),
    #[error("unknown unit '{unit}' in literal '{literal}'")]
    UnknownUnit { literal: String, unit: String },
    #[error("empty literal")]
    Empty,
}

/// Failures raised while declaring or reconciling the schema catalog
/// (component C).
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("multiple retention policies declared as default in database '{0}'")]
    MultipleDefaultRps(String),
    #[error("continuous query '{0}' has no INTO clause")]
    ContinuousQueryMissingInto(String),
    #[error("retention policy '{0}' referenced but not declared")]
    UnknownRetentionPolicy(String),
    #[error("measurement '{0}' is not declared in the catalog")]
    UnknownMeasurement(String),
    #[error("cannot build insert statement: {0}")]
    EmptyInsert(String),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Failures from the TSDB HTTP client (component D).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("http transport error: {0}")]
    Transport(String),
    #[error("TSDB responded with status {status}: {body}")]
    Server { status: u16, body: String },
    #[error("partial write: {dropped} point(s) beyond retention policy dropped (batch size {batch_size})")]
    RetentionTruncated { dropped: usize, batch_size: usize },
    #[error("partial write: unable to parse some points: {0}")]
    PartialParseFailure(String),
    #[error("write failed and is retryable with a smaller batch: {0}")]
    Retryable(String),
    #[error("database copy produced a critical drop for statement: {0}")]
    CopyCriticalDrop(String),
}

/// Failures from the REST paginator (component F).
#[derive(Debug, Error)]
pub enum PaginatorError {
    #[error("request timed out after {retries} retries at page_size={page_size}, pageStartIndex={page_start_index:?}")]
    Timeout {
        retries: u32,
        page_size: u32,
        page_start_index: Option<String>,
    },
    #[error("http transport error: {0}")]
    Transport(String),
    #[error("expected array under key '{0}' but response was a single object")]
    ExpectedArray(String),
    #[error("login failed: {0}")]
    LoginFailed(String),
}

/// Failures from the job-log harvester (component G).
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("failed to fetch logs for session {session_id}: {source}")]
    LogFetchFailed { session_id: String, source: String },
    #[error("atomic swap failed: {0}")]
    SwapFailed(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Paginator(#[from] PaginatorError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Failures while loading the JSON config file (component I).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required config key '{0}'")]
    MissingKey(String),
    #[error("config value for '{0}' has the wrong type")]
    WrongType(String),
    #[error("failed to read config file '{path}': {source}")]
    Io { path: String, source: std::io::Error },
    #[error("failed to parse config file as JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// One recorded failure in a collector's run, flushed into the self-metrics
/// row at shutdown (§7 propagation policy).
#[derive(Debug, Clone)]
pub struct CollectorError {
    pub collector: String,
    pub message: String,
}

impl CollectorError {
    pub fn new(collector: impl Into<String>, error: &anyhow::Error) -> Self {
        Self {
            collector: collector.into(),
            message: format!("{error:#}"),
        }
    }
}
