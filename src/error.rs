// =============================================================================
// error.rs — EVERYTHING THAT CAN GO WRONG, SORTED BY BLAST RADIUS
// =============================================================================
//
// Three families of failure, three enums:
//
//   ConfigError   the run cannot even begin (no credentials, no driver)
//   StorageError  the transaction went sideways and was rolled back
//   ScrapeError   what the engine sees; wraps the other two and adds the
//                 per-unit network and parse failures
//
// Per-unit errors are swallowed by the coordinator. Run-level errors are
// swallowed by the engine and written into the run report. Nothing in this
// file is ever allowed to take the process down.
// =============================================================================

use std::fmt;

use thiserror::Error;

/// The run could not be configured. Fatal for that run, never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// One or more database parameters are missing. Lists every missing key
    /// at once so the operator fixes them in one pass.
    #[error("missing database configuration parameters: {}", .0.join(", "))]
    MissingParameters(Vec<&'static str>),

    #[error("failed to read settings file {path}: {message}")]
    SettingsFile { path: String, message: String },

    /// Every connection strategy was tried and every one of them refused.
    #[error("no connection strategy succeeded: {}", .attempts.join("; "))]
    NoConnectionStrategy { attempts: Vec<String> },

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),

    #[error("invalid base url {url}: {message}")]
    BaseUrl { url: String, message: String },
}

/// Which step of the storage protocol failed. Carried by
/// [`StorageError::Statement`] so the logs say *where* the transaction died.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageStage {
    Begin,
    Delete,
    Insert,
    Commit,
    Rollback,
    Query,
    Close,
    Schema,
}

impl fmt::Display for StorageStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StorageStage::Begin => "begin",
            StorageStage::Delete => "delete",
            StorageStage::Insert => "insert",
            StorageStage::Commit => "commit",
            StorageStage::Rollback => "rollback",
            StorageStage::Query => "query",
            StorageStage::Close => "close",
            StorageStage::Schema => "schema",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    /// A record does not fit the destination's insert contract. Detected
    /// before any connection is opened.
    #[error("record {index} does not match the {table} insert contract: {reason}")]
    Shape {
        table: &'static str,
        index: usize,
        reason: String,
    },

    #[error("storage {stage} failed: {message}")]
    Statement { stage: StorageStage, message: String },
}

impl StorageError {
    pub fn statement(stage: StorageStage, err: impl fmt::Display) -> Self {
        StorageError::Statement {
            stage,
            message: err.to_string(),
        }
    }

    /// The failing stage, when the error came from a statement.
    pub fn stage(&self) -> Option<StorageStage> {
        match self {
            StorageError::Statement { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error("network error for {unit}: {message}")]
    Network { unit: String, message: String },

    #[error("parse error for {unit}: {message}")]
    Parse { unit: String, message: String },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("scrape cancelled before storing")]
    Cancelled,
}

impl ScrapeError {
    pub fn network(unit: impl Into<String>, message: impl fmt::Display) -> Self {
        ScrapeError::Network {
            unit: unit.into(),
            message: message.to_string(),
        }
    }

    pub fn parse(unit: impl Into<String>, message: impl fmt::Display) -> Self {
        ScrapeError::Parse {
            unit: unit.into(),
            message: message.to_string(),
        }
    }
}
