use thiserror::Error;

/// Typed application error hierarchy for the merge services and migrations.
///
/// Repository code returns `anyhow::Result`; anything crossing the service
/// boundary is converted into one of these variants so callers can match on
/// the failure kind or propagate it with `?`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A repository read needed by the merge planner failed.
    #[error("Lookup failed: {0}")]
    LookupFailed(String),

    #[error("{0}")]
    Io(String),

    #[error("{0}")]
    Json(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("A migration pass is already running")]
    MigrationInProgress,

    #[error("{0}")]
    Other(String),
}

impl AppError {
    /// Re-tag any error as a failed lookup, keeping its message.
    pub fn lookup(e: impl std::fmt::Display) -> Self {
        AppError::LookupFailed(e.to_string())
    }
}

// ── From impls ─────────────────────────────────────────────────────────────

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Json(e.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(e: serde_yaml::Error) -> Self {
        AppError::Config(e.to_string())
    }
}

/// Allows `ok_or_else(|| format!(…))?` to coerce into AppError.
impl From<String> for AppError {
    fn from(s: String) -> Self {
        AppError::Other(s)
    }
}

/// Allows `.ok_or("literal string")?` to coerce into AppError.
impl From<&str> for AppError {
    fn from(s: &str) -> Self {
        AppError::Other(s.to_string())
    }
}
