use std::fmt;

/// Which bounded slot pool an operation drew from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    Streaming,
    Detection,
}

impl PoolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolKind::Streaming => "streaming",
            PoolKind::Detection => "detection",
        }
    }
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Core error type for camwatch
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Capacity exceeded for {pool} pool: {in_use}/{capacity} slots in use")]
    CapacityExceeded {
        pool: PoolKind,
        in_use: usize,
        capacity: usize,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Capability failure: {0}")]
    CapabilityFailure(String),

    #[error("Already running: {0}")]
    AlreadyRunning(String),

    #[error("Camera set must not be empty")]
    EmptySet,

    #[error("Window of {minutes} minutes is outside {min}..={max}")]
    WindowOutOfRange { minutes: u32, min: u32, max: u32 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the caller may reasonably retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::CapacityExceeded { .. })
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
