use thiserror::Error;

pub type AppResult<T> = std::result::Result<T, AppError>;

#[derive(Error, Debug)]
pub enum AppError {
    /// Module, batch, batch result or history file is missing.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("record not saved: {target}")]
    RecordNotSaved {
        target: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("execution unit not created for <{version_id}>")]
    ExecutionUnitNotCreated {
        version_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("validation failed: {0}")]
    ValidationFailed(String),
}

impl AppError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn not_saved(target: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::RecordNotSaved {
            target: target.into(),
            source: source.into(),
        }
    }

    /// Stable machine-readable code, used in logs and notification payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::RecordNotSaved { .. } => "RECORD_NOT_SAVED",
            Self::RateLimitExceeded(_) => "RATE_LIMIT_EXCEEDED",
            Self::ExecutionUnitNotCreated { .. } => "EXECUTION_UNIT_NOT_CREATED",
            Self::ValidationFailed(_) => "VALIDATION_FAILED",
        }
    }
}
