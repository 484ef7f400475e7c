use sqlx::error::ErrorKind;
use thiserror::Error;

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid state for {id} (status: {status}): {detail}")]
    InvalidState {
        id: String,
        status: String,
        detail: String,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Balance source error: {0}")]
    Balance(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        AppError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn invalid_state(
        id: impl Into<String>,
        status: impl std::fmt::Display,
        detail: impl Into<String>,
    ) -> Self {
        AppError::InvalidState {
            id: id.into(),
            status: status.to_string(),
            detail: detail.into(),
        }
    }

    /// Constraint violations and SQLite busy/locked errors, i.e. another writer
    /// got there first. Everything else is a real failure.
    pub fn is_write_conflict(&self) -> bool {
        let AppError::Database(sqlx::Error::Database(db)) = self else {
            return false;
        };
        if matches!(
            db.kind(),
            ErrorKind::UniqueViolation | ErrorKind::ForeignKeyViolation | ErrorKind::CheckViolation
        ) {
            return true;
        }
        // extended result codes keep the primary code in the low byte
        db.code()
            .and_then(|c| c.parse::<i32>().ok())
            .is_some_and(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
    }
}
