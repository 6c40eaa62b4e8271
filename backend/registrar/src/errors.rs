//! Application-wide error types.

use thiserror::Error;

/// Infrastructure failures: storage, configuration, serialization.
#[derive(Debug, Error)]
pub enum RegistrarError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, RegistrarError>;

/// Failures surfaced to API callers.
///
/// `Internal` wraps infrastructure errors; its detail is logged and never
/// returned in a response.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Gateway(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(#[from] RegistrarError),
}
