//! Error taxonomy for the service.
//!
//! Validation errors are raised before any write happens; store errors abort
//! the mutation they belong to. Mail transport failures only fail the request
//! when sending mail *is* the request.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

/// Result type used across the service.
pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    /// Expense amount was zero, negative or not a number.
    #[error("amount must be a positive number, got {0}")]
    InvalidAmount(f64),

    /// The split selector didn't name a known split mode.
    #[error("unknown split mode: {0}")]
    InvalidSplitMode(String),

    /// A required field was empty or missing.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} already exists: {id}")]
    AlreadyExists { entity: &'static str, id: String },

    /// Resending an invitation for a friend whose counterparty has already
    /// registered.
    #[error("invitation is no longer pending for friend {0}")]
    InvitationNotPending(String),

    /// A friend is marked as registered but the reciprocal ledger record
    /// could not be resolved. The mutation is aborted, nothing is written.
    #[error("reciprocal friend record not found for friend {friend_id}")]
    ReciprocalNotFound { friend_id: String },

    #[error("database error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("serialization error: {0}")]
    Bson(#[from] bson::ser::Error),

    #[error("mail error: {0}")]
    Mail(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl AppError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    fn code(&self) -> &'static str {
        match self {
            AppError::InvalidAmount(_) => "invalid_amount",
            AppError::InvalidSplitMode(_) => "invalid_split_mode",
            AppError::MissingField(_) => "missing_field",
            AppError::NotFound { .. } => "not_found",
            AppError::AlreadyExists { .. } => "already_exists",
            AppError::InvitationNotPending(_) => "invitation_not_pending",
            AppError::ReciprocalNotFound { .. } => "reciprocal_not_found",
            AppError::Database(_) => "database_error",
            AppError::Bson(_) => "serialization_error",
            AppError::Mail(_) => "mail_error",
            AppError::Config(_) => "config_error",
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidAmount(_)
            | AppError::InvalidSplitMode(_)
            | AppError::MissingField(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound { .. } => StatusCode::NOT_FOUND,
            AppError::AlreadyExists { .. } | AppError::InvitationNotPending(_) => {
                StatusCode::CONFLICT
            }
            AppError::ReciprocalNotFound { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Database(_) | AppError::Bson(_) | AppError::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::Mail(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if self.status_code().is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        HttpResponse::build(self.status_code()).json(json!({
            "error": self.code(),
            "message": self.to_string(),
        }))
    }
}
