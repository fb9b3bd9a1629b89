//! Error types for the sync server.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use sync_core::MergeError;
use sync_types::{EntityId, EntityType, MutationId, Version};

/// Main error type for server startup and operation.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Stored JSON could not be encoded or decoded.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A stored row holds a value the model cannot represent.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Why an event can never be committed.
///
/// Surfaced to the device as a `rejected` result; the device drops the event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Entity id empty or too long.
    #[error("invalid entity id: {0:?}")]
    InvalidEntityId(String),

    /// Payload has the wrong shape for its operation.
    #[error(transparent)]
    Payload(#[from] MergeError),

    /// Payload larger than the configured limit.
    #[error("payload too large: {size} bytes (limit: {limit} bytes)")]
    PayloadTooLarge {
        /// Encoded size of the payload.
        size: usize,
        /// Maximum allowed size.
        limit: usize,
    },

    /// Create events must be based on version 0.
    #[error("create must be based on version 0, got {0}")]
    CreateNotInitial(Version),

    /// Update or delete of an entity the server has never seen.
    #[error("unknown entity: {entity_type} {entity_id}")]
    UnknownEntity {
        /// Kind of entity.
        entity_type: EntityType,
        /// Entity id.
        entity_id: EntityId,
    },

    /// Update or delete of a tombstoned entity.
    #[error("entity has been deleted: {entity_type} {entity_id}")]
    EntityDeleted {
        /// Kind of entity.
        entity_type: EntityType,
        /// Entity id.
        entity_id: EntityId,
    },

    /// The mutation id was already committed by another family.
    #[error("mutation id {0} already used")]
    MutationIdReused(MutationId),

    /// More events in one push than the server accepts.
    #[error("batch too large: {size} events (limit: {limit})")]
    BatchTooLarge {
        /// Events in the batch.
        size: usize,
        /// Maximum allowed events.
        limit: usize,
    },
}

/// Session registration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    /// The hub is shutting down and accepts no new sessions.
    #[error("notification hub is draining")]
    Draining,

    /// The session limit is reached.
    #[error("too many sessions (limit: {limit})")]
    TooManySessions {
        /// Maximum live sessions.
        limit: usize,
    },
}

/// Error returned by API handlers, mapped onto an HTTP status.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Missing or invalid credentials.
    #[error("{0}")]
    Unauthorized(&'static str),

    /// Body could not be decoded or is invalid.
    #[error("{0}")]
    BadRequest(String),

    /// Batch or body over the configured limit.
    #[error("{0}")]
    TooLarge(String),

    /// Temporarily unable to serve (draining, overloaded, timed out).
    #[error("{0}")]
    Unavailable(String),

    /// Server-side failure.
    #[error("internal error")]
    Internal,
}

/// JSON error body.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::BadRequest(_) => "bad_request",
            ApiError::TooLarge(_) => "too_large",
            ApiError::Unavailable(_) => "unavailable",
            ApiError::Internal => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.code(),
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        tracing::error!("Storage failure: {}", e);
        ApiError::Internal
    }
}

impl From<HubError> for ApiError {
    fn from(e: HubError) -> Self {
        ApiError::Unavailable(e.to_string())
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        match e {
            ValidationError::BatchTooLarge { .. } | ValidationError::PayloadTooLarge { .. } => {
                ApiError::TooLarge(e.to_string())
            }
            other => ApiError::BadRequest(other.to_string()),
        }
    }
}

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
