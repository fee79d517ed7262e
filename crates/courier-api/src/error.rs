use axum::http::StatusCode;
use tracing::error;

use courier_engine::EngineError;

/// Map an engine error to its HTTP status. Database failures are logged
/// here so handlers can stay terse.
pub fn engine_status(e: EngineError) -> StatusCode {
    match e {
        EngineError::Permission(_) | EngineError::NotMember => StatusCode::FORBIDDEN,
        EngineError::AlreadyMember
        | EngineError::CannotRemoveOwner
        | EngineError::InvalidTransition { .. } => StatusCode::CONFLICT,
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        EngineError::DeliveryExhausted(_) => StatusCode::GONE,
        EngineError::Db(e) => {
            error!("Database error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

pub fn join_error(e: tokio::task::JoinError) -> StatusCode {
    error!("spawn_blocking join error: {}", e);
    StatusCode::INTERNAL_SERVER_ERROR
}
