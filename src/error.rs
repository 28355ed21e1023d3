use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::api::envelope::Envelope;
use crate::scheduler::{PartyRef, Status};

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Invalid job spec: {0}")]
    InvalidSpec(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid status transition for {key}: {from} -> {to}")]
    InvalidTransition { key: String, from: Status, to: Status },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Propagation to {party} failed: {reason}")]
    Propagation { party: PartyRef, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FlowError {
    /// Envelope code for this error. 0 is reserved for success.
    pub fn retcode(&self) -> i32 {
        match self {
            FlowError::NotFound(_) => 101,
            FlowError::InvalidSpec(_) => 102,
            FlowError::InvalidTransition { .. } => 103,
            FlowError::InvalidState(_) => 104,
            FlowError::Unauthorized(_) => 105,
            FlowError::AlreadyExists(_) => 106,
            FlowError::Propagation { .. }
            | FlowError::Io(_)
            | FlowError::Json(_)
            | FlowError::Internal(_) => 100,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self.retcode() {
            101 => StatusCode::NOT_FOUND,
            102 => StatusCode::BAD_REQUEST,
            103 | 104 | 106 => StatusCode::CONFLICT,
            105 => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for FlowError {
    fn into_response(self) -> Response {
        if self.retcode() == 100 {
            tracing::error!(error = %self, "Request failed with internal error");
        } else {
            tracing::debug!(error = %self, retcode = self.retcode(), "Request rejected");
        }
        let body = Envelope::error(self.retcode(), self.to_string());
        (self.status_code(), Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
