use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Request-level failure, as seen by the HTTP caller.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Missing or invalid input. Nothing was changed.
    #[error("{0}")]
    Precondition(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Ingestion(String),
    #[error("{0}")]
    Retrieval(String),
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::Precondition(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Ingestion(_) | ServiceError::Retrieval(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ServiceError::Precondition("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(ServiceError::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(ServiceError::Ingestion("x".into()).status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(ServiceError::Retrieval("x".into()).status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_response_carries_message() {
        let response = ServiceError::NotFound("No database found for docs".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
