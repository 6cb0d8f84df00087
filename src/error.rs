// src/error.rs

use std::time::Duration;

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use log::error;
use mongodb::error::{ErrorKind, WriteFailure};
use serde_json::json;
use thiserror::Error;

use crate::models::UnresolvedRef;

const DUPLICATE_KEY: i32 = 11000;

// ─── REPOSITORY ───────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("duplicate key: {0}")]
    Duplicate(String),

    #[error("database error: {0}")]
    Database(#[source] mongodb::error::Error),

    #[error("database call exceeded {0:?}")]
    Timeout(Duration),

    #[error("could not encode document: {0}")]
    Serialization(#[from] mongodb::bson::ser::Error),

    #[error("stored document is corrupt: {0}")]
    Corrupt(String),
}

impl From<mongodb::error::Error> for RepositoryError {
    fn from(err: mongodb::error::Error) -> Self {
        if is_duplicate_key(&err) {
            RepositoryError::Duplicate(err.to_string())
        } else {
            RepositoryError::Database(err)
        }
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => write_error.code == DUPLICATE_KEY,
        _ => false,
    }
}

// ─── SERVICE ──────────────────────────────────────────────────────────────────

/// Failures a service hands back to its caller. Every variant maps to one
/// transport status in [`ApiError`].
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unauthenticated(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{0}")]
    Conflict(String),

    #[error("{context}: {source}")]
    Upstream {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("dependency {0} used before the registry barrier")]
    Unwired(&'static str),

    #[error(transparent)]
    Unresolved(#[from] UnresolvedRef),
}

impl ServiceError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        ServiceError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn upstream<E>(context: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        ServiceError::Upstream {
            context: context.into(),
            source: Box::new(source),
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Attaches the failing operation to a repository error. Duplicate keys turn
/// into conflicts carrying `duplicate`'s message when one is given.
pub trait RepositoryResultExt<T> {
    fn context(self, context: &str) -> ServiceResult<T>;
    fn on_duplicate(self, message: impl FnOnce() -> String) -> ServiceResult<T>;
}

impl<T> RepositoryResultExt<T> for Result<T, RepositoryError> {
    fn context(self, context: &str) -> ServiceResult<T> {
        self.map_err(|err| match err {
            RepositoryError::Duplicate(msg) => ServiceError::Conflict(msg),
            other => ServiceError::upstream(context, other),
        })
    }

    fn on_duplicate(self, message: impl FnOnce() -> String) -> ServiceResult<T> {
        self.map_err(|err| match err {
            RepositoryError::Duplicate(_) => ServiceError::Conflict(message()),
            other => ServiceError::upstream("could not save", other),
        })
    }
}

// ─── TRANSPORT ────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Validation(msg) => ApiError::BadRequest(msg),
            ServiceError::Unauthenticated(msg) => ApiError::Unauthorized(msg),
            ServiceError::Forbidden(msg) => ApiError::Forbidden(msg),
            err @ ServiceError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            ServiceError::Conflict(msg) => ApiError::Conflict(msg),
            other => {
                error!("Request failed: {}", other);
                ApiError::Internal("internal server error".to_string())
            }
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_errors_map_to_statuses() {
        let cases = vec![
            (ServiceError::Validation("bad".into()), StatusCode::BAD_REQUEST),
            (ServiceError::Unauthenticated("who".into()), StatusCode::UNAUTHORIZED),
            (ServiceError::Forbidden("no".into()), StatusCode::FORBIDDEN),
            (ServiceError::not_found("team", "abc"), StatusCode::NOT_FOUND),
            (ServiceError::Conflict("again".into()), StatusCode::CONFLICT),
            (ServiceError::Unwired("user"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status_code(), status);
        }
    }

    #[test]
    fn upstream_details_stay_out_of_the_response() {
        let err = ServiceError::upstream(
            "could not save team",
            RepositoryError::Corrupt("secret detail".into()),
        );
        let api = ApiError::from(err);
        assert_eq!(api.to_string(), "internal server error");
    }

    #[test]
    fn duplicate_repository_errors_become_conflicts() {
        let res: Result<(), RepositoryError> = Err(RepositoryError::Duplicate("E11000".into()));
        let err = res.on_duplicate(|| "name taken".to_string()).unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(msg) if msg == "name taken"));
    }
}
