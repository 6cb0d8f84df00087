// src/controllers/mod.rs

mod auth;
mod boxes;
mod team;
mod user;

use std::future::Future;
use std::sync::{Arc, OnceLock};

use serde_json::Value;

use crate::error::{ApiError, ServiceError, ServiceResult};
use crate::schema::{Field, ResolveContext, Resolved};

pub use auth::AuthController;
pub use boxes::BoxController;
pub use team::TeamController;
pub use user::UserController;

/// A field whose resolver is a method of `controller`.
fn bind<C, F, Fut>(controller: &Arc<C>, resolve: F) -> Field
where
    C: Send + Sync + 'static,
    F: Fn(Arc<C>, ResolveContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Resolved> + Send + 'static,
{
    let controller = Arc::clone(controller);
    Field::new(move |ctx| resolve(Arc::clone(&controller), ctx))
}

fn wrong_source(expected: &str) -> ApiError {
    ApiError::Internal(format!("{} rendered on a different node", expected))
}

/// Dependency set by the controller barrier.
fn wired<'a, T>(slot: &'a OnceLock<T>, name: &str) -> Result<&'a T, ApiError> {
    slot.get()
        .ok_or_else(|| ApiError::Internal(format!("{} is not wired", name)))
}

/// Relations the viewer may not see render as `null` instead of failing the
/// whole request.
fn forbidden_as_none<T>(result: ServiceResult<T>) -> Result<Option<T>, ApiError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(ServiceError::Forbidden(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn forbidden_field_as_none(result: Resolved) -> Result<Option<Value>, ApiError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(ApiError::Forbidden(_)) => Ok(None),
        Err(e) => Err(e),
    }
}
