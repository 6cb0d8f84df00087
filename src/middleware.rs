// src/middleware.rs

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use actix_web::{
    body::{BoxBody, MessageBody},
    dev::{Service, ServiceRequest, ServiceResponse, Transform},
    http, Error, HttpMessage, HttpResponse,
};
use futures::future::{ok, Ready};
use log::debug;
use mongodb::bson::oid::ObjectId;
use serde_json::json;

use crate::auth::TokenSigner;

/// Id of the user whose bearer token authenticated the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentUser(pub ObjectId);

/// Verifies `Authorization: Bearer` tokens. Requests without the header pass
/// through anonymously; a header carrying a bad token is rejected with 401.
#[derive(Clone)]
pub struct Authentication {
    signer: Arc<TokenSigner>,
}

impl Authentication {
    pub fn new(signer: Arc<TokenSigner>) -> Self {
        Authentication { signer }
    }
}

impl<S, B> Transform<S, ServiceRequest> for Authentication
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<BoxBody>;
    type Error = Error;
    type Transform = AuthMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(AuthMiddleware {
            service,
            signer: Arc::clone(&self.signer),
        })
    }
}

pub struct AuthMiddleware<S> {
    service: S,
    signer: Arc<TokenSigner>,
}

enum Bearer {
    Absent,
    Valid(ObjectId),
    Invalid(String),
}

impl<S> AuthMiddleware<S> {
    fn bearer(&self, req: &ServiceRequest) -> Bearer {
        let Some(header) = req.headers().get(http::header::AUTHORIZATION) else {
            return Bearer::Absent;
        };
        let Ok(value) = header.to_str() else {
            return Bearer::Invalid("authorization header is not valid text".to_string());
        };
        let Some(token) = value.strip_prefix("Bearer ") else {
            return Bearer::Invalid("authorization header must use the Bearer scheme".to_string());
        };
        match self.signer.verify(token.trim()) {
            Ok(claims) => match ObjectId::parse_str(&claims.user.id) {
                Ok(id) => Bearer::Valid(id),
                Err(_) => Bearer::Invalid("token names an invalid user id".to_string()),
            },
            Err(e) => Bearer::Invalid(format!("Invalid token: {}", e)),
        }
    }
}

impl<S, B> Service<ServiceRequest> for AuthMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<BoxBody>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        match self.bearer(&req) {
            Bearer::Absent => {}
            Bearer::Valid(user_id) => {
                req.extensions_mut().insert(CurrentUser(user_id));
            }
            Bearer::Invalid(reason) => {
                debug!("Rejecting request to {}: {}", req.path(), reason);
                let (req_parts, _payload) = req.into_parts();
                let resp = HttpResponse::Unauthorized()
                    .json(json!({ "error": reason }))
                    .map_into_boxed_body();
                let srv_resp = ServiceResponse::new(req_parts, resp);
                return Box::pin(async move { Ok(srv_resp) });
            }
        }

        let fut = self.service.call(req);
        Box::pin(async move {
            let res = fut.await?;
            Ok(res.map_into_boxed_body())
        })
    }
}
