// src/controllers/auth.rs

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde_json::json;

use super::user::USER_CONTROLLER;
use super::{bind, wired};
use crate::auth::AuthService;
use crate::models::Token;
use crate::registry::{Controller, Registry};
use crate::schema::{Field, Fields, Node, OutputType, ResolveContext, Resolved};

pub const AUTH_CONTROLLER: &str = "auth";
pub const DEFAULT_PROVIDER: &str = "google";

pub struct AuthController {
    service: Arc<dyn AuthService>,
    user_type: OnceLock<OutputType>,
}

impl AuthController {
    pub fn register(registry: &Registry, service: Arc<dyn AuthService>) -> Arc<Self> {
        let controller = Arc::new(AuthController {
            service,
            user_type: OnceLock::new(),
        });
        registry.register_controller(AUTH_CONTROLLER, controller.clone());
        controller
    }

    async fn render_token(&self, ctx: &ResolveContext, token: Token) -> Resolved {
        let user_type = wired(&self.user_type, "user output type")?;
        let id = token.user.id;
        let user = user_type
            .resolve(ctx.with_source(Node::User(token.user)).viewed_by(id))
            .await?;
        Ok(json!({ "jwt": token.jwt, "user": user }))
    }

    // mutation login(token, provider)
    async fn login(self: Arc<Self>, ctx: ResolveContext) -> Resolved {
        let token = self
            .service
            .get_auth_token_by_provider(ctx.str_arg("token")?, ctx.str_or("provider", DEFAULT_PROVIDER)?)
            .await?;
        self.render_token(&ctx, token).await
    }

    // mutation loginWithPassword(username, password)
    async fn login_with_password(self: Arc<Self>, ctx: ResolveContext) -> Resolved {
        let token = self
            .service
            .get_auth_token_by_password(ctx.str_arg("username")?, ctx.str_arg("password")?)
            .await?;
        self.render_token(&ctx, token).await
    }
}

#[async_trait]
impl Controller for AuthController {
    async fn on_all_controllers_registered(&self, registry: &Registry) {
        let _ = self
            .user_type
            .set(registry.get_output_type(USER_CONTROLLER, "user"));
    }

    fn queries(self: Arc<Self>) -> Fields {
        Fields::new()
    }

    fn mutations(self: Arc<Self>) -> Fields {
        Fields::from([
            ("login", bind(&self, Self::login)),
            ("loginWithPassword", bind(&self, Self::login_with_password)),
        ])
    }

    fn output_type(self: Arc<Self>, _name: &str) -> Option<OutputType> {
        None
    }

    fn field(self: Arc<Self>, _name: &str) -> Option<Field> {
        None
    }
}
