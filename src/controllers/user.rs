// src/controllers/user.rs

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{bind, wrong_source};
use crate::error::ApiError;
use crate::models::{NewUser, UserSnapshot, UserUpdate};
use crate::registry::{Controller, Registry};
use crate::schema::{Args, Field, Fields, Node, OutputType, ResolveContext, Resolved};
use crate::user_management::UserService;

pub const USER_CONTROLLER: &str = "user";

pub struct UserController {
    service: Arc<dyn UserService>,
}

fn from_args<T: serde::de::DeserializeOwned>(args: &Args) -> Result<T, ApiError> {
    serde_json::from_value(Value::Object(args.clone()))
        .map_err(|e| ApiError::BadRequest(format!("invalid arguments: {}", e)))
}

impl UserController {
    pub fn register(registry: &Registry, service: Arc<dyn UserService>) -> Arc<Self> {
        let controller = Arc::new(UserController { service });
        registry.register_controller(USER_CONTROLLER, controller.clone());
        controller
    }

    async fn render(self: Arc<Self>, ctx: ResolveContext) -> Resolved {
        let Node::User(user) = &ctx.source else {
            return Err(wrong_source("user"));
        };
        let mut out = json!(UserSnapshot::from(user));
        // Email addresses are private to their owner.
        if ctx.viewer != Some(user.id) {
            out["email"] = Value::Null;
        }
        Ok(out)
    }

    // query user(id)
    async fn user(self: Arc<Self>, ctx: ResolveContext) -> Resolved {
        let id = ctx.id_arg("id")?;
        let user = self.service.find_by_id(id).await?;
        self.render(ctx.with_source(Node::User(user))).await
    }

    // query me
    async fn me(self: Arc<Self>, ctx: ResolveContext) -> Resolved {
        let viewer = ctx.require_viewer()?;
        let user = self.service.find_by_id(viewer).await?;
        self.render(ctx.with_source(Node::User(user))).await
    }

    // mutation signup(username, email, password, firstName, lastName, imageUrl)
    async fn signup(self: Arc<Self>, ctx: ResolveContext) -> Resolved {
        let new_user: NewUser = from_args(&ctx.args)?;
        if new_user.password.is_none() {
            return Err(ApiError::BadRequest("missing argument password".to_string()));
        }
        let user = self.service.create_user(new_user).await?;
        let id = user.id;
        self.render(ctx.with_source(Node::User(user)).viewed_by(id)).await
    }

    // mutation updateUser(...)
    async fn update_user(self: Arc<Self>, ctx: ResolveContext) -> Resolved {
        let viewer = ctx.require_viewer()?;
        let update: UserUpdate = from_args(&ctx.args)?;
        let user = self.service.update_user(viewer, update).await?;
        self.render(ctx.with_source(Node::User(user))).await
    }

    // mutation deleteUser
    async fn delete_user(self: Arc<Self>, ctx: ResolveContext) -> Resolved {
        let viewer = ctx.require_viewer()?;
        self.service.delete_user(viewer).await?;
        Ok(Value::Bool(true))
    }
}

#[async_trait]
impl Controller for UserController {
    async fn on_all_controllers_registered(&self, _registry: &Registry) {}

    fn queries(self: Arc<Self>) -> Fields {
        Fields::from([
            ("user", bind(&self, Self::user)),
            ("me", bind(&self, Self::me)),
        ])
    }

    fn mutations(self: Arc<Self>) -> Fields {
        Fields::from([
            ("signup", bind(&self, Self::signup)),
            ("updateUser", bind(&self, Self::update_user)),
            ("deleteUser", bind(&self, Self::delete_user)),
        ])
    }

    fn output_type(self: Arc<Self>, name: &str) -> Option<OutputType> {
        match name {
            "user" => Some(bind(&self, Self::render)),
            _ => None,
        }
    }

    fn field(self: Arc<Self>, _name: &str) -> Option<Field> {
        None
    }
}
