// src/app_state.rs
//
// Composition root: builds every service and controller, runs both registry
// barriers, then freezes the schema the HTTP handlers execute against.

use std::collections::HashMap;
use std::sync::Arc;

use log::info;

use crate::auth::{AuthProvider, AuthService, AuthServiceImpl, TokenSigner};
use crate::box_management::{BoxRepository, BoxService, BoxServiceImpl};
use crate::controllers::{AuthController, BoxController, TeamController, UserController};
use crate::registry::Registry;
use crate::schema::Schema;
use crate::team_management::{TeamRepository, TeamService, TeamServiceImpl};
use crate::user_management::{UserRepository, UserService, UserServiceImpl};

#[derive(Clone)]
pub struct AppState {
    pub schema: Arc<Schema>,
    pub signer: Arc<TokenSigner>,
}

pub struct Repositories {
    pub users: Arc<dyn UserRepository>,
    pub teams: Arc<dyn TeamRepository>,
    pub boxes: Arc<dyn BoxRepository>,
}

#[derive(Clone)]
pub struct Services {
    pub users: Arc<dyn UserService>,
    pub teams: Arc<dyn TeamService>,
    pub boxes: Arc<dyn BoxService>,
    pub auth: Arc<dyn AuthService>,
}

/// Constructs every service, then lets them look each other up.
pub async fn register_services(
    registry: &Registry,
    repos: Repositories,
    signer: Arc<TokenSigner>,
    providers: HashMap<String, Arc<dyn AuthProvider>>,
    bcrypt_cost: u32,
) -> Services {
    let services = Services {
        users: UserServiceImpl::register(registry, repos.users, bcrypt_cost),
        teams: TeamServiceImpl::register(registry, repos.teams),
        boxes: BoxServiceImpl::register(registry, repos.boxes),
        auth: AuthServiceImpl::register(registry, signer, providers),
    };
    registry.all_services_registered().await;
    services
}

/// Builds one controller per service and runs the controller barrier. Must
/// follow [`register_services`].
pub async fn register_controllers(registry: &Registry, services: &Services) {
    UserController::register(registry, services.users.clone());
    TeamController::register(registry, services.teams.clone());
    BoxController::register(registry, services.boxes.clone());
    AuthController::register(registry, services.auth.clone());
    registry.all_controllers_registered().await;
}

pub fn build_schema(registry: &Registry, max_depth: u8) -> Schema {
    let schema = Schema::build(registry.controllers(), max_depth);
    info!("Schema assembled with relation depth {}", max_depth);
    schema
}
