// src/main.rs

mod app_state;
mod auth;
mod box_management;
mod config;
mod controllers;
mod db;
mod error;
mod google_auth;
mod middleware;
mod models;
mod registry;
mod schema;
mod team_management;
mod user_management;

#[cfg(test)]
mod testing;

use std::collections::HashMap;
use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{http, middleware::Logger, web, App, HttpServer};
use env_logger::Env;
use log::{error, info, warn};

use crate::app_state::{AppState, Repositories};
use crate::auth::{AuthProvider, TokenSigner};
use crate::box_management::MongoBoxRepository;
use crate::config::Config;
use crate::google_auth::{GoogleAuthProvider, GOOGLE_PROVIDER};
use crate::middleware::Authentication;
use crate::registry::Registry;
use crate::team_management::MongoTeamRepository;
use crate::user_management::MongoUserRepository;

fn auth_providers(config: &Config) -> HashMap<String, Arc<dyn AuthProvider>> {
    let mut providers: HashMap<String, Arc<dyn AuthProvider>> = HashMap::new();
    match &config.google_client_id {
        Some(client_id) => match GoogleAuthProvider::new(
            client_id.clone(),
            config.google_certs_url.clone(),
            config.upstream_timeout,
        ) {
            Ok(google) => {
                providers.insert(GOOGLE_PROVIDER.to_string(), Arc::new(google));
            }
            Err(e) => error!("Google sign-in disabled: {}", e),
        },
        None => warn!("GOOGLE_CLIENT_ID is not set, google sign-in is disabled"),
    }
    providers
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    let mongodb = match db::MongoDB::init(&config).await {
        Ok(mongodb) => mongodb,
        Err(e) => {
            error!("Could not connect to MongoDB: {}", e);
            std::process::exit(1);
        }
    };

    let signer = Arc::new(TokenSigner::new(&config.jwt_secret, config.jwt_ttl));
    let registry = Registry::new();
    let services = app_state::register_services(
        &registry,
        Repositories {
            users: Arc::new(MongoUserRepository::new(&mongodb)),
            teams: Arc::new(MongoTeamRepository::new(&mongodb)),
            boxes: Arc::new(MongoBoxRepository::new(&mongodb)),
        },
        signer.clone(),
        auth_providers(&config),
        config.bcrypt_cost,
    )
    .await;
    app_state::register_controllers(&registry, &services).await;
    let schema = Arc::new(app_state::build_schema(&registry, config.schema_max_depth));

    let state = AppState {
        schema,
        signer,
    };
    let frontend_origin = config.frontend_origin.clone();

    info!("Server running at http://{}", config.bind_address);
    info!("Allowed CORS Origin: {}", frontend_origin);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allowed_origin(&frontend_origin)
            .allowed_methods(vec!["GET", "POST", "OPTIONS"])
            .allowed_headers(vec![
                http::header::CONTENT_TYPE,
                http::header::ACCEPT,
                http::header::AUTHORIZATION,
            ])
            .supports_credentials()
            .max_age(3600);

        App::new()
            .wrap(Logger::default())
            .wrap(cors)
            .wrap(Authentication::new(state.signer.clone()))
            .app_data(web::Data::new(state.clone()))
            .service(
                web::scope("/api")
                    .route("/query/{field}", web::post().to(schema::query))
                    .route("/mutation/{field}", web::post().to(schema::mutation)),
            )
    })
    .bind(&config.bind_address)?
    .run()
    .await
}
