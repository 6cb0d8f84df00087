use std::env;
use std::time::Duration;

use thiserror::Error;

pub const GOOGLE_CERTS_URL: &str = "https://www.googleapis.com/oauth2/v3/certs";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has an invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Clone, Debug)]
pub struct Config {
    pub mongo_uri: String,
    pub database_name: String,
    pub jwt_secret: String,
    pub jwt_ttl: chrono::Duration,
    pub bind_address: String,
    pub frontend_origin: String,
    pub google_client_id: Option<String>,
    pub google_certs_url: String,
    pub upstream_timeout: Duration,
    pub schema_max_depth: u8,
    pub bcrypt_cost: u32,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let or = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        Ok(Self {
            mongo_uri: or("MONGO_URI", "mongodb://127.0.0.1:27017"),
            database_name: or("DATABASE_NAME", "magichub"),
            jwt_secret: lookup("JWT_SECRET")
                .filter(|secret| !secret.is_empty())
                .ok_or(ConfigError::Missing("JWT_SECRET"))?,
            jwt_ttl: chrono::Duration::hours(parse(&lookup, "JWT_TTL_HOURS", 72)?),
            bind_address: or("BIND_ADDRESS", "0.0.0.0:8080"),
            frontend_origin: or("FRONTEND_ORIGIN", "http://localhost:3000"),
            google_client_id: lookup("GOOGLE_CLIENT_ID").filter(|id| !id.is_empty()),
            google_certs_url: or("GOOGLE_CERTS_URL", GOOGLE_CERTS_URL),
            upstream_timeout: Duration::from_secs(parse(&lookup, "UPSTREAM_TIMEOUT_SECS", 10)?),
            schema_max_depth: parse(&lookup, "SCHEMA_MAX_DEPTH", 3)?,
            bcrypt_cost: parse(&lookup, "BCRYPT_COST", bcrypt::DEFAULT_COST)?,
        })
    }
}

fn parse<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(name) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}
