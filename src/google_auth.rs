// src/google_auth.rs
//
// Google sign-in: verifies ID tokens against Google's published signing keys.

use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use log::{debug, info};
use reqwest::Client;
use serde::{Deserialize, Deserializer};
use tokio::sync::RwLock;

use crate::auth::{AuthProvider, ProviderProfile};
use crate::error::{ServiceError, ServiceResult};

pub const GOOGLE_PROVIDER: &str = "google";
const GOOGLE_ISSUERS: [&str; 2] = ["accounts.google.com", "https://accounts.google.com"];

#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    kid: String,
    n: String,
    e: String,
}

#[derive(Debug, Deserialize)]
struct JwkSet {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct GoogleClaims {
    email: String,
    #[serde(default, deserialize_with = "flag")]
    email_verified: bool,
    #[serde(default)]
    given_name: String,
    #[serde(default)]
    family_name: String,
    #[serde(default)]
    picture: String,
}

/// Google has sent `email_verified` both as a JSON bool and as a string.
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }
    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(value) => value,
        Flag::Text(text) => text.eq_ignore_ascii_case("true"),
    })
}

pub struct GoogleAuthProvider {
    client_id: String,
    certs_url: String,
    http_client: Client,
    keys: RwLock<Vec<Jwk>>,
}

impl GoogleAuthProvider {
    pub fn new(client_id: String, certs_url: String, timeout: Duration) -> ServiceResult<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::upstream("could not build http client", e))?;
        Ok(GoogleAuthProvider {
            client_id,
            certs_url,
            http_client,
            keys: RwLock::new(Vec::new()),
        })
    }

    async fn fetch_keys(&self) -> ServiceResult<Vec<Jwk>> {
        let response = self
            .http_client
            .get(&self.certs_url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| ServiceError::upstream("could not fetch google signing keys", e))?;
        let set: JwkSet = response
            .json()
            .await
            .map_err(|e| ServiceError::upstream("could not read google signing keys", e))?;
        info!("Fetched {} google signing keys", set.keys.len());
        Ok(set.keys)
    }

    /// Keys matching `kid`, refreshing the cached set once when none match.
    /// Tokens without a `kid` are tried against every key.
    async fn keys_for(&self, kid: Option<&str>) -> ServiceResult<Vec<Jwk>> {
        let matching = |keys: &[Jwk]| -> Vec<Jwk> {
            keys.iter()
                .filter(|key| kid.map_or(true, |kid| key.kid == kid))
                .cloned()
                .collect()
        };

        let cached = matching(&self.keys.read().await);
        if !cached.is_empty() {
            return Ok(cached);
        }
        let fresh = self.fetch_keys().await?;
        let found = matching(&fresh);
        *self.keys.write().await = fresh;
        Ok(found)
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[self.client_id.as_str()]);
        validation.set_issuer(&GOOGLE_ISSUERS);
        validation
    }
}

fn rejected() -> ServiceError {
    ServiceError::Unauthenticated("invalid google token".to_string())
}

/// Rejects addresses Google has not verified.
fn profile_from_claims(claims: GoogleClaims) -> ServiceResult<ProviderProfile> {
    if !claims.email_verified {
        return Err(ServiceError::Unauthenticated(format!(
            "google has not verified the email {}",
            claims.email
        )));
    }
    Ok(ProviderProfile {
        email: claims.email,
        first_name: claims.given_name,
        last_name: claims.family_name,
        image_url: claims.picture,
    })
}

#[async_trait]
impl AuthProvider for GoogleAuthProvider {
    async fn profile_from_token(&self, token: &str) -> ServiceResult<ProviderProfile> {
        let header = decode_header(token).map_err(|_| rejected())?;
        let keys = self.keys_for(header.kid.as_deref()).await?;
        let validation = self.validation();

        for key in keys {
            let Ok(decoding_key) = DecodingKey::from_rsa_components(&key.n, &key.e) else {
                debug!("Skipping unusable google key {}", key.kid);
                continue;
            };
            match decode::<GoogleClaims>(token, &decoding_key, &validation) {
                Ok(data) => return profile_from_claims(data.claims),
                Err(e) => debug!("Google token rejected by key {}: {}", key.kid, e),
            }
        }
        Err(rejected())
    }
}
