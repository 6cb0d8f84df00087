// src/auth.rs

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use log::{debug, info};

use crate::error::{ServiceError, ServiceResult};
use crate::models::{Claims, NewUser, Token, User, UserSnapshot, UserUpdate};
use crate::registry::{Registry, Service};
use crate::user_management::{UserService, USER_SERVICE};

pub const AUTH_SERVICE: &str = "auth";
pub const TOKEN_ISSUER: &str = "magichub.auth";
/// Sign-ups racing for the same username get this many tries.
const PROVISION_ATTEMPTS: usize = 3;

// ─── TOKENS ───────────────────────────────────────────────────────────────────

/// Signs and verifies the HS512 tokens handed out on login.
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: chrono::Duration,
}

impl TokenSigner {
    pub fn new(secret: &str, ttl: chrono::Duration) -> Self {
        TokenSigner {
            encoding: EncodingKey::from_secret(secret.as_ref()),
            decoding: DecodingKey::from_secret(secret.as_ref()),
            ttl,
        }
    }

    pub fn sign(&self, user: &User) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now();
        let claims = Claims {
            user: UserSnapshot::from(user),
            sub: user.username.clone(),
            iss: TOKEN_ISSUER.to_string(),
            iat: now.timestamp() as usize,
            exp: (now + self.ttl).timestamp() as usize,
        };
        encode(&Header::new(Algorithm::HS512), &claims, &self.encoding)
    }

    pub fn verify(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        let mut validation = Validation::new(Algorithm::HS512);
        validation.set_issuer(&[TOKEN_ISSUER]);
        let token_data = decode::<Claims>(token, &self.decoding, &validation)?;
        Ok(token_data.claims)
    }
}

// ─── PROVIDERS ────────────────────────────────────────────────────────────────

/// Profile data a third-party identity provider vouches for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderProfile {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub image_url: String,
}

impl ProviderProfile {
    /// Local part of the email address. Accounts created from the profile
    /// start from it but may get a numeric suffix.
    pub fn username(&self) -> &str {
        self.email.split('@').next().unwrap_or_default()
    }
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Checks `token` with the provider and returns the profile it carries.
    async fn profile_from_token(&self, token: &str) -> ServiceResult<ProviderProfile>;
}

// ─── SERVICE ──────────────────────────────────────────────────────────────────

#[async_trait]
pub trait AuthService: Service {
    async fn get_auth_token_by_provider(&self, token: &str, provider: &str) -> ServiceResult<Token>;

    async fn get_auth_token_by_password(&self, username: &str, password: &str) -> ServiceResult<Token>;
}

pub struct AuthServiceImpl {
    signer: Arc<TokenSigner>,
    providers: HashMap<String, Arc<dyn AuthProvider>>,
    user_service: OnceLock<Arc<dyn UserService>>,
}

impl AuthServiceImpl {
    pub fn register(
        registry: &Registry,
        signer: Arc<TokenSigner>,
        providers: HashMap<String, Arc<dyn AuthProvider>>,
    ) -> Arc<Self> {
        let service = Arc::new(AuthServiceImpl {
            signer,
            providers,
            user_service: OnceLock::new(),
        });
        registry.register_service::<dyn AuthService>(AUTH_SERVICE, service.clone(), service.clone());
        service
    }

    fn users(&self) -> ServiceResult<&Arc<dyn UserService>> {
        self.user_service.get().ok_or(ServiceError::Unwired(USER_SERVICE))
    }

    fn token_for(&self, user: User) -> ServiceResult<Token> {
        let jwt = self
            .signer
            .sign(&user)
            .map_err(|e| ServiceError::upstream("could not sign token", e))?;
        Ok(Token { jwt, user })
    }

    /// Finds the account behind `profile`, creating it on first login and
    /// refreshing its profile fields on every later one.
    async fn sync_user(&self, profile: &ProviderProfile) -> ServiceResult<User> {
        let users = self.users()?;
        let mut attempt = 1;
        loop {
            match users.find_by_email(&profile.email).await {
                Ok(existing) => {
                    debug!("Syncing profile of user {} on login", existing.id);
                    return users
                        .update_user(
                            existing.id,
                            UserUpdate {
                                first_name: Some(profile.first_name.clone()),
                                last_name: Some(profile.last_name.clone()),
                                image_url: Some(profile.image_url.clone()),
                                ..UserUpdate::default()
                            },
                        )
                        .await;
                }
                Err(ServiceError::NotFound { .. }) => {}
                Err(other) => return Err(other),
            }

            let username = users.available_username(profile.username()).await?;
            info!("Provisioning user {} for {}", username, profile.email);
            let created = users
                .create_user(NewUser {
                    username,
                    email: profile.email.clone(),
                    first_name: profile.first_name.clone(),
                    last_name: profile.last_name.clone(),
                    image_url: profile.image_url.clone(),
                    password: None,
                })
                .await;
            match created {
                Err(ServiceError::Conflict(msg)) if attempt < PROVISION_ATTEMPTS => {
                    debug!("Provisioning attempt {} lost a race: {}", attempt, msg);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

#[async_trait]
impl Service for AuthServiceImpl {
    async fn on_all_services_registered(&self, registry: &Registry) {
        let _ = self
            .user_service
            .set(registry.get_service::<dyn UserService>(USER_SERVICE));
    }
}

#[async_trait]
impl AuthService for AuthServiceImpl {
    async fn get_auth_token_by_provider(&self, token: &str, provider: &str) -> ServiceResult<Token> {
        let auth_provider = self.providers.get(provider).ok_or_else(|| {
            ServiceError::Validation(format!("provider {} is not supported", provider))
        })?;
        let profile = auth_provider.profile_from_token(token).await?;
        let user = self.sync_user(&profile).await?;
        self.token_for(user)
    }

    async fn get_auth_token_by_password(&self, username: &str, password: &str) -> ServiceResult<Token> {
        let user = self.users()?.authenticate(username, password).await?;
        self.token_for(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, FakeProvider};

    fn profile(email: &str) -> ProviderProfile {
        ProviderProfile {
            email: email.to_string(),
            first_name: "Grace".into(),
            last_name: "Hopper".into(),
            image_url: "https://img/grace.png".into(),
        }
    }

    #[test]
    fn tokens_round_trip_through_the_signer() {
        let signer = TokenSigner::new("secret", chrono::Duration::hours(72));
        let user = testing::user("grace");
        let claims = signer.verify(&signer.sign(&user).unwrap()).unwrap();
        assert_eq!(claims.sub, "grace");
        assert_eq!(claims.iss, TOKEN_ISSUER);
        assert_eq!(claims.user.id, user.id.to_hex());
    }

    #[test]
    fn tokens_from_another_secret_are_rejected() {
        let user = testing::user("grace");
        let jwt = TokenSigner::new("one", chrono::Duration::hours(1)).sign(&user).unwrap();
        assert!(TokenSigner::new("two", chrono::Duration::hours(1)).verify(&jwt).is_err());
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let signer = TokenSigner::new("secret", chrono::Duration::hours(-2));
        let jwt = signer.sign(&testing::user("grace")).unwrap();
        assert!(signer.verify(&jwt).is_err());
    }

    #[test]
    fn username_is_the_local_part_of_the_email() {
        assert_eq!(profile("grace.hopper@navy.mil").username(), "grace.hopper");
    }

    #[tokio::test]
    async fn first_login_provisions_the_user() {
        let fixture = testing::Fixture::new()
            .with_provider("fake", FakeProvider::accepting("good-token", profile("grace@navy.mil")))
            .wire()
            .await;

        let token = fixture
            .auth
            .get_auth_token_by_provider("good-token", "fake")
            .await
            .unwrap();
        assert_eq!(token.user.username, "grace");
        assert_eq!(token.user.email, "grace@navy.mil");

        let claims = fixture.signer.verify(&token.jwt).unwrap();
        assert_eq!(claims.user.email, "grace@navy.mil");
    }

    #[tokio::test]
    async fn later_logins_sync_the_profile() {
        let fixture = testing::Fixture::new()
            .with_provider("fake", FakeProvider::accepting("good-token", profile("grace@navy.mil")))
            .wire()
            .await;
        let existing = fixture
            .users
            .create_user(NewUser {
                username: "grace".into(),
                email: "grace@navy.mil".into(),
                first_name: "Old".into(),
                ..NewUser::default()
            })
            .await
            .unwrap();

        let token = fixture
            .auth
            .get_auth_token_by_provider("good-token", "fake")
            .await
            .unwrap();
        assert_eq!(token.user.id, existing.id);
        assert_eq!(token.user.first_name, "Grace");
        assert_eq!(token.user.image_url, "https://img/grace.png");
    }

    #[tokio::test]
    async fn same_local_part_from_two_providers_gets_two_accounts() {
        let fixture = testing::Fixture::new()
            .with_provider("gmail", FakeProvider::accepting("gmail-token", profile("grace@gmail.com")))
            .with_provider("navy", FakeProvider::accepting("navy-token", profile("grace@navy.mil")))
            .wire()
            .await;

        let first = fixture
            .auth
            .get_auth_token_by_provider("gmail-token", "gmail")
            .await
            .unwrap();
        let second = fixture
            .auth
            .get_auth_token_by_provider("navy-token", "navy")
            .await
            .unwrap();
        assert_eq!(first.user.username, "grace");
        assert_eq!(second.user.username, "grace2");
        assert_ne!(first.user.id, second.user.id);

        let again = fixture
            .auth
            .get_auth_token_by_provider("navy-token", "navy")
            .await
            .unwrap();
        assert_eq!(again.user.id, second.user.id);
        assert_eq!(again.user.username, "grace2");
    }

    #[tokio::test]
    async fn unknown_providers_fail_fast() {
        let fixture = testing::Fixture::new().wire().await;
        let err = fixture
            .auth
            .get_auth_token_by_provider("token", "myspace")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(msg) if msg == "provider myspace is not supported"));
    }

    #[tokio::test]
    async fn rejected_provider_tokens_create_nobody() {
        let fixture = testing::Fixture::new()
            .with_provider("fake", FakeProvider::accepting("good-token", profile("grace@navy.mil")))
            .wire()
            .await;
        let err = fixture
            .auth
            .get_auth_token_by_provider("forged", "fake")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Unauthenticated(_)));
        assert!(fixture.users.find_by_email("grace@navy.mil").await.is_err());
    }

    #[tokio::test]
    async fn password_grant_checks_the_hash() {
        let fixture = testing::Fixture::new().wire().await;
        fixture
            .users
            .create_user(NewUser {
                username: "linus".into(),
                email: "linus@example.com".into(),
                password: Some("correct horse".into()),
                ..NewUser::default()
            })
            .await
            .unwrap();

        let token = fixture
            .auth
            .get_auth_token_by_password("linus", "correct horse")
            .await
            .unwrap();
        assert_eq!(token.user.username, "linus");

        let err = fixture
            .auth
            .get_auth_token_by_password("linus", "battery staple")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Unauthenticated(_)));
    }
}
