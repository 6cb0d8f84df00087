// src/user_management.rs

use std::sync::{Arc, LazyLock, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use bcrypt::{hash, verify};
use log::{debug, error, info};
use mongodb::bson::{doc, oid::ObjectId};
use mongodb::Collection;
use regex::Regex;

use crate::box_management::{BoxService, BOX_SERVICE};
use crate::db::{with_deadline, MongoDB, USER_COLLECTION};
use crate::error::{RepositoryError, RepositoryResultExt, ServiceError, ServiceResult};
use crate::models::{NewUser, User, UserStatus, UserUpdate};
use crate::registry::{Registry, Service};
use crate::team_management::{TeamService, TEAM_SERVICE};

pub const USER_SERVICE: &str = "user";
pub const MIN_PASSWORD_LEN: usize = 8;

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9._%+\-]+@[a-z0-9.\-]+\.[a-z]{2,}$").expect("email pattern compiles")
});

// ─── REPOSITORY ───────────────────────────────────────────────────────────────

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_id(&self, id: ObjectId) -> Result<Option<User>, RepositoryError>;
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, RepositoryError>;
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, RepositoryError>;
    /// Inserts or replaces the record with `user.id`.
    async fn store(&self, user: &User) -> Result<(), RepositoryError>;
    async fn delete(&self, id: ObjectId) -> Result<bool, RepositoryError>;
}

pub struct MongoUserRepository {
    users: Collection<User>,
    timeout: Duration,
}

impl MongoUserRepository {
    pub fn new(mongodb: &MongoDB) -> Self {
        MongoUserRepository {
            users: mongodb.collection(USER_COLLECTION),
            timeout: mongodb.timeout,
        }
    }
}

#[async_trait]
impl UserRepository for MongoUserRepository {
    async fn find_by_id(&self, id: ObjectId) -> Result<Option<User>, RepositoryError> {
        with_deadline(self.timeout, self.users.find_one(doc! { "_id": id })).await
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, RepositoryError> {
        with_deadline(self.timeout, self.users.find_one(doc! { "email": email })).await
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<User>, RepositoryError> {
        with_deadline(self.timeout, self.users.find_one(doc! { "username": username })).await
    }

    async fn store(&self, user: &User) -> Result<(), RepositoryError> {
        let replace = self
            .users
            .replace_one(doc! { "_id": user.id }, user)
            .upsert(true);
        with_deadline(self.timeout, replace).await?;
        Ok(())
    }

    async fn delete(&self, id: ObjectId) -> Result<bool, RepositoryError> {
        let result = with_deadline(self.timeout, self.users.delete_one(doc! { "_id": id })).await?;
        Ok(result.deleted_count > 0)
    }
}

// ─── VALIDATION ───────────────────────────────────────────────────────────────

fn normalize_email(email: &str) -> ServiceResult<String> {
    let email = email.trim().to_lowercase();
    if email.is_empty() {
        return Err(ServiceError::Validation("No email provided".to_string()));
    }
    if !EMAIL.is_match(&email) {
        return Err(ServiceError::Validation(format!("{} is not a valid email", email)));
    }
    Ok(email)
}

fn check_username(username: &str) -> ServiceResult<String> {
    let username = username.trim();
    if username.is_empty() {
        return Err(ServiceError::Validation("No username provided".to_string()));
    }
    Ok(username.to_string())
}

fn check_password(password: &str) -> ServiceResult<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ServiceError::Validation(format!(
            "Password must be at least {} characters long",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

// ─── SERVICE ──────────────────────────────────────────────────────────────────

#[async_trait]
pub trait UserService: Service {
    async fn find_by_id(&self, id: ObjectId) -> ServiceResult<User>;
    async fn find_by_email(&self, email: &str) -> ServiceResult<User>;
    async fn create_user(&self, new_user: NewUser) -> ServiceResult<User>;
    async fn update_user(&self, id: ObjectId, update: UserUpdate) -> ServiceResult<User>;
    /// Removes the user and takes them out of every team. Refused while any
    /// box still holds a note they wrote.
    async fn delete_user(&self, id: ObjectId) -> ServiceResult<()>;
    /// `base` if no account uses it yet, otherwise `base` with the first free
    /// numeric suffix from 2 up.
    async fn available_username(&self, base: &str) -> ServiceResult<String>;
    /// Password grant. Unknown usernames and wrong passwords fail alike.
    async fn authenticate(&self, username: &str, password: &str) -> ServiceResult<User>;
}

pub struct UserServiceImpl {
    repo: Arc<dyn UserRepository>,
    hash_cost: u32,
    team_service: OnceLock<Arc<dyn TeamService>>,
    box_service: OnceLock<Arc<dyn BoxService>>,
}

impl UserServiceImpl {
    pub fn register(registry: &Registry, repo: Arc<dyn UserRepository>, hash_cost: u32) -> Arc<Self> {
        let service = Arc::new(UserServiceImpl {
            repo,
            hash_cost,
            team_service: OnceLock::new(),
            box_service: OnceLock::new(),
        });
        registry.register_service::<dyn UserService>(USER_SERVICE, service.clone(), service.clone());
        service
    }

    fn teams(&self) -> ServiceResult<&Arc<dyn TeamService>> {
        self.team_service.get().ok_or(ServiceError::Unwired(TEAM_SERVICE))
    }

    fn boxes(&self) -> ServiceResult<&Arc<dyn BoxService>> {
        self.box_service.get().ok_or(ServiceError::Unwired(BOX_SERVICE))
    }

    fn hash_password(&self, password: &str) -> ServiceResult<String> {
        check_password(password)?;
        hash(password, self.hash_cost).map_err(|e| ServiceError::upstream("could not hash password", e))
    }

    async fn save(&self, user: &User) -> ServiceResult<()> {
        self.repo.store(user).await.on_duplicate(|| {
            format!(
                "There is already a user with the username {:?} or email {:?}",
                user.username, user.email
            )
        })
    }
}

#[async_trait]
impl Service for UserServiceImpl {
    async fn on_all_services_registered(&self, registry: &Registry) {
        let _ = self
            .team_service
            .set(registry.get_service::<dyn TeamService>(TEAM_SERVICE));
        let _ = self
            .box_service
            .set(registry.get_service::<dyn BoxService>(BOX_SERVICE));
    }
}

#[async_trait]
impl UserService for UserServiceImpl {
    async fn find_by_id(&self, id: ObjectId) -> ServiceResult<User> {
        self.repo
            .find_by_id(id)
            .await
            .context("could not fetch user")?
            .ok_or_else(|| ServiceError::not_found("user", id))
    }

    async fn find_by_email(&self, email: &str) -> ServiceResult<User> {
        let email = email.trim().to_lowercase();
        self.repo
            .find_by_email(&email)
            .await
            .context("could not fetch user")?
            .ok_or_else(|| ServiceError::not_found("user with email", &email))
    }

    async fn create_user(&self, new_user: NewUser) -> ServiceResult<User> {
        let password_hash = match new_user.password.as_deref() {
            Some(password) => Some(self.hash_password(password)?),
            None => None,
        };
        let user = User {
            id: ObjectId::new(),
            username: check_username(&new_user.username)?,
            email: normalize_email(&new_user.email)?,
            first_name: new_user.first_name.trim().to_string(),
            last_name: new_user.last_name.trim().to_string(),
            image_url: new_user.image_url,
            password_hash,
            status: UserStatus::Active,
        };
        self.save(&user).await?;
        info!("Created user {} ({})", user.username, user.id);
        Ok(user)
    }

    async fn update_user(&self, id: ObjectId, update: UserUpdate) -> ServiceResult<User> {
        let mut user = self.find_by_id(id).await?;
        if update.is_empty() {
            return Ok(user);
        }
        if let Some(username) = update.username {
            user.username = check_username(&username)?;
        }
        if let Some(email) = update.email {
            user.email = normalize_email(&email)?;
        }
        if let Some(first_name) = update.first_name {
            user.first_name = first_name.trim().to_string();
        }
        if let Some(last_name) = update.last_name {
            user.last_name = last_name.trim().to_string();
        }
        if let Some(image_url) = update.image_url {
            user.image_url = image_url;
        }
        if let Some(password) = update.password {
            user.password_hash = Some(self.hash_password(&password)?);
        }
        self.save(&user).await?;
        debug!("Updated user {}", user.id);
        Ok(user)
    }

    async fn delete_user(&self, id: ObjectId) -> ServiceResult<()> {
        self.find_by_id(id).await?;
        let boxes = self.boxes()?.boxes_with_notes_from(id).await?;
        if boxes > 0 {
            return Err(ServiceError::Conflict(format!(
                "user {} still has notes in {} boxes and cannot be deleted",
                id, boxes
            )));
        }
        self.teams()?.remove_user(id).await?;

        let deleted = self.repo.delete(id).await.context("could not delete user")?;
        if !deleted {
            return Err(ServiceError::not_found("user", id));
        }
        info!("Deleted user {}", id);
        Ok(())
    }

    async fn available_username(&self, base: &str) -> ServiceResult<String> {
        let base = check_username(base)?;
        let mut candidate = base.clone();
        let mut suffix = 1;
        while self
            .repo
            .find_by_username(&candidate)
            .await
            .context("could not fetch user")?
            .is_some()
        {
            suffix += 1;
            candidate = format!("{}{}", base, suffix);
        }
        Ok(candidate)
    }

    async fn authenticate(&self, username: &str, password: &str) -> ServiceResult<User> {
        let rejected = || ServiceError::Unauthenticated("Invalid credentials".to_string());
        let user = self
            .repo
            .find_by_username(username.trim())
            .await
            .context("could not fetch user")?
            .ok_or_else(rejected)?;
        let Some(password_hash) = user.password_hash.as_deref() else {
            return Err(rejected());
        };
        match verify(password, password_hash) {
            Ok(true) if user.status == UserStatus::Active => Ok(user),
            Ok(_) => Err(rejected()),
            Err(e) => {
                error!("Stored password hash for {} is unreadable: {}", user.id, e);
                Err(rejected())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::box_management::BoxRepository;
    use crate::models::{MagicBox, Note, Ref, Team};
    use crate::testing;
    use chrono::{Duration, Utc};

    fn ada() -> NewUser {
        NewUser {
            username: "ada".into(),
            email: "Ada@Example.com".into(),
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            image_url: String::new(),
            password: Some("analytical".into()),
        }
    }

    #[test]
    fn email_format_is_checked() {
        assert_eq!(normalize_email(" Someone@Mail.org ").unwrap(), "someone@mail.org");
        assert!(normalize_email("not-an-email").is_err());
        assert!(normalize_email("").is_err());
    }

    #[tokio::test]
    async fn created_users_are_active_and_hashed() {
        let fixture = testing::Fixture::new().wire().await;
        let user = fixture.users.create_user(ada()).await.unwrap();

        assert_eq!(user.email, "ada@example.com");
        assert_eq!(user.status, UserStatus::Active);
        let hash = user.password_hash.as_deref().unwrap();
        assert_ne!(hash, "analytical");
        assert!(verify("analytical", hash).unwrap());
    }

    #[tokio::test]
    async fn short_passwords_are_rejected() {
        let fixture = testing::Fixture::new().wire().await;
        let err = fixture
            .users
            .create_user(NewUser {
                password: Some("short".into()),
                ..ada()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
        assert_eq!(fixture.user_repo.writes(), 0);
    }

    #[tokio::test]
    async fn duplicate_emails_conflict() {
        let fixture = testing::Fixture::new().wire().await;
        fixture.users.create_user(ada()).await.unwrap();
        let err = fixture
            .users
            .create_user(NewUser {
                username: "ada2".into(),
                ..ada()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
    }

    #[tokio::test]
    async fn lookups_distinguish_missing_users() {
        let fixture = testing::Fixture::new().wire().await;
        let err = fixture.users.find_by_id(ObjectId::new()).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound { kind: "user", .. }));

        let err = fixture.users.find_by_email("nobody@example.com").await.unwrap_err();
        assert_eq!(err.to_string(), "user with email nobody@example.com not found");
    }

    #[tokio::test]
    async fn updates_touch_only_given_fields() {
        let fixture = testing::Fixture::new().wire().await;
        let user = fixture.users.create_user(ada()).await.unwrap();

        let updated = fixture
            .users
            .update_user(
                user.id,
                UserUpdate {
                    image_url: Some("https://img/ada.png".into()),
                    ..UserUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.image_url, "https://img/ada.png");
        assert_eq!(updated.first_name, "Ada");
        assert_eq!(updated.password_hash, user.password_hash);
    }

    async fn team_with_member(fixture: &testing::Wired) -> (User, User, Team) {
        let ada = fixture.user("ada").await;
        let bob = fixture.user("bob").await;
        let team = fixture
            .teams
            .create_team(ada.id, "Engines", "", "")
            .await
            .unwrap();
        fixture.teams.request_team_invite(bob.id, team.id).await.unwrap();
        fixture
            .teams
            .accept_invite_request(ada.id, bob.id, team.id)
            .await
            .unwrap();
        (ada, bob, team)
    }

    #[tokio::test]
    async fn deleted_members_leave_their_teams() {
        let fixture = testing::Fixture::new().wire().await;
        let (ada, bob, team) = team_with_member(&fixture).await;
        let pending = fixture.user("pending").await;
        fixture.teams.request_team_invite(pending.id, team.id).await.unwrap();

        fixture.users.delete_user(bob.id).await.unwrap();
        fixture.users.delete_user(pending.id).await.unwrap();

        let team = fixture.teams.find_by_id(team.id).await.unwrap();
        let members = fixture.teams.team_members(ada.id, &team).await.unwrap();
        assert_eq!(members, vec![ada.clone()]);
        let admins = fixture.teams.team_admins(ada.id, &team).await.unwrap();
        assert_eq!(admins, vec![ada.clone()]);
        let requests = fixture.teams.team_join_requests(ada.id, &team).await.unwrap();
        assert!(requests.is_empty());
    }

    #[tokio::test]
    async fn note_authors_stay_while_their_notes_do() {
        let fixture = testing::Fixture::new().wire().await;
        let (ada, bob, team) = team_with_member(&fixture).await;
        let mut opened = MagicBox::new(
            Ref::Unresolved(team.id),
            "Memories",
            Utc::now() - Duration::days(1),
        );
        opened.notes.push(Note::new("remember the engine", bob.id));
        fixture.box_repo.store(&opened).await.unwrap();

        let err = fixture.users.delete_user(bob.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(msg) if msg.contains("still has notes in 1 boxes")));
        assert!(fixture.users.find_by_id(bob.id).await.is_ok());
        let team = fixture.teams.find_by_id(team.id).await.unwrap();
        assert!(team.is_user_member(bob.id));

        let magic_box = fixture.boxes.find_by_id(ada.id, opened.id).await.unwrap();
        let notes = fixture.boxes.get_notes(ada.id, &magic_box).await.unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].from.resolved().unwrap().username, "bob");
    }

    #[tokio::test]
    async fn taken_usernames_get_a_numeric_suffix() {
        let fixture = testing::Fixture::new().wire().await;
        assert_eq!(fixture.users.available_username(" grace ").await.unwrap(), "grace");

        fixture.user("grace").await;
        assert_eq!(fixture.users.available_username("grace").await.unwrap(), "grace2");
        fixture.user("grace2").await;
        assert_eq!(fixture.users.available_username("grace").await.unwrap(), "grace3");

        assert!(matches!(
            fixture.users.available_username("").await,
            Err(ServiceError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn deleted_users_are_gone() {
        let fixture = testing::Fixture::new().wire().await;
        let user = fixture.users.create_user(ada()).await.unwrap();
        fixture.users.delete_user(user.id).await.unwrap();
        assert!(fixture.users.find_by_id(user.id).await.is_err());
        assert!(matches!(
            fixture.users.delete_user(user.id).await,
            Err(ServiceError::NotFound { .. })
        ));
    }
}
