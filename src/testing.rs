// src/testing.rs
//
// In-memory repositories and a wired set of services for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mongodb::bson::oid::ObjectId;

use crate::app_state::{self, Repositories, Services};
use crate::auth::{AuthProvider, AuthService, ProviderProfile, TokenSigner};
use crate::box_management::{BoxRepository, BoxService};
use crate::error::{RepositoryError, ServiceError, ServiceResult};
use crate::models::{MagicBox, NewUser, Note, Ref, Team, User, UserStatus};
use crate::registry::Registry;
use crate::team_management::{TeamFilter, TeamRepository, TeamService};
use crate::user_management::{UserRepository, UserService};

/// Lowest cost bcrypt accepts; keeps hashing fast in tests.
pub const TEST_BCRYPT_COST: u32 = 4;

pub fn user(username: &str) -> User {
    User {
        id: ObjectId::new(),
        username: username.to_string(),
        email: format!("{}@example.com", username),
        first_name: username.to_string(),
        last_name: String::new(),
        image_url: String::new(),
        password_hash: None,
        status: UserStatus::Active,
    }
}

// ─── REPOSITORIES ─────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryUserRepository {
    users: Mutex<Vec<User>>,
    writes: AtomicUsize,
}

impl MemoryUserRepository {
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn find(&self, matches: impl Fn(&User) -> bool) -> Option<User> {
        self.users.lock().unwrap().iter().find(|u| matches(u)).cloned()
    }
}

#[async_trait]
impl UserRepository for MemoryUserRepository {
    async fn find_by_id(&self, id: ObjectId) -> Result<Option<User>, RepositoryError> {
        Ok(self.find(|u| u.id == id))
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, RepositoryError> {
        Ok(self.find(|u| u.email == email))
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<User>, RepositoryError> {
        Ok(self.find(|u| u.username == username))
    }

    async fn store(&self, user: &User) -> Result<(), RepositoryError> {
        let mut users = self.users.lock().unwrap();
        let clash = users.iter().any(|u| {
            u.id != user.id && (u.email == user.email || u.username == user.username)
        });
        if clash {
            return Err(RepositoryError::Duplicate("user email or username".into()));
        }
        users.retain(|u| u.id != user.id);
        users.push(user.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, id: ObjectId) -> Result<bool, RepositoryError> {
        let mut users = self.users.lock().unwrap();
        let before = users.len();
        users.retain(|u| u.id != id);
        Ok(users.len() != before)
    }
}

#[derive(Default)]
pub struct MemoryTeamRepository {
    teams: Mutex<Vec<Team>>,
    writes: AtomicUsize,
}

impl MemoryTeamRepository {
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TeamRepository for MemoryTeamRepository {
    async fn find_by_id(&self, id: ObjectId) -> Result<Option<Team>, RepositoryError> {
        let found = self.teams.lock().unwrap().iter().find(|t| t.id == id).cloned();
        // Lets concurrent callers interleave between a read and their write.
        tokio::task::yield_now().await;
        Ok(found)
    }

    async fn find_filtered(&self, filter: &TeamFilter) -> Result<Vec<Team>, RepositoryError> {
        let search = filter.search.to_lowercase();
        let mut teams: Vec<Team> = self
            .teams
            .lock()
            .unwrap()
            .iter()
            .filter(|t| {
                search.is_empty()
                    || t.name.to_lowercase().contains(&search)
                    || t.description.to_lowercase().contains(&search)
            })
            .cloned()
            .collect();
        teams.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(page(teams, filter.limit, filter.offset))
    }

    async fn store(&self, team: &Team) -> Result<(), RepositoryError> {
        let mut teams = self.teams.lock().unwrap();
        if teams.iter().any(|t| t.id != team.id && t.name == team.name) {
            return Err(RepositoryError::Duplicate(format!("team name {}", team.name)));
        }
        teams.retain(|t| t.id != team.id);
        teams.push(team.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn add_join_request(&self, team_id: ObjectId, user: ObjectId) -> Result<bool, RepositoryError> {
        let mut teams = self.teams.lock().unwrap();
        let Some(team) = teams.iter_mut().find(|t| t.id == team_id) else {
            return Ok(false);
        };
        if team.is_user_member(user) || team.add_join_request(Ref::Unresolved(user)).is_err() {
            return Ok(false);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn accept_join_request(&self, team_id: ObjectId, user: ObjectId) -> Result<bool, RepositoryError> {
        let mut teams = self.teams.lock().unwrap();
        let Some(team) = teams.iter_mut().find(|t| t.id == team_id) else {
            return Ok(false);
        };
        if team.accept_join_request(Ref::Unresolved(user)).is_err() {
            return Ok(false);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn remove_user(&self, user: ObjectId) -> Result<u64, RepositoryError> {
        let mut teams = self.teams.lock().unwrap();
        let mut changed = 0;
        for team in teams.iter_mut() {
            if team.remove_user(user) {
                changed += 1;
            }
        }
        if changed > 0 {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(changed)
    }
}

#[derive(Default)]
pub struct MemoryBoxRepository {
    boxes: Mutex<Vec<MagicBox>>,
    writes: AtomicUsize,
}

impl MemoryBoxRepository {
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BoxRepository for MemoryBoxRepository {
    async fn find_by_id(&self, id: ObjectId) -> Result<Option<MagicBox>, RepositoryError> {
        let boxes = self.boxes.lock().unwrap();
        Ok(boxes.iter().find(|b| b.id == id).cloned())
    }

    async fn find_by_team_filtered(
        &self,
        team_id: ObjectId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<MagicBox>, RepositoryError> {
        let boxes: Vec<MagicBox> = self
            .boxes
            .lock()
            .unwrap()
            .iter()
            .filter(|b| b.team.id() == team_id)
            .cloned()
            .collect();
        Ok(page(boxes, limit, offset))
    }

    async fn store(&self, magic_box: &MagicBox) -> Result<(), RepositoryError> {
        let mut boxes = self.boxes.lock().unwrap();
        boxes.retain(|b| b.id != magic_box.id);
        // Stored boxes only keep the team id, as in the database.
        let mut stored = magic_box.clone();
        stored.team = Ref::Unresolved(magic_box.team.id());
        boxes.push(stored);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn count_notes_from(&self, author: ObjectId) -> Result<u64, RepositoryError> {
        let boxes = self.boxes.lock().unwrap();
        let count = boxes
            .iter()
            .filter(|b| b.notes.iter().any(|note| note.from.id() == author))
            .count();
        Ok(count as u64)
    }

    async fn append_note(
        &self,
        box_id: ObjectId,
        note: &Note,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut boxes = self.boxes.lock().unwrap();
        match boxes.iter_mut().find(|b| b.id == box_id && b.open_date >= now) {
            Some(magic_box) => {
                magic_box.notes.push(note.clone());
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

fn page<T>(items: Vec<T>, limit: i64, offset: i64) -> Vec<T> {
    let skip = if offset > 0 { offset as usize } else { 0 };
    let take = if limit > 0 { limit as usize } else { usize::MAX };
    items.into_iter().skip(skip).take(take).collect()
}

// ─── AUTH ─────────────────────────────────────────────────────────────────────

pub struct FakeProvider {
    token: String,
    profile: ProviderProfile,
}

impl FakeProvider {
    pub fn accepting(token: &str, profile: ProviderProfile) -> Self {
        FakeProvider {
            token: token.to_string(),
            profile,
        }
    }
}

#[async_trait]
impl AuthProvider for FakeProvider {
    async fn profile_from_token(&self, token: &str) -> ServiceResult<ProviderProfile> {
        if token == self.token {
            Ok(self.profile.clone())
        } else {
            Err(ServiceError::Unauthenticated("invalid token".into()))
        }
    }
}

// ─── FIXTURE ──────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct Fixture {
    providers: HashMap<String, Arc<dyn AuthProvider>>,
}

/// Services wired through the registry barrier, plus the stores behind them.
pub struct Wired {
    pub registry: Registry,
    pub users: Arc<dyn UserService>,
    pub teams: Arc<dyn TeamService>,
    pub boxes: Arc<dyn BoxService>,
    pub auth: Arc<dyn AuthService>,
    pub signer: Arc<TokenSigner>,
    pub user_repo: Arc<MemoryUserRepository>,
    pub team_repo: Arc<MemoryTeamRepository>,
    pub box_repo: Arc<MemoryBoxRepository>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, name: &str, provider: FakeProvider) -> Self {
        self.providers.insert(name.to_string(), Arc::new(provider));
        self
    }

    pub async fn wire(self) -> Wired {
        let user_repo = Arc::new(MemoryUserRepository::default());
        let team_repo = Arc::new(MemoryTeamRepository::default());
        let box_repo = Arc::new(MemoryBoxRepository::default());
        let signer = Arc::new(TokenSigner::new("test-secret", chrono::Duration::hours(1)));

        let registry = Registry::new();
        let Services {
            users,
            teams,
            boxes,
            auth,
        } = app_state::register_services(
            &registry,
            Repositories {
                users: user_repo.clone(),
                teams: team_repo.clone(),
                boxes: box_repo.clone(),
            },
            signer.clone(),
            self.providers,
            TEST_BCRYPT_COST,
        )
        .await;

        Wired {
            registry,
            users,
            teams,
            boxes,
            auth,
            signer,
            user_repo,
            team_repo,
            box_repo,
        }
    }
}

impl Wired {
    pub async fn user(&self, username: &str) -> User {
        self.users
            .create_user(NewUser {
                username: username.to_string(),
                email: format!("{}@example.com", username),
                first_name: username.to_string(),
                ..NewUser::default()
            })
            .await
            .unwrap()
    }
}
