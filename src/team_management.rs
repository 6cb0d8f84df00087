// src/team_management.rs

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use mongodb::bson::{doc, oid::ObjectId, Document};
use mongodb::Collection;

use crate::db::{collect_with_deadline, with_deadline, MongoDB, TEAM_COLLECTION, USER_COLLECTION};
use crate::error::{RepositoryError, RepositoryResultExt, ServiceError, ServiceResult};
use crate::models::{MembershipError, Ref, Team, TeamDocument, User};
use crate::registry::{Registry, Service};
use crate::user_management::{UserService, USER_SERVICE};

pub const TEAM_SERVICE: &str = "team";

/// Filters for listing teams. Non-positive `limit`/`offset` mean "no limit"
/// and "from the start".
#[derive(Debug, Clone, Default)]
pub struct TeamFilter {
    pub limit: i64,
    pub offset: i64,
    pub search: String,
}

/// Slug used in team URLs: lower-cased, spaces dropped, nothing else touched.
pub fn route_name_from_name(name: &str) -> String {
    name.to_lowercase().replace(' ', "")
}

// ─── REPOSITORY ───────────────────────────────────────────────────────────────

#[async_trait]
pub trait TeamRepository: Send + Sync {
    async fn find_by_id(&self, id: ObjectId) -> Result<Option<Team>, RepositoryError>;
    async fn find_filtered(&self, filter: &TeamFilter) -> Result<Vec<Team>, RepositoryError>;
    /// Inserts or replaces the record with `team.id`. A name already used by
    /// another team fails with [`RepositoryError::Duplicate`].
    async fn store(&self, team: &Team) -> Result<(), RepositoryError>;
    /// Adds `user` to the join requests in a single write, unless they are
    /// already a member or a requester. Returns whether the team changed.
    async fn add_join_request(&self, team_id: ObjectId, user: ObjectId) -> Result<bool, RepositoryError>;
    /// Moves `user` from the join requests into the members in a single
    /// write. Returns false when there was no pending request.
    async fn accept_join_request(&self, team_id: ObjectId, user: ObjectId) -> Result<bool, RepositoryError>;
    /// Drops `user` from the members, admins and join requests of every
    /// team. Returns how many teams changed.
    async fn remove_user(&self, user: ObjectId) -> Result<u64, RepositoryError>;
}

pub struct MongoTeamRepository {
    teams: Collection<TeamDocument>,
    users: Collection<User>,
    timeout: Duration,
}

impl MongoTeamRepository {
    pub fn new(mongodb: &MongoDB) -> Self {
        MongoTeamRepository {
            teams: mongodb.collection(TEAM_COLLECTION),
            users: mongodb.collection(USER_COLLECTION),
            timeout: mongodb.timeout,
        }
    }

    /// Loads every user the teams point at with one `$in` query.
    async fn populate(&self, documents: Vec<TeamDocument>) -> Result<Vec<Team>, RepositoryError> {
        let mut teams: Vec<Team> = documents.into_iter().map(Team::from_document).collect();
        let mut ids: Vec<ObjectId> = teams.iter().flat_map(Team::referenced_user_ids).collect();
        ids.sort();
        ids.dedup();
        if ids.is_empty() {
            return Ok(teams);
        }

        let found =
            collect_with_deadline(self.timeout, self.users.find(doc! { "_id": { "$in": ids } })).await?;
        let users: HashMap<ObjectId, User> = found.into_iter().map(|user| (user.id, user)).collect();

        for team in &mut teams {
            team.populate(&users);
        }
        Ok(teams)
    }
}

fn search_filter(search: &str) -> Document {
    if search.is_empty() {
        return doc! {};
    }
    let pattern = regex::escape(search);
    doc! {
        "$or": [
            { "name": { "$regex": pattern.as_str(), "$options": "i" } },
            { "description": { "$regex": pattern.as_str(), "$options": "i" } },
        ]
    }
}

#[async_trait]
impl TeamRepository for MongoTeamRepository {
    async fn find_by_id(&self, id: ObjectId) -> Result<Option<Team>, RepositoryError> {
        let found = with_deadline(self.timeout, self.teams.find_one(doc! { "_id": id })).await?;
        match found {
            Some(document) => Ok(self.populate(vec![document]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn find_filtered(&self, filter: &TeamFilter) -> Result<Vec<Team>, RepositoryError> {
        let mut find = self.teams.find(search_filter(&filter.search)).sort(doc! { "name": 1 });
        if filter.limit > 0 {
            find = find.limit(filter.limit);
        }
        if filter.offset > 0 {
            find = find.skip(filter.offset as u64);
        }
        let documents = collect_with_deadline(self.timeout, find).await?;
        self.populate(documents).await
    }

    async fn store(&self, team: &Team) -> Result<(), RepositoryError> {
        let document = TeamDocument::from(team);
        let replace = self
            .teams
            .replace_one(doc! { "_id": team.id }, &document)
            .upsert(true);
        with_deadline(self.timeout, replace).await?;
        Ok(())
    }

    async fn add_join_request(&self, team_id: ObjectId, user: ObjectId) -> Result<bool, RepositoryError> {
        let filter = doc! {
            "_id": team_id,
            "members": { "$ne": user },
            "join_requests": { "$ne": user },
        };
        let update = doc! { "$addToSet": { "join_requests": user } };
        let result = with_deadline(self.timeout, self.teams.update_one(filter, update)).await?;
        Ok(result.matched_count > 0)
    }

    async fn accept_join_request(&self, team_id: ObjectId, user: ObjectId) -> Result<bool, RepositoryError> {
        let filter = doc! { "_id": team_id, "join_requests": user };
        let update = doc! {
            "$pull": { "join_requests": user },
            "$addToSet": { "members": user },
        };
        let result = with_deadline(self.timeout, self.teams.update_one(filter, update)).await?;
        Ok(result.matched_count > 0)
    }

    async fn remove_user(&self, user: ObjectId) -> Result<u64, RepositoryError> {
        let filter = doc! {
            "$or": [
                { "members": user },
                { "admins": user },
                { "join_requests": user },
            ]
        };
        let update = doc! {
            "$pull": { "members": user, "admins": user, "join_requests": user }
        };
        let result = with_deadline(self.timeout, self.teams.update_many(filter, update)).await?;
        Ok(result.modified_count)
    }
}

// ─── SERVICE ──────────────────────────────────────────────────────────────────

#[async_trait]
pub trait TeamService: Service {
    async fn find_filtered(&self, filter: TeamFilter) -> ServiceResult<Vec<Team>>;
    async fn find_by_id(&self, id: ObjectId) -> ServiceResult<Team>;
    async fn create_team(
        &self,
        creator: ObjectId,
        name: &str,
        image: &str,
        description: &str,
    ) -> ServiceResult<Team>;
    /// Members of `team`, visible to members only.
    async fn team_members(&self, viewer: ObjectId, team: &Team) -> ServiceResult<Vec<User>>;
    /// Admins of `team`, visible to members only.
    async fn team_admins(&self, viewer: ObjectId, team: &Team) -> ServiceResult<Vec<User>>;
    /// Pending join requests, visible to admins only.
    async fn team_join_requests(&self, viewer: ObjectId, team: &Team) -> ServiceResult<Vec<User>>;
    fn team_members_count(&self, team: &Team) -> usize;
    async fn request_team_invite(&self, user: ObjectId, team_id: ObjectId) -> ServiceResult<Team>;
    async fn accept_invite_request(
        &self,
        admin: ObjectId,
        requester: ObjectId,
        team_id: ObjectId,
    ) -> ServiceResult<Team>;
    /// Takes `user` out of every team. Returns how many teams changed.
    async fn remove_user(&self, user: ObjectId) -> ServiceResult<u64>;
}

pub struct TeamServiceImpl {
    repo: Arc<dyn TeamRepository>,
    user_service: OnceLock<Arc<dyn UserService>>,
}

impl TeamServiceImpl {
    pub fn register(registry: &Registry, repo: Arc<dyn TeamRepository>) -> Arc<Self> {
        let service = Arc::new(TeamServiceImpl {
            repo,
            user_service: OnceLock::new(),
        });
        registry.register_service::<dyn TeamService>(TEAM_SERVICE, service.clone(), service.clone());
        service
    }

    fn users(&self) -> ServiceResult<&Arc<dyn UserService>> {
        self.user_service.get().ok_or(ServiceError::Unwired(USER_SERVICE))
    }

    /// Full user records for `refs`, fetching whichever are still unresolved.
    async fn resolve_users(&self, refs: &[Ref<User>]) -> ServiceResult<Vec<User>> {
        let mut users = Vec::with_capacity(refs.len());
        for user in refs {
            match user {
                Ref::Resolved(user) => users.push(user.clone()),
                Ref::Unresolved(id) => users.push(self.users()?.find_by_id(*id).await?),
            }
        }
        Ok(users)
    }

    async fn save(&self, team: &Team) -> ServiceResult<()> {
        self.repo.store(team).await.on_duplicate(|| {
            format!("There is already a team with the provided name: {:?}", team.name)
        })
    }
}

fn check_can_request(team: &Team, user: ObjectId) -> ServiceResult<()> {
    if team.is_user_member(user) {
        return Err(ServiceError::Conflict("you are already in the team".to_string()));
    }
    if team.has_join_request(user) {
        return Err(membership_conflict(MembershipError::AlreadyRequested));
    }
    Ok(())
}

fn membership_conflict(err: MembershipError) -> ServiceError {
    ServiceError::Conflict(format!("could not add invite request: {}", err))
}

#[async_trait]
impl Service for TeamServiceImpl {
    async fn on_all_services_registered(&self, registry: &Registry) {
        let _ = self
            .user_service
            .set(registry.get_service::<dyn UserService>(USER_SERVICE));
    }
}

#[async_trait]
impl TeamService for TeamServiceImpl {
    async fn find_filtered(&self, filter: TeamFilter) -> ServiceResult<Vec<Team>> {
        self.repo
            .find_filtered(&filter)
            .await
            .context("could not list teams")
    }

    async fn find_by_id(&self, id: ObjectId) -> ServiceResult<Team> {
        self.repo
            .find_by_id(id)
            .await
            .context("could not get team")?
            .ok_or_else(|| ServiceError::not_found("team", id))
    }

    async fn create_team(
        &self,
        creator: ObjectId,
        name: &str,
        image: &str,
        description: &str,
    ) -> ServiceResult<Team> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ServiceError::Validation("No team name provided".to_string()));
        }
        let creator = self.users()?.find_by_id(creator).await?;
        let team = Team::new(
            Ref::Resolved(creator),
            name,
            route_name_from_name(name),
            image,
            description,
        );
        self.save(&team).await?;
        info!("Created team {} ({})", team.name, team.id);
        Ok(team)
    }

    async fn team_members(&self, viewer: ObjectId, team: &Team) -> ServiceResult<Vec<User>> {
        if !team.is_user_member(viewer) {
            return Err(ServiceError::Forbidden(
                "you must be in the team to see members".to_string(),
            ));
        }
        self.resolve_users(&team.members).await
    }

    async fn team_admins(&self, viewer: ObjectId, team: &Team) -> ServiceResult<Vec<User>> {
        if !team.is_user_member(viewer) {
            return Err(ServiceError::Forbidden(
                "you must be in the team to see admins".to_string(),
            ));
        }
        self.resolve_users(&team.admins).await
    }

    async fn team_join_requests(&self, viewer: ObjectId, team: &Team) -> ServiceResult<Vec<User>> {
        if !team.is_user_admin(viewer) {
            return Err(ServiceError::Forbidden(
                "you must be an admin of the team to see join requests".to_string(),
            ));
        }
        self.resolve_users(&team.join_requests).await
    }

    fn team_members_count(&self, team: &Team) -> usize {
        team.members.len()
    }

    async fn request_team_invite(&self, user: ObjectId, team_id: ObjectId) -> ServiceResult<Team> {
        let team = self.find_by_id(team_id).await?;
        check_can_request(&team, user)?;
        self.users()?.find_by_id(user).await?;

        let added = self
            .repo
            .add_join_request(team_id, user)
            .await
            .context("could not add invite request")?;
        // A concurrent write may have beaten the guard in the store.
        let team = self.find_by_id(team_id).await?;
        if !added {
            check_can_request(&team, user)?;
            return Err(membership_conflict(MembershipError::AlreadyRequested));
        }
        debug!("User {} asked to join team {}", user, team.id);
        Ok(team)
    }

    async fn accept_invite_request(
        &self,
        admin: ObjectId,
        requester: ObjectId,
        team_id: ObjectId,
    ) -> ServiceResult<Team> {
        let team = self.find_by_id(team_id).await?;
        if !team.is_user_admin(admin) {
            return Err(ServiceError::Forbidden(
                "you are not an admin of the team".to_string(),
            ));
        }
        if !team.has_join_request(requester) {
            return Err(membership_conflict(MembershipError::NotRequested));
        }
        self.users()?.find_by_id(requester).await?;

        let accepted = self
            .repo
            .accept_join_request(team_id, requester)
            .await
            .context("could not accept invite request")?;
        if !accepted {
            return Err(membership_conflict(MembershipError::NotRequested));
        }
        debug!("Admin {} accepted a join request into team {}", admin, team_id);
        self.find_by_id(team_id).await
    }

    async fn remove_user(&self, user: ObjectId) -> ServiceResult<u64> {
        let changed = self
            .repo
            .remove_user(user)
            .await
            .context("could not remove user from teams")?;
        if changed > 0 {
            info!("Removed user {} from {} teams", user, changed);
        }
        Ok(changed)
    }
}
