// src/box_management.rs

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use mongodb::bson::{doc, oid::ObjectId, to_bson, DateTime as BsonDateTime};
use mongodb::Collection;

use crate::db::{collect_with_deadline, with_deadline, MongoDB, BOX_COLLECTION};
use crate::error::{RepositoryError, RepositoryResultExt, ServiceError, ServiceResult};
use crate::models::{BoxDocument, MagicBox, Note, NoteDocument, Ref, Team};
use crate::registry::{Registry, Service};
use crate::team_management::{TeamService, TEAM_SERVICE};
use crate::user_management::{UserService, USER_SERVICE};

pub const BOX_SERVICE: &str = "box";

// ─── REPOSITORY ───────────────────────────────────────────────────────────────

/// Boxes come back with their team unresolved.
#[async_trait]
pub trait BoxRepository: Send + Sync {
    async fn find_by_id(&self, id: ObjectId) -> Result<Option<MagicBox>, RepositoryError>;
    async fn find_by_team_filtered(
        &self,
        team_id: ObjectId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<MagicBox>, RepositoryError>;
    async fn store(&self, magic_box: &MagicBox) -> Result<(), RepositoryError>;
    /// Appends `note` to the box only if it is still closed at `now`.
    /// Returns `false` when no closed box with that id exists.
    async fn append_note(
        &self,
        box_id: ObjectId,
        note: &Note,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;
    /// Number of boxes holding at least one note written by `author`.
    async fn count_notes_from(&self, author: ObjectId) -> Result<u64, RepositoryError>;
}

pub struct MongoBoxRepository {
    boxes: Collection<BoxDocument>,
    timeout: Duration,
}

impl MongoBoxRepository {
    pub fn new(mongodb: &MongoDB) -> Self {
        MongoBoxRepository {
            boxes: mongodb.collection(BOX_COLLECTION),
            timeout: mongodb.timeout,
        }
    }
}

fn from_document(document: BoxDocument) -> Result<MagicBox, RepositoryError> {
    let id = document.id;
    MagicBox::from_document(document)
        .ok_or_else(|| RepositoryError::Corrupt(format!("box {} has an unreadable open date", id)))
}

#[async_trait]
impl BoxRepository for MongoBoxRepository {
    async fn find_by_id(&self, id: ObjectId) -> Result<Option<MagicBox>, RepositoryError> {
        with_deadline(self.timeout, self.boxes.find_one(doc! { "_id": id }))
            .await?
            .map(from_document)
            .transpose()
    }

    async fn find_by_team_filtered(
        &self,
        team_id: ObjectId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<MagicBox>, RepositoryError> {
        let mut find = self
            .boxes
            .find(doc! { "team": team_id })
            .sort(doc! { "open_date": 1 });
        if limit > 0 {
            find = find.limit(limit);
        }
        if offset > 0 {
            find = find.skip(offset as u64);
        }
        let documents = collect_with_deadline(self.timeout, find).await?;
        documents.into_iter().map(from_document).collect()
    }

    async fn count_notes_from(&self, author: ObjectId) -> Result<u64, RepositoryError> {
        let count = self.boxes.count_documents(doc! { "notes.from": author });
        with_deadline(self.timeout, count).await
    }

    async fn store(&self, magic_box: &MagicBox) -> Result<(), RepositoryError> {
        let document = BoxDocument::from(magic_box);
        let replace = self
            .boxes
            .replace_one(doc! { "_id": magic_box.id }, &document)
            .upsert(true);
        with_deadline(self.timeout, replace).await?;
        Ok(())
    }

    async fn append_note(
        &self,
        box_id: ObjectId,
        note: &Note,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let filter = doc! {
            "_id": box_id,
            "open_date": { "$gte": BsonDateTime::from_millis(now.timestamp_millis()) },
        };
        let update = doc! { "$push": { "notes": to_bson(&NoteDocument::from(note))? } };
        let result = with_deadline(self.timeout, self.boxes.update_one(filter, update)).await?;
        Ok(result.matched_count > 0)
    }
}

// ─── SERVICE ──────────────────────────────────────────────────────────────────

#[async_trait]
pub trait BoxService: Service {
    async fn find_by_team_filtered(
        &self,
        limit: i64,
        offset: i64,
        team_id: ObjectId,
    ) -> ServiceResult<Vec<MagicBox>>;
    /// A box with its team resolved, readable by team members only.
    async fn find_by_id(&self, user: ObjectId, box_id: ObjectId) -> ServiceResult<MagicBox>;
    async fn create_box(
        &self,
        user: ObjectId,
        team_id: ObjectId,
        name: &str,
        open_date: DateTime<Utc>,
    ) -> ServiceResult<MagicBox>;
    async fn insert_note(&self, user: ObjectId, box_id: ObjectId, text: &str) -> ServiceResult<MagicBox>;
    /// Notes of `magic_box` that `user` may read right now, with authors resolved.
    async fn get_notes(&self, user: ObjectId, magic_box: &MagicBox) -> ServiceResult<Vec<Note>>;
    /// How many boxes hold a note written by `author`.
    async fn boxes_with_notes_from(&self, author: ObjectId) -> ServiceResult<u64>;
}

pub struct BoxServiceImpl {
    repo: Arc<dyn BoxRepository>,
    team_service: OnceLock<Arc<dyn TeamService>>,
    user_service: OnceLock<Arc<dyn UserService>>,
}

impl BoxServiceImpl {
    pub fn register(registry: &Registry, repo: Arc<dyn BoxRepository>) -> Arc<Self> {
        let service = Arc::new(BoxServiceImpl {
            repo,
            team_service: OnceLock::new(),
            user_service: OnceLock::new(),
        });
        registry.register_service::<dyn BoxService>(BOX_SERVICE, service.clone(), service.clone());
        service
    }

    fn teams(&self) -> ServiceResult<&Arc<dyn TeamService>> {
        self.team_service.get().ok_or(ServiceError::Unwired(TEAM_SERVICE))
    }

    fn users(&self) -> ServiceResult<&Arc<dyn UserService>> {
        self.user_service.get().ok_or(ServiceError::Unwired(USER_SERVICE))
    }

    async fn load(&self, box_id: ObjectId) -> ServiceResult<MagicBox> {
        self.repo
            .find_by_id(box_id)
            .await
            .context("could not get box")?
            .ok_or_else(|| ServiceError::not_found("box", box_id))
    }

    /// The box's team, provided `user` belongs to it.
    async fn team_of(&self, user: ObjectId, magic_box: &MagicBox, action: &str) -> ServiceResult<Team> {
        let team_id = magic_box.team.id();
        let team = match &magic_box.team {
            Ref::Resolved(team) => team.clone(),
            Ref::Unresolved(_) => self.teams()?.find_by_id(team_id).await?,
        };
        if !team.is_user_member(user) {
            return Err(ServiceError::Forbidden(format!(
                "you are not in the team {} so you can't {}",
                team_id, action
            )));
        }
        Ok(team)
    }
}

#[async_trait]
impl Service for BoxServiceImpl {
    async fn on_all_services_registered(&self, registry: &Registry) {
        let _ = self
            .team_service
            .set(registry.get_service::<dyn TeamService>(TEAM_SERVICE));
        let _ = self
            .user_service
            .set(registry.get_service::<dyn UserService>(USER_SERVICE));
    }
}

#[async_trait]
impl BoxService for BoxServiceImpl {
    async fn find_by_team_filtered(
        &self,
        limit: i64,
        offset: i64,
        team_id: ObjectId,
    ) -> ServiceResult<Vec<MagicBox>> {
        self.repo
            .find_by_team_filtered(team_id, limit, offset)
            .await
            .context("could not list boxes")
    }

    async fn find_by_id(&self, user: ObjectId, box_id: ObjectId) -> ServiceResult<MagicBox> {
        let mut magic_box = self.load(box_id).await?;
        let team = self.team_of(user, &magic_box, "see its boxes").await?;
        magic_box.team = Ref::Resolved(team);
        Ok(magic_box)
    }

    async fn create_box(
        &self,
        user: ObjectId,
        team_id: ObjectId,
        name: &str,
        open_date: DateTime<Utc>,
    ) -> ServiceResult<MagicBox> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ServiceError::Validation("No box name provided".to_string()));
        }
        let team = self.teams()?.find_by_id(team_id).await?;
        if !team.is_user_member(user) {
            return Err(ServiceError::Forbidden(format!(
                "you are not in the team {} so you can't create boxes",
                team_id
            )));
        }

        let magic_box = MagicBox::new(Ref::Resolved(team), name, open_date);
        self.repo
            .store(&magic_box)
            .await
            .context("could not create box")?;
        info!(
            "Created box {} in team {} opening at {}",
            magic_box.id, team_id, magic_box.open_date
        );
        Ok(magic_box)
    }

    async fn insert_note(&self, user: ObjectId, box_id: ObjectId, text: &str) -> ServiceResult<MagicBox> {
        if text.trim().is_empty() {
            return Err(ServiceError::Validation("No note text provided".to_string()));
        }
        let mut magic_box = self.load(box_id).await?;
        let team = self.team_of(user, &magic_box, "add notes").await?;

        let now = Utc::now();
        let note = Note::new(text, user);
        magic_box
            .add_note(note.clone(), now)
            .map_err(|e| ServiceError::Conflict(e.to_string()))?;

        let appended = self
            .repo
            .append_note(box_id, &note, now)
            .await
            .context("could not add note")?;
        if !appended {
            // Opened between the read and the write.
            return Err(ServiceError::Conflict(
                "only closed boxes accept new notes".to_string(),
            ));
        }
        debug!("User {} added a note to box {}", user, box_id);

        magic_box.team = Ref::Resolved(team);
        Ok(magic_box)
    }

    async fn get_notes(&self, user: ObjectId, magic_box: &MagicBox) -> ServiceResult<Vec<Note>> {
        let visible = magic_box.visible_notes(user, Utc::now());
        let mut notes = Vec::with_capacity(visible.len());
        for note in visible {
            let author = match &note.from {
                Ref::Resolved(author) => author.clone(),
                Ref::Unresolved(id) => self.users()?.find_by_id(*id).await?,
            };
            notes.push(Note {
                text: note.text.clone(),
                from: Ref::Resolved(author),
            });
        }
        Ok(notes)
    }

    async fn boxes_with_notes_from(&self, author: ObjectId) -> ServiceResult<u64> {
        self.repo
            .count_notes_from(author)
            .await
            .context("could not count notes")
    }
}
