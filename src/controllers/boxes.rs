// src/controllers/boxes.rs

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};

use super::team::TEAM_CONTROLLER;
use super::user::USER_CONTROLLER;
use super::{bind, wired, wrong_source};
use crate::box_management::BoxService;
use crate::error::{ApiError, ServiceError};
use crate::models::Ref;
use crate::registry::{Controller, Registry};
use crate::schema::{page, Field, Fields, Node, OutputType, ResolveContext, Resolved};

pub const BOX_CONTROLLER: &str = "box";
pub const BOX_LIST_FIELD: &str = "boxList";

pub struct BoxController {
    service: Arc<dyn BoxService>,
    team_type: OnceLock<OutputType>,
    user_type: OnceLock<OutputType>,
}

impl BoxController {
    pub fn register(registry: &Registry, service: Arc<dyn BoxService>) -> Arc<Self> {
        let controller = Arc::new(BoxController {
            service,
            team_type: OnceLock::new(),
            user_type: OnceLock::new(),
        });
        registry.register_controller(BOX_CONTROLLER, controller.clone());
        controller
    }

    async fn render(self: Arc<Self>, ctx: ResolveContext) -> Resolved {
        let Node::MagicBox(magic_box) = &ctx.source else {
            return Err(wrong_source("box"));
        };
        let now = Utc::now();
        let mut out = json!({
            "id": magic_box.id.to_hex(),
            "name": magic_box.name,
            "openDate": magic_box.open_date.to_rfc3339_opts(SecondsFormat::Millis, true),
            "isOpen": magic_box.is_open_at(now),
            "status": magic_box.status_at(now),
        });

        let Some(child) = ctx.nested(Node::Root) else {
            return Ok(out);
        };
        out["team"] = match &magic_box.team {
            Ref::Resolved(team) => {
                let team_type = wired(&self.team_type, "team output type")?;
                team_type.resolve(child.with_source(Node::Team(team.clone()))).await?
            }
            Ref::Unresolved(_) => Value::Null,
        };
        out["notes"] = match ctx.viewer {
            Some(viewer) => {
                let notes = self.service.get_notes(viewer, magic_box).await?;
                let mut rendered = Vec::with_capacity(notes.len());
                for note in notes {
                    rendered.push(
                        Arc::clone(&self)
                            .render_note(child.with_source(Node::Note(note)))
                            .await?,
                    );
                }
                Value::Array(rendered)
            }
            None => Value::Null,
        };
        Ok(out)
    }

    async fn render_note(self: Arc<Self>, ctx: ResolveContext) -> Resolved {
        let Node::Note(note) = &ctx.source else {
            return Err(wrong_source("note"));
        };
        let author = note.from.resolved().map_err(ServiceError::from)?;
        let from = match ctx.nested(Node::Root) {
            Some(child) => {
                let user_type = wired(&self.user_type, "user output type")?;
                user_type
                    .resolve(child.with_source(Node::User(author.clone())))
                    .await?
            }
            None => Value::Null,
        };
        Ok(json!({ "text": note.text, "from": from }))
    }

    // field boxList(limit, offset) on a team
    async fn box_list(self: Arc<Self>, ctx: ResolveContext) -> Resolved {
        let Node::Team(team) = &ctx.source else {
            return Err(wrong_source("box list"));
        };
        let viewer = ctx.require_viewer()?;
        if !team.is_user_member(viewer) {
            return Err(ApiError::Forbidden(format!(
                "you are not in the team {} so you can't see its boxes",
                team.id
            )));
        }
        let boxes = self
            .service
            .find_by_team_filtered(ctx.int_or("limit", 0)?, ctx.int_or("offset", 0)?, team.id)
            .await?;
        let mut nodes = Vec::with_capacity(boxes.len());
        for mut magic_box in boxes {
            magic_box.team = Ref::Resolved(team.clone());
            nodes.push(
                Arc::clone(&self)
                    .render(ctx.with_source(Node::MagicBox(magic_box)))
                    .await?,
            );
        }
        Ok(page(Value::Array(nodes)))
    }

    // query box(id)
    async fn magic_box(self: Arc<Self>, ctx: ResolveContext) -> Resolved {
        let viewer = ctx.require_viewer()?;
        let magic_box = self.service.find_by_id(viewer, ctx.id_arg("id")?).await?;
        self.render(ctx.with_source(Node::MagicBox(magic_box))).await
    }

    // mutation createBox(teamID, name, openDate)
    async fn create_box(self: Arc<Self>, ctx: ResolveContext) -> Resolved {
        let viewer = ctx.require_viewer()?;
        let magic_box = self
            .service
            .create_box(
                viewer,
                ctx.id_arg("teamID")?,
                ctx.str_arg("name")?,
                ctx.date_arg("openDate")?,
            )
            .await?;
        self.render(ctx.with_source(Node::MagicBox(magic_box))).await
    }

    // mutation insertNote(boxID, text)
    async fn insert_note(self: Arc<Self>, ctx: ResolveContext) -> Resolved {
        let viewer = ctx.require_viewer()?;
        let magic_box = self
            .service
            .insert_note(viewer, ctx.id_arg("boxID")?, ctx.str_arg("text")?)
            .await?;
        self.render(ctx.with_source(Node::MagicBox(magic_box))).await
    }
}

#[async_trait]
impl Controller for BoxController {
    async fn on_all_controllers_registered(&self, registry: &Registry) {
        let _ = self
            .team_type
            .set(registry.get_output_type(TEAM_CONTROLLER, "team"));
        let _ = self
            .user_type
            .set(registry.get_output_type(USER_CONTROLLER, "user"));
    }

    fn queries(self: Arc<Self>) -> Fields {
        Fields::from([("box", bind(&self, Self::magic_box))])
    }

    fn mutations(self: Arc<Self>) -> Fields {
        Fields::from([
            ("createBox", bind(&self, Self::create_box)),
            ("insertNote", bind(&self, Self::insert_note)),
        ])
    }

    fn output_type(self: Arc<Self>, name: &str) -> Option<OutputType> {
        match name {
            "box" => Some(bind(&self, Self::render)),
            "note" => Some(bind(&self, Self::render_note)),
            _ => None,
        }
    }

    fn field(self: Arc<Self>, name: &str) -> Option<Field> {
        match name {
            BOX_LIST_FIELD => Some(bind(&self, Self::box_list)),
            _ => None,
        }
    }
}
