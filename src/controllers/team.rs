// src/controllers/team.rs

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde_json::{json, Value};

use super::boxes::{BOX_CONTROLLER, BOX_LIST_FIELD};
use super::user::USER_CONTROLLER;
use super::{bind, forbidden_as_none, forbidden_field_as_none, wired, wrong_source};
use crate::models::User;
use crate::registry::{Controller, Registry};
use crate::schema::{page, Field, Fields, Node, OutputType, ResolveContext, Resolved};
use crate::team_management::{TeamFilter, TeamService};

pub const TEAM_CONTROLLER: &str = "team";
pub const TEAM_LIST_FIELD: &str = "teamList";
pub const TEAM_BY_ID_FIELD: &str = "teamByID";

pub struct TeamController {
    service: Arc<dyn TeamService>,
    user_type: OnceLock<OutputType>,
    box_list: OnceLock<Field>,
}

fn users(list: Vec<User>) -> Vec<Node> {
    list.into_iter().map(Node::User).collect()
}

impl TeamController {
    pub fn register(registry: &Registry, service: Arc<dyn TeamService>) -> Arc<Self> {
        let controller = Arc::new(TeamController {
            service,
            user_type: OnceLock::new(),
            box_list: OnceLock::new(),
        });
        registry.register_controller(TEAM_CONTROLLER, controller.clone());
        controller
    }

    /// Scalar fields always render. Relations need a logged in viewer and
    /// depth budget; the ones the viewer may not see come back as `null`.
    async fn render(self: Arc<Self>, ctx: ResolveContext) -> Resolved {
        let Node::Team(team) = &ctx.source else {
            return Err(wrong_source("team"));
        };
        let mut out = json!({
            "id": team.id.to_hex(),
            "name": team.name,
            "routeName": team.route_name,
            "image": team.image,
            "description": team.description,
            "memberCount": self.service.team_members_count(team),
        });

        let Some(child) = ctx.nested(Node::Team(team.clone())) else {
            return Ok(out);
        };
        let mut relations = json!({
            "members": null,
            "admins": null,
            "joinRequests": null,
            "boxes": null,
        });
        if let Some(viewer) = ctx.viewer {
            let user_type = wired(&self.user_type, "user output type")?;
            if let Some(members) = forbidden_as_none(self.service.team_members(viewer, team).await)? {
                relations["members"] = user_type.resolve_all(&child, users(members)).await?;
            }
            if let Some(admins) = forbidden_as_none(self.service.team_admins(viewer, team).await)? {
                relations["admins"] = user_type.resolve_all(&child, users(admins)).await?;
            }
            if let Some(requests) =
                forbidden_as_none(self.service.team_join_requests(viewer, team).await)?
            {
                relations["joinRequests"] = user_type.resolve_all(&child, users(requests)).await?;
            }
            let box_list = wired(&self.box_list, "box list field")?;
            if let Some(boxes) = forbidden_field_as_none(box_list.resolve(child).await)? {
                relations["boxes"] = boxes;
            }
        }
        if let (Value::Object(out), Value::Object(relations)) = (&mut out, relations) {
            out.extend(relations);
        }
        Ok(out)
    }

    // field teamList(limit, offset, search)
    async fn team_list(self: Arc<Self>, ctx: ResolveContext) -> Resolved {
        let filter = TeamFilter {
            limit: ctx.int_or("limit", 0)?,
            offset: ctx.int_or("offset", 0)?,
            search: ctx.str_or("search", "")?.to_string(),
        };
        let teams = self.service.find_filtered(filter).await?;
        let mut nodes = Vec::with_capacity(teams.len());
        for team in teams {
            nodes.push(Arc::clone(&self).render(ctx.with_source(Node::Team(team))).await?);
        }
        Ok(page(Value::Array(nodes)))
    }

    // field teamByID(id)
    async fn team_by_id(self: Arc<Self>, ctx: ResolveContext) -> Resolved {
        let team = self.service.find_by_id(ctx.id_arg("id")?).await?;
        self.render(ctx.with_source(Node::Team(team))).await
    }

    // mutation createTeam(name, image, description)
    async fn create_team(self: Arc<Self>, ctx: ResolveContext) -> Resolved {
        let viewer = ctx.require_viewer()?;
        let team = self
            .service
            .create_team(
                viewer,
                ctx.str_arg("name")?,
                ctx.str_or("image", "")?,
                ctx.str_or("description", "")?,
            )
            .await?;
        self.render(ctx.with_source(Node::Team(team))).await
    }

    // mutation requestTeamInvite(teamID)
    async fn request_team_invite(self: Arc<Self>, ctx: ResolveContext) -> Resolved {
        let viewer = ctx.require_viewer()?;
        let team = self
            .service
            .request_team_invite(viewer, ctx.id_arg("teamID")?)
            .await?;
        self.render(ctx.with_source(Node::Team(team))).await
    }

    // mutation acceptInviteRequest(teamID, userID)
    async fn accept_invite_request(self: Arc<Self>, ctx: ResolveContext) -> Resolved {
        let viewer = ctx.require_viewer()?;
        let team = self
            .service
            .accept_invite_request(viewer, ctx.id_arg("userID")?, ctx.id_arg("teamID")?)
            .await?;
        self.render(ctx.with_source(Node::Team(team))).await
    }
}

#[async_trait]
impl Controller for TeamController {
    async fn on_all_controllers_registered(&self, registry: &Registry) {
        let _ = self
            .user_type
            .set(registry.get_output_type(USER_CONTROLLER, "user"));
        let _ = self
            .box_list
            .set(registry.get_field(BOX_CONTROLLER, BOX_LIST_FIELD));
    }

    fn queries(self: Arc<Self>) -> Fields {
        Fields::from([
            ("teams", bind(&self, Self::team_list)),
            ("team", bind(&self, Self::team_by_id)),
        ])
    }

    fn mutations(self: Arc<Self>) -> Fields {
        Fields::from([
            ("createTeam", bind(&self, Self::create_team)),
            ("requestTeamInvite", bind(&self, Self::request_team_invite)),
            ("acceptInviteRequest", bind(&self, Self::accept_invite_request)),
        ])
    }

    fn output_type(self: Arc<Self>, name: &str) -> Option<OutputType> {
        match name {
            "team" => Some(bind(&self, Self::render)),
            _ => None,
        }
    }

    fn field(self: Arc<Self>, name: &str) -> Option<Field> {
        match name {
            TEAM_LIST_FIELD => Some(bind(&self, Self::team_list)),
            TEAM_BY_ID_FIELD => Some(bind(&self, Self::team_by_id)),
            _ => None,
        }
    }
}
