use std::collections::HashMap;

use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{Entity, Ref, User};

#[derive(Debug, Clone, PartialEq)]
pub struct Team {
    pub id: ObjectId,
    pub name: String,
    pub route_name: String,
    pub image: String,
    pub description: String,
    pub members: Vec<Ref<User>>,
    pub admins: Vec<Ref<User>>,
    pub join_requests: Vec<Ref<User>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MembershipError {
    #[error("user already requested to join")]
    AlreadyRequested,
    #[error("user is not in the join request list")]
    NotRequested,
}

impl Entity for Team {
    const KIND: &'static str = "team";

    fn id(&self) -> ObjectId {
        self.id
    }
}

fn contains(list: &[Ref<User>], user_id: ObjectId) -> bool {
    list.iter().any(|user| user.id() == user_id)
}

impl Team {
    /// A fresh team whose creator is its only member and admin.
    pub fn new(creator: Ref<User>, name: &str, route_name: String, image: &str, description: &str) -> Self {
        Team {
            id: ObjectId::new(),
            name: name.to_string(),
            route_name,
            image: image.to_string(),
            description: description.to_string(),
            members: vec![creator.clone()],
            admins: vec![creator],
            join_requests: Vec::new(),
        }
    }

    pub fn is_user_member(&self, user_id: ObjectId) -> bool {
        contains(&self.members, user_id)
    }

    pub fn is_user_admin(&self, user_id: ObjectId) -> bool {
        contains(&self.admins, user_id)
    }

    pub fn has_join_request(&self, user_id: ObjectId) -> bool {
        contains(&self.join_requests, user_id)
    }

    pub fn add_join_request(&mut self, user: Ref<User>) -> Result<(), MembershipError> {
        if self.has_join_request(user.id()) {
            return Err(MembershipError::AlreadyRequested);
        }
        self.join_requests.push(user);
        Ok(())
    }

    /// Moves `user` from the join requests into the members.
    pub fn accept_join_request(&mut self, user: Ref<User>) -> Result<(), MembershipError> {
        let user_id = user.id();
        let position = self
            .join_requests
            .iter()
            .position(|requester| requester.id() == user_id)
            .ok_or(MembershipError::NotRequested)?;
        self.join_requests.remove(position);
        if !self.is_user_member(user_id) {
            self.members.push(user);
        }
        Ok(())
    }

    /// Drops `user_id` from every list of the team. Returns whether the team
    /// referenced them at all.
    pub fn remove_user(&mut self, user_id: ObjectId) -> bool {
        let mut removed = false;
        for list in [&mut self.members, &mut self.admins, &mut self.join_requests] {
            let before = list.len();
            list.retain(|user| user.id() != user_id);
            removed |= list.len() != before;
        }
        removed
    }

    pub fn from_document(doc: TeamDocument) -> Self {
        let unresolved = |ids: Vec<ObjectId>| ids.into_iter().map(Ref::Unresolved).collect();
        Team {
            id: doc.id,
            name: doc.name,
            route_name: doc.route_name,
            image: doc.image,
            description: doc.description,
            members: unresolved(doc.members),
            admins: unresolved(doc.admins),
            join_requests: unresolved(doc.join_requests),
        }
    }

    /// Every user id this team points at, resolved or not.
    pub fn referenced_user_ids(&self) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self
            .members
            .iter()
            .chain(&self.admins)
            .chain(&self.join_requests)
            .map(Ref::id)
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Swaps unresolved user refs for the records in `users`. Ids with no
    /// record stay unresolved.
    pub fn populate(&mut self, users: &HashMap<ObjectId, User>) {
        for list in [&mut self.members, &mut self.admins, &mut self.join_requests] {
            for user in list.iter_mut() {
                if let Ref::Unresolved(id) = user {
                    if let Some(found) = users.get(id) {
                        *user = Ref::Resolved(found.clone());
                    }
                }
            }
        }
    }
}

/// Stored shape of a team: relations are plain ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamDocument {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub name: String,
    pub route_name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub members: Vec<ObjectId>,
    #[serde(default)]
    pub admins: Vec<ObjectId>,
    #[serde(default)]
    pub join_requests: Vec<ObjectId>,
}

impl From<&Team> for TeamDocument {
    fn from(team: &Team) -> Self {
        let ids = |list: &[Ref<User>]| list.iter().map(Ref::id).collect();
        TeamDocument {
            id: team.id,
            name: team.name.clone(),
            route_name: team.route_name.clone(),
            image: team.image.clone(),
            description: team.description.clone(),
            members: ids(&team.members[..]),
            admins: ids(&team.admins[..]),
            join_requests: ids(&team.join_requests[..]),
        }
    }
}
