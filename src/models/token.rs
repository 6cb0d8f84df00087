use serde::{Deserialize, Serialize};

use super::{User, UserStatus};

/// The user fields embedded into a signed token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSnapshot {
    pub id: String,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub image_url: String,
    pub status: UserStatus,
}

impl From<&User> for UserSnapshot {
    fn from(user: &User) -> Self {
        UserSnapshot {
            id: user.id.to_hex(),
            username: user.username.clone(),
            email: user.email.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            image_url: user.image_url.clone(),
            status: user.status,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user: UserSnapshot,
    pub sub: String,
    pub iss: String,
    pub iat: usize,
    pub exp: usize,
}

/// What a successful login hands back.
#[derive(Debug, Clone)]
pub struct Token {
    pub jwt: String,
    pub user: User,
}
