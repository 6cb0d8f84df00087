mod magic_box;
mod reference;
mod team;
mod token;
mod user;

pub use magic_box::{BoxDocument, MagicBox, Note, NoteDocument};
pub use reference::{Entity, Ref, UnresolvedRef};
pub use team::{MembershipError, Team, TeamDocument};
pub use token::{Claims, Token, UserSnapshot};
pub use user::{NewUser, User, UserStatus, UserUpdate};
