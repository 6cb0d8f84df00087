use chrono::{DateTime, TimeZone, Utc};
use mongodb::bson::{oid::ObjectId, DateTime as BsonDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{Entity, Ref, Team, User};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BoxStatus {
    Closed,
    Open,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("only closed boxes accept new notes")]
pub struct BoxAlreadyOpen;

#[derive(Debug, Clone, PartialEq)]
pub struct Note {
    pub text: String,
    pub from: Ref<User>,
}

impl Note {
    pub fn new(text: &str, author: ObjectId) -> Self {
        Note {
            text: text.to_string(),
            from: Ref::Unresolved(author),
        }
    }

    pub fn is_authored_by(&self, user_id: ObjectId) -> bool {
        self.from.id() == user_id
    }
}

/// A time-locked container of notes. Its status is never stored; it is
/// derived from `open_date` every time someone asks.
#[derive(Debug, Clone, PartialEq)]
pub struct MagicBox {
    pub id: ObjectId,
    pub name: String,
    pub open_date: DateTime<Utc>,
    pub team: Ref<Team>,
    pub notes: Vec<Note>,
}

impl Entity for MagicBox {
    const KIND: &'static str = "box";

    fn id(&self) -> ObjectId {
        self.id
    }
}

impl MagicBox {
    pub fn new(team: Ref<Team>, name: &str, open_date: DateTime<Utc>) -> Self {
        MagicBox {
            id: ObjectId::new(),
            name: name.to_string(),
            open_date,
            team,
            notes: Vec::new(),
        }
    }

    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        now > self.open_date
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> BoxStatus {
        if self.is_open_at(now) {
            BoxStatus::Open
        } else {
            BoxStatus::Closed
        }
    }

    pub fn add_note(&mut self, note: Note, now: DateTime<Utc>) -> Result<(), BoxAlreadyOpen> {
        if self.is_open_at(now) {
            return Err(BoxAlreadyOpen);
        }
        self.notes.push(note);
        Ok(())
    }

    /// Notes `viewer` may read at `now`: all of them once the box is open,
    /// otherwise only the viewer's own.
    pub fn visible_notes(&self, viewer: ObjectId, now: DateTime<Utc>) -> Vec<&Note> {
        let open = self.is_open_at(now);
        self.notes
            .iter()
            .filter(|note| open || note.is_authored_by(viewer))
            .collect()
    }
}

// ─── STORED SHAPE ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteDocument {
    pub text: String,
    pub from: ObjectId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoxDocument {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub name: String,
    pub open_date: BsonDateTime,
    pub team: ObjectId,
    #[serde(default)]
    pub notes: Vec<NoteDocument>,
}

impl From<&Note> for NoteDocument {
    fn from(note: &Note) -> Self {
        NoteDocument {
            text: note.text.clone(),
            from: note.from.id(),
        }
    }
}

impl From<&MagicBox> for BoxDocument {
    fn from(magic_box: &MagicBox) -> Self {
        BoxDocument {
            id: magic_box.id,
            name: magic_box.name.clone(),
            open_date: BsonDateTime::from_millis(magic_box.open_date.timestamp_millis()),
            team: magic_box.team.id(),
            notes: magic_box.notes.iter().map(NoteDocument::from).collect(),
        }
    }
}

impl MagicBox {
    /// Returns `None` when the stored open date is outside chrono's range.
    pub fn from_document(doc: BoxDocument) -> Option<Self> {
        let open_date = Utc
            .timestamp_millis_opt(doc.open_date.timestamp_millis())
            .single()?;
        Some(MagicBox {
            id: doc.id,
            name: doc.name,
            open_date,
            team: Ref::Unresolved(doc.team),
            notes: doc
                .notes
                .into_iter()
                .map(|note| Note {
                    text: note.text,
                    from: Ref::Unresolved(note.from),
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn box_opening_in(offset: Duration) -> MagicBox {
        MagicBox::new(Ref::Unresolved(ObjectId::new()), "Summer", Utc::now() + offset)
    }

    #[test]
    fn status_follows_the_open_date() {
        let now = Utc::now();
        let magic_box = MagicBox::new(Ref::Unresolved(ObjectId::new()), "Summer", now);
        assert_eq!(magic_box.status_at(now), BoxStatus::Closed);
        assert_eq!(magic_box.status_at(now + Duration::milliseconds(1)), BoxStatus::Open);
    }

    #[test]
    fn open_boxes_reject_notes() {
        let mut magic_box = box_opening_in(Duration::days(-1));
        let err = magic_box.add_note(Note::new("late", ObjectId::new()), Utc::now());
        assert_eq!(err, Err(BoxAlreadyOpen));
        assert!(magic_box.notes.is_empty());
    }

    #[test]
    fn closed_boxes_only_show_own_notes() {
        let me = ObjectId::new();
        let other = ObjectId::new();
        let mut magic_box = box_opening_in(Duration::days(1));
        let now = Utc::now();
        magic_box.add_note(Note::new("mine", me), now).unwrap();
        magic_box.add_note(Note::new("theirs", other), now).unwrap();

        let visible = magic_box.visible_notes(me, now);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].text, "mine");

        let after_opening = magic_box.open_date + Duration::seconds(1);
        assert_eq!(magic_box.visible_notes(me, after_opening).len(), 2);
    }

    #[test]
    fn documents_keep_the_open_date_to_the_millisecond() {
        let magic_box = box_opening_in(Duration::hours(3));
        let restored = MagicBox::from_document(BoxDocument::from(&magic_box)).unwrap();
        assert_eq!(
            restored.open_date.timestamp_millis(),
            magic_box.open_date.timestamp_millis()
        );
        assert_eq!(restored.team.id(), magic_box.team.id());
    }
}
