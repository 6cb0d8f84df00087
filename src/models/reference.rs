use mongodb::bson::oid::ObjectId;
use thiserror::Error;

/// Anything stored under its own ObjectId.
pub trait Entity {
    const KIND: &'static str;

    fn id(&self) -> ObjectId;
}

/// A relation to another entity: either just the stored id, or the full
/// record once something has fetched it.
#[derive(Debug, Clone, PartialEq)]
pub enum Ref<T> {
    Unresolved(ObjectId),
    Resolved(T),
}

#[derive(Debug, Clone, Error)]
#[error("{kind} {id} is referenced but was never resolved")]
pub struct UnresolvedRef {
    pub kind: &'static str,
    pub id: ObjectId,
}

impl<T: Entity> Ref<T> {
    pub fn id(&self) -> ObjectId {
        match self {
            Ref::Unresolved(id) => *id,
            Ref::Resolved(entity) => entity.id(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Ref::Resolved(_))
    }

    pub fn resolved(&self) -> Result<&T, UnresolvedRef> {
        match self {
            Ref::Resolved(entity) => Ok(entity),
            Ref::Unresolved(id) => Err(UnresolvedRef {
                kind: T::KIND,
                id: *id,
            }),
        }
    }
}

impl<T> From<T> for Ref<T> {
    fn from(entity: T) -> Self {
        Ref::Resolved(entity)
    }
}
