use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::SalonState;

/// Role attached to an authenticated identity by the caller's session
/// layer. This core trusts the `Actor` it is handed; building one from
/// credentials is the embedding application's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Owner,
    Manager,
    Staff,
    Customer,
}

/// The acting identity, checked once per operation before any business
/// logic runs. All ownership/membership rules live in this module so
/// the security contract has a single home.
///
/// A failed check is always the bare `Unauthorized` — callers must not
/// learn whether the record they probed exists.
#[derive(Debug, Clone, PartialEq)]
pub struct Actor {
    pub id: Ulid,
    pub role: Role,
    /// Salons this identity belongs to (owns, manages, or works at).
    pub salons: Vec<Ulid>,
}

impl Actor {
    pub fn new(id: Ulid, role: Role, salons: Vec<Ulid>) -> Self {
        Self { id, role, salons }
    }

    pub fn is_member_of(&self, salon_id: Ulid) -> bool {
        self.salons.contains(&salon_id)
    }
}

/// The actor owns this salon.
pub fn require_owner(actor: &Actor, salon: &SalonState) -> Result<(), EngineError> {
    if actor.role == Role::Owner && salon.owner_id == actor.id {
        Ok(())
    } else {
        Err(EngineError::Unauthorized)
    }
}

/// The actor works at (or owns/manages) this salon.
pub fn require_member(actor: &Actor, salon_id: Ulid) -> Result<(), EngineError> {
    if actor.is_member_of(salon_id) {
        Ok(())
    } else {
        Err(EngineError::Unauthorized)
    }
}

/// The actor may review (approve/reject) time-off for this salon:
/// its owner, or a manager who belongs to it.
pub fn require_reviewer(actor: &Actor, salon: &SalonState) -> Result<(), EngineError> {
    match actor.role {
        Role::Owner if salon.owner_id == actor.id => Ok(()),
        Role::Manager if actor.is_member_of(salon.id) => Ok(()),
        _ => Err(EngineError::Unauthorized),
    }
}

/// The actor is the named person (e.g. the staff member a time-off
/// request is for).
pub fn require_self(actor: &Actor, id: Ulid) -> Result<(), EngineError> {
    if actor.id == id {
        Ok(())
    } else {
        Err(EngineError::Unauthorized)
    }
}
