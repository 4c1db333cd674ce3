use tracing::{info, warn};
use ulid::Ulid;

use crate::authz::{self, Actor};
use crate::limits::*;
use crate::model::*;

use super::conflict::{now_ms, validate_span};
use super::{Engine, EngineError};

#[derive(Debug, Clone)]
pub struct BlockRequest {
    pub salon_id: Ulid,
    /// `None` blocks the whole salon.
    pub staff_id: Option<Ulid>,
    pub kind: BlockKind,
    pub span: Span,
    pub reason: Option<String>,
    pub recurring: bool,
    pub pattern: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BlockUpdate {
    pub kind: BlockKind,
    pub span: Span,
    pub reason: Option<String>,
    pub recurring: bool,
    pub pattern: Option<String>,
}

/// Blocked-time windows. Owner-scoped: every operation verifies salon
/// ownership first, and a missing salon or block is indistinguishable
/// from a foreign one.
///
/// Blocking over existing appointments is allowed (owners close shop
/// over booked slots when they must); overlaps are logged, not
/// rejected.
impl Engine {
    pub async fn add_block(
        &self,
        actor: &Actor,
        req: BlockRequest,
    ) -> Result<BlockedTime, EngineError> {
        let Some(salon) = self.salon(&req.salon_id) else {
            return Err(EngineError::Unauthorized);
        };
        validate_span(&req.span)?;
        validate_annotations(req.reason.as_deref(), req.pattern.as_deref())?;

        let id = Ulid::new();
        let event = Event::BlockAdded {
            id,
            salon_id: req.salon_id,
            staff_id: req.staff_id,
            kind: req.kind,
            span: req.span,
            reason: req.reason.clone(),
            recurring: req.recurring,
            pattern: req.pattern.clone(),
            by: actor.id,
            at: now_ms(),
        };

        match req.staff_id {
            None => {
                let mut guard = salon.write().await;
                authz::require_owner(actor, &guard)?;
                if guard.blocks.len() >= MAX_BLOCKS_PER_SALON {
                    return Err(EngineError::LimitExceeded("too many blocks"));
                }
                self.persist_apply_salon(&mut guard, &event).await?;
                info!(block = %id, salon = %req.salon_id, "salon-wide block added");
                Ok(guard.blocks.last().cloned().expect("block applied above"))
            }
            Some(staff_id) => {
                let salon_guard = salon.read().await;
                authz::require_owner(actor, &salon_guard)?;
                if !salon_guard.staff.contains(&staff_id) {
                    return Err(EngineError::StaffNotFound(staff_id));
                }
                let cal = self
                    .calendar(&staff_id)
                    .ok_or(EngineError::StaffNotFound(staff_id))?;
                let mut guard = cal.write().await;
                if guard.blocks.len() >= MAX_BLOCKS_PER_SALON {
                    return Err(EngineError::LimitExceeded("too many blocks"));
                }

                let covered = guard
                    .overlapping_appointments(&req.span)
                    .filter(|a| a.status.holds_slot())
                    .count();
                if covered > 0 {
                    warn!(
                        block = %id,
                        staff = %staff_id,
                        covered,
                        "new block overlaps active appointments"
                    );
                }

                self.persist_apply_staff(&mut guard, &event).await?;
                info!(block = %id, staff = %staff_id, "staff block added");
                Ok(guard.blocks.last().cloned().expect("block applied above"))
            }
        }
    }

    pub async fn update_block(
        &self,
        actor: &Actor,
        id: Ulid,
        update: BlockUpdate,
    ) -> Result<BlockedTime, EngineError> {
        validate_span(&update.span)?;
        validate_annotations(update.reason.as_deref(), update.pattern.as_deref())?;

        match self.owner_of(&id) {
            Some(EventOwner::Salon(salon_id)) => {
                let Some(salon) = self.salon(&salon_id) else {
                    return Err(EngineError::Unauthorized);
                };
                let mut guard = salon.write().await;
                authz::require_owner(actor, &guard)?;
                if !guard.blocks.iter().any(|b| b.id == id) {
                    return Err(EngineError::BlockNotFound(id));
                }
                let event = block_updated(id, salon_id, None, &update, actor.id);
                self.persist_apply_salon(&mut guard, &event).await?;
                Ok(guard
                    .blocks
                    .iter()
                    .find(|b| b.id == id)
                    .cloned()
                    .expect("block update applied above"))
            }
            Some(EventOwner::Staff(staff_id)) => {
                let (salon_id, cal) = self.staff_salon(&staff_id).await?;
                let Some(salon) = self.salon(&salon_id) else {
                    return Err(EngineError::Unauthorized);
                };
                let salon_guard = salon.read().await;
                authz::require_owner(actor, &salon_guard)?;
                let mut guard = cal.write().await;
                if !guard.blocks.iter().any(|b| b.id == id) {
                    return Err(EngineError::BlockNotFound(id));
                }
                let event = block_updated(id, salon_id, Some(staff_id), &update, actor.id);
                self.persist_apply_staff(&mut guard, &event).await?;
                Ok(guard
                    .blocks
                    .iter()
                    .find(|b| b.id == id)
                    .cloned()
                    .expect("block update applied above"))
            }
            None => Err(EngineError::Unauthorized),
        }
    }

    pub async fn remove_block(&self, actor: &Actor, id: Ulid) -> Result<Ulid, EngineError> {
        match self.owner_of(&id) {
            Some(EventOwner::Salon(salon_id)) => {
                let Some(salon) = self.salon(&salon_id) else {
                    return Err(EngineError::Unauthorized);
                };
                let mut guard = salon.write().await;
                authz::require_owner(actor, &guard)?;
                if !guard.blocks.iter().any(|b| b.id == id) {
                    return Err(EngineError::BlockNotFound(id));
                }
                let event = Event::BlockRemoved {
                    id,
                    salon_id,
                    staff_id: None,
                    by: actor.id,
                    at: now_ms(),
                };
                self.persist_apply_salon(&mut guard, &event).await?;
                Ok(id)
            }
            Some(EventOwner::Staff(staff_id)) => {
                let (salon_id, cal) = self.staff_salon(&staff_id).await?;
                let Some(salon) = self.salon(&salon_id) else {
                    return Err(EngineError::Unauthorized);
                };
                let salon_guard = salon.read().await;
                authz::require_owner(actor, &salon_guard)?;
                let mut guard = cal.write().await;
                if !guard.blocks.iter().any(|b| b.id == id) {
                    return Err(EngineError::BlockNotFound(id));
                }
                let event = Event::BlockRemoved {
                    id,
                    salon_id,
                    staff_id: Some(staff_id),
                    by: actor.id,
                    at: now_ms(),
                };
                self.persist_apply_staff(&mut guard, &event).await?;
                Ok(id)
            }
            None => Err(EngineError::Unauthorized),
        }
    }

    /// Calendar handle plus its (immutable) salon id, read without
    /// holding the calendar lock so the salon→staff order stays intact.
    async fn staff_salon(
        &self,
        staff_id: &Ulid,
    ) -> Result<(Ulid, super::SharedCalendar), EngineError> {
        let cal = self.calendar(staff_id).ok_or(EngineError::Unauthorized)?;
        let salon_id = cal.read().await.salon_id;
        Ok((salon_id, cal))
    }
}

fn block_updated(
    id: Ulid,
    salon_id: Ulid,
    staff_id: Option<Ulid>,
    update: &BlockUpdate,
    by: Ulid,
) -> Event {
    Event::BlockUpdated {
        id,
        salon_id,
        staff_id,
        kind: update.kind,
        span: update.span,
        reason: update.reason.clone(),
        recurring: update.recurring,
        pattern: update.pattern.clone(),
        by,
        at: now_ms(),
    }
}

fn validate_annotations(
    reason: Option<&str>,
    pattern: Option<&str>,
) -> Result<(), EngineError> {
    if reason.is_some_and(|r| r.len() > MAX_NOTES_LEN) {
        return Err(EngineError::LimitExceeded("reason too long"));
    }
    if pattern.is_some_and(|p| p.len() > MAX_PATTERN_LEN) {
        return Err(EngineError::LimitExceeded("pattern too long"));
    }
    Ok(())
}
