use tracing::info;
use ulid::Ulid;

use crate::authz::{self, Actor};
use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{check_time_off_overlap, now_ms, validate_span};
use super::{Engine, EngineError, SharedCalendar};

#[derive(Debug, Clone)]
pub struct TimeOffRequestInput {
    pub salon_id: Ulid,
    pub staff_id: Ulid,
    pub kind: TimeOffKind,
    pub span: Span,
    pub reason: String,
    pub notes: Option<String>,
}

/// Time-off workflow: `pending → {approved, rejected, cancelled}`,
/// `approved → {cancelled}`; `rejected` and `cancelled` are terminal.
/// Every transition lands in the WAL with actor, timestamp, and
/// reason/notes — the event log is the audit trail.
impl Engine {
    pub async fn create_time_off(
        &self,
        actor: &Actor,
        input: TimeOffRequestInput,
    ) -> Result<TimeOffRequest, EngineError> {
        authz::require_self(actor, input.staff_id)?;
        authz::require_member(actor, input.salon_id)?;

        let salon = self
            .salon(&input.salon_id)
            .ok_or(EngineError::SalonNotFound(input.salon_id))?;
        if !salon.read().await.staff.contains(&input.staff_id) {
            return Err(EngineError::StaffNotFound(input.staff_id));
        }

        let reason = valid_reason(&input.reason, "reason")?;
        if let Some(n) = &input.notes
            && n.len() > MAX_NOTES_LEN
        {
            return Err(EngineError::LimitExceeded("notes too long"));
        }
        validate_span(&input.span)?;
        if input.span.duration_ms() > MAX_TIME_OFF_SPAN_MS {
            return Err(EngineError::Validation {
                field: "end_at",
                message: "span cannot exceed 90 days",
            });
        }
        let now = now_ms();
        if input.span.start < now {
            return Err(EngineError::Validation {
                field: "start_at",
                message: "cannot start in the past",
            });
        }

        let cal = self
            .calendar(&input.staff_id)
            .ok_or(EngineError::StaffNotFound(input.staff_id))?;
        let mut guard = cal.write().await;
        check_time_off_overlap(&guard, input.salon_id, &input.span)?;

        let id = Ulid::new();
        let event = Event::TimeOffRequested {
            id,
            salon_id: input.salon_id,
            staff_id: input.staff_id,
            kind: input.kind,
            span: input.span,
            reason,
            notes: input.notes,
            at: now,
        };
        self.persist_apply_staff(&mut guard, &event).await?;
        metrics::counter!(observability::TIME_OFF_TRANSITIONS_TOTAL, "transition" => "requested")
            .increment(1);
        info!(request = %id, staff = %input.staff_id, "time-off requested");
        Ok(guard
            .time_off_request(id)
            .cloned()
            .expect("request applied above"))
    }

    pub async fn approve_time_off(
        &self,
        actor: &Actor,
        id: Ulid,
        notes: Option<String>,
    ) -> Result<(), EngineError> {
        if let Some(n) = &notes
            && n.len() > MAX_NOTES_LEN
        {
            return Err(EngineError::LimitExceeded("notes too long"));
        }
        let (cal, staff_id) = self.calendar_for_review(actor, id).await?;
        let mut guard = cal.write().await;
        require_pending(&guard, id)?;

        let event = Event::TimeOffApproved {
            id,
            staff_id,
            reviewer: actor.id,
            notes,
            at: now_ms(),
        };
        self.persist_apply_staff(&mut guard, &event).await?;
        metrics::counter!(observability::TIME_OFF_TRANSITIONS_TOTAL, "transition" => "approved")
            .increment(1);
        info!(request = %id, reviewer = %actor.id, "time-off approved");
        Ok(())
    }

    pub async fn reject_time_off(
        &self,
        actor: &Actor,
        id: Ulid,
        reason: String,
    ) -> Result<(), EngineError> {
        let reason = valid_reason(&reason, "rejection_reason")?;
        let (cal, staff_id) = self.calendar_for_review(actor, id).await?;
        let mut guard = cal.write().await;
        require_pending(&guard, id)?;

        let event = Event::TimeOffRejected {
            id,
            staff_id,
            reviewer: actor.id,
            reason,
            at: now_ms(),
        };
        self.persist_apply_staff(&mut guard, &event).await?;
        metrics::counter!(observability::TIME_OFF_TRANSITIONS_TOTAL, "transition" => "rejected")
            .increment(1);
        info!(request = %id, reviewer = %actor.id, "time-off rejected");
        Ok(())
    }

    /// Only the original requester cancels, and only while the request
    /// is `pending` or `approved` and its window has not fully elapsed.
    pub async fn cancel_time_off(
        &self,
        actor: &Actor,
        id: Ulid,
        reason: String,
    ) -> Result<(), EngineError> {
        let Some(EventOwner::Staff(staff_id)) = self.owner_of(&id) else {
            return Err(EngineError::Unauthorized);
        };
        authz::require_self(actor, staff_id)?;
        let reason = valid_reason(&reason, "cancellation_reason")?;

        let cal = self
            .calendar(&staff_id)
            .ok_or(EngineError::Unauthorized)?;
        let mut guard = cal.write().await;
        let (status, span) = {
            let req = guard
                .time_off_request(id)
                .ok_or(EngineError::TimeOffNotFound(id))?;
            (req.status, req.span)
        };
        match status {
            TimeOffStatus::Pending | TimeOffStatus::Approved => {}
            other => return Err(EngineError::AlreadyProcessed(other)),
        }
        let now = now_ms();
        if span.end < now {
            return Err(EngineError::TimeOffElapsed);
        }

        let event = Event::TimeOffCancelled {
            id,
            staff_id,
            reason,
            at: now,
        };
        self.persist_apply_staff(&mut guard, &event).await?;
        metrics::counter!(observability::TIME_OFF_TRANSITIONS_TOTAL, "transition" => "cancelled")
            .increment(1);
        info!(request = %id, staff = %staff_id, "time-off cancelled");
        Ok(())
    }

    /// Resolve a request id to its calendar after verifying the actor
    /// may review for the owning salon. Failures are a uniform
    /// `Unauthorized` so probing ids reveals nothing.
    async fn calendar_for_review(
        &self,
        actor: &Actor,
        id: Ulid,
    ) -> Result<(SharedCalendar, Ulid), EngineError> {
        let Some(EventOwner::Staff(staff_id)) = self.owner_of(&id) else {
            return Err(EngineError::Unauthorized);
        };
        let cal = self
            .calendar(&staff_id)
            .ok_or(EngineError::Unauthorized)?;
        // salon_id never changes for a calendar, so reading it outside
        // the salon lock keeps the salon→staff lock order intact.
        let salon_id = cal.read().await.salon_id;
        let salon = self.salon(&salon_id).ok_or(EngineError::Unauthorized)?;
        authz::require_reviewer(actor, &*salon.read().await)?;
        Ok((cal, staff_id))
    }
}

fn require_pending(guard: &StaffCalendar, id: Ulid) -> Result<(), EngineError> {
    let req = guard
        .time_off_request(id)
        .ok_or(EngineError::TimeOffNotFound(id))?;
    if req.status != TimeOffStatus::Pending {
        return Err(EngineError::AlreadyProcessed(req.status));
    }
    Ok(())
}

/// Reasons travel on create, reject, and cancel; all share the minimum
/// length rule.
fn valid_reason(raw: &str, field: &'static str) -> Result<String, EngineError> {
    let trimmed = raw.trim();
    if trimmed.chars().count() < MIN_REASON_LEN {
        return Err(EngineError::Validation {
            field,
            message: "must be at least 10 characters",
        });
    }
    if trimmed.len() > MAX_NOTES_LEN {
        return Err(EngineError::LimitExceeded("reason too long"));
    }
    Ok(trimmed.to_string())
}
