use tracing::{info, warn};
use ulid::Ulid;

use crate::authz::{self, Actor, Role};
use crate::code;
use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{
    check_calendar_conflicts, check_operating_hours, check_salon_blocks, now_ms,
    validate_booking_window, validate_span,
};
use super::{Engine, EngineError};

/// Typed booking input. The API facade produces this from caller
/// strings; the engine works on parsed values only.
#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub salon_id: Ulid,
    pub staff_id: Ulid,
    pub service_id: Ulid,
    pub customer_id: Ulid,
    pub start: Ms,
    pub notes: Option<String>,
}

impl Engine {
    /// The booking coordinator. Validates fail-fast, conflict-checks
    /// under the staff calendar write lock, then performs the two-step
    /// write (appointment + service attachment) with a compensating
    /// rollback if the second step fails.
    ///
    /// Holding the calendar write lock from the conflict check through
    /// both writes is what makes concurrent double-booking impossible:
    /// the second of two racing requests re-runs its check against the
    /// first one's committed appointment.
    pub async fn create_booking(
        &self,
        actor: &Actor,
        req: BookingRequest,
    ) -> Result<Appointment, EngineError> {
        // Customers book for themselves; salon roles may book on a
        // customer's behalf (walk-ins, phone bookings).
        if actor.role == Role::Customer {
            authz::require_self(actor, req.customer_id)?;
        }
        if let Some(n) = &req.notes
            && n.len() > MAX_NOTES_LEN
        {
            return Err(EngineError::LimitExceeded("notes too long"));
        }

        let salon = self
            .salon(&req.salon_id)
            .ok_or(EngineError::SalonNotFound(req.salon_id))?;
        let salon_guard = salon.read().await;
        if !salon_guard.is_active {
            return Err(EngineError::SalonInactive(req.salon_id));
        }
        if !salon_guard.staff.contains(&req.staff_id) {
            return Err(EngineError::StaffNotFound(req.staff_id));
        }
        let service = salon_guard
            .services
            .get(&req.service_id)
            .ok_or(EngineError::ServiceNotFound(req.service_id))?;
        let duration_min = service.duration_min.unwrap_or(DEFAULT_SERVICE_DURATION_MIN);
        let span = Span {
            start: req.start,
            end: req.start + duration_min as Ms * MS_PER_MINUTE,
        };
        validate_span(&span)?;
        let now = now_ms();
        validate_booking_window(&span, now)?;
        check_operating_hours(&salon_guard, &span)?;
        check_salon_blocks(&salon_guard, &span).map_err(count_conflict)?;

        let cal = self
            .calendar(&req.staff_id)
            .ok_or(EngineError::StaffNotFound(req.staff_id))?;
        // Lock order: salon read is held, calendar write second.
        let mut guard = cal.write().await;
        if guard.appointments.len() + guard.services.len() >= MAX_INTERVALS_PER_CALENDAR {
            return Err(EngineError::LimitExceeded("calendar is full"));
        }
        check_calendar_conflicts(&guard, &span).map_err(count_conflict)?;

        let id = Ulid::new();
        let confirmation = self.reserve_code(id)?;

        let booked = Event::AppointmentBooked {
            id,
            salon_id: req.salon_id,
            staff_id: req.staff_id,
            customer_id: req.customer_id,
            span,
            code: confirmation.clone(),
            notes: req.notes.clone(),
            by: actor.id,
            at: now,
        };
        if let Err(e) = self.persist_apply_staff(&mut guard, &booked).await {
            // Nothing was applied; just release the reserved code.
            self.codes.remove(&confirmation);
            return Err(e);
        }

        if let Err(cause) = self.attach_service(&mut guard, id, &req, span).await {
            return Err(self
                .roll_back_booking(&mut guard, id, req.staff_id, &confirmation, cause)
                .await);
        }

        metrics::counter!(observability::BOOKINGS_TOTAL).increment(1);
        info!(
            appointment = %id,
            staff = %req.staff_id,
            code = %confirmation,
            start = span.start,
            "booking created"
        );
        Ok(guard
            .appointment(id)
            .cloned()
            .expect("appointment applied above"))
    }

    /// Reserve a unique confirmation code in the code index, retrying
    /// on collision.
    fn reserve_code(&self, appointment_id: Ulid) -> Result<String, EngineError> {
        use dashmap::mapref::entry::Entry;
        for _ in 0..CODE_RETRY_LIMIT {
            let candidate = code::generate();
            match self.codes.entry(candidate.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(appointment_id);
                    return Ok(candidate);
                }
                Entry::Occupied(_) => {
                    metrics::counter!(observability::CODE_COLLISIONS_TOTAL).increment(1);
                }
            }
        }
        Err(EngineError::LimitExceeded("confirmation code collisions"))
    }

    /// Step two of the booking write.
    async fn attach_service(
        &self,
        guard: &mut StaffCalendar,
        appointment_id: Ulid,
        req: &BookingRequest,
        span: Span,
    ) -> Result<(), EngineError> {
        #[cfg(test)]
        if self
            .fail_next_attach
            .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            return Err(EngineError::WalError("attachment write refused".into()));
        }

        let event = Event::ServiceAttached {
            id: Ulid::new(),
            appointment_id,
            staff_id: req.staff_id,
            service_id: req.service_id,
            span,
        };
        self.persist_apply_staff(guard, &event).await
    }

    /// Compensating rollback for a failed attachment: undo the
    /// appointment in working state, release its code, and append a
    /// tombstone so WAL replay converges. The original cause is always
    /// what the caller sees; a tombstone failure is logged and counted
    /// for out-of-band reconciliation, never surfaced instead.
    async fn roll_back_booking(
        &self,
        guard: &mut StaffCalendar,
        id: Ulid,
        staff_id: Ulid,
        confirmation: &str,
        cause: EngineError,
    ) -> EngineError {
        metrics::counter!(observability::BOOKING_ROLLBACKS_TOTAL).increment(1);
        guard.remove_appointment(id);
        self.codes.remove(confirmation);
        self.entities.remove(&id);

        let tombstone = Event::AppointmentRolledBack {
            id,
            staff_id,
            code: confirmation.to_string(),
        };
        match self.wal_append(&tombstone).await {
            Ok(()) => self.invalidations.publish(guard.salon_id, &tombstone),
            Err(e) => {
                metrics::counter!(observability::ROLLBACK_FAILURES_TOTAL).increment(1);
                tracing::error!(
                    appointment = %id,
                    error = %e,
                    "rollback tombstone append failed; replay will resurrect an orphaned appointment"
                );
            }
        }

        warn!(appointment = %id, cause = %cause, "booking rolled back after attachment failure");
        EngineError::AttachmentFailed(cause.to_string())
    }

    /// Lifecycle transition, driven by collaborating screens once a
    /// booking exists. Cancelling frees the slot for conflict checks.
    pub async fn set_appointment_status(
        &self,
        actor: &Actor,
        id: Ulid,
        status: AppointmentStatus,
    ) -> Result<(), EngineError> {
        let Some(EventOwner::Staff(staff_id)) = self.owner_of(&id) else {
            return Err(EngineError::AppointmentNotFound(id));
        };
        let cal = self
            .calendar(&staff_id)
            .ok_or(EngineError::AppointmentNotFound(id))?;
        let mut guard = cal.write().await;
        let (salon_id, customer_id, from) = {
            let appt = guard
                .appointment(id)
                .ok_or(EngineError::AppointmentNotFound(id))?;
            (appt.salon_id, appt.customer_id, appt.status)
        };

        let customer_cancel =
            actor.id == customer_id && status == AppointmentStatus::Cancelled;
        if !customer_cancel && !actor.is_member_of(salon_id) {
            return Err(EngineError::Unauthorized);
        }
        validate_transition(from, status)?;

        let event = Event::AppointmentStatusChanged {
            id,
            staff_id,
            status,
            by: actor.id,
            at: now_ms(),
        };
        self.persist_apply_staff(&mut guard, &event).await?;
        info!(
            appointment = %id,
            actor = %actor.id,
            from = from.as_str(),
            to = status.as_str(),
            "appointment status changed"
        );
        Ok(())
    }
}

fn validate_transition(
    from: AppointmentStatus,
    to: AppointmentStatus,
) -> Result<(), EngineError> {
    use AppointmentStatus::*;
    let allowed = matches!(
        (from, to),
        (Pending, Confirmed)
            | (Pending, Cancelled)
            | (Pending, Completed)
            | (Pending, NoShow)
            | (Confirmed, Cancelled)
            | (Confirmed, Completed)
            | (Confirmed, NoShow)
    );
    if allowed {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition { from, to })
    }
}

fn count_conflict(e: EngineError) -> EngineError {
    metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
    e
}
