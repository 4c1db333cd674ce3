use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// Structural sanity for any caller-supplied interval.
pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.end <= span.start {
        return Err(EngineError::Validation {
            field: "end",
            message: "end must be after start",
        });
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

/// Temporal business rules for a new booking: strictly future-dated,
/// within the advance window.
pub(crate) fn validate_booking_window(span: &Span, now: Ms) -> Result<(), EngineError> {
    if span.start <= now {
        return Err(EngineError::PastAppointment);
    }
    if span.start - now > MAX_ADVANCE_MS {
        return Err(EngineError::TooFarInFuture);
    }
    Ok(())
}

/// The requested slot must fall inside the salon's open window for the
/// booking's weekday. A day with no configured row is unconstrained.
pub(crate) fn check_operating_hours(salon: &SalonState, span: &Span) -> Result<(), EngineError> {
    let Some(hours) = salon.hours_for(weekday_of(span.start)) else {
        return Ok(());
    };
    if hours.closed {
        return Err(EngineError::OutsideHours);
    }
    let start_min = minutes_into_day(span.start);
    // Computed from the start so a slot running past midnight can't
    // wrap back into range.
    let end_min = start_min as i64 + span.duration_ms() / MS_PER_MINUTE;
    if start_min < hours.open_min || end_min > hours.close_min as i64 {
        return Err(EngineError::OutsideHours);
    }
    Ok(())
}

/// Salon-wide blocks vs the requested slot. Runs under the salon read
/// lock, before the staff calendar is locked.
pub(crate) fn check_salon_blocks(salon: &SalonState, span: &Span) -> Result<(), EngineError> {
    if salon.blocks.iter().any(|b| b.span.overlaps(span)) {
        return Err(EngineError::StaffUnavailable);
    }
    Ok(())
}

/// Everything on the staff member's own calendar that claims the slot:
/// personal blocks, approved time-off, and appointments still holding
/// their slot. Caller holds the calendar write lock, so the verdict
/// stays true until the insert commits.
pub(crate) fn check_calendar_conflicts(
    calendar: &StaffCalendar,
    span: &Span,
) -> Result<(), EngineError> {
    if calendar.blocks.iter().any(|b| b.span.overlaps(span)) {
        return Err(EngineError::StaffUnavailable);
    }
    if calendar
        .time_off
        .iter()
        .any(|r| r.status == TimeOffStatus::Approved && r.span.overlaps(span))
    {
        return Err(EngineError::StaffUnavailable);
    }
    if calendar
        .overlapping_appointments(span)
        .any(|a| a.status.holds_slot())
    {
        return Err(EngineError::StaffUnavailable);
    }
    Ok(())
}

/// A staff member may hold only one live (pending/approved) time-off
/// request per period per salon.
pub(crate) fn check_time_off_overlap(
    calendar: &StaffCalendar,
    salon_id: ulid::Ulid,
    span: &Span,
) -> Result<(), EngineError> {
    let live = |r: &&TimeOffRequest| {
        matches!(r.status, TimeOffStatus::Pending | TimeOffStatus::Approved)
            && r.salon_id == salon_id
    };
    if calendar.time_off.iter().filter(live).any(|r| r.span.overlaps(span)) {
        return Err(EngineError::TimeOffOverlap);
    }
    Ok(())
}
