use ulid::Ulid;

use crate::model::{AppointmentStatus, TimeOffStatus};

#[derive(Debug, PartialEq)]
pub enum EngineError {
    /// Actor lacks the required role/ownership, or probed a record it
    /// may not see. Deliberately carries no detail.
    Unauthorized,
    SalonNotFound(Ulid),
    SalonInactive(Ulid),
    StaffNotFound(Ulid),
    ServiceNotFound(Ulid),
    AppointmentNotFound(Ulid),
    BlockNotFound(Ulid),
    TimeOffNotFound(Ulid),
    /// Booking start is not strictly in the future.
    PastAppointment,
    /// Booking start is more than the advance window ahead.
    TooFarInFuture,
    /// Requested slot falls outside the salon's operating hours.
    OutsideHours,
    /// Slot collides with an existing appointment, block, or approved
    /// time-off for that staff member.
    StaffUnavailable,
    /// Staff member already has a pending/approved request overlapping
    /// this period.
    TimeOffOverlap,
    /// Approve/reject/cancel hit a request that is no longer in a state
    /// the transition accepts.
    AlreadyProcessed(TimeOffStatus),
    /// Time-off window has fully elapsed; there is nothing to cancel.
    TimeOffElapsed,
    InvalidTransition {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    /// Field-level input violation.
    Validation {
        field: &'static str,
        message: &'static str,
    },
    AlreadyExists(Ulid),
    /// The service-attachment write failed; the appointment write was
    /// rolled back. Carries the underlying cause.
    AttachmentFailed(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Unauthorized => write!(f, "unauthorized"),
            EngineError::SalonNotFound(id) => write!(f, "salon not found: {id}"),
            EngineError::SalonInactive(id) => write!(f, "salon is not active: {id}"),
            EngineError::StaffNotFound(id) => write!(f, "staff member not found: {id}"),
            EngineError::ServiceNotFound(id) => write!(f, "service not found: {id}"),
            EngineError::AppointmentNotFound(id) => write!(f, "appointment not found: {id}"),
            EngineError::BlockNotFound(id) => write!(f, "blocked time not found: {id}"),
            EngineError::TimeOffNotFound(id) => write!(f, "time-off request not found: {id}"),
            EngineError::PastAppointment => write!(f, "appointment start must be in the future"),
            EngineError::TooFarInFuture => {
                write!(f, "appointment start is beyond the advance booking window")
            }
            EngineError::OutsideHours => write!(f, "requested slot is outside operating hours"),
            EngineError::StaffUnavailable => {
                write!(f, "staff member is unavailable for the requested period")
            }
            EngineError::TimeOffOverlap => {
                write!(f, "an existing request already covers this period")
            }
            EngineError::AlreadyProcessed(status) => write!(f, "already {}", status.as_str()),
            EngineError::TimeOffElapsed => {
                write!(f, "time-off window has already elapsed")
            }
            EngineError::InvalidTransition { from, to } => {
                write!(f, "cannot move appointment from {} to {}", from.as_str(), to.as_str())
            }
            EngineError::Validation { field, message } => write!(f, "{field}: {message}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::AttachmentFailed(cause) => {
                write!(f, "service attachment failed (booking rolled back): {cause}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl EngineError {
    /// Expected, frequent outcomes — never logged as system failures.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            EngineError::StaffUnavailable
                | EngineError::OutsideHours
                | EngineError::TimeOffOverlap
                | EngineError::AlreadyProcessed(_)
        )
    }
}
