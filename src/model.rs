use std::collections::HashMap;

use chrono::Datelike;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::{MS_PER_DAY, MS_PER_MINUTE};

/// Unix milliseconds (UTC) — the only time type inside the engine.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// The one conflict predicate in the crate. Touching endpoints
    /// (`self.end == other.start`) do not overlap — back-to-back
    /// bookings are legal.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Day of week, named at every boundary. Converted from `chrono` exactly
/// once, at the edge — no 0..6 integers anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Weekday {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

pub const ALL_WEEKDAYS: [Weekday; 7] = [
    Weekday::Monday,
    Weekday::Tuesday,
    Weekday::Wednesday,
    Weekday::Thursday,
    Weekday::Friday,
    Weekday::Saturday,
    Weekday::Sunday,
];

impl Weekday {
    pub fn as_str(&self) -> &'static str {
        match self {
            Weekday::Monday => "monday",
            Weekday::Tuesday => "tuesday",
            Weekday::Wednesday => "wednesday",
            Weekday::Thursday => "thursday",
            Weekday::Friday => "friday",
            Weekday::Saturday => "saturday",
            Weekday::Sunday => "sunday",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "monday" => Some(Weekday::Monday),
            "tuesday" => Some(Weekday::Tuesday),
            "wednesday" => Some(Weekday::Wednesday),
            "thursday" => Some(Weekday::Thursday),
            "friday" => Some(Weekday::Friday),
            "saturday" => Some(Weekday::Saturday),
            "sunday" => Some(Weekday::Sunday),
            _ => None,
        }
    }

    /// Slot in the per-salon hours table.
    pub fn index(&self) -> usize {
        match self {
            Weekday::Monday => 0,
            Weekday::Tuesday => 1,
            Weekday::Wednesday => 2,
            Weekday::Thursday => 3,
            Weekday::Friday => 4,
            Weekday::Saturday => 5,
            Weekday::Sunday => 6,
        }
    }
}

impl From<chrono::Weekday> for Weekday {
    fn from(d: chrono::Weekday) -> Self {
        match d {
            chrono::Weekday::Mon => Weekday::Monday,
            chrono::Weekday::Tue => Weekday::Tuesday,
            chrono::Weekday::Wed => Weekday::Wednesday,
            chrono::Weekday::Thu => Weekday::Thursday,
            chrono::Weekday::Fri => Weekday::Friday,
            chrono::Weekday::Sat => Weekday::Saturday,
            chrono::Weekday::Sun => Weekday::Sunday,
        }
    }
}

/// Weekday of a UTC timestamp.
pub fn weekday_of(ms: Ms) -> Weekday {
    chrono::DateTime::from_timestamp_millis(ms)
        .expect("timestamp validated against MIN/MAX_VALID_TIMESTAMP_MS")
        .weekday()
        .into()
}

/// Minutes since UTC midnight.
pub fn minutes_into_day(ms: Ms) -> u16 {
    (ms.rem_euclid(MS_PER_DAY) / MS_PER_MINUTE) as u16
}

// ── Domain enums ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
    NoShow,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::NoShow => "no_show",
        }
    }

    /// Whether an appointment in this status still claims its slot.
    pub fn holds_slot(&self) -> bool {
        matches!(self, AppointmentStatus::Pending | AppointmentStatus::Confirmed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Manual,
    Maintenance,
    Holiday,
    Personal,
}

impl BlockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::Manual => "manual",
            BlockKind::Maintenance => "maintenance",
            BlockKind::Holiday => "holiday",
            BlockKind::Personal => "personal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(BlockKind::Manual),
            "maintenance" => Some(BlockKind::Maintenance),
            "holiday" => Some(BlockKind::Holiday),
            "personal" => Some(BlockKind::Personal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeOffKind {
    Vacation,
    SickLeave,
    Personal,
    Bereavement,
    Other,
}

impl TimeOffKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeOffKind::Vacation => "vacation",
            TimeOffKind::SickLeave => "sick_leave",
            TimeOffKind::Personal => "personal",
            TimeOffKind::Bereavement => "bereavement",
            TimeOffKind::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "vacation" => Some(TimeOffKind::Vacation),
            "sick_leave" => Some(TimeOffKind::SickLeave),
            "personal" => Some(TimeOffKind::Personal),
            "bereavement" => Some(TimeOffKind::Bereavement),
            "other" => Some(TimeOffKind::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeOffStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

impl TimeOffStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeOffStatus::Pending => "pending",
            TimeOffStatus::Approved => "approved",
            TimeOffStatus::Rejected => "rejected",
            TimeOffStatus::Cancelled => "cancelled",
        }
    }
}

// ── Records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Appointment {
    pub id: Ulid,
    pub salon_id: Ulid,
    pub customer_id: Ulid,
    pub staff_id: Ulid,
    pub span: Span,
    pub status: AppointmentStatus,
    /// Human-facing booking reference, independent of `id`.
    pub code: String,
    pub notes: Option<String>,
    pub created_by: Ulid,
    pub created_at: Ms,
    pub updated_by: Ulid,
    pub updated_at: Ms,
}

/// Service attachment row. Owned by its parent appointment; written in
/// the same logical transaction and rolled back together.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppointmentService {
    pub id: Ulid,
    pub appointment_id: Ulid,
    pub service_id: Ulid,
    pub staff_id: Ulid,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockedTime {
    pub id: Ulid,
    pub salon_id: Ulid,
    /// `None` = whole-salon block.
    pub staff_id: Option<Ulid>,
    pub kind: BlockKind,
    pub span: Span,
    pub reason: Option<String>,
    pub recurring: bool,
    /// Opaque recurrence pattern, stored verbatim and never interpreted
    /// by this core.
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeOffRequest {
    pub id: Ulid,
    pub salon_id: Ulid,
    pub staff_id: Ulid,
    pub kind: TimeOffKind,
    pub span: Span,
    pub reason: String,
    pub notes: Option<String>,
    pub status: TimeOffStatus,
    pub requested_at: Ms,
    pub reviewed_by: Option<Ulid>,
    pub reviewed_at: Option<Ms>,
    pub review_notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatingHours {
    pub day: Weekday,
    /// Minutes from midnight.
    pub open_min: u16,
    pub close_min: u16,
    pub closed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceInfo {
    pub id: Ulid,
    pub name: String,
    pub duration_min: Option<u32>,
    pub price_cents: i64,
}

// ── Aggregates ───────────────────────────────────────────────────

/// Salon directory entry plus everything scoped to the whole salon:
/// service catalog, staff roster, salon-wide blocks, operating hours.
#[derive(Debug, Clone)]
pub struct SalonState {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub name: String,
    pub is_active: bool,
    pub staff: Vec<Ulid>,
    pub services: HashMap<Ulid, ServiceInfo>,
    /// Salon-wide blocks only (`staff_id == None`).
    pub blocks: Vec<BlockedTime>,
    /// At most one entry per weekday — upsert, never insert-only.
    pub hours: [Option<OperatingHours>; 7],
}

impl SalonState {
    pub fn new(id: Ulid, owner_id: Ulid, name: String) -> Self {
        Self {
            id,
            owner_id,
            name,
            is_active: true,
            staff: Vec::new(),
            services: HashMap::new(),
            blocks: Vec::new(),
            hours: [None; 7],
        }
    }

    pub fn hours_for(&self, day: Weekday) -> Option<&OperatingHours> {
        self.hours[day.index()].as_ref()
    }
}

/// One staff member's calendar — the contended resource. The write
/// lock around a calendar is what serializes check-then-book.
#[derive(Debug, Clone)]
pub struct StaffCalendar {
    pub id: Ulid,
    pub salon_id: Ulid,
    pub name: String,
    /// Sorted by `span.start`.
    pub appointments: Vec<Appointment>,
    pub services: Vec<AppointmentService>,
    pub blocks: Vec<BlockedTime>,
    pub time_off: Vec<TimeOffRequest>,
}

impl StaffCalendar {
    pub fn new(id: Ulid, salon_id: Ulid, name: String) -> Self {
        Self {
            id,
            salon_id,
            name,
            appointments: Vec::new(),
            services: Vec::new(),
            blocks: Vec::new(),
            time_off: Vec::new(),
        }
    }

    /// Insert keeping sort order by span.start.
    pub fn insert_appointment(&mut self, appt: Appointment) {
        let pos = self
            .appointments
            .binary_search_by_key(&appt.span.start, |a| a.span.start)
            .unwrap_or_else(|e| e);
        self.appointments.insert(pos, appt);
    }

    pub fn remove_appointment(&mut self, id: Ulid) -> Option<Appointment> {
        let pos = self.appointments.iter().position(|a| a.id == id)?;
        // Drop attachments with the parent.
        self.services.retain(|s| s.appointment_id != id);
        Some(self.appointments.remove(pos))
    }

    pub fn appointment(&self, id: Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == id)
    }

    pub fn appointment_mut(&mut self, id: Ulid) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == id)
    }

    /// Appointments whose span overlaps the query window. Binary search
    /// skips everything starting at or after `query.end`.
    pub fn overlapping_appointments(&self, query: &Span) -> impl Iterator<Item = &Appointment> {
        let right = self
            .appointments
            .partition_point(|a| a.span.start < query.end);
        self.appointments[..right]
            .iter()
            .filter(move |a| a.span.end > query.start)
    }

    pub fn time_off_request(&self, id: Ulid) -> Option<&TimeOffRequest> {
        self.time_off.iter().find(|r| r.id == id)
    }

    pub fn time_off_request_mut(&mut self, id: Ulid) -> Option<&mut TimeOffRequest> {
        self.time_off.iter_mut().find(|r| r.id == id)
    }
}

// ── WAL events ───────────────────────────────────────────────────

/// The WAL record format — flat, no nesting. Transition events carry
/// the acting identity and timestamp, so the log doubles as the audit
/// trail the workflow requires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    SalonCreated {
        id: Ulid,
        owner_id: Ulid,
        name: String,
    },
    SalonUpdated {
        id: Ulid,
        name: String,
        is_active: bool,
    },
    StaffAdded {
        id: Ulid,
        salon_id: Ulid,
        name: String,
    },
    ServiceAdded {
        id: Ulid,
        salon_id: Ulid,
        name: String,
        duration_min: Option<u32>,
        price_cents: i64,
    },
    AppointmentBooked {
        id: Ulid,
        salon_id: Ulid,
        staff_id: Ulid,
        customer_id: Ulid,
        span: Span,
        code: String,
        notes: Option<String>,
        by: Ulid,
        at: Ms,
    },
    ServiceAttached {
        id: Ulid,
        appointment_id: Ulid,
        staff_id: Ulid,
        service_id: Ulid,
        span: Span,
    },
    /// Compensating delete: the attachment write failed after the
    /// appointment committed, so replay must not resurrect it. Carries
    /// the code so the uniqueness index releases it too.
    AppointmentRolledBack {
        id: Ulid,
        staff_id: Ulid,
        code: String,
    },
    AppointmentStatusChanged {
        id: Ulid,
        staff_id: Ulid,
        status: AppointmentStatus,
        by: Ulid,
        at: Ms,
    },
    BlockAdded {
        id: Ulid,
        salon_id: Ulid,
        staff_id: Option<Ulid>,
        kind: BlockKind,
        span: Span,
        reason: Option<String>,
        recurring: bool,
        pattern: Option<String>,
        by: Ulid,
        at: Ms,
    },
    BlockUpdated {
        id: Ulid,
        salon_id: Ulid,
        staff_id: Option<Ulid>,
        kind: BlockKind,
        span: Span,
        reason: Option<String>,
        recurring: bool,
        pattern: Option<String>,
        by: Ulid,
        at: Ms,
    },
    BlockRemoved {
        id: Ulid,
        salon_id: Ulid,
        staff_id: Option<Ulid>,
        by: Ulid,
        at: Ms,
    },
    TimeOffRequested {
        id: Ulid,
        salon_id: Ulid,
        staff_id: Ulid,
        kind: TimeOffKind,
        span: Span,
        reason: String,
        notes: Option<String>,
        at: Ms,
    },
    TimeOffApproved {
        id: Ulid,
        staff_id: Ulid,
        reviewer: Ulid,
        notes: Option<String>,
        at: Ms,
    },
    TimeOffRejected {
        id: Ulid,
        staff_id: Ulid,
        reviewer: Ulid,
        reason: String,
        at: Ms,
    },
    TimeOffCancelled {
        id: Ulid,
        staff_id: Ulid,
        reason: String,
        at: Ms,
    },
    HoursUpserted {
        salon_id: Ulid,
        day: Weekday,
        open_min: u16,
        close_min: u16,
        closed: bool,
    },
}

/// Which aggregate an event mutates. Salon/staff creation events are
/// handled at the map level and return `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOwner {
    Salon(Ulid),
    Staff(Ulid),
}

pub fn event_owner(event: &Event) -> Option<EventOwner> {
    match event {
        Event::SalonCreated { .. } | Event::StaffAdded { .. } => None,
        Event::SalonUpdated { id, .. } => Some(EventOwner::Salon(*id)),
        Event::ServiceAdded { salon_id, .. } | Event::HoursUpserted { salon_id, .. } => {
            Some(EventOwner::Salon(*salon_id))
        }
        Event::BlockAdded { salon_id, staff_id, .. }
        | Event::BlockUpdated { salon_id, staff_id, .. }
        | Event::BlockRemoved { salon_id, staff_id, .. } => match staff_id {
            Some(sid) => Some(EventOwner::Staff(*sid)),
            None => Some(EventOwner::Salon(*salon_id)),
        },
        Event::AppointmentBooked { staff_id, .. }
        | Event::ServiceAttached { staff_id, .. }
        | Event::AppointmentRolledBack { staff_id, .. }
        | Event::AppointmentStatusChanged { staff_id, .. }
        | Event::TimeOffRequested { staff_id, .. }
        | Event::TimeOffApproved { staff_id, .. }
        | Event::TimeOffRejected { staff_id, .. }
        | Event::TimeOffCancelled { staff_id, .. } => Some(EventOwner::Staff(*staff_id)),
    }
}

// ── Query views ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SalonInfo {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub name: String,
    pub is_active: bool,
    pub staff_count: usize,
    pub service_count: usize,
}
