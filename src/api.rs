//! Outer boundary of the core. Call sites hand in raw strings (ids,
//! dates, form fields); this module parses them, runs the
//! authorization interceptor, dispatches to the engine, and converts
//! every outcome into a structured, user-safe result. Nothing here
//! panics and no internal error detail crosses the boundary.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::authz::Actor;
use crate::engine::{
    BlockRequest, BlockUpdate, BookingRequest, Engine, EngineError, TimeOffRequestInput,
};
use crate::model::*;

/// `{ data } | { error }` result for data-returning operations.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ActionResult<T: Serialize> {
    Data { data: T },
    Error { error: String },
}

impl<T: Serialize> ActionResult<T> {
    pub fn data(&self) -> Option<&T> {
        match self {
            ActionResult::Data { data } => Some(data),
            ActionResult::Error { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            ActionResult::Data { .. } => None,
            ActionResult::Error { error } => Some(error),
        }
    }
}

/// Result shape for form-driven actions: a message on success, a
/// top-level error or a field-keyed error map on failure.
#[derive(Debug, Default, Serialize)]
pub struct FormOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<HashMap<String, String>>,
    pub success: bool,
}

impl FormOutcome {
    fn ok(message: &str) -> Self {
        Self {
            message: Some(message.to_string()),
            success: true,
            ..Self::default()
        }
    }

    fn fail(error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    fn invalid(errors: HashMap<String, String>) -> Self {
        Self {
            errors: Some(errors),
            ..Self::default()
        }
    }
}

// ── Inputs ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingInput {
    pub salon_id: String,
    pub service_id: String,
    pub staff_id: String,
    /// ISO date, `YYYY-MM-DD`.
    pub date: String,
    /// `HH:MM`, 24-hour.
    pub time: String,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockInput {
    pub salon_id: String,
    #[serde(default)]
    pub staff_id: Option<String>,
    pub block_type: String,
    /// `YYYY-MM-DDTHH:MM`.
    pub start_at: String,
    pub end_at: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub recurring: bool,
    #[serde(default)]
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeOffForm {
    pub salon_id: String,
    pub staff_id: String,
    pub request_type: String,
    pub start_at: String,
    pub end_at: String,
    pub reason: String,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewForm {
    pub request_id: String,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReasonForm {
    pub request_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoursInput {
    /// Named weekday, e.g. `"tuesday"`.
    pub day: String,
    pub open: String,
    pub close: String,
    #[serde(default)]
    pub closed: bool,
}

// ── Facade ───────────────────────────────────────────────────────

pub struct Api {
    engine: Arc<Engine>,
}

impl Api {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub async fn create_booking(
        &self,
        actor: &Actor,
        input: &BookingInput,
    ) -> ActionResult<Appointment> {
        let mut errors = HashMap::new();
        let salon_id = parse_ulid("salonId", &input.salon_id, &mut errors);
        let service_id = parse_ulid("serviceId", &input.service_id, &mut errors);
        let staff_id = parse_ulid("staffId", &input.staff_id, &mut errors);
        let start = parse_date_and_time(&input.date, &input.time, &mut errors);
        if !errors.is_empty() {
            return ActionResult::Error {
                error: first_error(errors),
            };
        }

        let req = BookingRequest {
            salon_id: salon_id.unwrap(),
            staff_id: staff_id.unwrap(),
            service_id: service_id.unwrap(),
            customer_id: actor.id,
            start: start.unwrap(),
            notes: input.notes.clone(),
        };
        match self.engine.create_booking(actor, req).await {
            Ok(appt) => ActionResult::Data { data: appt },
            Err(e) => ActionResult::Error {
                error: user_message(&e),
            },
        }
    }

    /// Customer-facing lookup by confirmation code.
    pub async fn find_booking(&self, code: &str) -> ActionResult<Appointment> {
        match self.engine.find_appointment_by_code(code).await {
            Some(appt) => ActionResult::Data { data: appt },
            None => ActionResult::Error {
                error: "No booking found for that confirmation code".into(),
            },
        }
    }

    pub async fn create_blocked_time(
        &self,
        actor: &Actor,
        input: &BlockInput,
    ) -> ActionResult<BlockedTime> {
        let mut errors = HashMap::new();
        let salon_id = parse_ulid("salonId", &input.salon_id, &mut errors);
        let staff_id = match &input.staff_id {
            Some(s) => parse_ulid("staffId", s, &mut errors).map(Some),
            None => Some(None),
        };
        let kind = match BlockKind::parse(&input.block_type) {
            Some(k) => Some(k),
            None => {
                errors.insert("blockType".into(), "unknown block type".into());
                None
            }
        };
        let span = parse_span(&input.start_at, &input.end_at, &mut errors);
        if !errors.is_empty() {
            return ActionResult::Error {
                error: first_error(errors),
            };
        }

        let req = BlockRequest {
            salon_id: salon_id.unwrap(),
            staff_id: staff_id.unwrap(),
            kind: kind.unwrap(),
            span: span.unwrap(),
            reason: input.reason.clone(),
            recurring: input.recurring,
            pattern: input.pattern.clone(),
        };
        match self.engine.add_block(actor, req).await {
            Ok(block) => ActionResult::Data { data: block },
            Err(e) => ActionResult::Error {
                error: user_message(&e),
            },
        }
    }

    pub async fn update_blocked_time(
        &self,
        actor: &Actor,
        id: &str,
        input: &BlockInput,
    ) -> ActionResult<BlockedTime> {
        let mut errors = HashMap::new();
        let block_id = parse_ulid("id", id, &mut errors);
        let kind = match BlockKind::parse(&input.block_type) {
            Some(k) => Some(k),
            None => {
                errors.insert("blockType".into(), "unknown block type".into());
                None
            }
        };
        let span = parse_span(&input.start_at, &input.end_at, &mut errors);
        if !errors.is_empty() {
            return ActionResult::Error {
                error: first_error(errors),
            };
        }

        let update = BlockUpdate {
            kind: kind.unwrap(),
            span: span.unwrap(),
            reason: input.reason.clone(),
            recurring: input.recurring,
            pattern: input.pattern.clone(),
        };
        match self.engine.update_block(actor, block_id.unwrap(), update).await {
            Ok(block) => ActionResult::Data { data: block },
            Err(e) => ActionResult::Error {
                error: user_message(&e),
            },
        }
    }

    pub async fn delete_blocked_time(&self, actor: &Actor, id: &str) -> ActionResult<String> {
        let Ok(block_id) = id.parse::<Ulid>() else {
            return ActionResult::Error {
                error: "id: not a valid identifier".into(),
            };
        };
        match self.engine.remove_block(actor, block_id).await {
            Ok(removed) => ActionResult::Data {
                data: removed.to_string(),
            },
            Err(e) => ActionResult::Error {
                error: user_message(&e),
            },
        }
    }

    pub async fn create_time_off_request(&self, actor: &Actor, form: &TimeOffForm) -> FormOutcome {
        let mut errors = HashMap::new();
        let salon_id = parse_ulid("salonId", &form.salon_id, &mut errors);
        let staff_id = parse_ulid("staffId", &form.staff_id, &mut errors);
        let kind = match TimeOffKind::parse(&form.request_type) {
            Some(k) => Some(k),
            None => {
                errors.insert("requestType".into(), "unknown request type".into());
                None
            }
        };
        let span = parse_span(&form.start_at, &form.end_at, &mut errors);
        if !errors.is_empty() {
            return FormOutcome::invalid(errors);
        }

        let input = TimeOffRequestInput {
            salon_id: salon_id.unwrap(),
            staff_id: staff_id.unwrap(),
            kind: kind.unwrap(),
            span: span.unwrap(),
            reason: form.reason.clone(),
            notes: form.notes.clone(),
        };
        match self.engine.create_time_off(actor, input).await {
            Ok(_) => FormOutcome::ok("Time-off request submitted"),
            Err(EngineError::Validation { field, message }) => {
                FormOutcome::invalid(HashMap::from([(field.to_string(), message.to_string())]))
            }
            Err(e) => FormOutcome::fail(user_message(&e)),
        }
    }

    pub async fn approve_time_off_request(&self, actor: &Actor, form: &ReviewForm) -> FormOutcome {
        let Ok(id) = form.request_id.parse::<Ulid>() else {
            return FormOutcome::invalid(bad_id("requestId"));
        };
        match self.engine.approve_time_off(actor, id, form.notes.clone()).await {
            Ok(()) => FormOutcome::ok("Time-off request approved"),
            Err(e) => FormOutcome::fail(user_message(&e)),
        }
    }

    pub async fn reject_time_off_request(&self, actor: &Actor, form: &ReasonForm) -> FormOutcome {
        let Ok(id) = form.request_id.parse::<Ulid>() else {
            return FormOutcome::invalid(bad_id("requestId"));
        };
        match self.engine.reject_time_off(actor, id, form.reason.clone()).await {
            Ok(()) => FormOutcome::ok("Time-off request rejected"),
            Err(EngineError::Validation { field, message }) => {
                FormOutcome::invalid(HashMap::from([(field.to_string(), message.to_string())]))
            }
            Err(e) => FormOutcome::fail(user_message(&e)),
        }
    }

    pub async fn cancel_time_off_request(&self, actor: &Actor, form: &ReasonForm) -> FormOutcome {
        let Ok(id) = form.request_id.parse::<Ulid>() else {
            return FormOutcome::invalid(bad_id("requestId"));
        };
        match self.engine.cancel_time_off(actor, id, form.reason.clone()).await {
            Ok(()) => FormOutcome::ok("Time-off request cancelled"),
            Err(EngineError::Validation { field, message }) => {
                FormOutcome::invalid(HashMap::from([(field.to_string(), message.to_string())]))
            }
            Err(e) => FormOutcome::fail(user_message(&e)),
        }
    }

    pub async fn upsert_operating_hours(
        &self,
        actor: &Actor,
        salon_id: &str,
        input: &HoursInput,
    ) -> FormOutcome {
        let mut errors = HashMap::new();
        let salon_id = parse_ulid("salonId", salon_id, &mut errors);
        let hours = parse_hours(input, &mut errors);
        if !errors.is_empty() {
            return FormOutcome::invalid(errors);
        }
        match self
            .engine
            .upsert_hours(actor, salon_id.unwrap(), hours.unwrap())
            .await
        {
            Ok(()) => FormOutcome::ok("Operating hours saved"),
            Err(EngineError::Validation { field, message }) => {
                FormOutcome::invalid(HashMap::from([(field.to_string(), message.to_string())]))
            }
            Err(e) => FormOutcome::fail(user_message(&e)),
        }
    }

    /// Bulk per-day update. Short-circuits on the first bad day; days
    /// already applied stay applied.
    pub async fn bulk_update_operating_hours(
        &self,
        actor: &Actor,
        salon_id: &str,
        entries: &[HoursInput],
    ) -> FormOutcome {
        let mut errors = HashMap::new();
        let salon_id = parse_ulid("salonId", salon_id, &mut errors);
        let mut parsed = Vec::with_capacity(entries.len());
        for input in entries {
            if let Some(h) = parse_hours(input, &mut errors) {
                parsed.push(h);
            }
        }
        if !errors.is_empty() {
            return FormOutcome::invalid(errors);
        }
        match self
            .engine
            .bulk_update_hours(actor, salon_id.unwrap(), parsed)
            .await
        {
            Ok(()) => FormOutcome::ok("Operating hours saved"),
            Err(EngineError::Validation { field, message }) => {
                FormOutcome::invalid(HashMap::from([(field.to_string(), message.to_string())]))
            }
            Err(e) => FormOutcome::fail(user_message(&e)),
        }
    }
}

// ── Parsing helpers ──────────────────────────────────────────────

fn parse_ulid(field: &str, raw: &str, errors: &mut HashMap<String, String>) -> Option<Ulid> {
    match raw.parse::<Ulid>() {
        Ok(id) => Some(id),
        Err(_) => {
            errors.insert(field.to_string(), "not a valid identifier".into());
            None
        }
    }
}

fn parse_date_and_time(
    date: &str,
    time: &str,
    errors: &mut HashMap<String, String>,
) -> Option<Ms> {
    let d = match NaiveDate::parse_from_str(date, "%Y-%m-%d") {
        Ok(d) => Some(d),
        Err(_) => {
            errors.insert("date".into(), "expected YYYY-MM-DD".into());
            None
        }
    };
    let t = match NaiveTime::parse_from_str(time, "%H:%M") {
        Ok(t) => Some(t),
        Err(_) => {
            errors.insert("time".into(), "expected HH:MM".into());
            None
        }
    };
    Some(d?.and_time(t?).and_utc().timestamp_millis())
}

fn parse_datetime(field: &str, raw: &str, errors: &mut HashMap<String, String>) -> Option<Ms> {
    match chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M") {
        Ok(dt) => Some(dt.and_utc().timestamp_millis()),
        Err(_) => {
            errors.insert(field.to_string(), "expected YYYY-MM-DDTHH:MM".into());
            None
        }
    }
}

fn parse_span(start: &str, end: &str, errors: &mut HashMap<String, String>) -> Option<Span> {
    let s = parse_datetime("startAt", start, errors);
    let e = parse_datetime("endAt", end, errors);
    let (s, e) = (s?, e?);
    if e <= s {
        errors.insert("endAt".into(), "must be after start".into());
        return None;
    }
    Some(Span::new(s, e))
}

fn parse_hours(input: &HoursInput, errors: &mut HashMap<String, String>) -> Option<OperatingHours> {
    let day = match Weekday::parse(&input.day) {
        Some(d) => Some(d),
        None => {
            errors.insert("day".into(), "unknown day of week".into());
            None
        }
    };
    let open = parse_minutes("open", &input.open, errors);
    let close = parse_minutes("close", &input.close, errors);
    Some(OperatingHours {
        day: day?,
        open_min: open?,
        close_min: close?,
        closed: input.closed,
    })
}

fn parse_minutes(field: &str, raw: &str, errors: &mut HashMap<String, String>) -> Option<u16> {
    match NaiveTime::parse_from_str(raw, "%H:%M") {
        Ok(t) => {
            use chrono::Timelike;
            Some((t.hour() * 60 + t.minute()) as u16)
        }
        Err(_) => {
            errors.insert(field.to_string(), "expected HH:MM".into());
            None
        }
    }
}

fn first_error(errors: HashMap<String, String>) -> String {
    let mut entries: Vec<_> = errors.into_iter().collect();
    entries.sort();
    match entries.into_iter().next() {
        Some((field, msg)) => format!("{field}: {msg}"),
        None => "invalid input".into(),
    }
}

fn bad_id(field: &str) -> HashMap<String, String> {
    HashMap::from([(field.to_string(), "not a valid identifier".into())])
}

/// Map engine errors to user-safe text. Expected business outcomes keep
/// their specific message; infrastructure failures collapse to a
/// generic one and the detail stays in the log.
fn user_message(e: &EngineError) -> String {
    match e {
        EngineError::Unauthorized => "Unauthorized".into(),
        EngineError::WalError(_) | EngineError::LimitExceeded(_) => {
            tracing::error!("operation failed: {e}");
            "Something went wrong. Please try again.".into()
        }
        EngineError::AttachmentFailed(_) => {
            tracing::error!("booking attachment failed: {e}");
            "The booking could not be completed and was not created. Please try again.".into()
        }
        other => {
            // Conflicts are routine; anything else is worth a trace.
            if !other.is_conflict() {
                tracing::debug!("operation rejected: {other}");
            }
            other.to_string()
        }
    }
}
