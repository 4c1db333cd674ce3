mod availability;
mod blocked;
mod booking;
mod conflict;
mod directory;
mod error;
mod hours;
mod queries;
#[cfg(test)]
mod tests;
mod timeoff;

pub use availability::{free_windows, merge_overlapping, subtract_intervals};
pub use blocked::{BlockRequest, BlockUpdate};
pub use booking::BookingRequest;
pub use error::EngineError;
pub use timeoff::TimeOffRequestInput;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::invalidate::InvalidationHub;
use crate::model::*;
use crate::observability;
use crate::wal::Wal;

pub type SharedSalon = Arc<RwLock<SalonState>>;
pub type SharedCalendar = Arc<RwLock<StaffCalendar>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        ack: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        ack: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        ack: oneshot::Sender<u64>,
    },
}

/// Background task owning the WAL. Appends are batched: the first
/// append blocks, every append already queued behind it joins the same
/// fsync, and all senders are acked together.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, ack } = cmd else {
            handle_control(&mut wal, cmd);
            continue;
        };

        let mut batch = vec![(event, ack)];
        let mut deferred_control = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, ack } => batch.push((event, ack)),
                // Control commands wait until the current batch is durable.
                other => {
                    deferred_control = Some(other);
                    break;
                }
            }
        }

        flush_and_ack(&mut wal, batch);
        if let Some(cmd) = deferred_control {
            handle_control(&mut wal, cmd);
        }
    }
}

fn flush_and_ack(wal: &mut Wal, batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result: io::Result<()> = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after an append error so half-buffered bytes don't
    // leak into the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, ack) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = ack.send(r);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, ack } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = ack.send(result);
        }
        WalCommand::AppendsSinceCompact { ack } => {
            let _ = ack.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

// ── Event application ────────────────────────────────────

/// Apply a salon-owned event. Caller holds the salon write lock.
fn apply_to_salon(s: &mut SalonState, event: &Event) {
    match event {
        Event::SalonUpdated { name, is_active, .. } => {
            s.name = name.clone();
            s.is_active = *is_active;
        }
        Event::ServiceAdded {
            id,
            name,
            duration_min,
            price_cents,
            ..
        } => {
            s.services.insert(
                *id,
                ServiceInfo {
                    id: *id,
                    name: name.clone(),
                    duration_min: *duration_min,
                    price_cents: *price_cents,
                },
            );
        }
        Event::HoursUpserted {
            day,
            open_min,
            close_min,
            closed,
            ..
        } => {
            s.hours[day.index()] = Some(OperatingHours {
                day: *day,
                open_min: *open_min,
                close_min: *close_min,
                closed: *closed,
            });
        }
        Event::BlockAdded {
            id,
            salon_id,
            staff_id: None,
            kind,
            span,
            reason,
            recurring,
            pattern,
            ..
        } => {
            s.blocks.push(BlockedTime {
                id: *id,
                salon_id: *salon_id,
                staff_id: None,
                kind: *kind,
                span: *span,
                reason: reason.clone(),
                recurring: *recurring,
                pattern: pattern.clone(),
            });
        }
        Event::BlockUpdated {
            id,
            kind,
            span,
            reason,
            recurring,
            pattern,
            ..
        } => {
            if let Some(b) = s.blocks.iter_mut().find(|b| b.id == *id) {
                b.kind = *kind;
                b.span = *span;
                b.reason = reason.clone();
                b.recurring = *recurring;
                b.pattern = pattern.clone();
            }
        }
        Event::BlockRemoved { id, .. } => {
            s.blocks.retain(|b| b.id != *id);
        }
        _ => {}
    }
}

/// Apply a staff-owned event. Caller holds the calendar write lock.
fn apply_to_calendar(c: &mut StaffCalendar, event: &Event) {
    match event {
        Event::AppointmentBooked {
            id,
            salon_id,
            staff_id,
            customer_id,
            span,
            code,
            notes,
            by,
            at,
        } => {
            c.insert_appointment(Appointment {
                id: *id,
                salon_id: *salon_id,
                customer_id: *customer_id,
                staff_id: *staff_id,
                span: *span,
                status: AppointmentStatus::Pending,
                code: code.clone(),
                notes: notes.clone(),
                created_by: *by,
                created_at: *at,
                updated_by: *by,
                updated_at: *at,
            });
        }
        Event::ServiceAttached {
            id,
            appointment_id,
            staff_id,
            service_id,
            span,
        } => {
            c.services.push(AppointmentService {
                id: *id,
                appointment_id: *appointment_id,
                service_id: *service_id,
                staff_id: *staff_id,
                span: *span,
            });
        }
        Event::AppointmentRolledBack { id, .. } => {
            c.remove_appointment(*id);
        }
        Event::AppointmentStatusChanged {
            id, status, by, at, ..
        } => {
            if let Some(a) = c.appointment_mut(*id) {
                a.status = *status;
                a.updated_by = *by;
                a.updated_at = *at;
            }
        }
        Event::BlockAdded {
            id,
            salon_id,
            staff_id: Some(_),
            kind,
            span,
            reason,
            recurring,
            pattern,
            ..
        } => {
            c.blocks.push(BlockedTime {
                id: *id,
                salon_id: *salon_id,
                staff_id: Some(c.id),
                kind: *kind,
                span: *span,
                reason: reason.clone(),
                recurring: *recurring,
                pattern: pattern.clone(),
            });
        }
        Event::BlockUpdated {
            id,
            kind,
            span,
            reason,
            recurring,
            pattern,
            ..
        } => {
            if let Some(b) = c.blocks.iter_mut().find(|b| b.id == *id) {
                b.kind = *kind;
                b.span = *span;
                b.reason = reason.clone();
                b.recurring = *recurring;
                b.pattern = pattern.clone();
            }
        }
        Event::BlockRemoved { id, .. } => {
            c.blocks.retain(|b| b.id != *id);
        }
        Event::TimeOffRequested {
            id,
            salon_id,
            staff_id,
            kind,
            span,
            reason,
            notes,
            at,
        } => {
            c.time_off.push(TimeOffRequest {
                id: *id,
                salon_id: *salon_id,
                staff_id: *staff_id,
                kind: *kind,
                span: *span,
                reason: reason.clone(),
                notes: notes.clone(),
                status: TimeOffStatus::Pending,
                requested_at: *at,
                reviewed_by: None,
                reviewed_at: None,
                review_notes: None,
            });
        }
        Event::TimeOffApproved {
            id,
            reviewer,
            notes,
            at,
            ..
        } => {
            if let Some(r) = c.time_off_request_mut(*id) {
                r.status = TimeOffStatus::Approved;
                r.reviewed_by = Some(*reviewer);
                r.reviewed_at = Some(*at);
                r.review_notes = notes.clone();
            }
        }
        Event::TimeOffRejected {
            id,
            reviewer,
            reason,
            at,
            ..
        } => {
            if let Some(r) = c.time_off_request_mut(*id) {
                r.status = TimeOffStatus::Rejected;
                r.reviewed_by = Some(*reviewer);
                r.reviewed_at = Some(*at);
                r.review_notes = Some(reason.clone());
            }
        }
        Event::TimeOffCancelled { id, reason, .. } => {
            if let Some(r) = c.time_off_request_mut(*id) {
                r.status = TimeOffStatus::Cancelled;
                // Requester's stated reason; reviewer fields stay as the
                // last review left them.
                r.review_notes = Some(reason.clone());
            }
        }
        _ => {}
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub(crate) salons: DashMap<Ulid, SharedSalon>,
    pub(crate) calendars: DashMap<Ulid, SharedCalendar>,
    /// Confirmation code → appointment. Acts as the uniqueness
    /// constraint on codes; booking retries generation on collision.
    pub(crate) codes: DashMap<String, Ulid>,
    /// Appointment/block/time-off id → owning aggregate.
    pub(crate) entities: DashMap<Ulid, EventOwner>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub invalidations: Arc<InvalidationHub>,
    /// Forces the next service-attachment append to fail, to exercise
    /// the compensating rollback path.
    #[cfg(test)]
    pub(crate) fail_next_attach: std::sync::atomic::AtomicBool,
}

impl Engine {
    pub fn new(wal_path: PathBuf, invalidations: Arc<InvalidationHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            salons: DashMap::new(),
            calendars: DashMap::new(),
            codes: DashMap::new(),
            entities: DashMap::new(),
            wal_tx,
            invalidations,
            #[cfg(test)]
            fail_next_attach: std::sync::atomic::AtomicBool::new(false),
        };

        // Replay. The engine is the sole owner of every Arc here, so
        // try_write always succeeds; never block inside a possibly-async
        // caller.
        for event in &events {
            match event {
                Event::SalonCreated { id, owner_id, name } => {
                    let state = SalonState::new(*id, *owner_id, name.clone());
                    engine.salons.insert(*id, Arc::new(RwLock::new(state)));
                }
                Event::StaffAdded { id, salon_id, name } => {
                    if let Some(entry) = engine.salons.get(salon_id) {
                        let mut guard =
                            entry.try_write().expect("replay: uncontended salon write");
                        guard.staff.push(*id);
                    }
                    let cal = StaffCalendar::new(*id, *salon_id, name.clone());
                    engine.calendars.insert(*id, Arc::new(RwLock::new(cal)));
                }
                other => match event_owner(other) {
                    Some(EventOwner::Salon(sid)) => {
                        if let Some(entry) = engine.salons.get(&sid) {
                            let mut guard =
                                entry.try_write().expect("replay: uncontended salon write");
                            apply_to_salon(&mut guard, other);
                        }
                        engine.index_event(other);
                    }
                    Some(EventOwner::Staff(sid)) => {
                        if let Some(entry) = engine.calendars.get(&sid) {
                            let mut guard =
                                entry.try_write().expect("replay: uncontended calendar write");
                            apply_to_calendar(&mut guard, other);
                        }
                        engine.index_event(other);
                    }
                    None => {}
                },
            }
        }
        metrics::gauge!(observability::SALONS_ACTIVE).set(engine.salons.len() as f64);

        Ok(engine)
    }

    /// Write one event through the group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                ack: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped ack".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Keep the code and entity indexes in step with an applied event.
    fn index_event(&self, event: &Event) {
        match event {
            Event::AppointmentBooked {
                id, staff_id, code, ..
            } => {
                self.entities.insert(*id, EventOwner::Staff(*staff_id));
                self.codes.insert(code.clone(), *id);
            }
            Event::AppointmentRolledBack { id, code, .. } => {
                self.entities.remove(id);
                self.codes.remove(code);
            }
            Event::BlockAdded {
                id,
                salon_id,
                staff_id,
                ..
            } => {
                let owner = match staff_id {
                    Some(sid) => EventOwner::Staff(*sid),
                    None => EventOwner::Salon(*salon_id),
                };
                self.entities.insert(*id, owner);
            }
            Event::BlockRemoved { id, .. } => {
                self.entities.remove(id);
            }
            Event::TimeOffRequested { id, staff_id, .. } => {
                self.entities.insert(*id, EventOwner::Staff(*staff_id));
            }
            _ => {}
        }
    }

    /// WAL-append + apply + index + invalidate for a salon-owned event.
    pub(super) async fn persist_apply_salon(
        &self,
        guard: &mut SalonState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_salon(guard, event);
        self.index_event(event);
        self.invalidations.publish(guard.id, event);
        Ok(())
    }

    /// WAL-append + apply + index + invalidate for a staff-owned event.
    pub(super) async fn persist_apply_staff(
        &self,
        guard: &mut StaffCalendar,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_calendar(guard, event);
        self.index_event(event);
        self.invalidations.publish(guard.salon_id, event);
        Ok(())
    }

    pub fn salon(&self, id: &Ulid) -> Option<SharedSalon> {
        self.salons.get(id).map(|e| e.value().clone())
    }

    pub fn calendar(&self, id: &Ulid) -> Option<SharedCalendar> {
        self.calendars.get(id).map(|e| e.value().clone())
    }

    pub(super) fn owner_of(&self, entity_id: &Ulid) -> Option<EventOwner> {
        self.entities.get(entity_id).map(|e| *e.value())
    }

    /// Rewrite the WAL with the minimal event set recreating current
    /// state. Audit history before the compaction point survives only
    /// in external log storage.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        let salon_ids: Vec<Ulid> = self.salons.iter().map(|e| *e.key()).collect();
        for sid in salon_ids {
            let Some(s) = self.salon(&sid) else { continue };
            let guard = s.read().await;
            events.push(Event::SalonCreated {
                id: guard.id,
                owner_id: guard.owner_id,
                name: guard.name.clone(),
            });
            if !guard.is_active {
                events.push(Event::SalonUpdated {
                    id: guard.id,
                    name: guard.name.clone(),
                    is_active: false,
                });
            }
            for svc in guard.services.values() {
                events.push(Event::ServiceAdded {
                    id: svc.id,
                    salon_id: guard.id,
                    name: svc.name.clone(),
                    duration_min: svc.duration_min,
                    price_cents: svc.price_cents,
                });
            }
            for h in guard.hours.iter().flatten() {
                events.push(Event::HoursUpserted {
                    salon_id: guard.id,
                    day: h.day,
                    open_min: h.open_min,
                    close_min: h.close_min,
                    closed: h.closed,
                });
            }
            for b in &guard.blocks {
                events.push(block_added_event(b, guard.owner_id));
            }

            for staff_id in &guard.staff {
                let Some(c) = self.calendar(staff_id) else { continue };
                let cal = c.read().await;
                events.push(Event::StaffAdded {
                    id: cal.id,
                    salon_id: guard.id,
                    name: cal.name.clone(),
                });
                for b in &cal.blocks {
                    events.push(block_added_event(b, guard.owner_id));
                }
                for a in &cal.appointments {
                    events.push(Event::AppointmentBooked {
                        id: a.id,
                        salon_id: a.salon_id,
                        staff_id: a.staff_id,
                        customer_id: a.customer_id,
                        span: a.span,
                        code: a.code.clone(),
                        notes: a.notes.clone(),
                        by: a.created_by,
                        at: a.created_at,
                    });
                    if a.status != AppointmentStatus::Pending {
                        events.push(Event::AppointmentStatusChanged {
                            id: a.id,
                            staff_id: a.staff_id,
                            status: a.status,
                            by: a.updated_by,
                            at: a.updated_at,
                        });
                    }
                }
                for svc in &cal.services {
                    events.push(Event::ServiceAttached {
                        id: svc.id,
                        appointment_id: svc.appointment_id,
                        staff_id: svc.staff_id,
                        service_id: svc.service_id,
                        span: svc.span,
                    });
                }
                for r in &cal.time_off {
                    events.push(Event::TimeOffRequested {
                        id: r.id,
                        salon_id: r.salon_id,
                        staff_id: r.staff_id,
                        kind: r.kind,
                        span: r.span,
                        reason: r.reason.clone(),
                        notes: r.notes.clone(),
                        at: r.requested_at,
                    });
                    match r.status {
                        TimeOffStatus::Pending => {}
                        TimeOffStatus::Approved => events.push(Event::TimeOffApproved {
                            id: r.id,
                            staff_id: r.staff_id,
                            reviewer: r.reviewed_by.unwrap_or_default(),
                            notes: r.review_notes.clone(),
                            at: r.reviewed_at.unwrap_or(0),
                        }),
                        TimeOffStatus::Rejected => events.push(Event::TimeOffRejected {
                            id: r.id,
                            staff_id: r.staff_id,
                            reviewer: r.reviewed_by.unwrap_or_default(),
                            reason: r.review_notes.clone().unwrap_or_default(),
                            at: r.reviewed_at.unwrap_or(0),
                        }),
                        TimeOffStatus::Cancelled => events.push(Event::TimeOffCancelled {
                            id: r.id,
                            staff_id: r.staff_id,
                            reason: r.review_notes.clone().unwrap_or_default(),
                            at: r.reviewed_at.unwrap_or(0),
                        }),
                    }
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, ack: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped ack".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { ack: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn block_added_event(b: &BlockedTime, by: Ulid) -> Event {
    Event::BlockAdded {
        id: b.id,
        salon_id: b.salon_id,
        staff_id: b.staff_id,
        kind: b.kind,
        span: b.span,
        reason: b.reason.clone(),
        recurring: b.recurring,
        pattern: b.pattern.clone(),
        by,
        at: 0,
    }
}
