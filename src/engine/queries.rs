use ulid::Ulid;

use crate::limits::MAX_QUERY_WINDOW_MS;
use crate::model::*;

use super::{free_windows, Engine, EngineError};

/// Read side. Queries take the same salon→staff lock order as
/// mutations, with read guards.
impl Engine {
    pub async fn get_salon(&self, id: Ulid) -> Option<SalonInfo> {
        let salon = self.salon(&id)?;
        let guard = salon.read().await;
        Some(salon_info(&guard))
    }

    pub async fn list_salons(&self) -> Vec<SalonInfo> {
        let handles: Vec<_> = self.salons.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(handles.len());
        for s in handles {
            out.push(salon_info(&*s.read().await));
        }
        out
    }

    pub async fn get_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        let Some(EventOwner::Staff(staff_id)) = self.owner_of(&id) else {
            return Err(EngineError::AppointmentNotFound(id));
        };
        let cal = self
            .calendar(&staff_id)
            .ok_or(EngineError::AppointmentNotFound(id))?;
        let guard = cal.read().await;
        guard
            .appointment(id)
            .cloned()
            .ok_or(EngineError::AppointmentNotFound(id))
    }

    /// Customer-facing lookup by confirmation code.
    pub async fn find_appointment_by_code(&self, code: &str) -> Option<Appointment> {
        if !crate::code::is_well_formed(code) {
            return None;
        }
        let id = *self.codes.get(code)?;
        self.get_appointment(id).await.ok()
    }

    pub async fn list_appointments(
        &self,
        staff_id: Ulid,
        window: Option<Span>,
    ) -> Result<Vec<Appointment>, EngineError> {
        let cal = self
            .calendar(&staff_id)
            .ok_or(EngineError::StaffNotFound(staff_id))?;
        let guard = cal.read().await;
        Ok(match window {
            Some(w) => guard.overlapping_appointments(&w).cloned().collect(),
            None => guard.appointments.clone(),
        })
    }

    pub async fn list_salon_blocks(&self, salon_id: Ulid) -> Result<Vec<BlockedTime>, EngineError> {
        let salon = self
            .salon(&salon_id)
            .ok_or(EngineError::SalonNotFound(salon_id))?;
        Ok(salon.read().await.blocks.clone())
    }

    pub async fn list_staff_blocks(&self, staff_id: Ulid) -> Result<Vec<BlockedTime>, EngineError> {
        let cal = self
            .calendar(&staff_id)
            .ok_or(EngineError::StaffNotFound(staff_id))?;
        Ok(cal.read().await.blocks.clone())
    }

    pub async fn list_time_off(&self, staff_id: Ulid) -> Result<Vec<TimeOffRequest>, EngineError> {
        let cal = self
            .calendar(&staff_id)
            .ok_or(EngineError::StaffNotFound(staff_id))?;
        Ok(cal.read().await.time_off.clone())
    }

    pub async fn get_operating_hours(
        &self,
        salon_id: Ulid,
    ) -> Result<Vec<OperatingHours>, EngineError> {
        let salon = self
            .salon(&salon_id)
            .ok_or(EngineError::SalonNotFound(salon_id))?;
        let guard = salon.read().await;
        Ok(guard.hours.iter().flatten().copied().collect())
    }

    /// Windows in which a booking for this staff member would be
    /// accepted: operating hours minus blocks, approved time-off, and
    /// slot-holding appointments.
    pub async fn staff_availability(
        &self,
        staff_id: Ulid,
        query: Span,
        min_duration_ms: Option<Ms>,
    ) -> Result<Vec<Span>, EngineError> {
        if query.end - query.start > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let cal = self
            .calendar(&staff_id)
            .ok_or(EngineError::StaffNotFound(staff_id))?;
        // salon_id is immutable; read it without the lock, then take
        // salon before calendar like every other operation.
        let salon_id = cal.read().await.salon_id;
        let salon = self
            .salon(&salon_id)
            .ok_or(EngineError::SalonNotFound(salon_id))?;
        let salon_guard = salon.read().await;
        let cal_guard = cal.read().await;

        let mut free = free_windows(&salon_guard, &cal_guard, &query);
        if let Some(min) = min_duration_ms {
            free.retain(|s| s.duration_ms() >= min);
        }
        Ok(free)
    }
}

fn salon_info(s: &SalonState) -> SalonInfo {
    SalonInfo {
        id: s.id,
        owner_id: s.owner_id,
        name: s.name.clone(),
        is_active: s.is_active,
        staff_count: s.staff.len(),
        service_count: s.services.len(),
    }
}
