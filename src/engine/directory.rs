use std::sync::Arc;

use tokio::sync::RwLock;
use ulid::Ulid;

use crate::authz::{self, Actor, Role};
use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::{Engine, EngineError};

/// Salon directory management. The surrounding platform drives these
/// from CRUD screens; the engine carries them because bookings and
/// time-off validate against salon, staff, and service records.
impl Engine {
    pub async fn create_salon(
        &self,
        actor: &Actor,
        id: Ulid,
        name: String,
    ) -> Result<(), EngineError> {
        if actor.role != Role::Owner {
            return Err(EngineError::Unauthorized);
        }
        if self.salons.len() >= MAX_SALONS {
            return Err(EngineError::LimitExceeded("too many salons"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("salon name too long"));
        }
        if self.salons.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::SalonCreated {
            id,
            owner_id: actor.id,
            name: name.clone(),
        };
        self.wal_append(&event).await?;
        let state = SalonState::new(id, actor.id, name);
        self.salons.insert(id, Arc::new(RwLock::new(state)));
        metrics::gauge!(observability::SALONS_ACTIVE).set(self.salons.len() as f64);
        self.invalidations.publish(id, &event);
        Ok(())
    }

    pub async fn update_salon(
        &self,
        actor: &Actor,
        id: Ulid,
        name: String,
        is_active: bool,
    ) -> Result<(), EngineError> {
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("salon name too long"));
        }
        let Some(salon) = self.salon(&id) else {
            return Err(EngineError::Unauthorized);
        };
        let mut guard = salon.write().await;
        authz::require_owner(actor, &guard)?;

        let event = Event::SalonUpdated { id, name, is_active };
        self.persist_apply_salon(&mut guard, &event).await
    }

    pub async fn add_staff(
        &self,
        actor: &Actor,
        id: Ulid,
        salon_id: Ulid,
        name: String,
    ) -> Result<(), EngineError> {
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("staff name too long"));
        }
        if self.calendars.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let Some(salon) = self.salon(&salon_id) else {
            return Err(EngineError::Unauthorized);
        };
        let mut guard = salon.write().await;
        authz::require_owner(actor, &guard)?;
        if guard.staff.len() >= MAX_STAFF_PER_SALON {
            return Err(EngineError::LimitExceeded("too many staff members"));
        }

        let event = Event::StaffAdded {
            id,
            salon_id,
            name: name.clone(),
        };
        self.wal_append(&event).await?;
        guard.staff.push(id);
        let cal = StaffCalendar::new(id, salon_id, name);
        self.calendars.insert(id, Arc::new(RwLock::new(cal)));
        self.invalidations.publish(salon_id, &event);
        Ok(())
    }

    pub async fn add_service(
        &self,
        actor: &Actor,
        id: Ulid,
        salon_id: Ulid,
        name: String,
        duration_min: Option<u32>,
        price_cents: i64,
    ) -> Result<(), EngineError> {
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("service name too long"));
        }
        let Some(salon) = self.salon(&salon_id) else {
            return Err(EngineError::Unauthorized);
        };
        let mut guard = salon.write().await;
        authz::require_owner(actor, &guard)?;
        if guard.services.len() >= MAX_SERVICES_PER_SALON {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        if guard.services.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ServiceAdded {
            id,
            salon_id,
            name,
            duration_min,
            price_cents,
        };
        self.persist_apply_salon(&mut guard, &event).await
    }
}
