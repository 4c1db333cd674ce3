use crate::authz::{self, Actor};
use crate::model::*;

use super::{Engine, EngineError};

const MINUTES_PER_DAY: u16 = 24 * 60;

/// Operating hours: at most one row per (salon, weekday), written with
/// upsert semantics.
impl Engine {
    pub async fn upsert_hours(
        &self,
        actor: &Actor,
        salon_id: ulid::Ulid,
        hours: OperatingHours,
    ) -> Result<(), EngineError> {
        validate_hours(&hours)?;
        let Some(salon) = self.salon(&salon_id) else {
            return Err(EngineError::Unauthorized);
        };
        let mut guard = salon.write().await;
        authz::require_owner(actor, &guard)?;

        let event = Event::HoursUpserted {
            salon_id,
            day: hours.day,
            open_min: hours.open_min,
            close_min: hours.close_min,
            closed: hours.closed,
        };
        self.persist_apply_salon(&mut guard, &event).await
    }

    /// One upsert per entry, in order. The first failure aborts the
    /// rest; days already applied are NOT rolled back — callers that
    /// need all-or-nothing must re-submit a corrected batch.
    pub async fn bulk_update_hours(
        &self,
        actor: &Actor,
        salon_id: ulid::Ulid,
        entries: Vec<OperatingHours>,
    ) -> Result<(), EngineError> {
        for hours in entries {
            self.upsert_hours(actor, salon_id, hours).await?;
        }
        Ok(())
    }
}

fn validate_hours(h: &OperatingHours) -> Result<(), EngineError> {
    if h.open_min > MINUTES_PER_DAY || h.close_min > MINUTES_PER_DAY {
        return Err(EngineError::Validation {
            field: "close",
            message: "beyond end of day",
        });
    }
    if !h.closed && h.open_min >= h.close_min {
        return Err(EngineError::Validation {
            field: "open",
            message: "must be before close",
        });
    }
    Ok(())
}
