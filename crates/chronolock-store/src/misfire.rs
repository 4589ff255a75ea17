use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use tracing::{debug, info};

use chronolock_core::Clock;
use chronolock_schedule::MisfireInstruction;

use crate::{
    dao::{CalendarDao, TriggerDao},
    db::Tables,
    error::Result,
    types::{Trigger, TriggerState},
};

/// Decides whether a trigger's due time slipped past the misfire threshold
/// and applies the trigger's misfire instruction when it did.
pub struct MisfireHandler {
    triggers: TriggerDao,
    calendars: CalendarDao,
    clock: Arc<dyn Clock>,
    threshold: Duration,
}

impl MisfireHandler {
    pub fn new(tables: Arc<Tables>, clock: Arc<dyn Clock>, misfire_threshold_ms: u64) -> Self {
        Self {
            triggers: TriggerDao::new(tables.clone()),
            calendars: CalendarDao::new(tables),
            clock,
            threshold: Duration::milliseconds(misfire_threshold_ms as i64),
        }
    }

    /// Fire times strictly before this instant count as misfired.
    pub fn misfire_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.threshold
    }

    pub fn is_misfired(&self, trigger: &Trigger, now: DateTime<Utc>) -> bool {
        if trigger.schedule.resolve_misfire(trigger.misfire_instruction)
            == MisfireInstruction::IgnoreMisfirePolicy
        {
            return false;
        }
        trigger
            .next_fire_time
            .is_some_and(|next| next < self.misfire_time(now))
    }

    /// Apply the misfire policy to `trigger` in memory. Returns `true` when
    /// the next fire time changed; the caller persists the trigger.
    pub fn apply(&self, conn: &Connection, trigger: &mut Trigger) -> Result<bool> {
        let now = self.clock.now();
        if !self.is_misfired(trigger, now) {
            return Ok(false);
        }
        let calendar = match &trigger.calendar_name {
            Some(name) => self.calendars.get(conn, name)?,
            None => None,
        };
        let before = trigger.next_fire_time;
        trigger.update_after_misfire(calendar.as_ref(), now);
        debug!(
            trigger = %trigger.key,
            was = ?before,
            next = ?trigger.next_fire_time,
            "misfire policy applied"
        );
        Ok(before != trigger.next_fire_time)
    }

    /// Apply the policy to every WAITING trigger that misfired while nobody
    /// acquired it. Triggers left without a fire time become COMPLETE.
    /// Returns the number of triggers updated.
    pub fn scan(&self, conn: &Connection) -> Result<usize> {
        let now = self.clock.now();
        let candidates = self.triggers.waiting_before(conn, self.misfire_time(now))?;
        let mut updated = 0;
        for mut trigger in candidates {
            if !self.apply(conn, &mut trigger)? {
                continue;
            }
            if trigger.next_fire_time.is_none() {
                trigger.state = TriggerState::Complete;
            }
            self.triggers.update(conn, &trigger)?;
            updated += 1;
        }
        if updated > 0 {
            info!(count = updated, "misfired triggers updated");
        }
        Ok(updated)
    }
}
