use crate::backup::function_path;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::{convert_error_vec, Result};
use crate::backup::result_error::{AddFnName, AddMsg};
use crate::backup::schedule::alarm::{AlarmConfig, AlarmRegistry};
use crate::backup::schedule::store::ScheduleStore;
use crate::backup::schedule::Schedule;
use chrono::Utc;
use function_name::named;
use std::sync::Arc;

/// Arms and cancels the alarm of each schedule, keeping the persisted run time
/// in step with what was armed.
#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn ScheduleStore>,
    alarms: Arc<dyn AlarmRegistry>,
    config: AlarmConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        alarms: Arc<dyn AlarmRegistry>,
        config: AlarmConfig,
    ) -> Self {
        Self {
            store,
            alarms,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn ScheduleStore> {
        &self.store
    }

    /// Recomputes the next run of `id` and arms its alarm. With `reschedule`
    /// the interval restarts from now.
    ///
    /// Returns the armed time, `None` when the schedule is disabled.
    pub fn schedule_alarm(&self, id: i64, reschedule: bool) -> Result<Option<i64>> {
        self.schedule_alarm_at(id, reschedule, Utc::now().timestamp_millis())
    }

    #[named]
    pub(crate) fn schedule_alarm_at(&self, id: i64, reschedule: bool, now: i64) -> Result<Option<i64>> {
        let mut schedule = self
            .store
            .get(id)?
            .ok_or_else(|| Error::NotFound(format!("schedule {id}")))?;
        if !schedule.enabled {
            tracing::debug!("Schedule {} is disabled, nothing to arm", id);
            self.cancel_alarm(id)?;
            return Ok(None);
        }

        let time_to_run = schedule.next_run(now).add_fn_name(function_path!())?;
        if reschedule {
            schedule.time_placed = now;
        }
        schedule.time_to_run = time_to_run;
        self.store
            .update_times(id, schedule.time_placed, schedule.time_to_run)?;
        self.arm(&schedule)?;
        Ok(Some(time_to_run))
    }

    /// Tries each permitted alarm class in turn, falling back when one cannot be armed.
    fn arm(&self, schedule: &Schedule) -> Result<()> {
        let mut failures = Vec::new();
        for class in self
            .config
            .preferred_classes(self.alarms.can_schedule_exact())
        {
            match self.alarms.arm(schedule.id, schedule.time_to_run, class) {
                Ok(()) => {
                    tracing::info!(
                        "Schedule {} ({}) runs at {} via {} alarm",
                        schedule.id,
                        schedule.name,
                        schedule.time_to_run,
                        class
                    );
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!("Cannot arm {} alarm for schedule {}: {}", class, schedule.id, e);
                    failures.push(e);
                }
            }
        }
        convert_error_vec(failures).add_msg(format!("No alarm armed for schedule {}", schedule.id))
    }

    pub fn cancel_alarm(&self, id: i64) -> Result<()> {
        self.alarms.disarm(id)
    }

    /// Arms every enabled schedule and cancels the rest.
    pub fn schedule_all(&self) -> Result<()> {
        let errors = self
            .store
            .all()?
            .into_iter()
            .filter_map(|s| {
                if s.enabled {
                    self.schedule_alarm(s.id, false).err()
                } else {
                    self.cancel_alarm(s.id).err()
                }
            })
            .collect::<Vec<_>>();
        convert_error_vec(errors)
    }
}
