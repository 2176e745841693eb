//! Runs schedules: fires their batches, and re-arms them once a batch is over.
//!
//! A schedule is `Disabled`, `Armed` for its next run, or `Running` a batch.
//! Every way out of `Running`, completion or cancellation, goes through the
//! batch's completion callback, which arms the next run.

use crate::backup::batch::work::{WorkFactory, WorkMode};
use crate::backup::batch::{BatchHandle, BatchOrchestrator, BatchResult};
use crate::backup::catalog::PackageCatalog;
use crate::backup::logs::{LogRecord, LogStore};
use crate::backup::notifications::{Notification, NotificationConfig};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use crate::backup::schedule::scheduler::Scheduler;
use bon::Builder;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScheduleState {
    Disabled,
    Armed { at: i64 },
    Running { batch: String },
}

#[derive(Builder)]
pub struct ScheduleService {
    scheduler: Scheduler,
    catalog: Arc<dyn PackageCatalog>,
    orchestrator: Arc<BatchOrchestrator>,
    factory: Arc<dyn WorkFactory>,
    logs: Option<LogStore>,
    notification: Option<NotificationConfig>,
    #[builder(default = Duration::from_secs(30))]
    cancel_grace: Duration,
    #[builder(skip)]
    running: Mutex<BTreeMap<i64, BatchHandle>>,
}

impl ScheduleService {
    fn running(&self) -> MutexGuard<'_, BTreeMap<i64, BatchHandle>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn running_batch(&self, id: i64) -> Option<BatchHandle> {
        self.running()
            .get(&id)
            .filter(|batch| !batch.is_completed())
            .cloned()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn state(&self, id: i64) -> Result<ScheduleState> {
        if let Some(batch) = self.running_batch(id) {
            return Ok(ScheduleState::Running {
                batch: batch.name().to_string(),
            });
        }
        let schedule = self
            .scheduler
            .store()
            .get(id)?
            .ok_or_else(|| Error::NotFound(format!("schedule {id}")))?;
        Ok(if schedule.enabled {
            ScheduleState::Armed {
                at: schedule.time_to_run,
            }
        } else {
            ScheduleState::Disabled
        })
    }

    /// Arms every enabled schedule.
    pub fn start(&self) -> Result<()> {
        self.scheduler.schedule_all()
    }

    /// Enables `id` and arms it with the interval restarting now.
    pub fn enable(&self, id: i64) -> Result<i64> {
        self.set_enabled(id, true)?;
        self.scheduler
            .schedule_alarm(id, true)?
            .ok_or_else(|| Error::NotFound(format!("schedule {id}")))
    }

    /// Disables `id`, dropping its alarm and stopping a batch it is running.
    pub fn disable(&self, id: i64) -> Result<()> {
        self.set_enabled(id, false)?;
        self.scheduler.cancel_alarm(id)?;
        self.cancel(id)?;
        Ok(())
    }

    fn set_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        let store = self.scheduler.store();
        let mut schedule = store
            .get(id)?
            .ok_or_else(|| Error::NotFound(format!("schedule {id}")))?;
        schedule.enabled = enabled;
        store.save(&schedule)?;
        tracing::info!(
            "Schedule {} ({}) {}",
            id,
            schedule.name,
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    /// Starts the batch of a schedule whose alarm went off. Returns `None`
    /// when nothing was started: the schedule is disabled, or its previous
    /// batch is still running.
    pub fn fire(self: &Arc<Self>, id: i64) -> Result<Option<BatchHandle>> {
        if let Some(batch) = self.running_batch(id) {
            tracing::warn!("Schedule {} is still running {}, skipping", id, batch.name());
            return Ok(None);
        }
        let schedule = self
            .scheduler
            .store()
            .get(id)?
            .ok_or_else(|| Error::NotFound(format!("schedule {id}")))?;
        if !schedule.enabled {
            tracing::debug!("Schedule {} fired while disabled", id);
            self.scheduler.cancel_alarm(id)?;
            return Ok(None);
        }

        let packages = schedule.resolve(self.catalog.as_ref());
        let batch = self.orchestrator.begin_batch(schedule.batch_name(Utc::now()));
        if packages.is_empty() {
            tracing::warn!("Schedule {} ({}) matches no package", id, schedule.name);
        }
        for package in &packages {
            let item = self
                .factory
                .create(package, &schedule.kinds, WorkMode::Backup);
            if let Err(e) = self.orchestrator.enqueue(&batch, item) {
                tracing::warn!("Schedule {}: {}", id, e);
            }
        }

        self.running().insert(id, batch.clone());
        let service = Arc::downgrade(self);
        batch.on_complete(move |result| finish(&service, id, result));
        self.orchestrator.start(&batch);
        Ok(Some(batch))
    }

    /// Stops the batch `id` is running. The schedule stays armed for its next run.
    pub fn cancel(&self, id: i64) -> Result<Option<BatchResult>> {
        let Some(batch) = self.running_batch(id) else {
            tracing::debug!("Schedule {} is not running", id);
            return Ok(None);
        };
        Ok(Some(self.orchestrator.cancel_batch(&batch, self.cancel_grace)))
    }

    fn complete(&self, id: i64, result: &BatchResult) {
        {
            let mut running = self.running();
            if running.get(&id).is_some_and(|b| b.name() == result.batch_name) {
                running.remove(&id);
            }
        }

        if !result.succeeded() {
            if let Some(logs) = &self.logs {
                if let Err(e) = logs.write(&LogRecord::new(result, Utc::now())) {
                    tracing::error!("Cannot write log of {}: {}", result.batch_name, e);
                }
            }
        }
        if let Some(notification) = &self.notification {
            if let Err(e) = notification.send_batch(result) {
                tracing::error!("Cannot send notification for {}: {}", result.batch_name, e);
            }
        }
        self.rearm(id);
    }

    fn rearm(&self, id: i64) {
        match self.scheduler.schedule_alarm(id, true) {
            Ok(Some(at)) => tracing::debug!("Schedule {} re-armed for {}", id, at),
            Ok(None) => tracing::debug!("Schedule {} stays disabled", id),
            Err(e) => tracing::error!("Cannot re-arm schedule {}: {}", id, e),
        }
    }

    /// Fires schedules as their ids arrive, until the sender is gone. Errors of
    /// one schedule are logged and it is re-armed; a fatal error ends the loop.
    pub fn run_daemon(self: &Arc<Self>, fired: Receiver<i64>) -> Result<()> {
        if let Err(e) = self.start() {
            if e.is_fatal() {
                return Err(e.add_msg("Cannot arm schedules"));
            }
            tracing::error!("Some schedules could not be armed: {}", e);
        }
        tracing::info!("Waiting for alarms");
        for id in fired.iter() {
            match self.fire(id) {
                Ok(_) => {}
                Err(e) if e.is_fatal() => return Err(e.add_msg(format!("Schedule {id} failed"))),
                Err(e) => {
                    tracing::error!("Schedule {} failed to start: {}", id, e);
                    self.rearm(id);
                }
            }
        }
        tracing::info!("Alarm source closed, stopping");
        Ok(())
    }
}

fn finish(service: &Weak<ScheduleService>, id: i64, result: &BatchResult) {
    match service.upgrade() {
        Some(service) => service.complete(id, result),
        None => tracing::debug!("Batch {} completed after shutdown", result.batch_name),
    }
}
