//! Wake-up alarms keyed by schedule id.

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use chrono::Utc;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::result;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use validator::{Validate, ValidationError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmClass {
    /// Exact, and shown to the user as an upcoming alarm
    #[display("alarm_clock")]
    AlarmClock,
    #[display("exact")]
    Exact,
    /// May fire late, never early
    #[display("inexact")]
    Inexact,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AlarmConfig {
    #[serde(default)]
    pub use_alarm_clock: bool,
    #[serde(default = "default_true")]
    pub use_exact_alarm: bool,
    /// Whether the host lets this process arm exact alarms at all
    #[serde(default = "default_true")]
    pub allow_exact: bool,
    #[serde(with = "humantime_serde", default = "default_inexact_window")]
    #[validate(custom(function = validate_inexact_window))]
    pub inexact_window: Duration,
}

fn default_true() -> bool {
    true
}

fn default_inexact_window() -> Duration {
    Duration::from_secs(15 * 60)
}

fn validate_inexact_window(window: &Duration) -> result::Result<(), ValidationError> {
    if window.as_millis() == 0 {
        return Err(ValidationError::new("InvalidInexactWindow")
            .with_message("inexact_window must be at least one millisecond".into()));
    }
    Ok(())
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            use_alarm_clock: false,
            use_exact_alarm: default_true(),
            allow_exact: default_true(),
            inexact_window: default_inexact_window(),
        }
    }
}

impl AlarmConfig {
    /// Classes to try in order; the inexact class is always the last resort.
    pub fn preferred_classes(&self, can_schedule_exact: bool) -> Vec<AlarmClass> {
        let mut classes = Vec::with_capacity(3);
        if can_schedule_exact && self.use_alarm_clock {
            classes.push(AlarmClass::AlarmClock);
        }
        if can_schedule_exact && (self.use_exact_alarm || self.use_alarm_clock) {
            classes.push(AlarmClass::Exact);
        }
        classes.push(AlarmClass::Inexact);
        classes
    }
}

/// Process-wide alarm registry. Arming an id that is already armed replaces
/// the previous alarm; disarming an id that is not armed does nothing.
pub trait AlarmRegistry: Send + Sync {
    fn can_schedule_exact(&self) -> bool;

    fn arm(&self, id: i64, at: i64, class: AlarmClass) -> Result<()>;

    fn disarm(&self, id: i64) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Armed {
    at: i64,
    class: AlarmClass,
}

#[derive(Debug, Default)]
struct TimerState {
    alarms: BTreeMap<i64, Armed>,
    shutdown: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<TimerState>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Alarms fired by a timer thread of this process. Each due id is sent once on
/// the channel given at construction.
#[derive(Debug)]
pub struct TimerAlarmRegistry {
    shared: Arc<Shared>,
    allow_exact: bool,
    inexact_window_ms: i64,
    thread: Option<JoinHandle<()>>,
}

impl TimerAlarmRegistry {
    pub fn new(config: &AlarmConfig, fired: Sender<i64>) -> Result<Self> {
        let shared = Arc::new(Shared::default());
        let thread_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("alarms".into())
            .spawn(move || run_timer(&thread_shared, fired))?;
        Ok(Self {
            shared,
            allow_exact: config.allow_exact,
            inexact_window_ms: (config.inexact_window.as_millis() as i64).max(1),
            thread: Some(thread),
        })
    }

    /// When and how `id` is armed, if it is.
    pub fn armed(&self, id: i64) -> Option<(i64, AlarmClass)> {
        self.shared.lock().alarms.get(&id).map(|a| (a.at, a.class))
    }
}

impl AlarmRegistry for TimerAlarmRegistry {
    fn can_schedule_exact(&self) -> bool {
        self.allow_exact
    }

    fn arm(&self, id: i64, at: i64, class: AlarmClass) -> Result<()> {
        if class != AlarmClass::Inexact && !self.allow_exact {
            return Err(Error::AlarmUnavailable(class.to_string()));
        }
        let at = match class {
            AlarmClass::Inexact => {
                let window = self.inexact_window_ms;
                at.div_euclid(window) * window + if at.rem_euclid(window) == 0 { 0 } else { window }
            }
            _ => at,
        };
        let previous = self.shared.lock().alarms.insert(id, Armed { at, class });
        self.shared.wake.notify_all();
        match previous {
            Some(p) => tracing::info!(
                "Re-armed alarm {} at {} ({}), replacing {} ({})",
                id,
                at,
                class,
                p.at,
                p.class
            ),
            None => tracing::info!("Armed alarm {} at {} ({})", id, at, class),
        }
        Ok(())
    }

    fn disarm(&self, id: i64) -> Result<()> {
        if self.shared.lock().alarms.remove(&id).is_some() {
            self.shared.wake.notify_all();
            tracing::info!("Cancelled alarm {}", id);
        } else {
            tracing::debug!("Alarm {} was not armed", id);
        }
        Ok(())
    }
}

impl Drop for TimerAlarmRegistry {
    fn drop(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.wake.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run_timer(shared: &Shared, fired: Sender<i64>) {
    let mut state = shared.lock();
    loop {
        if state.shutdown {
            return;
        }
        let now = Utc::now().timestamp_millis();
        let due = state
            .alarms
            .iter()
            .filter(|(_, a)| a.at <= now)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        if !due.is_empty() {
            for id in &due {
                state.alarms.remove(id);
            }
            drop(state);
            for id in due {
                tracing::info!("Alarm {} fired", id);
                if fired.send(id).is_err() {
                    tracing::debug!("Alarm receiver gone, stopping timer");
                    return;
                }
            }
            state = shared.lock();
            continue;
        }

        let next = state.alarms.values().map(|a| a.at).min();
        state = match next {
            None => shared.wake.wait(state).unwrap_or_else(PoisonError::into_inner),
            Some(at) => {
                let timeout = Duration::from_millis((at - now).max(1) as u64);
                shared
                    .wake
                    .wait_timeout(state, timeout)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::{channel, Receiver};

    fn registry(config: AlarmConfig) -> (TimerAlarmRegistry, Receiver<i64>) {
        let (tx, rx) = channel();
        (TimerAlarmRegistry::new(&config, tx).unwrap(), rx)
    }

    fn now() -> i64 {
        Utc::now().timestamp_millis()
    }

    #[test]
    fn test_fires_once() {
        let (alarms, rx) = registry(AlarmConfig::default());
        alarms.arm(7, now() + 50, AlarmClass::Exact).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(alarms.armed(7), None);
    }

    #[test]
    fn test_rearm_supersedes() {
        let (alarms, rx) = registry(AlarmConfig::default());
        alarms.arm(1, now() + 60_000, AlarmClass::Exact).unwrap();
        alarms.arm(1, now() + 50, AlarmClass::AlarmClock).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    }

    #[test]
    fn test_disarm_is_idempotent() {
        let (alarms, rx) = registry(AlarmConfig::default());
        alarms.disarm(3).unwrap();
        alarms.arm(3, now() + 100, AlarmClass::Exact).unwrap();
        alarms.disarm(3).unwrap();
        alarms.disarm(3).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(400)).is_err());
    }

    #[test]
    fn test_inexact_rounds_up_to_window() {
        let config = AlarmConfig {
            inexact_window: Duration::from_secs(3600),
            ..AlarmConfig::default()
        };
        let (alarms, _rx) = registry(config);
        let at = now() + 86_400_000 + 1;
        alarms.arm(4, at, AlarmClass::Inexact).unwrap();
        let (armed_at, class) = alarms.armed(4).unwrap();
        assert_eq!(class, AlarmClass::Inexact);
        assert!(armed_at >= at);
        assert!(armed_at - at < 3_600_000);
        assert_eq!(armed_at % 3_600_000, 0);
    }

    #[test]
    fn test_exact_refused_when_not_allowed() {
        let config = AlarmConfig {
            allow_exact: false,
            ..AlarmConfig::default()
        };
        let (alarms, _rx) = registry(config);
        assert!(!alarms.can_schedule_exact());
        let err = alarms.arm(5, now() + 60_000, AlarmClass::Exact).unwrap_err();
        assert!(matches!(err, Error::AlarmUnavailable(_)));
        assert!(alarms.arm(5, now() + 60_000, AlarmClass::Inexact).is_ok());
    }

    #[test]
    fn test_preferred_classes() {
        let clock = AlarmConfig {
            use_alarm_clock: true,
            ..AlarmConfig::default()
        };
        assert_eq!(
            clock.preferred_classes(true),
            vec![AlarmClass::AlarmClock, AlarmClass::Exact, AlarmClass::Inexact]
        );
        assert_eq!(clock.preferred_classes(false), vec![AlarmClass::Inexact]);

        let inexact = AlarmConfig {
            use_exact_alarm: false,
            ..AlarmConfig::default()
        };
        assert_eq!(inexact.preferred_classes(true), vec![AlarmClass::Inexact]);
        assert_eq!(
            AlarmConfig::default().preferred_classes(true),
            vec![AlarmClass::Exact, AlarmClass::Inexact]
        );
    }

    #[test]
    fn test_config_parses_window() {
        let config: AlarmConfig = serde_yml::from_str("inexact_window: 5m\n").unwrap();
        assert_eq!(config.inexact_window, Duration::from_secs(300));
        assert!(config.use_exact_alarm);
        assert!(config.validate().is_ok());
    }
}
