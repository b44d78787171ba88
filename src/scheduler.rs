//! Daily scheduling of refresh runs.
//!
//! [`RefreshScheduler`] owns at most one timer registration. It computes the
//! first fire time from the configured time of day and registers a timer that
//! repeats every 24 hours. The timer mechanics belong to a [`TimerRegistrar`];
//! [`TokioTimerRegistrar`] is the one the daemon uses.
//!
//! The live registration is mirrored into the state store so that other
//! processes (the admin CLI) can see whether a run is scheduled and can force
//! a re-registration by deleting the mirror.

use crate::clock::Clock;
use crate::engine::{RefreshEngine, RunRequest};
use crate::metrics;
use crate::settings::{ScheduleTime, Settings, SettingsStore};
use crate::state_store::StateStore;
use anyhow::{bail, Context, Result};
use chrono::{Duration as ChronoDuration, Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const REGISTRATION_KEY: &str = "scheduler_registration";
pub const DAILY_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
/// How often the daemon compares the live timer with stored settings.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Today at `time` if that moment has not passed yet, otherwise tomorrow.
pub fn compute_next_fire_time(time: ScheduleTime, now: NaiveDateTime) -> NaiveDateTime {
    let candidate = now.date().and_time(time.naive_time());
    if candidate >= now {
        candidate
    } else {
        candidate + ChronoDuration::days(1)
    }
}

pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(pub u64);

pub trait TimerRegistrar: Send + Sync {
    /// Calls `callback` at `first_fire_at` (local time) and then every
    /// `interval` until cancelled.
    fn schedule_recurring(
        &self,
        first_fire_at: NaiveDateTime,
        interval: Duration,
        callback: TimerCallback,
    ) -> Result<TimerHandle>;
    fn cancel(&self, handle: TimerHandle);
}

/// Runs each registration as a tokio task. Callbacks execute on the blocking
/// pool. Cancelling the parent token stops every timer.
pub struct TokioTimerRegistrar {
    runtime: Handle,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
    next_id: AtomicU64,
    timers: Mutex<HashMap<u64, CancellationToken>>,
}

impl TokioTimerRegistrar {
    pub fn new(runtime: Handle, clock: Arc<dyn Clock>, shutdown: CancellationToken) -> Self {
        Self {
            runtime,
            clock,
            shutdown,
            next_id: AtomicU64::new(1),
            timers: Mutex::new(HashMap::new()),
        }
    }

    pub fn active_timers(&self) -> usize {
        self.timers().len()
    }

    fn timers(&self) -> MutexGuard<'_, HashMap<u64, CancellationToken>> {
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl TimerRegistrar for TokioTimerRegistrar {
    fn schedule_recurring(
        &self,
        first_fire_at: NaiveDateTime,
        interval: Duration,
        callback: TimerCallback,
    ) -> Result<TimerHandle> {
        if interval.is_zero() {
            bail!("Timer interval must be positive");
        }
        let delay = (first_fire_at - self.clock.now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let start = tokio::time::Instant::now() + delay;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = self.shutdown.child_token();
        self.timers().insert(id, token.clone());

        self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let callback = callback.clone();
                        if let Err(e) = tokio::task::spawn_blocking(move || callback()).await {
                            error!(timer_id = id, "Timer callback panicked: {}", e);
                        }
                    }
                }
            }
            debug!(timer_id = id, "Timer stopped");
        });

        debug!(timer_id = id, delay_secs = delay.as_secs(), "Timer registered");
        Ok(TimerHandle(id))
    }

    fn cancel(&self, handle: TimerHandle) {
        if let Some(token) = self.timers().remove(&handle.0) {
            token.cancel();
        }
    }
}

/// Mirror of the live timer registration, kept in the state store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerRegistration {
    pub schedule_time: ScheduleTime,
    pub first_fire_at: NaiveDateTime,
    pub interval_secs: u64,
    pub registered_at: NaiveDateTime,
}

impl SchedulerRegistration {
    /// The first tick of this registration at or after `now`.
    pub fn next_fire_after(&self, now: NaiveDateTime) -> NaiveDateTime {
        if now <= self.first_fire_at || self.interval_secs == 0 {
            return self.first_fire_at;
        }
        let interval = self.interval_secs as i64;
        let elapsed = (now - self.first_fire_at).num_seconds();
        let ticks = (elapsed + interval - 1) / interval;
        self.first_fire_at + ChronoDuration::seconds(ticks * interval)
    }
}

pub fn load_registration(state: &dyn StateStore) -> Result<Option<SchedulerRegistration>> {
    let Some(raw) = state.get_state(REGISTRATION_KEY)? else {
        return Ok(None);
    };
    match serde_json::from_str(&raw) {
        Ok(registration) => Ok(Some(registration)),
        Err(e) => {
            warn!("Ignoring unreadable scheduler registration: {}", e);
            Ok(None)
        }
    }
}

struct ActiveRegistration {
    handle: TimerHandle,
    schedule_time: ScheduleTime,
}

pub struct RefreshScheduler {
    registrar: Arc<dyn TimerRegistrar>,
    engine: Arc<RefreshEngine>,
    state: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    settings: SettingsStore,
    current: Mutex<Option<ActiveRegistration>>,
}

impl RefreshScheduler {
    pub fn new(
        registrar: Arc<dyn TimerRegistrar>,
        engine: Arc<RefreshEngine>,
        state: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registrar,
            engine,
            settings: SettingsStore::new(state.clone()),
            state,
            clock,
            current: Mutex::new(None),
        }
    }

    fn current(&self) -> MutexGuard<'_, Option<ActiveRegistration>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_registered(&self) -> bool {
        self.current().is_some()
    }

    fn callback(&self) -> TimerCallback {
        let engine = self.engine.clone();
        Arc::new(move || match engine.run(&RunRequest::scheduled()) {
            Ok(result) => info!(
                outcome = result.outcome.as_str(),
                updated = result.records_updated,
                "Scheduled refresh: {}",
                result.message
            ),
            Err(e) => error!("Scheduled refresh failed: {}", e),
        })
    }

    /// Drops the current registration and, when refreshing is enabled,
    /// registers a new daily timer for `settings.schedule_time`.
    pub fn reschedule(&self, settings: &Settings) -> Result<Option<SchedulerRegistration>> {
        let mut current = self.current();
        if let Some(active) = current.take() {
            self.registrar.cancel(active.handle);
            debug!("Cancelled previous refresh timer");
        }

        if !settings.enabled {
            self.state.delete_state(REGISTRATION_KEY)?;
            metrics::set_next_fire_timestamp(None);
            info!("Refresh schedule cleared, refreshing is disabled");
            return Ok(None);
        }

        let now = self.clock.now();
        let first_fire_at = compute_next_fire_time(settings.schedule_time, now);
        let handle =
            self.registrar
                .schedule_recurring(first_fire_at, DAILY_INTERVAL, self.callback())?;
        *current = Some(ActiveRegistration {
            handle,
            schedule_time: settings.schedule_time,
        });

        let registration = SchedulerRegistration {
            schedule_time: settings.schedule_time,
            first_fire_at,
            interval_secs: DAILY_INTERVAL.as_secs(),
            registered_at: now,
        };
        let raw = serde_json::to_string(&registration)
            .context("Failed to serialize scheduler registration")?;
        self.state.set_state(REGISTRATION_KEY, &raw)?;
        metrics::set_next_fire_timestamp(
            first_fire_at
                .and_local_timezone(Local)
                .earliest()
                .map(|dt| dt.timestamp()),
        );

        info!(
            schedule_time = %settings.schedule_time,
            next_fire_at = %first_fire_at,
            "Refresh scheduled"
        );
        Ok(Some(registration))
    }

    /// Re-registers when the stored settings no longer match the live timer,
    /// or when the stored registration mirror has been removed. Returns
    /// whether anything changed.
    pub fn sync(&self) -> Result<bool> {
        let settings = self.settings.get()?;
        let live = self.current().as_ref().map(|active| active.schedule_time);
        let persisted = load_registration(self.state.as_ref())?;

        let needs_reschedule = match (live, settings.enabled) {
            (None, true) => true,
            (Some(_), false) => true,
            (Some(time), true) => time != settings.schedule_time || persisted.is_none(),
            (None, false) => persisted.is_some(),
        };
        if needs_reschedule {
            self.reschedule(&settings)?;
        }
        Ok(needs_reschedule)
    }

    /// Cancels the timer and removes the registration mirror.
    pub fn cancel(&self) -> Result<()> {
        if let Some(active) = self.current().take() {
            self.registrar.cancel(active.handle);
        }
        self.state.delete_state(REGISTRATION_KEY)?;
        metrics::set_next_fire_timestamp(None);
        Ok(())
    }

    /// Keeps the timer in line with stored settings until `shutdown` fires,
    /// then cancels it.
    pub async fn run(self: Arc<Self>, sync_interval: Duration, shutdown: CancellationToken) {
        info!(
            "Refresh scheduler started, syncing every {}s",
            sync_interval.as_secs()
        );

        loop {
            let scheduler = self.clone();
            match tokio::task::spawn_blocking(move || scheduler.sync()).await {
                Ok(Ok(true)) => debug!("Refresh timer re-registered"),
                Ok(Ok(false)) => {}
                Ok(Err(e)) => error!("Failed to sync refresh schedule: {}", e),
                Err(e) => error!("Schedule sync task failed: {}", e),
            }

            tokio::select! {
                _ = tokio::time::sleep(sync_interval) => {}
                _ = shutdown.cancelled() => {
                    info!("Refresh scheduler received shutdown signal");
                    break;
                }
            }
        }

        if let Err(e) = self.cancel() {
            error!("Failed to clear refresh schedule: {}", e);
        }
        info!("Refresh scheduler stopped");
    }
}
