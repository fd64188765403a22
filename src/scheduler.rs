// src/scheduler.rs
use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDate, Utc};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::pms_client::{extract_records, PmsError, PortalApi, PortalSession};
use crate::reconcile::{filled_dates, reconcile};
use crate::store::{PersistedConfig, Store, TaskStatus, WorkConfig};
use crate::submit::{submit_all, RunReport};
use crate::workdays::{candidate_window, WorkdayCalendar};

pub const TICK_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_HORIZON_DAYS: u32 = 40;
/// Rolling cadence: a new scheduled run is allowed only this long after the
/// previous successful one.
pub const MIN_SUCCESS_INTERVAL_SECS: i64 = 60 * 60;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    pub horizon_days: u32,
    pub min_success_interval: ChronoDuration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: TICK_INTERVAL,
            horizon_days: DEFAULT_HORIZON_DAYS,
            min_success_interval: ChronoDuration::seconds(MIN_SUCCESS_INTERVAL_SECS),
        }
    }
}

#[derive(Error, Debug)]
pub enum RunError {
    #[error("configuration incomplete: {0}")]
    ConfigIncomplete(String),

    #[error("login failed: {0}")]
    Login(#[source] PmsError),
}

/// Why the Run Guard refused to start a pipeline. Skips are logged, never
/// surfaced as errors, and leave TaskStatus untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// Another pipeline is in flight in this process.
    Busy,
    /// The persisted status still marks a run active.
    MarkedRunning,
    /// The last success is inside the cadence window.
    RanRecently { last_success: DateTime<Utc> },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Busy => write!(f, "a run is already in progress"),
            SkipReason::MarkedRunning => write!(f, "persisted status marks a run active"),
            SkipReason::RanRecently { last_success } => {
                write!(f, "last success at {} is too recent", last_success)
            }
        }
    }
}

// --- Run Guard ---

/// Mutual exclusion plus cadence gate for the pipeline.
///
/// The in-memory flag is the authoritative lock (claimed with a
/// compare-exchange, so it holds under the multi-threaded runtime); the
/// persisted `isRunning` marker mirrors it for status consumers and crash
/// forensics. The flag is claimed before the first suspension point of any
/// run and released by `RunSlot::drop` on every exit path.
pub struct RunGuard {
    busy: AtomicBool,
    min_success_interval: ChronoDuration,
}

/// Scoped occupancy of the Run Guard; dropping it returns the guard to
/// `Idle` unconditionally.
#[derive(Debug)]
pub struct RunSlot<'a> {
    busy: &'a AtomicBool,
}

impl Drop for RunSlot<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

impl RunGuard {
    pub fn new(min_success_interval: ChronoDuration) -> Self {
        Self {
            busy: AtomicBool::new(false),
            min_success_interval,
        }
    }

    /// `Idle -> Running`, or the reason the transition is disallowed.
    /// Manual triggers pass `enforce_cadence = false`: they bypass the
    /// cadence policy but never the mutual exclusion.
    pub fn try_acquire(
        &self,
        status: &TaskStatus,
        now: DateTime<Utc>,
        enforce_cadence: bool,
    ) -> Result<RunSlot<'_>, SkipReason> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(SkipReason::Busy);
        }
        // The slot exists from here on, so every early return releases the
        // flag on drop.
        let slot = RunSlot { busy: &self.busy };

        if status.is_running {
            return Err(SkipReason::MarkedRunning);
        }
        if enforce_cadence {
            if let Some(last_success) = status.last_success_time {
                if now - last_success < self.min_success_interval {
                    return Err(SkipReason::RanRecently { last_success });
                }
            }
        }
        Ok(slot)
    }
}

// --- Run request ---

/// Validated inputs for one pipeline run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub username: String,
    pub password: String,
    pub work: WorkConfig,
    pub descriptions: Vec<String>,
    /// Manual-trigger escape hatch: explicit dates skip window generation
    /// and reconciliation entirely.
    pub explicit_dates: Option<Vec<NaiveDate>>,
}

impl RunRequest {
    pub fn new(
        username: String,
        password: String,
        work: WorkConfig,
        descriptions: Vec<String>,
        explicit_dates: Option<Vec<NaiveDate>>,
    ) -> Result<Self, RunError> {
        if username.is_empty() {
            return Err(RunError::ConfigIncomplete("username is not set".to_string()));
        }
        if password.is_empty() {
            return Err(RunError::ConfigIncomplete("password is not set".to_string()));
        }
        Self::validate_work(&work)?;
        Ok(Self {
            username,
            password,
            work,
            descriptions,
            explicit_dates,
        })
    }

    pub fn from_persisted(config: &PersistedConfig) -> Result<Self, RunError> {
        let username = config
            .username
            .clone()
            .ok_or_else(|| RunError::ConfigIncomplete("username is not set".to_string()))?;
        let password = config
            .password
            .clone()
            .ok_or_else(|| RunError::ConfigIncomplete("password is not set".to_string()))?;
        let work = config
            .work_config
            .clone()
            .ok_or_else(|| RunError::ConfigIncomplete("work configuration is not set".to_string()))?;
        Self::new(username, password, work, config.desc_list.clone(), None)
    }

    fn validate_work(work: &WorkConfig) -> Result<(), RunError> {
        if work.project_id <= 0 {
            return Err(RunError::ConfigIncomplete("project id is not set".to_string()));
        }
        if work.task_id <= 0 {
            return Err(RunError::ConfigIncomplete("task id is not set".to_string()));
        }
        if work.hours <= Decimal::ZERO {
            return Err(RunError::ConfigIncomplete("hours must be positive".to_string()));
        }
        Ok(())
    }
}

// --- Scheduler ---

/// Owns the repeating timer and the Run Guard, and drives the pipeline:
/// guard, authenticate, window, remote fill-state, reconcile, submit,
/// persist outcome.
pub struct Scheduler {
    store: Arc<Store>,
    portal: Arc<dyn PortalApi>,
    calendar: Arc<dyn WorkdayCalendar>,
    guard: RunGuard,
    config: SchedulerConfig,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        portal: Arc<dyn PortalApi>,
        calendar: Arc<dyn WorkdayCalendar>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            portal,
            calendar,
            guard: RunGuard::new(config.min_success_interval),
            config,
            loop_handle: Mutex::new(None),
        })
    }

    /// Launches the repeating tick; the first tick fires immediately.
    pub fn start(self: &Arc<Self>) {
        let scheduler = Arc::clone(self);
        let tick_interval = self.config.tick_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                // Each tick runs detached, so stopping the loop never
                // aborts an in-flight pipeline. Ticks never queue: an
                // occupied guard turns the tick into a no-op.
                tokio::spawn(Arc::clone(&scheduler).execute_tick());
            }
        });
        *self.loop_handle.lock().unwrap() = Some(handle);
        info!("scheduler started, tick interval {:?}", tick_interval);
    }

    /// Cancels future ticks. An in-flight run finishes on its own.
    pub fn stop(&self) {
        if let Some(handle) = self.loop_handle.lock().unwrap().take() {
            handle.abort();
            info!("scheduler stopped");
        }
    }

    /// One scheduled tick: guard check, then the full pipeline against the
    /// persisted configuration.
    pub async fn execute_tick(self: Arc<Self>) {
        let status = self.store.task_status();
        let slot = match self.guard.try_acquire(&status, Utc::now(), true) {
            Ok(slot) => slot,
            Err(reason) => {
                info!("scheduled run skipped: {}", reason);
                return;
            }
        };

        let request = match RunRequest::from_persisted(&self.store.config()) {
            Ok(request) => request,
            Err(e) => {
                warn!("scheduled run aborted: {}", e);
                self.record_outcome(false, &e.to_string());
                return; // slot drops, guard returns to Idle
            }
        };

        self.run_guarded(slot, request).await;
    }

    /// Manual trigger: the same guarded pipeline with caller-supplied
    /// inputs. Honors mutual exclusion, bypasses the cadence policy.
    pub async fn run_manual(&self, request: RunRequest) -> Result<RunReport, SkipReason> {
        let status = self.store.task_status();
        let slot = self.guard.try_acquire(&status, Utc::now(), false)?;
        Ok(self.run_guarded(slot, request).await)
    }

    async fn run_guarded(&self, slot: RunSlot<'_>, request: RunRequest) -> RunReport {
        // Persist the running marker before the first remote call.
        if let Err(e) = self.store.set_task_running(true) {
            error!("could not mark the task as running: {}", e);
            let report = RunReport::aborted(format!("status store failure: {}", e));
            self.record_outcome(false, &report.message);
            return report;
        }

        let today = Local::now().date_naive();
        let mut rng = StdRng::from_entropy();
        let (success, report) = match self.run_pipeline(&request, today, &mut rng).await {
            Ok(report) => (report.is_success(), report),
            Err(e) => {
                warn!("run aborted: {}", e);
                (false, RunReport::aborted(e.to_string()))
            }
        };

        // Outcome write also resets the persisted running marker; the
        // in-memory flag is released by the slot right after.
        self.record_outcome(success, &report.message);
        drop(slot);
        report
    }

    pub(crate) async fn run_pipeline(
        &self,
        request: &RunRequest,
        today: NaiveDate,
        rng: &mut (dyn RngCore + Send),
    ) -> Result<RunReport, RunError> {
        let session = self
            .portal
            .login(&request.username, &request.password)
            .await
            .map_err(RunError::Login)?;

        let outstanding = match &request.explicit_dates {
            Some(dates) => dates.clone(),
            None => {
                let window = candidate_window(today, self.config.horizon_days, self.calendar.as_ref());
                let filled = self.fetch_filled(&session, &request.work).await;
                reconcile(&window, &filled)
            }
        };

        if outstanding.is_empty() {
            info!(
                "nothing outstanding in the {}-day window",
                self.config.horizon_days
            );
            return Ok(RunReport::no_outstanding());
        }

        info!("{} outstanding workdays to fill", outstanding.len());
        Ok(submit_all(
            self.portal.as_ref(),
            &session,
            &request.work,
            &request.descriptions,
            &outstanding,
            rng,
        )
        .await)
    }

    /// Fresh remote fill-state for this run. A failed read degrades to
    /// "nothing filled": the portal rejects duplicates, silently skipping
    /// an open day has no such safety net.
    async fn fetch_filled(
        &self,
        session: &PortalSession,
        work: &WorkConfig,
    ) -> HashSet<NaiveDate> {
        match self.portal.fetch_ts_data(session).await {
            Ok(data) => {
                let records = extract_records(&data);
                let filled = filled_dates(&records, work.project_id, work.task_id);
                info!(
                    "portal reports {} filled dates for project {} task {}",
                    filled.len(),
                    work.project_id,
                    work.task_id
                );
                filled
            }
            Err(e) => {
                warn!(
                    "timesheet read failed, treating the whole window as unfilled: {}",
                    e
                );
                HashSet::new()
            }
        }
    }

    fn record_outcome(&self, success: bool, message: &str) {
        if let Err(e) = self.store.set_task_outcome(success, message) {
            error!("could not persist run outcome: {}", e);
        }
    }
}
