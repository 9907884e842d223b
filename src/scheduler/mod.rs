// src/scheduler/mod.rs
//! # Job scheduler
//! Owns every `SourceRecord` and dispatches runs on a timer or on demand.
//!
//! Dispatch checks, in order: global pause, source status (and not already running, under
//! the same lock), then a concurrency permit. Completion bookkeeping (failure counter,
//! health, circuit breaker) happens under the registry lock so a concurrent dispatch
//! never sees a half-updated source.

pub mod schedule;

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::extract::ResponseCache;
use crate::notify::{NotifierMux, SourceAlert};
use crate::state::{RunResult, RunStatus, SourceType};
use crate::storage::{HealthStatus, SourceId, Storage};
use crate::workflow::{ProgressEvent, ProgressSink};

pub use schedule::{CronExpr, Schedule};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    #[default]
    Active,
    Paused,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: SourceId,
    pub name: String,
    pub url: String,
    pub source_type: SourceType,
    #[serde(default)]
    pub status: SourceStatus,
    #[serde(default = "pending")]
    pub health_status: HealthStatus,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub schedule: Schedule,
    #[serde(default)]
    pub last_run_outcome: Option<RunStatus>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub extraction_instructions: Option<String>,
    #[serde(default)]
    pub max_articles: Option<usize>,
}

fn pending() -> HealthStatus {
    HealthStatus::Pending
}

impl SourceRecord {
    pub fn new(
        id: SourceId,
        name: impl Into<String>,
        url: impl Into<String>,
        source_type: SourceType,
        schedule: Schedule,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            url: url.into(),
            source_type,
            status: SourceStatus::Active,
            health_status: HealthStatus::Pending,
            consecutive_failures: 0,
            schedule,
            last_run_outcome: None,
            last_error: None,
            last_run_at: None,
            next_run_at: None,
            extraction_instructions: None,
            max_articles: None,
        }
    }
}

/// Executes one run for a source. Implemented by the workflow orchestrator; tests plug in
/// scripted runners.
#[async_trait]
pub trait SourceRunner: Send + Sync {
    async fn run_source(&self, source: &SourceRecord, progress: ProgressSink) -> RunResult;

    /// Health check before a run; `Err` fails the run without executing it.
    async fn preflight(&self) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Scheduled,
    Manual,
}

impl Trigger {
    fn as_str(self) -> &'static str {
        match self {
            Trigger::Scheduled => "scheduled",
            Trigger::Manual => "manual",
        }
    }
}

/// What a scheduled dispatch does when every permit is taken. Manual triggers always wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SaturationPolicy {
    #[default]
    Wait,
    Skip,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Completed(RunResult),
    SkippedPaused,
    SkippedInactive(SourceStatus),
    SkippedAlreadyRunning,
    SkippedSaturated,
    UnknownSource,
}

impl DispatchOutcome {
    pub fn skip_reason(&self) -> Option<&'static str> {
        match self {
            DispatchOutcome::Completed(_) => None,
            DispatchOutcome::SkippedPaused => Some("scheduler paused"),
            DispatchOutcome::SkippedInactive(_) => Some("source not active"),
            DispatchOutcome::SkippedAlreadyRunning => Some("source already running"),
            DispatchOutcome::SkippedSaturated => Some("no free run slot"),
            DispatchOutcome::UnknownSource => Some("unknown source"),
        }
    }

    pub fn result(&self) -> Option<&RunResult> {
        match self {
            DispatchOutcome::Completed(r) => Some(r),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("unknown source {0}")]
    UnknownSource(SourceId),
    #[error("source {0} already registered")]
    DuplicateSource(SourceId),
    #[error(transparent)]
    InvalidSchedule(#[from] schedule::CronParseError),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Concurrency permits (K).
    pub max_concurrent: usize,
    /// Consecutive failed runs before a source is paused.
    pub failure_threshold: u32,
    pub run_timeout_secs: u64,
    pub tick_secs: u64,
    pub saturation: SaturationPolicy,
    pub preflight: bool,
    pub start_paused: bool,
    pub maintenance_cron: String,
    pub retention_days: i64,
}

impl SchedulerConfig {
    /// The maintenance cron, or the default when it does not parse or never fires.
    pub fn maintenance_schedule(&self) -> Schedule {
        let schedule = Schedule::Cron(self.maintenance_cron.clone());
        if schedule.validate().is_ok() && schedule.next_after(Utc::now()).is_some() {
            schedule
        } else {
            Schedule::Cron(Self::default().maintenance_cron)
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            failure_threshold: 5,
            run_timeout_secs: 600,
            tick_secs: 30,
            saturation: SaturationPolicy::Wait,
            preflight: true,
            start_paused: false,
            maintenance_cron: "0 3 * * *".to_string(),
            retention_days: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub cache_entries_purged: usize,
    pub articles_purged: usize,
}

#[derive(Debug, Default)]
struct Registry {
    sources: BTreeMap<SourceId, SourceRecord>,
    running: HashSet<SourceId>,
}

struct Inner {
    registry: Mutex<Registry>,
    permits: Arc<Semaphore>,
    paused: AtomicBool,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    next_maintenance: Mutex<Option<DateTime<Utc>>>,
    runner: Arc<dyn SourceRunner>,
    storage: Arc<dyn Storage>,
    notifiers: NotifierMux,
    cache: Option<Arc<ResponseCache>>,
    cfg: SchedulerConfig,
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        // A panic while holding the lock leaves plain data behind; keep going with it.
        self.registry.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Clears the "running" mark on every exit path, including cancellation.
struct RunningGuard {
    inner: Arc<Inner>,
    id: SourceId,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.inner.registry().running.remove(&self.id);
    }
}

/// Tracks in-flight runs for the concurrency gauge.
struct InFlight {
    inner: Arc<Inner>,
    _permit: OwnedSemaphorePermit,
}

impl InFlight {
    fn start(inner: Arc<Inner>, permit: OwnedSemaphorePermit) -> Self {
        let now = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        inner.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        gauge!("scheduler_runs_in_flight").set(now as f64);
        Self {
            inner,
            _permit: permit,
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let now = self.inner.in_flight.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        gauge!("scheduler_runs_in_flight").set(now as f64);
    }
}

#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<Inner>,
}

impl JobScheduler {
    pub fn new(
        mut cfg: SchedulerConfig,
        runner: Arc<dyn SourceRunner>,
        storage: Arc<dyn Storage>,
        notifiers: NotifierMux,
    ) -> Self {
        if let Schedule::Cron(expr) = cfg.maintenance_schedule() {
            if expr != cfg.maintenance_cron {
                warn!(expr = %cfg.maintenance_cron, fallback = %expr, "unusable maintenance cron");
                cfg.maintenance_cron = expr;
            }
        }
        let permits = Arc::new(Semaphore::new(cfg.max_concurrent.max(1)));
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry::default()),
                permits,
                paused: AtomicBool::new(cfg.start_paused),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
                next_maintenance: Mutex::new(None),
                runner,
                storage,
                notifiers,
                cache: None,
                cfg,
            }),
        }
    }

    /// Attach the extraction cache purged by the maintenance job. Call before sharing.
    pub fn with_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.cache = Some(cache);
        }
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.cfg
    }

    // ----- source registry -----

    pub fn add_source(&self, mut source: SourceRecord) -> Result<(), SchedulerError> {
        source.schedule.validate()?;
        let mut reg = self.inner.registry();
        if reg.sources.contains_key(&source.id) {
            return Err(SchedulerError::DuplicateSource(source.id));
        }
        if source.next_run_at.is_none() {
            source.next_run_at = Some(Utc::now());
        }
        info!(source_id = source.id, name = %source.name, schedule = %source.schedule, "source registered");
        reg.sources.insert(source.id, source);
        Ok(())
    }

    /// Soft delete: the record stays visible with status `deleted` and is never dispatched.
    pub fn remove_source(&self, id: SourceId) -> Result<(), SchedulerError> {
        let mut reg = self.inner.registry();
        let src = reg
            .sources
            .get_mut(&id)
            .ok_or(SchedulerError::UnknownSource(id))?;
        src.status = SourceStatus::Deleted;
        src.next_run_at = None;
        Ok(())
    }

    pub fn get_source(&self, id: SourceId) -> Option<SourceRecord> {
        self.inner.registry().sources.get(&id).cloned()
    }

    pub fn list_sources(&self) -> Vec<SourceRecord> {
        self.inner.registry().sources.values().cloned().collect()
    }

    /// Manual reactivation of a paused source. The failure counter is kept; only a
    /// successful run resets it.
    pub fn reactivate(&self, id: SourceId) -> Result<SourceRecord, SchedulerError> {
        let mut reg = self.inner.registry();
        let src = reg
            .sources
            .get_mut(&id)
            .ok_or(SchedulerError::UnknownSource(id))?;
        if src.status == SourceStatus::Paused {
            src.status = SourceStatus::Active;
            src.next_run_at = Some(Utc::now());
            info!(source_id = id, failures = src.consecutive_failures, "source reactivated");
        }
        Ok(src.clone())
    }

    // ----- global pause -----

    pub fn pause_all(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
        info!("scheduler paused");
    }

    pub fn resume_all(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        info!("scheduler resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous runs observed since start.
    pub fn peak_in_flight(&self) -> usize {
        self.inner.peak_in_flight.load(Ordering::SeqCst)
    }

    // ----- dispatch -----

    /// Run now, bypassing the schedule but not pause, status or concurrency.
    pub async fn trigger_now(&self, id: SourceId, progress: ProgressSink) -> DispatchOutcome {
        self.dispatch(id, Trigger::Manual, progress).await
    }

    pub async fn dispatch(
        &self,
        id: SourceId,
        trigger: Trigger,
        progress: ProgressSink,
    ) -> DispatchOutcome {
        let outcome = self.dispatch_inner(id, trigger, progress.clone()).await;
        if let Some(reason) = outcome.skip_reason() {
            debug!(source_id = id, trigger = trigger.as_str(), reason, "dispatch skipped");
            counter!("scheduler_dispatch_skipped_total", "reason" => reason).increment(1);
            progress.emit(ProgressEvent::error(format!("Run not started: {reason}")));
        }
        outcome
    }

    async fn dispatch_inner(
        &self,
        id: SourceId,
        trigger: Trigger,
        progress: ProgressSink,
    ) -> DispatchOutcome {
        if self.is_paused() {
            return DispatchOutcome::SkippedPaused;
        }

        // Status check and "running" mark under one lock.
        {
            let mut reg = self.inner.registry();
            let Some(status) = reg.sources.get(&id).map(|s| s.status) else {
                return DispatchOutcome::UnknownSource;
            };
            if status != SourceStatus::Active {
                return DispatchOutcome::SkippedInactive(status);
            }
            if !reg.running.insert(id) {
                return DispatchOutcome::SkippedAlreadyRunning;
            }
        }
        let _running = RunningGuard {
            inner: self.inner.clone(),
            id,
        };

        let permit = match (trigger, self.inner.cfg.saturation) {
            (Trigger::Scheduled, SaturationPolicy::Skip) => {
                match self.inner.permits.clone().try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => return DispatchOutcome::SkippedSaturated,
                }
            }
            _ => match self.inner.permits.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => return DispatchOutcome::SkippedSaturated,
            },
        };

        // Things may have changed while waiting for the permit.
        if self.is_paused() {
            return DispatchOutcome::SkippedPaused;
        }
        let source = match self.inner.registry().sources.get(&id) {
            Some(s) if s.status == SourceStatus::Active => s.clone(),
            Some(s) => return DispatchOutcome::SkippedInactive(s.status),
            None => return DispatchOutcome::UnknownSource,
        };

        let flight = InFlight::start(self.inner.clone(), permit);
        info!(source_id = id, trigger = trigger.as_str(), url = %source.url, "run dispatched");
        let result = self.execute(&source, progress.clone()).await;
        drop(flight);

        self.complete(&source, &result).await;
        DispatchOutcome::Completed(result)
    }

    async fn execute(&self, source: &SourceRecord, progress: ProgressSink) -> RunResult {
        if self.inner.cfg.preflight {
            if let Err(reason) = self.inner.runner.preflight().await {
                warn!(source_id = source.id, %reason, "preflight failed");
                let result = RunResult::failed(source.id, reason);
                progress.emit(ProgressEvent::init(source.id, &source.url));
                progress.emit(ProgressEvent::finished(&result, &source.url));
                return result;
            }
        }

        let limit = Duration::from_secs(self.inner.cfg.run_timeout_secs.max(1));
        match tokio::time::timeout(limit, self.inner.runner.run_source(source, progress.clone())).await
        {
            Ok(result) => result,
            Err(_) => {
                error!(source_id = source.id, timeout_secs = limit.as_secs(), "run timed out");
                counter!("scheduler_run_timeouts_total").increment(1);
                let result = RunResult::failed(
                    source.id,
                    format!("run timed out after {}s", limit.as_secs()),
                );
                progress.emit(ProgressEvent::finished(&result, &source.url));
                result
            }
        }
    }

    /// Failure bookkeeping + circuit breaker, then health report and alert.
    async fn complete(&self, source: &SourceRecord, result: &RunResult) {
        let now = Utc::now();
        let failed = result.status.is_failure();
        let alert = {
            let mut reg = self.inner.registry();
            let Some(src) = reg.sources.get_mut(&source.id) else {
                return;
            };
            src.last_run_at = Some(now);
            src.last_run_outcome = Some(result.status);
            let mut alert = None;
            if failed {
                src.consecutive_failures += 1;
                src.health_status = HealthStatus::Error;
                src.last_error = result.last_error().map(str::to_string);
                if src.consecutive_failures >= self.inner.cfg.failure_threshold
                    && src.status == SourceStatus::Active
                {
                    src.status = SourceStatus::Paused;
                    warn!(
                        source_id = src.id,
                        failures = src.consecutive_failures,
                        "circuit breaker tripped, source paused"
                    );
                    counter!("scheduler_sources_paused_total").increment(1);
                    alert = Some(SourceAlert {
                        source_id: src.id,
                        source_name: src.name.clone(),
                        url: src.url.clone(),
                        consecutive_failures: src.consecutive_failures,
                        last_error: src.last_error.clone(),
                        ts: now,
                    });
                }
            } else {
                src.consecutive_failures = 0;
                src.health_status = HealthStatus::Healthy;
                src.last_error = None;
            }
            if src.status == SourceStatus::Active {
                src.next_run_at = src.schedule.next_after(now);
            }
            alert
        };

        let (status, error) = if failed {
            (HealthStatus::Error, result.last_error().map(str::to_string))
        } else {
            (HealthStatus::Healthy, None)
        };
        if let Err(e) = self
            .inner
            .storage
            .update_source_health(source.id, status, error)
            .await
        {
            warn!(source_id = source.id, error = %e, "health update failed");
        }

        if let Some(alert) = alert {
            self.inner.notifiers.broadcast(&alert).await;
        }
    }

    // ----- timer -----

    /// Active, idle sources whose `next_run_at` has passed.
    pub fn due_sources(&self, now: DateTime<Utc>) -> Vec<SourceId> {
        let reg = self.inner.registry();
        reg.sources
            .values()
            .filter(|s| s.status == SourceStatus::Active)
            .filter(|s| !reg.running.contains(&s.id))
            .filter(|s| s.next_run_at.is_some_and(|t| t <= now))
            .map(|s| s.id)
            .collect()
    }

    /// One timer tick: dispatch due sources in the background, run maintenance when due.
    /// While paused nothing is dispatched and no source state changes.
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<JoinHandle<DispatchOutcome>> {
        self.maybe_run_maintenance(now).await;

        let due = self.due_sources(now);
        if self.is_paused() {
            if !due.is_empty() {
                debug!(due = due.len(), "tick skipped: scheduler paused");
                counter!("scheduler_dispatch_skipped_total", "reason" => "scheduler paused")
                    .increment(due.len() as u64);
            }
            return Vec::new();
        }

        let mut handles = Vec::with_capacity(due.len());
        for id in due {
            {
                let mut reg = self.inner.registry();
                if let Some(src) = reg.sources.get_mut(&id) {
                    src.next_run_at = src.schedule.next_after(now);
                }
            }
            let this = self.clone();
            handles.push(tokio::spawn(async move {
                this.dispatch(id, Trigger::Scheduled, ProgressSink::noop()).await
            }));
        }
        handles
    }

    async fn maybe_run_maintenance(&self, now: DateTime<Utc>) {
        let due = {
            let mut next = self
                .inner
                .next_maintenance
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            let schedule = Schedule::Cron(self.inner.cfg.maintenance_cron.clone());
            match *next {
                None => {
                    *next = schedule.next_after(now);
                    false
                }
                Some(at) if at <= now => {
                    *next = schedule.next_after(now);
                    true
                }
                Some(_) => false,
            }
        };
        if due {
            self.run_maintenance(now).await;
        }
    }

    /// Purge cache entries and stored articles older than the retention window.
    pub async fn run_maintenance(&self, now: DateTime<Utc>) -> MaintenanceReport {
        let cutoff = now - chrono::Duration::days(self.inner.cfg.retention_days.max(1));
        let cache_entries_purged = self
            .inner
            .cache
            .as_ref()
            .map(|c| c.purge_older_than(cutoff))
            .unwrap_or(0);
        let articles_purged = match self.inner.storage.purge_older_than(cutoff).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "article retention purge failed");
                0
            }
        };
        info!(cache_entries_purged, articles_purged, %cutoff, "maintenance done");
        MaintenanceReport {
            cache_entries_purged,
            articles_purged,
        }
    }

    /// Background timer loop until `shutdown` flips to true.
    pub fn spawn(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let this = self.clone();
        let period = Duration::from_secs(self.inner.cfg.tick_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(tick_secs = period.as_secs(), "scheduler loop started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let _ = this.tick(Utc::now()).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("scheduler loop stopped");
                            break;
                        }
                    }
                }
            }
        })
    }
}
