//! Periodic and cron-driven background jobs
//!
//! Every registered job gets its own timer task. A fire is admitted with a
//! compare-and-swap on the job's running count, so a job never runs more
//! copies than its `concurrency_limit`; fires that arrive while the job is
//! saturated are skipped or queued according to its `CatchUpPolicy`.

use super::cron::CronSchedule;
use super::health::{ComponentType, HealthRegistry, HealthReport, HealthStatus};
use super::lifecycle::{Component, CoreContext};
use crate::backoff::ExponentialBackoff;
use crate::error::{CoreError, SchedulerError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

#[derive(Debug, Clone)]
pub enum Schedule {
    Interval(Duration),
    Cron(CronSchedule),
}

impl Schedule {
    pub fn every(period: Duration) -> Self {
        Schedule::Interval(period)
    }

    pub fn cron(expr: &str) -> Result<Self, SchedulerError> {
        Ok(Schedule::Cron(CronSchedule::parse(expr)?))
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(100),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// What happens to a fire while the job is already at its concurrency limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CatchUpPolicy {
    #[default]
    SkipIfRunning,
    /// Run later, keeping at most `max_pending` fires waiting
    Queue { max_pending: usize },
}

#[async_trait]
pub trait JobTask: Send + Sync {
    async fn run(&self) -> Result<(), CoreError>;
}

#[async_trait]
impl<F, Fut> JobTask for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), CoreError>> + Send,
{
    async fn run(&self) -> Result<(), CoreError> {
        (self)().await
    }
}

#[derive(Clone)]
pub struct Job {
    pub name: String,
    pub schedule: Schedule,
    pub target: Arc<dyn JobTask>,
    pub concurrency_limit: usize,
    pub retry_policy: RetryPolicy,
    pub catch_up: CatchUpPolicy,
}

impl Job {
    pub fn new(name: impl Into<String>, schedule: Schedule, target: impl JobTask + 'static) -> Self {
        Self {
            name: name.into(),
            schedule,
            target: Arc::new(target),
            concurrency_limit: 1,
            retry_policy: RetryPolicy::default(),
            catch_up: CatchUpPolicy::default(),
        }
    }

    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit.max(1);
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_catch_up(mut self, policy: CatchUpPolicy) -> Self {
        self.catch_up = policy;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobStats {
    pub runs: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub skipped: u64,
    pub queued: u64,
    pub last_error: Option<String>,
    pub last_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    Started,
    Queued,
    Skipped,
}

struct JobState {
    job: Job,
    running: AtomicUsize,
    pending: AtomicUsize,
    stats: Mutex<JobStats>,
    runs: Mutex<JoinSet<()>>,
    health: Arc<HealthRegistry>,
}

impl JobState {
    fn fire(self: &Arc<Self>) -> FireOutcome {
        let limit = self.job.concurrency_limit;
        let mut current = self.running.load(Ordering::Acquire);
        while current < limit {
            match self
                .running
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    let state = Arc::clone(self);
                    let mut runs = self.runs.lock();
                    while runs.try_join_next().is_some() {}
                    runs.spawn(async move { state.run_slot().await });
                    return FireOutcome::Started;
                }
                Err(actual) => current = actual,
            }
        }

        if let CatchUpPolicy::Queue { max_pending } = self.job.catch_up {
            let admitted = self
                .pending
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| (p < max_pending).then_some(p + 1))
                .is_ok();
            if admitted {
                self.stats.lock().queued += 1;
                return FireOutcome::Queued;
            }
        }

        self.stats.lock().skipped += 1;
        log::debug!("⏭️  Job '{}' still running, fire skipped", self.job.name);
        FireOutcome::Skipped
    }

    /// Holds one running slot; drains queued fires before releasing it
    async fn run_slot(self: Arc<Self>) {
        let _slot = RunningSlot(&self.running);
        loop {
            self.execute().await;
            let took_pending = self
                .pending
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| p.checked_sub(1))
                .is_ok();
            if !took_pending {
                break;
            }
        }
    }

    async fn execute(&self) {
        let name = &self.job.name;
        let policy = &self.job.retry_policy;
        let mut backoff = ExponentialBackoff::new(policy.initial_backoff, policy.max_backoff, policy.max_retries);
        self.stats.lock().runs += 1;

        loop {
            let outcome = AssertUnwindSafe(self.job.target.run()).catch_unwind().await;
            let error = match outcome {
                Ok(Ok(())) => {
                    let mut stats = self.stats.lock();
                    stats.successes += 1;
                    stats.last_run = Some(Utc::now());
                    drop(stats);
                    self.health.report_success(name);
                    return;
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => "job panicked".to_string(),
            };

            match backoff.next_delay() {
                Ok(delay) => {
                    self.stats.lock().retries += 1;
                    log::warn!(
                        "⚠️  Job '{}' failed ({}), retry {} in {}ms",
                        name,
                        error,
                        backoff.attempts(),
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(_) => {
                    let mut stats = self.stats.lock();
                    stats.failures += 1;
                    stats.last_error = Some(error.clone());
                    stats.last_run = Some(Utc::now());
                    drop(stats);
                    log::error!("❌ Job '{}' failed after {} retries: {}", name, policy.max_retries, error);
                    self.health.report_failure(name, &error, HealthStatus::Unhealthy);
                    return;
                }
            }
        }
    }
}

/// Gives a running slot back even when the run is cancelled
struct RunningSlot<'a>(&'a AtomicUsize);

impl Drop for RunningSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn timer_loop(state: Arc<JobState>, mut shutdown: watch::Receiver<bool>) {
    match state.job.schedule.clone() {
        Schedule::Interval(period) => {
            let start = tokio::time::Instant::now() + period;
            let mut timer = tokio::time::interval_at(start, period);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = timer.tick() => { state.fire(); }
                    _ = shutdown.changed() => break,
                }
            }
        }
        Schedule::Cron(cron) => loop {
            let now = Utc::now();
            let Some(next) = cron.next_after(now) else {
                log::warn!("⚠️  Cron '{}' for job '{}' never fires again", cron, state.job.name);
                break;
            };
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = tokio::time::sleep(wait) => { state.fire(); }
                _ = shutdown.changed() => break,
            }
        },
    }
}

pub struct Scheduler {
    jobs: RwLock<BTreeMap<String, Arc<JobState>>>,
    health: Arc<HealthRegistry>,
    shutdown: watch::Sender<bool>,
    timers: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
    grace: Duration,
}

impl Scheduler {
    pub fn new(health: Arc<HealthRegistry>, grace: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            jobs: RwLock::new(BTreeMap::new()),
            health,
            shutdown,
            timers: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            grace,
        }
    }

    pub fn register(&self, job: Job) -> Result<(), SchedulerError> {
        let mut jobs = self.jobs.write();
        if jobs.contains_key(&job.name) {
            return Err(SchedulerError::DuplicateJob(job.name));
        }

        self.health.register(&job.name, ComponentType::Scheduler);
        let name = job.name.clone();
        let state = Arc::new(JobState {
            job,
            running: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            stats: Mutex::new(JobStats::default()),
            runs: Mutex::new(JoinSet::new()),
            health: self.health.clone(),
        });

        if self.running.load(Ordering::Acquire) {
            self.spawn_timer(&state);
        }
        jobs.insert(name, state);
        Ok(())
    }

    /// Begin firing every registered job on its schedule
    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.send_replace(false);
        let jobs: Vec<Arc<JobState>> = self.jobs.read().values().cloned().collect();
        for state in &jobs {
            self.spawn_timer(state);
        }
        log::info!("⏰ Scheduler started with {} jobs", jobs.len());
    }

    fn spawn_timer(&self, state: &Arc<JobState>) {
        self.health.set_status(&state.job.name, HealthStatus::Healthy, None);
        let handle = tokio::spawn(timer_loop(Arc::clone(state), self.shutdown.subscribe()));
        self.timers.lock().push(handle);
    }

    /// Stop timers, give in-flight runs up to `grace`, then cancel them
    pub async fn stop(&self, grace: Duration) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shutdown.send_replace(true);

        let timers: Vec<JoinHandle<()>> = self.timers.lock().drain(..).collect();
        for handle in timers {
            let _ = handle.await;
        }

        let jobs: Vec<Arc<JobState>> = self.jobs.read().values().cloned().collect();
        let deadline = tokio::time::Instant::now() + grace;
        for state in jobs {
            let mut runs = std::mem::take(&mut *state.runs.lock());
            let drained = tokio::time::timeout_at(deadline, async {
                while runs.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                log::warn!("⚠️  Job '{}' still running after grace period, cancelling", state.job.name);
                runs.abort_all();
                while runs.join_next().await.is_some() {}
            }
            state.pending.store(0, Ordering::Release);
            self.health.set_status(&state.job.name, HealthStatus::Stopped, None);
        }
        log::info!("⏰ Scheduler stopped");
    }

    /// Fire a job now, under the same concurrency rules as its schedule
    pub fn trigger(&self, name: &str) -> Result<FireOutcome, SchedulerError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(SchedulerError::NotRunning);
        }
        let state = self
            .jobs
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownJob(name.to_string()))?;
        Ok(state.fire())
    }

    pub fn stats(&self, name: &str) -> Option<JobStats> {
        self.jobs.read().get(name).map(|s| s.stats.lock().clone())
    }

    pub fn job_names(&self) -> Vec<String> {
        self.jobs.read().keys().cloned().collect()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Component for Scheduler {
    fn name(&self) -> &str {
        "scheduler"
    }

    fn component_type(&self) -> ComponentType {
        ComponentType::Scheduler
    }

    async fn start(&self, _ctx: &CoreContext) -> Result<(), CoreError> {
        Scheduler::start(self);
        Ok(())
    }

    async fn stop(&self) -> Result<(), CoreError> {
        Scheduler::stop(self, self.grace).await;
        Ok(())
    }

    async fn health(&self) -> HealthReport {
        if !self.is_running() {
            return HealthReport::with_status(HealthStatus::Stopped, "not running");
        }
        let jobs = self.jobs.read();
        let failing: Vec<&str> = jobs
            .values()
            .filter(|s| {
                self.health
                    .get(&s.job.name)
                    .map(|h| h.status == HealthStatus::Unhealthy)
                    .unwrap_or(false)
            })
            .map(|s| s.job.name.as_str())
            .collect();
        if failing.is_empty() {
            HealthReport::with_status(HealthStatus::Healthy, format!("{} jobs", jobs.len()))
        } else {
            HealthReport::with_status(HealthStatus::Degraded, format!("failing jobs: {}", failing.join(", ")))
        }
    }
}
