//! Scheduler engine: single-writer mutation lane, trigger sources, run
//! queue + dispatcher, and lifecycle control.
//!
//! Every state transition (create/remove/enable/rename, timer and cron
//! fires, post-run bookkeeping, startup recovery) funnels through one
//! `tokio::sync::Mutex` over [`EngineState`], so mutations are
//! linearized no matter how many trigger tasks race. Disk writes happen
//! on a dedicated persist task fed in mutation order, and the executor
//! runs outside the lock so slow runs never stall admin calls.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use marvin_core::config::SchedulerConfig;

use crate::error::{Result, SchedulerError};
use crate::schedule::{every_fire_after, initial_next_run, next_cron_fire};
use crate::store::{JobStore, StoreSnapshot, STORE_VERSION};
use crate::timer::{now_ms, sleep_until_ms, TimerHandle};
use crate::types::{
    generate_job_id, resolve_name, CreateJob, Executor, Job, RunContext, RunOutcome, RunPolicy,
    RunRequest, RunSource, RunStatus, Schedule, ServiceStatus, TenantId,
};

/// Fires within this window of the target count as on time; anything
/// earlier is a spurious wake and the timer re-arms.
const EARLY_FIRE_TOLERANCE_MS: i64 = 1_000;
/// Floor for the per-run executor timeout.
const MIN_RUN_TIMEOUT_MS: i64 = 5_000;
/// How long `stop()` waits for in-flight runs before tearing down.
const DRAIN_DEADLINE_MS: i64 = 10_000;
const DRAIN_POLL_MS: u64 = 50;

enum PersistMsg {
    Snapshot(StoreSnapshot),
    Flush(oneshot::Sender<()>),
}

/// Mutable engine state, guarded by the serializer mutex.
#[derive(Default)]
struct EngineState {
    started: bool,
    jobs: HashMap<String, Job>,
    /// One armed single-shot timer per At/Every job (also retry timers).
    timers: HashMap<String, TimerHandle>,
    /// One live cron tick task per cron job.
    crons: HashMap<String, TimerHandle>,
    /// Job ids with a run request waiting in the dispatch queue.
    queued: HashSet<String>,
}

struct Inner {
    cfg: SchedulerConfig,
    defaults: RunPolicy,
    store: JobStore,
    state: Mutex<EngineState>,
    run_tx: mpsc::UnboundedSender<RunRequest>,
    persist_tx: mpsc::UnboundedSender<PersistMsg>,
    executor: std::sync::RwLock<Option<Arc<dyn Executor>>>,
    stopping: AtomicBool,
    active_runs: AtomicUsize,
}

impl Inner {
    fn stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Queue a run request, collapsing duplicate triggers: a job that is
    /// already queued or running never gets a second request.
    fn enqueue_run(
        &self,
        st: &mut EngineState,
        job_id: &str,
        source: RunSource,
        scheduled_at_ms: i64,
        force: bool,
    ) -> bool {
        if self.stopping() || !st.started || !self.cfg.enabled {
            return false;
        }
        let Some(job) = st.jobs.get(job_id) else {
            return false;
        };
        if job.state.running_run_id.is_some() || st.queued.contains(job_id) {
            debug!(job_id = %job_id, %source, "trigger coalesced; run already queued or in flight");
            return false;
        }
        st.queued.insert(job_id.to_string());
        let _ = self.run_tx.send(RunRequest {
            job_id: job_id.to_string(),
            source,
            scheduled_at_ms,
            force,
        });
        true
    }

    /// Snapshot the job map and hand it to the persist task. Called with
    /// the serializer held, so snapshot order equals mutation order.
    fn persist_locked(&self, st: &EngineState) {
        let mut jobs: Vec<Job> = st.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        let _ = self.persist_tx.send(PersistMsg::Snapshot(StoreSnapshot {
            version: STORE_VERSION,
            updated_at_ms: now_ms(),
            jobs,
        }));
    }

    /// Cancel and forget any armed timer or cron handle for `job_id`.
    fn cancel_triggers(&self, st: &mut EngineState, job_id: &str) {
        if let Some(timer) = st.timers.remove(job_id) {
            timer.cancel();
        }
        if let Some(cron) = st.crons.remove(job_id) {
            cron.cancel();
        }
    }
}

/// Persistent per-tenant job scheduler.
///
/// Construct with [`Scheduler::new`] inside a tokio runtime, inject an
/// executor, then call [`Scheduler::start`].
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Build the scheduler and spawn its dispatcher and persist loops.
    /// Nothing fires until [`Scheduler::start`].
    pub fn new(cfg: SchedulerConfig) -> Self {
        let store = JobStore::new(&cfg.store_path, &cfg.bot_name);
        let (run_tx, run_rx) = mpsc::unbounded_channel();
        let (persist_tx, persist_rx) = mpsc::unbounded_channel();

        let defaults = RunPolicy {
            max_lateness_ms: cfg.default_policy.max_lateness_ms.max(0),
            retry_max: cfg.default_policy.retry_max,
            retry_backoff_ms: cfg.default_policy.retry_backoff_ms.max(1000),
            delete_after_run: cfg.default_policy.delete_after_run,
        };

        let inner = Arc::new(Inner {
            cfg,
            defaults,
            store: store.clone(),
            state: Mutex::new(EngineState::default()),
            run_tx,
            persist_tx,
            executor: std::sync::RwLock::new(None),
            stopping: AtomicBool::new(false),
            active_runs: AtomicUsize::new(0),
        });

        tokio::spawn(dispatch_loop(Arc::downgrade(&inner), run_rx));
        tokio::spawn(persist_loop(store, persist_rx));

        Self { inner }
    }

    /// Service-level kill switch, read-only.
    pub fn is_enabled(&self) -> bool {
        self.inner.cfg.enabled
    }

    /// Timezone applied to cron jobs that do not name one.
    pub fn default_timezone(&self) -> &str {
        &self.inner.cfg.default_timezone
    }

    /// Inject the execution capability. Replaces any previous executor.
    pub fn set_executor(&self, executor: Arc<dyn Executor>) {
        *self.inner.executor.write().unwrap() = Some(executor);
    }

    /// Load the store, repair dangling runs from a previous process, and
    /// arm triggers for every enabled job. Idempotent: a started
    /// scheduler returns immediately.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let mut st = inner.state.lock().await;
        if st.started {
            return Ok(());
        }
        inner.stopping.store(false, Ordering::SeqCst);

        // Disk is authoritative for ids we do not already hold; jobs
        // created before start() stay as-is.
        for job in inner.store.load().await {
            st.jobs.entry(job.id.clone()).or_insert(job);
        }

        let mut dirty = false;
        let now = now_ms();
        for job in st.jobs.values_mut() {
            if let Some(run_id) = job.state.running_run_id.take() {
                warn!(job_id = %job.id, %run_id, "previous process exited mid-run; recording failure");
                job.state.running_at_ms = None;
                job.state.last_status = Some(RunStatus::Error);
                job.state.last_error = Some("previous process exited during run".to_string());
                job.state.consecutive_failures = job.state.consecutive_failures.saturating_add(1);
                if job.enabled && job.state.next_run_at_ms == 0 {
                    job.state.next_run_at_ms = initial_next_run(&job.schedule, now);
                }
                job.touch(now);
                dirty = true;
            }
        }

        st.started = true;

        if !inner.cfg.enabled {
            info!("scheduler disabled by config; jobs loaded but no triggers armed");
            if dirty {
                inner.persist_locked(&st);
            }
            return Ok(());
        }

        // Catch-up pass: one fire for At/Every jobs that came due while
        // the process was down (At only inside its lateness window),
        // then arm everything.
        let ids: Vec<String> = st.jobs.keys().cloned().collect();
        for id in &ids {
            let now = now_ms();
            let mut catchup: Option<i64> = None;
            let mut timer_target: Option<i64> = None;
            let mut want_cron = false;
            {
                let Some(job) = st.jobs.get_mut(id) else { continue };
                if !job.enabled {
                    if job.state.next_run_at_ms != 0 {
                        job.state.next_run_at_ms = 0;
                        job.touch(now);
                        dirty = true;
                    }
                    continue;
                }
                match job.schedule.clone() {
                    Schedule::At { at_ms } => {
                        if at_ms <= now {
                            let lateness = now - at_ms;
                            if lateness > job.policy.max_lateness_ms {
                                info!(
                                    job_id = %job.id,
                                    lateness_ms = lateness,
                                    "one-shot job missed its lateness window; disabling"
                                );
                                job.enabled = false;
                                job.state.next_run_at_ms = 0;
                                job.state.last_status = Some(RunStatus::Missed);
                                job.touch(now);
                                dirty = true;
                            } else {
                                job.state.next_run_at_ms = at_ms;
                                catchup = Some(at_ms);
                            }
                        } else {
                            if job.state.next_run_at_ms != at_ms {
                                job.state.next_run_at_ms = at_ms;
                                dirty = true;
                            }
                            timer_target = Some(at_ms);
                        }
                    }
                    Schedule::Every { every_ms, anchor_ms } => {
                        let stored = job.state.next_run_at_ms;
                        if stored != 0 && stored <= now {
                            catchup = Some(stored);
                        }
                        let next = if catchup.is_some() {
                            every_fire_after(anchor_ms, every_ms, now)
                        } else {
                            initial_next_run(&job.schedule, now)
                        };
                        if job.state.next_run_at_ms != next {
                            job.state.next_run_at_ms = next;
                            dirty = true;
                        }
                        timer_target = Some(next);
                    }
                    Schedule::Cron { .. } => {
                        want_cron = true;
                    }
                }
            }
            if let Some(scheduled_at) = catchup {
                inner.enqueue_run(&mut st, id, RunSource::StartupCatchup, scheduled_at, false);
            }
            if let Some(target) = timer_target {
                arm_timer(inner, &mut st, id, target, RunSource::Timer);
            }
            if want_cron {
                arm_cron(inner, &mut st, id);
                dirty = true;
            }
        }

        if dirty {
            inner.persist_locked(&st);
        }
        info!(jobs = st.jobs.len(), "scheduler started");
        Ok(())
    }

    /// Cancel every trigger and wait (bounded) for in-flight runs.
    /// Running dispatches are left to finalize on their own; the drain
    /// gives them up to 10 seconds before teardown proceeds regardless.
    pub async fn stop(&self) {
        let inner = &self.inner;
        {
            let mut st = inner.state.lock().await;
            if !st.started {
                return;
            }
            st.started = false;
            inner.stopping.store(true, Ordering::SeqCst);
            for (_, timer) in st.timers.drain() {
                timer.cancel();
            }
            for (_, cron) in st.crons.drain() {
                cron.cancel();
            }
            st.queued.clear();
            info!("scheduler stopping; triggers cancelled");
        }

        let deadline = now_ms() + DRAIN_DEADLINE_MS;
        while inner.active_runs.load(Ordering::SeqCst) > 0 && now_ms() < deadline {
            tokio::time::sleep(Duration::from_millis(DRAIN_POLL_MS)).await;
        }
        if inner.active_runs.load(Ordering::SeqCst) > 0 {
            warn!("stop deadline reached with runs still in flight");
        }

        // Flush queued snapshots so on-disk state is current on return.
        let (ack_tx, ack_rx) = oneshot::channel();
        if inner.persist_tx.send(PersistMsg::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
        info!("scheduler stopped");
    }

    /// Validate, persist, and (when running) arm a new job.
    pub async fn create(&self, input: CreateJob) -> Result<Job> {
        let inner = &self.inner;
        let now = now_ms();

        let prompt = input.prompt.trim().to_string();
        if prompt.is_empty() {
            return Err(SchedulerError::InvalidInput("task content empty".into()));
        }

        let schedule = match input.schedule {
            Schedule::At { at_ms } => {
                if at_ms <= 0 {
                    return Err(SchedulerError::InvalidSchedule(
                        "atMs must be a positive epoch-ms instant".into(),
                    ));
                }
                Schedule::At { at_ms }
            }
            Schedule::Every { every_ms, anchor_ms } => {
                if every_ms < 1000 {
                    return Err(SchedulerError::InvalidSchedule(format!(
                        "everyMs must be at least 1000 (got {every_ms})"
                    )));
                }
                if anchor_ms < 0 {
                    return Err(SchedulerError::InvalidSchedule(
                        "anchorMs must be positive".into(),
                    ));
                }
                let anchor_ms = if anchor_ms == 0 { now } else { anchor_ms };
                Schedule::Every { every_ms, anchor_ms }
            }
            Schedule::Cron { expr, timezone } => {
                let expr = expr.trim().to_string();
                if expr.is_empty() {
                    return Err(SchedulerError::InvalidSchedule("cron expression empty".into()));
                }
                let timezone = if timezone.trim().is_empty() {
                    inner.cfg.default_timezone.clone()
                } else {
                    timezone.trim().to_string()
                };
                Schedule::Cron { expr, timezone }
            }
        };

        let mut st = inner.state.lock().await;

        let owned = st.jobs.values().filter(|j| j.tenant == input.tenant).count();
        if owned >= inner.cfg.max_jobs_per_chat {
            return Err(SchedulerError::QuotaExceeded {
                tenant: input.tenant,
                limit: inner.cfg.max_jobs_per_chat,
            });
        }

        let id = generate_job_id(|candidate| st.jobs.contains_key(candidate));
        let name = resolve_name(input.name.as_deref(), &prompt, &id);
        let policy = RunPolicy::clamped(&input.policy, &inner.defaults);

        let mut job = Job {
            id: id.clone(),
            tenant: input.tenant,
            bot_name: inner.cfg.bot_name.clone(),
            name,
            prompt,
            enabled: input.enabled,
            created_at_ms: now,
            updated_at_ms: now,
            schedule,
            policy,
            state: Default::default(),
        };
        if job.enabled {
            job.state.next_run_at_ms = initial_next_run(&job.schedule, now);
        }
        info!(job_id = %id, tenant = input.tenant, schedule = %job.schedule, "job created");
        st.jobs.insert(id.clone(), job.clone());

        if st.started && inner.cfg.enabled && job.enabled {
            match &job.schedule {
                Schedule::At { .. } | Schedule::Every { .. } => {
                    arm_timer(inner, &mut st, &id, job.state.next_run_at_ms, RunSource::Timer);
                }
                Schedule::Cron { .. } => {
                    arm_cron(inner, &mut st, &id);
                }
            }
        }

        inner.persist_locked(&st);
        if let Some(current) = st.jobs.get(&id) {
            job = current.clone();
        }
        Ok(job)
    }

    /// Remove a job and any queued or armed trigger for it. Returns
    /// false when the id is unknown. A run already in flight finalizes
    /// against the now-missing record and is dropped.
    pub async fn remove(&self, id: &str) -> bool {
        let inner = &self.inner;
        let mut st = inner.state.lock().await;
        if st.jobs.remove(id).is_none() {
            return false;
        }
        st.queued.remove(id);
        inner.cancel_triggers(&mut st, id);
        info!(job_id = %id, "job removed");
        inner.persist_locked(&st);
        true
    }

    /// Enable or disable a job, re-arming or cancelling its triggers.
    /// On re-enable a missing `next_run_at_ms` is replenished from the
    /// schedule. Returns the updated job, or `None` if unknown.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Option<Job> {
        let inner = &self.inner;
        let mut st = inner.state.lock().await;
        if !st.jobs.contains_key(id) {
            return None;
        }
        let now = now_ms();

        if enabled {
            let (schedule, target) = {
                let job = st.jobs.get_mut(id)?;
                job.enabled = true;
                if job.state.next_run_at_ms == 0 {
                    job.state.next_run_at_ms = initial_next_run(&job.schedule, now);
                }
                job.touch(now);
                (job.schedule.clone(), job.state.next_run_at_ms)
            };
            if st.started && inner.cfg.enabled {
                match schedule {
                    Schedule::At { .. } | Schedule::Every { .. } => {
                        arm_timer(inner, &mut st, id, target, RunSource::Timer);
                    }
                    Schedule::Cron { .. } => {
                        arm_cron(inner, &mut st, id);
                    }
                }
            }
            info!(job_id = %id, "job enabled");
        } else {
            inner.cancel_triggers(&mut st, id);
            st.queued.remove(id);
            let job = st.jobs.get_mut(id)?;
            job.enabled = false;
            job.state.next_run_at_ms = 0;
            job.touch(now);
            info!(job_id = %id, "job disabled");
        }

        inner.persist_locked(&st);
        st.jobs.get(id).cloned()
    }

    /// Rename a job. Returns `None` for an unknown id.
    pub async fn rename(&self, id: &str, name: &str) -> Result<Option<Job>> {
        let normalized = crate::types::normalize_name(name);
        if normalized.is_empty() {
            return Err(SchedulerError::InvalidInput("job name empty".into()));
        }
        let inner = &self.inner;
        let mut st = inner.state.lock().await;
        let Some(job) = st.jobs.get_mut(id) else {
            return Ok(None);
        };
        job.name = normalized;
        job.touch(now_ms());
        let updated = job.clone();
        inner.persist_locked(&st);
        Ok(Some(updated))
    }

    /// Queue a forced run. Returns true when the job exists and the
    /// service is running; a trigger that coalesces with a queued or
    /// in-flight run still counts as handled.
    pub async fn run_now(&self, id: &str) -> bool {
        let inner = &self.inner;
        let mut st = inner.state.lock().await;
        if !st.started || !st.jobs.contains_key(id) {
            return false;
        }
        info!(job_id = %id, "manual run requested");
        inner.enqueue_run(&mut st, id, RunSource::Manual, now_ms(), true);
        true
    }

    /// Deep-copied snapshot sorted by (enabled desc, next fire asc with
    /// unscheduled last, created asc).
    pub async fn list(&self, tenant: Option<TenantId>) -> Vec<Job> {
        let st = self.inner.state.lock().await;
        let mut jobs: Vec<Job> = st
            .jobs
            .values()
            .filter(|j| tenant.map_or(true, |t| j.tenant == t))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| {
            b.enabled
                .cmp(&a.enabled)
                .then_with(|| next_sort_key(a).cmp(&next_sort_key(b)))
                .then_with(|| a.created_at_ms.cmp(&b.created_at_ms))
        });
        jobs
    }

    /// Deep-copied job snapshot.
    pub async fn get(&self, id: &str) -> Option<Job> {
        self.inner.state.lock().await.jobs.get(id).cloned()
    }

    /// Aggregate counters over the jobs matching the tenant filter.
    pub async fn status(&self, tenant: Option<TenantId>) -> ServiceStatus {
        let st = self.inner.state.lock().await;
        let mut status = ServiceStatus {
            enabled: self.inner.cfg.enabled,
            ..Default::default()
        };
        let mut next: Option<i64> = None;
        for job in st.jobs.values() {
            if tenant.is_some_and(|t| job.tenant != t) {
                continue;
            }
            status.total_jobs += 1;
            if job.enabled {
                status.enabled_jobs += 1;
                if job.state.next_run_at_ms > 0 {
                    next = Some(next.map_or(job.state.next_run_at_ms, |n| {
                        n.min(job.state.next_run_at_ms)
                    }));
                }
            }
            if job.state.running_run_id.is_some() {
                status.running_jobs += 1;
            }
            if st.queued.contains(&job.id) {
                status.queued_jobs += 1;
            }
        }
        status.next_run_at_ms = next.unwrap_or(0);
        status
    }
}

fn next_sort_key(job: &Job) -> i64 {
    if job.state.next_run_at_ms == 0 {
        i64::MAX
    } else {
        job.state.next_run_at_ms
    }
}

/// Arm (or re-arm) the single-shot timer for an At/Every/retry fire.
/// Any previously armed timer for the job is cancelled first, which
/// keeps the one-trigger-per-job invariant.
fn arm_timer(
    inner: &Arc<Inner>,
    st: &mut EngineState,
    job_id: &str,
    target_ms: i64,
    source: RunSource,
) {
    if let Some(old) = st.timers.remove(job_id) {
        old.cancel();
    }
    let weak = Arc::downgrade(inner);
    let id = job_id.to_string();
    let task = tokio::spawn(async move {
        sleep_until_ms(target_ms).await;
        if let Some(inner) = weak.upgrade() {
            on_timer_fire(inner, id, target_ms, source).await;
        }
    });
    st.timers.insert(job_id.to_string(), TimerHandle::new(task));
}

/// Arm the cron tick task for a cron job, recording the first upcoming
/// instant. An unparseable expression or timezone disables the job on
/// the spot and arms nothing.
fn arm_cron(inner: &Arc<Inner>, st: &mut EngineState, job_id: &str) {
    let now = now_ms();
    let Some((expr, timezone)) = st.jobs.get(job_id).and_then(|job| match &job.schedule {
        Schedule::Cron { expr, timezone } => Some((expr.clone(), timezone.clone())),
        _ => None,
    }) else {
        return;
    };

    match next_cron_fire(&expr, &timezone, now) {
        Ok(first) => {
            if let Some(job) = st.jobs.get_mut(job_id) {
                job.state.next_run_at_ms = first;
                job.touch(now);
            }
            if let Some(old) = st.crons.remove(job_id) {
                old.cancel();
            }
            let weak = Arc::downgrade(inner);
            let id = job_id.to_string();
            let task = tokio::spawn(async move {
                loop {
                    let next = match next_cron_fire(&expr, &timezone, now_ms()) {
                        Ok(next) => next,
                        Err(reason) => {
                            if let Some(inner) = weak.upgrade() {
                                on_cron_invalid(inner, &id, reason).await;
                            }
                            return;
                        }
                    };
                    sleep_until_ms(next).await;
                    let Some(inner) = weak.upgrade() else { return };
                    if !on_cron_tick(inner, &id, next).await {
                        return;
                    }
                }
            });
            st.crons.insert(job_id.to_string(), TimerHandle::new(task));
        }
        Err(reason) => {
            warn!(job_id = %job_id, "cannot arm cron job: {reason}");
            if let Some(job) = st.jobs.get_mut(job_id) {
                job.enabled = false;
                job.state.next_run_at_ms = 0;
                job.state.last_status = Some(RunStatus::Error);
                job.state.last_error = Some(reason);
                job.touch(now);
            }
        }
    }
}

/// Timer fire callback. Re-checks the wall clock before enqueueing: a
/// wake more than a second early re-arms for the remainder instead of
/// firing.
async fn on_timer_fire(inner: Arc<Inner>, job_id: String, target_ms: i64, source: RunSource) {
    let mut st = inner.state.lock().await;
    if inner.stopping() || !st.started {
        return;
    }
    // cancel() always aborts before a replacement is armed, so reaching
    // the lock means the table entry is ours.
    st.timers.remove(&job_id);

    let now = now_ms();
    if now + EARLY_FIRE_TOLERANCE_MS < target_ms {
        if st.jobs.contains_key(&job_id) {
            arm_timer(&inner, &mut st, &job_id, target_ms, source);
        }
        return;
    }

    let enabled = match st.jobs.get(&job_id) {
        Some(job) => job.enabled,
        None => return,
    };
    if !enabled {
        return;
    }
    inner.enqueue_run(&mut st, &job_id, source, target_ms, false);
}

/// Cron tick callback. Refreshes `next_run_at_ms` from the evaluator
/// before enqueueing, so observers always see the upcoming instant.
/// Returns false when the tick task should exit.
async fn on_cron_tick(inner: Arc<Inner>, job_id: &str, tick_at_ms: i64) -> bool {
    let mut st = inner.state.lock().await;
    if inner.stopping() || !st.started || !st.crons.contains_key(job_id) {
        return false;
    }

    enum Tick {
        Fire,
        Invalid(String),
        Drop,
    }

    let decision = {
        let Some(job) = st.jobs.get_mut(job_id) else {
            return false;
        };
        if !job.enabled {
            Tick::Drop
        } else if let Schedule::Cron { expr, timezone } = job.schedule.clone() {
            match next_cron_fire(&expr, &timezone, tick_at_ms) {
                Ok(next) => {
                    job.state.next_run_at_ms = next;
                    job.touch(now_ms());
                    Tick::Fire
                }
                Err(reason) => Tick::Invalid(reason),
            }
        } else {
            Tick::Drop
        }
    };

    match decision {
        Tick::Fire => {
            inner.persist_locked(&st);
            inner.enqueue_run(&mut st, job_id, RunSource::Cron, tick_at_ms, false);
            true
        }
        Tick::Invalid(reason) => {
            warn!(job_id = %job_id, "cron schedule became invalid: {reason}");
            if let Some(cron) = st.crons.remove(job_id) {
                cron.cancel();
            }
            if let Some(job) = st.jobs.get_mut(job_id) {
                job.enabled = false;
                job.state.next_run_at_ms = 0;
                job.state.last_status = Some(RunStatus::Error);
                job.state.last_error = Some(reason);
                job.touch(now_ms());
            }
            inner.persist_locked(&st);
            false
        }
        Tick::Drop => false,
    }
}

/// A cron expression that fails to evaluate at arm time (after having
/// been armed) disables its job.
async fn on_cron_invalid(inner: Arc<Inner>, job_id: &str, reason: String) {
    let mut st = inner.state.lock().await;
    if !st.started {
        return;
    }
    warn!(job_id = %job_id, "cron schedule invalid: {reason}");
    st.crons.remove(job_id);
    if let Some(job) = st.jobs.get_mut(job_id) {
        job.enabled = false;
        job.state.next_run_at_ms = 0;
        job.state.last_status = Some(RunStatus::Error);
        job.state.last_error = Some(reason);
        job.touch(now_ms());
    }
    inner.persist_locked(&st);
}

/// Drain the run queue, one dispatch at a time. Each run is bounded by
/// the configured timeout, so a wedged executor cannot stall the queue
/// past it.
async fn dispatch_loop(weak: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<RunRequest>) {
    while let Some(req) = rx.recv().await {
        let Some(inner) = weak.upgrade() else { break };
        dispatch(&inner, req).await;
    }
}

async fn dispatch(inner: &Arc<Inner>, req: RunRequest) {
    let Some((run_id, started_at, ctx)) = claim_run(inner, &req).await else {
        return;
    };

    info!(
        job_id = %req.job_id,
        run_id = %run_id,
        source = %req.source,
        "dispatching job run"
    );

    let executor = inner.executor.read().unwrap().clone();
    let timeout_ms = inner.cfg.max_run_ms.max(MIN_RUN_TIMEOUT_MS);
    let outcome = match executor {
        None => RunOutcome::error("no executor configured"),
        Some(executor) => {
            // Spawned so an executor panic is contained as a failed run.
            let handle = tokio::spawn(async move { executor.execute(ctx).await });
            match tokio::time::timeout(Duration::from_millis(timeout_ms as u64), handle).await {
                Err(_) => RunOutcome::error(format!("run timeout (>{}s)", timeout_ms / 1000)),
                Ok(Err(join_err)) => RunOutcome::error(format!("executor task failed: {join_err}")),
                Ok(Ok(outcome)) => outcome,
            }
        }
    };

    finalize_run(inner, &req, &run_id, started_at, outcome).await;
    inner.active_runs.fetch_sub(1, Ordering::SeqCst);
}

/// Step one of a dispatch: consume the queue entry and take ownership
/// of the run under the serializer. Returns `None` when the request was
/// cancelled, the job is gone/disabled, or a run is already in flight.
async fn claim_run(inner: &Arc<Inner>, req: &RunRequest) -> Option<(String, i64, RunContext)> {
    let mut st = inner.state.lock().await;
    if !st.queued.remove(&req.job_id) {
        // Cancelled while queued (remove/disable/stop cleared the set).
        return None;
    }
    if inner.stopping() || !st.started || !inner.cfg.enabled {
        return None;
    }
    let job = st.jobs.get_mut(&req.job_id)?;
    if !job.enabled && !req.force {
        return None;
    }
    if job.state.running_run_id.is_some() {
        return None;
    }

    let run_id = Uuid::new_v4().to_string();
    let now = now_ms();
    job.state.running_run_id = Some(run_id.clone());
    job.state.running_at_ms = Some(now);
    job.touch(now);
    let ctx = RunContext {
        job: job.clone(),
        run_id: run_id.clone(),
        source: req.source,
        scheduled_at_ms: req.scheduled_at_ms,
    };
    // Counted while the serializer is still held so stop()'s drain can
    // never miss a freshly claimed run.
    inner.active_runs.fetch_add(1, Ordering::SeqCst);
    inner.persist_locked(&st);
    Some((run_id, now, ctx))
}

/// Steps three to five of a dispatch: record the outcome and reschedule
/// per schedule kind, all under the serializer.
async fn finalize_run(
    inner: &Arc<Inner>,
    req: &RunRequest,
    run_id: &str,
    started_at: i64,
    outcome: RunOutcome,
) {
    let mut st = inner.state.lock().await;
    let now = now_ms();

    enum Next {
        Delete,
        Disable,
        Arm { target: i64, source: RunSource },
        CronRefresh,
    }

    let decision = {
        let Some(job) = st.jobs.get_mut(&req.job_id) else {
            // Removed while running; the run's effects are dropped.
            return;
        };
        if job.state.running_run_id.as_deref() != Some(run_id) {
            return;
        }
        job.state.running_run_id = None;
        job.state.running_at_ms = None;
        job.state.last_run_at_ms = Some(now);
        job.state.last_duration_ms = Some(now - started_at);
        if outcome.ok {
            job.state.last_status = Some(RunStatus::Ok);
            job.state.last_error = None;
            job.state.consecutive_failures = 0;
            info!(job_id = %job.id, run_id = %run_id, duration_ms = now - started_at, "run ok");
        } else {
            let reason = outcome.error.clone().unwrap_or_else(|| "unknown error".to_string());
            warn!(job_id = %job.id, run_id = %run_id, "run failed: {reason}");
            job.state.last_status = Some(RunStatus::Error);
            job.state.last_error = Some(reason);
            job.state.consecutive_failures = job.state.consecutive_failures.saturating_add(1);
        }
        job.touch(now);

        match job.schedule.clone() {
            Schedule::At { .. } if outcome.ok => {
                if job.policy.delete_after_run {
                    Next::Delete
                } else {
                    Next::Disable
                }
            }
            Schedule::At { .. } => {
                let failures = job.state.consecutive_failures;
                if failures <= job.policy.retry_max {
                    let shift = failures.saturating_sub(1).min(20);
                    let backoff = job.policy.retry_backoff_ms.saturating_mul(1_i64 << shift);
                    Next::Arm { target: now + backoff, source: RunSource::Retry }
                } else {
                    info!(
                        job_id = %job.id,
                        attempts = failures,
                        "one-shot job failed terminally; disabling"
                    );
                    Next::Disable
                }
            }
            Schedule::Every { every_ms, anchor_ms } => {
                Next::Arm {
                    target: every_fire_after(anchor_ms, every_ms, now),
                    source: RunSource::Timer,
                }
            }
            Schedule::Cron { .. } => Next::CronRefresh,
        }
    };

    match decision {
        Next::Delete => {
            st.jobs.remove(&req.job_id);
            st.queued.remove(&req.job_id);
            inner.cancel_triggers(&mut st, &req.job_id);
            info!(job_id = %req.job_id, "one-shot job completed and deleted");
        }
        Next::Disable => {
            if let Some(job) = st.jobs.get_mut(&req.job_id) {
                job.enabled = false;
                job.state.next_run_at_ms = 0;
                job.touch(now);
            }
        }
        Next::Arm { target, source } => {
            let enabled = st
                .jobs
                .get_mut(&req.job_id)
                .map(|job| {
                    if job.enabled {
                        job.state.next_run_at_ms = target;
                    } else {
                        job.state.next_run_at_ms = 0;
                    }
                    job.enabled
                })
                .unwrap_or(false);
            if enabled && st.started && !inner.stopping() {
                if source == RunSource::Retry {
                    info!(job_id = %req.job_id, retry_at_ms = target, "retry scheduled");
                }
                arm_timer(inner, &mut st, &req.job_id, target, source);
            }
        }
        Next::CronRefresh => {
            let refresh = st.jobs.get(&req.job_id).and_then(|job| {
                if !job.enabled {
                    return None;
                }
                match &job.schedule {
                    Schedule::Cron { expr, timezone } => {
                        Some(next_cron_fire(expr, timezone, now))
                    }
                    _ => None,
                }
            });
            match refresh {
                Some(Ok(next)) => {
                    if let Some(job) = st.jobs.get_mut(&req.job_id) {
                        job.state.next_run_at_ms = next;
                    }
                }
                Some(Err(reason)) => {
                    warn!(job_id = %req.job_id, "cron refresh failed: {reason}");
                    inner.cancel_triggers(&mut st, &req.job_id);
                    if let Some(job) = st.jobs.get_mut(&req.job_id) {
                        job.enabled = false;
                        job.state.next_run_at_ms = 0;
                        job.state.last_status = Some(RunStatus::Error);
                        job.state.last_error = Some(reason);
                    }
                }
                None => {
                    if let Some(job) = st.jobs.get_mut(&req.job_id) {
                        if !job.enabled {
                            job.state.next_run_at_ms = 0;
                        }
                    }
                }
            }
        }
    }

    inner.persist_locked(&st);
}

/// Single writer for store snapshots. Messages arrive in mutation
/// order; a write failure is logged and the in-memory state stays
/// authoritative until the next mutation persists again.
async fn persist_loop(store: JobStore, mut rx: mpsc::UnboundedReceiver<PersistMsg>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            PersistMsg::Snapshot(snapshot) => {
                if let Err(e) = store.write(&snapshot).await {
                    error!(path = %store.path().display(), "cannot persist job store: {e}");
                }
            }
            PersistMsg::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}
