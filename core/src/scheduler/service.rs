// Scheduler service: acquire -> trigger -> execute -> reconcile
//
// The acquire and trigger phases each run under a named lock and inside one
// store transaction. Audit entries and events produced in a phase are held
// back until its transaction commits. Job code runs with no lock held.

use super::checker::CheckerChain;
use super::pool::JobPool;
use super::registry::{JobContext, JobRegistry};
use crate::config::SchedulerSettings;
use crate::db::{JobLogSink, SchedulerStore, StoreTransaction};
use crate::errors::{DatabaseError, PhaseError, SchedulerError, ValidationError};
use crate::events::EventBus;
use crate::lock::{DistributedLock, LockGuard};
use crate::models::{
    now_timestamp, EventTopic, ExecutionResult, FiredJob, FiredStatus, JobDetail, JobDetailFilter,
    JobDetailInsert, JobDetailOrder, JobDetailUpdate, JobEvent, JobFiredInsert, JobFiredUpdate,
    JobLog, JobStatus, NewJobDetail, Timestamp, DEFAULT_MISFIRE_THRESHOLD, DEFAULT_POOL,
    DEFAULT_PRIORITY, DEFAULT_SOURCE,
};
use crate::schedule::CronEvaluator;
use crate::telemetry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

pub const ACQUIRE_JOBS_LOCK: &str = "acquire_jobs";
pub const TRIGGER_LOCK: &str = "trigger";

/// Tuning for the scheduling phases
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Hold budget of the acquire and trigger locks
    pub lock_ttl_seconds: u64,
    /// Definitions due within this window are acquired ahead of time
    pub acquire_lookahead_seconds: i64,
    /// Minimum age of a soft delete before the definition is purged
    pub purge_after_seconds: i64,
    pub purge_batch_size: i64,
    /// Candidates visited by one trigger pass at most
    pub max_trigger_iterations: usize,
    /// Recorded on every audit entry
    pub hostname: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lock_ttl_seconds: 20,
            acquire_lookahead_seconds: 60,
            purge_after_seconds: 24 * 60 * 60,
            purge_batch_size: 100,
            max_trigger_iterations: 10_000,
            hostname: "localhost".to_string(),
        }
    }
}

impl From<&SchedulerSettings> for SchedulerConfig {
    fn from(settings: &SchedulerSettings) -> Self {
        Self {
            lock_ttl_seconds: settings.lock_ttl_seconds,
            acquire_lookahead_seconds: settings.acquire_lookahead_seconds,
            purge_after_seconds: settings.purge_after_seconds,
            purge_batch_size: settings.purge_batch_size,
            max_trigger_iterations: settings.max_trigger_iterations,
            hostname: settings.resolve_hostname(),
        }
    }
}

/// Collaborators injected into the service
pub struct SchedulerComponents {
    pub store: Arc<dyn SchedulerStore>,
    pub log_sink: Arc<dyn JobLogSink>,
    pub lock: Arc<dyn DistributedLock>,
    pub cron: Arc<dyn CronEvaluator>,
    pub events: EventBus,
    pub pool: Arc<dyn JobPool>,
    pub registry: Arc<JobRegistry>,
}

/// Audit entries and events waiting for their transaction to commit
#[derive(Default)]
struct Outbox {
    logs: Vec<JobLog>,
    events: Vec<JobEvent>,
    fired: Vec<FiredStatus>,
}

impl Outbox {
    fn log(&mut self, detail: &JobDetail, job_fired_id: Option<i64>, status: &str, hostname: &str) {
        self.logs
            .push(JobLog::new(detail, job_fired_id, status, hostname));
    }

    fn push_log(&mut self, log: JobLog) {
        self.logs.push(log);
    }

    fn event(&mut self, event: JobEvent) {
        self.events.push(event);
    }
}

pub struct SchedulerService {
    store: Arc<dyn SchedulerStore>,
    log_sink: Arc<dyn JobLogSink>,
    lock: Arc<dyn DistributedLock>,
    cron: Arc<dyn CronEvaluator>,
    events: EventBus,
    pool: Arc<dyn JobPool>,
    registry: Arc<JobRegistry>,
    checkers: CheckerChain,
    config: SchedulerConfig,
}

impl SchedulerService {
    pub fn new(config: SchedulerConfig, components: SchedulerComponents) -> Self {
        Self {
            store: components.store,
            log_sink: components.log_sink,
            lock: components.lock,
            cron: components.cron,
            events: components.events,
            pool: components.pool,
            registry: components.registry,
            checkers: CheckerChain::default(),
            config,
        }
    }

    /// Replace the default misfire-only checker chain
    pub fn with_checkers(mut self, checkers: CheckerChain) -> Self {
        self.checkers = checkers;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    /// Validate and persist a new job definition in `waiting` state
    #[instrument(skip(self, request), fields(name = %request.name, class = %request.class))]
    pub async fn schedule(&self, request: NewJobDetail) -> Result<JobDetail, SchedulerError> {
        let insert = self.resolve_new_job(request)?;

        let mut tx = self.store.begin().await?;
        let result = tx.create_job_detail(insert).await;
        let detail = finish(tx, result).await?;

        info!(
            job_detail_id = detail.id,
            next_fire_time = detail.next_fire_time,
            "Job scheduled"
        );

        let mut outbox = Outbox::default();
        outbox.log(&detail, None, "created", &self.config.hostname);
        outbox.event(JobEvent::new(EventTopic::Created, &detail, None));
        self.flush(outbox).await;

        Ok(detail)
    }

    fn resolve_new_job(&self, request: NewJobDetail) -> Result<JobDetailInsert, SchedulerError> {
        if request.name.trim().is_empty() {
            return Err(ValidationError::MissingField("name".to_string()).into());
        }
        if request.class.trim().is_empty() {
            return Err(ValidationError::MissingField("class".to_string()).into());
        }

        let expression = request.expression.filter(|e| !e.trim().is_empty());
        let next_fire_time = match (&expression, request.next_fire_time) {
            (None, None) => return Err(ValidationError::MissingSchedule.into()),
            (Some(expression), _) => {
                if !self.cron.validate(expression) {
                    return Err(ValidationError::InvalidFieldValue {
                        field: "expression".to_string(),
                        reason: format!("invalid cron expression '{}'", expression),
                    }
                    .into());
                }
                self.cron.next_fire_after(expression, now_timestamp())?
            }
            (None, Some(next_fire_time)) => next_fire_time,
        };

        let misfire_threshold = request
            .misfire_threshold
            .unwrap_or(DEFAULT_MISFIRE_THRESHOLD);
        if misfire_threshold < 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "misfire_threshold".to_string(),
                reason: "must not be negative".to_string(),
            }
            .into());
        }

        Ok(JobDetailInsert {
            name: request.name,
            pool: request.pool.unwrap_or_else(|| DEFAULT_POOL.to_string()),
            source: request.source.unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
            class: request.class,
            args: request.args.unwrap_or(serde_json::Value::Null),
            priority: request.priority.unwrap_or(DEFAULT_PRIORITY),
            expression,
            next_fire_time,
            misfire_threshold,
            misfire_policy: request.misfire_policy.unwrap_or_default(),
        })
    }

    // ========================================================================
    // Tick
    // ========================================================================

    /// One scheduling tick: acquire, trigger, run at most one job, reconcile
    #[instrument(skip(self))]
    pub async fn execute(&self) -> Result<(), SchedulerError> {
        let started = Instant::now();
        let result = self.run_tick().await;
        telemetry::record_tick_duration(started.elapsed().as_secs_f64());
        result
    }

    async fn run_tick(&self) -> Result<(), SchedulerError> {
        self.acquire_due_jobs().await?;

        let Some(job) = self.trigger_job().await? else {
            debug!("No job due");
            return Ok(());
        };

        let result = self.run_job(&job).await;
        self.job_executed(&job, result).await
    }

    async fn run_job(&self, job: &FiredJob) -> ExecutionResult {
        match self.registry.resolve(&job.detail) {
            Some(task) => self.pool.run(task, JobContext::new(job)).await,
            None => {
                warn!(
                    job_detail_id = job.detail.id,
                    class = %job.detail.class,
                    "No task registered for job class"
                );
                ExecutionResult::failure(format!("unknown job class '{}'", job.detail.class))
            }
        }
    }

    // ========================================================================
    // Acquire phase
    // ========================================================================

    /// Promote every waiting definition due within the lookahead window.
    /// Returns the number of firings created.
    #[instrument(skip(self))]
    pub async fn acquire_due_jobs(&self) -> Result<usize, SchedulerError> {
        let guard = self.lock_phase(ACQUIRE_JOBS_LOCK).await?;
        let result = self.promote_due_jobs(now_timestamp()).await;
        self.release_phase(guard).await;

        let (count, outbox) =
            result.map_err(|e| SchedulerError::coordination(ACQUIRE_JOBS_LOCK, e))?;
        self.flush(outbox).await;

        if count > 0 {
            info!(acquired = count, "Acquired due jobs");
        }
        telemetry::record_jobs_acquired(count);
        Ok(count)
    }

    async fn promote_due_jobs(&self, now: Timestamp) -> Result<(usize, Outbox), PhaseError> {
        let mut outbox = Outbox::default();
        let mut tx = self.store.begin().await?;
        let result = self.promote_in(tx.as_mut(), now, &mut outbox).await;
        let count = finish(tx, result).await?;
        Ok((count, outbox))
    }

    async fn promote_in(
        &self,
        tx: &mut dyn StoreTransaction,
        now: Timestamp,
        outbox: &mut Outbox,
    ) -> Result<usize, PhaseError> {
        let due = tx
            .find_due_waiting_job_details(now + self.config.acquire_lookahead_seconds)
            .await?;

        for detail in &due {
            let detail = tx
                .update_job_detail(detail.id, JobDetailUpdate::status(JobStatus::Acquired))
                .await?;
            let fired = tx
                .create_job_fired(JobFiredInsert {
                    job_detail_id: detail.id,
                    fired_time: detail.next_fire_time,
                    status: FiredStatus::Acquired,
                })
                .await?;

            debug!(
                job_detail_id = detail.id,
                job_fired_id = fired.id,
                fired_time = fired.fired_time,
                "Job acquired"
            );
            outbox.event(JobEvent::new(EventTopic::Acquired, &detail, Some(&fired)));
            outbox.log(&detail, Some(fired.id), "acquired", &self.config.hostname);
        }

        Ok(due.len())
    }

    // ========================================================================
    // Trigger phase
    // ========================================================================

    /// Classify acquired firings oldest first until one is executable.
    ///
    /// Every visited definition has its schedule advanced and goes back to
    /// `waiting`. Returns `None` when nothing is left to run.
    #[instrument(skip(self))]
    pub async fn trigger_job(&self) -> Result<Option<FiredJob>, SchedulerError> {
        let guard = self.lock_phase(TRIGGER_LOCK).await?;
        let result = self.select_executable(now_timestamp()).await;
        self.release_phase(guard).await;

        let (job, outbox) = result.map_err(|e| SchedulerError::coordination(TRIGGER_LOCK, e))?;
        self.flush(outbox).await;

        if let Some(job) = &job {
            info!(
                job_detail_id = job.detail.id,
                job_fired_id = job.fired.id,
                "Job triggered"
            );
        }
        Ok(job)
    }

    async fn select_executable(
        &self,
        now: Timestamp,
    ) -> Result<(Option<FiredJob>, Outbox), PhaseError> {
        let mut outbox = Outbox::default();
        let mut tx = self.store.begin().await?;
        let result = self.select_in(tx.as_mut(), now, &mut outbox).await;
        let job = finish(tx, result).await?;
        Ok((job, outbox))
    }

    async fn select_in(
        &self,
        tx: &mut dyn StoreTransaction,
        now: Timestamp,
        outbox: &mut Outbox,
    ) -> Result<Option<FiredJob>, PhaseError> {
        for _ in 0..self.config.max_trigger_iterations {
            let Some(fired) = tx.get_one_job_fired_by_status(FiredStatus::Acquired).await? else {
                return Ok(None);
            };

            let Some(detail) = tx.get_job_detail(fired.job_detail_id).await? else {
                warn!(
                    job_fired_id = fired.id,
                    job_detail_id = fired.job_detail_id,
                    "Firing has no job definition, marking missed"
                );
                tx.update_job_fired(fired.id, JobFiredUpdate::status(FiredStatus::Missed))
                    .await?;
                outbox.fired.push(FiredStatus::Missed);
                continue;
            };

            let job = FiredJob { fired, detail };
            let status = self.checkers.check(&job, now);
            let fired = tx
                .update_job_fired(job.fired.id, JobFiredUpdate::status(status))
                .await?;

            let next_fire_time = self.advance(&job.detail, now)?;
            let detail = tx
                .update_job_detail(
                    job.detail.id,
                    JobDetailUpdate {
                        status: Some(JobStatus::Waiting),
                        pre_fire_time: Some(job.detail.next_fire_time),
                        next_fire_time: Some(next_fire_time),
                        ..Default::default()
                    },
                )
                .await?;

            debug!(
                job_detail_id = detail.id,
                job_fired_id = fired.id,
                status = %status,
                next_fire_time,
                "Firing classified"
            );
            outbox.log(&detail, Some(fired.id), status.as_str(), &self.config.hostname);
            outbox.fired.push(status);

            if status == FiredStatus::Executing {
                outbox.event(JobEvent::new(EventTopic::Executing, &detail, Some(&fired)));
                return Ok(Some(FiredJob { fired, detail }));
            }
        }

        warn!(
            max_trigger_iterations = self.config.max_trigger_iterations,
            "Trigger pass stopped at its iteration bound"
        );
        Ok(None)
    }

    /// Next fire time after the one just consumed.
    ///
    /// Evaluating from `max(now, consumed)` keeps an occurrence acquired
    /// early through the lookahead window from being scheduled again.
    fn advance(&self, detail: &JobDetail, now: Timestamp) -> Result<Timestamp, PhaseError> {
        match &detail.expression {
            Some(expression) => Ok(self
                .cron
                .next_fire_after(expression, now.max(detail.next_fire_time))?),
            None => Ok(detail.next_fire_time),
        }
    }

    // ========================================================================
    // Reconcile
    // ========================================================================

    /// Record the outcome of an executed firing.
    ///
    /// Success is terminal. Any other result puts the firing back to
    /// `acquired` with a fresh fired time so a later tick retries it.
    #[instrument(skip(self, job, result), fields(
        job_detail_id = job.detail.id,
        job_fired_id = job.fired.id,
        result = %result
    ))]
    pub async fn job_executed(
        &self,
        job: &FiredJob,
        result: ExecutionResult,
    ) -> Result<(), SchedulerError> {
        let hostname = &self.config.hostname;
        let mut outbox = Outbox::default();

        let update = if result.is_success() {
            outbox.log(&job.detail, Some(job.fired.id), "success", hostname);
            JobFiredUpdate::status(FiredStatus::Success)
        } else {
            let mut failed = JobLog::new(&job.detail, Some(job.fired.id), result.as_str(), hostname);
            if let Some(reason) = result.reason() {
                failed = failed.with_message(reason);
            }
            outbox.push_log(failed);
            outbox.log(&job.detail, Some(job.fired.id), "acquired", hostname);
            JobFiredUpdate {
                status: Some(FiredStatus::Acquired),
                fired_time: Some(now_timestamp()),
            }
        };

        let mut tx = self.store.begin().await?;
        let updated = tx.update_job_fired(job.fired.id, update).await;
        let fired = finish(tx, updated).await?;

        if result.is_success() {
            info!("Job succeeded");
        } else {
            warn!(fired_time = fired.fired_time, "Job failed, queued for retry");
        }

        outbox.event(
            JobEvent::new(EventTopic::Executed, &job.detail, Some(&fired)).with_result(result.clone()),
        );
        self.flush(outbox).await;
        telemetry::record_job_executed(&result);
        Ok(())
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Soft-delete a definition; the acquire phase skips it from now on
    #[instrument(skip(self))]
    pub async fn delete_job_detail(&self, id: i64) -> Result<JobDetail, SchedulerError> {
        let mut tx = self.store.begin().await?;
        let result = soft_delete(tx.as_mut(), LookupKey::Id(id)).await;
        let detail = finish(tx, result).await?;
        info!(job_detail_id = detail.id, "Job deleted");
        Ok(detail)
    }

    /// Soft-delete the live definition with the given pool and name
    #[instrument(skip(self))]
    pub async fn delete_job_detail_by_pool_and_name(
        &self,
        pool: &str,
        name: &str,
    ) -> Result<JobDetail, SchedulerError> {
        let mut tx = self.store.begin().await?;
        let result = soft_delete(tx.as_mut(), LookupKey::PoolAndName(pool, name)).await;
        let detail = finish(tx, result).await?;
        info!(job_detail_id = detail.id, "Job deleted");
        Ok(detail)
    }

    /// Hard-delete one batch of definitions soft-deleted long enough ago.
    /// Returns the number removed.
    #[instrument(skip(self))]
    pub async fn clear_job_details(&self) -> Result<usize, SchedulerError> {
        let filter = JobDetailFilter {
            deleted: Some(true),
            deleted_before: Some(now_timestamp() - self.config.purge_after_seconds),
            ..Default::default()
        };

        let mut tx = self.store.begin().await?;
        let result = purge(tx.as_mut(), &filter, self.config.purge_batch_size).await;
        let purged = finish(tx, result).await?;

        if purged > 0 {
            info!(purged, "Purged deleted jobs");
        }
        telemetry::record_jobs_purged(purged);
        Ok(purged)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn get_job_detail(&self, id: i64) -> Result<Option<JobDetail>, SchedulerError> {
        let mut tx = self.store.begin().await?;
        let result = tx.get_job_detail(id).await;
        Ok(finish(tx, result).await?)
    }

    pub async fn search_job_details(
        &self,
        filter: &JobDetailFilter,
        order: JobDetailOrder,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<JobDetail>, SchedulerError> {
        let mut tx = self.store.begin().await?;
        let result = tx.search_job_details(filter, order, offset, limit).await;
        Ok(finish(tx, result).await?)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn lock_phase(&self, name: &'static str) -> Result<LockGuard, SchedulerError> {
        let ttl = Duration::from_secs(self.config.lock_ttl_seconds);
        self.lock
            .acquire(name, ttl)
            .await
            .map_err(|e| SchedulerError::coordination(name, e))
    }

    /// Release on every exit path; a failed release only means the TTL ran out
    async fn release_phase(&self, guard: LockGuard) {
        let resource = guard.resource().to_string();
        let held_ms = guard.elapsed().as_millis() as u64;
        if let Err(e) = self.lock.release(guard).await {
            warn!(resource = %resource, held_ms, error = %e, "Failed to release scheduler lock");
        }
    }

    async fn flush(&self, outbox: Outbox) {
        for status in outbox.fired {
            telemetry::record_job_fired(status);
        }
        for log in outbox.logs {
            if let Err(e) = self.log_sink.append(log).await {
                warn!(error = %e, "Failed to append job log");
            }
        }
        for event in outbox.events {
            self.events.emit(event);
        }
    }
}

enum LookupKey<'a> {
    Id(i64),
    PoolAndName(&'a str, &'a str),
}

async fn soft_delete(
    tx: &mut dyn StoreTransaction,
    key: LookupKey<'_>,
) -> Result<JobDetail, SchedulerError> {
    let found = match key {
        LookupKey::Id(id) => tx
            .get_job_detail(id)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(format!("job detail {}", id)))?,
        LookupKey::PoolAndName(pool, name) => tx
            .get_job_detail_by_pool_and_name(pool, name)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(format!("job detail {}/{}", pool, name)))?,
    };

    // Deleting again would push back the purge deadline
    if found.deleted {
        return Ok(found);
    }

    Ok(tx
        .update_job_detail(found.id, JobDetailUpdate::soft_delete(now_timestamp()))
        .await?)
}

async fn purge(
    tx: &mut dyn StoreTransaction,
    filter: &JobDetailFilter,
    limit: i64,
) -> Result<usize, DatabaseError> {
    let expired = tx
        .search_job_details(filter, JobDetailOrder::DeletedTimeAsc, 0, limit)
        .await?;
    for detail in &expired {
        tx.delete_job_detail(detail.id).await?;
    }
    Ok(expired.len())
}

/// Commit on success, roll back on failure; the original error wins
async fn finish<T, E>(tx: Box<dyn StoreTransaction>, result: Result<T, E>) -> Result<T, E>
where
    E: From<DatabaseError>,
{
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_error) = tx.rollback().await {
                warn!(error = %rollback_error, "Transaction rollback failed");
            }
            Err(e)
        }
    }
}
