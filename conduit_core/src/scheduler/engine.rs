use crate::config::SchedulerConfig;
use crate::jobs::{JobQuery, JobStatus, JobStore, SyncJob, SyncJobRunner};
use crate::models::{Connector, ConnectorStatus, JobId, TriggerType};
use crate::registry::ConnectorRegistry;
use crate::scheduler::admission::{Admit, AdmissionQueue, Saturation};
use crate::scheduler::cron::{due_times, parse_schedule};
use crate::scheduler::retry::RetryPolicy;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const RECOVERY_PAGE: usize = 200;

/// A job holding (or waiting for) an admission slot.
struct Admitted {
    job: SyncJob,
    connector: Connector,
    done: watch::Sender<Option<SyncJob>>,
}

struct Shared {
    runner: SyncJobRunner,
    registry: Arc<dyn ConnectorRegistry>,
    config: SchedulerConfig,
    retry: RetryPolicy,
    admission: AdmissionQueue<Admitted>,
    /// Cancellation handles of RUNNING jobs.
    running: DashMap<JobId, CancellationToken>,
    /// Completion signals of every job this scheduler has admitted or queued.
    done: DashMap<JobId, watch::Receiver<Option<SyncJob>>>,
    shutdown: CancellationToken,
}

/// Creates sync jobs from cron schedules and manual triggers, enforces
/// concurrency limits, applies the retry policy and exposes job history and
/// cancellation.
///
/// Each admitted job runs on its own tokio task; the scheduler only keeps the
/// admission counters and cancellation handles.
#[derive(Clone)]
pub struct SyncScheduler {
    shared: Arc<Shared>,
}

impl SyncScheduler {
    #[tracing::instrument(level = "debug", skip(runner, registry))]
    pub fn new(
        runner: SyncJobRunner,
        registry: Arc<dyn ConnectorRegistry>,
        config: SchedulerConfig,
        retry: RetryPolicy,
    ) -> Result<Self> {
        config.validate()?;
        retry.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                runner,
                registry,
                admission: AdmissionQueue::new(config.global_max_running),
                config,
                retry,
                running: DashMap::new(),
                done: DashMap::new(),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    fn jobs(&self) -> &Arc<dyn JobStore> {
        self.shared.runner.jobs()
    }

    /// Create a job for `connector_id` and admit, queue or reject it.
    ///
    /// Returns the job as created (PENDING). Manual and API triggers for a busy
    /// connector fail with `ConcurrencyLimitExceeded` unless configured to queue.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn trigger(&self, connector_id: &str, trigger: TriggerType) -> Result<SyncJob> {
        let connector = self
            .shared
            .registry
            .get_connector(connector_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("connector {connector_id}")))?;
        if !connector.enabled {
            return Err(Error::Conflict(format!(
                "connector {connector_id} is disabled"
            )));
        }
        let job = SyncJob::new(connector.id.clone(), trigger)?;
        self.shared.submit(job, connector).await
    }

    /// Evaluate cron schedules at `now` and trigger what is due.
    ///
    /// The last fire time is persisted before any job is created, so a crash
    /// between the two never fires the same time twice. The first time a
    /// schedule is seen only the mark is recorded.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut triggered = 0usize;
        for connector in self.shared.registry.list_connectors().await? {
            if !connector.enabled {
                continue;
            }
            let schedule = match self.shared.registry.effective_schedule(&connector).await {
                Ok(Some(s)) if s.enabled => s,
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(connector_id = %connector.id, error = %e, "skipping invalid schedule");
                    continue;
                }
            };
            let cron = match parse_schedule(&schedule.cron_expression) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(connector_id = %connector.id, error = %e, "skipping invalid schedule");
                    continue;
                }
            };

            let Some(mark) = self.jobs().get_schedule_mark(&connector.id).await? else {
                self.jobs().set_schedule_mark(&connector.id, now).await?;
                continue;
            };
            let limit = if schedule.catch_up {
                self.shared.config.max_catch_up_runs
            } else {
                1
            };
            let due = due_times(&cron, mark, now, limit);
            let Some(latest) = due.last().copied() else {
                continue;
            };
            self.jobs().set_schedule_mark(&connector.id, latest).await?;

            for fire_at in due {
                let job = SyncJob::new(connector.id.clone(), TriggerType::Scheduled)?;
                match self.shared.submit(job, connector.clone()).await {
                    Ok(job) => {
                        triggered += 1;
                        tracing::debug!(job_id = %job.id, connector_id = %connector.id, %fire_at, "scheduled sync triggered");
                    }
                    Err(e) => {
                        tracing::warn!(connector_id = %connector.id, %fire_at, error = %e, "scheduled trigger failed");
                    }
                }
            }
        }
        Ok(triggered)
    }

    /// Run the cron loop until `cancel` fires.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn run_loop(&self, cancel: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.shared.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.tick(Utc::now()).await {
                tracing::warn!(error = %e, "sync scheduler tick failed");
            }
        }
    }

    /// Cancel a queued or running job and return it once CANCELLED.
    ///
    /// A queued job is cancelled directly. A running job is asked to stop and
    /// awaited for at most `cancel_wait`.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn cancel(&self, job_id: JobId) -> Result<SyncJob> {
        if let Some(queued) = self.shared.admission.remove_queued(|a| a.job.id == job_id) {
            return self.shared.cancel_queued(queued).await;
        }

        let token = self.shared.running.get(&job_id).map(|t| t.value().clone());
        if let Some(token) = token {
            token.cancel();
            return self.wait_timeout(job_id, self.shared.config.cancel_wait).await;
        }

        match self.jobs().get_job(job_id).await? {
            Some(job) if job.status.is_terminal() => Err(Error::Conflict(format!(
                "job {job_id} is already {}",
                job.status
            ))),
            Some(job) => Err(Error::Conflict(format!(
                "job {job_id} is {} but not owned by this scheduler",
                job.status
            ))),
            None => Err(Error::NotFound(format!("job {job_id}"))),
        }
    }

    /// Wait for a job to reach a terminal status.
    pub async fn wait(&self, job_id: JobId) -> Result<SyncJob> {
        let rx = self.shared.done.get(&job_id).map(|r| r.value().clone());
        if let Some(mut rx) = rx {
            if let Ok(job) = rx.wait_for(Option::is_some).await {
                if let Some(job) = (*job).clone() {
                    return Ok(job);
                }
            }
        }
        self.jobs()
            .get_job(job_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job {job_id}")))
    }

    pub async fn wait_timeout(&self, job_id: JobId, timeout: Duration) -> Result<SyncJob> {
        tokio::time::timeout(timeout, self.wait(job_id))
            .await
            .map_err(|_| {
                Error::BackendMessage(format!(
                    "job {job_id} did not finish within {}ms",
                    timeout.as_millis()
                ))
            })?
    }

    /// Fail jobs left PENDING or RUNNING by a previous process.
    ///
    /// They are marked FAILED as retryable and go through the normal retry
    /// policy. Returns how many were recovered.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn recover(&self) -> Result<usize> {
        let mut stale = Vec::new();
        for status in [JobStatus::Pending, JobStatus::Running] {
            let mut offset = 0usize;
            loop {
                let batch = self
                    .jobs()
                    .list_jobs(&JobQuery {
                        status: Some(status),
                        limit: RECOVERY_PAGE,
                        offset,
                        ..JobQuery::default()
                    })
                    .await?;
                let n = batch.len();
                stale.extend(batch);
                if n < RECOVERY_PAGE {
                    break;
                }
                offset += RECOVERY_PAGE;
            }
        }

        let mut recovered = 0usize;
        for mut job in stale {
            if self.shared.done.contains_key(&job.id) {
                continue;
            }
            job.mark_failed("interrupted by restart", true)?;
            self.shared.runner.record_transition(&job, false).await?;
            tracing::warn!(job_id = %job.id, connector_id = %job.connector_id, "sync job interrupted by restart");
            self.shared.after_terminal(&job).await;
            recovered += 1;
        }
        Ok(recovered)
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Option<SyncJob>> {
        self.jobs().get_job(job_id).await
    }

    /// Job history, newest first.
    pub async fn history(&self, query: &JobQuery) -> Result<Vec<SyncJob>> {
        self.jobs().list_jobs(query).await
    }

    /// The retry chain `job_id` belongs to, oldest first.
    pub async fn lineage(&self, job_id: JobId) -> Result<Vec<SyncJob>> {
        self.jobs().retry_chain(job_id).await
    }

    pub fn running_jobs(&self) -> Vec<JobId> {
        self.shared.running.iter().map(|e| *e.key()).collect()
    }

    pub fn running_count(&self, connector_id: &str) -> usize {
        self.shared.admission.running(connector_id)
    }

    pub fn queued_count(&self) -> usize {
        self.shared.admission.queued()
    }

    /// Stop retry timers, cancel queued and running jobs and wait for them.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        for queued in self.shared.admission.drain_queued() {
            if let Err(e) = self.shared.cancel_queued(queued).await {
                tracing::warn!(error = %e, "failed to cancel queued job");
            }
        }
        for job_id in self.running_jobs() {
            if let Err(e) = self.wait_timeout(job_id, self.shared.config.cancel_wait).await {
                tracing::warn!(%job_id, error = %e, "running job did not stop");
            }
        }
    }
}

impl Shared {
    async fn submit(self: &Arc<Self>, job: SyncJob, connector: Connector) -> Result<SyncJob> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Conflict("scheduler is shutting down".to_string()));
        }
        let limit = self
            .registry
            .effective_schedule(&connector)
            .await?
            .map_or(1, |s| s.max_concurrent_runs);
        let may_queue = job.trigger == TriggerType::Scheduled
            || job.parent_run_id.is_some()
            || !self.config.reject_manual_when_busy;

        let created = job.clone();
        let connector_id = connector.id.clone();
        let (tx, rx) = watch::channel(None);

        // Queueable jobs are stored first; rejectable ones only once a slot is held.
        if may_queue {
            self.runner.record_transition(&created, true).await?;
            self.done.insert(created.id, rx.clone());
        }
        let admitted = Admitted {
            job,
            connector,
            done: tx,
        };
        let admitted = match self.admission.try_admit(&connector_id, limit, admitted, may_queue) {
            Admit::Admitted(a) => a,
            Admit::Queued { position } => {
                tracing::info!(job_id = %created.id, %connector_id, position, "sync job queued");
                return Ok(created);
            }
            Admit::Rejected(_, saturation) => {
                self.done.remove(&created.id);
                let reason = match saturation {
                    Saturation::Connector => format!("connector {connector_id} is already running"),
                    Saturation::Global => format!(
                        "platform cap of {} running jobs reached",
                        self.config.global_max_running.unwrap_or_default()
                    ),
                };
                return Err(Error::ConcurrencyLimitExceeded(reason));
            }
        };
        if !may_queue {
            if let Err(e) = self.runner.record_transition(&created, true).await {
                self.release(&connector_id);
                return Err(e);
            }
            self.done.insert(created.id, rx);
        }
        self.start(admitted);
        Ok(created)
    }

    fn release(self: &Arc<Self>, connector_id: &str) {
        for next in self.admission.release(connector_id) {
            self.start(next);
        }
    }

    fn start(self: &Arc<Self>, admitted: Admitted) {
        let Admitted {
            job,
            connector,
            done,
        } = admitted;
        let cancel = self.shutdown.child_token();
        self.running.insert(job.id, cancel.clone());

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let job_id = job.id;
            shared
                .set_connector_status(&connector.id, ConnectorStatus::Running)
                .await;
            let pending = job.clone();
            let finished = match shared.runner.run(job, &connector, cancel).await {
                Ok(job) => job,
                Err(e) => {
                    tracing::error!(%job_id, error = %e, "sync job could not be started");
                    let mut failed = pending;
                    if let Err(t) = failed.mark_failed(e.to_string(), e.is_retryable()) {
                        tracing::error!(%job_id, error = %t, "sync job left in its last status");
                    }
                    shared.runner.record_terminal(&failed).await;
                    failed
                }
            };
            shared.running.remove(&job_id);
            shared.release(&connector.id);
            shared.after_terminal(&finished).await;
            done.send_replace(Some(finished));
            shared.done.remove(&job_id);
        });
    }

    async fn cancel_queued(self: &Arc<Self>, queued: Admitted) -> Result<SyncJob> {
        let Admitted { mut job, done, .. } = queued;
        job.mark_cancelled()?;
        self.runner.record_transition(&job, false).await?;
        tracing::info!(job_id = %job.id, connector_id = %job.connector_id, "queued sync job cancelled");
        self.set_connector_status(&job.connector_id, ConnectorStatus::Cancelled)
            .await;
        self.done.remove(&job.id);
        done.send_replace(Some(job.clone()));
        Ok(job)
    }

    /// Status writeback and retry scheduling for a job that just ended.
    async fn after_terminal(self: &Arc<Self>, job: &SyncJob) {
        let status = match job.status {
            JobStatus::Completed => ConnectorStatus::Succeeded,
            JobStatus::Failed => ConnectorStatus::Failed,
            JobStatus::Cancelled => ConnectorStatus::Cancelled,
            JobStatus::Pending | JobStatus::Running => return,
        };
        self.set_connector_status(&job.connector_id, status).await;

        if job.status != JobStatus::Failed || !job.retryable {
            return;
        }
        if !self.retry.allows(job.retry_count) {
            tracing::warn!(job_id = %job.id, connector_id = %job.connector_id, retry_count = job.retry_count, "retry attempts exhausted");
            return;
        }
        let delay = self.retry.backoff(job.retry_count);
        tracing::info!(job_id = %job.id, delay_ms = delay.as_millis() as u64, "sync job retry scheduled");

        let failed = job.clone();
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = shared.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if let Err(e) = shared.retry_now(&failed).await {
                tracing::warn!(job_id = %failed.id, error = %e, "sync job retry failed to start");
            }
        });
    }

    async fn retry_now(self: &Arc<Self>, failed: &SyncJob) -> Result<()> {
        let Some(connector) = self.registry.get_connector(&failed.connector_id).await? else {
            return Err(Error::NotFound(format!("connector {}", failed.connector_id)));
        };
        if !connector.enabled {
            tracing::info!(connector_id = %connector.id, "connector disabled, retry dropped");
            return Ok(());
        }
        let next = failed.retry()?;
        self.submit(next, connector).await?;
        Ok(())
    }

    async fn set_connector_status(&self, connector_id: &str, status: ConnectorStatus) {
        if let Err(e) = self
            .registry
            .update_connector_status(connector_id, status, Utc::now())
            .await
        {
            tracing::warn!(%connector_id, status = status.as_str(), error = %e, "connector status writeback failed");
        }
    }
}
