use crate::catalog::CatalogService;
use crate::config::SyncJobConfig;
use crate::executor::{ConnectorExecutor, ReadStream};
use crate::feed::{JobStatusEvent, JobStatusFeed};
use crate::jobs::models::{JobStatus, SyncJob, stream_label};
use crate::jobs::traits::{JobStore, RecordSink};
use crate::models::Connector;
use crate::protocol::{
    ConfiguredCatalog, ConnectorMessage, FailureType, LogLevel, LogMessage, ProtocolEvent,
    RecordMessage, StateMessage, StateType, SyncMode, TraceMessage, TraceType,
};
use crate::state::{StateKey, StateStore, StateUpdate};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const TERMINAL_WRITE_ATTEMPTS: u32 = 4;
const TERMINAL_WRITE_BACKOFF: Duration = Duration::from_millis(50);

/// How an execution ended, before it is written onto the job.
#[derive(Debug, Clone, PartialEq)]
enum Outcome {
    Completed,
    Failed { message: String, retryable: bool },
    Cancelled,
}

impl Outcome {
    fn from_error(e: Error) -> Self {
        match e {
            Error::Cancelled => Outcome::Cancelled,
            e => Outcome::Failed {
                retryable: e.is_retryable(),
                message: e.to_string(),
            },
        }
    }
}

/// Drives one sync job from PENDING to a terminal status.
///
/// RECORDs go to the sink, STATEs are committed to the state store as soon as
/// they arrive, TRACE errors fail the job and LOGs are forwarded to tracing.
#[derive(Clone)]
pub struct SyncJobRunner {
    executor: ConnectorExecutor,
    catalogs: CatalogService,
    state: Arc<dyn StateStore>,
    jobs: Arc<dyn JobStore>,
    sink: Arc<dyn RecordSink>,
    feed: Arc<dyn JobStatusFeed>,
    config: SyncJobConfig,
    preflight_check: bool,
}

impl SyncJobRunner {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(
        executor: ConnectorExecutor,
        catalogs: CatalogService,
        state: Arc<dyn StateStore>,
        jobs: Arc<dyn JobStore>,
        sink: Arc<dyn RecordSink>,
        feed: Arc<dyn JobStatusFeed>,
    ) -> Self {
        Self {
            executor,
            catalogs,
            state,
            jobs,
            sink,
            feed,
            config: SyncJobConfig::default(),
            preflight_check: false,
        }
    }

    pub fn with_config(mut self, config: SyncJobConfig) -> Self {
        self.config = config;
        self
    }

    /// Run CHECK before READ; a failed check ends the job as `ConfigurationInvalid`.
    pub fn with_preflight_check(mut self, enabled: bool) -> Self {
        self.preflight_check = enabled;
        self
    }

    pub fn executor(&self) -> &ConnectorExecutor {
        &self.executor
    }

    pub fn jobs(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    pub fn feed(&self) -> &Arc<dyn JobStatusFeed> {
        &self.feed
    }

    /// Persist a job transition and publish it on the status feed.
    pub(crate) async fn record_transition(&self, job: &SyncJob, insert: bool) -> Result<()> {
        if insert {
            self.jobs.insert_job(job).await?;
        } else {
            self.jobs.update_job(job).await?;
        }
        if let Err(e) = self.feed.publish(JobStatusEvent::from_job(job)).await {
            tracing::warn!(job_id = %job.id, status = %job.status, %e, "job status publish failed");
        }
        Ok(())
    }

    /// Persist a terminal job, retrying transient store errors.
    ///
    /// If the write still fails the job stays non-terminal in the store until
    /// restart recovery fails it; the in-memory job remains authoritative for
    /// this process and is still published on the feed.
    pub(crate) async fn record_terminal(&self, job: &SyncJob) {
        let mut delay = TERMINAL_WRITE_BACKOFF;
        for attempt in 1..=TERMINAL_WRITE_ATTEMPTS {
            let err = match self.jobs.update_job(job).await {
                Ok(()) => break,
                Err(e) => e,
            };
            if attempt < TERMINAL_WRITE_ATTEMPTS && err.is_retryable() {
                tracing::warn!(job_id = %job.id, attempt, error = %err, "terminal job write failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
                continue;
            }
            tracing::error!(job_id = %job.id, status = %job.status, error = %err, "terminal job status not persisted");
            break;
        }
        if let Err(e) = self.feed.publish(JobStatusEvent::from_job(job)).await {
            tracing::warn!(job_id = %job.id, status = %job.status, %e, "job status publish failed");
        }
    }

    /// Execute an admitted PENDING job and return it in its terminal state.
    /// The job must already be in the job store.
    ///
    /// Cancelling `cancel` stops the connector; the job ends CANCELLED once
    /// the process is gone. Checkpoints committed before that stay valid.
    #[tracing::instrument(level = "info", skip_all, fields(job_id = %job.id, connector_id = %connector.id))]
    pub async fn run(
        &self,
        mut job: SyncJob,
        connector: &Connector,
        cancel: CancellationToken,
    ) -> Result<SyncJob> {
        if job.status != JobStatus::Pending {
            return Err(Error::Conflict(format!(
                "job {} is {}, expected pending",
                job.id, job.status
            )));
        }
        if cancel.is_cancelled() {
            job.mark_cancelled()?;
            self.record_terminal(&job).await;
            return Ok(job);
        }

        job.mark_running()?;
        self.record_transition(&job, false).await?;
        tracing::info!(trigger = job.trigger.as_str(), retry_count = job.retry_count, "sync job running");

        let outcome = self.execute(&mut job, connector, &cancel).await;
        match &outcome {
            Outcome::Completed => job.mark_completed()?,
            Outcome::Failed { message, retryable } => {
                job.mark_failed(message.clone(), *retryable)?
            }
            Outcome::Cancelled => job.mark_cancelled()?,
        }
        self.record_terminal(&job).await;

        match &outcome {
            Outcome::Failed { message, retryable } => tracing::warn!(
                records = job.stats.records_total,
                states = job.stats.states_committed,
                retryable,
                error = %message,
                "sync job failed"
            ),
            _ => tracing::info!(
                status = %job.status,
                records = job.stats.records_total,
                states = job.stats.states_committed,
                decode_errors = job.stats.decode_errors,
                duration_ms = job.stats.duration_ms.unwrap_or(0),
                "sync job finished"
            ),
        }
        Ok(job)
    }

    async fn execute(
        &self,
        job: &mut SyncJob,
        connector: &Connector,
        cancel: &CancellationToken,
    ) -> Outcome {
        let prepared = tokio::select! {
            _ = cancel.cancelled() => return Outcome::Cancelled,
            prepared = self.prepare(connector) => prepared,
        };
        let (catalog, states) = match prepared {
            Ok(p) => p,
            Err(e) => return Outcome::from_error(e),
        };

        let mut stream = match self
            .executor
            .read(connector, &connector.config, &catalog, &states, cancel.clone())
            .await
        {
            Ok(s) => s,
            Err(e) => return Outcome::from_error(e),
        };

        let mut pass = ReadPass {
            runner: self,
            job,
            connector_id: &connector.id,
            catalog: &catalog,
            pending: HashMap::new(),
        };
        let outcome = pass.drive(&mut stream).await;
        if !stream.is_finished() {
            stream.terminate().await;
        }
        outcome
    }

    /// Preflight check, catalog resolution and the checkpoints to resume from.
    async fn prepare(&self, connector: &Connector) -> Result<(ConfiguredCatalog, Vec<StateMessage>)> {
        if self.preflight_check {
            let status = self.executor.check(connector, &connector.config).await?;
            if !status.succeeded() {
                return Err(Error::ConfigurationInvalid(
                    status
                        .message
                        .unwrap_or_else(|| "connection check failed".to_string()),
                ));
            }
        }

        let catalog = self.catalogs.configured_catalog_for(connector).await?;
        let checkpoints = self
            .state
            .list(&connector.id)
            .await
            .map_err(|e| Error::StateStoreUnavailable(e.to_string()))?;

        // Full-refresh streams start from scratch; connector-wide state always applies.
        let states = checkpoints
            .iter()
            .filter(|cp| {
                cp.key().is_connector_wide()
                    || catalog
                        .find(&cp.stream, cp.namespace.as_deref())
                        .is_some_and(|s| s.sync_mode == SyncMode::Incremental)
            })
            .map(|cp| cp.to_state_message())
            .collect();
        Ok((catalog, states))
    }
}

/// Per-execution bookkeeping while the READ stream is consumed.
struct ReadPass<'a> {
    runner: &'a SyncJobRunner,
    job: &'a mut SyncJob,
    connector_id: &'a str,
    catalog: &'a ConfiguredCatalog,
    /// Records seen per stream since that stream's last checkpoint.
    pending: HashMap<(String, Option<String>), u64>,
}

impl ReadPass<'_> {
    async fn drive(&mut self, stream: &mut ReadStream) -> Outcome {
        loop {
            let event = match stream.next_event().await {
                Ok(Some(event)) => event,
                Ok(None) => return Outcome::Completed,
                Err(e) => return Outcome::from_error(e),
            };
            let step = match event {
                ProtocolEvent::Message(msg) => self.handle(msg).await,
                ProtocolEvent::DecodeError { .. } => {
                    self.job.stats.decode_errors += 1;
                    Ok(None)
                }
            };
            match step {
                Ok(None) => continue,
                Ok(Some(outcome)) => return outcome,
                Err(e) => return Outcome::from_error(e),
            }
        }
    }

    /// `Ok(Some(_))` ends the pass early.
    async fn handle(&mut self, msg: ConnectorMessage) -> Result<Option<Outcome>> {
        match msg {
            ConnectorMessage::Record { record } => {
                self.accept(record).await?;
                Ok(None)
            }
            ConnectorMessage::State { state } => {
                self.commit(state).await?;
                Ok(None)
            }
            ConnectorMessage::Log { log } => {
                forward_log(self.connector_id, &log);
                Ok(None)
            }
            ConnectorMessage::Trace { trace } => Ok(self.trace(trace)),
            other => {
                tracing::debug!(kind = other.kind(), "ignoring message during read");
                Ok(None)
            }
        }
    }

    async fn accept(&mut self, record: RecordMessage) -> Result<()> {
        self.runner
            .sink
            .accept(
                &record.stream,
                record.namespace.as_deref(),
                &record.data,
                record.emitted_at_utc(),
            )
            .await?;
        let bytes = serde_json::to_vec(&record.data)
            .map(|b| b.len() as u64)
            .unwrap_or(0);
        let label = stream_label(&record.stream, record.namespace.as_deref());
        self.job.stats.record(&label, bytes);
        *self
            .pending
            .entry((record.stream, record.namespace.filter(|ns| !ns.is_empty())))
            .or_default() += 1;
        Ok(())
    }

    /// Commit one checkpoint. Any store failure fails the job: reading on
    /// would produce records that can never be checkpointed.
    async fn commit(&mut self, state: StateMessage) -> Result<()> {
        let key = StateKey::for_message(self.connector_id, &state)?;

        if self.runner.config.flush_sink_before_checkpoint {
            self.runner.sink.flush().await?;
        }

        let (records_delta, cursor_field) = if key.is_connector_wide() {
            (self.pending.drain().map(|(_, n)| n).sum(), Vec::new())
        } else {
            let delta = self
                .pending
                .remove(&(key.stream.clone(), key.namespace.clone()))
                .unwrap_or(0);
            let cursor_field = self
                .catalog
                .find(&key.stream, key.namespace.as_deref())
                .map(|s| s.cursor_field.clone())
                .unwrap_or_default();
            (delta, cursor_field)
        };

        let update = StateUpdate {
            state_type: state.state_type,
            payload: state.data,
            cursor_field,
            records_delta,
        };
        self.runner
            .state
            .update(&key, update)
            .await
            .map_err(|e| Error::StateStoreUnavailable(e.to_string()))?;

        let label = match state.state_type {
            StateType::Stream => Some(stream_label(&key.stream, key.namespace.as_deref())),
            StateType::Global | StateType::Legacy => None,
        };
        self.job.stats.state_committed(label.as_deref());
        tracing::debug!(stream = %key.stream, records_delta, "checkpoint committed");
        Ok(())
    }

    fn trace(&mut self, trace: TraceMessage) -> Option<Outcome> {
        match trace.trace_type {
            TraceType::Error => {
                let error = trace.error?;
                Some(Outcome::Failed {
                    message: error.detail(),
                    retryable: error.failure_type != Some(FailureType::ConfigError),
                })
            }
            TraceType::Estimate => {
                if let Some(est) = trace.estimate {
                    let label = stream_label(&est.name, est.namespace.as_deref());
                    self.job
                        .stats
                        .estimate(&label, est.row_estimate, est.byte_estimate);
                }
                None
            }
            TraceType::StreamStatus => {
                if let Some(status) = trace.stream_status {
                    tracing::debug!(
                        stream = %status.stream_descriptor.name,
                        status = %status.status,
                        "stream status"
                    );
                }
                None
            }
        }
    }
}

fn forward_log(connector_id: &str, log: &LogMessage) {
    let msg = &log.message;
    match log.level {
        LogLevel::Fatal | LogLevel::Error => {
            tracing::error!(target: "conduit::connector", %connector_id, "{msg}")
        }
        LogLevel::Warn => tracing::warn!(target: "conduit::connector", %connector_id, "{msg}"),
        LogLevel::Info => tracing::info!(target: "conduit::connector", %connector_id, "{msg}"),
        LogLevel::Debug => tracing::debug!(target: "conduit::connector", %connector_id, "{msg}"),
        LogLevel::Trace => tracing::trace!(target: "conduit::connector", %connector_id, "{msg}"),
    }
}
