use crate::scheduler::retry::RetryPolicy;
use crate::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Bound for SPEC and CHECK invocations.
    pub check_timeout: Duration,
    pub discover_timeout: Duration,
    /// Absolute bound for a READ invocation.
    pub read_timeout: Duration,
    /// Longest a READ may go without a stdout line before it is considered hung.
    pub idle_timeout: Duration,
    /// Time between the graceful stop request and the forced kill.
    pub termination_grace: Duration,
    pub stderr_ring_capacity: usize,
    pub max_line_bytes: usize,
    pub docker_bin: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            check_timeout: Duration::from_secs(30),
            discover_timeout: Duration::from_secs(300),
            read_timeout: Duration::from_secs(24 * 60 * 60),
            idle_timeout: Duration::from_secs(600),
            termination_grace: Duration::from_secs(10),
            stderr_ring_capacity: 200,
            max_line_bytes: crate::protocol::codec::DEFAULT_MAX_LINE_BYTES,
            docker_bin: "docker".to_string(),
        }
    }
}

impl ExecutorConfig {
    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        for (name, d) in [
            ("check_timeout", self.check_timeout),
            ("discover_timeout", self.discover_timeout),
            ("read_timeout", self.read_timeout),
            ("idle_timeout", self.idle_timeout),
            ("termination_grace", self.termination_grace),
        ] {
            if d.is_zero() {
                return Err(Error::InvalidInput(format!("executor.{name} must be > 0")));
            }
        }
        if self.stderr_ring_capacity == 0 {
            return Err(Error::InvalidInput(
                "executor.stderr_ring_capacity must be > 0".to_string(),
            ));
        }
        if self.max_line_bytes == 0 {
            return Err(Error::InvalidInput(
                "executor.max_line_bytes must be > 0".to_string(),
            ));
        }
        if self.docker_bin.trim().is_empty() {
            return Err(Error::InvalidInput("executor.docker_bin is empty".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the timer loop evaluates cron schedules.
    pub poll_interval: Duration,
    /// Platform-wide cap on RUNNING jobs; `None` means unbounded.
    pub global_max_running: Option<usize>,
    /// Reject manual/API triggers for a busy connector instead of queueing them.
    pub reject_manual_when_busy: bool,
    /// Upper bound on backfilled runs per schedule and tick.
    pub max_catch_up_runs: usize,
    /// Run CHECK before READ and fail with `ConfigurationInvalid` when it fails.
    pub preflight_check: bool,
    /// How long `cancel` waits for a running job to reach CANCELLED.
    pub cancel_wait: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            global_max_running: None,
            reject_manual_when_busy: true,
            max_catch_up_runs: 10,
            preflight_check: false,
            cancel_wait: Duration::from_secs(30),
        }
    }
}

impl SchedulerConfig {
    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(Error::InvalidInput(
                "scheduler.poll_interval must be > 0".to_string(),
            ));
        }
        if self.global_max_running == Some(0) {
            return Err(Error::InvalidInput(
                "scheduler.global_max_running must be > 0 when set".to_string(),
            ));
        }
        if self.cancel_wait.is_zero() {
            return Err(Error::InvalidInput(
                "scheduler.cancel_wait must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncJobConfig {
    /// Call `RecordSink::flush` before each checkpoint commit.
    pub flush_sink_before_checkpoint: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Used when `RUST_LOG` is unset.
    pub default_filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            default_filter: "info".to_string(),
        }
    }
}

/// Top-level configuration for the sync subsystem.
#[derive(Debug, Clone)]
pub struct ConduitConfig {
    pub database_path: PathBuf,
    pub executor: ExecutorConfig,
    pub scheduler: SchedulerConfig,
    pub retry: RetryPolicy,
    pub job: SyncJobConfig,
    pub log: LogConfig,
}

impl Default for ConduitConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./data/conduit.db"),
            executor: ExecutorConfig::default(),
            scheduler: SchedulerConfig::default(),
            retry: RetryPolicy::default(),
            job: SyncJobConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl ConduitConfig {
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        let d = Self::default();

        let database_path = std::env::var("CONDUIT_DB_PATH")
            .ok()
            .map(PathBuf::from)
            .unwrap_or(d.database_path);

        let executor = ExecutorConfig {
            check_timeout: env_ms("CONDUIT_CHECK_TIMEOUT_MS")?.unwrap_or(d.executor.check_timeout),
            discover_timeout: env_ms("CONDUIT_DISCOVER_TIMEOUT_MS")?
                .unwrap_or(d.executor.discover_timeout),
            read_timeout: env_ms("CONDUIT_READ_TIMEOUT_MS")?.unwrap_or(d.executor.read_timeout),
            idle_timeout: env_ms("CONDUIT_IDLE_TIMEOUT_MS")?.unwrap_or(d.executor.idle_timeout),
            termination_grace: env_ms("CONDUIT_TERMINATION_GRACE_MS")?
                .unwrap_or(d.executor.termination_grace),
            stderr_ring_capacity: env_parse("CONDUIT_STDERR_RING_LINES")?
                .unwrap_or(d.executor.stderr_ring_capacity),
            max_line_bytes: env_parse("CONDUIT_MAX_LINE_BYTES")?
                .unwrap_or(d.executor.max_line_bytes),
            docker_bin: std::env::var("CONDUIT_DOCKER_BIN").unwrap_or(d.executor.docker_bin),
        };

        let scheduler = SchedulerConfig {
            poll_interval: env_ms("CONDUIT_POLL_INTERVAL_MS")?
                .unwrap_or(d.scheduler.poll_interval),
            global_max_running: env_parse("CONDUIT_GLOBAL_MAX_RUNNING")?
                .or(d.scheduler.global_max_running),
            reject_manual_when_busy: env_parse("CONDUIT_REJECT_MANUAL_WHEN_BUSY")?
                .unwrap_or(d.scheduler.reject_manual_when_busy),
            max_catch_up_runs: env_parse("CONDUIT_MAX_CATCH_UP_RUNS")?
                .unwrap_or(d.scheduler.max_catch_up_runs),
            preflight_check: env_parse("CONDUIT_PREFLIGHT_CHECK")?
                .unwrap_or(d.scheduler.preflight_check),
            cancel_wait: env_ms("CONDUIT_CANCEL_WAIT_MS")?.unwrap_or(d.scheduler.cancel_wait),
        };

        let retry = RetryPolicy {
            max_attempts: env_parse("CONDUIT_RETRY_MAX_ATTEMPTS")?.unwrap_or(d.retry.max_attempts),
            base: env_ms("CONDUIT_RETRY_BASE_MS")?.unwrap_or(d.retry.base),
            max: env_ms("CONDUIT_RETRY_MAX_MS")?.unwrap_or(d.retry.max),
        };

        let job = SyncJobConfig {
            flush_sink_before_checkpoint: env_parse("CONDUIT_FLUSH_SINK_BEFORE_CHECKPOINT")?
                .unwrap_or(d.job.flush_sink_before_checkpoint),
        };

        let format = match std::env::var("CONDUIT_LOG_FORMAT").ok().as_deref() {
            None | Some("json") => LogFormat::Json,
            Some("pretty") | Some("text") => LogFormat::Pretty,
            Some(other) => {
                return Err(Error::InvalidInput(format!(
                    "CONDUIT_LOG_FORMAT must be json or pretty, got '{other}'"
                )));
            }
        };

        let cfg = Self {
            database_path,
            executor,
            scheduler,
            retry,
            job,
            log: LogConfig {
                format,
                default_filter: d.log.default_filter,
            },
        };
        cfg.validate()?;
        Ok(cfg)
    }

    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(Error::InvalidInput("database_path is empty".to_string()));
        }
        self.executor.validate()?;
        self.scheduler.validate()?;
        self.retry.validate()?;
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::InvalidInput(format!("{name} has an invalid value: '{v}'"))),
        _ => Ok(None),
    }
}

fn env_ms(name: &str) -> Result<Option<Duration>> {
    Ok(env_parse::<u64>(name)?.map(Duration::from_millis))
}
