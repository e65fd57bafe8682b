//! Conduit core library: connector protocol, execution, checkpoint state and
//! sync scheduling.

pub mod catalog;
pub mod config;
pub mod error;
pub mod executor;
pub mod feed;
pub mod jobs;
pub mod models;
pub mod o11y;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod sqlite;
pub mod state;

pub use catalog::{CatalogCache, CatalogService, MemoryCatalogCache, config_hash};
pub use config::{ConduitConfig, ExecutorConfig, LogConfig, LogFormat, SchedulerConfig, SyncJobConfig};
pub use error::{Error, Result};
pub use executor::ConnectorExecutor;
pub use feed::{BroadcastJobFeed, JobStatusEvent, JobStatusFeed, MemoryJobFeed};
pub use jobs::{JobQuery, JobStatus, JobStore, RecordSink, SyncJob, SyncJobRunner};
pub use models::{Connector, ConnectorStatus, ExecutionRef, JobId, Schedule, TriggerType};
pub use registry::{ConnectorRegistry, MemoryRegistry};
pub use scheduler::{RetryPolicy, SyncScheduler};
pub use sqlite::SqliteStore;
pub use state::{CheckpointState, StateKey, StateStore};
