//! Sync jobs: the job record, its history store and the runner that drives
//! one READ through to a terminal status.

pub mod memory;
pub mod models;
pub mod runner;
pub mod sink;
pub mod traits;

pub use memory::{MemoryJobStore, MemoryRecordSink, SinkRecord};
pub use models::{JobQuery, JobStats, JobStatus, StreamStats, SyncJob, stream_label};
pub use runner::SyncJobRunner;
pub use sink::JsonLinesSink;
pub use traits::{JobStore, RecordSink};
