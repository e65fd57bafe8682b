//! Cron scheduling, admission control and retries for sync jobs.

pub mod admission;
pub mod cron;
pub mod engine;
pub mod retry;

pub use admission::{Admit, AdmissionQueue, Saturation};
pub use engine::SyncScheduler;
pub use retry::RetryPolicy;
