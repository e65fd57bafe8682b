//! Durable per-stream checkpoint state.

pub mod memory;
pub mod models;
pub mod traits;

pub use memory::MemoryStateStore;
pub use models::{
    CONNECTOR_STREAM, CheckpointState, SNAPSHOT_VERSION, SnapshotEntry, StateKey, StateSnapshot,
    StateUpdate, extract_cursor_value,
};
pub use traits::StateStore;
