use crate::Result;
use crate::state::models::{CheckpointState, StateKey, StateSnapshot, StateUpdate};
use async_trait::async_trait;

/// Durable checkpoint storage.
///
/// Every operation is atomic with respect to a key: readers see either the
/// previous row or the fully written new one, never a mix.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &StateKey) -> Result<Option<CheckpointState>>;

    /// Upsert. Overwrites payload, state type and cursor metadata and adds
    /// `records_delta` to the running counter.
    async fn update(&self, key: &StateKey, update: StateUpdate) -> Result<CheckpointState>;

    /// Delete state to force a full refresh. `stream = None` clears the whole
    /// connector; `namespace` narrows a stream to one namespace when given.
    /// Returns the number of rows removed.
    async fn clear(
        &self,
        connector_id: &str,
        stream: Option<&str>,
        namespace: Option<&str>,
    ) -> Result<u64>;

    /// All current checkpoints of a connector, ordered by stream and namespace.
    async fn list(&self, connector_id: &str) -> Result<Vec<CheckpointState>>;

    async fn export_snapshot(&self, connector_id: &str) -> Result<StateSnapshot> {
        let checkpoints = self.list(connector_id).await?;
        Ok(StateSnapshot::new(connector_id, &checkpoints))
    }

    /// Validate, then replace the connector's state with the snapshot in one
    /// atomic step. Returns the number of rows written.
    async fn import_snapshot(&self, connector_id: &str, snapshot: StateSnapshot) -> Result<usize>;

    /// Serialized snapshot (`StateSnapshot` as JSON).
    async fn export(&self, connector_id: &str) -> Result<String> {
        self.export_snapshot(connector_id).await?.to_json()
    }

    async fn import(&self, connector_id: &str, blob: &str) -> Result<usize> {
        let snapshot = StateSnapshot::from_json(blob)?;
        self.import_snapshot(connector_id, snapshot).await
    }
}
