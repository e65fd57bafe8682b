use crate::Result;
use crate::state::models::{CheckpointState, StateKey, StateSnapshot, StateUpdate};
use crate::state::traits::StateStore;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// In-memory StateStore for local development and unit tests.
///
/// Not durable; a single lock makes every operation atomic.
#[derive(Clone, Default)]
pub struct MemoryStateStore {
    rows: Arc<Mutex<BTreeMap<StateKey, CheckpointState>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &StateKey) -> Result<Option<CheckpointState>> {
        Ok(self.rows.lock().await.get(key).cloned())
    }

    #[tracing::instrument(level = "debug", skip(self, update), fields(records_delta = update.records_delta))]
    async fn update(&self, key: &StateKey, update: StateUpdate) -> Result<CheckpointState> {
        let cursor_value = update.cursor_value();
        let mut rows = self.rows.lock().await;
        let previous = rows.get(key).map(|cp| cp.records_synced).unwrap_or(0);
        let row = CheckpointState {
            connector_id: key.connector_id.clone(),
            stream: key.stream.clone(),
            namespace: key.namespace.clone(),
            state_type: update.state_type,
            payload: update.payload,
            cursor_field: update.cursor_field,
            cursor_value,
            records_synced: previous.saturating_add(update.records_delta),
            updated_at: Utc::now(),
        };
        rows.insert(key.clone(), row.clone());
        Ok(row)
    }

    async fn clear(
        &self,
        connector_id: &str,
        stream: Option<&str>,
        namespace: Option<&str>,
    ) -> Result<u64> {
        let mut rows = self.rows.lock().await;
        let before = rows.len();
        rows.retain(|k, _| {
            let matches = k.connector_id == connector_id
                && stream.map_or(true, |s| k.stream == s)
                && namespace.map_or(true, |ns| k.namespace.as_deref() == Some(ns));
            !matches
        });
        Ok((before - rows.len()) as u64)
    }

    async fn list(&self, connector_id: &str) -> Result<Vec<CheckpointState>> {
        let rows = self.rows.lock().await;
        Ok(rows
            .values()
            .filter(|cp| cp.connector_id == connector_id)
            .cloned()
            .collect())
    }

    #[tracing::instrument(level = "info", skip(self, snapshot))]
    async fn import_snapshot(&self, connector_id: &str, snapshot: StateSnapshot) -> Result<usize> {
        snapshot.validate_for(connector_id)?;
        let mut rows = self.rows.lock().await;
        rows.retain(|k, _| k.connector_id != connector_id);
        let count = snapshot.streams.len();
        for entry in snapshot.streams {
            let cp = entry.into_checkpoint(connector_id);
            rows.insert(cp.key(), cp);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::StateType;

    fn key(stream: &str) -> StateKey {
        StateKey::new("orders-db", stream, None).unwrap()
    }

    fn update(cursor: i64, delta: u64) -> StateUpdate {
        StateUpdate {
            state_type: StateType::Stream,
            payload: serde_json::json!({"cursor": cursor}),
            cursor_field: vec![],
            records_delta: delta,
        }
    }

    #[tokio::test]
    async fn update_overwrites_payload_and_accumulates_count() {
        let store = MemoryStateStore::new();
        store.update(&key("orders"), update(1, 10)).await.unwrap();
        let cp = store.update(&key("orders"), update(2, 5)).await.unwrap();
        assert_eq!(cp.payload, serde_json::json!({"cursor": 2}));
        assert_eq!(cp.cursor_value, Some(serde_json::json!(2)));
        assert_eq!(cp.records_synced, 15);
        assert_eq!(store.get(&key("orders")).await.unwrap(), Some(cp));
    }

    #[tokio::test]
    async fn clear_single_stream_or_connector() {
        let store = MemoryStateStore::new();
        store.update(&key("orders"), update(1, 1)).await.unwrap();
        store.update(&key("customers"), update(1, 1)).await.unwrap();
        let other = StateKey::new("billing", "invoices", None).unwrap();
        store.update(&other, update(1, 1)).await.unwrap();

        assert_eq!(store.clear("orders-db", Some("orders"), None).await.unwrap(), 1);
        assert!(store.get(&key("orders")).await.unwrap().is_none());
        assert!(store.get(&key("customers")).await.unwrap().is_some());

        assert_eq!(store.clear("orders-db", None, None).await.unwrap(), 1);
        assert!(store.list("orders-db").await.unwrap().is_empty());
        assert!(store.get(&other).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn import_replaces_previous_state() {
        let source = MemoryStateStore::new();
        source.update(&key("orders"), update(9, 3)).await.unwrap();
        let blob = source.export("orders-db").await.unwrap();

        let target = MemoryStateStore::new();
        target.update(&key("stale"), update(1, 1)).await.unwrap();
        assert_eq!(target.import("orders-db", &blob).await.unwrap(), 1);
        assert!(target.get(&key("stale")).await.unwrap().is_none());
        assert_eq!(
            target.get(&key("orders")).await.unwrap(),
            source.get(&key("orders")).await.unwrap()
        );
    }

    #[tokio::test]
    async fn import_for_another_connector_is_rejected() {
        let source = MemoryStateStore::new();
        source.update(&key("orders"), update(9, 3)).await.unwrap();
        let blob = source.export("orders-db").await.unwrap();

        let target = MemoryStateStore::new();
        target.update(&StateKey::new("billing", "x", None).unwrap(), update(1, 1)).await.unwrap();
        assert!(target.import("billing", &blob).await.is_err());
        assert_eq!(target.list("billing").await.unwrap().len(), 1);
    }
}
