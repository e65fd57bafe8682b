//! Connector and schedule definitions, as seen by the scheduler.

use crate::models::{Connector, ConnectorStatus, Schedule};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[async_trait]
pub trait ConnectorRegistry: Send + Sync {
    async fn get_connector(&self, id: &str) -> Result<Option<Connector>>;

    async fn list_connectors(&self) -> Result<Vec<Connector>>;

    async fn get_schedule(&self, connector_id: &str) -> Result<Option<Schedule>>;

    async fn list_schedules(&self) -> Result<Vec<Schedule>>;

    /// Record the outcome of the most recent run.
    async fn update_connector_status(
        &self,
        id: &str,
        status: ConnectorStatus,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// The schedule that governs `connector`: an explicit schedule wins, else
    /// one derived from the connector's own cron expression.
    async fn effective_schedule(&self, connector: &Connector) -> Result<Option<Schedule>> {
        if let Some(schedule) = self.get_schedule(&connector.id).await? {
            return Ok(Some(schedule));
        }
        match connector.cron_expression.as_deref() {
            Some(expr) => Ok(Some(Schedule::new(connector.id.clone(), expr)?)),
            None => Ok(None),
        }
    }
}

/// In-memory registry for local development and tests.
#[derive(Clone, Default)]
pub struct MemoryRegistry {
    connectors: Arc<RwLock<BTreeMap<String, Connector>>>,
    schedules: Arc<RwLock<BTreeMap<String, Schedule>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert_connector(&self, connector: Connector) -> Result<()> {
        connector.execution.validate()?;
        self.connectors
            .write()
            .await
            .insert(connector.id.clone(), connector);
        Ok(())
    }

    pub async fn upsert_schedule(&self, schedule: Schedule) -> Result<()> {
        crate::scheduler::cron::parse_schedule(&schedule.cron_expression)?;
        self.schedules
            .write()
            .await
            .insert(schedule.connector_id.clone(), schedule);
        Ok(())
    }
}

#[async_trait]
impl ConnectorRegistry for MemoryRegistry {
    async fn get_connector(&self, id: &str) -> Result<Option<Connector>> {
        Ok(self.connectors.read().await.get(id).cloned())
    }

    async fn list_connectors(&self) -> Result<Vec<Connector>> {
        Ok(self.connectors.read().await.values().cloned().collect())
    }

    async fn get_schedule(&self, connector_id: &str) -> Result<Option<Schedule>> {
        Ok(self.schedules.read().await.get(connector_id).cloned())
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        Ok(self.schedules.read().await.values().cloned().collect())
    }

    async fn update_connector_status(
        &self,
        id: &str,
        status: ConnectorStatus,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut connectors = self.connectors.write().await;
        let connector = connectors
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("connector {id}")))?;
        connector.status = status;
        connector.status_at = Some(at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExecutionRef;

    fn connector(id: &str) -> Connector {
        Connector::new(
            id,
            "Orders",
            ExecutionRef::Docker {
                image: "acme/source-orders:1.2".into(),
                args: vec![],
            },
            serde_json::json!({}),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn status_is_written_back() {
        let reg = MemoryRegistry::new();
        reg.upsert_connector(connector("orders-db")).await.unwrap();
        let at = Utc::now();
        reg.update_connector_status("orders-db", ConnectorStatus::Failed, at)
            .await
            .unwrap();
        let c = reg.get_connector("orders-db").await.unwrap().unwrap();
        assert_eq!(c.status, ConnectorStatus::Failed);
        assert_eq!(c.status_at, Some(at));

        let err = reg
            .update_connector_status("missing", ConnectorStatus::Failed, at)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn explicit_schedule_wins_over_connector_cron() {
        let reg = MemoryRegistry::new();
        let mut c = connector("orders-db");
        c.cron_expression = Some("0 * * * *".into());
        reg.upsert_connector(c.clone()).await.unwrap();
        assert_eq!(
            reg.effective_schedule(&c).await.unwrap().unwrap().cron_expression,
            "0 * * * *"
        );

        let mut s = Schedule::new("orders-db", "*/5 * * * *").unwrap();
        s.max_concurrent_runs = 2;
        reg.upsert_schedule(s.clone()).await.unwrap();
        assert_eq!(reg.effective_schedule(&c).await.unwrap(), Some(s));

        c.id = "other".into();
        c.cron_expression = None;
        assert_eq!(reg.effective_schedule(&c).await.unwrap(), None);
    }
}
