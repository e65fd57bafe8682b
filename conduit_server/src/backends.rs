use conduit_core::catalog::CatalogService;
use conduit_core::executor::SubprocessLauncher;
use conduit_core::jobs::JsonLinesSink;
use conduit_core::{
    BroadcastJobFeed, ConduitConfig, Connector, ConnectorExecutor, ConnectorRegistry,
    JobStatusEvent, Schedule, SqliteStore, SyncJobRunner, SyncScheduler,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const FEED_CAPACITY: usize = 1024;

/// Everything the `conduit` commands run against.
pub struct App {
    pub config: ConduitConfig,
    pub store: SqliteStore,
    pub executor: ConnectorExecutor,
    pub scheduler: SyncScheduler,
    pub feed: BroadcastJobFeed,
}

#[tracing::instrument(level = "info", skip(config), fields(db = %config.database_path.display()))]
pub async fn build_app(config: ConduitConfig, sink_dir: PathBuf) -> anyhow::Result<App> {
    let store = SqliteStore::open(&config.database_path).await?;
    let executor = ConnectorExecutor::new(
        Arc::new(
            SubprocessLauncher::new(config.executor.docker_bin.clone())?
                .with_max_line_bytes(config.executor.max_line_bytes),
        ),
        config.executor.clone(),
    );
    let catalogs = CatalogService::new(executor.clone(), Arc::new(store.clone()));
    let feed = BroadcastJobFeed::new(FEED_CAPACITY);
    let runner = SyncJobRunner::new(
        executor.clone(),
        catalogs,
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(JsonLinesSink::new(sink_dir).await?),
        Arc::new(feed.clone()),
    )
    .with_config(config.job.clone())
    .with_preflight_check(config.scheduler.preflight_check);
    let scheduler = SyncScheduler::new(
        runner,
        Arc::new(store.clone()),
        config.scheduler.clone(),
        config.retry.clone(),
    )?;
    Ok(App {
        config,
        store,
        executor,
        scheduler,
        feed,
    })
}

impl App {
    pub async fn connector(&self, id: &str) -> anyhow::Result<Connector> {
        self.store
            .get_connector(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("unknown connector: {id}"))
    }

    /// Log job status changes until `cancel` fires.
    pub fn log_feed(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let mut rx = self.feed.subscribe();
        tokio::spawn(async move {
            loop {
                let event: JobStatusEvent = tokio::select! {
                    _ = cancel.cancelled() => return,
                    ev = rx.recv() => match ev {
                        Ok(ev) => ev,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(skipped = n, "job feed subscriber lagged");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                };
                tracing::info!(
                    job_id = %event.job_id,
                    connector_id = %event.connector_id,
                    status = %event.status,
                    records = event.stats.records_total,
                    error = event.error.as_deref().unwrap_or(""),
                    "sync job status"
                );
            }
        })
    }
}

/// Contents of a `conduit connector put` file.
#[derive(Debug, Deserialize)]
pub struct ConnectorFile {
    pub connector: Connector,
    #[serde(default)]
    pub schedule: Option<Schedule>,
}

impl ConnectorFile {
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let body = tokio::fs::read_to_string(path).await?;
        let file: ConnectorFile = serde_json::from_str(&body)?;
        if let Some(schedule) = &file.schedule {
            anyhow::ensure!(
                schedule.connector_id == file.connector.id,
                "schedule is for '{}' but connector is '{}'",
                schedule.connector_id,
                file.connector.id
            );
        }
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::{ConnectorStatus, ExecutionRef};

    #[tokio::test]
    async fn connector_file_with_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.json");
        std::fs::write(
            &path,
            r#"{
              "connector": {
                "id": "orders-db",
                "name": "Orders",
                "execution": {"type": "docker", "image": "acme/source-orders:1.2"},
                "config": {"host": "db.internal"}
              },
              "schedule": {"connector_id": "orders-db", "cron_expression": "*/15 * * * *"}
            }"#,
        )
        .unwrap();
        let file = ConnectorFile::load(&path).await.unwrap();
        assert_eq!(file.connector.status, ConnectorStatus::Never);
        assert!(matches!(file.connector.execution, ExecutionRef::Docker { .. }));
        assert_eq!(file.schedule.unwrap().max_concurrent_runs, 1);
    }

    #[tokio::test]
    async fn schedule_for_another_connector_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.json");
        std::fs::write(
            &path,
            r#"{
              "connector": {"id": "orders-db", "name": "Orders", "execution": {"type": "in_process", "adapter": "x"}, "config": {}},
              "schedule": {"connector_id": "other", "cron_expression": "0 * * * *", "enabled": true}
            }"#,
        )
        .unwrap();
        assert!(ConnectorFile::load(&path).await.is_err());
    }
}
