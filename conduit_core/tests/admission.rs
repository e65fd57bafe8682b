use async_trait::async_trait;
use conduit_core::catalog::{CatalogService, MemoryCatalogCache};
use conduit_core::executor::{AdapterContext, ConnectorExecutor, InProcessConnector, InProcessLauncher};
use conduit_core::feed::MemoryJobFeed;
use conduit_core::jobs::{MemoryJobStore, MemoryRecordSink, SyncJobRunner};
use conduit_core::protocol::{ConnectorInput, InvocationMode};
use conduit_core::state::MemoryStateStore;
use conduit_core::{
    Connector, Error, ExecutionRef, ExecutorConfig, JobQuery, JobStatus, MemoryRegistry, Result,
    RetryPolicy, SchedulerConfig, SyncJob, SyncScheduler, TriggerType,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

const CATALOG: &str = r#"{"type":"CATALOG","catalog":{"streams":[{"name":"orders","supported_sync_modes":["full_refresh"]}]}}"#;
const BURST: usize = 16;

/// Reads until asked to stop.
struct Endless;

#[async_trait]
impl InProcessConnector for Endless {
    async fn run(&self, mode: InvocationMode, _: Vec<ConnectorInput>, ctx: AdapterContext) -> i32 {
        match mode {
            InvocationMode::Discover => {
                let _ = ctx.raw(CATALOG).await;
                0
            }
            InvocationMode::Read => {
                ctx.cancellation().cancelled().await;
                143
            }
            _ => 1,
        }
    }
}

async fn scheduler(config: SchedulerConfig) -> SyncScheduler {
    let launcher = InProcessLauncher::new();
    launcher.register("endless", Arc::new(Endless)).unwrap();
    let executor = ConnectorExecutor::new(
        Arc::new(launcher),
        ExecutorConfig {
            termination_grace: Duration::from_millis(200),
            ..ExecutorConfig::default()
        },
    );
    let catalogs = CatalogService::new(executor.clone(), Arc::new(MemoryCatalogCache::new()));
    let runner = SyncJobRunner::new(
        executor,
        catalogs,
        Arc::new(MemoryStateStore::new()),
        Arc::new(MemoryJobStore::new()),
        Arc::new(MemoryRecordSink::new()),
        Arc::new(MemoryJobFeed::new()),
    );
    let registry = MemoryRegistry::new();
    registry
        .upsert_connector(
            Connector::new(
                "orders-db",
                "Orders",
                ExecutionRef::InProcess {
                    adapter: "endless".into(),
                },
                serde_json::json!({}),
            )
            .unwrap(),
        )
        .await
        .unwrap();
    SyncScheduler::new(runner, Arc::new(registry), config, RetryPolicy::none()).unwrap()
}

async fn burst(scheduler: &SyncScheduler, trigger: TriggerType) -> Vec<Result<SyncJob>> {
    let mut set = JoinSet::new();
    for _ in 0..BURST {
        let scheduler = scheduler.clone();
        set.spawn(async move { scheduler.trigger("orders-db", trigger).await });
    }
    let mut out = Vec::new();
    while let Some(res) = set.join_next().await {
        out.push(res.unwrap());
    }
    out
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn manual_burst_admits_exactly_one() {
    let scheduler = scheduler(SchedulerConfig::default()).await;
    let results = burst(&scheduler, TriggerType::Manual).await;

    let admitted = results.iter().filter(|r| r.is_ok()).count();
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(Error::ConcurrencyLimitExceeded(_))))
        .count();
    assert_eq!(admitted, 1);
    assert_eq!(rejected, BURST - 1);
    assert_eq!(scheduler.running_count("orders-db"), 1);
    assert_eq!(scheduler.queued_count(), 0);

    scheduler.shutdown().await;
    assert_eq!(scheduler.running_count("orders-db"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scheduled_burst_queues_behind_the_limit() {
    let scheduler = scheduler(SchedulerConfig::default()).await;
    let results = burst(&scheduler, TriggerType::Scheduled).await;
    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(scheduler.running_count("orders-db"), 1);
    assert_eq!(scheduler.queued_count(), BURST - 1);

    // Cancelling the running job hands the slot to exactly one queued job.
    let running = scheduler.running_jobs();
    assert_eq!(running.len(), 1);
    let stopped = scheduler.cancel(running[0]).await.unwrap();
    assert_eq!(stopped.status, JobStatus::Cancelled);
    assert_eq!(scheduler.running_count("orders-db"), 1);
    assert_eq!(scheduler.queued_count(), BURST - 2);

    scheduler.shutdown().await;
    let jobs = scheduler
        .history(&JobQuery {
            limit: 100,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(jobs.len(), BURST);
    assert!(jobs.iter().all(|j| j.status == JobStatus::Cancelled));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn global_cap_limits_all_connectors() {
    let config = SchedulerConfig {
        global_max_running: Some(1),
        reject_manual_when_busy: false,
        ..SchedulerConfig::default()
    };
    let scheduler = scheduler(config).await;
    let results = burst(&scheduler, TriggerType::Manual).await;
    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(scheduler.running_jobs().len(), 1);
    scheduler.shutdown().await;
}
