#![allow(dead_code)]

use conduit_core::catalog::CatalogService;
use conduit_core::executor::{ConnectorExecutor, SubprocessLauncher};
use conduit_core::feed::MemoryJobFeed;
use conduit_core::jobs::{MemoryRecordSink, SyncJobRunner};
use conduit_core::{
    Connector, ExecutionRef, ExecutorConfig, RetryPolicy, SchedulerConfig, SqliteStore,
    SyncScheduler,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const CATALOG: &str = r#"{"type":"CATALOG","catalog":{"streams":[{"name":"orders","supported_sync_modes":["full_refresh","incremental"],"source_defined_cursor":true,"default_cursor_field":["cursor"]}]}}"#;

/// Shell snippet printing RECORD and STATE lines for ids `$i..=$LAST_ID`,
/// starting after the cursor found in the STATE input (if any).
pub const EMIT_AFTER_CURSOR: &str = r#"
cursor=$(grep '"type":"STATE"' | sed -n 's/.*"cursor":\([0-9]*\).*/\1/p' | tail -n 1)
i=$(( ${cursor:-0} + 1 ))
while [ "$i" -le "$LAST_ID" ]; do
  echo "{\"type\":\"RECORD\",\"record\":{\"stream\":\"orders\",\"emitted_at\":1700000000000,\"data\":{\"id\":$i}}}"
  echo "{\"type\":\"STATE\",\"state\":{\"type\":\"STREAM\",\"stream\":{\"name\":\"orders\"},\"data\":{\"cursor\":$i}}}"
  i=$((i + 1))
done
"#;

pub fn record_line(id: i64) -> String {
    format!(
        r#"{{"type":"RECORD","record":{{"stream":"orders","emitted_at":1700000000000,"data":{{"id":{id}}}}}}}"#
    )
}

pub fn state_line(cursor: i64) -> String {
    format!(
        r#"{{"type":"STATE","state":{{"type":"STREAM","stream":{{"name":"orders"}},"data":{{"cursor":{cursor}}}}}}}"#
    )
}

/// A connector run as `sh -c <script> connector <mode>`; the read branch is `read_body`.
pub fn sh_connector(id: &str, read_body: &str, env: &[(&str, &str)]) -> Connector {
    let script = format!(
        r#"
case "$1" in
  spec) echo '{{"type":"SPEC","spec":{{"connection_specification":{{"type":"object"}}}}}}' ;;
  check) echo '{{"type":"CONNECTION_STATUS","connection_status":{{"status":"SUCCEEDED"}}}}' ;;
  discover) echo '{CATALOG}' ;;
  read)
{read_body}
    ;;
esac
"#
    );
    Connector::new(
        id,
        "shell connector",
        ExecutionRef::Command {
            program: "sh".into(),
            args: vec!["-c".into(), script, "connector".into()],
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        },
        serde_json::json!({}),
    )
    .unwrap()
}

pub fn executor_config() -> ExecutorConfig {
    ExecutorConfig {
        check_timeout: Duration::from_secs(10),
        idle_timeout: Duration::from_secs(10),
        termination_grace: Duration::from_millis(300),
        ..ExecutorConfig::default()
    }
}

/// Scheduler wired against a SQLite file the way the `conduit` binary does it.
pub struct Stack {
    pub store: SqliteStore,
    pub scheduler: SyncScheduler,
    pub executor: ConnectorExecutor,
    pub feed: MemoryJobFeed,
}

pub async fn stack(db: &Path, sink: &MemoryRecordSink, retry: RetryPolicy) -> Stack {
    let store = SqliteStore::open(db).await.unwrap();
    let executor = ConnectorExecutor::new(Arc::new(SubprocessLauncher::default()), executor_config());
    let catalogs = CatalogService::new(executor.clone(), Arc::new(store.clone()));
    let feed = MemoryJobFeed::new();
    let runner = SyncJobRunner::new(
        executor.clone(),
        catalogs,
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(sink.clone()),
        Arc::new(feed.clone()),
    );
    let scheduler = SyncScheduler::new(
        runner,
        Arc::new(store.clone()),
        SchedulerConfig::default(),
        retry,
    )
    .unwrap();
    Stack {
        store,
        scheduler,
        executor,
        feed,
    }
}
