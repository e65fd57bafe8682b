use crate::executor::ConnectorExecutor;
use crate::models::Connector;
use crate::protocol::{Catalog, ConfiguredCatalog};
use crate::{Error, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Discovered catalogs keyed by connector and configuration hash.
#[async_trait]
pub trait CatalogCache: Send + Sync {
    async fn get_catalog(&self, connector_id: &str, config_hash: &str) -> Result<Option<Catalog>>;

    /// Replace whatever is cached for the connector.
    async fn put_catalog(&self, connector_id: &str, config_hash: &str, catalog: &Catalog)
    -> Result<()>;
}

/// SHA-256 (hex) over the connector's execution reference and configuration.
///
/// `serde_json` maps are ordered, so equal configurations hash equally
/// regardless of the key order they were written in.
pub fn config_hash(connector: &Connector) -> Result<String> {
    let doc = serde_json::json!({
        "execution": connector.execution,
        "config": connector.config,
    });
    let bytes = serde_json::to_vec(&doc).map_err(|e| Error::backend("serialize config", e))?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

#[derive(Default)]
pub struct MemoryCatalogCache {
    inner: RwLock<HashMap<String, (String, Catalog)>>,
}

impl MemoryCatalogCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CatalogCache for MemoryCatalogCache {
    async fn get_catalog(&self, connector_id: &str, config_hash: &str) -> Result<Option<Catalog>> {
        let guard = self.inner.read().await;
        Ok(guard
            .get(connector_id)
            .filter(|(hash, _)| hash == config_hash)
            .map(|(_, catalog)| catalog.clone()))
    }

    async fn put_catalog(
        &self,
        connector_id: &str,
        config_hash: &str,
        catalog: &Catalog,
    ) -> Result<()> {
        self.inner.write().await.insert(
            connector_id.to_string(),
            (config_hash.to_string(), catalog.clone()),
        );
        Ok(())
    }
}

/// Resolves the catalog for a connector, running DISCOVER only when the
/// configuration changed since the last discovery.
#[derive(Clone)]
pub struct CatalogService {
    executor: ConnectorExecutor,
    cache: Arc<dyn CatalogCache>,
}

impl CatalogService {
    pub fn new(executor: ConnectorExecutor, cache: Arc<dyn CatalogCache>) -> Self {
        Self { executor, cache }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(connector_id = %connector.id))]
    pub async fn catalog_for(&self, connector: &Connector) -> Result<Catalog> {
        let hash = config_hash(connector)?;
        if let Some(catalog) = self.cache.get_catalog(&connector.id, &hash).await? {
            tracing::debug!("catalog cache hit");
            return Ok(catalog);
        }
        let catalog = self.executor.discover(connector, &connector.config).await?;
        self.cache.put_catalog(&connector.id, &hash, &catalog).await?;
        Ok(catalog)
    }

    /// Catalog restricted to the connector's selected streams.
    pub async fn configured_catalog_for(&self, connector: &Connector) -> Result<ConfiguredCatalog> {
        let catalog = self.catalog_for(connector).await?;
        let configured = ConfiguredCatalog::from_catalog(&catalog, &connector.selected_streams);
        if configured.streams.is_empty() {
            return Err(Error::DiscoveryFailed(format!(
                "no selected stream is present in the catalog of '{}'",
                connector.id
            )));
        }
        Ok(configured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutorConfig;
    use crate::executor::{AdapterContext, InProcessConnector, InProcessLauncher};
    use crate::models::ExecutionRef;
    use crate::protocol::{ConnectorInput, InvocationMode};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Discoverable {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl InProcessConnector for Discoverable {
        async fn run(&self, _: InvocationMode, _: Vec<ConnectorInput>, ctx: AdapterContext) -> i32 {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let line = r#"{"type":"CATALOG","catalog":{"streams":[{"name":"orders","supported_sync_modes":["incremental"]}]}}"#;
            let _ = ctx.raw(line).await;
            0
        }
    }

    fn connector(config: serde_json::Value) -> Connector {
        Connector::new(
            "orders-db",
            "Orders",
            ExecutionRef::InProcess {
                adapter: "discoverable".into(),
            },
            config,
        )
        .unwrap()
    }

    #[test]
    fn hash_ignores_key_order_but_not_values() {
        let a = connector(serde_json::json!({"host": "db", "port": 5432}));
        let b: Connector = serde_json::from_str(
            &serde_json::to_string(&a)
                .unwrap()
                .replace(r#""host":"db","port":5432"#, r#""port":5432,"host":"db""#),
        )
        .unwrap();
        assert_eq!(config_hash(&a).unwrap(), config_hash(&b).unwrap());
        let c = connector(serde_json::json!({"host": "db2", "port": 5432}));
        assert_ne!(config_hash(&a).unwrap(), config_hash(&c).unwrap());
        assert_eq!(config_hash(&a).unwrap().len(), 64);
    }

    #[tokio::test]
    async fn discover_runs_once_per_configuration() {
        let calls = Arc::new(AtomicUsize::new(0));
        let launcher = InProcessLauncher::new();
        launcher
            .register(
                "discoverable",
                Arc::new(Discoverable {
                    calls: calls.clone(),
                }),
            )
            .unwrap();
        let executor = ConnectorExecutor::new(Arc::new(launcher), ExecutorConfig::default());
        let service = CatalogService::new(executor, Arc::new(MemoryCatalogCache::new()));

        let first = connector(serde_json::json!({"host": "db"}));
        service.catalog_for(&first).await.unwrap();
        service.catalog_for(&first).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let changed = connector(serde_json::json!({"host": "replica"}));
        let configured = service.configured_catalog_for(&changed).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(configured.streams[0].stream.name, "orders");
    }
}
