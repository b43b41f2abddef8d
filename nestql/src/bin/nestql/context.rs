use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use nestql::config::{Backend, EngineConfig};
use nestql::examples::chinook;
use nestql::store::{CommitReport, FetchRequest, MutationPlan, RelatedRequest, RelatedRows, Row};
use nestql::{Engine, EngineError, MemoryStore, Predicate, RedisStore, Registry, Store};

/// Store selected by `[store] backend`.
pub enum CliStore {
    Memory(MemoryStore),
    Redis(RedisStore),
}

impl Store for CliStore {
    fn begin(&mut self) {
        match self {
            CliStore::Memory(store) => store.begin(),
            CliStore::Redis(store) => store.begin(),
        }
    }

    async fn fetch(&mut self, request: &FetchRequest) -> Result<Vec<Row>, EngineError> {
        match self {
            CliStore::Memory(store) => store.fetch(request).await,
            CliStore::Redis(store) => store.fetch(request).await,
        }
    }

    async fn fetch_related(&mut self, request: &RelatedRequest) -> Result<Vec<RelatedRows>, EngineError> {
        match self {
            CliStore::Memory(store) => store.fetch_related(request).await,
            CliStore::Redis(store) => store.fetch_related(request).await,
        }
    }

    async fn count(&mut self, resource: &str, predicate: Option<&Predicate>) -> Result<u64, EngineError> {
        match self {
            CliStore::Memory(store) => store.count(resource, predicate).await,
            CliStore::Redis(store) => store.count(resource, predicate).await,
        }
    }

    async fn commit(&mut self, plan: &MutationPlan) -> Result<CommitReport, EngineError> {
        match self {
            CliStore::Memory(store) => store.commit(plan).await,
            CliStore::Redis(store) => store.commit(plan).await,
        }
    }
}

/// Engine and store for one CLI invocation, over the Chinook schema.
pub struct CliContext {
    pub config: EngineConfig,
    pub engine: Engine,
    pub store: CliStore,
}

impl CliContext {
    pub async fn load(config_path: &Path) -> Result<Self> {
        let config = EngineConfig::load(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
        let registry = Arc::new(chinook::registry()?);
        let store = open_store(&config, Arc::clone(&registry)).await?;
        let engine = Engine::with_config(registry, config.clone());
        Ok(Self { config, engine, store })
    }

    pub fn registry(&self) -> &Registry {
        self.engine.registry()
    }
}

async fn open_store(config: &EngineConfig, registry: Arc<Registry>) -> Result<CliStore> {
    match config.store.backend {
        Backend::Memory => {
            let tables = chinook::seed(&registry)?;
            Ok(CliStore::Memory(MemoryStore::with_tables(registry, tables)))
        }
        Backend::Redis => {
            let url = config
                .store
                .resolved_redis_url()
                .context("The redis backend needs `store.redis_url` or REDIS_URL")?;
            let store = RedisStore::connect(registry, &url, config.store.namespace.clone())
                .await
                .with_context(|| format!("Failed to connect to Redis at {url}"))?;
            Ok(CliStore::Redis(store))
        }
    }
}
