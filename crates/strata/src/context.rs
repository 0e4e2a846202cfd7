//! Explicitly constructed dependency context
//!
//! Every component receives an `Arc<StrataContext>` holding the store
//! adapters, configuration, clock and per-key locks. There are no
//! process-wide registries.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::info;

use crate::chunk::RetryPolicy;
use crate::config::{Config, VectorBackend};
use crate::error::Result;
use crate::storage::{
    BufferStore, DocumentStore, GraphStore, LanceVectorIndex, MemoryBufferStore,
    MemoryDocumentStore, MemoryGraphStore, MemoryTableStore, MemoryVectorIndex, ResourcePool,
    TableStore, VectorIndex,
};

/// Source of "now" for every timestamp the core writes
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Async mutex per key, created on first use.
///
/// Serializes writers of one chunk (or one edge triple) inside this process;
/// cross-process safety comes from the stores' compare-and-swap.
#[derive(Default)]
pub struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = Arc::clone(&self.locks.entry(key.to_string()).or_default());
        mutex.lock_owned().await
    }

    /// Drop mutexes nobody holds or waits on.
    pub fn prune(&self) {
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

pub(crate) fn chunk_lock_key(chunk_id: &str) -> String {
    format!("chunk:{chunk_id}")
}

pub struct StrataContext {
    pub config: Config,
    pub buffer: Arc<dyn BufferStore>,
    pub tables: Arc<dyn TableStore>,
    pub graph: Arc<dyn GraphStore>,
    pub vectors: Arc<dyn VectorIndex>,
    pub documents: Arc<dyn DocumentStore>,
    pub clock: Arc<dyn Clock>,
    pub locks: KeyedLocks,
}

impl fmt::Debug for StrataContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrataContext")
            .field("config", &self.config)
            .field("locks", &self.locks.len())
            .finish_non_exhaustive()
    }
}

impl StrataContext {
    pub fn builder(config: Config) -> StrataContextBuilder {
        StrataContextBuilder::new(config)
    }

    /// All adapters in-process, system clock.
    pub fn in_memory(config: Config) -> Arc<Self> {
        Self::builder(config).build()
    }

    /// Build the adapters named by `config.storage`.
    pub async fn from_config(config: Config) -> Result<Arc<Self>> {
        let mut builder = Self::builder(config.clone());
        if config.storage.vector_backend == VectorBackend::Lance {
            let path = config.storage.data_dir.join("vectors");
            std::fs::create_dir_all(&path)?;
            info!("Opening LanceDB vector index at {}", path.display());
            let pool = ResourcePool::new("vectors", config.storage.pool_config());
            let index =
                LanceVectorIndex::open(&path, config.storage.embedding_dimensions, pool).await?;
            builder = builder.with_vectors(Arc::new(index));
        }
        Ok(builder.build())
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.config.lifecycle.retry_policy()
    }
}

/// Assembles a context; any adapter not supplied gets its in-memory default.
pub struct StrataContextBuilder {
    config: Config,
    clock: Option<Arc<dyn Clock>>,
    buffer: Option<Arc<dyn BufferStore>>,
    tables: Option<Arc<dyn TableStore>>,
    graph: Option<Arc<dyn GraphStore>>,
    vectors: Option<Arc<dyn VectorIndex>>,
    documents: Option<Arc<dyn DocumentStore>>,
}

impl StrataContextBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            clock: None,
            buffer: None,
            tables: None,
            graph: None,
            vectors: None,
            documents: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_buffer(mut self, buffer: Arc<dyn BufferStore>) -> Self {
        self.buffer = Some(buffer);
        self
    }

    pub fn with_tables(mut self, tables: Arc<dyn TableStore>) -> Self {
        self.tables = Some(tables);
        self
    }

    pub fn with_graph(mut self, graph: Arc<dyn GraphStore>) -> Self {
        self.graph = Some(graph);
        self
    }

    pub fn with_vectors(mut self, vectors: Arc<dyn VectorIndex>) -> Self {
        self.vectors = Some(vectors);
        self
    }

    pub fn with_documents(mut self, documents: Arc<dyn DocumentStore>) -> Self {
        self.documents = Some(documents);
        self
    }

    pub fn build(self) -> Arc<StrataContext> {
        let pool_config = self.config.storage.pool_config();
        let pool = |name: &str| ResourcePool::new(name, pool_config);
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let dimensions = self.config.storage.embedding_dimensions;

        Arc::new(StrataContext {
            buffer: self
                .buffer
                .unwrap_or_else(|| Arc::new(MemoryBufferStore::new(pool("buffer"), clock.clone()))),
            tables: self
                .tables
                .unwrap_or_else(|| Arc::new(MemoryTableStore::new(pool("tables")))),
            graph: self
                .graph
                .unwrap_or_else(|| Arc::new(MemoryGraphStore::new(pool("graph")))),
            vectors: self
                .vectors
                .unwrap_or_else(|| Arc::new(MemoryVectorIndex::new(pool("vectors"), dimensions))),
            documents: self
                .documents
                .unwrap_or_else(|| Arc::new(MemoryDocumentStore::new(pool("documents")))),
            clock,
            config: self.config,
            locks: KeyedLocks::new(),
        })
    }
}
