//! Store adapters
//!
//! One narrow trait per storage role. Adapters only get, put, delete and
//! query in their native idiom; lifecycle rules live in the components that
//! call them. Every adapter call goes through a bounded [`ResourcePool`].

pub mod filter;
pub mod lance;
pub mod memory;
pub mod pool;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chunk::{ChunkRecord, ContentType, ProcessingStatus};
use crate::error::Result;
use crate::graph::{GraphNode, Relationship, RelationshipType};
use crate::scoring::ScoreSet;
use crate::tiers::{MemoryTier, TransferIntent, TransferRecord};

pub use filter::{ChunkCursor, ChunkQuery, StatusQuery, TextQuery};
pub use lance::LanceVectorIndex;
pub use memory::{
    MemoryBufferStore, MemoryDocumentStore, MemoryGraphStore, MemoryTableStore, MemoryVectorIndex,
};
pub use pool::{PoolConfig, ResourcePool};

/// Short-lived key/value store with per-key expiry
#[async_trait]
pub trait BufferStore: Send + Sync {
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn delete(&self, key: &str) -> Result<bool>;
    /// Add one to the counter at `key` and return the new count. A missing
    /// or expired key starts a fresh counter that expires after `ttl`.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64>;
    /// Drop expired keys; returns how many were removed
    async fn purge_expired(&self) -> Result<usize>;
}

/// Relational store: chunk rows, status rows, score rows, the transfer log
/// and write-ahead intents. Rows carry a `version` for compare-and-swap.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Insert unless a row with this id exists; returns whether it inserted
    async fn insert_chunk(&self, record: &ChunkRecord) -> Result<bool>;
    async fn get_chunk(&self, id: &str) -> Result<Option<ChunkRecord>>;
    /// Replace the row only if its stored version equals `expected_version`
    async fn compare_and_swap_chunk(
        &self,
        record: &ChunkRecord,
        expected_version: u64,
    ) -> Result<bool>;
    async fn compare_and_delete_chunk(&self, id: &str, expected_version: u64) -> Result<bool>;
    async fn scan_chunks(&self, query: &ChunkQuery) -> Result<Vec<ChunkRecord>>;

    async fn insert_status(&self, status: &ProcessingStatus) -> Result<bool>;
    async fn get_status(&self, chunk_id: &str) -> Result<Option<ProcessingStatus>>;
    async fn compare_and_swap_status(
        &self,
        status: &ProcessingStatus,
        expected_version: u64,
    ) -> Result<bool>;
    async fn scan_status(&self, query: &StatusQuery) -> Result<Vec<ProcessingStatus>>;
    async fn delete_status(&self, chunk_id: &str) -> Result<bool>;

    /// Write all score fields in one row replacement
    async fn put_scores(&self, scores: &ScoreSet) -> Result<()>;
    async fn get_scores(&self, chunk_id: &str) -> Result<Option<ScoreSet>>;
    async fn scan_scores(&self) -> Result<Vec<ScoreSet>>;
    async fn delete_scores(&self, chunk_id: &str) -> Result<bool>;

    async fn append_transfer(&self, record: &TransferRecord) -> Result<()>;
    /// Log entries for one chunk, oldest first
    async fn transfers_for(&self, chunk_id: &str) -> Result<Vec<TransferRecord>>;

    async fn put_intent(&self, intent: &TransferIntent) -> Result<()>;
    async fn delete_intent(&self, chunk_id: &str) -> Result<bool>;
    async fn list_intents(&self) -> Result<Vec<TransferIntent>>;
}

/// Property graph of consolidated chunks and typed edges.
///
/// Edges are keyed by id; the store does not enforce triple uniqueness.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn upsert_node(&self, node: &GraphNode) -> Result<()>;
    async fn get_node(&self, chunk_id: &str) -> Result<Option<GraphNode>>;
    async fn delete_node(&self, chunk_id: &str) -> Result<bool>;

    async fn upsert_edge(&self, edge: &Relationship) -> Result<()>;
    async fn get_edge(&self, id: &str) -> Result<Option<Relationship>>;
    async fn delete_edge(&self, id: &str) -> Result<bool>;
    async fn find_edges(
        &self,
        source_id: &str,
        target_id: &str,
        relationship_type: RelationshipType,
    ) -> Result<Vec<Relationship>>;
    /// Edges in either direction touching `chunk_id`
    async fn edges_of(&self, chunk_id: &str) -> Result<Vec<Relationship>>;
    async fn all_edges(&self) -> Result<Vec<Relationship>>;
    async fn edge_count(&self) -> Result<usize>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorEntry {
    pub chunk_id: String,
    pub project_id: String,
    pub vector: Vec<f32>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    pub chunk_id: String,
    pub project_id: String,
    pub distance: f32,
}

/// Nearest-neighbour index over chunk embeddings
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, entry: &VectorEntry) -> Result<()>;
    async fn get(&self, chunk_id: &str) -> Result<Option<VectorEntry>>;
    async fn delete(&self, chunk_id: &str) -> Result<bool>;
    /// Closest entries within `project_id`, nearest first
    async fn nearest(
        &self,
        project_id: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<VectorMatch>>;
    async fn count(&self) -> Result<usize>;
}

/// Long-term copy of a chunk in one collection (semantic, episodic, procedural)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub chunk_id: String,
    pub project_id: String,
    pub collection: MemoryTier,
    pub content_type: ContentType,
    pub content: String,
    #[serde(default)]
    pub title: Option<String>,
    pub confidence: u8,
    pub doubt: u8,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub stored_at: DateTime<Utc>,
}

/// A document hit with the number of query keywords it matched
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentMatch {
    pub document: StoredDocument,
    pub hits: usize,
}

/// Document store holding long-term copies, keyed by `(collection, chunk_id)`
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn put(&self, document: &StoredDocument) -> Result<()>;
    async fn get(&self, collection: MemoryTier, chunk_id: &str)
    -> Result<Option<StoredDocument>>;
    async fn delete(&self, collection: MemoryTier, chunk_id: &str) -> Result<bool>;
    /// Matches ordered by hit count, then chunk id
    async fn search_text(&self, query: &TextQuery) -> Result<Vec<DocumentMatch>>;
    async fn count(&self, collection: MemoryTier) -> Result<usize>;
}
