//! In-process store adapters backed by `DashMap`
//!
//! These are the default backends for a single-node deployment and for
//! tests. Row-level atomicity comes from the map's shard locks: an entry
//! guard is held only for the duration of a single compare-and-swap.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::chunk::{ChunkRecord, ProcessingStatus};
use crate::context::Clock;
use crate::error::{Result, StrataError};
use crate::graph::{GraphNode, Relationship, RelationshipType};
use crate::scoring::ScoreSet;
use crate::storage::{
    BufferStore, ChunkQuery, DocumentMatch, DocumentStore, GraphStore, ResourcePool, StatusQuery,
    StoredDocument, TableStore, TextQuery, VectorEntry, VectorIndex, VectorMatch,
};
use crate::tiers::{MemoryTier, TransferIntent, TransferRecord};

pub struct MemoryBufferStore {
    pool: ResourcePool,
    clock: Arc<dyn Clock>,
    entries: DashMap<String, (String, DateTime<Utc>)>,
}

impl MemoryBufferStore {
    pub fn new(pool: ResourcePool, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            clock,
            entries: DashMap::new(),
        }
    }
}

#[async_trait]
impl BufferStore for MemoryBufferStore {
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StrataError::Validation(format!("buffer ttl out of range: {e}")))?;
        let expires_at = self.clock.now() + ttl;
        self.pool
            .run("buffer.put", async {
                self.entries.insert(key.to_string(), (value, expires_at));
                Ok(())
            })
            .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now();
        self.pool
            .run("buffer.get", async {
                Ok(self
                    .entries
                    .get(key)
                    .filter(|entry| entry.value().1 > now)
                    .map(|entry| entry.value().0.clone()))
            })
            .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.pool
            .run("buffer.delete", async { Ok(self.entries.remove(key).is_some()) })
            .await
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StrataError::Validation(format!("buffer ttl out of range: {e}")))?;
        let now = self.clock.now();
        self.pool
            .run("buffer.increment", async {
                let mut entry = self
                    .entries
                    .entry(key.to_string())
                    .or_insert_with(|| (String::new(), now));
                let (value, expires_at) = entry.value_mut();
                let current = if *expires_at > now {
                    value.parse::<u64>().map_err(|_| {
                        StrataError::Validation(format!("buffer key {key} does not hold a counter"))
                    })?
                } else {
                    *expires_at = now + ttl;
                    0
                };
                let next = current.saturating_add(1);
                *value = next.to_string();
                Ok(next)
            })
            .await
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        self.pool
            .run("buffer.purge", async {
                let before = self.entries.len();
                self.entries.retain(|_, (_, expires_at)| *expires_at > now);
                Ok(before.saturating_sub(self.entries.len()))
            })
            .await
    }
}

#[derive(Default)]
struct Tables {
    chunks: DashMap<String, ChunkRecord>,
    statuses: DashMap<String, ProcessingStatus>,
    scores: DashMap<String, ScoreSet>,
    transfers: DashMap<String, Vec<TransferRecord>>,
    intents: DashMap<String, TransferIntent>,
}

pub struct MemoryTableStore {
    pool: ResourcePool,
    tables: Tables,
}

impl MemoryTableStore {
    pub fn new(pool: ResourcePool) -> Self {
        Self {
            pool,
            tables: Tables::default(),
        }
    }
}

fn insert_if_absent<V>(map: &DashMap<String, V>, key: &str, value: V) -> bool {
    match map.entry(key.to_string()) {
        Entry::Occupied(_) => false,
        Entry::Vacant(slot) => {
            slot.insert(value);
            true
        }
    }
}

fn swap_if_version<V: Clone>(
    map: &DashMap<String, V>,
    key: &str,
    value: &V,
    expected: u64,
    version: impl Fn(&V) -> u64,
) -> bool {
    match map.get_mut(key) {
        Some(mut current) if version(current.value()) == expected => {
            *current = value.clone();
            true
        }
        _ => false,
    }
}

#[async_trait]
impl TableStore for MemoryTableStore {
    async fn insert_chunk(&self, record: &ChunkRecord) -> Result<bool> {
        self.pool
            .run("table.insert_chunk", async {
                Ok(insert_if_absent(
                    &self.tables.chunks,
                    record.id(),
                    record.clone(),
                ))
            })
            .await
    }

    async fn get_chunk(&self, id: &str) -> Result<Option<ChunkRecord>> {
        self.pool
            .run("table.get_chunk", async {
                Ok(self.tables.chunks.get(id).map(|r| r.value().clone()))
            })
            .await
    }

    async fn compare_and_swap_chunk(
        &self,
        record: &ChunkRecord,
        expected_version: u64,
    ) -> Result<bool> {
        self.pool
            .run("table.cas_chunk", async {
                Ok(swap_if_version(
                    &self.tables.chunks,
                    record.id(),
                    record,
                    expected_version,
                    |r| r.version,
                ))
            })
            .await
    }

    async fn compare_and_delete_chunk(&self, id: &str, expected_version: u64) -> Result<bool> {
        self.pool
            .run("table.delete_chunk", async {
                Ok(self
                    .tables
                    .chunks
                    .remove_if(id, |_, r| r.version == expected_version)
                    .is_some())
            })
            .await
    }

    async fn scan_chunks(&self, query: &ChunkQuery) -> Result<Vec<ChunkRecord>> {
        self.pool
            .run("table.scan_chunks", async {
                let mut rows: Vec<ChunkRecord> = self
                    .tables
                    .chunks
                    .iter()
                    .filter(|r| query.tier.is_none_or(|t| r.tier == t))
                    .filter(|r| {
                        query
                            .project_id
                            .as_deref()
                            .is_none_or(|p| r.project_id() == p)
                    })
                    .filter(|r| query.registered_before.is_none_or(|at| r.registered_at <= at))
                    .filter(|r| query.after.as_ref().is_none_or(|c| c.precedes(r)))
                    .map(|r| r.value().clone())
                    .collect();
                rows.sort_by(|a, b| {
                    a.registered_at
                        .cmp(&b.registered_at)
                        .then_with(|| a.id().cmp(b.id()))
                });
                if let Some(limit) = query.limit {
                    rows.truncate(limit);
                }
                Ok(rows)
            })
            .await
    }

    async fn insert_status(&self, status: &ProcessingStatus) -> Result<bool> {
        self.pool
            .run("table.insert_status", async {
                Ok(insert_if_absent(
                    &self.tables.statuses,
                    &status.chunk_id,
                    status.clone(),
                ))
            })
            .await
    }

    async fn get_status(&self, chunk_id: &str) -> Result<Option<ProcessingStatus>> {
        self.pool
            .run("table.get_status", async {
                Ok(self.tables.statuses.get(chunk_id).map(|r| r.value().clone()))
            })
            .await
    }

    async fn compare_and_swap_status(
        &self,
        status: &ProcessingStatus,
        expected_version: u64,
    ) -> Result<bool> {
        self.pool
            .run("table.cas_status", async {
                Ok(swap_if_version(
                    &self.tables.statuses,
                    &status.chunk_id,
                    status,
                    expected_version,
                    |s| s.version,
                ))
            })
            .await
    }

    async fn scan_status(&self, query: &StatusQuery) -> Result<Vec<ProcessingStatus>> {
        self.pool
            .run("table.scan_status", async {
                let mut rows: Vec<ProcessingStatus> = self
                    .tables
                    .statuses
                    .iter()
                    .filter(|s| query.status.is_none_or(|k| s.status == k))
                    .map(|s| s.value().clone())
                    .collect();
                rows.sort_by(|a, b| a.chunk_id.cmp(&b.chunk_id));
                if let Some(limit) = query.limit {
                    rows.truncate(limit);
                }
                Ok(rows)
            })
            .await
    }

    async fn delete_status(&self, chunk_id: &str) -> Result<bool> {
        self.pool
            .run("table.delete_status", async {
                Ok(self.tables.statuses.remove(chunk_id).is_some())
            })
            .await
    }

    async fn put_scores(&self, scores: &ScoreSet) -> Result<()> {
        self.pool
            .run("table.put_scores", async {
                self.tables
                    .scores
                    .insert(scores.chunk_id.clone(), scores.clone());
                Ok(())
            })
            .await
    }

    async fn get_scores(&self, chunk_id: &str) -> Result<Option<ScoreSet>> {
        self.pool
            .run("table.get_scores", async {
                Ok(self.tables.scores.get(chunk_id).map(|r| r.value().clone()))
            })
            .await
    }

    async fn scan_scores(&self) -> Result<Vec<ScoreSet>> {
        self.pool
            .run("table.scan_scores", async {
                Ok(self
                    .tables
                    .scores
                    .iter()
                    .map(|r| r.value().clone())
                    .collect())
            })
            .await
    }

    async fn delete_scores(&self, chunk_id: &str) -> Result<bool> {
        self.pool
            .run("table.delete_scores", async {
                Ok(self.tables.scores.remove(chunk_id).is_some())
            })
            .await
    }

    async fn append_transfer(&self, record: &TransferRecord) -> Result<()> {
        self.pool
            .run("table.append_transfer", async {
                self.tables
                    .transfers
                    .entry(record.chunk_id.clone())
                    .or_default()
                    .push(record.clone());
                Ok(())
            })
            .await
    }

    async fn transfers_for(&self, chunk_id: &str) -> Result<Vec<TransferRecord>> {
        self.pool
            .run("table.transfers_for", async {
                let mut log = self
                    .tables
                    .transfers
                    .get(chunk_id)
                    .map(|r| r.value().clone())
                    .unwrap_or_default();
                log.sort_by_key(|r| r.at);
                Ok(log)
            })
            .await
    }

    async fn put_intent(&self, intent: &TransferIntent) -> Result<()> {
        self.pool
            .run("table.put_intent", async {
                self.tables
                    .intents
                    .insert(intent.chunk_id.clone(), intent.clone());
                Ok(())
            })
            .await
    }

    async fn delete_intent(&self, chunk_id: &str) -> Result<bool> {
        self.pool
            .run("table.delete_intent", async {
                Ok(self.tables.intents.remove(chunk_id).is_some())
            })
            .await
    }

    async fn list_intents(&self) -> Result<Vec<TransferIntent>> {
        self.pool
            .run("table.list_intents", async {
                let mut intents: Vec<TransferIntent> = self
                    .tables
                    .intents
                    .iter()
                    .map(|r| r.value().clone())
                    .collect();
                intents.sort_by_key(|i| i.started_at);
                Ok(intents)
            })
            .await
    }
}

pub struct MemoryGraphStore {
    pool: ResourcePool,
    nodes: DashMap<String, GraphNode>,
    edges: DashMap<String, Relationship>,
}

impl MemoryGraphStore {
    pub fn new(pool: ResourcePool) -> Self {
        Self {
            pool,
            nodes: DashMap::new(),
            edges: DashMap::new(),
        }
    }

    fn collect_edges(&self, keep: impl Fn(&Relationship) -> bool) -> Vec<Relationship> {
        let mut edges: Vec<Relationship> = self
            .edges
            .iter()
            .filter(|e| keep(e.value()))
            .map(|e| e.value().clone())
            .collect();
        edges.sort_by(|a, b| a.id.cmp(&b.id));
        edges
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn upsert_node(&self, node: &GraphNode) -> Result<()> {
        self.pool
            .run("graph.upsert_node", async {
                self.nodes.insert(node.chunk_id.clone(), node.clone());
                Ok(())
            })
            .await
    }

    async fn get_node(&self, chunk_id: &str) -> Result<Option<GraphNode>> {
        self.pool
            .run("graph.get_node", async {
                Ok(self.nodes.get(chunk_id).map(|n| n.value().clone()))
            })
            .await
    }

    async fn delete_node(&self, chunk_id: &str) -> Result<bool> {
        self.pool
            .run("graph.delete_node", async {
                Ok(self.nodes.remove(chunk_id).is_some())
            })
            .await
    }

    async fn upsert_edge(&self, edge: &Relationship) -> Result<()> {
        self.pool
            .run("graph.upsert_edge", async {
                self.edges.insert(edge.id.clone(), edge.clone());
                Ok(())
            })
            .await
    }

    async fn get_edge(&self, id: &str) -> Result<Option<Relationship>> {
        self.pool
            .run("graph.get_edge", async {
                Ok(self.edges.get(id).map(|e| e.value().clone()))
            })
            .await
    }

    async fn delete_edge(&self, id: &str) -> Result<bool> {
        self.pool
            .run("graph.delete_edge", async { Ok(self.edges.remove(id).is_some()) })
            .await
    }

    async fn find_edges(
        &self,
        source_id: &str,
        target_id: &str,
        relationship_type: RelationshipType,
    ) -> Result<Vec<Relationship>> {
        self.pool
            .run("graph.find_edges", async {
                Ok(self.collect_edges(|e| e.triple() == (source_id, target_id, relationship_type)))
            })
            .await
    }

    async fn edges_of(&self, chunk_id: &str) -> Result<Vec<Relationship>> {
        self.pool
            .run("graph.edges_of", async {
                Ok(self.collect_edges(|e| e.other_end(chunk_id).is_some()))
            })
            .await
    }

    async fn all_edges(&self) -> Result<Vec<Relationship>> {
        self.pool
            .run("graph.all_edges", async { Ok(self.collect_edges(|_| true)) })
            .await
    }

    async fn edge_count(&self) -> Result<usize> {
        self.pool
            .run("graph.edge_count", async { Ok(self.edges.len()) })
            .await
    }
}

pub struct MemoryVectorIndex {
    pool: ResourcePool,
    dimensions: usize,
    entries: DashMap<String, VectorEntry>,
}

impl MemoryVectorIndex {
    pub fn new(pool: ResourcePool, dimensions: usize) -> Self {
        Self {
            pool,
            dimensions,
            entries: DashMap::new(),
        }
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimensions {
            return Err(StrataError::Validation(format!(
                "vector has {} dimensions, index expects {}",
                vector.len(),
                self.dimensions
            )));
        }
        Ok(())
    }
}

/// Squared euclidean distance, the same metric LanceDB reports by default.
fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn upsert(&self, entry: &VectorEntry) -> Result<()> {
        self.check_dimensions(&entry.vector)?;
        self.pool
            .run("vector.upsert", async {
                self.entries.insert(entry.chunk_id.clone(), entry.clone());
                Ok(())
            })
            .await
    }

    async fn get(&self, chunk_id: &str) -> Result<Option<VectorEntry>> {
        self.pool
            .run("vector.get", async {
                Ok(self.entries.get(chunk_id).map(|e| e.value().clone()))
            })
            .await
    }

    async fn delete(&self, chunk_id: &str) -> Result<bool> {
        self.pool
            .run("vector.delete", async {
                Ok(self.entries.remove(chunk_id).is_some())
            })
            .await
    }

    async fn nearest(
        &self,
        project_id: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<VectorMatch>> {
        self.check_dimensions(vector)?;
        self.pool
            .run("vector.nearest", async {
                let mut matches: Vec<VectorMatch> = self
                    .entries
                    .iter()
                    .filter(|e| e.project_id == project_id)
                    .map(|e| VectorMatch {
                        chunk_id: e.chunk_id.clone(),
                        project_id: e.project_id.clone(),
                        distance: squared_l2(&e.vector, vector),
                    })
                    .collect();
                matches.sort_by(|a, b| {
                    a.distance
                        .partial_cmp(&b.distance)
                        .unwrap_or(Ordering::Equal)
                        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
                });
                matches.truncate(limit);
                Ok(matches)
            })
            .await
    }

    async fn count(&self) -> Result<usize> {
        self.pool
            .run("vector.count", async { Ok(self.entries.len()) })
            .await
    }
}

pub struct MemoryDocumentStore {
    pool: ResourcePool,
    documents: DashMap<(MemoryTier, String), StoredDocument>,
}

impl MemoryDocumentStore {
    pub fn new(pool: ResourcePool) -> Self {
        Self {
            pool,
            documents: DashMap::new(),
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn put(&self, document: &StoredDocument) -> Result<()> {
        self.pool
            .run("document.put", async {
                self.documents.insert(
                    (document.collection, document.chunk_id.clone()),
                    document.clone(),
                );
                Ok(())
            })
            .await
    }

    async fn get(
        &self,
        collection: MemoryTier,
        chunk_id: &str,
    ) -> Result<Option<StoredDocument>> {
        self.pool
            .run("document.get", async {
                Ok(self
                    .documents
                    .get(&(collection, chunk_id.to_string()))
                    .map(|d| d.value().clone()))
            })
            .await
    }

    async fn delete(&self, collection: MemoryTier, chunk_id: &str) -> Result<bool> {
        self.pool
            .run("document.delete", async {
                Ok(self
                    .documents
                    .remove(&(collection, chunk_id.to_string()))
                    .is_some())
            })
            .await
    }

    async fn search_text(&self, query: &TextQuery) -> Result<Vec<DocumentMatch>> {
        if query.keywords.is_empty() {
            return Ok(Vec::new());
        }
        self.pool
            .run("document.search_text", async {
                let mut matches: Vec<DocumentMatch> = self
                    .documents
                    .iter()
                    .map(|d| d.value().clone())
                    .filter(|d| d.project_id == query.project_id)
                    .filter(|d| query.collection.is_none_or(|c| d.collection == c))
                    .filter(|d| query.content_type.is_none_or(|t| d.content_type == t))
                    .filter_map(|document| {
                        let searchable = match &document.title {
                            Some(title) => format!("{title}\n{}", document.content),
                            None => document.content.clone(),
                        };
                        let hits = query.hits(&searchable);
                        (hits > 0).then_some(DocumentMatch { document, hits })
                    })
                    .collect();
                matches.sort_by(|a, b| {
                    b.hits
                        .cmp(&a.hits)
                        .then_with(|| a.document.chunk_id.cmp(&b.document.chunk_id))
                        .then_with(|| a.document.collection.cmp(&b.document.collection))
                });
                matches.truncate(query.limit);
                Ok(matches)
            })
            .await
    }

    async fn count(&self, collection: MemoryTier) -> Result<usize> {
        self.pool
            .run("document.count", async {
                Ok(self
                    .documents
                    .iter()
                    .filter(|d| d.key().0 == collection)
                    .count())
            })
            .await
    }
}
