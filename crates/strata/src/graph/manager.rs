//! Relationship graph manager
//!
//! Owns the uniqueness rule for `(source, target, type)` triples on top of a
//! graph store that only knows edge ids. Writers of one triple are
//! serialized with a keyed lock; duplicates left behind by other processes
//! are folded together by [`RelationshipGraph::compact_duplicates`].

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::chunk::ContentType;
use crate::context::StrataContext;
use crate::error::{Result, StrataError};
use crate::graph::{Direction, EdgeProperties, Relationship, RelationshipType, SimilarChunk};
use crate::storage::TextQuery;
use crate::tiers::CancelToken;

fn edge_lock_key(source_id: &str, target_id: &str, relationship_type: RelationshipType) -> String {
    format!("edge:{source_id}|{target_id}|{relationship_type}")
}

/// Most recently modified first; ties broken by id for determinism.
fn newest_first(a: &Relationship, b: &Relationship) -> std::cmp::Ordering {
    b.modified.cmp(&a.modified).then_with(|| a.id.cmp(&b.id))
}

#[derive(Clone)]
pub struct RelationshipGraph {
    ctx: Arc<StrataContext>,
}

impl RelationshipGraph {
    pub fn new(ctx: Arc<StrataContext>) -> Self {
        Self { ctx }
    }

    /// Create the edge, or merge `props` into the existing one for the same
    /// triple and bump its `modified`.
    pub async fn connect(
        &self,
        source_id: &str,
        target_id: &str,
        relationship_type: RelationshipType,
        props: EdgeProperties,
    ) -> Result<Relationship> {
        if source_id.trim().is_empty() || target_id.trim().is_empty() {
            return Err(StrataError::Validation(
                "edge endpoints must not be empty".to_string(),
            ));
        }
        if source_id == target_id && !relationship_type.is_reflexive() {
            return Err(StrataError::Validation(format!(
                "{relationship_type} edge from {source_id} to itself is not allowed"
            )));
        }
        props.validate()?;

        for endpoint in [source_id, target_id] {
            if self.ctx.tables.get_chunk(endpoint).await?.is_none() {
                return Err(StrataError::NotFound(format!("chunk {endpoint}")));
            }
        }

        let _guard = self
            .ctx
            .locks
            .lock(&edge_lock_key(source_id, target_id, relationship_type))
            .await;
        let mut existing = self
            .ctx
            .graph
            .find_edges(source_id, target_id, relationship_type)
            .await?;
        existing.sort_by(newest_first);

        let now = self.ctx.now();
        let edge = match existing.into_iter().next() {
            Some(mut edge) => {
                edge.apply(&props, now);
                debug!(edge_id = %edge.id, %relationship_type, "Merged into existing edge");
                edge
            }
            None => {
                let mut edge = Relationship::new(source_id, target_id, relationship_type, now);
                edge.apply(&props, now);
                debug!(edge_id = %edge.id, source_id, target_id, %relationship_type, "Created edge");
                edge
            }
        };
        self.ctx.graph.upsert_edge(&edge).await?;
        Ok(edge)
    }

    /// Returns true if an edge was removed.
    pub async fn disconnect(&self, relationship_id: &str) -> Result<bool> {
        let removed = self.ctx.graph.delete_edge(relationship_id).await?;
        if removed {
            debug!(edge_id = relationship_id, "Disconnected edge");
        }
        Ok(removed)
    }

    pub async fn get_edge(&self, relationship_id: &str) -> Result<Option<Relationship>> {
        self.ctx.graph.get_edge(relationship_id).await
    }

    /// Targets of edges leaving `chunk_id`, most recently modified edge
    /// first. Empty `types` means every type. Terminally failed neighbours
    /// are left out.
    pub async fn neighbors(
        &self,
        chunk_id: &str,
        types: &[RelationshipType],
        limit: usize,
    ) -> Result<Vec<String>> {
        self.neighbors_in(chunk_id, types, Direction::Outgoing, limit)
            .await
    }

    /// Like [`RelationshipGraph::neighbors`], walking edges in `direction`.
    pub async fn neighbors_in(
        &self,
        chunk_id: &str,
        types: &[RelationshipType],
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<String>> {
        let mut edges: Vec<Relationship> = self
            .ctx
            .graph
            .edges_of(chunk_id)
            .await?
            .into_iter()
            .filter(|e| types.is_empty() || types.contains(&e.relationship_type))
            .collect();
        edges.sort_by(newest_first);

        let mut seen = HashSet::new();
        let mut neighbors = Vec::new();
        for edge in &edges {
            if neighbors.len() >= limit {
                break;
            }
            let Some(other) = edge.neighbor_of(chunk_id, direction) else {
                continue;
            };
            if !seen.insert(other.to_string()) {
                continue;
            }
            let visible = self
                .ctx
                .tables
                .get_chunk(other)
                .await?
                .is_some_and(|r| r.is_queryable());
            if visible {
                neighbors.push(other.to_string());
            }
        }
        Ok(neighbors)
    }

    /// Keyword match over consolidated chunks of one project.
    ///
    /// Only chunks with a long-term copy are searchable, so recently ingested
    /// chunks may be missed. Results never leave `project_id`, and copies
    /// whose chunk is no longer registered are skipped.
    pub async fn find_similar(
        &self,
        project_id: &str,
        text: &str,
        content_type: Option<ContentType>,
        limit: usize,
    ) -> Result<Vec<SimilarChunk>> {
        if project_id.trim().is_empty() {
            return Err(StrataError::Validation(
                "find_similar requires a project id".to_string(),
            ));
        }
        if limit == 0 {
            return Ok(Vec::new());
        }

        // the same chunk can match in several collections
        let mut query = TextQuery::new(project_id, text, limit.saturating_mul(3));
        if let Some(content_type) = content_type {
            query = query.with_content_type(content_type);
        }

        let mut seen = HashSet::new();
        let mut results = Vec::new();
        for hit in self.ctx.documents.search_text(&query).await? {
            let doc = hit.document;
            if doc.project_id != project_id {
                warn!(
                    chunk_id = %doc.chunk_id,
                    expected = project_id,
                    found = %doc.project_id,
                    "Document store returned a cross-project match; dropped"
                );
                continue;
            }
            if !seen.insert(doc.chunk_id.clone()) {
                continue;
            }
            let live = self
                .ctx
                .tables
                .get_chunk(&doc.chunk_id)
                .await?
                .is_some_and(|r| r.is_queryable());
            if !live {
                continue;
            }
            results.push(SimilarChunk {
                chunk_id: doc.chunk_id,
                project_id: doc.project_id,
                content_type: doc.content_type,
                score: hit.hits,
            });
            if results.len() >= limit {
                break;
            }
        }
        Ok(results)
    }

    /// Delete every edge touching `chunk_id` and its node. Returns the
    /// number of edges removed.
    pub async fn remove_chunk(&self, chunk_id: &str) -> Result<usize> {
        let mut removed = 0;
        for edge in self.ctx.graph.edges_of(chunk_id).await? {
            if self.ctx.graph.delete_edge(&edge.id).await? {
                removed += 1;
            }
        }
        self.ctx.graph.delete_node(chunk_id).await?;
        Ok(removed)
    }

    /// Collapse edges sharing a `(source, target, type)` triple down to the
    /// most recently modified one. Safe to run concurrently with itself and
    /// with `connect`; stops early when `cancel` fires.
    pub async fn compact_duplicates(&self, cancel: &CancelToken) -> Result<usize> {
        let mut groups: BTreeMap<(String, String, RelationshipType), usize> = BTreeMap::new();
        for edge in self.ctx.graph.all_edges().await? {
            *groups
                .entry((
                    edge.source_id.clone(),
                    edge.target_id.clone(),
                    edge.relationship_type,
                ))
                .or_default() += 1;
        }

        let mut removed = 0;
        for ((source_id, target_id, relationship_type), count) in groups {
            if count < 2 {
                continue;
            }
            if cancel.is_cancelled() {
                debug!("Edge compaction cancelled");
                break;
            }

            let _guard = self
                .ctx
                .locks
                .lock(&edge_lock_key(&source_id, &target_id, relationship_type))
                .await;
            let mut edges = self
                .ctx
                .graph
                .find_edges(&source_id, &target_id, relationship_type)
                .await?;
            edges.sort_by(newest_first);
            for duplicate in edges.iter().skip(1) {
                if self.ctx.graph.delete_edge(&duplicate.id).await? {
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            info!(removed, "Compacted duplicate edges");
        }
        Ok(removed)
    }
}
