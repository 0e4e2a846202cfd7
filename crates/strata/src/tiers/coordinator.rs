//! Tier transfer coordinator
//!
//! The only component that changes a chunk's tier. Every transfer commits
//! with a compare-and-set on the chunk row, so concurrent callers racing for
//! the same move see exactly one `Moved` and the rest `AlreadyMoved`.
//!
//! Promotion writes to the document and graph stores before the tier
//! commits. A [`TransferIntent`] is recorded first so an interrupted
//! promotion is found and finished by the next sweep; all external writes
//! are idempotent upserts.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, Receiver};
use tracing::{debug, info, warn};

use crate::chunk::{
    Chunk, ChunkRecord, ChunkRegistry, ProcessingStatus, Registration, StatusKind,
};
use crate::context::StrataContext;
use crate::error::{Result, StrataError};
use crate::graph::{EdgeProperties, GraphNode, RelationshipGraph, RelationshipType};
use crate::scoring::{
    HINT_QUEUE_CAPACITY, ScoreComponents, ScoreLedger, ScoreSet, ScoreUpdate,
};
use crate::storage::{StoredDocument, VectorEntry, VectorMatch};
use crate::tiers::{
    EvictionReason, MemoryTier, PromotionPolicy, TransferHint, TransferIntent, TransferKind,
    TransferRecord,
};

/// Result of asking the coordinator to move a chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// This call committed the move into the given tier
    Moved(MemoryTier),
    /// The chunk does not currently qualify
    NotEligible,
    /// Another caller committed the same move first
    AlreadyMoved,
    /// A store was unavailable; the chunk was marked failed for a later retry
    Deferred { error: String },
}

impl TransferOutcome {
    pub fn is_moved(&self) -> bool {
        matches!(self, TransferOutcome::Moved(_))
    }
}

const LONG_TERM_COLLECTIONS: [MemoryTier; 3] = [
    MemoryTier::Semantic,
    MemoryTier::Episodic,
    MemoryTier::Procedural,
];

pub struct TierCoordinator {
    ctx: Arc<StrataContext>,
    registry: ChunkRegistry,
    ledger: ScoreLedger,
    graph: RelationshipGraph,
    policy: PromotionPolicy,
    pub(crate) hint_rx: Mutex<Option<Receiver<TransferHint>>>,
}

impl TierCoordinator {
    pub fn new(ctx: Arc<StrataContext>) -> Self {
        let (hint_tx, hint_rx) = mpsc::channel(HINT_QUEUE_CAPACITY);
        Self {
            registry: ChunkRegistry::new(ctx.clone()),
            ledger: ScoreLedger::with_hints(ctx.clone(), hint_tx),
            graph: RelationshipGraph::new(ctx.clone()),
            policy: PromotionPolicy::from_config(&ctx.config),
            hint_rx: Mutex::new(Some(hint_rx)),
            ctx,
        }
    }

    pub fn context(&self) -> &Arc<StrataContext> {
        &self.ctx
    }

    pub fn registry(&self) -> &ChunkRegistry {
        &self.registry
    }

    /// Ledger for external scorers; its threshold crossings are picked up by
    /// [`TierCoordinator::run`] or [`TierCoordinator::drain_hints`].
    pub fn ledger(&self) -> &ScoreLedger {
        &self.ledger
    }

    pub fn graph(&self) -> &RelationshipGraph {
        &self.graph
    }

    pub fn policy(&self) -> &PromotionPolicy {
        &self.policy
    }

    pub async fn register_chunk(&self, chunk: Chunk) -> Result<Registration> {
        self.registry.register_chunk(chunk).await
    }

    pub async fn tier_of(&self, chunk_id: &str) -> Result<Option<MemoryTier>> {
        Ok(self.registry.get_chunk(chunk_id).await?.map(|r| r.tier))
    }

    pub async fn transfer_log(&self, chunk_id: &str) -> Result<Vec<TransferRecord>> {
        self.registry.transfer_log(chunk_id).await
    }

    /// Apply a status transition, then admit and evaluate the chunk.
    ///
    /// Follow-up tier work never fails the status update; anything left
    /// undone is picked up by the next sweep.
    pub async fn set_status(
        &self,
        chunk_id: &str,
        to: StatusKind,
        error: Option<String>,
    ) -> Result<ProcessingStatus> {
        let status = self.registry.set_status(chunk_id, to, error).await?;
        if let Err(e) = self.after_status_change(chunk_id).await {
            warn!(chunk_id, error = %e, "Tier follow-up after status change failed");
        }
        Ok(status)
    }

    async fn after_status_change(&self, chunk_id: &str) -> Result<()> {
        self.admit(chunk_id).await?;
        let outcome = self.evaluate(chunk_id).await?;
        debug!(chunk_id, ?outcome, "Evaluated after status change");
        Ok(())
    }

    /// Upsert scores and act on any threshold crossing right away.
    pub async fn upsert_scores(
        &self,
        chunk_id: &str,
        components: ScoreComponents,
    ) -> Result<ScoreUpdate> {
        let update = self.ledger.apply_scores(chunk_id, components).await?;
        for hint in &update.hints {
            if let Err(e) = self.handle_hint(hint.clone()).await {
                warn!(chunk_id, error = %e, "Failed to act on score hint");
            }
        }
        Ok(update)
    }

    pub async fn handle_hint(&self, hint: TransferHint) -> Result<()> {
        match hint {
            TransferHint::ConfidenceReached { chunk_id, .. } => {
                let outcome = self.evaluate(&chunk_id).await?;
                debug!(%chunk_id, ?outcome, "Evaluated after confidence crossed threshold");
            }
            TransferHint::DoubtRaised { chunk_id, doubt } => {
                let Some(tier) = self.tier_of(&chunk_id).await? else {
                    return Ok(());
                };
                self.registry
                    .record_transfer(TransferRecord::new(
                        &chunk_id,
                        self.ctx.now(),
                        Some(tier),
                        Some(tier),
                        TransferKind::Flagged { doubt },
                    ))
                    .await?;
                warn!(%chunk_id, doubt, %tier, "Chunk flagged for review");
            }
        }
        Ok(())
    }

    /// Handle every hint queued by [`TierCoordinator::ledger`]. Returns the
    /// number handled; zero while the run loop owns the receiver.
    pub async fn drain_hints(&self) -> usize {
        let mut guard = self.hint_rx.lock().await;
        let Some(rx) = guard.as_mut() else {
            return 0;
        };
        let mut handled = 0;
        while let Ok(hint) = rx.try_recv() {
            if let Err(e) = self.handle_hint(hint).await {
                warn!(error = %e, "Failed to act on score hint");
            }
            handled += 1;
        }
        handled
    }

    /// Buffer -> working once processing has started reporting status.
    pub async fn admit(&self, chunk_id: &str) -> Result<bool> {
        let Some(record) = self
            .registry
            .compare_and_set_tier(chunk_id, MemoryTier::Buffer, MemoryTier::Working)
            .await?
        else {
            return Ok(false);
        };
        self.registry
            .record_transfer(TransferRecord::new(
                chunk_id,
                record.tier_changed_at,
                Some(MemoryTier::Buffer),
                Some(MemoryTier::Working),
                TransferKind::Admitted,
            ))
            .await?;
        info!(chunk_id, "Admitted chunk to working tier");
        Ok(true)
    }

    /// Promote or quarantine `chunk_id` if its status and scores call for it.
    pub async fn evaluate(&self, chunk_id: &str) -> Result<TransferOutcome> {
        let status = self
            .registry
            .get_status(chunk_id)
            .await?
            .ok_or_else(|| StrataError::NotFound(format!("status for chunk {chunk_id}")))?;

        if self.policy.should_quarantine(&status) {
            return self.quarantine(chunk_id).await;
        }
        if status.status == StatusKind::Completed {
            return self.promote(chunk_id).await;
        }
        Ok(TransferOutcome::NotEligible)
    }

    /// Working -> semantic for a completed chunk whose confidence meets the
    /// threshold. Rule projections follow the commit.
    pub async fn promote(&self, chunk_id: &str) -> Result<TransferOutcome> {
        let record = self
            .registry
            .get_chunk(chunk_id)
            .await?
            .ok_or_else(|| StrataError::NotFound(format!("chunk {chunk_id}")))?;
        match record.tier {
            MemoryTier::Working => {}
            tier if tier.is_long_term() => return Ok(TransferOutcome::AlreadyMoved),
            _ => return Ok(TransferOutcome::NotEligible),
        }

        let Some(status) = self.registry.get_status(chunk_id).await? else {
            return Ok(TransferOutcome::NotEligible);
        };
        let scores = self.ledger.get_scores(chunk_id).await?;
        let Some(scores) = scores.filter(|s| self.policy.should_promote(&status, Some(s))) else {
            return Ok(TransferOutcome::NotEligible);
        };

        match self.transfer_to_semantic(&record, &scores).await {
            Ok(Some(promoted)) => {
                self.registry
                    .record_transfer(
                        TransferRecord::new(
                            chunk_id,
                            promoted.tier_changed_at,
                            Some(MemoryTier::Working),
                            Some(MemoryTier::Semantic),
                            TransferKind::Promoted,
                        )
                        .with_detail(format!(
                            "confidence {} doubt {}",
                            scores.confidence, scores.doubt
                        )),
                    )
                    .await?;
                info!(
                    chunk_id,
                    confidence = scores.confidence,
                    "Promoted chunk to semantic tier"
                );
                self.apply_projection_rules(&promoted).await;
                Ok(TransferOutcome::Moved(MemoryTier::Semantic))
            }
            Ok(None) => Ok(TransferOutcome::AlreadyMoved),
            Err(e) if e.is_retryable() => self.defer(chunk_id, e).await,
            Err(e) => {
                if let Err(cleanup) = self.ctx.tables.delete_intent(chunk_id).await {
                    debug!(chunk_id, error = %cleanup, "Intent cleanup failed");
                }
                Err(e)
            }
        }
    }

    /// Intent, external copies, then the tier commit. `Ok(None)` when
    /// someone else committed first.
    async fn transfer_to_semantic(
        &self,
        record: &ChunkRecord,
        scores: &ScoreSet,
    ) -> Result<Option<ChunkRecord>> {
        let chunk_id = record.id();
        self.ctx
            .tables
            .put_intent(&TransferIntent {
                chunk_id: chunk_id.to_string(),
                from: MemoryTier::Working,
                to: MemoryTier::Semantic,
                started_at: self.ctx.now(),
            })
            .await?;

        self.store_document(record, MemoryTier::Semantic, Some(scores))
            .await?;
        self.ctx
            .graph
            .upsert_node(&GraphNode {
                chunk_id: chunk_id.to_string(),
                project_id: record.project_id().to_string(),
                content_type: record.chunk.content_type,
                tier: MemoryTier::Semantic,
                updated_at: self.ctx.now(),
            })
            .await?;
        self.link_declared(record).await?;

        let committed = self
            .registry
            .compare_and_set_tier(chunk_id, MemoryTier::Working, MemoryTier::Semantic)
            .await?;

        // a leftover intent is harmless: the sweep sees the tier already moved
        if let Err(e) = self.ctx.tables.delete_intent(chunk_id).await {
            warn!(chunk_id, error = %e, "Could not clear transfer intent");
        }
        Ok(committed)
    }

    async fn store_document(
        &self,
        record: &ChunkRecord,
        collection: MemoryTier,
        scores: Option<&ScoreSet>,
    ) -> Result<()> {
        let chunk = &record.chunk;
        let mut metadata = chunk.raw_metadata.clone();
        metadata.insert("connectorId".into(), chunk.connector_id.clone().into());
        metadata.insert("sourceType".into(), chunk.source.source_type.clone().into());
        metadata.insert("sourceId".into(), chunk.source.id.clone().into());
        if !chunk.context.topics.is_empty() {
            metadata.insert("topics".into(), chunk.context.topics.clone().into());
        }

        self.ctx
            .documents
            .put(&StoredDocument {
                chunk_id: chunk.id.clone(),
                project_id: chunk.project_id.clone(),
                collection,
                content_type: chunk.content_type,
                content: chunk.content.clone(),
                title: chunk.source.title.clone(),
                confidence: scores.map_or(0, |s| s.confidence),
                doubt: scores.map_or(0, |s| s.doubt),
                metadata,
                stored_at: self.ctx.now(),
            })
            .await
    }

    /// Edges for the chunk's declared relationships and its predecessor.
    /// Targets that are not registered are skipped.
    async fn link_declared(&self, record: &ChunkRecord) -> Result<()> {
        let chunk_id = record.id();
        let mut links: Vec<(String, String, RelationshipType)> = Vec::new();

        for declared in &record.chunk.relationships {
            let Some(target) = declared.target_chunk_id.as_deref() else {
                continue;
            };
            let relationship_type = declared
                .relationship_type
                .parse()
                .unwrap_or(RelationshipType::RelatedTo);
            links.push((chunk_id.to_string(), target.to_string(), relationship_type));
        }
        if let Some(previous) = record.chunk.previous_chunk_id() {
            links.push((
                previous.to_string(),
                chunk_id.to_string(),
                RelationshipType::Precedes,
            ));
        }

        for (source, target, relationship_type) in links {
            let props = EdgeProperties::default()
                .with_property("declared", serde_json::Value::Bool(true));
            match self
                .graph
                .connect(&source, &target, relationship_type, props)
                .await
            {
                Ok(_) => {}
                Err(StrataError::NotFound(_)) => {
                    debug!(%source, %target, %relationship_type, "Skipping link to unregistered chunk");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Abandon a promotion after a transient store failure and hand the chunk
    /// back to the retry machinery.
    async fn defer(&self, chunk_id: &str, error: StrataError) -> Result<TransferOutcome> {
        warn!(chunk_id, error = %error, "Tier transfer failed; scheduling retry");
        if let Err(e) = self.ctx.tables.delete_intent(chunk_id).await {
            debug!(chunk_id, error = %e, "Intent cleanup failed");
        }

        let message = format!("tier transfer failed: {error}");
        let status = self
            .registry
            .set_status(chunk_id, StatusKind::Failed, Some(message.clone()))
            .await?;
        self.registry
            .record_transfer(
                TransferRecord::new(
                    chunk_id,
                    status.updated_at,
                    Some(MemoryTier::Working),
                    Some(MemoryTier::Working),
                    TransferKind::Deferred,
                )
                .with_detail(message),
            )
            .await?;

        if self.policy.should_quarantine(&status) {
            self.quarantine(chunk_id).await?;
        }
        Ok(TransferOutcome::Deferred {
            error: error.to_string(),
        })
    }

    /// Working -> failed_terminal once the retry budget is spent.
    pub async fn quarantine(&self, chunk_id: &str) -> Result<TransferOutcome> {
        let Some(status) = self.registry.get_status(chunk_id).await? else {
            return Ok(TransferOutcome::NotEligible);
        };
        if !self.policy.should_quarantine(&status) {
            return Ok(TransferOutcome::NotEligible);
        }
        self.admit(chunk_id).await?;

        match self
            .registry
            .compare_and_set_tier(chunk_id, MemoryTier::Working, MemoryTier::FailedTerminal)
            .await?
        {
            Some(record) => {
                let error = status.error.unwrap_or_default();
                self.registry
                    .record_transfer(
                        TransferRecord::new(
                            chunk_id,
                            record.tier_changed_at,
                            Some(MemoryTier::Working),
                            Some(MemoryTier::FailedTerminal),
                            TransferKind::Quarantined,
                        )
                        .with_detail(format!("after {} attempts: {error}", status.retry_count)),
                    )
                    .await?;
                warn!(chunk_id, retry_count = status.retry_count, "Quarantined chunk");
                Ok(TransferOutcome::Moved(MemoryTier::FailedTerminal))
            }
            None if self.tier_of(chunk_id).await? == Some(MemoryTier::FailedTerminal) => {
                Ok(TransferOutcome::AlreadyMoved)
            }
            None => Ok(TransferOutcome::NotEligible),
        }
    }

    /// Send a completed or terminally failed chunk back through processing.
    /// Quarantined chunks return to the working tier.
    pub async fn reingest(&self, chunk_id: &str) -> Result<ProcessingStatus> {
        let status = self.registry.reingest(chunk_id).await?;
        if let Some(record) = self
            .registry
            .compare_and_set_tier(chunk_id, MemoryTier::FailedTerminal, MemoryTier::Working)
            .await?
        {
            self.registry
                .record_transfer(TransferRecord::new(
                    chunk_id,
                    record.tier_changed_at,
                    Some(MemoryTier::FailedTerminal),
                    Some(MemoryTier::Working),
                    TransferKind::Reinstated,
                ))
                .await?;
            info!(chunk_id, "Reinstated quarantined chunk");
        }
        Ok(status)
    }

    /// Copy a semantic chunk into a secondary long-term tier.
    pub async fn project(&self, chunk_id: &str, tier: MemoryTier) -> Result<TransferOutcome> {
        if !tier.is_projection() {
            return Err(StrataError::Validation(format!(
                "{tier} is not a projection tier"
            )));
        }
        let record = self
            .registry
            .get_chunk(chunk_id)
            .await?
            .ok_or_else(|| StrataError::NotFound(format!("chunk {chunk_id}")))?;
        if record.projections.contains(&tier) {
            return Ok(TransferOutcome::AlreadyMoved);
        }
        if record.tier != MemoryTier::Semantic {
            return Err(StrataError::invalid_transition(chunk_id, record.tier, tier));
        }

        let scores = self.ledger.get_scores(chunk_id).await?;
        self.store_document(&record, tier, scores.as_ref()).await?;
        if !self.registry.add_projection(chunk_id, tier).await? {
            return Ok(TransferOutcome::AlreadyMoved);
        }
        self.registry
            .record_transfer(TransferRecord::new(
                chunk_id,
                self.ctx.now(),
                Some(MemoryTier::Semantic),
                Some(tier),
                TransferKind::Projected,
            ))
            .await?;
        info!(chunk_id, %tier, "Projected chunk");
        Ok(TransferOutcome::Moved(tier))
    }

    /// Configured projections; failures are logged and left to the sweep.
    pub(crate) async fn apply_projection_rules(&self, record: &ChunkRecord) -> usize {
        let mut projected = 0;
        for tier in self.policy.missing_projections(record) {
            match self.project(record.id(), tier).await {
                Ok(TransferOutcome::Moved(_)) => projected += 1,
                Ok(_) => {}
                Err(e) => warn!(chunk_id = record.id(), %tier, error = %e, "Projection failed"),
            }
        }
        projected
    }

    /// Remove a chunk and every copy of it.
    ///
    /// TTL eviction applies only to chunks still in the buffer; manual
    /// eviction only to long-term or quarantined chunks. Returns false if
    /// the chunk was already gone or moved on.
    ///
    /// The registry row goes first, under the chunk lock and only if the
    /// chunk is still in the tier that was checked. Copies left behind by a
    /// failed cleanup belong to no registered chunk and are filtered out of
    /// every read path.
    pub async fn evict(&self, chunk_id: &str, reason: EvictionReason) -> Result<bool> {
        let Some(record) = self.registry.get_chunk(chunk_id).await? else {
            return Ok(false);
        };
        match reason {
            EvictionReason::TtlExpired if record.tier != MemoryTier::Buffer => return Ok(false),
            EvictionReason::Manual
                if !record.tier.is_long_term() && record.tier != MemoryTier::FailedTerminal =>
            {
                return Err(StrataError::invalid_transition(
                    chunk_id,
                    record.tier,
                    "evicted",
                ));
            }
            _ => {}
        }

        let Some(removed) = self.registry.remove(chunk_id, Some(record.tier)).await? else {
            debug!(chunk_id, "Chunk changed before eviction; leaving it");
            return Ok(false);
        };
        let edges = self.remove_copies(&removed).await;

        self.registry
            .record_transfer(
                TransferRecord::new(
                    chunk_id,
                    self.ctx.now(),
                    Some(removed.tier),
                    None,
                    TransferKind::Evicted { reason },
                )
                .with_detail(tombstone(&removed)),
            )
            .await?;
        info!(chunk_id, tier = %removed.tier, %reason, edges, "Evicted chunk");
        Ok(true)
    }

    /// Delete documents, graph edges and the vector of a removed chunk.
    /// Returns the number of edges removed.
    async fn remove_copies(&self, removed: &ChunkRecord) -> usize {
        let chunk_id = removed.id();
        if removed.tier != MemoryTier::Buffer {
            for collection in LONG_TERM_COLLECTIONS {
                if let Err(e) = self.ctx.documents.delete(collection, chunk_id).await {
                    warn!(chunk_id, %collection, error = %e, "Orphaned document after eviction");
                }
            }
        }
        let edges = match self.graph.remove_chunk(chunk_id).await {
            Ok(edges) => edges,
            Err(e) => {
                warn!(chunk_id, error = %e, "Orphaned graph edges after eviction");
                0
            }
        };
        if let Err(e) = self.ctx.vectors.delete(chunk_id).await {
            warn!(chunk_id, error = %e, "Orphaned vector after eviction");
        }
        edges
    }

    pub async fn attach_embedding(&self, chunk_id: &str, vector: Vec<f32>) -> Result<()> {
        let record = self
            .registry
            .get_chunk(chunk_id)
            .await?
            .ok_or_else(|| StrataError::NotFound(format!("chunk {chunk_id}")))?;
        self.ctx
            .vectors
            .upsert(&VectorEntry {
                chunk_id: chunk_id.to_string(),
                project_id: record.project_id().to_string(),
                vector,
                updated_at: self.ctx.now(),
            })
            .await
    }

    /// Nearest embeddings within one project, closest first. Vectors of
    /// evicted or quarantined chunks are skipped.
    pub async fn find_nearest(
        &self,
        project_id: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<VectorMatch>> {
        if project_id.trim().is_empty() {
            return Err(StrataError::Validation(
                "project id is required for similarity search".to_string(),
            ));
        }
        let mut matches = Vec::new();
        for candidate in self.ctx.vectors.nearest(project_id, vector, limit).await? {
            if candidate.project_id != project_id {
                continue;
            }
            let live = self
                .registry
                .get_chunk(&candidate.chunk_id)
                .await?
                .is_some_and(|r| r.is_queryable());
            if live {
                matches.push(candidate);
            }
        }
        Ok(matches)
    }
}

/// What survives of an evicted chunk in the transfer log.
fn tombstone(record: &ChunkRecord) -> String {
    let topics = &record.chunk.context.topics;
    let topics = if topics.is_empty() {
        "none".to_string()
    } else {
        topics.join(", ")
    };
    format!(
        "project {} {} from {}/{}, topics: {topics}, registered {}",
        record.project_id(),
        record.chunk.content_type,
        record.chunk.source.source_type,
        record.chunk.source.id,
        record.registered_at.format("%Y-%m-%d"),
    )
}
