//! Chunk registry: identity, current tier, and the status state machine
//!
//! Writers of one chunk are serialized through the context's keyed locks and
//! every row change is a compare-and-swap on the row version, so a writer
//! that loses a race re-reads fresh state instead of overwriting it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::chunk::{Chunk, ChunkRecord, ProcessingStatus, StatusKind};
use crate::context::{StrataContext, chunk_lock_key};
use crate::error::{Result, StrataError};
use crate::storage::StatusQuery;
use crate::tiers::{MemoryTier, TransferKind, TransferRecord};

/// How many times a compare-and-swap is retried against fresh state
const CAS_ATTEMPTS: usize = 8;

pub(crate) fn raw_key(chunk_id: &str) -> String {
    format!("raw:{chunk_id}")
}

/// Outcome of `register_chunk`
#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    Created(ChunkRecord),
    /// Same id and identical content was already registered
    Unchanged(ChunkRecord),
}

impl Registration {
    pub fn record(&self) -> &ChunkRecord {
        match self {
            Registration::Created(r) | Registration::Unchanged(r) => r,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Registration::Created(_))
    }
}

/// A terminally failed chunk with its final status, for operator review
#[derive(Debug, Clone, PartialEq)]
pub struct FailedChunk {
    pub record: ChunkRecord,
    pub status: ProcessingStatus,
}

#[derive(Clone)]
pub struct ChunkRegistry {
    ctx: Arc<StrataContext>,
}

impl ChunkRegistry {
    pub fn new(ctx: Arc<StrataContext>) -> Self {
        Self { ctx }
    }

    /// Register a chunk in the buffer tier.
    ///
    /// Re-registering identical content is a no-op; different content under
    /// an existing id is a `Conflict`.
    pub async fn register_chunk(&self, chunk: Chunk) -> Result<Registration> {
        chunk.validate()?;
        let registration = {
            let _guard = self.ctx.locks.lock(&chunk_lock_key(&chunk.id)).await;
            self.insert_locked(chunk).await?
        };
        if let Registration::Created(record) = &registration {
            self.store_raw_copy(record).await;
        }
        Ok(registration)
    }

    /// Raw connector payload kept in the buffer store for the buffer TTL.
    /// The row is already committed, so a failed write is only logged.
    async fn store_raw_copy(&self, record: &ChunkRecord) {
        let stored = match serde_json::to_string(&record.chunk) {
            Ok(raw) => {
                self.ctx
                    .buffer
                    .put(&raw_key(record.id()), raw, self.ctx.config.buffer.ttl())
                    .await
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = stored {
            warn!(chunk_id = record.id(), error = %e, "Could not store raw buffer copy");
        }
    }

    /// Caller holds the chunk lock.
    async fn insert_locked(&self, chunk: Chunk) -> Result<Registration> {
        let tables = &self.ctx.tables;

        if let Some(existing) = tables.get_chunk(&chunk.id).await? {
            return self.compare_existing(existing, &chunk).await;
        }
        self.check_neighbours(&chunk).await?;

        let now = self.ctx.now();
        let record = ChunkRecord::new(chunk, now);
        let id = record.id().to_string();

        if !tables.insert_chunk(&record).await? {
            let existing = tables
                .get_chunk(&id)
                .await?
                .ok_or_else(|| StrataError::NotFound(format!("chunk {id}")))?;
            return self.compare_existing(existing, &record.chunk).await;
        }
        tables.insert_status(&ProcessingStatus::new(&id, now)).await?;
        tables
            .append_transfer(&TransferRecord::new(
                &id,
                now,
                None,
                Some(MemoryTier::Buffer),
                TransferKind::Registered,
            ))
            .await?;

        info!(
            chunk_id = %id,
            project_id = %record.project_id(),
            content_type = %record.chunk.content_type,
            "Registered chunk in buffer tier"
        );
        Ok(Registration::Created(record))
    }

    async fn compare_existing(&self, existing: ChunkRecord, chunk: &Chunk) -> Result<Registration> {
        if existing.chunk.project_id != chunk.project_id
            || existing.chunk.connector_id != chunk.connector_id
        {
            return Err(StrataError::Conflict(format!(
                "chunk {} is already registered to project {} via connector {}",
                chunk.id, existing.chunk.project_id, existing.chunk.connector_id
            )));
        }
        if existing.content_hash != chunk.content_hash() {
            warn!(chunk_id = %chunk.id, "Rejected content change for registered chunk");
            return Err(StrataError::Conflict(format!(
                "chunk {} is already registered with different content; use a new id for revisions",
                chunk.id
            )));
        }

        // heals a registration interrupted before its status row was written
        self.ctx
            .tables
            .insert_status(&ProcessingStatus::new(existing.id(), existing.registered_at))
            .await?;
        debug!(chunk_id = %chunk.id, "Duplicate registration ignored");
        Ok(Registration::Unchanged(existing))
    }

    /// Sibling links must agree with `order` and must not form a two-cycle
    /// with an already registered neighbour.
    async fn check_neighbours(&self, chunk: &Chunk) -> Result<()> {
        let order = chunk.order();

        if let Some(previous_id) = chunk.previous_chunk_id() {
            if let Some(previous) = self.ctx.tables.get_chunk(previous_id).await? {
                if previous.chunk.previous_chunk_id() == Some(chunk.id.as_str()) {
                    return Err(StrataError::Validation(format!(
                        "sibling cycle between {} and {previous_id}",
                        chunk.id
                    )));
                }
                if let (Some(theirs), Some(ours)) = (previous.chunk.order(), order) {
                    if theirs >= ours {
                        return Err(StrataError::Validation(format!(
                            "chunk {} (order {ours}) follows {previous_id} (order {theirs})",
                            chunk.id
                        )));
                    }
                }
            }
        }

        if let Some(next_id) = chunk.next_chunk_id() {
            if let Some(next) = self.ctx.tables.get_chunk(next_id).await? {
                if next.chunk.next_chunk_id() == Some(chunk.id.as_str()) {
                    return Err(StrataError::Validation(format!(
                        "sibling cycle between {} and {next_id}",
                        chunk.id
                    )));
                }
                if let (Some(theirs), Some(ours)) = (next.chunk.order(), order) {
                    if theirs <= ours {
                        return Err(StrataError::Validation(format!(
                            "chunk {} (order {ours}) precedes {next_id} (order {theirs})",
                            chunk.id
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    pub async fn get_chunk(&self, id: &str) -> Result<Option<ChunkRecord>> {
        self.ctx.tables.get_chunk(id).await
    }

    pub async fn get_status(&self, id: &str) -> Result<Option<ProcessingStatus>> {
        self.ctx.tables.get_status(id).await
    }

    /// Apply a status transition; the losing side of a concurrent update
    /// re-evaluates against the winner's state.
    pub async fn set_status(
        &self,
        id: &str,
        to: StatusKind,
        error: Option<String>,
    ) -> Result<ProcessingStatus> {
        let policy = self.ctx.retry_policy();
        let status = self
            .swap_status(id, |current, now| {
                current.transition(to, error.clone(), &policy, now)
            })
            .await?;

        match status.status {
            StatusKind::Failed if status.is_terminal() => warn!(
                chunk_id = id,
                retry_count = status.retry_count,
                error = status.error.as_deref().unwrap_or(""),
                "Chunk failed terminally, retry budget exhausted"
            ),
            StatusKind::Failed => info!(
                chunk_id = id,
                retry_count = status.retry_count,
                next_attempt = ?status.next_attempt,
                "Chunk failed, retry scheduled"
            ),
            other => debug!(chunk_id = id, status = %other, "Status updated"),
        }
        Ok(status)
    }

    /// Explicit re-ingestion of a completed or terminally failed chunk.
    pub async fn reingest(&self, id: &str) -> Result<ProcessingStatus> {
        let status = self
            .swap_status(id, |current, now| current.reingested(now))
            .await?;
        info!(chunk_id = id, retry_count = status.retry_count, "Chunk re-ingested");
        Ok(status)
    }

    async fn swap_status<F>(&self, id: &str, next_state: F) -> Result<ProcessingStatus>
    where
        F: Fn(&ProcessingStatus, DateTime<Utc>) -> Result<ProcessingStatus>,
    {
        let _guard = self.ctx.locks.lock(&chunk_lock_key(id)).await;
        for _ in 0..CAS_ATTEMPTS {
            let current = self
                .ctx
                .tables
                .get_status(id)
                .await?
                .ok_or_else(|| StrataError::NotFound(format!("status for chunk {id}")))?;
            let next = next_state(&current, self.ctx.now())?;
            if self
                .ctx
                .tables
                .compare_and_swap_status(&next, current.version)
                .await?
            {
                return Ok(next);
            }
            debug!(chunk_id = id, "Status changed concurrently, retrying on fresh state");
        }
        Err(StrataError::Conflict(format!(
            "status of chunk {id} kept changing; gave up after {CAS_ATTEMPTS} attempts"
        )))
    }

    /// Pending chunks that are due, oldest `processed_at` first.
    pub async fn list_pending(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<ChunkRecord>> {
        let statuses = self
            .ctx
            .tables
            .scan_status(&StatusQuery::new().with_status(StatusKind::Pending))
            .await?;

        let mut due = Vec::new();
        for status in statuses.into_iter().filter(|s| s.is_due(now)) {
            if let Some(record) = self.ctx.tables.get_chunk(&status.chunk_id).await? {
                if record.is_queryable() {
                    due.push(record);
                }
            }
        }
        due.sort_by(|a, b| {
            a.chunk
                .processed_at
                .cmp(&b.chunk.processed_at)
                .then_with(|| a.id().cmp(b.id()))
        });
        due.truncate(limit);
        Ok(due)
    }

    /// Terminal failures kept for manual intervention, most recent first.
    pub async fn list_failed(&self, limit: usize) -> Result<Vec<FailedChunk>> {
        let statuses = self
            .ctx
            .tables
            .scan_status(&StatusQuery::new().with_status(StatusKind::Failed))
            .await?;

        let mut failed = Vec::new();
        for status in statuses.into_iter().filter(ProcessingStatus::is_terminal) {
            if let Some(record) = self.ctx.tables.get_chunk(&status.chunk_id).await? {
                failed.push(FailedChunk { record, status });
            }
        }
        failed.sort_by(|a, b| {
            b.status
                .updated_at
                .cmp(&a.status.updated_at)
                .then_with(|| a.record.id().cmp(b.record.id()))
        });
        failed.truncate(limit);
        Ok(failed)
    }

    /// Move failed chunks whose backoff has elapsed back to `pending`.
    pub async fn requeue_due(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let statuses = self
            .ctx
            .tables
            .scan_status(&StatusQuery::new().with_status(StatusKind::Failed))
            .await?;

        let mut requeued = Vec::new();
        for status in statuses.into_iter().filter(|s| s.is_retry_due(now)) {
            match self.set_status(&status.chunk_id, StatusKind::Pending, None).await {
                Ok(_) => requeued.push(status.chunk_id),
                Err(StrataError::InvalidTransition { .. }) => {
                    debug!(chunk_id = %status.chunk_id, "Already requeued elsewhere");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(requeued)
    }

    /// Move `id` from `expected` to `next`. `Ok(None)` means the chunk was no
    /// longer in `expected`, so someone else already moved it.
    pub(crate) async fn compare_and_set_tier(
        &self,
        id: &str,
        expected: MemoryTier,
        next: MemoryTier,
    ) -> Result<Option<ChunkRecord>> {
        let _guard = self.ctx.locks.lock(&chunk_lock_key(id)).await;
        for _ in 0..CAS_ATTEMPTS {
            let current = self
                .get_chunk(id)
                .await?
                .ok_or_else(|| StrataError::NotFound(format!("chunk {id}")))?;
            if current.tier != expected {
                return Ok(None);
            }
            let moved = current.moved_to(next, self.ctx.now());
            if self
                .ctx
                .tables
                .compare_and_swap_chunk(&moved, current.version)
                .await?
            {
                return Ok(Some(moved));
            }
        }
        Err(StrataError::Conflict(format!(
            "tier of chunk {id} kept changing; gave up after {CAS_ATTEMPTS} attempts"
        )))
    }

    /// Record a secondary projection on a semantic chunk. Returns false if it
    /// was already present.
    pub(crate) async fn add_projection(&self, id: &str, tier: MemoryTier) -> Result<bool> {
        let _guard = self.ctx.locks.lock(&chunk_lock_key(id)).await;
        for _ in 0..CAS_ATTEMPTS {
            let current = self
                .get_chunk(id)
                .await?
                .ok_or_else(|| StrataError::NotFound(format!("chunk {id}")))?;
            if current.projections.contains(&tier) {
                return Ok(false);
            }
            if current.tier != MemoryTier::Semantic {
                return Err(StrataError::invalid_transition(id, current.tier, tier));
            }
            let projected = current.with_projection(tier);
            if self
                .ctx
                .tables
                .compare_and_swap_chunk(&projected, current.version)
                .await?
            {
                return Ok(true);
            }
        }
        Err(StrataError::Conflict(format!(
            "chunk {id} kept changing while adding {tier} projection"
        )))
    }

    /// Delete the chunk and its status, scores and raw buffer copy if it is
    /// still in `expected` (any tier when `None`).
    pub(crate) async fn remove(
        &self,
        id: &str,
        expected: Option<MemoryTier>,
    ) -> Result<Option<ChunkRecord>> {
        let removed = {
            let _guard = self.ctx.locks.lock(&chunk_lock_key(id)).await;
            let Some(current) = self.get_chunk(id).await? else {
                return Ok(None);
            };
            if expected.is_some_and(|tier| tier != current.tier) {
                return Ok(None);
            }
            if !self
                .ctx
                .tables
                .compare_and_delete_chunk(id, current.version)
                .await?
            {
                return Ok(None);
            }
            self.ctx.tables.delete_status(id).await?;
            self.ctx.tables.delete_scores(id).await?;
            current
        };
        // a raw copy that outlives its row still expires with the buffer TTL
        if let Err(e) = self.ctx.buffer.delete(&raw_key(id)).await {
            warn!(chunk_id = id, error = %e, "Could not delete raw buffer copy");
        }
        Ok(Some(removed))
    }

    pub(crate) async fn record_transfer(&self, record: TransferRecord) -> Result<()> {
        self.ctx.tables.append_transfer(&record).await
    }

    pub async fn transfer_log(&self, id: &str) -> Result<Vec<TransferRecord>> {
        self.ctx.tables.transfers_for(id).await
    }
}
