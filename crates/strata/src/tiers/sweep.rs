//! Periodic consolidation sweep
//!
//! Catches everything the event-driven path missed: expired buffer entries,
//! retries whose backoff elapsed, admissions and promotions that failed
//! midway, interrupted transfers, duplicate edges and missing projections.
//! Every step is safe to run concurrently with itself and with the event
//! path, and a sweep can be cancelled between items.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::chunk::ChunkRecord;
use crate::context::StrataContext;
use crate::error::{Result, StrataError};
use crate::storage::{ChunkCursor, ChunkQuery, TableStore};
use crate::tiers::{
    EvictionReason, MemoryTier, TierCoordinator, TransferIntent, TransferOutcome,
};

/// Buffer key holding the RFC 3339 finish time of the last sweep
pub const LAST_SWEEP_KEY: &str = "sweep:last";

const LAST_SWEEP_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Buffer key holding the consolidation loop's [`HealthStatus`]
pub const HEALTH_KEY: &str = "health:status";

/// A running loop refreshes its health well inside this window, so an
/// absent key means no loop is running.
const HEALTH_TTL: Duration = Duration::from_secs(30);

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Liveness of the consolidation loop as seen by other processes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// The last sweep failed or skipped items after errors
    Degraded,
    /// The loop stopped cleanly
    Down,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Down => "down",
        }
    }

    /// The stored status, or `None` when no loop reported recently.
    pub async fn read(ctx: &StrataContext) -> Result<Option<Self>> {
        let Some(raw) = ctx.buffer.get(HEALTH_KEY).await? else {
            return Ok(None);
        };
        let status = match raw.as_str() {
            "healthy" => Some(HealthStatus::Healthy),
            "degraded" => Some(HealthStatus::Degraded),
            "down" => Some(HealthStatus::Down),
            other => {
                warn!(value = other, "Unrecognized health status");
                None
            }
        };
        Ok(status)
    }

    /// Status after a sweep; a cancelled sweep says nothing new.
    fn after_sweep(self, result: &Result<ConsolidationReport>) -> Self {
        match result {
            Ok(report) if report.cancelled => self,
            Ok(report) if report.errors > 0 => HealthStatus::Degraded,
            Ok(_) => HealthStatus::Healthy,
            Err(_) => HealthStatus::Degraded,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receiving side of a cancellation signal
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

/// Sending side of a cancellation signal
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl CancelToken {
    /// A token that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancelled; pends forever if the handle is dropped first.
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsolidationReport {
    pub evicted: usize,
    pub purged: usize,
    pub requeued: usize,
    pub admitted: usize,
    pub promoted: usize,
    pub quarantined: usize,
    pub deferred: usize,
    pub intents_resumed: usize,
    pub edges_compacted: usize,
    pub projected: usize,
    /// Per-item failures that were logged and skipped
    pub errors: usize,
    pub cancelled: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ConsolidationReport {
    /// Count of committed tier changes and removals.
    pub fn changes(&self) -> usize {
        self.evicted + self.admitted + self.promoted + self.quarantined + self.projected
    }

    fn record(&mut self, outcome: &TransferOutcome) {
        match outcome {
            TransferOutcome::Moved(MemoryTier::Semantic) => self.promoted += 1,
            TransferOutcome::Moved(MemoryTier::FailedTerminal) => self.quarantined += 1,
            TransferOutcome::Moved(tier) if tier.is_projection() => self.projected += 1,
            TransferOutcome::Deferred { .. } => self.deferred += 1,
            _ => {}
        }
    }
}

/// Walks a chunk query page by page in registration order.
///
/// Each page resumes after the last key seen, so chunks that leave the
/// query mid-walk never make a later page skip its neighbours.
struct ChunkPages {
    query: ChunkQuery,
    page_size: usize,
    cursor: Option<ChunkCursor>,
    exhausted: bool,
}

impl ChunkPages {
    fn new(query: ChunkQuery, page_size: usize) -> Self {
        let page_size = page_size.max(1);
        Self {
            query: query.limit(page_size),
            page_size,
            cursor: None,
            exhausted: false,
        }
    }

    async fn next(&mut self, tables: &dyn TableStore) -> Result<Option<Vec<ChunkRecord>>> {
        if self.exhausted {
            return Ok(None);
        }
        let mut query = self.query.clone();
        if let Some(cursor) = self.cursor.take() {
            query = query.after(cursor);
        }
        let page = tables.scan_chunks(&query).await?;
        self.exhausted = page.len() < self.page_size;
        self.cursor = page.last().map(ChunkCursor::of);
        Ok((!page.is_empty()).then_some(page))
    }
}

macro_rules! bail_if_cancelled {
    ($cancel:expr, $report:expr) => {
        if $cancel.is_cancelled() {
            $report.cancelled = true;
            return Ok($report);
        }
    };
}

impl TierCoordinator {
    pub async fn sweep(&self) -> Result<ConsolidationReport> {
        self.sweep_with(&CancelToken::never()).await
    }

    /// One consolidation pass. Item failures are logged and counted; only a
    /// failed scan aborts the pass.
    pub async fn sweep_with(&self, cancel: &CancelToken) -> Result<ConsolidationReport> {
        let ctx = self.context();
        let now = ctx.now();
        let batch_size = ctx.config.consolidation.batch_size;
        let mut report = ConsolidationReport {
            started_at: Some(now),
            ..Default::default()
        };

        self.evict_expired(now, batch_size, cancel, &mut report)
            .await?;
        bail_if_cancelled!(cancel, report);
        report.purged = ctx.buffer.purge_expired().await?;

        report.requeued = self.registry().requeue_due(now).await?.len();
        bail_if_cancelled!(cancel, report);

        self.admit_missed(batch_size, cancel, &mut report).await?;
        bail_if_cancelled!(cancel, report);

        for intent in ctx.tables.list_intents().await? {
            bail_if_cancelled!(cancel, report);
            match self.resume_intent(&intent).await {
                Ok(outcome) => {
                    report.intents_resumed += 1;
                    report.record(&outcome);
                }
                Err(e) => {
                    warn!(chunk_id = %intent.chunk_id, error = %e, "Could not resume transfer");
                    report.errors += 1;
                }
            }
        }

        let mut working =
            ChunkPages::new(ChunkQuery::new().in_tier(MemoryTier::Working), batch_size);
        while let Some(page) = working.next(ctx.tables.as_ref()).await? {
            for record in page {
                bail_if_cancelled!(cancel, report);
                match self.evaluate(record.id()).await {
                    Ok(outcome) => report.record(&outcome),
                    Err(e) => {
                        warn!(chunk_id = record.id(), error = %e, "Evaluation failed during sweep");
                        report.errors += 1;
                    }
                }
            }
        }

        let mut semantic =
            ChunkPages::new(ChunkQuery::new().in_tier(MemoryTier::Semantic), batch_size);
        while let Some(page) = semantic.next(ctx.tables.as_ref()).await? {
            for record in page {
                bail_if_cancelled!(cancel, report);
                if !self.policy().missing_projections(&record).is_empty() {
                    report.projected += self.apply_projection_rules(&record).await;
                }
            }
        }

        report.edges_compacted = self.graph().compact_duplicates(cancel).await?;
        bail_if_cancelled!(cancel, report);

        ctx.locks.prune();
        let finished_at = ctx.now();
        report.finished_at = Some(finished_at);
        ctx.buffer
            .put(LAST_SWEEP_KEY, finished_at.to_rfc3339(), LAST_SWEEP_TTL)
            .await?;

        if report.changes() > 0 || report.errors > 0 {
            info!(
                evicted = report.evicted,
                requeued = report.requeued,
                admitted = report.admitted,
                promoted = report.promoted,
                quarantined = report.quarantined,
                deferred = report.deferred,
                projected = report.projected,
                errors = report.errors,
                "Consolidation sweep finished"
            );
        } else {
            debug!("Consolidation sweep found nothing to do");
        }
        Ok(report)
    }

    /// Buffer chunks older than the TTL that nothing ever picked up.
    async fn evict_expired(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
        cancel: &CancelToken,
        report: &mut ConsolidationReport,
    ) -> Result<()> {
        let ttl = chrono::Duration::from_std(self.context().config.buffer.ttl())
            .map_err(|e| StrataError::Config(format!("buffer ttl out of range: {e}")))?;
        let query = ChunkQuery::new()
            .in_tier(MemoryTier::Buffer)
            .registered_before(now - ttl);

        let mut pages = ChunkPages::new(query, batch_size);
        while let Some(page) = pages.next(self.context().tables.as_ref()).await? {
            for record in page {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    return Ok(());
                }
                match self.evict(record.id(), EvictionReason::TtlExpired).await {
                    Ok(true) => report.evicted += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(chunk_id = record.id(), error = %e, "Buffer eviction failed");
                        report.errors += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// Buffer chunks whose status already moved but whose admission was lost.
    /// Untouched buffer chunks are skipped without ending the walk.
    async fn admit_missed(
        &self,
        batch_size: usize,
        cancel: &CancelToken,
        report: &mut ConsolidationReport,
    ) -> Result<()> {
        let mut pages =
            ChunkPages::new(ChunkQuery::new().in_tier(MemoryTier::Buffer), batch_size);
        while let Some(page) = pages.next(self.context().tables.as_ref()).await? {
            for record in page {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    return Ok(());
                }
                let Some(status) = self.registry().get_status(record.id()).await? else {
                    continue;
                };
                if status.version == 0 {
                    continue;
                }
                match self.admit(record.id()).await {
                    Ok(true) => report.admitted += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(chunk_id = record.id(), error = %e, "Admission failed during sweep");
                        report.errors += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// Finish or discard a transfer left behind by an interrupted writer.
    async fn resume_intent(&self, intent: &TransferIntent) -> Result<TransferOutcome> {
        let tables = &self.context().tables;
        let tier = self.tier_of(&intent.chunk_id).await?;

        if tier == Some(intent.from) {
            debug!(chunk_id = %intent.chunk_id, to = %intent.to, "Resuming interrupted transfer");
            let outcome = self.promote(&intent.chunk_id).await?;
            if !outcome.is_moved() {
                tables.delete_intent(&intent.chunk_id).await?;
            }
            return Ok(outcome);
        }

        // already committed, or the chunk is gone or elsewhere
        tables.delete_intent(&intent.chunk_id).await?;
        Ok(if tier == Some(intent.to) {
            TransferOutcome::AlreadyMoved
        } else {
            TransferOutcome::NotEligible
        })
    }

    /// Sweep on the configured interval and act on score hints until
    /// `shutdown` fires. Only one loop may run per coordinator.
    pub async fn run(&self, mut shutdown: CancelToken) -> Result<()> {
        let mut hints = self.hint_rx.lock().await.take().ok_or_else(|| {
            StrataError::Conflict("consolidation loop is already running".to_string())
        })?;

        let sweep_cancel = shutdown.clone();
        let mut interval = tokio::time::interval(self.context().config.consolidation.sweep_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut health = HealthStatus::Healthy;
        info!(
            interval_secs = self.context().config.consolidation.sweep_interval_secs,
            "Consolidation loop started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = heartbeat.tick() => self.report_health(health).await,
                _ = interval.tick() => {
                    let result = self.sweep_with(&sweep_cancel).await;
                    match &result {
                        Ok(report) if report.cancelled => debug!("Sweep cancelled"),
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Consolidation sweep failed"),
                    }
                    let next = health.after_sweep(&result);
                    if next != health {
                        info!(from = %health, to = %next, "Consolidation health changed");
                        health = next;
                    }
                    self.report_health(health).await;
                }
                Some(hint) = hints.recv() => {
                    if let Err(e) = self.handle_hint(hint).await {
                        warn!(error = %e, "Failed to act on score hint");
                    }
                }
            }
        }

        self.report_health(HealthStatus::Down).await;
        *self.hint_rx.lock().await = Some(hints);
        info!("Consolidation loop stopped");
        Ok(())
    }

    pub async fn health(&self) -> Result<Option<HealthStatus>> {
        HealthStatus::read(self.context()).await
    }

    async fn report_health(&self, status: HealthStatus) {
        let stored = self
            .context()
            .buffer
            .put(HEALTH_KEY, status.as_str().to_string(), HEALTH_TTL)
            .await;
        if let Err(e) = stored {
            warn!(%status, error = %e, "Could not record consolidation health");
        }
    }
}
