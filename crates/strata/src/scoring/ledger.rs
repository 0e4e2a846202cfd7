//! Score ledger
//!
//! Stores one [`ScoreSet`] per chunk and derives the aggregates. Crossing a
//! threshold emits a [`TransferHint`]; the ledger never changes tiers itself.
//! Hints travel on a bounded channel and are dropped when it is full; the
//! consolidation sweep re-evaluates every working chunk anyway.

use std::sync::Arc;

use tokio::sync::mpsc::Sender;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::context::{StrataContext, chunk_lock_key};
use crate::error::{Result, StrataError};
use crate::scoring::{ScoreComponents, ScoreSet};
use crate::tiers::TransferHint;

/// Hints queued before the consumer falls behind and new ones are dropped
pub const HINT_QUEUE_CAPACITY: usize = 1024;

/// Result of an upsert: the stored set, what it replaced, and any hints
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreUpdate {
    pub scores: ScoreSet,
    pub previous: Option<ScoreSet>,
    pub hints: Vec<TransferHint>,
}

#[derive(Clone)]
pub struct ScoreLedger {
    ctx: Arc<StrataContext>,
    hints: Option<Sender<TransferHint>>,
}

impl ScoreLedger {
    pub fn new(ctx: Arc<StrataContext>) -> Self {
        Self { ctx, hints: None }
    }

    /// Ledger that also publishes threshold crossings on `hints`. Publishing
    /// never waits: a full queue drops the hint.
    pub fn with_hints(ctx: Arc<StrataContext>, hints: Sender<TransferHint>) -> Self {
        Self {
            ctx,
            hints: Some(hints),
        }
    }

    /// Replace all components for `chunk_id` and recompute the aggregates.
    ///
    /// Rejects out-of-range components before anything is written; the ten
    /// fields are persisted as a single row.
    pub async fn upsert_scores(
        &self,
        chunk_id: &str,
        components: ScoreComponents,
    ) -> Result<ScoreUpdate> {
        let update = self.apply_scores(chunk_id, components).await?;
        self.publish(&update.hints);
        Ok(update)
    }

    /// `upsert_scores` without publishing; the caller handles the hints.
    pub(crate) async fn apply_scores(
        &self,
        chunk_id: &str,
        components: ScoreComponents,
    ) -> Result<ScoreUpdate> {
        components.validate()?;

        let (scores, previous) = {
            let _guard = self.ctx.locks.lock(&chunk_lock_key(chunk_id)).await;
            if self.ctx.tables.get_chunk(chunk_id).await?.is_none() {
                return Err(StrataError::NotFound(format!("chunk {chunk_id}")));
            }
            let previous = self.ctx.tables.get_scores(chunk_id).await?;
            let scores = ScoreSet::from_components(
                chunk_id,
                &components,
                &self.ctx.config.scoring.weights,
                self.ctx.now(),
            )?;
            self.ctx.tables.put_scores(&scores).await?;
            (scores, previous)
        };

        let hints = self.crossings(previous.as_ref(), &scores);
        debug!(
            chunk_id,
            confidence = scores.confidence,
            doubt = scores.doubt,
            hints = hints.len(),
            "Scores updated"
        );

        Ok(ScoreUpdate {
            scores,
            previous,
            hints,
        })
    }

    pub async fn get_scores(&self, chunk_id: &str) -> Result<Option<ScoreSet>> {
        self.ctx.tables.get_scores(chunk_id).await
    }

    /// Upward threshold crossings between `previous` and `next`.
    fn crossings(&self, previous: Option<&ScoreSet>, next: &ScoreSet) -> Vec<TransferHint> {
        let scoring = &self.ctx.config.scoring;
        let mut hints = Vec::new();

        let crossed = |before: Option<u8>, after: u8, threshold: u8| {
            after >= threshold && before.is_none_or(|b| b < threshold)
        };

        if crossed(
            previous.map(|p| p.confidence),
            next.confidence,
            scoring.confidence_threshold,
        ) {
            hints.push(TransferHint::ConfidenceReached {
                chunk_id: next.chunk_id.clone(),
                confidence: next.confidence,
            });
        }
        if crossed(previous.map(|p| p.doubt), next.doubt, scoring.doubt_threshold) {
            info!(chunk_id = %next.chunk_id, doubt = next.doubt, "Doubt threshold crossed");
            hints.push(TransferHint::DoubtRaised {
                chunk_id: next.chunk_id.clone(),
                doubt: next.doubt,
            });
        }
        hints
    }

    fn publish(&self, hints: &[TransferHint]) {
        let Some(sender) = &self.hints else {
            return;
        };
        for hint in hints {
            match sender.try_send(hint.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(hint)) => {
                    warn!(
                        chunk_id = hint.chunk_id(),
                        capacity = sender.max_capacity(),
                        "Hint queue full; leaving the chunk to the next sweep"
                    );
                }
                Err(TrySendError::Closed(hint)) => {
                    debug!(chunk_id = hint.chunk_id(), "No hint consumer; dropping hint");
                }
            }
        }
    }
}
