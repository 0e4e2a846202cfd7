//! Intake boundary: batches of standardized chunks from connectors, plus
//! score and status reports from downstream processors
//!
//! Each chunk is registered independently and gets its own acceptance
//! result. Batch progress is kept in the buffer store for a couple of hours
//! so producers can poll it. Connectors are rate limited per batch with a
//! windowed counter in the buffer store.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::chunk::{Chunk, ChunkRegistry, ProcessingStatus, Registration, StatusKind};
use crate::context::StrataContext;
use crate::error::{Result, StrataError};
use crate::scoring::{ScoreComponents, ScoreSet};
use crate::tiers::TierCoordinator;

const BATCH_STATUS_TTL: Duration = Duration::from_secs(2 * 60 * 60);

fn batch_status_key(batch_id: &str) -> String {
    format!("batch:{batch_id}:status")
}

fn rate_limit_key(connector_id: &str) -> String {
    format!("rate:{connector_id}")
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchMetadata {
    #[serde(default)]
    pub total_chunks: Option<usize>,
    #[serde(default)]
    pub batch_number: Option<u32>,
    #[serde(default)]
    pub is_complete: Option<bool>,
}

/// A connector's delivery of chunks from one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkBatch {
    pub batch_id: String,
    pub connector_id: String,
    pub source_id: String,
    /// Applied to chunks that arrive without a project id
    #[serde(default)]
    pub project_id: Option<String>,
    pub chunks: Vec<Chunk>,
    #[serde(default)]
    pub batch_metadata: Option<BatchMetadata>,
}

impl ChunkBatch {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ChunkAcceptance {
    Accepted {
        chunk_id: String,
    },
    /// Identical content was already registered under this id
    Duplicate {
        chunk_id: String,
    },
    Rejected {
        chunk_id: String,
        error: String,
        /// Resubmitting may succeed (a store was unavailable)
        retryable: bool,
    },
}

impl ChunkAcceptance {
    pub fn chunk_id(&self) -> &str {
        match self {
            ChunkAcceptance::Accepted { chunk_id }
            | ChunkAcceptance::Duplicate { chunk_id }
            | ChunkAcceptance::Rejected { chunk_id, .. } => chunk_id,
        }
    }

    fn from_result(chunk_id: String, result: Result<Registration>) -> Self {
        match result {
            Ok(Registration::Created(_)) => ChunkAcceptance::Accepted { chunk_id },
            Ok(Registration::Unchanged(_)) => ChunkAcceptance::Duplicate { chunk_id },
            Err(e) => ChunkAcceptance::Rejected {
                chunk_id,
                retryable: e.is_retryable(),
                error: e.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchState {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchState::Pending => "pending",
            BatchState::Processing => "processing",
            BatchState::Completed => "completed",
            BatchState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStatus {
    pub batch_id: String,
    pub state: BatchState,
    pub total_chunks: usize,
    pub processed_chunks: usize,
    pub accepted: usize,
    pub duplicates: usize,
    pub rejected: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl BatchStatus {
    fn new(batch_id: &str, total_chunks: usize, now: DateTime<Utc>) -> Self {
        Self {
            batch_id: batch_id.to_string(),
            state: BatchState::Pending,
            total_chunks,
            processed_chunks: 0,
            accepted: 0,
            duplicates: 0,
            rejected: 0,
            error: None,
            updated_at: now,
        }
    }

    fn count(&mut self, acceptance: &ChunkAcceptance) {
        self.processed_chunks += 1;
        match acceptance {
            ChunkAcceptance::Accepted { .. } => self.accepted += 1,
            ChunkAcceptance::Duplicate { .. } => self.duplicates += 1,
            ChunkAcceptance::Rejected { .. } => self.rejected += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReceipt {
    pub batch_id: String,
    pub results: Vec<ChunkAcceptance>,
    pub status: BatchStatus,
}

impl BatchReceipt {
    pub fn rejected(&self) -> impl Iterator<Item = &ChunkAcceptance> {
        self.results
            .iter()
            .filter(|r| matches!(r, ChunkAcceptance::Rejected { .. }))
    }
}

/// One line of the daemon's stdin protocol, tagged by `type`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IntakeMessage {
    Batch(ChunkBatch),
    #[serde(rename_all = "camelCase")]
    Scores {
        chunk_id: String,
        scores: ScoreComponents,
    },
    #[serde(rename_all = "camelCase")]
    Status {
        chunk_id: String,
        status: StatusKind,
        #[serde(default)]
        error: Option<String>,
    },
}

impl IntakeMessage {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Answer to one [`IntakeMessage`], tagged like the message it answers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IntakeReply {
    Batch(BatchReceipt),
    Scores(ScoreSet),
    Status(ProcessingStatus),
}

#[derive(Clone)]
pub struct Intake {
    ctx: Arc<StrataContext>,
    registry: ChunkRegistry,
}

impl Intake {
    pub fn new(ctx: Arc<StrataContext>) -> Self {
        Self {
            registry: ChunkRegistry::new(ctx.clone()),
            ctx,
        }
    }

    /// Register every chunk in `batch`.
    ///
    /// Only a malformed batch envelope is an error; per-chunk problems are
    /// reported in the receipt. A batch with any retryable rejection ends
    /// `failed` and can be resubmitted as a whole, since accepted chunks come
    /// back as duplicates.
    pub async fn submit_batch(&self, batch: ChunkBatch) -> Result<BatchReceipt> {
        if batch.batch_id.trim().is_empty() {
            return Err(StrataError::Validation("batchId is required".to_string()));
        }
        if batch.connector_id.trim().is_empty() {
            return Err(StrataError::Validation("connectorId is required".to_string()));
        }
        self.check_rate_limit(&batch.connector_id).await?;

        let mut status = BatchStatus::new(&batch.batch_id, batch.chunks.len(), self.ctx.now());
        if let Some(total) = batch.batch_metadata.as_ref().and_then(|m| m.total_chunks) {
            if total != batch.chunks.len() {
                warn!(
                    batch_id = %batch.batch_id,
                    declared = total,
                    received = batch.chunks.len(),
                    "Batch chunk count differs from its metadata"
                );
            }
        }
        status.state = BatchState::Processing;
        self.store_status(&status).await;

        let mut results = Vec::with_capacity(batch.chunks.len());
        for mut chunk in batch.chunks {
            if chunk.project_id.trim().is_empty() {
                if let Some(project_id) = &batch.project_id {
                    chunk.project_id = project_id.clone();
                }
            }
            let chunk_id = chunk.id.clone();
            let acceptance =
                ChunkAcceptance::from_result(chunk_id, self.registry.register_chunk(chunk).await);
            if let ChunkAcceptance::Rejected {
                chunk_id,
                error,
                retryable,
            } = &acceptance
            {
                warn!(batch_id = %batch.batch_id, %chunk_id, retryable, "Chunk rejected: {error}");
                if *retryable && status.error.is_none() {
                    status.error = Some(format!("chunk {chunk_id}: {error}"));
                }
            }
            status.count(&acceptance);
            results.push(acceptance);
        }

        status.state = if status.error.is_some() {
            BatchState::Failed
        } else {
            BatchState::Completed
        };
        status.updated_at = self.ctx.now();
        self.store_status(&status).await;

        info!(
            batch_id = %batch.batch_id,
            connector_id = %batch.connector_id,
            source_id = %batch.source_id,
            accepted = status.accepted,
            duplicates = status.duplicates,
            rejected = status.rejected,
            state = %status.state,
            "Batch processed"
        );
        Ok(BatchReceipt {
            batch_id: batch.batch_id,
            results,
            status,
        })
    }

    /// Route one protocol message: batches are registered here, score and
    /// status reports go through `coordinator` so tier moves follow them.
    pub async fn route(
        &self,
        coordinator: &TierCoordinator,
        message: IntakeMessage,
    ) -> Result<IntakeReply> {
        match message {
            IntakeMessage::Batch(batch) => Ok(IntakeReply::Batch(self.submit_batch(batch).await?)),
            IntakeMessage::Scores { chunk_id, scores } => {
                let update = coordinator.upsert_scores(&chunk_id, scores).await?;
                Ok(IntakeReply::Scores(update.scores))
            }
            IntakeMessage::Status {
                chunk_id,
                status,
                error,
            } => Ok(IntakeReply::Status(
                coordinator.set_status(&chunk_id, status, error).await?,
            )),
        }
    }

    /// Count one batch against its connector's window.
    async fn check_rate_limit(&self, connector_id: &str) -> Result<()> {
        let config = &self.ctx.config.intake;
        if config.rate_limit == 0 {
            return Ok(());
        }
        let count = self
            .ctx
            .buffer
            .increment(&rate_limit_key(connector_id), config.rate_limit_window())
            .await?;
        if count > config.rate_limit {
            warn!(
                connector_id,
                count,
                limit = config.rate_limit,
                "Connector over its batch rate limit"
            );
            return Err(StrataError::Unavailable(format!(
                "connector {connector_id} exceeded {} batches per {}s; retry later",
                config.rate_limit, config.rate_limit_window_secs
            )));
        }
        Ok(())
    }

    pub async fn batch_status(&self, batch_id: &str) -> Result<Option<BatchStatus>> {
        match self.ctx.buffer.get(&batch_status_key(batch_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Progress tracking never fails a batch.
    async fn store_status(&self, status: &BatchStatus) {
        let stored = match serde_json::to_string(status) {
            Ok(raw) => {
                self.ctx
                    .buffer
                    .put(&batch_status_key(&status.batch_id), raw, BATCH_STATUS_TTL)
                    .await
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = stored {
            warn!(batch_id = %status.batch_id, error = %e, "Could not record batch status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::testing::{manual_context, sample_chunk};

    fn batch(chunks: Vec<Chunk>) -> ChunkBatch {
        ChunkBatch {
            batch_id: "b1".into(),
            connector_id: "test-connector".into(),
            source_id: "src".into(),
            project_id: Some("p1".into()),
            chunks,
            batch_metadata: None,
        }
    }

    #[tokio::test]
    async fn test_per_chunk_results() {
        let (ctx, _) = manual_context(Config::default());
        let intake = Intake::new(ctx);
        intake
            .submit_batch(batch(vec![sample_chunk("a", "p1", "first")]))
            .await
            .unwrap();

        let receipt = intake
            .submit_batch(batch(vec![
                sample_chunk("a", "p1", "first"),
                sample_chunk("b", "p1", "second"),
                sample_chunk("a2", "p1", "x"),
                sample_chunk("a", "p1", "changed"),
            ]))
            .await
            .unwrap();

        assert!(matches!(receipt.results[0], ChunkAcceptance::Duplicate { .. }));
        assert!(matches!(receipt.results[1], ChunkAcceptance::Accepted { .. }));
        assert!(matches!(
            receipt.results[3],
            ChunkAcceptance::Rejected {
                retryable: false,
                ..
            }
        ));
        assert_eq!(receipt.status.state, BatchState::Completed);
        assert_eq!(receipt.status.processed_chunks, 4);
        assert_eq!(receipt.rejected().count(), 1);
    }

    #[tokio::test]
    async fn test_chunks_inherit_batch_project() {
        let (ctx, _) = manual_context(Config::default());
        let intake = Intake::new(ctx.clone());
        let receipt = intake
            .submit_batch(batch(vec![sample_chunk("a", "", "orphan")]))
            .await
            .unwrap();
        assert!(matches!(receipt.results[0], ChunkAcceptance::Accepted { .. }));
        let record = ctx.tables.get_chunk("a").await.unwrap().unwrap();
        assert_eq!(record.project_id(), "p1");
    }

    #[tokio::test]
    async fn test_status_is_readable_after_submit() {
        let (ctx, _) = manual_context(Config::default());
        let intake = Intake::new(ctx);
        intake
            .submit_batch(batch(vec![sample_chunk("a", "p1", "x")]))
            .await
            .unwrap();

        let status = intake.batch_status("b1").await.unwrap().unwrap();
        assert_eq!(status.state, BatchState::Completed);
        assert_eq!(status.accepted, 1);
        assert!(intake.batch_status("unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_blank_batch_id_rejected() {
        let (ctx, _) = manual_context(Config::default());
        let mut bad = batch(vec![]);
        bad.batch_id = " ".into();
        let err = Intake::new(ctx).submit_batch(bad).await.unwrap_err();
        assert!(matches!(err, StrataError::Validation(_)));
    }

    #[tokio::test]
    async fn test_connector_rate_limited_per_window() {
        let mut config = Config::default();
        config.intake.rate_limit = 2;
        let (ctx, clock) = manual_context(config);
        let intake = Intake::new(ctx);

        for id in ["a", "b"] {
            intake
                .submit_batch(batch(vec![sample_chunk(id, "p1", id)]))
                .await
                .unwrap();
        }
        let err = intake
            .submit_batch(batch(vec![sample_chunk("c", "p1", "c")]))
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::Unavailable(_)));
        assert!(err.is_retryable());

        let mut other = batch(vec![sample_chunk("d", "p1", "d")]);
        other.connector_id = "other-connector".into();
        assert!(intake.submit_batch(other).await.is_ok());

        clock.advance(chrono::Duration::seconds(60));
        let receipt = intake
            .submit_batch(batch(vec![sample_chunk("c", "p1", "c")]))
            .await
            .unwrap();
        assert!(matches!(receipt.results[0], ChunkAcceptance::Accepted { .. }));
    }

    #[tokio::test]
    async fn test_zero_rate_limit_disables_check() {
        let mut config = Config::default();
        config.intake.rate_limit = 0;
        let (ctx, _) = manual_context(config);
        let intake = Intake::new(ctx.clone());
        for i in 0..5 {
            let id = format!("c{i}");
            intake
                .submit_batch(batch(vec![sample_chunk(&id, "p1", &id)]))
                .await
                .unwrap();
        }
        assert!(ctx.buffer.get(&rate_limit_key("test-connector")).await.unwrap().is_none());
    }

    mod routing {
        use super::*;

        #[test]
        fn test_messages_parse_by_type() {
            let status = IntakeMessage::from_json(
                r#"{"type": "status", "chunkId": "c1", "status": "failed", "error": "timeout"}"#,
            )
            .unwrap();
            assert_eq!(
                status,
                IntakeMessage::Status {
                    chunk_id: "c1".into(),
                    status: StatusKind::Failed,
                    error: Some("timeout".into()),
                }
            );

            let scores = IntakeMessage::from_json(
                r#"{"type": "scores", "chunkId": "c1", "scores": {
                    "quality": 80, "credibility": 80, "usage": 80, "technicalAccuracy": 80,
                    "deprecation": 5, "incompleteness": 5, "contradiction": 5, "obsolescence": 5
                }}"#,
            )
            .unwrap();
            assert!(matches!(
                scores,
                IntakeMessage::Scores { ref chunk_id, .. } if chunk_id == "c1"
            ));

            let batch = IntakeMessage::from_json(
                r#"{"type": "batch", "batchId": "b1", "connectorId": "notion",
                    "sourceId": "ws", "chunks": []}"#,
            )
            .unwrap();
            assert!(matches!(batch, IntakeMessage::Batch(ref b) if b.batch_id == "b1"));

            assert!(IntakeMessage::from_json(r#"{"type": "shutdown"}"#).is_err());
        }

        #[tokio::test]
        async fn test_route_reaches_registry_ledger_and_tiers() {
            let (ctx, _) = manual_context(Config::default());
            let coordinator = TierCoordinator::new(ctx.clone());
            let intake = Intake::new(ctx);

            let reply = intake
                .route(
                    &coordinator,
                    IntakeMessage::Batch(batch(vec![sample_chunk("a", "p1", "x")])),
                )
                .await
                .unwrap();
            assert!(matches!(reply, IntakeReply::Batch(ref r) if r.status.accepted == 1));

            let reply = intake
                .route(
                    &coordinator,
                    IntakeMessage::Scores {
                        chunk_id: "a".into(),
                        scores: ScoreComponents::uniform(90, 0),
                    },
                )
                .await
                .unwrap();
            assert!(matches!(reply, IntakeReply::Scores(ref s) if s.confidence == 90));

            let reply = intake
                .route(
                    &coordinator,
                    IntakeMessage::Status {
                        chunk_id: "a".into(),
                        status: StatusKind::Completed,
                        error: None,
                    },
                )
                .await
                .unwrap();
            assert!(matches!(
                reply,
                IntakeReply::Status(ref s) if s.status == StatusKind::Completed
            ));
            assert_eq!(
                coordinator.tier_of("a").await.unwrap(),
                Some(crate::tiers::MemoryTier::Semantic)
            );

            let err = intake
                .route(
                    &coordinator,
                    IntakeMessage::Status {
                        chunk_id: "ghost".into(),
                        status: StatusKind::Processing,
                        error: None,
                    },
                )
                .await
                .unwrap_err();
            assert!(matches!(err, StrataError::NotFound(_)));
        }

        #[test]
        fn test_reply_is_tagged() {
            let reply = IntakeReply::Status(ProcessingStatus::new("c1", chrono::Utc::now()));
            let json = serde_json::to_value(&reply).unwrap();
            assert_eq!(json["type"], "status");
        }
    }

    #[test]
    fn test_batch_parses_camel_case_json() {
        let json = r#"{
            "batchId": "b1",
            "connectorId": "notion",
            "sourceId": "workspace",
            "projectId": "p1",
            "chunks": [{
                "id": "c1",
                "connectorId": "notion",
                "content": "hello",
                "contentType": "text",
                "source": {"type": "page", "id": "page-1"}
            }],
            "batchMetadata": {"totalChunks": 1, "isComplete": true}
        }"#;
        let batch = ChunkBatch::from_json(json).unwrap();
        assert_eq!(batch.chunks.len(), 1);
        assert_eq!(batch.chunks[0].project_id, "");
        assert_eq!(batch.batch_metadata.unwrap().total_chunks, Some(1));
    }
}
