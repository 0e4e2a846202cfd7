//! Concurrency and store-failure tests
//!
//! Racing writers, overlapping sweeps, exhausted pools, a document store
//! that fails on demand and stores that pause mid-call.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Duration;
use strata::chunk::StatusKind;
use strata::config::Config;
use strata::context::{Clock, StrataContext};
use strata::scoring::ScoreComponents;
use strata::storage::{
    BufferStore, DocumentMatch, DocumentStore, MemoryBufferStore, MemoryDocumentStore,
    MemoryTableStore, MemoryVectorIndex, PoolConfig, ResourcePool, StoredDocument, TextQuery,
    VectorEntry, VectorIndex, VectorMatch,
};
use strata::testing::{ManualClock, manual_context, sample_chunk, seeded_vector};
use strata::tiers::{EvictionReason, MemoryTier, TierCoordinator, TransferKind, TransferOutcome};
use strata::{Result, StrataError};
use tokio::sync::Notify;

const GATE_TIMEOUT: StdDuration = StdDuration::from_secs(5);

/// One-shot pause point: the gated call signals `entered`, then waits for
/// `release`.
#[derive(Default)]
struct Gate {
    entered: Notify,
    release: Notify,
}

impl Gate {
    async fn pass(&self) {
        self.entered.notify_one();
        self.release.notified().await;
    }

    async fn wait_entered(&self) {
        tokio::time::timeout(GATE_TIMEOUT, self.entered.notified())
            .await
            .expect("gated call was never reached");
    }

    fn open(&self) {
        self.release.notify_one();
    }
}

/// Vector index whose deletes pause at a gate
struct GatedVectorIndex {
    inner: MemoryVectorIndex,
    gate: Gate,
}

#[async_trait]
impl VectorIndex for GatedVectorIndex {
    async fn upsert(&self, entry: &VectorEntry) -> Result<()> {
        self.inner.upsert(entry).await
    }

    async fn get(&self, chunk_id: &str) -> Result<Option<VectorEntry>> {
        self.inner.get(chunk_id).await
    }

    async fn delete(&self, chunk_id: &str) -> Result<bool> {
        self.gate.pass().await;
        self.inner.delete(chunk_id).await
    }

    async fn nearest(
        &self,
        project_id: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<VectorMatch>> {
        self.inner.nearest(project_id, vector, limit).await
    }

    async fn count(&self) -> Result<usize> {
        self.inner.count().await
    }
}

/// Buffer store whose writes of raw chunk copies pause at a gate
struct GatedBufferStore {
    inner: MemoryBufferStore,
    gate: Gate,
}

#[async_trait]
impl BufferStore for GatedBufferStore {
    async fn put(&self, key: &str, value: String, ttl: StdDuration) -> Result<()> {
        if key.starts_with("raw:") {
            self.gate.pass().await;
        }
        self.inner.put(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.inner.delete(key).await
    }

    async fn increment(&self, key: &str, ttl: StdDuration) -> Result<u64> {
        self.inner.increment(key, ttl).await
    }

    async fn purge_expired(&self) -> Result<usize> {
        self.inner.purge_expired().await
    }
}

/// Document store whose writes fail while `broken` is set
struct FlakyDocumentStore {
    inner: MemoryDocumentStore,
    broken: AtomicBool,
}

impl FlakyDocumentStore {
    fn new() -> Self {
        Self {
            inner: MemoryDocumentStore::new(ResourcePool::new("documents", PoolConfig::default())),
            broken: AtomicBool::new(true),
        }
    }

    fn heal(&self) {
        self.broken.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl DocumentStore for FlakyDocumentStore {
    async fn put(&self, document: &StoredDocument) -> Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(StrataError::Unavailable("document store offline".into()));
        }
        self.inner.put(document).await
    }

    async fn get(
        &self,
        collection: MemoryTier,
        chunk_id: &str,
    ) -> Result<Option<StoredDocument>> {
        self.inner.get(collection, chunk_id).await
    }

    async fn delete(&self, collection: MemoryTier, chunk_id: &str) -> Result<bool> {
        self.inner.delete(collection, chunk_id).await
    }

    async fn search_text(&self, query: &TextQuery) -> Result<Vec<DocumentMatch>> {
        self.inner.search_text(query).await
    }

    async fn count(&self, collection: MemoryTier) -> Result<usize> {
        self.inner.count(collection).await
    }
}

async fn scored_and_completed(coordinator: &TierCoordinator, ids: &[String]) {
    for id in ids {
        coordinator
            .register_chunk(sample_chunk(id, "p1", &format!("content of {id}")))
            .await
            .unwrap();
        coordinator
            .ledger()
            .upsert_scores(id, ScoreComponents::uniform(90, 0))
            .await
            .unwrap();
        coordinator
            .registry()
            .set_status(id, StatusKind::Completed, None)
            .await
            .unwrap();
    }
}

mod race_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_status_updates_have_one_winner() {
        let (ctx, _) = manual_context(Config::default());
        let coordinator = Arc::new(TierCoordinator::new(ctx));
        coordinator
            .register_chunk(sample_chunk("a", "p1", "x"))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coordinator = Arc::clone(&coordinator);
            handles.push(tokio::spawn(async move {
                coordinator
                    .set_status("a", StatusKind::Processing, None)
                    .await
            }));
        }

        let mut won = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(status) => {
                    assert_eq!(status.status, StatusKind::Processing);
                    won += 1;
                }
                Err(StrataError::InvalidTransition { .. }) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(won, 1);

        let status = coordinator.registry().get_status("a").await.unwrap().unwrap();
        assert_eq!(status.version, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_overlapping_sweeps_promote_each_chunk_once() {
        let (ctx, _) = manual_context(Config::default());
        let coordinator = Arc::new(TierCoordinator::new(ctx));
        let ids: Vec<String> = (0..20).map(|i| format!("c{i:02}")).collect();
        scored_and_completed(&coordinator, &ids).await;

        let mut handles = Vec::new();
        for _ in 0..4 {
            let coordinator = Arc::clone(&coordinator);
            handles.push(tokio::spawn(async move { coordinator.sweep().await }));
        }
        let mut promoted = 0;
        for handle in handles {
            promoted += handle.await.unwrap().unwrap().promoted;
        }
        assert_eq!(promoted, 20);

        for id in &ids {
            assert_eq!(
                coordinator.tier_of(id).await.unwrap(),
                Some(MemoryTier::Semantic)
            );
            let promotions = coordinator
                .transfer_log(id)
                .await
                .unwrap()
                .into_iter()
                .filter(|t| t.kind == TransferKind::Promoted)
                .count();
            assert_eq!(promotions, 1, "chunk {id} promoted {promotions} times");
        }
        assert_eq!(
            coordinator
                .context()
                .documents
                .count(MemoryTier::Semantic)
                .await
                .unwrap(),
            20
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_registration_of_same_chunk() {
        let (ctx, _) = manual_context(Config::default());
        let coordinator = Arc::new(TierCoordinator::new(ctx));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coordinator = Arc::clone(&coordinator);
            handles.push(tokio::spawn(async move {
                coordinator
                    .register_chunk(sample_chunk("dup", "p1", "same content"))
                    .await
            }));
        }
        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().is_new() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
    }
}

mod gated_store_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_admission_during_ttl_eviction_keeps_data_consistent() {
        let config = Config::default();
        let dimensions = config.storage.embedding_dimensions;
        let clock = Arc::new(ManualClock::default());
        let vectors = Arc::new(GatedVectorIndex {
            inner: MemoryVectorIndex::new(
                ResourcePool::new("vectors", PoolConfig::default()),
                dimensions,
            ),
            gate: Gate::default(),
        });
        let ctx = StrataContext::builder(config)
            .with_clock(clock.clone())
            .with_vectors(vectors.clone())
            .build();
        let coordinator = Arc::new(TierCoordinator::new(ctx));

        coordinator
            .register_chunk(sample_chunk("a", "p1", "about to expire"))
            .await
            .unwrap();
        coordinator
            .attach_embedding("a", seeded_vector(1, dimensions))
            .await
            .unwrap();
        clock.advance(Duration::seconds(3600));

        let sweep = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.sweep().await })
        };
        vectors.gate.wait_entered().await;

        // the sweep is paused inside eviction cleanup
        let admitted = coordinator
            .set_status("a", StatusKind::Processing, None)
            .await;
        vectors.gate.open();
        let report = sweep.await.unwrap().unwrap();

        match coordinator.tier_of("a").await.unwrap() {
            Some(tier) => {
                assert!(admitted.is_ok());
                assert_eq!(tier, MemoryTier::Working);
                assert!(vectors.get("a").await.unwrap().is_some());
                assert_eq!(report.evicted, 0);
            }
            None => {
                assert!(matches!(admitted, Err(StrataError::NotFound(_))));
                assert!(vectors.get("a").await.unwrap().is_none());
                assert_eq!(report.evicted, 1);
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_raw_copy_write_does_not_hold_chunk_lock() {
        let clock = Arc::new(ManualClock::default());
        let buffer = Arc::new(GatedBufferStore {
            inner: MemoryBufferStore::new(
                ResourcePool::new("buffer", PoolConfig::default()),
                clock.clone(),
            ),
            gate: Gate::default(),
        });
        let ctx = StrataContext::builder(Config::default())
            .with_clock(clock)
            .with_buffer(buffer.clone())
            .build();
        let coordinator = Arc::new(TierCoordinator::new(ctx));

        let registration = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .register_chunk(sample_chunk("a", "p1", "slow buffer"))
                    .await
            })
        };
        buffer.gate.wait_entered().await;

        // the raw copy write is paused; writers of the same chunk proceed
        let status = tokio::time::timeout(
            GATE_TIMEOUT,
            coordinator.set_status("a", StatusKind::Processing, None),
        )
        .await
        .expect("status update waited on the raw copy write")
        .unwrap();
        assert_eq!(status.status, StatusKind::Processing);

        buffer.gate.open();
        assert!(registration.await.unwrap().unwrap().is_new());
        assert!(buffer.get("raw:a").await.unwrap().is_some());
        assert_eq!(
            coordinator.tier_of("a").await.unwrap(),
            Some(MemoryTier::Working)
        );
    }

    #[tokio::test]
    async fn test_manual_eviction_removes_row_before_copies() {
        let config = Config::default();
        let dimensions = config.storage.embedding_dimensions;
        let vectors = Arc::new(GatedVectorIndex {
            inner: MemoryVectorIndex::new(
                ResourcePool::new("vectors", PoolConfig::default()),
                dimensions,
            ),
            gate: Gate::default(),
        });
        let ctx = StrataContext::builder(config)
            .with_clock(Arc::new(ManualClock::default()))
            .with_vectors(vectors.clone())
            .build();
        let coordinator = Arc::new(TierCoordinator::new(ctx));
        coordinator
            .register_chunk(sample_chunk("a", "p1", "long-term"))
            .await
            .unwrap();
        coordinator
            .attach_embedding("a", seeded_vector(2, dimensions))
            .await
            .unwrap();
        coordinator
            .upsert_scores("a", ScoreComponents::uniform(90, 0))
            .await
            .unwrap();
        coordinator
            .set_status("a", StatusKind::Completed, None)
            .await
            .unwrap();

        let eviction = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.evict("a", EvictionReason::Manual).await })
        };
        vectors.gate.wait_entered().await;

        // row already gone while the vector is still being deleted
        assert!(coordinator.tier_of("a").await.unwrap().is_none());
        let nearest = coordinator
            .find_nearest("p1", &seeded_vector(2, dimensions), 5)
            .await
            .unwrap();
        assert!(nearest.is_empty());

        vectors.gate.open();
        assert!(eviction.await.unwrap().unwrap());
        assert!(vectors.get("a").await.unwrap().is_none());
    }
}

mod store_failure_tests {
    use super::*;

    #[tokio::test]
    async fn test_exhausted_pool_surfaces_as_retryable() {
        let pool = ResourcePool::new(
            "tables",
            PoolConfig {
                max_size: 1,
                acquire_timeout: StdDuration::from_millis(20),
                operation_timeout: StdDuration::from_secs(1),
            },
        );
        let ctx = StrataContext::builder(Config::default())
            .with_clock(Arc::new(ManualClock::default()))
            .with_tables(Arc::new(MemoryTableStore::new(pool.clone())))
            .build();
        let coordinator = TierCoordinator::new(ctx);

        let held = pool.acquire().await.unwrap();
        let err = coordinator
            .register_chunk(sample_chunk("a", "p1", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::Unavailable(_)));
        assert!(err.is_retryable());

        drop(held);
        assert!(
            coordinator
                .register_chunk(sample_chunk("a", "p1", "x"))
                .await
                .unwrap()
                .is_new()
        );
    }

    #[tokio::test]
    async fn test_failed_promotion_is_deferred_then_retried() {
        let clock = Arc::new(ManualClock::default());
        let documents = Arc::new(FlakyDocumentStore::new());
        let ctx = StrataContext::builder(Config::default())
            .with_clock(clock.clone())
            .with_documents(documents.clone())
            .build();
        let coordinator = TierCoordinator::new(ctx);

        coordinator
            .register_chunk(sample_chunk("a", "p1", "x"))
            .await
            .unwrap();
        coordinator
            .upsert_scores("a", ScoreComponents::uniform(90, 0))
            .await
            .unwrap();
        coordinator.registry().set_status("a", StatusKind::Completed, None).await.unwrap();
        coordinator.admit("a").await.unwrap();

        let failed_at = clock.now();
        let outcome = coordinator.promote("a").await.unwrap();
        assert!(matches!(outcome, TransferOutcome::Deferred { .. }));

        let status = coordinator.registry().get_status("a").await.unwrap().unwrap();
        assert_eq!(status.status, StatusKind::Failed);
        assert_eq!(status.retry_count, 1);
        assert_eq!(status.next_attempt, Some(failed_at + Duration::minutes(5)));
        assert_eq!(
            coordinator.tier_of("a").await.unwrap(),
            Some(MemoryTier::Working)
        );
        assert!(
            coordinator
                .transfer_log("a")
                .await
                .unwrap()
                .iter()
                .any(|t| t.kind == TransferKind::Deferred)
        );
        assert!(
            coordinator
                .context()
                .tables
                .list_intents()
                .await
                .unwrap()
                .is_empty()
        );

        documents.heal();
        clock.advance(Duration::minutes(5));
        let report = coordinator.sweep().await.unwrap();
        assert_eq!(report.requeued, 1);

        coordinator
            .set_status("a", StatusKind::Processing, None)
            .await
            .unwrap();
        coordinator
            .set_status("a", StatusKind::Completed, None)
            .await
            .unwrap();
        assert_eq!(
            coordinator.tier_of("a").await.unwrap(),
            Some(MemoryTier::Semantic)
        );
        assert!(
            coordinator
                .context()
                .documents
                .get(MemoryTier::Semantic, "a")
                .await
                .unwrap()
                .is_some()
        );
    }
}
