//! Integration tests for the chunk lifecycle
//!
//! Drives registration, scoring, status transitions and consolidation sweeps
//! end to end against the in-memory adapters with a manual clock.

use std::sync::Arc;

use chrono::Duration;
use strata::chunk::{ContentType, StatusKind};
use strata::config::Config;
use strata::context::Clock;
use strata::graph::{Direction, EdgeProperties, RelationshipType};
use strata::intake::{BatchState, ChunkAcceptance, ChunkBatch, Intake};
use strata::scoring::ScoreComponents;
use strata::stats::StatsSnapshot;
use strata::testing::{ManualClock, manual_context, positioned_chunk, sample_chunk, typed_chunk};
use strata::tiers::{EvictionReason, MemoryTier, TierCoordinator, TransferKind};
use strata::StrataError;

/// Test fixture: coordinator over fresh in-memory stores
fn create_coordinator() -> (TierCoordinator, Arc<ManualClock>) {
    let (ctx, clock) = manual_context(Config::default());
    (TierCoordinator::new(ctx), clock)
}

mod scenario_tests {
    use super::*;

    #[tokio::test]
    async fn test_confident_completed_chunk_is_consolidated() {
        let (coordinator, clock) = create_coordinator();
        coordinator
            .register_chunk(sample_chunk("C1", "p1", "the mitochondria is the powerhouse"))
            .await
            .unwrap();
        assert_eq!(
            coordinator.tier_of("C1").await.unwrap(),
            Some(MemoryTier::Buffer)
        );

        let update = coordinator
            .ledger()
            .upsert_scores("C1", ScoreComponents::uniform(90, 0))
            .await
            .unwrap();
        assert!(update.scores.confidence >= 70);

        coordinator
            .registry()
            .set_status("C1", StatusKind::Completed, None)
            .await
            .unwrap();
        let pending = coordinator
            .registry()
            .list_pending(10, clock.now())
            .await
            .unwrap();
        assert!(pending.is_empty());

        let report = coordinator.sweep().await.unwrap();
        assert_eq!(report.promoted, 1);
        assert_eq!(
            coordinator.tier_of("C1").await.unwrap(),
            Some(MemoryTier::Semantic)
        );
        assert!(
            coordinator
                .registry()
                .list_pending(10, clock.now())
                .await
                .unwrap()
                .iter()
                .all(|r| r.id() != "C1")
        );
    }

    #[tokio::test]
    async fn test_failure_backoff_until_terminal() {
        let (coordinator, clock) = create_coordinator();
        coordinator
            .register_chunk(sample_chunk("C2", "p1", "unparseable"))
            .await
            .unwrap();

        let first_failure = clock.now();
        let status = coordinator
            .set_status("C2", StatusKind::Failed, Some("parse error".into()))
            .await
            .unwrap();
        assert_eq!(status.retry_count, 1);
        assert_eq!(status.next_attempt, Some(first_failure + Duration::minutes(5)));

        clock.advance(Duration::minutes(5));
        let report = coordinator.sweep().await.unwrap();
        assert_eq!(report.requeued, 1);

        let second_failure = clock.now();
        let status = coordinator
            .set_status("C2", StatusKind::Failed, Some("parse error".into()))
            .await
            .unwrap();
        assert_eq!(status.retry_count, 2);
        assert_eq!(
            status.next_attempt,
            Some(second_failure + Duration::minutes(10))
        );

        clock.advance(Duration::minutes(10));
        coordinator.sweep().await.unwrap();
        let status = coordinator
            .set_status("C2", StatusKind::Failed, Some("parse error".into()))
            .await
            .unwrap();
        assert_eq!(status.retry_count, 3);
        assert_eq!(status.next_attempt, None);
        assert_eq!(status.status, StatusKind::Failed);

        clock.advance(Duration::hours(24));
        let report = coordinator.sweep().await.unwrap();
        assert_eq!(report.requeued, 0);
        let stored = coordinator
            .registry()
            .get_status("C2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, StatusKind::Failed);
        assert_eq!(
            coordinator.tier_of("C2").await.unwrap(),
            Some(MemoryTier::FailedTerminal)
        );

        let failed = coordinator.registry().list_failed(10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].status.error.as_deref(), Some("parse error"));
    }

    #[tokio::test]
    async fn test_untouched_buffer_chunk_expires() {
        let (coordinator, clock) = create_coordinator();
        coordinator
            .register_chunk(sample_chunk("C3", "p1", "never scored"))
            .await
            .unwrap();

        clock.advance(Duration::minutes(59));
        let report = coordinator.sweep().await.unwrap();
        assert_eq!(report.evicted, 0);

        clock.advance(Duration::minutes(1));
        let report = coordinator.sweep().await.unwrap();
        assert_eq!(report.evicted, 1);
        assert!(coordinator.tier_of("C3").await.unwrap().is_none());
        assert!(
            coordinator
                .registry()
                .get_status("C3")
                .await
                .unwrap()
                .is_none()
        );

        let log = coordinator.transfer_log("C3").await.unwrap();
        assert_eq!(
            log.last().unwrap().kind,
            TransferKind::Evicted {
                reason: EvictionReason::TtlExpired
            }
        );
    }
}

mod registration_tests {
    use super::*;

    #[tokio::test]
    async fn test_registering_twice_stores_same_state() {
        let (coordinator, _) = create_coordinator();
        let chunk = sample_chunk("a", "p1", "same");
        let first = coordinator.register_chunk(chunk.clone()).await.unwrap();
        let second = coordinator.register_chunk(chunk).await.unwrap();
        assert_eq!(first.record(), second.record());

        let stats = StatsSnapshot::collect(coordinator.context()).await.unwrap();
        assert_eq!(stats.total_chunks, 1);
    }

    #[tokio::test]
    async fn test_content_change_is_conflict() {
        let (coordinator, _) = create_coordinator();
        coordinator
            .register_chunk(sample_chunk("a", "p1", "v1"))
            .await
            .unwrap();
        let err = coordinator
            .register_chunk(sample_chunk("a", "p1", "v2"))
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::Conflict(_)));
    }
}

mod scoring_tests {
    use super::*;

    #[tokio::test]
    async fn test_stored_aggregate_matches_recomputation() {
        let (coordinator, _) = create_coordinator();
        coordinator
            .register_chunk(sample_chunk("a", "p1", "x"))
            .await
            .unwrap();

        let components = ScoreComponents {
            quality: 80,
            credibility: 60,
            usage: 40,
            technical_accuracy: 95,
            deprecation: 10,
            incompleteness: 20,
            contradiction: 0,
            obsolescence: 33,
        };
        coordinator.upsert_scores("a", components).await.unwrap();

        let stored = coordinator.ledger().get_scores("a").await.unwrap().unwrap();
        let weights = &coordinator.context().config.scoring.weights;
        assert_eq!(stored.recompute(weights), (stored.confidence, stored.doubt));
        assert_eq!(stored.confidence, 69);
        assert_eq!(stored.doubt, 16);
    }

    #[tokio::test]
    async fn test_doubt_crossing_is_flagged_without_tier_change() {
        let (coordinator, _) = create_coordinator();
        coordinator
            .register_chunk(sample_chunk("a", "p1", "x"))
            .await
            .unwrap();
        coordinator
            .upsert_scores("a", ScoreComponents::uniform(50, 45))
            .await
            .unwrap();

        assert_eq!(
            coordinator.tier_of("a").await.unwrap(),
            Some(MemoryTier::Buffer)
        );
        let log = coordinator.transfer_log("a").await.unwrap();
        assert!(
            log.iter()
                .any(|t| t.kind == TransferKind::Flagged { doubt: 45 })
        );
    }
}

mod graph_tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_twice_keeps_one_edge() {
        let (coordinator, clock) = create_coordinator();
        for id in ["a", "b"] {
            coordinator
                .register_chunk(sample_chunk(id, "p1", id))
                .await
                .unwrap();
        }

        let first = coordinator
            .graph()
            .connect("a", "b", RelationshipType::RelatedTo, EdgeProperties::default())
            .await
            .unwrap();
        clock.advance(Duration::seconds(30));
        let second = coordinator
            .graph()
            .connect("a", "b", RelationshipType::RelatedTo, EdgeProperties::default())
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert!(second.modified > first.modified);
        assert_eq!(
            coordinator.context().graph.edge_count().await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_siblings_linked_on_promotion() {
        let (coordinator, _) = create_coordinator();
        coordinator
            .register_chunk(positioned_chunk("s1", "p1", "doc", None, Some("s2"), 1))
            .await
            .unwrap();
        coordinator
            .register_chunk(positioned_chunk("s2", "p1", "doc", Some("s1"), None, 2))
            .await
            .unwrap();

        coordinator
            .upsert_scores("s2", ScoreComponents::uniform(90, 0))
            .await
            .unwrap();
        coordinator
            .set_status("s2", StatusKind::Completed, None)
            .await
            .unwrap();

        let graph = coordinator.graph();
        assert_eq!(
            graph
                .neighbors("s1", &[RelationshipType::Precedes], 10)
                .await
                .unwrap(),
            vec!["s2"]
        );
        assert!(
            graph
                .neighbors("s2", &[RelationshipType::Precedes], 10)
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(
            graph
                .neighbors_in("s2", &[RelationshipType::Precedes], Direction::Incoming, 10)
                .await
                .unwrap(),
            vec!["s1"]
        );
    }

    #[tokio::test]
    async fn test_find_similar_stays_in_project() {
        let (coordinator, _) = create_coordinator();
        for (id, project) in [("a", "p1"), ("b", "p2")] {
            coordinator
                .register_chunk(sample_chunk(id, project, "rust ownership rules"))
                .await
                .unwrap();
            coordinator
                .upsert_scores(id, ScoreComponents::uniform(90, 0))
                .await
                .unwrap();
            coordinator
                .set_status(id, StatusKind::Completed, None)
                .await
                .unwrap();
        }

        let similar = coordinator
            .graph()
            .find_similar("p1", "ownership in rust", None, 10)
            .await
            .unwrap();
        assert_eq!(similar.len(), 1);
        assert!(similar.iter().all(|s| s.project_id == "p1"));
    }
}

mod operator_tests {
    use super::*;

    #[tokio::test]
    async fn test_reingest_quarantined_chunk() {
        let (coordinator, clock) = create_coordinator();
        coordinator
            .register_chunk(sample_chunk("a", "p1", "x"))
            .await
            .unwrap();
        for _ in 0..2 {
            coordinator
                .set_status("a", StatusKind::Failed, None)
                .await
                .unwrap();
            clock.advance(Duration::minutes(30));
            coordinator.sweep().await.unwrap();
        }
        coordinator
            .set_status("a", StatusKind::Failed, None)
            .await
            .unwrap();
        assert_eq!(
            coordinator.tier_of("a").await.unwrap(),
            Some(MemoryTier::FailedTerminal)
        );

        let status = coordinator.reingest("a").await.unwrap();
        assert_eq!(status.status, StatusKind::Pending);
        assert_eq!(status.retry_count, 3);
        assert_eq!(
            coordinator.tier_of("a").await.unwrap(),
            Some(MemoryTier::Working)
        );

        coordinator
            .upsert_scores("a", ScoreComponents::uniform(80, 0))
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
    }

    #[tokio::test]
    async fn test_manual_projection_and_eviction() {
        let (coordinator, _) = create_coordinator();
        coordinator
            .register_chunk(typed_chunk("a", "p1", "standup notes", ContentType::Text))
            .await
            .unwrap();
        coordinator
            .upsert_scores("a", ScoreComponents::uniform(75, 0))
            .await
            .unwrap();
        coordinator
            .set_status("a", StatusKind::Completed, None)
            .await
            .unwrap();

        coordinator.project("a", MemoryTier::Episodic).await.unwrap();
        let record = coordinator.registry().get_chunk("a").await.unwrap().unwrap();
        assert_eq!(record.tier, MemoryTier::Semantic);
        assert!(record.projections.contains(&MemoryTier::Episodic));

        assert!(coordinator.evict("a", EvictionReason::Manual).await.unwrap());
        let documents = &coordinator.context().documents;
        assert_eq!(documents.count(MemoryTier::Semantic).await.unwrap(), 0);
        assert_eq!(documents.count(MemoryTier::Episodic).await.unwrap(), 0);
        assert!(!coordinator.evict("a", EvictionReason::Manual).await.unwrap());
    }
}

mod intake_tests {
    use super::*;

    #[tokio::test]
    async fn test_batch_feeds_the_lifecycle() {
        let (ctx, _) = manual_context(Config::default());
        let coordinator = TierCoordinator::new(ctx.clone());
        let intake = Intake::new(ctx);

        let mut invalid = sample_chunk("bad", "p1", "x");
        invalid.source.id = String::new();
        let batch = ChunkBatch {
            batch_id: "batch-1".into(),
            connector_id: "test-connector".into(),
            source_id: "src".into(),
            project_id: None,
            chunks: vec![sample_chunk("good", "p1", "fine"), invalid],
            batch_metadata: None,
        };
        let receipt = intake.submit_batch(batch).await.unwrap();
        assert_eq!(
            receipt.results[0],
            ChunkAcceptance::Accepted {
                chunk_id: "good".into()
            }
        );
        assert!(matches!(
            &receipt.results[1],
            ChunkAcceptance::Rejected { retryable: false, error, .. } if error.contains("source.id")
        ));
        assert_eq!(receipt.status.state, BatchState::Completed);

        coordinator
            .upsert_scores("good", ScoreComponents::uniform(90, 0))
            .await
            .unwrap();
        coordinator
            .set_status("good", StatusKind::Completed, None)
            .await
            .unwrap();
        assert_eq!(
            coordinator.tier_of("good").await.unwrap(),
            Some(MemoryTier::Semantic)
        );
    }
}
