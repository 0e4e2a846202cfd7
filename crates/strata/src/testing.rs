//! Test utilities for strata - controllable clock and chunk fixtures
//!
//! Public so integration tests and downstream crates can drive the lifecycle
//! deterministically.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::chunk::{Chunk, ChunkSource, ContentType, Position};
use crate::config::Config;
use crate::context::{Clock, StrataContext};

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Default for ManualClock {
    /// Starts at a fixed instant so test output is reproducible.
    fn default() -> Self {
        let start = Utc
            .with_ymd_and_hms(2024, 1, 1, 12, 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        Self::new(start)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// In-memory context driven by a fresh [`ManualClock`].
pub fn manual_context(config: Config) -> (Arc<StrataContext>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let ctx = StrataContext::builder(config)
        .with_clock(clock.clone())
        .build();
    (ctx, clock)
}

/// Minimal valid text chunk.
pub fn sample_chunk(id: &str, project_id: &str, content: &str) -> Chunk {
    let mut chunk = Chunk::new(
        id,
        "test-connector",
        project_id,
        content,
        ContentType::Text,
        ChunkSource::new("test", format!("doc-{id}")),
    );
    chunk.processed_at = ManualClock::default().now();
    chunk
}

/// Chunk of a given content type.
pub fn typed_chunk(id: &str, project_id: &str, content: &str, content_type: ContentType) -> Chunk {
    let mut chunk = sample_chunk(id, project_id, content);
    chunk.content_type = content_type;
    chunk
}

/// Chunk with sibling links and an order inside `document_id`.
pub fn positioned_chunk(
    id: &str,
    project_id: &str,
    document_id: &str,
    previous: Option<&str>,
    next: Option<&str>,
    order: i64,
) -> Chunk {
    let mut chunk = sample_chunk(id, project_id, &format!("section {order} of {document_id}"));
    chunk.position = Some(Position {
        document_id: Some(document_id.to_string()),
        path: vec![document_id.to_string()],
        previous_chunk_id: previous.map(str::to_string),
        next_chunk_id: next.map(str::to_string),
        order: Some(order),
    });
    chunk
}

/// Deterministic unit-ish vector derived from `seed`.
pub fn seeded_vector(seed: u64, dimensions: usize) -> Vec<f32> {
    (0..dimensions)
        .map(|i| {
            let x = seed
                .wrapping_mul(i as u64 + 1)
                .wrapping_add(0x9e37_79b9_7f4a_7c15);
            ((x >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_only_moves_when_told() {
        let clock = ManualClock::default();
        let start = clock.now();
        assert_eq!(clock.now(), start);
        clock.advance(Duration::minutes(5));
        assert_eq!(clock.now(), start + Duration::minutes(5));
    }

    #[test]
    fn fixtures_are_valid() {
        assert!(sample_chunk("c1", "p1", "x").validate().is_ok());
        assert!(
            positioned_chunk("c2", "p1", "doc", Some("c1"), Some("c3"), 2)
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn seeded_vector_is_deterministic_and_bounded() {
        let a = seeded_vector(7, 16);
        assert_eq!(a, seeded_vector(7, 16));
        assert_ne!(a, seeded_vector(8, 16));
        assert!(a.iter().all(|v| (-1.0..=1.0).contains(v)));
    }
}
