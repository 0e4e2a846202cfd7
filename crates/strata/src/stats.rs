//! Aggregate statistics across the stores

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use serde::Serialize;

use crate::chunk::StatusKind;
use crate::context::StrataContext;
use crate::error::Result;
use crate::storage::{ChunkQuery, StatusQuery};
use crate::tiers::{HealthStatus, LAST_SWEEP_KEY, MemoryTier};

/// Scores 0-9 land in bucket 0, ..., 90-100 in bucket 9.
fn bucket(score: u8) -> usize {
    usize::from(score / 10).min(9)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub total_chunks: usize,
    pub by_tier: BTreeMap<MemoryTier, usize>,
    pub by_status: BTreeMap<StatusKind, usize>,
    pub scored_chunks: usize,
    pub confidence_buckets: [usize; 10],
    pub doubt_buckets: [usize; 10],
    pub edge_count: usize,
    pub vector_count: usize,
    pub pending_intents: usize,
    pub last_sweep: Option<DateTime<Utc>>,
    /// `None` when no consolidation loop reported recently
    pub health: Option<HealthStatus>,
    pub collected_at: DateTime<Utc>,
}

impl StatsSnapshot {
    pub async fn collect(ctx: &StrataContext) -> Result<Self> {
        let mut by_tier: BTreeMap<MemoryTier, usize> =
            MemoryTier::ALL.into_iter().map(|t| (t, 0)).collect();
        let chunks = ctx.tables.scan_chunks(&ChunkQuery::new()).await?;
        for record in &chunks {
            *by_tier.entry(record.tier).or_default() += 1;
        }

        let mut by_status: BTreeMap<StatusKind, usize> =
            StatusKind::ALL.into_iter().map(|s| (s, 0)).collect();
        for status in ctx.tables.scan_status(&StatusQuery::new()).await? {
            *by_status.entry(status.status).or_default() += 1;
        }

        let scores = ctx.tables.scan_scores().await?;
        let mut confidence_buckets = [0; 10];
        let mut doubt_buckets = [0; 10];
        for set in &scores {
            confidence_buckets[bucket(set.confidence)] += 1;
            doubt_buckets[bucket(set.doubt)] += 1;
        }

        let last_sweep = ctx
            .buffer
            .get(LAST_SWEEP_KEY)
            .await?
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|at| at.with_timezone(&Utc));

        Ok(Self {
            total_chunks: chunks.len(),
            by_tier,
            by_status,
            scored_chunks: scores.len(),
            confidence_buckets,
            doubt_buckets,
            edge_count: ctx.graph.edge_count().await?,
            vector_count: ctx.vectors.count().await?,
            pending_intents: ctx.tables.list_intents().await?.len(),
            last_sweep,
            health: HealthStatus::read(ctx).await?,
            collected_at: ctx.now(),
        })
    }

    pub fn render_table(&self) -> String {
        let mut tiers = Table::new();
        tiers
            .load_preset(UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(["Tier", "Chunks"]);
        for (tier, count) in &self.by_tier {
            tiers.add_row([tier.as_str(), &count.to_string()]);
        }

        let mut statuses = Table::new();
        statuses
            .load_preset(UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(["Status", "Chunks"]);
        for (status, count) in &self.by_status {
            statuses.add_row([status.as_str(), &count.to_string()]);
        }

        let mut scores = Table::new();
        scores
            .load_preset(UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(["Range", "Confidence", "Doubt"]);
        for i in 0..10 {
            let upper = if i == 9 { 100 } else { i * 10 + 9 };
            scores.add_row([
                format!("{}-{upper}", i * 10),
                self.confidence_buckets[i].to_string(),
                self.doubt_buckets[i].to_string(),
            ]);
        }

        let last_sweep = self
            .last_sweep
            .map_or_else(|| "never".to_string(), |at| at.to_rfc3339());
        let health = self.health.map_or("unknown", |h| h.as_str());
        format!(
            "{tiers}\n\n{statuses}\n\n{scores}\n\nTotal: {} chunks, {} scored, {} edges, {} vectors, {} pending transfers\nLast sweep: {last_sweep}\nLoop health: {health}",
            self.total_chunks,
            self.scored_chunks,
            self.edge_count,
            self.vector_count,
            self.pending_intents,
        )
    }
}
