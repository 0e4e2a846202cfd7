use crate::chunk::{ChunkRecord, ContentType, ProcessingStatus, StatusKind};
use crate::config::Config;
use crate::scoring::ScoreSet;
use crate::tiers::MemoryTier;

/// Promotion and projection rules, derived from configuration
#[derive(Debug, Clone, PartialEq)]
pub struct PromotionPolicy {
    pub confidence_threshold: u8,
    pub doubt_threshold: u8,
    pub procedural_types: Vec<ContentType>,
    pub episodic_types: Vec<ContentType>,
}

impl Default for PromotionPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl PromotionPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            confidence_threshold: config.scoring.confidence_threshold,
            doubt_threshold: config.scoring.doubt_threshold,
            procedural_types: config.consolidation.procedural_content_types.clone(),
            episodic_types: config.consolidation.episodic_content_types.clone(),
        }
    }

    /// Completed and scored at or above the confidence threshold.
    /// Unscored chunks never qualify.
    pub fn should_promote(&self, status: &ProcessingStatus, scores: Option<&ScoreSet>) -> bool {
        status.status == StatusKind::Completed
            && scores.is_some_and(|s| s.confidence >= self.confidence_threshold)
    }

    pub fn should_quarantine(&self, status: &ProcessingStatus) -> bool {
        status.is_terminal()
    }

    pub fn is_doubtful(&self, scores: &ScoreSet) -> bool {
        scores.doubt >= self.doubt_threshold
    }

    /// Secondary tiers a semantic chunk should be copied into.
    pub fn projections_for(&self, record: &ChunkRecord) -> Vec<MemoryTier> {
        let content_type = record.chunk.content_type;
        let mut tiers = Vec::new();
        if self.episodic_types.contains(&content_type) {
            tiers.push(MemoryTier::Episodic);
        }
        if self.procedural_types.contains(&content_type) {
            tiers.push(MemoryTier::Procedural);
        }
        tiers
    }

    /// Rule projections not yet recorded on `record`.
    pub fn missing_projections(&self, record: &ChunkRecord) -> Vec<MemoryTier> {
        self.projections_for(record)
            .into_iter()
            .filter(|t| !record.projections.contains(t))
            .collect()
    }
}
