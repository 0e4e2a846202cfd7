use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chunk::ContentType;
use crate::error::{Result, StrataError};
use crate::tiers::MemoryTier;

/// Fixed edge vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipType {
    Contains,
    BelongsTo,
    ParentOf,
    ChildOf,
    RelatedTo,
    SimilarTo,
    OppositeOf,
    SynonymOf,
    Precedes,
    Follows,
    OccursAt,
    Causes,
    CausedBy,
    Implies,
    ImpliedBy,
    DependsOn,
    Implements,
    References,
    Uses,
}

impl RelationshipType {
    pub const ALL: [RelationshipType; 19] = [
        RelationshipType::Contains,
        RelationshipType::BelongsTo,
        RelationshipType::ParentOf,
        RelationshipType::ChildOf,
        RelationshipType::RelatedTo,
        RelationshipType::SimilarTo,
        RelationshipType::OppositeOf,
        RelationshipType::SynonymOf,
        RelationshipType::Precedes,
        RelationshipType::Follows,
        RelationshipType::OccursAt,
        RelationshipType::Causes,
        RelationshipType::CausedBy,
        RelationshipType::Implies,
        RelationshipType::ImpliedBy,
        RelationshipType::DependsOn,
        RelationshipType::Implements,
        RelationshipType::References,
        RelationshipType::Uses,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipType::Contains => "CONTAINS",
            RelationshipType::BelongsTo => "BELONGS_TO",
            RelationshipType::ParentOf => "PARENT_OF",
            RelationshipType::ChildOf => "CHILD_OF",
            RelationshipType::RelatedTo => "RELATED_TO",
            RelationshipType::SimilarTo => "SIMILAR_TO",
            RelationshipType::OppositeOf => "OPPOSITE_OF",
            RelationshipType::SynonymOf => "SYNONYM_OF",
            RelationshipType::Precedes => "PRECEDES",
            RelationshipType::Follows => "FOLLOWS",
            RelationshipType::OccursAt => "OCCURS_AT",
            RelationshipType::Causes => "CAUSES",
            RelationshipType::CausedBy => "CAUSED_BY",
            RelationshipType::Implies => "IMPLIES",
            RelationshipType::ImpliedBy => "IMPLIED_BY",
            RelationshipType::DependsOn => "DEPENDS_ON",
            RelationshipType::Implements => "IMPLEMENTS",
            RelationshipType::References => "REFERENCES",
            RelationshipType::Uses => "USES",
        }
    }

    /// Whether an edge of this type may point at its own source.
    /// No reflexive types exist yet.
    pub fn is_reflexive(&self) -> bool {
        false
    }
}

impl fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelationshipType {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_uppercase().replace(['-', ' '], "_");
        RelationshipType::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| StrataError::Validation(format!("unknown relationship type '{s}'")))
    }
}

pub const DEFAULT_STRENGTH: f32 = 0.5;
pub const DEFAULT_CONFIDENCE: u8 = 50;

/// Which side of an edge a neighbour lookup follows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Edges whose source is the queried chunk
    #[default]
    Outgoing,
    /// Edges whose target is the queried chunk
    Incoming,
    Both,
}

/// Directed typed edge between two chunk ids
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    #[serde(rename = "type")]
    pub relationship_type: RelationshipType,
    pub strength: f32,
    pub confidence: u8,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

impl Relationship {
    pub fn new(
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        relationship_type: RelationshipType,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source_id: source_id.into(),
            target_id: target_id.into(),
            relationship_type,
            strength: DEFAULT_STRENGTH,
            confidence: DEFAULT_CONFIDENCE,
            properties: serde_json::Map::new(),
            created: now,
            modified: now,
        }
    }

    pub fn triple(&self) -> (&str, &str, RelationshipType) {
        (&self.source_id, &self.target_id, self.relationship_type)
    }

    /// The endpoint opposite `chunk_id`, if the edge touches it.
    pub fn other_end(&self, chunk_id: &str) -> Option<&str> {
        if self.source_id == chunk_id {
            Some(&self.target_id)
        } else if self.target_id == chunk_id {
            Some(&self.source_id)
        } else {
            None
        }
    }

    /// The endpoint reached from `chunk_id` when walking in `direction`.
    pub fn neighbor_of(&self, chunk_id: &str, direction: Direction) -> Option<&str> {
        match direction {
            Direction::Outgoing if self.source_id == chunk_id => Some(&self.target_id),
            Direction::Incoming if self.target_id == chunk_id => Some(&self.source_id),
            Direction::Both => self.other_end(chunk_id),
            _ => None,
        }
    }

    pub(crate) fn apply(&mut self, props: &EdgeProperties, now: DateTime<Utc>) {
        if let Some(strength) = props.strength {
            self.strength = strength;
        }
        if let Some(confidence) = props.confidence {
            self.confidence = confidence;
        }
        for (key, value) in &props.properties {
            self.properties.insert(key.clone(), value.clone());
        }
        self.modified = now.max(self.modified);
    }
}

/// Properties supplied to `connect`; `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeProperties {
    pub strength: Option<f32>,
    pub confidence: Option<u8>,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl EdgeProperties {
    pub fn with_strength(mut self, strength: f32) -> Self {
        self.strength = Some(strength);
        self
    }

    pub fn with_confidence(mut self, confidence: u8) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(strength) = self.strength {
            if !strength.is_finite() || !(0.0..=1.0).contains(&strength) {
                return Err(StrataError::Validation(format!(
                    "edge strength {strength} is outside 0..=1"
                )));
            }
        }
        if let Some(confidence) = self.confidence {
            if confidence > 100 {
                return Err(StrataError::Validation(format!(
                    "edge confidence {confidence} is outside 0..=100"
                )));
            }
        }
        Ok(())
    }
}

/// A consolidated chunk as represented in the graph store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    pub chunk_id: String,
    pub project_id: String,
    pub content_type: ContentType,
    pub tier: MemoryTier,
    pub updated_at: DateTime<Utc>,
}

/// Result row from `find_similar`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarChunk {
    pub chunk_id: String,
    pub project_id: String,
    pub content_type: ContentType,
    /// Number of query keywords the content matched
    pub score: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_parsing_normalizes_case_and_separators() {
        assert_eq!(
            "depends-on".parse::<RelationshipType>().unwrap(),
            RelationshipType::DependsOn
        );
        assert_eq!(
            "Related To".parse::<RelationshipType>().unwrap(),
            RelationshipType::RelatedTo
        );
        assert!("LIKES".parse::<RelationshipType>().is_err());
    }

    #[test]
    fn test_serde_matches_vocabulary() {
        for kind in RelationshipType::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
            assert!(!kind.is_reflexive());
        }
    }

    #[test]
    fn test_apply_merges_and_never_moves_modified_backwards() {
        let now = Utc::now();
        let mut edge = Relationship::new("a", "b", RelationshipType::RelatedTo, now);
        let props = EdgeProperties::default()
            .with_strength(0.9)
            .with_property("via", serde_json::json!("sweep"));

        edge.apply(&props, now - chrono::Duration::seconds(5));
        assert_eq!(edge.strength, 0.9);
        assert_eq!(edge.confidence, DEFAULT_CONFIDENCE);
        assert_eq!(edge.modified, now);
        assert_eq!(edge.properties["via"], "sweep");
    }

    #[test]
    fn test_property_validation() {
        assert!(EdgeProperties::default().with_strength(1.5).validate().is_err());
        assert!(
            EdgeProperties::default()
                .with_strength(f32::NAN)
                .validate()
                .is_err()
        );
        assert!(EdgeProperties::default().with_confidence(101).validate().is_err());
        assert!(
            EdgeProperties::default()
                .with_strength(0.0)
                .with_confidence(100)
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn test_other_end() {
        let edge = Relationship::new("a", "b", RelationshipType::Precedes, Utc::now());
        assert_eq!(edge.other_end("a"), Some("b"));
        assert_eq!(edge.other_end("b"), Some("a"));
        assert_eq!(edge.other_end("c"), None);
    }

    #[test]
    fn test_neighbor_of_respects_direction() {
        let edge = Relationship::new("a", "b", RelationshipType::DependsOn, Utc::now());
        assert_eq!(edge.neighbor_of("a", Direction::Outgoing), Some("b"));
        assert_eq!(edge.neighbor_of("b", Direction::Outgoing), None);
        assert_eq!(edge.neighbor_of("b", Direction::Incoming), Some("a"));
        assert_eq!(edge.neighbor_of("a", Direction::Incoming), None);
        assert_eq!(edge.neighbor_of("b", Direction::Both), Some("a"));
        assert_eq!(Direction::default(), Direction::Outgoing);
    }
}
