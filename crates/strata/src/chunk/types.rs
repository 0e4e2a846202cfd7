//! Chunk data types
//!
//! A chunk is the unit of ingested knowledge. Its content is immutable once
//! registered; everything that changes over its life (status, scores, tier)
//! lives in separate records keyed by the chunk id.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, StrataError};
use crate::tiers::MemoryTier;

/// Kind of payload a chunk carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Code,
    Table,
    List,
    Heading,
    Image,
    Diagram,
    File,
    Other,
}

impl ContentType {
    pub const ALL: [ContentType; 9] = [
        ContentType::Text,
        ContentType::Code,
        ContentType::Table,
        ContentType::List,
        ContentType::Heading,
        ContentType::Image,
        ContentType::Diagram,
        ContentType::File,
        ContentType::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Code => "code",
            ContentType::Table => "table",
            ContentType::List => "list",
            ContentType::Heading => "heading",
            ContentType::Image => "image",
            ContentType::Diagram => "diagram",
            ContentType::File => "file",
            ContentType::Other => "other",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self> {
        ContentType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| StrataError::Validation(format!("unknown content type '{s}'")))
    }
}

/// Origin system a chunk was extracted from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl ChunkSource {
    pub fn new(source_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            source_type: source_type.into(),
            id: id.into(),
            url: None,
            container: None,
            title: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Topics, tags and language attached by the connector
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkContext {
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Where a chunk sits inside its parent document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    #[serde(default)]
    pub path: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_chunk_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_chunk_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i64>,
}

/// A relationship declared by the source system. Inferred edges live in the
/// graph, never here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeclaredRelationship {
    pub target_id: String,
    #[serde(rename = "type")]
    pub relationship_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_chunk_id: Option<String>,
}

/// A standardized chunk as produced by a connector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub id: String,
    pub connector_id: String,
    #[serde(default)]
    pub project_id: String,
    pub content: String,
    pub content_type: ContentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_format: Option<String>,
    pub source: ChunkSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    #[serde(default = "Utc::now")]
    pub processed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<Author>,
    #[serde(default)]
    pub context: ChunkContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default)]
    pub relationships: Vec<DeclaredRelationship>,
    /// Preserved verbatim; never interpreted
    #[serde(default)]
    pub raw_metadata: serde_json::Map<String, serde_json::Value>,
}

impl Chunk {
    pub fn new(
        id: impl Into<String>,
        connector_id: impl Into<String>,
        project_id: impl Into<String>,
        content: impl Into<String>,
        content_type: ContentType,
        source: ChunkSource,
    ) -> Self {
        Self {
            id: id.into(),
            connector_id: connector_id.into(),
            project_id: project_id.into(),
            content: content.into(),
            content_type,
            content_format: None,
            source,
            created: None,
            modified: None,
            processed_at: Utc::now(),
            author: None,
            context: ChunkContext::default(),
            position: None,
            relationships: Vec::new(),
            raw_metadata: serde_json::Map::new(),
        }
    }

    /// SHA-256 over the immutable payload: type, format and content.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.content_type.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.content_format.as_deref().unwrap_or("").as_bytes());
        hasher.update([0u8]);
        hasher.update(self.content.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Structural checks that need nothing but the chunk itself.
    pub fn validate(&self) -> Result<()> {
        require_non_blank("id", &self.id)?;
        require_non_blank("connectorId", &self.connector_id)?;
        require_non_blank("projectId", &self.project_id)?;
        require_non_blank("source.type", &self.source.source_type)?;
        require_non_blank("source.id", &self.source.id)?;

        if let (Some(created), Some(modified)) = (self.created, self.modified) {
            if modified < created {
                return Err(StrataError::Validation(format!(
                    "chunk {}: modified ({modified}) precedes created ({created})",
                    self.id
                )));
            }
        }
        for (field, at) in [("created", self.created), ("modified", self.modified)] {
            if let Some(at) = at.filter(|at| *at > self.processed_at) {
                return Err(StrataError::Validation(format!(
                    "chunk {}: {field} ({at}) is after processedAt ({})",
                    self.id, self.processed_at
                )));
            }
        }

        if let Some(position) = &self.position {
            self.validate_position(position)?;
        }

        for rel in &self.relationships {
            require_non_blank("relationships.targetId", &rel.target_id)?;
            if rel.target_chunk_id.as_deref() == Some(self.id.as_str()) {
                return Err(StrataError::Validation(format!(
                    "chunk {} declares a relationship to itself",
                    self.id
                )));
            }
        }

        Ok(())
    }

    fn validate_position(&self, position: &Position) -> Result<()> {
        let previous = position.previous_chunk_id.as_deref();
        let next = position.next_chunk_id.as_deref();

        if previous == Some(self.id.as_str()) || next == Some(self.id.as_str()) {
            return Err(StrataError::Validation(format!(
                "chunk {} links to itself as a sibling",
                self.id
            )));
        }
        if previous.is_some() && previous == next {
            return Err(StrataError::Validation(format!(
                "chunk {}: previous and next sibling are both {}",
                self.id,
                previous.unwrap_or_default()
            )));
        }
        if let Some(order) = position.order {
            if order < 0 {
                return Err(StrataError::Validation(format!(
                    "chunk {}: negative order {order}",
                    self.id
                )));
            }
        }
        Ok(())
    }

    pub fn previous_chunk_id(&self) -> Option<&str> {
        self.position.as_ref()?.previous_chunk_id.as_deref()
    }

    pub fn next_chunk_id(&self) -> Option<&str> {
        self.position.as_ref()?.next_chunk_id.as_deref()
    }

    pub fn order(&self) -> Option<i64> {
        self.position.as_ref()?.order
    }
}

fn require_non_blank(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(StrataError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}

/// The registry's authoritative row for a chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunk: Chunk,
    pub content_hash: String,
    /// Current tier; the only tier queries trust
    pub tier: MemoryTier,
    /// Episodic/procedural copies held alongside the semantic record
    #[serde(default)]
    pub projections: BTreeSet<MemoryTier>,
    pub registered_at: DateTime<Utc>,
    pub tier_changed_at: DateTime<Utc>,
    #[serde(default)]
    pub consolidated_at: Option<DateTime<Utc>>,
    /// Bumped on every write; used for compare-and-swap
    pub version: u64,
}

impl ChunkRecord {
    pub fn new(chunk: Chunk, now: DateTime<Utc>) -> Self {
        let content_hash = chunk.content_hash();
        Self {
            chunk,
            content_hash,
            tier: MemoryTier::Buffer,
            projections: BTreeSet::new(),
            registered_at: now,
            tier_changed_at: now,
            consolidated_at: None,
            version: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.chunk.id
    }

    pub fn project_id(&self) -> &str {
        &self.chunk.project_id
    }

    /// Terminally failed chunks stay inspectable but drop out of default queries.
    pub fn is_queryable(&self) -> bool {
        self.tier != MemoryTier::FailedTerminal
    }

    pub(crate) fn moved_to(&self, tier: MemoryTier, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        if tier == MemoryTier::Semantic {
            next.consolidated_at = Some(now);
        }
        next.tier = tier;
        next.tier_changed_at = now;
        next.version += 1;
        next
    }

    pub(crate) fn with_projection(&self, tier: MemoryTier) -> Self {
        let mut next = self.clone();
        next.projections.insert(tier);
        next.version += 1;
        next
    }
}
