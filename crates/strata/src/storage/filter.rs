//! Query filters for the store adapters
//!
//! Filters describe *what* to fetch; each adapter translates them into its
//! own idiom (map scans for the in-memory stores, SQL predicates for LanceDB).

use chrono::{DateTime, Utc};

use crate::chunk::{ChunkRecord, ContentType, StatusKind};
use crate::tiers::MemoryTier;

/// Position in the `(registered_at, id)` order chunk scans return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkCursor {
    pub registered_at: DateTime<Utc>,
    pub id: String,
}

impl ChunkCursor {
    pub fn of(record: &ChunkRecord) -> Self {
        Self {
            registered_at: record.registered_at,
            id: record.id().to_string(),
        }
    }

    /// Whether `record` sorts strictly after this position.
    pub fn precedes(&self, record: &ChunkRecord) -> bool {
        (record.registered_at, record.id()) > (self.registered_at, self.id.as_str())
    }
}

/// Filter over registered chunk records.
///
/// All fields are optional; set fields are combined with AND logic. Results
/// come back in `(registered_at, id)` order.
#[derive(Debug, Clone, Default)]
pub struct ChunkQuery {
    pub tier: Option<MemoryTier>,
    pub project_id: Option<String>,
    /// Only records registered at or before this instant
    pub registered_before: Option<DateTime<Utc>>,
    /// Only records after this position, for paging
    pub after: Option<ChunkCursor>,
    pub limit: Option<usize>,
}

impl ChunkQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_tier(mut self, tier: MemoryTier) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn in_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn registered_before(mut self, at: DateTime<Utc>) -> Self {
        self.registered_before = Some(at);
        self
    }

    pub fn after(mut self, cursor: ChunkCursor) -> Self {
        self.after = Some(cursor);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Filter over processing status rows
#[derive(Debug, Clone, Default)]
pub struct StatusQuery {
    pub status: Option<StatusKind>,
    pub limit: Option<usize>,
}

impl StatusQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: StatusKind) -> Self {
        self.status = Some(status);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Keyword search over long-term document copies.
///
/// `project_id` is mandatory: document search is always project-scoped.
#[derive(Debug, Clone)]
pub struct TextQuery {
    pub project_id: String,
    pub keywords: Vec<String>,
    pub content_type: Option<ContentType>,
    pub collection: Option<MemoryTier>,
    pub limit: usize,
}

impl TextQuery {
    /// Split `text` into lowercase keywords; duplicates and blanks dropped.
    pub fn new(project_id: impl Into<String>, text: &str, limit: usize) -> Self {
        let mut keywords: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();
        keywords.sort();
        keywords.dedup();

        Self {
            project_id: project_id.into(),
            keywords,
            content_type: None,
            collection: None,
            limit,
        }
    }

    pub fn with_content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = Some(content_type);
        self
    }

    pub fn in_collection(mut self, collection: MemoryTier) -> Self {
        self.collection = Some(collection);
        self
    }

    /// Number of keywords `content` contains (case-insensitive substring match).
    pub fn hits(&self, content: &str) -> usize {
        let haystack = content.to_lowercase();
        self.keywords
            .iter()
            .filter(|k| haystack.contains(k.as_str()))
            .count()
    }
}

/// Quote a value for use inside a LanceDB SQL predicate.
pub(crate) fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_query_builder() {
        let query = ChunkQuery::new()
            .in_tier(MemoryTier::Working)
            .in_project("p1")
            .limit(10);
        assert_eq!(query.tier, Some(MemoryTier::Working));
        assert_eq!(query.project_id.as_deref(), Some("p1"));
        assert_eq!(query.limit, Some(10));
        assert!(query.registered_before.is_none());
    }

    #[test]
    fn test_text_query_tokenizes_text() {
        let query = TextQuery::new("p1", "Deploy, deploy the cargo-build!", 5);
        assert_eq!(query.keywords, vec!["build", "cargo", "deploy", "the"]);
    }

    #[test]
    fn test_hits_counts_distinct_keywords() {
        let query = TextQuery::new("p1", "rust cargo", 5);
        assert_eq!(query.hits("Cargo builds Rust crates with cargo"), 2);
        assert_eq!(query.hits("python"), 0);
    }

    #[test]
    fn test_empty_text_has_no_keywords() {
        let query = TextQuery::new("p1", "  ,, ", 5);
        assert!(query.keywords.is_empty());
    }

    #[test]
    fn test_sql_literal_escapes_quotes() {
        assert_eq!(sql_literal("o'brien"), "'o''brien'");
    }
}
