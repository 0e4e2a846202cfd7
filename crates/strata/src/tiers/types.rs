use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};

/// Memory level a chunk currently occupies.
///
/// `FailedTerminal` is a pseudo-tier for chunks whose retry budget ran out;
/// they stay inspectable but are never promoted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    Buffer,
    Working,
    Semantic,
    Episodic,
    Procedural,
    FailedTerminal,
}

impl MemoryTier {
    pub const ALL: [MemoryTier; 6] = [
        MemoryTier::Buffer,
        MemoryTier::Working,
        MemoryTier::Semantic,
        MemoryTier::Episodic,
        MemoryTier::Procedural,
        MemoryTier::FailedTerminal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryTier::Buffer => "buffer",
            MemoryTier::Working => "working",
            MemoryTier::Semantic => "semantic",
            MemoryTier::Episodic => "episodic",
            MemoryTier::Procedural => "procedural",
            MemoryTier::FailedTerminal => "failed_terminal",
        }
    }

    /// Secondary classifications layered on top of a semantic record
    pub fn is_projection(&self) -> bool {
        matches!(self, MemoryTier::Episodic | MemoryTier::Procedural)
    }

    /// Tiers whose records are kept until explicitly evicted
    pub fn is_long_term(&self) -> bool {
        matches!(
            self,
            MemoryTier::Semantic | MemoryTier::Episodic | MemoryTier::Procedural
        )
    }
}

impl fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryTier {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self> {
        MemoryTier::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| StrataError::Validation(format!("unknown memory tier '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    /// Buffer entry outlived its time-to-live
    TtlExpired,
    /// Operator-requested deletion
    Manual,
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictionReason::TtlExpired => write!(f, "ttl expired"),
            EvictionReason::Manual => write!(f, "manual"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransferKind {
    Registered,
    Admitted,
    Promoted,
    Projected,
    Quarantined,
    Reinstated,
    Evicted { reason: EvictionReason },
    /// Doubt crossed its threshold; recorded for review, tier unchanged
    Flagged { doubt: u8 },
    /// A transfer was abandoned and the chunk sent back for retry
    Deferred,
}

/// One entry in the append-only audit log, keyed by `(chunk_id, at)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub chunk_id: String,
    pub at: DateTime<Utc>,
    pub from: Option<MemoryTier>,
    pub to: Option<MemoryTier>,
    #[serde(flatten)]
    pub kind: TransferKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl TransferRecord {
    pub fn new(
        chunk_id: impl Into<String>,
        at: DateTime<Utc>,
        from: Option<MemoryTier>,
        to: Option<MemoryTier>,
        kind: TransferKind,
    ) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            at,
            from,
            to,
            kind,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl fmt::Display for TransferRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tier = |t: Option<MemoryTier>| t.map_or("-", |t| t.as_str());
        write!(
            f,
            "[{}] {} {} -> {} ({:?})",
            self.at.format("%Y-%m-%d %H:%M:%S"),
            self.chunk_id,
            tier(self.from),
            tier(self.to),
            self.kind
        )?;
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

/// Write-ahead marker for a transfer whose external writes are in flight.
///
/// Written before touching the graph or document store and removed once the
/// tier change commits; a leftover intent means the transfer must be resumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferIntent {
    pub chunk_id: String,
    pub from: MemoryTier,
    pub to: MemoryTier,
    pub started_at: DateTime<Utc>,
}

/// Signal from the score ledger that a chunk may need to change tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferHint {
    ConfidenceReached { chunk_id: String, confidence: u8 },
    DoubtRaised { chunk_id: String, doubt: u8 },
}

impl TransferHint {
    pub fn chunk_id(&self) -> &str {
        match self {
            TransferHint::ConfidenceReached { chunk_id, .. }
            | TransferHint::DoubtRaised { chunk_id, .. } => chunk_id,
        }
    }
}
