//! Strata - tiered knowledge substrate
//!
//! Tracks standardized chunks through buffer, working, semantic, episodic
//! and procedural memory tiers: identity and status, confidence and doubt
//! scoring, the relationship graph, and the consolidation protocol that moves
//! chunks between backing stores.

pub mod chunk;
pub mod config;
pub mod context;
pub mod error;
pub mod graph;
pub mod intake;
pub mod scoring;
pub mod stats;
pub mod storage;
pub mod testing;
pub mod tiers;

pub use context::StrataContext;
pub use error::{Result, StrataError};
