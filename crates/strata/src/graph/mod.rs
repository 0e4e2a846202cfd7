//! Typed relationships between chunks

pub mod manager;
pub mod types;

pub use manager::RelationshipGraph;
pub use types::{
    DEFAULT_CONFIDENCE, DEFAULT_STRENGTH, Direction, EdgeProperties, GraphNode, Relationship,
    RelationshipType, SimilarChunk,
};
