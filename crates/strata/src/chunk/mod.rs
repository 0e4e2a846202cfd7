//! Chunk identity, content and processing status

pub mod registry;
pub mod status;
pub mod types;

pub use registry::{ChunkRegistry, FailedChunk, Registration};
pub use status::{ProcessingStatus, RetryPolicy, StatusKind, backoff_delay};
pub use types::{
    Author, Chunk, ChunkContext, ChunkRecord, ChunkSource, ContentType, DeclaredRelationship,
    Position,
};
