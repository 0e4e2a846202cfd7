//! Memory tiers and the transfer coordinator

pub mod coordinator;
pub mod policy;
pub mod sweep;
pub mod types;

pub use coordinator::{TierCoordinator, TransferOutcome};
pub use policy::PromotionPolicy;
pub use sweep::{
    CancelHandle, CancelToken, ConsolidationReport, HEALTH_KEY, HealthStatus, LAST_SWEEP_KEY,
    cancel_pair,
};
pub use types::{
    EvictionReason, MemoryTier, TransferHint, TransferIntent, TransferKind, TransferRecord,
};
