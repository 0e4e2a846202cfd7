//! Confidence and doubt scoring

pub mod ledger;
pub mod types;

pub use ledger::{HINT_QUEUE_CAPACITY, ScoreLedger, ScoreUpdate};
pub use types::{ScoreComponents, ScoreSet, ScoreWeights, aggregate};
