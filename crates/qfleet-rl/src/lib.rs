//! QFleet RL - shared Q-learning for fleets of autonomous agents
//!
//! This crate provides the learning path: state encoding, reward scoring,
//! the per-agent-kind learning core and the store abstraction it persists
//! through.

// Clippy pedantic allows - these are intentional design choices
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::float_cmp)]
#![allow(clippy::similar_names)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_arguments)]

pub mod hierarchy;
pub mod learner;
pub mod registry;
pub mod reward;
pub mod session;
pub mod state;
pub mod store;

pub use hierarchy::HierarchicalAggregator;
pub use learner::{
    FlushReport, HealthSnapshot, LearnerStats, QLearner, StoreHealth, UpdateOutcome, STORE_RETRY_INTERVAL,
};
pub use registry::{normalize_agent_kind, LearnerRegistry};
pub use reward::{RewardAdjuster, RewardBreakdown, RewardCalculator};
pub use session::{LearningSession, TransitionReport};
pub use state::{agent_kinds, Context, EncodedState, FeatureExtractor, StateEncoder};
pub use store::{
    AggregateStats, BatchUpsertOutcome, MemoryStore, QTableExport, QValueStore, RetryPolicy, UpsertEntry,
};
