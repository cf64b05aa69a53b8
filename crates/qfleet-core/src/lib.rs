//! QFleet Core - Core types, configuration, and error taxonomy
//!
//! This crate provides the data model shared by the learning core and the
//! persistent store: state fingerprints, Q-value entries, trajectories and
//! per-agent-kind learner configuration.

// Clippy pedantic allows - these are intentional design choices
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]

pub mod config;
pub mod entry;
pub mod error;
pub mod trajectory;
pub mod types;
pub mod util;

pub use config::{LearnerConfig, RewardWeights, MAX_REWARD_BOUND};
pub use entry::QEntry;
pub use error::{QFleetError, Result};
pub use trajectory::{ExecutionMetadata, Trajectory};
pub use types::*;
