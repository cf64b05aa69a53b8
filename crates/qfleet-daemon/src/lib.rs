//! QFleet daemon library
//!
//! Hosts the learning core behind an HTTP API, backed by PostgreSQL or an
//! in-process store, with Prometheus metrics and trajectory retention.

#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::similar_names)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::unused_async)]

pub mod config;
pub mod daemon;
pub mod metrics;
pub mod postgres;
pub mod service;

pub use config::Config;
pub use daemon::{create_router, DaemonState, QFleetDaemon};
pub use service::LearningService;
