//! # Herald Core
//!
//! Real-time orchestration engine for long-lived campaign entities. Every live
//! campaign is owned by one lightweight actor that periodically broadcasts a
//! state snapshot to its subscribers, runs its recurring jobs on a shared cron
//! scheduler, and ranks its participants with an operator-supplied formula.
//!
//! ## Architecture
//!
//! - [`ingest`]: consumes lifecycle events from the bus and runs the periodic
//!   sweep that bootstraps actors for every active campaign.
//! - [`dispatcher`]: routes events to the per-campaign actor, creating it
//!   exactly once per id.
//! - [`orchestrator`]: the actor itself (ticker, rate control, metadata
//!   watcher, load monitor).
//! - [`fanout`]: batched, non-blocking delivery of one snapshot to many
//!   subscribers.
//! - [`scheduler`]: process-wide cron scheduler with per-campaign add/remove.
//! - [`ranking`]: formula validation, the expression sandbox, and the cached
//!   leaderboard service.
//! - [`ports`]: traits for the external collaborators; [`adapters::memory`]
//!   provides in-process implementations.
//!
//! [`runtime::HeraldRuntime`] wires all of the above together.

pub mod adapters;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod fanout;
pub mod ingest;
pub mod orchestrator;
pub mod ports;
pub mod ranking;
pub mod runtime;
pub mod scheduler;
pub mod types;

pub use config::EngineConfig;
pub use dispatcher::{Dispatcher, RouteOutcome};
pub use error::{HeraldError, Result};
pub use runtime::{HeraldRuntime, HeraldRuntimeBuilder};
