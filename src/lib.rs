//! # TJudge Match Engine
//!
//! The execution core of a bot-tournament platform: teams upload programs,
//! the engine pairs them in round-robin schedules, runs each pairing in a
//! resource-capped sandbox under a game-specific referee binary, records
//! outcomes exactly once, and keeps live ELO ratings flowing to
//! subscribers.
//!
//! It provides:
//! - A durable three-lane priority queue of match descriptors with
//!   ack/nack ownership and reservation-timeout redelivery (`queue`)
//! - An autoscaling worker pool draining that queue (`worker`)
//! - A sandboxed [`Executor`](executor::Executor) supervising referee
//!   binaries under cgroup v2 limits (`sandbox`, `executor`)
//! - Idempotent outcome ingestion with atomic ELO updates and memoized
//!   leaderboards (`recorder`, `rating`, `store`)
//! - A lock-guarded round orchestrator (`orchestrator`, `lock`,
//!   `schedule`)
//! - An in-process event hub the WebSocket gateway subscribes to
//!   (`broadcast`)
//!
//! HTTP routing, authentication, uploads and the referee binaries
//! themselves live outside this crate; it talks to them only through the
//! referee command-line contract and the event stream.
//!
//! # Usage Example
//!
//! ```no_run
//! use tjudge::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Configuration::from_env().with_workers(2, 16);
//!     let profile = SandboxProfile::from_env();
//!     let executor = Executor::new(profile)
//!         .with_referee(1, "/opt/referees/prisoners-dilemma")
//!         .with_referee(2, "/opt/referees/tug-of-war");
//!
//!     let mut engine = Engine::new(config, executor)?;
//!     engine.start();
//!
//!     // The upload layer has inserted programs; kick off a round.
//!     engine.orchestrator().start_round(1, 1, 1, 100)?;
//!
//!     // Live results for the gateway:
//!     let events = engine.broadcaster().subscribe("tournament:1");
//!     while let Ok(event) = events.recv() {
//!         println!("{}", serde_json::to_string(&event)?);
//!     }
//!
//!     engine.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! # Referee contract
//!
//! Every game is one deployed binary invoked as
//! `referee --iterations=<N> <program1> <program2>`, finishing with
//! `RESULT score1=<int> score2=<int> winner=<1|2|draw>` on stdout and
//! exit code 0. See [`executor`] for the failure classification.
#![warn(missing_docs)]

pub use anyhow;

pub mod broadcast;
pub mod configuration;
pub mod engine;
pub mod error;
pub mod executor;
pub mod lock;
mod logger;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod queue;
pub mod rating;
pub mod recorder;
pub mod sandbox;
pub mod schedule;
pub mod store;
mod worker;

/// Commonly used types for quick access.
///
/// ```rust
/// use tjudge::prelude::*;
/// ```
pub mod prelude {
    pub use crate::broadcast::{Broadcaster, Event};
    pub use crate::configuration::Configuration;
    pub use crate::engine::Engine;
    pub use crate::error::{EngineError, MatchFault};
    pub use crate::executor::Executor;
    pub use crate::model::{MatchDescriptor, Outcome, Priority, Winner};
    pub use crate::sandbox::SandboxProfile;
}
