//! SessionReel - session event streaming and replay for conversational agents
//!
//! Every agent turn produces an ordered stream of events that is recorded in
//! an append-only [`eventlog`], pushed to live viewers, and can be replayed
//! later with its original timing.
//!
//! # Core Concepts
//!
//! - **Log first**: an event is broadcast only after it is durably appended
//! - **One turn at a time**: a session runs at most one interaction
//! - **Viewers never slow producers**: a lagging subscriber is dropped, not waited on
//! - **Replays are independent**: each has its own cursor, rate and state
//!
//! # Modules
//!
//! - [`broadcast`] - Live Broadcaster, per-session fan-out
//! - [`interaction`] - Interaction Controller and the agent producer seam
//! - [`replay`] - Replay Controller, paced re-delivery
//! - [`reel`] - Facade wiring the above to an event log
//! - [`ipc`] - Unix socket control surface
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod broadcast;
pub mod cli;
pub mod config;
pub mod directory;
pub mod error;
pub mod interaction;
pub mod ipc;
pub mod reel;
pub mod replay;

pub use broadcast::{Broadcaster, Subscription};
pub use config::Config;
pub use directory::{OpenDirectory, SessionDirectory, StaticDirectory};
pub use error::{ReelError, ReelResult};
pub use interaction::{
    AgentProducer, AgentUnit, CancelOutcome, EchoProducer, Interaction, InteractionController, InteractionOutcome,
    InteractionSnapshot, InteractionStatus, StartedInteraction,
};
pub use reel::Reel;
pub use replay::{
    LiveProbe, NeverLive, ReplayController, ReplayFrame, ReplayHandle, ReplaySettings, ReplayState, ReplayStatus,
    ReplayStream,
};
