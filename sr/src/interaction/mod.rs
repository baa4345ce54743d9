//! Interaction handling - driving agent turns into the event log
//!
//! - [`producer`] - the agent producer contract and bundled producers
//! - [`controller`] - per-session turn lifecycle and cancellation

pub mod controller;
pub mod producer;

pub use controller::{
    CancelOutcome, Interaction, InteractionController, InteractionOutcome, InteractionSnapshot, InteractionStatus,
    StartedInteraction,
};
pub use producer::{AgentProducer, AgentUnit, EchoProducer, ProducerError, ScriptedProducer, Step, UnitStream};
