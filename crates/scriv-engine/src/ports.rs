//! Boundary traits for the generation engine collaborator.
//!
//! Wire format and transport are out of scope; the engine is anything
//! that can stream turn events and report its authoritative state for
//! best-effort re-sync after a reconnect.

use async_trait::async_trait;
use futures::Stream;
use scriv_core::error::TurnError;
use scriv_core::message::Message;
use std::pin::Pin;

/// One event from the generation engine's stream.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// Incremental assistant text; accumulated until a finalized message
    /// arrives or the stream dies.
    ContentDelta(String),
    /// A finalized message (assistant with invocations, or a tool
    /// result).
    Finalized(Message),
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<TurnEvent, TurnError>> + Send>>;

/// Authoritative engine-side state for a session.
#[derive(Debug, Clone, Default)]
pub struct EngineState {
    pub messages: Vec<Message>,
    /// Engine-extracted auxiliary state (document structure, todos, ...).
    pub extracted: serde_json::Value,
}

#[async_trait]
pub trait GenerationEngine: Send + Sync {
    /// Start a turn and stream its events.
    async fn stream_turn(
        &self,
        session: &str,
        input: Vec<Message>,
    ) -> Result<EventStream, TurnError>;

    /// Best-effort snapshot of the engine's message history and
    /// extracted state.
    async fn get_state(&self, session: &str) -> Result<EngineState, TurnError>;

    /// Resume a paused turn (e.g. after a human approval) and stream the
    /// remaining events.
    async fn resume(
        &self,
        session: &str,
        payload: serde_json::Value,
    ) -> Result<EventStream, TurnError>;
}
