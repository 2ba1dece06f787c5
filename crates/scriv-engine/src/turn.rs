//! The turn consumer.
//!
//! One logical task per turn reads the generation engine's event stream
//! sequentially: accumulate partial assistant text, repair and persist
//! finalized messages, and route content outcomes through the writer. On
//! cancellation or stream failure the consumer makes exactly one
//! best-effort flush of accumulated-but-unpersisted assistant content
//! before unwinding.

use crate::ports::{GenerationEngine, TurnEvent};
use crate::repair::RepairEngine;
use futures::StreamExt;
use scriv_adapters::cache::Cache;
use scriv_adapters::persist::TranscriptWriter;
use scriv_core::error::TurnError;
use scriv_core::message::{ArgPayload, Message, RepairOutcome, ToolInvocation};
use scriv_core::pairing;
use scriv_core::trim::{self, DEFAULT_MAX_CHARS};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How a turn ended. Only `Interrupted` and `Failed` surface an error
/// class upward; everything else the pipeline absorbed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnStatus {
    Completed,
    Interrupted,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnReport {
    pub status: TurnStatus,
    /// Finalized messages persisted during the stream (re-sync not
    /// counted).
    pub finalized: usize,
    pub partial_flushed: bool,
}

/// Validate pairing and trim to budget before resubmitting a history to
/// the generation engine.
pub fn prepare_history(messages: &[Message], budget: usize) -> Vec<Message> {
    let (healed, _stats) = pairing::validate(messages);
    trim::trim_to_budget(&healed, budget)
}

pub struct TurnRunner {
    engine: Arc<dyn GenerationEngine>,
    writer: Arc<TranscriptWriter>,
    repair: RepairEngine,
    trim_budget: usize,
}

impl TurnRunner {
    pub fn new(
        engine: Arc<dyn GenerationEngine>,
        writer: Arc<TranscriptWriter>,
        cache: Arc<dyn Cache>,
    ) -> Self {
        Self {
            engine,
            writer,
            repair: RepairEngine::new(cache),
            trim_budget: DEFAULT_MAX_CHARS,
        }
    }

    pub fn with_trim_budget(mut self, budget: usize) -> Self {
        self.trim_budget = budget;
        self
    }

    /// Drive one turn to its end-of-stream status.
    pub async fn run_turn(
        &self,
        session: &str,
        doc_id: Option<&str>,
        input: Vec<Message>,
        cancel: CancellationToken,
    ) -> TurnReport {
        let prepared = prepare_history(&input, self.trim_budget);
        let mut events = match self.engine.stream_turn(session, prepared).await {
            Ok(stream) => stream,
            Err(err) => {
                let flushed = self.flush_partial(session, "", err.reason_tag()).await;
                return TurnReport {
                    status: status_for(&err),
                    finalized: 0,
                    partial_flushed: flushed,
                };
            }
        };

        let mut partial = String::new();
        let mut partial_covered = false;
        let mut finalized = 0usize;

        loop {
            let next = tokio::select! {
                biased;
                item = events.next() => item,
                _ = cancel.cancelled() => {
                    info!(session, "turn cancelled by client");
                    let flushed = if partial_covered {
                        false
                    } else {
                        self.flush_partial(session, &partial, "interrupted").await
                    };
                    return TurnReport {
                        status: TurnStatus::Interrupted,
                        finalized,
                        partial_flushed: flushed,
                    };
                }
            };

            match next {
                None => break,
                Some(Ok(TurnEvent::ContentDelta(delta))) => partial.push_str(&delta),
                Some(Ok(TurnEvent::Finalized(msg))) => {
                    let msg = match msg {
                        Message::Assistant { .. } => {
                            partial_covered = true;
                            self.repair_assistant(session, msg).await
                        }
                        Message::Tool { .. } => {
                            // A tool result can outrun its finalized
                            // assistant message; persist the accumulated
                            // text first so the transcript stays ordered.
                            if !partial_covered && !partial.is_empty() {
                                let synthesized = Message::assistant(partial.clone());
                                if let Err(err) = self
                                    .writer
                                    .record_message(session, doc_id, &synthesized)
                                    .await
                                {
                                    error!(%err, "failed to persist accumulated assistant text");
                                } else {
                                    partial_covered = true;
                                }
                            }
                            msg
                        }
                        other => other,
                    };

                    if let Err(err) = self.writer.record_message(session, doc_id, &msg).await {
                        error!(%err, "persistence failed mid-turn");
                        let flushed = if partial_covered {
                            false
                        } else {
                            self.flush_partial(session, &partial, "unexpected_error").await
                        };
                        return TurnReport {
                            status: TurnStatus::Failed(err.to_string()),
                            finalized,
                            partial_flushed: flushed,
                        };
                    }
                    finalized += 1;
                }
                Some(Err(err)) => {
                    warn!(%err, "turn stream terminated");
                    let flushed = if partial_covered {
                        false
                    } else {
                        self.flush_partial(session, &partial, err.reason_tag()).await
                    };
                    return TurnReport {
                        status: status_for(&err),
                        finalized,
                        partial_flushed: flushed,
                    };
                }
            }
        }

        // Stream finished; replay the engine's authoritative state so
        // anything missed mid-stream lands. Idempotency absorbs overlap.
        match self.engine.get_state(session).await {
            Ok(state) => {
                for msg in &state.messages {
                    if let Err(err) = self.writer.record_message(session, doc_id, msg).await {
                        error!(%err, "re-sync persistence failed");
                        break;
                    }
                }
            }
            Err(err) => {
                warn!(%err, "state re-sync unavailable");
                if !partial_covered && !partial.is_empty() {
                    self.flush_partial(session, &partial, "incomplete_stream").await;
                }
            }
        }

        TurnReport {
            status: TurnStatus::Completed,
            finalized,
            partial_flushed: false,
        }
    }

    /// Repair every invocation on a finalized assistant message.
    /// Unrecoverable calls are recorded as explicit invalid-call entries
    /// and never forwarded.
    async fn repair_assistant(&self, session: &str, msg: Message) -> Message {
        let (id, content, invocations) = match msg {
            Message::Assistant {
                id,
                content,
                invocations,
            } => (id, content, invocations),
            other => return other,
        };

        let mut kept = Vec::with_capacity(invocations.len());
        for inv in invocations {
            match self.repair.repair(&inv) {
                RepairOutcome::Repaired { name, args } => {
                    kept.push(ToolInvocation {
                        id: inv.id,
                        name,
                        args: ArgPayload::Structured(serde_json::Value::Object(args)),
                        status: inv.status,
                    });
                }
                RepairOutcome::Unrecoverable { reason, .. } => {
                    if let Err(err) = self
                        .writer
                        .record_invalid_call(session, &inv, &reason)
                        .await
                    {
                        error!(%err, "failed to record invalid call");
                    }
                }
            }
        }

        Message::Assistant {
            id,
            content,
            invocations: kept,
        }
    }

    async fn flush_partial(&self, session: &str, content: &str, reason: &str) -> bool {
        match self.writer.save_partial(session, content, reason).await {
            Ok(()) => true,
            Err(err) => {
                error!(%err, "best-effort partial flush failed");
                false
            }
        }
    }
}

fn status_for(err: &TurnError) -> TurnStatus {
    match err {
        TurnError::Disconnected(_) => TurnStatus::Interrupted,
        TurnError::Unexpected(reason) => TurnStatus::Failed(reason.clone()),
    }
}
