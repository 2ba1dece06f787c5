//! Pairing-invariant validation and healing.
//!
//! Invariant: every assistant message with N invocations is immediately
//! followed — before the next non-tool message — by tool messages covering
//! exactly those N ids. Histories that violate it are rejected outright by
//! generation engines, so violations are healed here rather than reported:
//! missing results get a placeholder, ownerless results are dropped.

use crate::message::Message;
use std::collections::HashSet;
use tracing::warn;

/// Sentinel content for a synthesized tool result.
pub const PLACEHOLDER_RESULT: &str =
    "tool result lost in transit; placeholder inserted to keep the conversation valid";

/// What a validation pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PairingStats {
    /// Placeholder tool messages synthesized for unanswered invocations.
    pub placeholders_inserted: usize,
    /// Tool messages dropped because no retained predecessor granted them.
    pub orphans_dropped: usize,
}

impl PairingStats {
    pub fn is_clean(&self) -> bool {
        *self == PairingStats::default()
    }

    fn merge(self, other: PairingStats) -> PairingStats {
        PairingStats {
            placeholders_inserted: self.placeholders_inserted + other.placeholders_inserted,
            orphans_dropped: self.orphans_dropped + other.orphans_dropped,
        }
    }
}

/// Full validation: heal missing results, then drop orphans.
pub fn validate(messages: &[Message]) -> (Vec<Message>, PairingStats) {
    let (healed, heal_stats) = heal_missing_results(messages);
    let (cleaned, orphan_stats) = drop_orphans(healed);
    let stats = heal_stats.merge(orphan_stats);
    if !stats.is_clean() {
        warn!(
            placeholders = stats.placeholders_inserted,
            orphans = stats.orphans_dropped,
            "pairing violations healed"
        );
    }
    (cleaned, stats)
}

/// Healing pass: for each tool-bearing assistant message, consume the run
/// of tool messages that follows it and append a placeholder for every
/// invocation id the run left unsatisfied. Tool messages answering ids
/// that are not currently required pass through untouched.
fn heal_missing_results(messages: &[Message]) -> (Vec<Message>, PairingStats) {
    let mut out = Vec::with_capacity(messages.len());
    let mut stats = PairingStats::default();
    let mut i = 0;

    while i < messages.len() {
        let msg = &messages[i];
        out.push(msg.clone());

        if !msg.has_invocations() {
            i += 1;
            continue;
        }

        let required: Vec<&str> = msg.invocations().iter().map(|inv| inv.id.as_str()).collect();
        let mut satisfied: HashSet<&str> = HashSet::new();

        // Consume the tool run following this assistant message.
        let mut j = i + 1;
        while j < messages.len() {
            match &messages[j] {
                Message::Tool { call_id, .. } => {
                    if required.contains(&call_id.as_str()) {
                        satisfied.insert(call_id.as_str());
                    }
                    out.push(messages[j].clone());
                    j += 1;
                }
                _ => break,
            }
        }

        for (idx, id) in required.iter().enumerate() {
            if !satisfied.contains(*id) {
                let name = msg.invocations()[idx].name.clone();
                warn!(call_id = %id, tool = %name, "missing tool result; injecting placeholder");
                out.push(Message::tool(*id, name, PLACEHOLDER_RESULT));
                stats.placeholders_inserted += 1;
            }
        }

        i = j;
    }

    (out, stats)
}

/// Terminal pass, re-run after any trimming: drop every tool message with
/// no owning predecessor. A tool message is owned while it extends a run
/// started by a retained assistant message that carries invocations; a
/// tool message at position 0, or following a retained non-assistant /
/// invocation-free message, is a protocol violation that must never reach
/// the generation engine.
pub fn drop_orphans(messages: Vec<Message>) -> (Vec<Message>, PairingStats) {
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());
    let mut stats = PairingStats::default();
    let mut in_owned_run = false;

    for msg in messages {
        if msg.is_tool() {
            if !in_owned_run {
                warn!(id = %msg.id(), "dropping orphan tool message");
                stats.orphans_dropped += 1;
            } else {
                out.push(msg);
            }
            continue;
        }
        in_owned_run = msg.has_invocations();
        out.push(msg);
    }

    (out, stats)
}
