//! Budgeted history trimming.
//!
//! Shrinks an oversized message sequence to a character-equivalent cost
//! budget while keeping the most recent system message and the last
//! message verbatim, walking the middle newest-to-oldest, and treating a
//! tool result and its owning assistant message as one atomic unit. The
//! pairing orphan pass re-runs after assembly because trimming can
//! reintroduce orphans.

use crate::message::Message;
use crate::pairing;
use tracing::{info, warn};

/// Default budget, roughly 80k-100k tokens for mixed-language content.
pub const DEFAULT_MAX_CHARS: usize = 120_000;

/// Marker appended to content cut down to fit the remaining quota.
pub const TRUNCATION_MARKER: &str = "\n... [truncated] ...";

/// Minimum spare quota, beyond the assistant half, required to keep a
/// tool/assistant pair in truncated form instead of dropping it.
const PAIR_TRUNCATION_MARGIN: usize = 100;

#[derive(Debug, Clone, Copy)]
pub struct TrimConfig {
    pub max_chars: usize,
}

impl Default for TrimConfig {
    fn default() -> Self {
        Self {
            max_chars: DEFAULT_MAX_CHARS,
        }
    }
}

/// Total cost of a sequence.
pub fn history_cost(messages: &[Message]) -> usize {
    messages.iter().map(Message::cost).sum()
}

/// Trim `messages` to `budget`. Identity when the input already fits.
pub fn trim_to_budget(messages: &[Message], budget: usize) -> Vec<Message> {
    if messages.is_empty() {
        return Vec::new();
    }

    let total = history_cost(messages);
    if total <= budget {
        return messages.to_vec();
    }

    warn!(total, budget, "history exceeds budget; trimming");

    // Anchor: the most recent system message, or the first message when
    // none exists. Superseded system messages are not carried forward.
    let system_positions: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| matches!(m, Message::System { .. }))
        .map(|(i, _)| i)
        .collect();

    let (anchor, mut remaining): (Message, Vec<Message>) = if let Some(&last) =
        system_positions.last()
    {
        let rest = messages
            .iter()
            .enumerate()
            .filter(|(i, _)| !system_positions.contains(i))
            .map(|(_, m)| m.clone())
            .collect();
        (messages[last].clone(), rest)
    } else {
        (messages[0].clone(), messages[1..].to_vec())
    };

    // The last message is always kept verbatim.
    let last_msg = remaining.pop();

    let reserved = anchor.cost() + last_msg.as_ref().map(Message::cost).unwrap_or(0);
    let mut quota = budget.saturating_sub(reserved);

    // Walk newest-to-oldest; collected in reverse order.
    let mut middle_rev: Vec<Message> = Vec::new();
    let mut i = remaining.len() as isize - 1;
    while i >= 0 && quota > 0 {
        let idx = i as usize;
        let msg = &remaining[idx];
        let msg_cost = msg.cost();

        // A tool result and its owning assistant message travel together.
        if msg.is_tool() && idx > 0 && remaining[idx - 1].has_invocations() {
            let owner = &remaining[idx - 1];
            let pair_cost = msg_cost + owner.cost();
            if pair_cost <= quota {
                middle_rev.push(msg.clone());
                middle_rev.push(owner.clone());
                quota -= pair_cost;
            } else if quota > owner.cost() + PAIR_TRUNCATION_MARGIN {
                if let Some(cut) = truncate_to_cost(msg, quota - owner.cost()) {
                    middle_rev.push(cut);
                    middle_rev.push(owner.clone());
                }
                quota = 0;
            }
            // Otherwise the pair is dropped without charging quota.
            i -= 2;
            continue;
        }

        if msg_cost > quota {
            if let Some(cut) = truncate_to_cost(msg, quota) {
                middle_rev.push(cut);
            }
            quota = 0;
        } else {
            middle_rev.push(msg.clone());
            quota -= msg_cost;
        }
        i -= 1;
    }

    let mut trimmed = Vec::with_capacity(middle_rev.len() + 2);
    trimmed.push(anchor);
    trimmed.extend(middle_rev.into_iter().rev());
    if let Some(last) = last_msg {
        trimmed.push(last);
    }

    // Trimming can leave tool results whose owner was dropped.
    let (cleaned, _stats) = pairing::drop_orphans(trimmed);

    info!(
        before = total,
        after = history_cost(&cleaned),
        "history trimmed"
    );
    cleaned
}

/// Cut a message's content so its total cost (content + invocation
/// payloads + marker) fits `max_cost`. `None` when even an empty content
/// would not fit.
fn truncate_to_cost(msg: &Message, max_cost: usize) -> Option<Message> {
    let overhead = msg.cost() - msg.content().chars().count();
    let marker_len = TRUNCATION_MARKER.chars().count();
    let keep = max_cost.checked_sub(overhead + marker_len)?;
    let kept: String = msg.content().chars().take(keep).collect();
    Some(msg.with_content(format!("{kept}{TRUNCATION_MARKER}")))
}
