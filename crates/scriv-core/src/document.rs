//! Shared document model and the conflict-guarded merge decision.
//!
//! `decide_merge` is the single serialization point for writes to a
//! document. It is a pure function of its inputs — callers supply `now` —
//! so concurrent turns can evaluate it freely and perform their own
//! atomic read-decide-write against the store.
//!
//! The guard exists because candidates arrive from racing sources: a live
//! stream, a background re-sync, a second session. A shorter candidate
//! landing moments after a longer committed write is almost always stale
//! or duplicate delivery, not an intentional rewrite.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocStatus {
    Unwritten,
    Written,
}

impl DocStatus {
    /// Status is a pure function of content presence, re-derived on every
    /// accepted write.
    pub fn for_content(content: &str) -> Self {
        if content.trim().is_empty() {
            DocStatus::Unwritten
        } else {
            DocStatus::Written
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    #[default]
    Replace,
    Append,
    Prepend,
}

impl WriteMode {
    /// Lenient parse for mode strings arriving in tool output; anything
    /// unrecognized falls back to replace.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "append" => WriteMode::Append,
            "prepend" => WriteMode::Prepend,
            _ => WriteMode::Replace,
        }
    }
}

/// One outline entry. Dotted ids ("2.1") encode nesting; the list order
/// is the document order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub content: String,
    pub updated_at: DateTime<Utc>,
}

/// The shared document. When `sections` is non-empty, `content` is kept
/// consistent with it by rebuilding from the outline on every accepted
/// section write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub title: String,
    #[serde(default)]
    pub content: String,
    pub status: DocStatus,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub sections: Vec<Section>,
}

impl Document {
    pub fn empty(title: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            title: title.into(),
            content: String::new(),
            status: DocStatus::Unwritten,
            updated_at: now,
            sections: Vec::new(),
        }
    }

    /// Join every non-empty section's content in outline order.
    pub fn content_from_sections(&self) -> String {
        self.sections
            .iter()
            .map(|s| s.content.as_str())
            .filter(|c| !c.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Named thresholds for the replace-mode staleness guard. The values are
/// heuristic and deliberately kept as configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MergeGuard {
    /// Only documents longer than this get ratio protection.
    pub guarded_min_chars: usize,
    /// A replace candidate shorter than this fraction of the existing
    /// content is treated as a lossy overwrite.
    pub shrink_ratio: f64,
    /// Any shrink within this window of the last write is rejected.
    pub recent_clash_secs: i64,
    /// A shrink larger than `length_loss_margin` within this window is
    /// rejected.
    pub length_loss_secs: i64,
    pub length_loss_margin: usize,
}

impl Default for MergeGuard {
    fn default() -> Self {
        Self {
            guarded_min_chars: 500,
            shrink_ratio: 0.7,
            recent_clash_secs: 30,
            length_loss_secs: 180,
            length_loss_margin: 100,
        }
    }
}

/// Outcome of a merge decision. Accept variants carry enough to build the
/// final content via [`MergeDecision::resolve`].
#[derive(Debug, Clone, PartialEq)]
pub enum MergeDecision {
    Accept(String),
    AcceptAppend,
    AcceptPrepend,
    RejectStale(String),
}

impl MergeDecision {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, MergeDecision::RejectStale(_))
    }

    /// Final content for an accepted decision; `None` for a rejection.
    pub fn resolve(&self, existing: &str, candidate: &str) -> Option<String> {
        match self {
            MergeDecision::Accept(content) => Some(content.clone()),
            MergeDecision::AcceptAppend => Some(format!("{existing}\n\n{candidate}")),
            MergeDecision::AcceptPrepend => Some(format!("{candidate}\n\n{existing}")),
            MergeDecision::RejectStale(_) => None,
        }
    }
}

/// Decide whether `candidate` may land on top of `existing`.
pub fn decide_merge(
    existing: &str,
    updated_at: DateTime<Utc>,
    candidate: &str,
    mode: WriteMode,
    now: DateTime<Utc>,
    guard: &MergeGuard,
) -> MergeDecision {
    // Never erase content with nothing, in any mode.
    if candidate.trim().is_empty() {
        return reject("empty candidate", existing, candidate);
    }

    match mode {
        WriteMode::Append => MergeDecision::AcceptAppend,
        WriteMode::Prepend => MergeDecision::AcceptPrepend,
        WriteMode::Replace => {
            if existing.trim().is_empty() {
                return MergeDecision::Accept(candidate.to_string());
            }

            let existing_len = existing.chars().count();
            let candidate_len = candidate.chars().count();
            let age = now.signed_duration_since(updated_at);

            if existing_len > guard.guarded_min_chars
                && (candidate_len as f64) < guard.shrink_ratio * existing_len as f64
            {
                return reject("candidate shrinks guarded content", existing, candidate);
            }
            if existing_len > candidate_len && age < Duration::seconds(guard.recent_clash_secs) {
                return reject("shrinking write raced a recent commit", existing, candidate);
            }
            if existing_len > candidate_len + guard.length_loss_margin
                && age < Duration::seconds(guard.length_loss_secs)
            {
                return reject("large shrink shortly after commit", existing, candidate);
            }

            MergeDecision::Accept(candidate.to_string())
        }
    }
}

fn reject(reason: &str, existing: &str, candidate: &str) -> MergeDecision {
    warn!(
        existing_len = existing.chars().count(),
        candidate_len = candidate.chars().count(),
        reason,
        "stale write rejected"
    );
    MergeDecision::RejectStale(reason.to_string())
}

/// Strip leading Markdown heading markers and whitespace from a title
/// proposed by the outline-capture path.
pub fn normalize_heading_title(raw: &str) -> String {
    raw.trim_start()
        .trim_start_matches('#')
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs_ago: i64) -> (DateTime<Utc>, DateTime<Utc>) {
        let now = Utc::now();
        (now - Duration::seconds(secs_ago), now)
    }

    fn guard() -> MergeGuard {
        MergeGuard::default()
    }

    #[test]
    fn empty_candidate_rejected_in_every_mode() {
        let (updated, now) = at(3_600);
        for mode in [WriteMode::Replace, WriteMode::Append, WriteMode::Prepend] {
            let decision = decide_merge("existing", updated, "   \n ", mode, now, &guard());
            assert!(matches!(decision, MergeDecision::RejectStale(_)));
        }
    }

    #[test]
    fn append_joins_with_blank_line() {
        let (updated, now) = at(5);
        let decision = decide_merge("existing", updated, "X", WriteMode::Append, now, &guard());
        assert_eq!(decision, MergeDecision::AcceptAppend);
        assert_eq!(
            decision.resolve("existing", "X").unwrap(),
            "existing\n\nX"
        );
    }

    #[test]
    fn prepend_joins_with_blank_line() {
        let (updated, now) = at(5);
        let decision = decide_merge("existing", updated, "X", WriteMode::Prepend, now, &guard());
        assert_eq!(
            decision.resolve("existing", "X").unwrap(),
            "X\n\nexisting"
        );
    }

    #[test]
    fn replace_onto_empty_always_accepted() {
        let (updated, now) = at(0);
        let decision = decide_merge("  \n", updated, "draft", WriteMode::Replace, now, &guard());
        assert_eq!(decision, MergeDecision::Accept("draft".into()));
    }

    #[test]
    fn shrinking_guarded_content_rejected_regardless_of_age() {
        // 600 chars committed 10 minutes ago; a 200-char replace loses
        // two thirds of it.
        let (updated, now) = at(600);
        let existing = "x".repeat(600);
        let candidate = "y".repeat(200);
        let decision = decide_merge(
            &existing,
            updated,
            &candidate,
            WriteMode::Replace,
            now,
            &guard(),
        );
        assert!(matches!(decision, MergeDecision::RejectStale(_)));
    }

    #[test]
    fn growth_accepted_even_on_old_content() {
        let (updated, now) = at(600);
        let existing = "x".repeat(600);
        let candidate = "y".repeat(700);
        let decision = decide_merge(
            &existing,
            updated,
            &candidate,
            WriteMode::Replace,
            now,
            &guard(),
        );
        assert_eq!(decision, MergeDecision::Accept(candidate.clone()));
    }

    #[test]
    fn any_shrink_within_recent_window_rejected() {
        // Short document (ratio guard does not apply), barely shrinking,
        // but committed 10 seconds ago.
        let (updated, now) = at(10);
        let existing = "x".repeat(300);
        let candidate = "y".repeat(295);
        let decision = decide_merge(
            &existing,
            updated,
            &candidate,
            WriteMode::Replace,
            now,
            &guard(),
        );
        assert!(matches!(decision, MergeDecision::RejectStale(_)));
    }

    #[test]
    fn large_shrink_within_three_minutes_rejected() {
        let (updated, now) = at(120);
        let existing = "x".repeat(400);
        let candidate = "y".repeat(250);
        let decision = decide_merge(
            &existing,
            updated,
            &candidate,
            WriteMode::Replace,
            now,
            &guard(),
        );
        assert!(matches!(decision, MergeDecision::RejectStale(_)));
    }

    #[test]
    fn small_shrink_on_settled_content_accepted() {
        // Past both windows and below the guarded length: a modest
        // shrink is a legitimate edit.
        let (updated, now) = at(600);
        let existing = "x".repeat(400);
        let candidate = "y".repeat(350);
        let decision = decide_merge(
            &existing,
            updated,
            &candidate,
            WriteMode::Replace,
            now,
            &guard(),
        );
        assert!(decision.is_accepted());
    }

    #[test]
    fn lengths_counted_in_chars_not_bytes() {
        // 200 CJK chars (600 bytes) replacing 210 CJK chars, settled:
        // within margins, accepted. Byte counting would trip the ratio.
        let (updated, now) = at(600);
        let existing = "档".repeat(210);
        let candidate = "案".repeat(200);
        let decision = decide_merge(
            &existing,
            updated,
            &candidate,
            WriteMode::Replace,
            now,
            &guard(),
        );
        assert!(decision.is_accepted());
    }

    #[test]
    fn status_follows_content_presence() {
        assert_eq!(DocStatus::for_content(""), DocStatus::Unwritten);
        assert_eq!(DocStatus::for_content("  \n\t"), DocStatus::Unwritten);
        assert_eq!(DocStatus::for_content("## 1. Scope"), DocStatus::Written);
    }

    #[test]
    fn heading_markers_stripped_from_title() {
        assert_eq!(normalize_heading_title("## Feasibility Study"), "Feasibility Study");
        assert_eq!(normalize_heading_title("###   Title  "), "Title");
        assert_eq!(normalize_heading_title("Plain"), "Plain");
    }

    #[test]
    fn content_from_sections_skips_empty() {
        let now = Utc::now();
        let mut doc = Document::empty("d", now);
        doc.sections = vec![
            Section {
                id: "1".into(),
                title: "One".into(),
                content: "## 1 One\nbody".into(),
                updated_at: now,
            },
            Section {
                id: "2".into(),
                title: "Two".into(),
                content: String::new(),
                updated_at: now,
            },
            Section {
                id: "3".into(),
                title: "Three".into(),
                content: "## 3 Three\nbody".into(),
                updated_at: now,
            },
        ];
        let joined = doc.content_from_sections();
        assert_eq!(joined, "## 1 One\nbody\n\n## 3 Three\nbody");
    }
}
