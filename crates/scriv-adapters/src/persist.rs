//! Transcript persistence and the document-content side-channel.
//!
//! [`TranscriptWriter`] durably stores finalized messages, tracks
//! tool-invocation completion, and routes content-bearing tool outcomes
//! through the conflict-guarded merge into the document store. Message
//! ids are deduplicated per session, so replaying the engine's
//! authoritative state after a reconnect never double-persists.

use crate::store::{DocumentStore, SessionSink, TranscriptEntry};
use chrono::Utc;
use regex::Regex;
use scriv_core::document::{
    decide_merge, normalize_heading_title, DocStatus, Document, MergeGuard, Section, WriteMode,
};
use scriv_core::error::{SinkError, StoreError};
use scriv_core::message::{InvocationStatus, Message, ToolInvocation};
use scriv_core::tools;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock, Mutex};
use tracing::{debug, error, info, warn};

/// Give up routing a content outcome after this many optimistic-write
/// conflicts in a row.
const MAX_WRITE_ATTEMPTS: usize = 5;

/// Minimum length for a bare `<content>` block to count as generated
/// section text rather than conversational filler.
const INLINE_CONTENT_MIN_CHARS: usize = 100;

static CONTENT_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<content>(.*?)</content>").expect("static regex"));
static OUTLINE_ARRAY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\[\s*\{.*\}\s*\]").expect("static regex"));

/// A content payload extracted from a tool outcome, ready for the merge.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentOutcome {
    /// Tool name the payload came from (or a synthetic capture name).
    pub source: String,
    pub payload: String,
    pub mode: WriteMode,
    pub new_title: Option<String>,
    /// Per-section results, applied to the document outline when the ids
    /// match.
    pub section_updates: Vec<(String, String)>,
    /// Replacement outline captured alongside the payload.
    pub outline: Option<Vec<Section>>,
}

impl ContentOutcome {
    fn new(source: &str, payload: String) -> Self {
        Self {
            source: source.to_string(),
            payload,
            mode: WriteMode::Replace,
            new_title: None,
            section_updates: Vec::new(),
            outline: None,
        }
    }
}

fn is_content_operation(tag: Option<&str>) -> bool {
    matches!(tag, Some("content_generated") | Some("content_updated"))
}

/// Extract a content payload from a tool outcome per the tool-specific
/// rules. `None` when the outcome carries nothing for the document.
pub fn extract_content_outcome(name: &str, tool_output: &str) -> Option<ContentOutcome> {
    if !tools::is_content_tool(name) {
        return None;
    }

    let parsed: Option<Value> = serde_json::from_str(tool_output).ok();

    match name {
        tools::BATCH_GENERATE_SECTIONS => {
            let data = parsed?;
            let results = data.get("results")?.as_array()?;
            let mut updates = Vec::new();
            let mut parts = Vec::new();
            for sub in results {
                let op = sub.get("operation").and_then(Value::as_str);
                let content = sub.get("content").and_then(Value::as_str).unwrap_or("");
                if is_content_operation(op) && !content.is_empty() {
                    parts.push(content.to_string());
                    if let Some(id) = field_as_string(sub, "section_id") {
                        updates.push((id, content.to_string()));
                    }
                }
            }
            if parts.is_empty() {
                debug!(tool = name, "batch outcome carried no section content");
                return None;
            }
            let mut outcome = ContentOutcome::new(name, parts.join("\n\n"));
            outcome.section_updates = updates;
            Some(outcome)
        }
        tools::GENERATE_SECTION_CONTENT | tools::UPDATE_SECTION_CONTENT => {
            let data = parsed?;
            if !is_content_operation(data.get("operation").and_then(Value::as_str)) {
                return None;
            }
            let content = data
                .get("content")
                .and_then(Value::as_str)
                .filter(|c| !c.is_empty())
                .or_else(|| data.get("text").and_then(Value::as_str))?;
            let mut outcome = ContentOutcome::new(name, content.to_string());
            outcome.mode = data
                .get("mode")
                .and_then(Value::as_str)
                .map(WriteMode::parse)
                .unwrap_or_default();
            outcome.new_title = data
                .get("section_title")
                .and_then(Value::as_str)
                .map(str::to_string);
            if let Some(id) = field_as_string(&data, "section_id") {
                outcome.section_updates = vec![(id, content.to_string())];
            }
            Some(outcome)
        }
        tools::INLINE_SECTION_CAPTURE => {
            // Inline captures may arrive as a wrapped operation record or
            // as plain text.
            let content = match &parsed {
                Some(data) => data
                    .get("content")
                    .and_then(Value::as_str)
                    .or_else(|| data.get("text").and_then(Value::as_str))
                    .unwrap_or(tool_output)
                    .to_string(),
                None => tool_output.to_string(),
            };
            if content.trim().is_empty() {
                return None;
            }
            Some(ContentOutcome::new(name, content))
        }
        tools::INLINE_OUTLINE_CAPTURE => {
            let data = parsed?;
            let entries = data.get("outline")?.as_array()?.clone();
            let (sections, parts) = flatten_outline(&entries);
            let mut outcome = ContentOutcome::new(name, parts.join("\n\n"));
            outcome.new_title = data
                .get("section_title")
                .and_then(Value::as_str)
                .map(str::to_string);
            outcome.outline = Some(sections);
            Some(outcome)
        }
        _ => None,
    }
}

/// Capture generated content embedded in assistant text. Skipped when the
/// message already delegates to a content tool, to avoid double-saving.
pub fn extract_inline_capture(msg: &Message) -> Option<ContentOutcome> {
    let Message::Assistant {
        content,
        invocations,
        ..
    } = msg
    else {
        return None;
    };
    if invocations.iter().any(|inv| tools::is_content_tool(&inv.name)) {
        debug!("assistant delegates to a content tool; skipping inline capture");
        return None;
    }

    let inner = CONTENT_TAG
        .captures(content)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default();

    // An outline JSON array may sit inside the tag or in the bare text.
    let array_raw = OUTLINE_ARRAY
        .find(&inner)
        .map(|m| m.as_str().to_string())
        .or_else(|| OUTLINE_ARRAY.find(content).map(|m| m.as_str().to_string()));
    if let Some(raw) = array_raw {
        if let Ok(Value::Array(entries)) = serde_json::from_str::<Value>(&raw) {
            let (sections, parts) = flatten_outline(&entries);
            if !sections.is_empty() {
                info!(
                    sections = sections.len(),
                    with_content = parts.len(),
                    "captured outline from assistant text"
                );
                let mut outcome =
                    ContentOutcome::new(tools::INLINE_OUTLINE_CAPTURE, parts.join("\n\n"));
                outcome.outline = Some(sections);
                return Some(outcome);
            }
        }
    }

    if inner.chars().count() > INLINE_CONTENT_MIN_CHARS {
        info!(chars = inner.chars().count(), "captured section text from assistant message");
        return Some(ContentOutcome::new(tools::INLINE_SECTION_CAPTURE, inner));
    }
    None
}

fn field_as_string(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Depth-first flatten of outline entries into sections, collecting the
/// non-empty content fields along the way.
fn flatten_outline(entries: &[Value]) -> (Vec<Section>, Vec<String>) {
    let now = Utc::now();
    let mut sections = Vec::new();
    let mut parts = Vec::new();
    let mut stack: Vec<&Value> = entries.iter().rev().collect();
    while let Some(entry) = stack.pop() {
        let Some(id) = field_as_string(entry, "id") else {
            continue;
        };
        let title = field_as_string(entry, "title").unwrap_or_default();
        let content = entry
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        if !content.trim().is_empty() {
            parts.push(content.clone());
        }
        sections.push(Section {
            id,
            title,
            content,
            updated_at: now,
        });
        if let Some(children) = entry.get("children").and_then(Value::as_array) {
            for child in children.iter().rev() {
                stack.push(child);
            }
        }
    }
    (sections, parts)
}

#[derive(Debug, Clone)]
struct PendingRecord {
    name: String,
    status: InvocationStatus,
    output: Option<String>,
}

#[derive(Default)]
struct WriterState {
    seen: HashSet<String>,
    pending: HashMap<String, PendingRecord>,
}

/// Durable writer for one session's transcript and its bound document.
pub struct TranscriptWriter {
    sink: Arc<dyn SessionSink>,
    store: Arc<dyn DocumentStore>,
    guard: MergeGuard,
    state: Mutex<WriterState>,
}

impl TranscriptWriter {
    pub fn new(sink: Arc<dyn SessionSink>, store: Arc<dyn DocumentStore>) -> Self {
        Self::with_guard(sink, store, MergeGuard::default())
    }

    pub fn with_guard(
        sink: Arc<dyn SessionSink>,
        store: Arc<dyn DocumentStore>,
        guard: MergeGuard,
    ) -> Self {
        Self {
            sink,
            store,
            guard,
            state: Mutex::new(WriterState::default()),
        }
    }

    /// Persist a finalized message. Duplicate ids are skipped; assistant
    /// and tool messages get their side-effects (invocation registry,
    /// content routing).
    pub async fn record_message(
        &self,
        session: &str,
        doc_id: Option<&str>,
        msg: &Message,
    ) -> Result<(), SinkError> {
        if self.already_seen(msg.id()) {
            debug!(id = msg.id(), "message already persisted; skipping");
            return Ok(());
        }

        self.sink
            .append(session, TranscriptEntry::Message(msg.clone()))
            .await?;
        self.mark_seen(msg.id());

        match msg {
            Message::Assistant { invocations, .. } => {
                self.register_pending(invocations);
                if let Some(doc_id) = doc_id {
                    if let Some(outcome) = extract_inline_capture(msg) {
                        self.route_content(doc_id, outcome).await;
                    }
                }
            }
            Message::Tool {
                call_id,
                name,
                content,
                ..
            } => {
                self.complete_invocation(call_id, name, content);
                if let Some(doc_id) = doc_id {
                    if let Some(outcome) = extract_content_outcome(name, content) {
                        self.route_content(doc_id, outcome).await;
                    }
                }
            }
            Message::System { .. } | Message::User { .. } => {}
        }
        Ok(())
    }

    /// Record an invocation whose arguments could not be repaired. The
    /// call is never forwarded to execution.
    pub async fn record_invalid_call(
        &self,
        session: &str,
        invocation: &ToolInvocation,
        reason: &str,
    ) -> Result<(), SinkError> {
        warn!(call_id = %invocation.id, reason, "recording invalid tool call");
        self.sink
            .append(
                session,
                TranscriptEntry::InvalidCall {
                    invocation: invocation.clone(),
                    reason: reason.to_string(),
                },
            )
            .await
    }

    /// Best-effort flush of partially accumulated assistant content,
    /// tagged with the interruption reason.
    pub async fn save_partial(
        &self,
        session: &str,
        content: &str,
        reason: &str,
    ) -> Result<(), SinkError> {
        let message = Message::assistant(content);
        info!(reason, chars = content.chars().count(), "flushing partial assistant content");
        self.sink
            .append(
                session,
                TranscriptEntry::PartialFlush {
                    message: message.clone(),
                    reason: reason.to_string(),
                },
            )
            .await?;
        self.mark_seen(message.id());
        Ok(())
    }

    /// Current status of a registered invocation, if any.
    pub fn invocation_status(&self, call_id: &str) -> Option<InvocationStatus> {
        self.state
            .lock()
            .ok()
            .and_then(|st| st.pending.get(call_id).map(|r| r.status))
    }

    /// Recorded output of a completed invocation.
    pub fn invocation_output(&self, call_id: &str) -> Option<String> {
        self.state
            .lock()
            .ok()
            .and_then(|st| st.pending.get(call_id).and_then(|r| r.output.clone()))
    }

    fn already_seen(&self, id: &str) -> bool {
        self.state
            .lock()
            .map(|st| st.seen.contains(id))
            .unwrap_or(false)
    }

    fn mark_seen(&self, id: &str) {
        if let Ok(mut st) = self.state.lock() {
            st.seen.insert(id.to_string());
        }
    }

    fn register_pending(&self, invocations: &[ToolInvocation]) {
        if invocations.is_empty() {
            return;
        }
        if let Ok(mut st) = self.state.lock() {
            for inv in invocations {
                st.pending.entry(inv.id.clone()).or_insert(PendingRecord {
                    name: inv.name.clone(),
                    status: InvocationStatus::Pending,
                    output: None,
                });
            }
        }
    }

    fn complete_invocation(&self, call_id: &str, name: &str, output: &str) {
        let Ok(mut st) = self.state.lock() else {
            return;
        };
        match st.pending.get_mut(call_id) {
            Some(record) if record.status == InvocationStatus::Pending => {
                record.status = InvocationStatus::Success;
                record.output = Some(output.to_string());
                debug!(call_id, tool = %record.name, "invocation completed");
            }
            Some(_) => {
                debug!(call_id, "invocation already completed; skipping");
            }
            None => {
                // Log-and-skip: results for unknown calls are persisted
                // but not tracked.
                warn!(call_id, tool = name, "no pending invocation for tool result");
            }
        }
    }

    /// Reconcile a content outcome into the document via an atomic
    /// read-decide-write loop. Rejections and conflicts are absorbed.
    async fn route_content(&self, doc_id: &str, outcome: ContentOutcome) {
        for _attempt in 0..MAX_WRITE_ATTEMPTS {
            let (mut doc, version) = match self.store.read(doc_id).await {
                Ok(record) => (record.doc, record.version),
                Err(StoreError::NotFound(_)) => (Document::empty("", Utc::now()), 0),
                Err(err) => {
                    error!(doc_id, %err, "document read failed; dropping content outcome");
                    return;
                }
            };
            let now = Utc::now();

            // Work on a copy of the outline; nothing lands unless the
            // merge is accepted.
            let mut sections = match &outcome.outline {
                Some(outline) => outline.clone(),
                None => doc.sections.clone(),
            };
            let mut matched_any = false;
            for (id, content) in &outcome.section_updates {
                if let Some(section) = sections.iter_mut().find(|s| &s.id == id) {
                    section.content = content.clone();
                    section.updated_at = now;
                    matched_any = true;
                }
            }

            let (candidate, mode) = if matched_any {
                // Rebuild the whole document from the outline so a write
                // touching a few sections never erases the others.
                let rebuilt = Document {
                    sections: sections.clone(),
                    ..doc.clone()
                }
                .content_from_sections();
                (rebuilt, WriteMode::Replace)
            } else {
                (outcome.payload.clone(), outcome.mode)
            };

            if candidate.trim().is_empty() {
                // Nothing mergeable; an outline captured without content
                // is still installed as document structure.
                if let Some(outline) = &outcome.outline {
                    doc.sections = outline.clone();
                    match self.store.write(doc_id, doc, version).await {
                        Ok(_) => return,
                        Err(StoreError::Conflict { .. }) => continue,
                        Err(err) => {
                            error!(doc_id, %err, "outline install failed");
                            return;
                        }
                    }
                }
                debug!(doc_id, source = %outcome.source, "empty content outcome; nothing to merge");
                return;
            }

            let decision = decide_merge(&doc.content, doc.updated_at, &candidate, mode, now, &self.guard);
            let Some(resolved) = decision.resolve(&doc.content, &candidate) else {
                // Stale write: deliberate no-op, already logged with
                // before/after lengths.
                return;
            };

            doc.content = resolved;
            doc.sections = sections;
            doc.status = DocStatus::for_content(&doc.content);
            doc.updated_at = now;
            if outcome.source == tools::INLINE_OUTLINE_CAPTURE {
                if let Some(raw_title) = &outcome.new_title {
                    let clean = normalize_heading_title(raw_title);
                    if !clean.is_empty() && clean != doc.title {
                        info!(doc_id, title = %clean, "updating document title");
                        doc.title = clean;
                    }
                }
            }

            match self.store.write(doc_id, doc, version).await {
                Ok(new_version) => {
                    info!(doc_id, version = new_version, source = %outcome.source, "content write committed");
                    return;
                }
                Err(StoreError::Conflict { .. }) => {
                    debug!(doc_id, "write raced another turn; retrying");
                    continue;
                }
                Err(err) => {
                    error!(doc_id, %err, "document write failed; dropping content outcome");
                    return;
                }
            }
        }
        warn!(doc_id, "content write abandoned after repeated conflicts");
    }
}
