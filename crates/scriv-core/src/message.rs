//! Transcript message model.
//!
//! One tagged union per message role, carrying only the fields valid for
//! that role. The generation engine is not a trusted client: assistant
//! invocations may arrive with empty names and broken argument payloads,
//! and tool results may reference ids nobody granted. The types here
//! represent that honestly; `scriv-engine::repair` and `pairing` make the
//! data safe to use.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Execution state of a tool invocation. Transitions `Pending` to
/// `Success` or `Error` exactly once; the persistence writer's registry
/// enforces the single transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Pending,
    Success,
    Error,
}

/// Argument payload as it arrived from the engine: either the raw string
/// the model produced (possibly truncated or otherwise malformed) or an
/// already-structured JSON value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ArgPayload {
    Structured(serde_json::Value),
    Raw(String),
}

impl<'de> Deserialize<'de> for ArgPayload {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        // A JSON string is the raw, unparsed form; everything else is
        // already structured.
        Ok(match serde_json::Value::deserialize(deserializer)? {
            serde_json::Value::String(s) => ArgPayload::Raw(s),
            other => ArgPayload::Structured(other),
        })
    }
}

impl ArgPayload {
    pub fn raw(s: impl Into<String>) -> Self {
        ArgPayload::Raw(s.into())
    }

    /// Character-equivalent cost used by the history trimmer.
    pub fn cost(&self) -> usize {
        match self {
            ArgPayload::Raw(s) => s.chars().count(),
            ArgPayload::Structured(v) => v.to_string().chars().count(),
        }
    }

    /// The payload as a JSON object, if it already is one.
    pub fn as_mapping(&self) -> Option<&serde_json::Map<String, serde_json::Value>> {
        match self {
            ArgPayload::Structured(serde_json::Value::Object(map)) => Some(map),
            _ => None,
        }
    }
}

/// A structured request from the engine to execute a named capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    /// Possibly empty until the repair engine infers it from shape.
    #[serde(default)]
    pub name: String,
    pub args: ArgPayload,
    #[serde(default = "InvocationStatus::pending")]
    pub status: InvocationStatus,
}

impl InvocationStatus {
    fn pending() -> Self {
        InvocationStatus::Pending
    }
}

impl ToolInvocation {
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: ArgPayload) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args,
            status: InvocationStatus::Pending,
        }
    }
}

/// Result of normalizing an invocation's argument payload.
///
/// `Repaired` always carries a mapping; a "successful" repair yielding a
/// list or scalar does not exist. `Unrecoverable` keeps the original
/// payload so the caller can record an explicit invalid-call entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RepairOutcome {
    Repaired {
        name: String,
        args: serde_json::Map<String, serde_json::Value>,
    },
    Unrecoverable {
        reason: String,
        original: String,
    },
}

/// A transcript message. Each variant carries only the fields valid for
/// its role; there is no optional `tool_call_id` on an assistant message
/// to probe for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    System {
        id: String,
        content: String,
    },
    User {
        id: String,
        content: String,
    },
    Assistant {
        id: String,
        content: String,
        #[serde(default)]
        invocations: Vec<ToolInvocation>,
    },
    Tool {
        id: String,
        /// Must reference an invocation id emitted by a preceding,
        /// not-yet-fully-answered assistant message.
        call_id: String,
        #[serde(default)]
        name: String,
        content: String,
    },
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Message::System {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Message::User {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Message::Assistant {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
            invocations: Vec::new(),
        }
    }

    pub fn assistant_with_calls(
        content: impl Into<String>,
        invocations: Vec<ToolInvocation>,
    ) -> Self {
        Message::Assistant {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
            invocations,
        }
    }

    pub fn tool(
        call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Message::Tool {
            id: Uuid::new_v4().to_string(),
            call_id: call_id.into(),
            name: name.into(),
            content: content.into(),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Message::System { id, .. }
            | Message::User { id, .. }
            | Message::Assistant { id, .. }
            | Message::Tool { id, .. } => id,
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Message::System { .. } => Role::System,
            Message::User { .. } => Role::User,
            Message::Assistant { .. } => Role::Assistant,
            Message::Tool { .. } => Role::Tool,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Message::System { content, .. }
            | Message::User { content, .. }
            | Message::Assistant { content, .. }
            | Message::Tool { content, .. } => content,
        }
    }

    /// Invocations carried by this message (empty for every non-assistant
    /// role).
    pub fn invocations(&self) -> &[ToolInvocation] {
        match self {
            Message::Assistant { invocations, .. } => invocations,
            _ => &[],
        }
    }

    pub fn has_invocations(&self) -> bool {
        !self.invocations().is_empty()
    }

    pub fn is_tool(&self) -> bool {
        matches!(self, Message::Tool { .. })
    }

    /// Character-equivalent cost: content plus serialized invocation
    /// payloads. The trimmer budgets on this.
    pub fn cost(&self) -> usize {
        let mut cost = self.content().chars().count();
        for inv in self.invocations() {
            cost += inv.id.chars().count() + inv.name.chars().count() + inv.args.cost();
        }
        cost
    }

    /// Replace the content, keeping every other field.
    pub fn with_content(&self, content: String) -> Self {
        let mut msg = self.clone();
        match &mut msg {
            Message::System { content: c, .. }
            | Message::User { content: c, .. }
            | Message::Assistant { content: c, .. }
            | Message::Tool { content: c, .. } => *c = content,
        }
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_includes_invocation_payloads() {
        let plain = Message::assistant("hello");
        assert_eq!(plain.cost(), 5);

        let inv = ToolInvocation::new(
            "call-1",
            "generate_section_content",
            ArgPayload::raw(r#"{"section_id": "2.1"}"#),
        );
        let with_call = Message::assistant_with_calls("hello", vec![inv]);
        assert!(with_call.cost() > plain.cost());
    }

    #[test]
    fn roundtrips_through_serde_with_role_tag() {
        let msg = Message::tool("call-9", "generate_section_content", "done");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "tool");
        assert_eq!(json["call_id"], "call-9");
        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn assistant_without_invocations_deserializes() {
        let raw = r#"{"role":"assistant","id":"m1","content":"hi"}"#;
        let msg: Message = serde_json::from_str(raw).unwrap();
        assert!(!msg.has_invocations());
    }

    #[test]
    fn arg_payload_prefers_structured_form() {
        let raw = r#"{"id":"c1","name":"t","args":{"k":1},"status":"pending"}"#;
        let inv: ToolInvocation = serde_json::from_str(raw).unwrap();
        assert!(inv.args.as_mapping().is_some());

        let raw = r#"{"id":"c2","name":"t","args":"{\"k\": 1","status":"pending"}"#;
        let inv: ToolInvocation = serde_json::from_str(raw).unwrap();
        assert!(matches!(inv.args, ArgPayload::Raw(_)));
    }
}
