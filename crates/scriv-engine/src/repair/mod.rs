//! Tool-invocation argument repair.
//!
//! The generation engine emits argument payloads that are valid JSON on a
//! good day and fenced, quote-wrapped, truncated, or free text on a bad
//! one. [`repair_invocation`] normalizes whatever arrived into a mapping
//! or an explicit [`RepairOutcome::Unrecoverable`]; it never panics and
//! never produces a non-mapping "success".

mod coerce;
mod scanner;

use crate::repair::coerce::coerce_args;
use scriv_adapters::cache::Cache;
use scriv_core::message::{ArgPayload, RepairOutcome, ToolInvocation};
use scriv_core::tools;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Maximum quote-unwrapping depth; beyond this the payload is treated as
/// irreparably nested.
const MAX_UNWRAP_DEPTH: usize = 5;

/// Repair engine with a memoization seam. Outcomes are cached by a hash
/// of (tool name, raw payload) through the injected [`Cache`].
pub struct RepairEngine {
    cache: Arc<dyn Cache>,
}

impl RepairEngine {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }

    pub fn repair(&self, invocation: &ToolInvocation) -> RepairOutcome {
        let raw = match &invocation.args {
            ArgPayload::Raw(s) => s.clone(),
            ArgPayload::Structured(value) => {
                // Already-structured payloads are cheap; skip the cache.
                return repair_value(&invocation.name, value.clone(), &value.to_string());
            }
        };

        let key = cache_key(&invocation.name, &raw);
        if let Some(hit) = self.cache.get(&key) {
            if let Ok(outcome) = serde_json::from_str::<RepairOutcome>(&hit) {
                debug!(call_id = %invocation.id, "repair outcome served from cache");
                return outcome;
            }
        }

        let outcome = repair_raw_args(&invocation.name, &raw);
        if let Ok(serialized) = serde_json::to_string(&outcome) {
            self.cache.set(&key, serialized);
        }
        outcome
    }
}

fn cache_key(name: &str, raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update([0]);
    hasher.update(raw.as_bytes());
    format!("repair:{:x}", hasher.finalize())
}

/// Repair an invocation without a cache.
pub fn repair_invocation(invocation: &ToolInvocation) -> RepairOutcome {
    match &invocation.args {
        ArgPayload::Raw(s) => repair_raw_args(&invocation.name, s),
        ArgPayload::Structured(value) => {
            repair_value(&invocation.name, value.clone(), &value.to_string())
        }
    }
}

/// Repair a raw argument string for the named tool (name possibly empty).
pub fn repair_raw_args(name: &str, raw: &str) -> RepairOutcome {
    let cleaned = scanner::strip_code_fences(raw);

    // Peel quote-wrapping, at most MAX_UNWRAP_DEPTH layers.
    let mut current = cleaned.to_string();
    for _ in 0..MAX_UNWRAP_DEPTH {
        match scanner::unwrap_quote_layer(&current) {
            Some(inner) => current = inner,
            None => break,
        }
    }

    match parse_tolerant(&current) {
        Some(value) => repair_value(name, value, raw),
        None => {
            // Last resort: a known tool may still accept the text via its
            // coercion rule (e.g. free text for a single-field tool).
            if !name.is_empty() {
                let coerced = coerce_args(name, Value::String(current));
                if let Value::Object(args) = coerced {
                    info!(tool = name, "repaired free-text args via coercion");
                    return RepairOutcome::Repaired {
                        name: name.to_string(),
                        args,
                    };
                }
            }
            unrecoverable(name, raw, "argument payload is not parseable JSON")
        }
    }
}

/// Strict parse, then trailing-comma removal, then bracket-balance
/// closing for truncated documents.
fn parse_tolerant(text: &str) -> Option<Value> {
    if text.trim().is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Some(value);
    }
    let without_commas = scanner::strip_trailing_commas(text);
    if let Ok(value) = serde_json::from_str::<Value>(&without_commas) {
        return Some(value);
    }
    let closed = scanner::close_truncated(&without_commas);
    serde_json::from_str::<Value>(&closed).ok()
}

/// Normalize a parsed value: unwrap nesting artifacts, resolve the tool
/// name, apply coercion, and enforce the mapping contract.
fn repair_value(name: &str, value: Value, original: &str) -> RepairOutcome {
    // Nesting artifacts: a JSON string that itself holds JSON, or a
    // one-element list wrapping the real payload.
    let mut value = value;
    for _ in 0..MAX_UNWRAP_DEPTH {
        match unwrap_nesting(value) {
            Ok(inner) => value = inner,
            Err(done) => {
                value = done;
                break;
            }
        }
    }

    let resolved_name = if name.is_empty() {
        match value
            .as_object()
            .and_then(tools::infer_name_from_shape)
        {
            Some(inferred) => {
                info!(tool = inferred, "inferred tool name from argument shape");
                inferred.to_string()
            }
            None => {
                return unrecoverable(name, original, "tool name missing and not inferable");
            }
        }
    } else {
        name.to_string()
    };

    match coerce_args(&resolved_name, value) {
        Value::Object(args) => RepairOutcome::Repaired {
            name: resolved_name,
            args,
        },
        other => unrecoverable(
            &resolved_name,
            original,
            &format!("arguments are {} where a mapping is required", kind_of(&other)),
        ),
    }
}

/// One unwrapping step. `Ok` hands back the inner value to keep peeling;
/// `Err` returns the value as-is when no artifact remains.
fn unwrap_nesting(value: Value) -> Result<Value, Value> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            let looks_wrapped = (trimmed.starts_with('{') && trimmed.ends_with('}'))
                || (trimmed.starts_with('[') && trimmed.ends_with(']'));
            if looks_wrapped {
                if let Some(inner) = parse_tolerant(trimmed) {
                    return Ok(inner);
                }
            }
            Err(Value::String(s))
        }
        Value::Array(mut items) if items.len() == 1 => Ok(items.remove(0)),
        other => Err(other),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a mapping",
    }
}

fn unrecoverable(name: &str, original: &str, reason: &str) -> RepairOutcome {
    warn!(tool = name, reason, "tool args unrecoverable");
    RepairOutcome::Unrecoverable {
        reason: reason.to_string(),
        original: original.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scriv_adapters::cache::MemoryCache;
    use serde_json::json;
    use std::time::Duration;

    fn repaired_args(outcome: RepairOutcome) -> serde_json::Map<String, Value> {
        match outcome {
            RepairOutcome::Repaired { args, .. } => args,
            RepairOutcome::Unrecoverable { reason, .. } => {
                panic!("expected repaired outcome, got unrecoverable: {reason}")
            }
        }
    }

    #[test]
    fn valid_json_passes_through() {
        let outcome = repair_raw_args(
            tools::GENERATE_SECTION_CONTENT,
            r#"{"section_id": "2.1", "section_title": "Market"}"#,
        );
        let args = repaired_args(outcome);
        assert_eq!(args["section_id"], "2.1");
    }

    #[test]
    fn idempotent_on_already_mapping_args() {
        let value = json!({"section_id": "2.1", "target_words": 500});
        let inv = ToolInvocation::new(
            "c1",
            tools::GENERATE_SECTION_CONTENT,
            ArgPayload::Structured(value.clone()),
        );
        let first = repair_invocation(&inv);
        let args = repaired_args(first.clone());
        assert_eq!(Value::Object(args.clone()), value);

        let again = repair_invocation(&ToolInvocation::new(
            "c1",
            tools::GENERATE_SECTION_CONTENT,
            ArgPayload::Structured(Value::Object(args)),
        ));
        assert_eq!(again, first);
    }

    #[test]
    fn fenced_json_repaired() {
        let raw = "```json\n{\"section_id\": \"1\"}\n```";
        let args = repaired_args(repair_raw_args(tools::GENERATE_SECTION_CONTENT, raw));
        assert_eq!(args["section_id"], "1");
    }

    #[test]
    fn truncated_json_closed_and_parsed() {
        let raw = r#"{"sections": [{"id": "1", "title": "Backg"#;
        let args = repaired_args(repair_raw_args(tools::BATCH_GENERATE_SECTIONS, raw));
        assert_eq!(args["sections"][0]["id"], "1");
    }

    #[test]
    fn trailing_commas_tolerated() {
        let raw = r#"{"section_id": "3", "content_focus": "risks",}"#;
        let args = repaired_args(repair_raw_args(tools::GENERATE_SECTION_CONTENT, raw));
        assert_eq!(args["content_focus"], "risks");
    }

    #[test]
    fn double_quoted_payload_unwrapped() {
        let raw = r#""{\"section_id\": \"2.1\", \"target_words\": 800}""#;
        let args = repaired_args(repair_raw_args(tools::UPDATE_SECTION_CONTENT, raw));
        assert_eq!(args["target_words"], 800);
    }

    #[test]
    fn truncated_quoted_payload_unwrapped_and_closed() {
        let raw = r#""{\"section_id\": \"4\", \"existing_content\": \"old te"#;
        let args = repaired_args(repair_raw_args(tools::UPDATE_SECTION_CONTENT, raw));
        assert_eq!(args["section_id"], "4");
    }

    #[test]
    fn one_element_list_unwrapped() {
        let raw = r#"[{"section_id": "1", "section_title": "Scope"}]"#;
        let args = repaired_args(repair_raw_args(tools::GENERATE_SECTION_CONTENT, raw));
        assert_eq!(args["section_title"], "Scope");
    }

    #[test]
    fn name_inferred_from_sections_shape() {
        let raw = r#"{"sections": [{"id": "1"}, {"id": "2"}]}"#;
        match repair_raw_args("", raw) {
            RepairOutcome::Repaired { name, .. } => {
                assert_eq!(name, tools::BATCH_GENERATE_SECTIONS);
            }
            other => panic!("expected repair, got {other:?}"),
        }
    }

    #[test]
    fn name_inferred_create_vs_update() {
        let create = repair_raw_args("", r#"{"section_id": "1"}"#);
        assert!(matches!(
            create,
            RepairOutcome::Repaired { ref name, .. } if name == tools::GENERATE_SECTION_CONTENT
        ));
        let update = repair_raw_args("", r#"{"section_id": "1", "existing_content": "x"}"#);
        assert!(matches!(
            update,
            RepairOutcome::Repaired { ref name, .. } if name == tools::UPDATE_SECTION_CONTENT
        ));
    }

    #[test]
    fn free_text_for_plan_step_becomes_mapping() {
        let outcome = repair_raw_args(tools::PLAN_STEP, "first, survey the source material");
        let args = repaired_args(outcome);
        assert_eq!(args["step"], "first, survey the source material");
    }

    #[test]
    fn bare_list_for_batch_tool_wrapped() {
        let raw = r#"[{"id": "1", "title": "One"}, {"id": "2", "title": "Two"}]"#;
        let args = repaired_args(repair_raw_args(tools::BATCH_GENERATE_SECTIONS, raw));
        assert_eq!(args["sections"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn nameless_scalar_payload_unrecoverable() {
        let outcome = repair_raw_args("", "42");
        assert!(matches!(outcome, RepairOutcome::Unrecoverable { .. }));
    }

    #[test]
    fn scalar_for_known_nonfree_tool_unrecoverable() {
        let outcome = repair_raw_args(tools::DELETE_SECTION, "3");
        match outcome {
            RepairOutcome::Unrecoverable { reason, original } => {
                assert!(reason.contains("mapping"));
                assert_eq!(original, "3");
            }
            other => panic!("expected unrecoverable, got {other:?}"),
        }
    }

    #[test]
    fn never_panics_on_adversarial_input() {
        let inputs = [
            "",
            "\"",
            "'",
            "{",
            "[[[[",
            "]}",
            "\\\\\\",
            "```json",
            "{\"a\": \"\\",
            "\u{0}\u{1}\u{2}",
            "\"\"\"\"\"\"",
            "[1, [2, [3, [4, [5",
        ];
        for raw in inputs {
            let _ = repair_raw_args(tools::GENERATE_SECTION_CONTENT, raw);
            let _ = repair_raw_args("", raw);
        }
    }

    #[test]
    fn cached_outcome_reused_within_ttl() {
        let cache = Arc::new(MemoryCache::new(Duration::from_secs(60)));
        let engine = RepairEngine::new(cache.clone());
        let inv = ToolInvocation::new(
            "c1",
            tools::GENERATE_SECTION_CONTENT,
            ArgPayload::raw(r#"{"section_id": "1",}"#),
        );

        let first = engine.repair(&inv);
        assert_eq!(cache.len(), 1);
        let second = engine.repair(&inv);
        assert_eq!(first, second);
    }

    #[test]
    fn expired_cache_recomputes() {
        let cache = Arc::new(MemoryCache::new(Duration::ZERO));
        let engine = RepairEngine::new(cache.clone());
        let inv = ToolInvocation::new(
            "c1",
            tools::GENERATE_SECTION_CONTENT,
            ArgPayload::raw(r#"{"section_id": "1"}"#),
        );

        let first = engine.repair(&inv);
        // The entry expired instantly; a fresh repair still succeeds and
        // matches.
        let second = engine.repair(&inv);
        assert_eq!(first, second);
    }
}
