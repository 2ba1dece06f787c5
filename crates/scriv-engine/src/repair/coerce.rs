//! Per-tool argument coercion.
//!
//! The generation engine emits numbers as strings ("1/10"), booleans as
//! words in whatever language it was thinking in, and free text where a
//! mapping was required. Each rule here is keyed by tool name; unknown
//! tools pass through untouched.

use super::scanner;
use regex::Regex;
use scriv_core::tools;
use serde_json::{Map, Value};
use std::sync::LazyLock;

/// Integer-valued fields of the planning tool.
const PLAN_INT_FIELDS: &[&str] = &["step_number", "total_steps", "revises_step"];
/// Boolean-valued fields of the planning tool.
const PLAN_BOOL_FIELDS: &[&str] = &["more_steps_needed", "is_revision"];
/// The planning tool's single free-text field.
const PLAN_TEXT_FIELD: &str = "step";

static DIGIT_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("static regex"));
static STEP_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    // Tolerates a truncated closing quote at end of input.
    Regex::new(r#"(?s)"step"\s*:\s*"(.*?)(?:"\s*[,}]|$)"#).expect("static regex")
});

/// Apply the coercion table for `name` to `args`.
pub(crate) fn coerce_args(name: &str, args: Value) -> Value {
    match name {
        tools::PLAN_STEP => coerce_plan_step(args),
        tools::BATCH_GENERATE_SECTIONS => match args {
            Value::Array(items) => {
                let mut map = Map::new();
                map.insert("sections".to_string(), Value::Array(items));
                Value::Object(map)
            }
            other => other,
        },
        _ => args,
    }
}

fn coerce_plan_step(args: Value) -> Value {
    let args = match args {
        Value::String(text) => salvage_plan_step_text(&text),
        other => other,
    };

    let Value::Object(mut map) = args else {
        return args;
    };

    for field in PLAN_INT_FIELDS {
        if let Some(value) = map.get(*field) {
            if let Some(n) = coerce_int(value) {
                map.insert((*field).to_string(), Value::from(n));
            }
        }
    }
    for field in PLAN_BOOL_FIELDS {
        if let Some(value) = map.get(*field) {
            if let Some(b) = coerce_bool(value) {
                map.insert((*field).to_string(), Value::Bool(b));
            }
        }
    }
    Value::Object(map)
}

/// Free text where a plan-step mapping was required. Try a tolerant JSON
/// parse first; then a flat regex extraction of whatever structured
/// fields are still visible; finally wrap the whole text as the step.
fn salvage_plan_step_text(text: &str) -> Value {
    let stripped = text.trim();

    if stripped.starts_with('{') {
        let patched = scanner::close_truncated(&scanner::strip_trailing_commas(stripped));
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&patched) {
            return Value::Object(map);
        }
    }

    let mut extracted = Map::new();
    for field in PLAN_INT_FIELDS {
        if let Some(n) = extract_quoted_int(stripped, field) {
            extracted.insert((*field).to_string(), Value::from(n));
        }
    }
    for field in PLAN_BOOL_FIELDS {
        if let Some(b) = extract_bool(stripped, field) {
            extracted.insert((*field).to_string(), Value::Bool(b));
        }
    }

    if extracted.is_empty() {
        let mut map = Map::new();
        map.insert(PLAN_TEXT_FIELD.to_string(), Value::String(text.to_string()));
        return Value::Object(map);
    }

    let step_text = STEP_TEXT
        .captures(stripped)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().replace("\\\"", "\"").replace("\\\\", "\\"))
        .unwrap_or_else(|| text.to_string());
    extracted.insert(PLAN_TEXT_FIELD.to_string(), Value::String(step_text));
    Value::Object(extracted)
}

fn extract_quoted_int(text: &str, field: &str) -> Option<i64> {
    let pattern = format!(r#""{field}"\s*:\s*"?(\d+)"?"#);
    let re = Regex::new(&pattern).ok()?;
    re.captures(text)?.get(1)?.as_str().parse().ok()
}

fn extract_bool(text: &str, field: &str) -> Option<bool> {
    let pattern = format!(r#"(?i)"{field}"\s*:\s*(true|false)"#);
    let re = Regex::new(&pattern).ok()?;
    Some(re.captures(text)?.get(1)?.as_str().eq_ignore_ascii_case("true"))
}

/// Numeric-looking values become integers: real numbers pass through,
/// strings yield their first embedded digit run ("1/10" gives 1).
fn coerce_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => DIGIT_RUN.find(s)?.as_str().parse().ok(),
        _ => None,
    }
}

/// Word booleans, including the CJK pair the engine falls back to.
fn coerce_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => Some(n.as_f64().map(|f| f != 0.0).unwrap_or(false)),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "1" | "t" | "y" | "是" => Some(true),
            "false" | "no" | "0" | "f" | "n" | "否" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plan_step_numeric_strings_become_integers() {
        let args = json!({"step": "analyze", "step_number": "3", "total_steps": "10 steps"});
        let out = coerce_args(tools::PLAN_STEP, args);
        assert_eq!(out["step_number"], 3);
        assert_eq!(out["total_steps"], 10);
    }

    #[test]
    fn plan_step_compound_counter_takes_first_digit_run() {
        let args = json!({"step": "x", "step_number": "1/10"});
        let out = coerce_args(tools::PLAN_STEP, args);
        assert_eq!(out["step_number"], 1);
    }

    #[test]
    fn plan_step_word_booleans_coerced() {
        for (word, expected) in [
            ("true", true),
            ("YES", true),
            ("1", true),
            ("是", true),
            ("false", false),
            ("no", false),
            ("0", false),
            ("否", false),
        ] {
            let args = json!({"step": "x", "more_steps_needed": word});
            let out = coerce_args(tools::PLAN_STEP, args.clone());
            assert_eq!(out["more_steps_needed"], expected, "word {word:?}");
        }
    }

    #[test]
    fn unrecognized_boolean_word_left_alone() {
        let args = json!({"step": "x", "is_revision": "perhaps"});
        let out = coerce_args(tools::PLAN_STEP, args);
        assert_eq!(out["is_revision"], "perhaps");
    }

    #[test]
    fn bare_text_wrapped_as_step() {
        let out = coerce_args(tools::PLAN_STEP, json!("think about the outline first"));
        assert_eq!(out, json!({"step": "think about the outline first"}));
    }

    #[test]
    fn truncated_plan_json_salvaged_by_scanner() {
        let raw = r#"{"step": "compare the two designs", "step_number": 2"#;
        let out = coerce_args(tools::PLAN_STEP, json!(raw));
        assert_eq!(out["step"], "compare the two designs");
        assert_eq!(out["step_number"], 2);
    }

    #[test]
    fn regex_salvage_when_braces_hopeless() {
        // Doubly mangled: not parseable even after closing, but the flat
        // shape is still visible.
        let raw = r#"{"step": "draft the summary", "step_number": "4", "more_steps_needed": true,,}"#;
        let out = coerce_args(tools::PLAN_STEP, json!(raw));
        assert_eq!(out["step_number"], 4);
        assert_eq!(out["more_steps_needed"], true);
        assert_eq!(out["step"], "draft the summary");
    }

    #[test]
    fn batch_list_wrapped_into_sections_mapping() {
        let args = json!([{"id": "1", "title": "Background"}]);
        let out = coerce_args(tools::BATCH_GENERATE_SECTIONS, args);
        assert_eq!(out["sections"][0]["title"], "Background");
    }

    #[test]
    fn unknown_tool_untouched() {
        let args = json!({"anything": "goes", "count": "3"});
        let out = coerce_args("delete_section", args.clone());
        assert_eq!(out, args);
    }
}
