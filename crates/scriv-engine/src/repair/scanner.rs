//! Lexical cleanup for machine-generated JSON.
//!
//! Everything here is an explicit scanner over a Normal/InString/Escaped
//! state machine rather than string replacement, so behavior on
//! adversarial input (brackets inside strings, trailing backslashes,
//! unterminated literals) stays predictable.

/// Strip enclosing Markdown code-fence markers.
pub(crate) fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = if let Some(rest) = trimmed.strip_prefix("```json") {
        rest
    } else if let Some(rest) = trimmed.strip_prefix("```") {
        rest
    } else {
        trimmed
    };
    let clean = clean.strip_suffix("```").unwrap_or(clean);
    clean.trim()
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Normal,
    InString,
    Escaped,
}

/// Remove trailing commas before `]` or `}` outside string literals.
pub(crate) fn strip_trailing_commas(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut state = ScanState::Normal;
    let chars: Vec<char> = text.chars().collect();

    for (i, &c) in chars.iter().enumerate() {
        match state {
            ScanState::Escaped => {
                state = ScanState::InString;
                out.push(c);
            }
            ScanState::InString => {
                match c {
                    '\\' => state = ScanState::Escaped,
                    '"' => state = ScanState::Normal,
                    _ => {}
                }
                out.push(c);
            }
            ScanState::Normal => {
                if c == '"' {
                    state = ScanState::InString;
                    out.push(c);
                    continue;
                }
                if c == ',' {
                    let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
                    if matches!(next, Some(']') | Some('}')) {
                        continue;
                    }
                }
                out.push(c);
            }
        }
    }
    out
}

/// Synthesize the minimal closing sequence for a truncated JSON
/// document: close an open string literal, then unwind the bracket stack.
pub(crate) fn close_truncated(text: &str) -> String {
    let mut stack: Vec<char> = Vec::new();
    let mut state = ScanState::Normal;

    for c in text.chars() {
        match state {
            ScanState::Escaped => state = ScanState::InString,
            ScanState::InString => match c {
                '\\' => state = ScanState::Escaped,
                '"' => state = ScanState::Normal,
                _ => {}
            },
            ScanState::Normal => match c {
                '"' => state = ScanState::InString,
                '{' => stack.push('}'),
                '[' => stack.push(']'),
                '}' | ']' => {
                    if stack.last() == Some(&c) {
                        stack.pop();
                    }
                }
                _ => {}
            },
        }
    }

    let mut out = text.to_string();
    if state != ScanState::Normal {
        // A trailing lone backslash would escape the closing quote.
        if state == ScanState::Escaped {
            out.pop();
        }
        out.push('"');
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}

/// Peel one layer of quote-wrapping: `"{\"k\": 1}"` becomes `{"k": 1}`.
/// Also handles a truncated wrapped payload (opening quote, no closing
/// quote) by unescaping and leaving closure to [`close_truncated`].
/// `None` when the text is not quote-wrapped.
pub(crate) fn unwrap_quote_layer(text: &str) -> Option<String> {
    let trimmed = text.trim();
    let quote = match trimmed.chars().next() {
        Some(q @ ('"' | '\'')) => q,
        _ => return None,
    };

    if trimmed.len() >= 2 && trimmed.ends_with(quote) {
        if quote == '"' {
            // A fully wrapped payload is itself a JSON string literal.
            if let Ok(inner) = serde_json::from_str::<String>(trimmed) {
                return Some(inner);
            }
        }
        let inner = decode_escapes(&trimmed[1..trimmed.len() - 1]);
        let inner_trimmed = inner.trim();
        if inner_trimmed.starts_with('{') || inner_trimmed.starts_with('[') {
            return Some(inner);
        }
        return None;
    }

    // Truncated wrapped payload: strip the opening quote when the
    // unescaped remainder looks like a JSON document.
    let inner = decode_escapes(&trimmed[quote.len_utf8()..]);
    let inner_trimmed = inner.trim();
    if inner_trimmed.starts_with('{') || inner_trimmed.starts_with('[') {
        return Some(inner);
    }
    None
}

/// Decode the two escapes quote-wrapping introduces.
fn decode_escapes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('"') => out.push('"'),
                Some('\\') => out.push('\\'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_fences_with_and_without_language() {
        assert_eq!(strip_code_fences("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_code_fences("```\n{}\n```"), "{}");
        assert_eq!(strip_code_fences("{\"a\": 1}"), "{\"a\": 1}");
    }

    #[test]
    fn trailing_commas_removed_outside_strings_only() {
        assert_eq!(strip_trailing_commas(r#"{"a": 1,}"#), r#"{"a": 1}"#);
        assert_eq!(strip_trailing_commas("[1, 2,\n]"), "[1, 2\n]");
        // A ",]" inside a string literal is data, not syntax.
        assert_eq!(strip_trailing_commas(r#"{"a": ",]"}"#), r#"{"a": ",]"}"#);
    }

    #[test]
    fn closes_truncated_object() {
        assert_eq!(close_truncated(r#"{"a": [1, 2"#), r#"{"a": [1, 2]}"#);
    }

    #[test]
    fn closes_truncated_string_then_brackets() {
        assert_eq!(close_truncated(r#"{"thought": "unfin"#), r#"{"thought": "unfin"}"#);
    }

    #[test]
    fn closers_inside_strings_do_not_pop_stack() {
        assert_eq!(close_truncated(r#"{"a": "}", "b": [1"#), r#"{"a": "}", "b": [1]}"#);
    }

    #[test]
    fn trailing_backslash_does_not_eat_synthesized_quote() {
        let closed = close_truncated(r#"{"a": "x\"#);
        assert!(serde_json::from_str::<serde_json::Value>(&closed).is_ok());
    }

    #[test]
    fn balanced_document_unchanged() {
        let text = r#"{"a": {"b": []}}"#;
        assert_eq!(close_truncated(text), text);
    }

    #[test]
    fn unwraps_full_quote_layer() {
        let wrapped = r#""{\"section_id\": \"2.1\"}""#;
        assert_eq!(unwrap_quote_layer(wrapped).unwrap(), r#"{"section_id": "2.1"}"#);
    }

    #[test]
    fn unwraps_truncated_quote_layer() {
        let wrapped = r#""{\"thought\": \"cut of"#;
        assert_eq!(unwrap_quote_layer(wrapped).unwrap(), r#"{"thought": "cut of"#);
    }

    #[test]
    fn plain_text_is_not_unwrapped() {
        assert!(unwrap_quote_layer("just words").is_none());
        assert!(unwrap_quote_layer("{\"already\": \"json\"}").is_none());
    }

    #[test]
    fn quoted_sentence_unwraps_to_its_text() {
        // The pipeline then treats the remainder as free text.
        assert_eq!(
            unwrap_quote_layer(r#""just a quoted sentence""#).unwrap(),
            "just a quoted sentence"
        );
    }
}
