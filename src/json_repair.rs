//! Recovery pipeline for malformed model JSON.
//!
//! Generator output is ostensibly JSON but in practice arrives truncated,
//! fenced in markdown, single-quoted, comma-damaged, or with raw newlines
//! inside string literals. Recovery is layered: extraction, sanitization,
//! and repair are each deterministic passes, and callers apply them as a
//! cascade of progressively heavier strategies. Every pass is idempotent
//! on input that is already well formed.

use std::sync::LazyLock;

use regex::Regex;

use crate::prelude::*;

/// A complete markdown fence, `json` tag optional.
static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(.*?)```").expect("fence regex")
});

/// An opening fence with no close, which happens when output is truncated.
static OPEN_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(.*)$").expect("open fence regex")
});

/// Pull the JSON payload out of a model response.
///
/// Takes the interior of a fenced block when one is present, then scans
/// from the first `[` or `{` with a bracket counter that respects string
/// literals and backslash escapes. A truncated payload gets its missing
/// closing brackets synthesized.
pub fn extract_json(response: &str) -> String {
    let body = FENCED_BLOCK
        .captures(response)
        .or_else(|| OPEN_FENCE.captures(response))
        .map(|captures| captures[1].to_owned())
        .unwrap_or_else(|| response.trim().to_owned());
    balanced_span(&body).unwrap_or(body)
}

/// The first balanced `[...]`/`{...}` span, with closers synthesized when
/// the input ends early. `None` when no bracket is present at all.
fn balanced_span(s: &str) -> Option<String> {
    let start = s.find(['[', '{'])?;
    let tail = &s[start..];

    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for (offset, c) in tail.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '[' => stack.push(']'),
            '{' => stack.push('}'),
            ']' | '}' => {
                stack.pop();
                if stack.is_empty() {
                    return Some(tail[..offset + c.len_utf8()].to_owned());
                }
            }
            _ => {}
        }
    }

    // Truncated: close anything still open.
    let mut out = tail.trim_end().to_owned();
    if escaped {
        out.pop();
    }
    if in_string {
        out.push('"');
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    Some(out)
}

/// Fix character-level damage inside a payload: raw control characters in
/// string literals become escapes, and single-quoted keys/values become
/// double-quoted.
pub fn sanitize(s: &str) -> String {
    requote_single_quotes(&escape_raw_control_chars(s))
}

/// JSON forbids literal newlines, carriage returns, and tabs inside string
/// literals; models emit them anyway.
fn escape_raw_control_chars(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if !in_string {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
            continue;
        }
        if escaped {
            escaped = false;
            out.push(c);
            continue;
        }
        match c {
            '\\' => {
                escaped = true;
                out.push(c);
            }
            '"' => {
                in_string = false;
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            '\r' => {
                out.push_str("\\n");
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
            }
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out
}

/// Best-effort conversion of single-quoted keys and values to
/// double-quoted ones. Only spans that open right after `:`/`,`/`[`/`{`
/// (or at the very start) and close on the same line are touched, so
/// apostrophes inside proper double-quoted strings are left alone.
fn requote_single_quotes(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut last_significant: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
                last_significant = Some('"');
            }
            i += 1;
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
                i += 1;
            }
            '\'' if matches!(last_significant, None | Some(':' | ',' | '[' | '{')) => {
                match scan_single_quoted(&chars, i) {
                    Some((body, end)) => {
                        out.push('"');
                        out.push_str(&body.replace('"', "\\\""));
                        out.push('"');
                        last_significant = Some('"');
                        i = end;
                    }
                    None => {
                        out.push(c);
                        i += 1;
                    }
                }
            }
            _ => {
                if !c.is_whitespace() {
                    last_significant = Some(c);
                }
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// Scan a single-quoted span starting at `start`. Returns the unquoted
/// body and the index just past the closing quote, or `None` if the span
/// doesn't close before a newline or the end of input.
fn scan_single_quoted(chars: &[char], start: usize) -> Option<(String, usize)> {
    let mut body = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' if i + 1 < chars.len() => {
                let next = chars[i + 1];
                if next == '\'' {
                    body.push('\'');
                } else {
                    body.push('\\');
                    body.push(next);
                }
                i += 2;
            }
            '\'' => return Some((body, i + 1)),
            '\n' => return None,
            c => {
                body.push(c);
                i += 1;
            }
        }
    }
    None
}

/// Structural comma repair: drop trailing commas before `]`/`}`, collapse
/// runs of commas, and insert commas between adjacent values where one is
/// plainly missing. String literals are never touched.
pub fn repair(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut last_significant: Option<char> = None;
    let mut ws_since_last = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
                last_significant = Some('"');
                ws_since_last = false;
            }
            i += 1;
            continue;
        }
        match c {
            '"' | '{' | '[' => {
                if value_ended(last_significant) {
                    out.push(',');
                }
                if c == '"' {
                    in_string = true;
                }
                out.push(c);
                last_significant = Some(c);
                ws_since_last = false;
                i += 1;
            }
            ',' => {
                let next = next_significant(&chars, i + 1);
                match next {
                    // Trailing comma before a closer, or the first of a
                    // run of commas: drop it.
                    Some(']' | '}' | ',') => {}
                    _ => {
                        out.push(c);
                        last_significant = Some(',');
                        ws_since_last = false;
                    }
                }
                i += 1;
            }
            c if c.is_whitespace() => {
                ws_since_last = true;
                out.push(c);
                i += 1;
            }
            c if ws_since_last
                && value_ended(last_significant)
                && (c.is_ascii_digit() || matches!(c, '-' | 't' | 'f' | 'n')) =>
            {
                // `1 2`, `"a" true`: adjacent scalars with the comma lost.
                // Requiring intervening whitespace keeps exponents like
                // `1e5` intact.
                out.push(',');
                out.push(c);
                last_significant = Some(c);
                ws_since_last = false;
                i += 1;
            }
            _ => {
                out.push(c);
                last_significant = Some(c);
                ws_since_last = false;
                i += 1;
            }
        }
    }
    out
}

/// Did the last significant character plausibly end a value?
fn value_ended(last: Option<char>) -> bool {
    match last {
        Some('"' | '}' | ']') => true,
        // Number or `true`/`false`/`null` endings.
        Some(c) => c.is_ascii_digit() || matches!(c, 'e' | 'l'),
        None => false,
    }
}

fn next_significant(chars: &[char], mut i: usize) -> Option<char> {
    while i < chars.len() {
        if !chars[i].is_whitespace() {
            return Some(chars[i]);
        }
        i += 1;
    }
    None
}

/// Strategy 1: extraction plus character-level sanitization.
pub fn strategy_extract(response: &str) -> String {
    sanitize(&extract_json(response))
}

/// Strategy 2: strategy 1 plus structural comma repair.
pub fn strategy_repair(response: &str) -> String {
    repair(&strategy_extract(response))
}

/// Strategy 3: sanitize and repair repeatedly until a fixpoint.
pub fn strategy_multipass(response: &str) -> String {
    let mut current = strategy_extract(response);
    for _ in 0..4 {
        let next = repair(&sanitize(&current));
        if next == current {
            break;
        }
        current = next;
    }
    current
}

/// Parse a model response as JSON, applying the recovery strategies in
/// order of increasing aggressiveness.
pub fn recover_json(response: &str) -> Result<Value> {
    let strategies: [(&str, fn(&str) -> String); 3] = [
        ("extract", strategy_extract),
        ("repair", strategy_repair),
        ("multi-pass", strategy_multipass),
    ];
    let mut last_error = None;
    for (name, strategy) in strategies {
        let candidate = strategy(response);
        match serde_json::from_str::<Value>(&candidate) {
            Ok(value) => {
                if name != "extract" {
                    debug!(strategy = name, "recovered malformed JSON");
                }
                return Ok(value);
            }
            Err(err) => last_error = Some(err),
        }
    }
    Err(anyhow!(last_error.expect("at least one strategy ran"))
        .context("response is not recoverable JSON"))
}

/// Parse a model response as a JSON array of strings, dropping blank
/// entries and requiring at least `min_items` of them.
pub fn parse_string_array(response: &str, min_items: usize) -> Result<Vec<String>> {
    let value = recover_json(response)?;
    let array = value
        .as_array()
        .with_context(|| format!("expected a JSON array, got: {}", value))?;
    let items: Vec<String> = array
        .iter()
        .filter_map(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .collect();
    if items.len() < min_items {
        bail!(
            "expected at least {} non-empty strings, found {}",
            min_items,
            items.len()
        );
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_from_fenced_block() {
        let response = "Sure, here you go:\n```json\n[\"a\", \"b\"]\n```\nHope that helps!";
        assert_eq!(extract_json(response), "[\"a\", \"b\"]");
    }

    #[test]
    fn test_extract_from_untagged_fence() {
        let response = "```\n{\"x\": 1}\n```";
        assert_eq!(extract_json(response), "{\"x\": 1}");
    }

    #[test]
    fn test_extract_skips_leading_prose() {
        let response = "The answer is: [\"a\"] and nothing else.";
        assert_eq!(extract_json(response), "[\"a\"]");
    }

    #[test]
    fn test_extract_ignores_brackets_inside_strings() {
        let response = r#"{"a": "one ] two"}"#;
        assert_eq!(extract_json(response), response);
    }

    #[test]
    fn test_extract_synthesizes_missing_closers() {
        assert_eq!(extract_json(r#"["a", "b""#), r#"["a", "b"]"#);
        assert_eq!(extract_json(r#"{"a": {"b": 1"#), r#"{"a": {"b": 1}}"#);
    }

    #[test]
    fn test_extract_closes_truncated_string() {
        assert_eq!(extract_json(r#"["a", "tru"#), r#"["a", "tru"]"#);
    }

    #[test]
    fn test_extract_with_truncated_fence() {
        let response = "```json\n[\"a\", \"b\"";
        assert_eq!(extract_json(response), "[\"a\", \"b\"]");
    }

    #[test]
    fn test_sanitize_escapes_raw_newlines() {
        let input = "{\"a\": \"line one\nline two\"}";
        let sanitized = sanitize(input);
        let value: Value = serde_json::from_str(&sanitized).unwrap();
        assert_eq!(value["a"], "line one\nline two");
    }

    #[test]
    fn test_sanitize_crlf_becomes_single_newline() {
        let input = "{\"a\": \"x\r\ny\"}";
        let value: Value = serde_json::from_str(&sanitize(input)).unwrap();
        assert_eq!(value["a"], "x\ny");
    }

    #[test]
    fn test_sanitize_requotes_single_quoted_values() {
        let input = "{'a': 'it\\'s fine', 'b': 2}";
        let value: Value = serde_json::from_str(&sanitize(input)).unwrap();
        assert_eq!(value, json!({"a": "it's fine", "b": 2}));
    }

    #[test]
    fn test_sanitize_leaves_apostrophes_in_double_quotes() {
        let input = r#"{"a": "it's fine", "b": "say: 'hi', ok"}"#;
        assert_eq!(sanitize(input), input);
    }

    #[test]
    fn test_repair_removes_trailing_commas() {
        assert_eq!(repair(r#"["a", "b",]"#), r#"["a", "b"]"#);
        assert_eq!(repair(r#"{"a": 1,}"#), r#"{"a": 1}"#);
    }

    #[test]
    fn test_repair_collapses_consecutive_commas() {
        let value: Value = serde_json::from_str(&repair(r#"["a",, "b",,, "c"]"#)).unwrap();
        assert_eq!(value, json!(["a", "b", "c"]));
    }

    #[test]
    fn test_repair_inserts_missing_commas() {
        let value: Value = serde_json::from_str(&repair(r#"["a" "b" "c"]"#)).unwrap();
        assert_eq!(value, json!(["a", "b", "c"]));
        let value: Value =
            serde_json::from_str(&repair(r#"[{"a": 1} {"a": 2}]"#)).unwrap();
        assert_eq!(value, json!([{"a": 1}, {"a": 2}]));
        let value: Value = serde_json::from_str(&repair("[1 2 true]")).unwrap();
        assert_eq!(value, json!([1, 2, true]));
    }

    #[test]
    fn test_repair_leaves_commas_inside_strings_alone() {
        let input = r#"{"a": ",,]", "b": " , "}"#;
        assert_eq!(repair(input), input);
    }

    #[test]
    fn test_repair_keeps_exponents_intact() {
        let input = r#"{"a": 1e5, "b": 2.5e-3}"#;
        assert_eq!(repair(input), input);
    }

    #[test]
    fn test_passes_are_idempotent_on_well_formed_input() {
        let input = r#"{"a": [1, 2.5e-3, true, null], "b": {"c": "d ] e"}}"#;
        assert_eq!(extract_json(input), input);
        assert_eq!(sanitize(input), input);
        assert_eq!(repair(input), input);
        // And on their own output.
        let once = strategy_multipass(input);
        assert_eq!(strategy_multipass(&once), once);
    }

    #[test]
    fn test_repair_of_valid_json_parses_to_equal_value() {
        let inputs = [
            r#"{"a": 1}"#,
            r#"[1, -2, 3.5, 1e5]"#,
            r#"{"nested": {"list": ["x", "y"], "flag": false}}"#,
            r#""just a string with {braces} and 'quotes'""#,
        ];
        for input in inputs {
            let original: Value = serde_json::from_str(input).unwrap();
            let repaired: Value =
                serde_json::from_str(&repair(&sanitize(input))).unwrap();
            assert_eq!(original, repaired, "for input {:?}", input);
        }
    }

    #[test]
    fn test_cascade_recovers_trailing_comma_with_raw_newline() {
        // Strategy 1 (extract + sanitize) fixes the newline but not the
        // comma; strategy 2 must finish the job.
        let response = "{\"clarity\": {\"score\": 4, \"reasoning\": \"good\nenough\"},}";
        assert!(serde_json::from_str::<Value>(&strategy_extract(response)).is_err());
        assert!(serde_json::from_str::<Value>(&strategy_repair(response)).is_ok());
        let value = recover_json(response).unwrap();
        assert_eq!(value["clarity"]["score"], 4);
    }

    #[test]
    fn test_recover_gives_up_on_hopeless_input() {
        assert!(recover_json("no json here at all").is_err());
    }

    #[test]
    fn test_parse_string_array() {
        let items = parse_string_array(r#"["a", " b ", "", "  "]"#, 2).unwrap();
        assert_eq!(items, vec!["a".to_owned(), "b".to_owned()]);
        assert!(parse_string_array(r#"["a"]"#, 2).is_err());
        assert!(parse_string_array(r#"{"a": 1}"#, 1).is_err());
    }

    #[test]
    fn test_parse_string_array_from_fenced_response() {
        let response = "Here are the items:\n```json\n[\"alpha\", \"beta\",]\n```";
        let items = parse_string_array(response, 2).unwrap();
        assert_eq!(items, vec!["alpha".to_owned(), "beta".to_owned()]);
    }
}
