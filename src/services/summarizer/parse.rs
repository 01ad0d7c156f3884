//! Tolerant decoding of model responses.
//!
//! Models wrap JSON in markdown fences, interleave prose, or emit literal
//! newlines inside strings. Decoding tries, in order: strict parse,
//! fence-stripped parse, first-object-substring parse, newline repair,
//! and finally regex field extraction. All failures collapse into one
//! error string; the caller treats it as an invalid (permanent) response.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static CODE_FENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```(?:json)?\s*([\s\S]*?)\s*```").unwrap());

static STRING_LITERAL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#""[^"]*""#).unwrap());

static SUMMARY_FIELD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?s)"summary_pt"\s*:\s*"((?:[^"\\]|\\.)*)""#).unwrap());

static ONE_LINE_FIELD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?s)"one_line_summary"\s*:\s*"((?:[^"\\]|\\.)*)""#).unwrap());

fn unescape_basic(s: &str) -> String {
    s.replace("\\n", "\n").replace("\\r", "\r").replace("\\\"", "\"")
}

/// Parse a JSON object out of a model response.
pub fn parse_json_response(content: &str) -> Result<Value, String> {
    // Strip a markdown code fence when present
    let content = CODE_FENCE_RE
        .captures(content)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(content);

    // Strict parse first
    if let Ok(value) = serde_json::from_str::<Value>(content) {
        if value.is_object() {
            return Ok(value);
        }
    }

    // Extract the first {...} substring
    let start = content.find('{');
    let end = content.rfind('}').map(|i| i + 1);
    let (start, end) = match (start, end) {
        (Some(s), Some(e)) if e > s => (s, e),
        _ => return Err("JSON object not found in response".to_string()),
    };
    let json_str = &content[start..end];

    if let Ok(value) = serde_json::from_str::<Value>(json_str) {
        return Ok(value);
    }

    // Repair literal newlines inside string literals
    let repaired = STRING_LITERAL_RE.replace_all(json_str, |caps: &regex::Captures| {
        caps[0].replace('\n', "\\n").replace('\r', "\\r")
    });
    if let Ok(value) = serde_json::from_str::<Value>(&repaired) {
        return Ok(value);
    }

    // Last resort: pull the two summary fields out by regex
    let summary = SUMMARY_FIELD_RE.captures(json_str).map(|c| unescape_basic(&c[1]));
    let one_line = ONE_LINE_FIELD_RE.captures(json_str).map(|c| unescape_basic(&c[1]));

    if let (Some(summary), Some(one_line)) = (summary, one_line) {
        return Ok(serde_json::json!({
            "summary_pt": summary,
            "one_line_summary": one_line,
        }));
    }

    let preview: String = json_str.chars().take(200).collect();
    Err(format!("Unable to parse JSON: {}...", preview))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_json_parses() {
        let value = parse_json_response(r#"{"summary_pt": "a", "one_line_summary": "b"}"#).unwrap();
        assert_eq!(value["summary_pt"], "a");
        assert_eq!(value["one_line_summary"], "b");
    }

    #[test]
    fn code_fences_are_stripped() {
        let content = "```json\n{\"summary_pt\": \"a\", \"one_line_summary\": \"b\"}\n```";
        let value = parse_json_response(content).unwrap();
        assert_eq!(value["summary_pt"], "a");
    }

    #[test]
    fn object_is_extracted_from_surrounding_prose() {
        let content = r#"Here is the summary you asked for:
{"summary_pt": "a", "one_line_summary": "b"}
Hope this helps!"#;
        let value = parse_json_response(content).unwrap();
        assert_eq!(value["one_line_summary"], "b");
    }

    #[test]
    fn literal_newlines_inside_strings_are_repaired() {
        let content = "{\"summary_pt\": \"line one\nline two\", \"one_line_summary\": \"b\"}";
        let value = parse_json_response(content).unwrap();
        assert_eq!(value["summary_pt"], "line one\nline two");
    }

    #[test]
    fn regex_salvage_recovers_fields() {
        // Unquoted garbage keeps every JSON parse failing
        let content = r#"{"summary_pt": "long text", "one_line_summary": "short", extra garbage}"#;
        let value = parse_json_response(content).unwrap();
        assert_eq!(value["summary_pt"], "long text");
        assert_eq!(value["one_line_summary"], "short");
    }

    #[test]
    fn hopeless_input_is_an_error() {
        assert!(parse_json_response("no json here at all").is_err());
        assert!(parse_json_response("{ broken").is_err());
    }
}
