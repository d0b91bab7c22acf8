//! Interpretation of individual transcript records.
//!
//! A transcript line is one JSON object. Fields are read leniently: a record
//! may carry any combination of `timestamp`, `role`, `content`, `usage` and
//! `tool_calls`, and unknown fields are ignored.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use termhub_core::{ContextState, FileInfo};

/// Parse one line into a record object.
pub fn parse_line(line: &[u8]) -> Result<Map<String, Value>, String> {
    match serde_json::from_slice::<Value>(line) {
        Ok(Value::Object(record)) => Ok(record),
        Ok(other) => Err(format!("expected a JSON object, found {}", json_type(&other))),
        Err(e) => Err(e.to_string()),
    }
}

/// Fold `record` into `state`. `percentage` is not recomputed here.
pub fn apply_record(state: &mut ContextState, record: &Map<String, Value>, file_tokens: u64) {
    let now = Utc::now();
    state.records_parsed += 1;
    state.last_updated = Some(
        record
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
            .unwrap_or(now),
    );

    let role = record.get("role").and_then(Value::as_str);
    if let Some(role @ ("user" | "assistant")) = role {
        state.messages_count += 1;
        state.last_role = Some(role.to_string());
    }

    state.last_record_kind = Some(
        record
            .get("type")
            .and_then(Value::as_str)
            .or(role)
            .unwrap_or("record")
            .to_string(),
    );

    if let Some(usage) = record.get("usage").and_then(Value::as_object) {
        let total = usage.get("total_tokens").and_then(Value::as_u64).or_else(|| {
            let prompt = usage.get("prompt_tokens").and_then(Value::as_u64);
            let completion = usage.get("completion_tokens").and_then(Value::as_u64);
            match (prompt, completion) {
                (None, None) => None,
                (p, c) => Some(p.unwrap_or(0) + c.unwrap_or(0)),
            }
        });
        if let Some(total) = total {
            state.token_count = total;
        }
    }

    if let Some(calls) = record.get("tool_calls").and_then(Value::as_array) {
        for call in calls {
            if call.get("tool_name").and_then(Value::as_str) != Some("read_file") {
                continue;
            }
            let Some(path) = call
                .get("arguments")
                .and_then(|args| args.get("path"))
                .and_then(Value::as_str)
            else {
                continue;
            };
            if state.files_loaded.iter().any(|f| f.path == path) {
                continue;
            }
            state.files_loaded.push(FileInfo {
                path: path.to_string(),
                tokens: file_tokens,
                loaded_at: now,
                size_bytes: None,
            });
        }
    }

    if let Some(content) = record.get("content").map(content_text) {
        let lower = content.to_lowercase();
        if lower.contains("/compact") || lower.contains("compacted") {
            state.last_compact = Some(now);
            state.files_loaded.clear();
        }
        if lower.contains("/clear") {
            state.token_count = 0;
            state.files_loaded.clear();
        }
    }
}

/// `content` is either a string or a list of blocks with `text` fields.
fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.as_str().or_else(|| b.get("text").and_then(Value::as_str)))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// RFC 3339, or a naive `YYYY-MM-DDTHH:MM:SS[.fff]` taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};
    use termhub_core::SessionId;

    fn state() -> ContextState {
        ContextState::new(SessionId::from("s"), 200_000)
    }

    fn apply(state: &mut ContextState, line: &str) {
        let record = parse_line(line.as_bytes()).unwrap();
        apply_record(state, &record, 1000);
    }

    #[test]
    fn test_conversation_records() {
        let mut s = state();
        for line in [
            r#"{"timestamp": "2024-01-01T12:00:00", "role": "user", "content": "hello"}"#,
            r#"{"usage": {"total_tokens": 150}}"#,
            r#"{"tool_calls": [{"tool_name": "read_file", "arguments": {"path": "/test.py"}}]}"#,
            r#"{"role": "assistant", "content": "I'll help with that"}"#,
        ] {
            apply(&mut s, line);
        }
        assert_eq!(s.token_count, 150);
        assert_eq!(s.messages_count, 2);
        assert_eq!(s.last_role.as_deref(), Some("assistant"));
        assert_eq!(s.files_loaded.len(), 1);
        assert_eq!(s.files_loaded[0].path, "/test.py");
        assert_eq!(s.files_loaded[0].tokens, 1000);
        assert_eq!(s.records_parsed, 4);

        apply(&mut s, r#"{"content": "Context compacted successfully"}"#);
        assert!(s.last_compact.is_some());
        assert!(s.files_loaded.is_empty());
        assert_eq!(s.last_record_kind.as_deref(), Some("record"));
    }

    #[test]
    fn test_usage_falls_back_to_prompt_plus_completion() {
        let mut s = state();
        apply(&mut s, r#"{"usage": {"prompt_tokens": 100, "completion_tokens": 20}}"#);
        assert_eq!(s.token_count, 120);
        apply(&mut s, r#"{"usage": {"cache_hits": 3}}"#);
        assert_eq!(s.token_count, 120);
    }

    #[test]
    fn test_duplicate_file_loaded_once_and_clear() {
        let mut s = state();
        let read = r#"{"tool_calls": [{"tool_name": "read_file", "arguments": {"path": "/a.rs"}},
                                      {"tool_name": "write_file", "arguments": {"path": "/b.rs"}}]}"#;
        apply(&mut s, read);
        apply(&mut s, read);
        assert_eq!(s.files_loaded.len(), 1);

        apply(&mut s, r#"{"usage": {"total_tokens": 900}}"#);
        apply(&mut s, r#"{"type": "command", "content": "/clear"}"#);
        assert_eq!(s.token_count, 0);
        assert!(s.files_loaded.is_empty());
        assert_eq!(s.last_record_kind.as_deref(), Some("command"));
    }

    #[test]
    fn test_content_blocks() {
        let mut s = state();
        apply(
            &mut s,
            r#"{"role": "user", "content": [{"type": "text", "text": "please /compact"}]}"#,
        );
        assert!(s.last_compact.is_some());
    }

    #[test]
    fn test_non_object_lines_are_errors() {
        assert!(parse_line(b"[1, 2]").unwrap_err().contains("an array"));
        assert!(parse_line(b"42").is_err());
        assert!(parse_line(b"{not json").is_err());
    }

    #[test]
    fn test_timestamps() {
        let naive = parse_timestamp("2024-01-01T12:00:00").unwrap();
        assert_eq!((naive.year(), naive.hour()), (2024, 12));
        let zoned = parse_timestamp("2024-01-01T12:00:00+02:00").unwrap();
        assert_eq!(zoned.hour(), 10);
        assert!(parse_timestamp("yesterday").is_none());

        let mut s = state();
        apply(&mut s, r#"{"timestamp": "2024-01-01T12:00:00.250", "role": "user"}"#);
        assert_eq!(s.last_updated.unwrap().year(), 2024);
    }
}
