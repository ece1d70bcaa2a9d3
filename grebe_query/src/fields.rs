//! Field materialization: deriving structured fields from raw record bodies
//! and merging them with record attributes.
//!
//! Materialization runs once, before record-phase pipeline operators, so
//! every operator sees the same field set. Attributes win on key collision:
//! the ingest side put them there deliberately.

use crate::Tokenizer;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// Common/combined access-log line shape.
static ACCESS_LOG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"^(\S+) \S+ (\S+) \[([^\]]+)\] "(\S+) (\S+)(?: (\S+))?" (\d{3}) (\S+)"#,
    )
    .expect("access log pattern compiles")
});

/// Flatten a JSON object in `raw` into dotted-path fields.
///
/// Scalars become strings; arrays contribute index segments. Returns an
/// empty map when `raw` is not a JSON object.
pub fn json_fields(raw: &[u8]) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if raw.iter().find(|b| !b.is_ascii_whitespace()) != Some(&b'{') {
        return out;
    }
    if let Ok(JsonValue::Object(obj)) = serde_json::from_slice::<JsonValue>(raw) {
        for (key, value) in obj {
            flatten(&key, &value, &mut out);
        }
    }
    out
}

fn flatten(path: &str, value: &JsonValue, out: &mut BTreeMap<String, String>) {
    match value {
        JsonValue::Object(obj) => {
            for (key, value) in obj {
                flatten(&format!("{}.{}", path, key), value, out);
            }
        }
        JsonValue::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                flatten(&format!("{}.{}", path, i), item, out);
            }
        }
        JsonValue::String(s) => {
            out.insert(path.to_string(), s.clone());
        }
        JsonValue::Number(n) => {
            out.insert(path.to_string(), n.to_string());
        }
        JsonValue::Bool(b) => {
            out.insert(path.to_string(), b.to_string());
        }
        JsonValue::Null => {}
    }
}

/// Fields parsed from an access-log shaped line, if `raw` looks like one.
pub fn access_log_fields(raw: &[u8]) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    let text = String::from_utf8_lossy(raw);
    if let Some(caps) = ACCESS_LOG_RE.captures(&text) {
        let mut put = |key: &str, idx: usize| {
            if let Some(m) = caps.get(idx) {
                out.insert(key.to_string(), m.as_str().to_string());
            }
        };
        put("remote_addr", 1);
        put("user", 2);
        put("time_local", 3);
        put("method", 4);
        put("path", 5);
        put("proto", 6);
        put("status", 7);
        put("bytes", 8);
    }
    out
}

/// Every field derivable from `raw`: flat key/value pairs, flattened JSON,
/// and access-log captures. Earlier extractors win within the extracted set.
pub fn extract(raw: &[u8], tokenizer: &dyn Tokenizer) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (key, value) in tokenizer.kv_pairs(raw) {
        out.entry(key).or_insert(value);
    }
    for (key, value) in json_fields(raw) {
        out.entry(key).or_insert(value);
    }
    for (key, value) in access_log_fields(raw) {
        out.entry(key).or_insert(value);
    }
    out
}

/// Merge extracted fields into `attrs`, with existing attributes winning.
pub fn materialize(attrs: &mut BTreeMap<String, String>, raw: &[u8], tokenizer: &dyn Tokenizer) {
    for (key, value) in extract(raw, tokenizer) {
        attrs.entry(key).or_insert(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenize::DefaultTokenizer;

    #[test]
    fn json_flattening() {
        let fields = json_fields(br#"{"app":{"name":"api","replicas":3},"ok":true}"#);
        assert_eq!(fields.get("app.name").map(String::as_str), Some("api"));
        assert_eq!(fields.get("app.replicas").map(String::as_str), Some("3"));
        assert_eq!(fields.get("ok").map(String::as_str), Some("true"));
    }

    #[test]
    fn json_arrays_use_index_segments() {
        let fields = json_fields(br#"{"tags":["a","b"]}"#);
        assert_eq!(fields.get("tags.0").map(String::as_str), Some("a"));
        assert_eq!(fields.get("tags.1").map(String::as_str), Some("b"));
    }

    #[test]
    fn non_json_bodies_yield_nothing() {
        assert!(json_fields(b"plain text log line").is_empty());
        assert!(json_fields(b"{not json").is_empty());
    }

    #[test]
    fn access_log_parsing() {
        let fields = access_log_fields(
            b"203.0.113.9 - frank [10/Oct/2000:13:55:36 -0700] \"GET /index.html HTTP/1.0\" 200 2326",
        );
        assert_eq!(fields.get("remote_addr").map(String::as_str), Some("203.0.113.9"));
        assert_eq!(fields.get("method").map(String::as_str), Some("GET"));
        assert_eq!(fields.get("path").map(String::as_str), Some("/index.html"));
        assert_eq!(fields.get("status").map(String::as_str), Some("200"));
        assert_eq!(fields.get("bytes").map(String::as_str), Some("2326"));
    }

    #[test]
    fn attrs_win_over_extracted_fields() {
        let tokenizer = DefaultTokenizer::new();
        let mut attrs: BTreeMap<String, String> =
            [("level".to_string(), "warn".to_string())].into_iter().collect();

        materialize(&mut attrs, b"level=error msg=boom", &tokenizer);

        assert_eq!(attrs.get("level").map(String::as_str), Some("warn"));
        assert_eq!(attrs.get("msg").map(String::as_str), Some("boom"));
    }
}
