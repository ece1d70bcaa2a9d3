//! Runtime predicate evaluation: deciding whether one record matches a
//! predicate, expression, or DNF, without index help.
//!
//! Key/value predicates consult three sources in order: record attributes,
//! flat pairs extracted from the body, and structural JSON fields. All
//! matching is case-insensitive; ordering comparisons follow the dynamic
//! numeric-versus-lexicographic rules in [`predicate::compare_values`].

use crate::{fields, Tokenizer};
use data_types::Record;
use once_cell::unsync::OnceCell;
use predicate::{
    compare_values, CompareOp, Dnf, Expr, Predicate, Value, ValueMatch,
};
use std::collections::BTreeMap;

/// Lazily computed derived data for one record.
///
/// Tokenization, pair extraction, and JSON flattening each run at most once
/// no matter how many predicates the record is checked against.
pub(crate) struct RecordView<'a> {
    record: &'a Record,
    tokenizer: &'a dyn Tokenizer,
    tokens: OnceCell<Vec<String>>,
    kv: OnceCell<Vec<(String, String)>>,
    json: OnceCell<BTreeMap<String, String>>,
}

impl<'a> RecordView<'a> {
    pub(crate) fn new(record: &'a Record, tokenizer: &'a dyn Tokenizer) -> Self {
        Self {
            record,
            tokenizer,
            tokens: OnceCell::new(),
            kv: OnceCell::new(),
            json: OnceCell::new(),
        }
    }

    pub(crate) fn record(&self) -> &Record {
        self.record
    }

    fn tokens(&self) -> &[String] {
        self.tokens
            .get_or_init(|| self.tokenizer.tokenize(&self.record.raw))
    }

    fn kv_pairs(&self) -> &[(String, String)] {
        self.kv
            .get_or_init(|| self.tokenizer.kv_pairs(&self.record.raw))
    }

    fn json_fields(&self) -> &BTreeMap<String, String> {
        self.json.get_or_init(|| fields::json_fields(&self.record.raw))
    }

    /// All `(key, value)` candidates a key/value predicate can match.
    fn kv_candidates<'b>(&'b self) -> impl Iterator<Item = (&'b str, &'b str)> + 'b {
        self.record
            .attrs
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .chain(self.kv_pairs().iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .chain(self.json_fields().iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }

    /// Field lookup for scalar expressions: specials, then attributes, then
    /// extracted pairs, then JSON fields.
    fn field_value(&self, name: &str) -> Value {
        match name {
            "_raw" => {
                return Value::Str(String::from_utf8_lossy(&self.record.raw).into_owned());
            }
            "_write_ts" => return Value::Str(self.record.write_ts.to_rfc3339()),
            "_ingest_ts" => return Value::Str(self.record.ingest_ts.to_rfc3339()),
            "_source_ts" => {
                return match self.record.source_ts {
                    Some(t) => Value::Str(t.to_rfc3339()),
                    None => Value::Missing,
                };
            }
            _ => {}
        }

        for (k, v) in self.kv_candidates() {
            if k.eq_ignore_ascii_case(name) {
                return Value::Str(v.to_string());
            }
        }
        Value::Missing
    }

    pub(crate) fn matches_pred(&self, pred: &Predicate) -> bool {
        match pred {
            Predicate::Token { term } => {
                let term = term.to_lowercase();
                if self.tokenizer.is_indexable(&term) {
                    self.tokens().iter().any(|t| *t == term)
                } else {
                    String::from_utf8_lossy(&self.record.raw)
                        .to_lowercase()
                        .contains(&term)
                }
            }
            Predicate::Glob { pattern } => {
                if self.tokens().iter().any(|t| pattern.matches(t)) {
                    return true;
                }
                // the tokenizer splits on punctuation, so also try whole
                // whitespace-delimited words: `com*controller` should match
                // `com.example.controller`
                String::from_utf8_lossy(&self.record.raw)
                    .split_whitespace()
                    .any(|w| pattern.matches(w))
            }
            Predicate::Regex { pattern } => pattern.matches_bytes(&self.record.raw),
            Predicate::Kv { key, op, value } => self
                .kv_candidates()
                .any(|(k, v)| key.matches(k) && value_satisfies(*op, v, value)),
            Predicate::KeyExists { key } => {
                self.kv_candidates().any(|(k, _)| key.matches(k))
                    || self.json_path_exists(key)
            }
            Predicate::ValueExists { value } => {
                self.kv_candidates().any(|(_, v)| value.matches(v))
            }
            Predicate::Scalar { expr, op, value } => {
                let result = expr.eval(&|name| self.field_value(name));
                if result.is_missing() {
                    return false;
                }
                compare_values(*op, &result.render(), value)
            }
        }
    }

    /// Whether `key` names an existing JSON path, including interior object
    /// paths that flattening does not emit as leaves.
    fn json_path_exists(&self, key: &predicate::KeyMatch) -> bool {
        self.json_fields().keys().any(|leaf| {
            leaf_prefixes(leaf).any(|prefix| key.matches(prefix))
        })
    }

    pub(crate) fn matches_expr(&self, expr: &Expr) -> bool {
        match expr {
            Expr::And(terms) => terms.iter().all(|t| self.matches_expr(t)),
            Expr::Or(terms) => terms.iter().any(|t| self.matches_expr(t)),
            Expr::Not(inner) => !self.matches_expr(inner),
            Expr::Pred(p) => self.matches_pred(p),
        }
    }

    pub(crate) fn matches_dnf(&self, dnf: &Dnf) -> bool {
        dnf.matches_with(&|p| self.matches_pred(p))
    }
}

/// Dot-separated prefixes of a flattened JSON path: `a.b.c` yields `a`,
/// `a.b`, `a.b.c`.
fn leaf_prefixes(leaf: &str) -> impl Iterator<Item = &str> {
    leaf.char_indices()
        .filter_map(move |(i, c)| (c == '.').then(|| &leaf[..i]))
        .chain(std::iter::once(leaf))
}

pub(crate) fn value_satisfies(op: CompareOp, record_value: &str, value: &ValueMatch) -> bool {
    match (op, value) {
        (CompareOp::Eq, ValueMatch::Pattern(p)) => p.matches(record_value),
        (CompareOp::Ne, ValueMatch::Pattern(p)) => !p.matches(record_value),
        (op, ValueMatch::Literal(lit)) => compare_values(op, record_value, lit),
        // ordering against a wildcard value is meaningless
        _ => false,
    }
}

/// Evaluate one predicate against a record.
pub fn predicate_matches(pred: &Predicate, record: &Record, tokenizer: &dyn Tokenizer) -> bool {
    RecordView::new(record, tokenizer).matches_pred(pred)
}

/// Evaluate a boolean expression against a record.
pub fn expr_matches(expr: &Expr, record: &Record, tokenizer: &dyn Tokenizer) -> bool {
    RecordView::new(record, tokenizer).matches_expr(expr)
}

/// Evaluate a DNF against a record.
pub fn dnf_matches(dnf: &Dnf, record: &Record, tokenizer: &dyn Tokenizer) -> bool {
    RecordView::new(record, tokenizer).matches_dnf(dnf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenize::DefaultTokenizer;
    use data_types::{ChunkId, StoreId};
    use grebe_time::Time;
    use predicate::ScalarExpr;

    fn record(raw: &[u8], attrs: &[(&str, &str)]) -> Record {
        Record {
            write_ts: Time::from_timestamp(0, 0),
            ingest_ts: Time::from_timestamp(0, 0),
            source_ts: None,
            source_id: "src".to_string(),
            store_id: StoreId::new(),
            chunk_id: ChunkId::new(),
            position: 0,
            attrs: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            raw: raw.to_vec(),
        }
    }

    fn matches(pred: Predicate, rec: &Record) -> bool {
        predicate_matches(&pred, rec, &DefaultTokenizer::new())
    }

    #[test]
    fn token_match_is_case_insensitive() {
        let rec = record(b"ERROR: connect refused", &[]);
        assert!(matches(Predicate::token("error"), &rec));
        assert!(matches(Predicate::token("CONNECT"), &rec));
        assert!(!matches(Predicate::token("retry"), &rec));
    }

    #[test]
    fn non_indexable_token_uses_substring_search() {
        // "a.b" is not an indexable token, so substring matching applies
        let rec = record(b"path a.b.c hit", &[]);
        assert!(matches(Predicate::token("a.b"), &rec));
        assert!(!matches(Predicate::token("a.z"), &rec));
    }

    #[test]
    fn kv_checks_attrs_then_body_then_json() {
        let rec = record(
            br#"{"app":{"name":"api"},"level":"warn"}"#,
            &[("env", "prod")],
        );
        assert!(matches(Predicate::kv_eq("env", "prod").unwrap(), &rec));
        assert!(matches(Predicate::kv_eq("level", "warn").unwrap(), &rec));
        assert!(matches(Predicate::kv_eq("app.name", "api").unwrap(), &rec));
        assert!(!matches(Predicate::kv_eq("app.name", "web").unwrap(), &rec));

        let rec = record(b"level=warn msg=ok", &[]);
        assert!(matches(Predicate::kv_eq("level", "warn").unwrap(), &rec));
        assert!(!matches(Predicate::kv_eq("level", "error").unwrap(), &rec));
    }

    #[test]
    fn kv_numeric_comparison() {
        let rec = record(b"latency=250 status=ok", &[]);
        assert!(matches(
            Predicate::kv("latency", CompareOp::Gt, "99").unwrap(),
            &rec
        ));
        // lexicographically "250" < "99"; numeric comparison must win
        assert!(!matches(
            Predicate::kv("latency", CompareOp::Lt, "99").unwrap(),
            &rec
        ));
        // numeric query against non-numeric record value never matches
        assert!(!matches(
            Predicate::kv("status", CompareOp::Gt, "1").unwrap(),
            &rec
        ));
    }

    #[test]
    fn glob_falls_back_to_whitespace_words() {
        let rec = record(b"calling com.example.controller now", &[]);
        assert!(matches(Predicate::glob("com*controller").unwrap(), &rec));
        assert!(matches(Predicate::glob("call*").unwrap(), &rec));
        assert!(!matches(Predicate::glob("org*controller").unwrap(), &rec));
    }

    #[test]
    fn regex_runs_against_raw_bytes() {
        let rec = record(b"took 250ms", &[]);
        assert!(matches(Predicate::regex(r"\d+ms").unwrap(), &rec));
        assert!(!matches(Predicate::regex(r"\d+us").unwrap(), &rec));
    }

    #[test]
    fn key_exists_matches_json_interior_paths() {
        let rec = record(br#"{"app":{"name":"api"}}"#, &[("env", "prod")]);
        assert!(matches(Predicate::key_exists("env").unwrap(), &rec));
        assert!(matches(Predicate::key_exists("app.name").unwrap(), &rec));
        assert!(matches(Predicate::key_exists("app").unwrap(), &rec));
        assert!(!matches(Predicate::key_exists("db").unwrap(), &rec));
    }

    #[test]
    fn value_exists_checks_all_sources() {
        let rec = record(b"level=error", &[("env", "prod")]);
        assert!(matches(Predicate::value_exists("prod").unwrap(), &rec));
        assert!(matches(Predicate::value_exists("ERROR").unwrap(), &rec));
        assert!(!matches(Predicate::value_exists("warn").unwrap(), &rec));
    }

    #[test]
    fn scalar_predicate_evaluates_fields() {
        let rec = record(b"bytes=2048", &[]);
        let double = ScalarExpr::binary(
            predicate::ArithOp::Div,
            ScalarExpr::field("bytes"),
            ScalarExpr::literal(1024.0),
        );
        assert!(matches(Predicate::scalar(double.clone(), CompareOp::Eq, "2"), &rec));
        assert!(!matches(Predicate::scalar(double, CompareOp::Gt, "5"), &rec));

        // missing field -> no match, not an error
        let missing = ScalarExpr::field("absent");
        assert!(!matches(Predicate::scalar(missing, CompareOp::Eq, ""), &rec));
    }

    #[test]
    fn expr_and_dnf_agree() {
        let tokenizer = DefaultTokenizer::new();
        let rec = record(b"error while connecting", &[]);
        let expr = Expr::and(vec![
            Expr::pred(Predicate::token("error")),
            Expr::not(Expr::pred(Predicate::token("retry"))),
        ]);
        let dnf = predicate::to_dnf(&expr);
        assert!(expr_matches(&expr, &rec, &tokenizer));
        assert!(dnf_matches(&dnf, &rec, &tokenizer));
    }
}
