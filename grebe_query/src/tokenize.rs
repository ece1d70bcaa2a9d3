//! The default tokenization policy and flat key/value extraction.
//!
//! Production deployments supply their own [`Tokenizer`] matching whatever
//! the ingest side indexed; this implementation mirrors the common policy
//! (alphanumeric word runs, logfmt-style pairs) and keeps the engine and its
//! tests concrete.

use crate::Tokenizer;

const MAX_TOKEN_LEN: usize = 64;

/// Splits bodies into lowercase alphanumeric/underscore/dash runs and
/// extracts `key=value` pairs, bare or double-quoted.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTokenizer {}

impl DefaultTokenizer {
    /// Create the default policy.
    pub fn new() -> Self {
        Self::default()
    }
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

impl Tokenizer for DefaultTokenizer {
    fn tokenize(&self, raw: &[u8]) -> Vec<String> {
        let text = String::from_utf8_lossy(raw);
        text.split(|c: char| !is_token_char(c))
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect()
    }

    fn is_indexable(&self, token: &str) -> bool {
        let len = token.chars().count();
        (2..=MAX_TOKEN_LEN).contains(&len)
            && token.chars().all(is_token_char)
            // pure numbers are too high-cardinality to index
            && !token.chars().all(|c| c.is_ascii_digit())
    }

    fn kv_pairs(&self, raw: &[u8]) -> Vec<(String, String)> {
        let text = String::from_utf8_lossy(raw);
        let mut pairs = vec![];
        let mut rest = text.as_ref();

        while let Some(eq) = rest.find('=') {
            // the key is the token run immediately before '='
            let key_start = rest[..eq]
                .rfind(|c: char| !is_token_char(c))
                .map(|i| i + 1)
                .unwrap_or(0);
            let key = &rest[key_start..eq];
            let after = &rest[eq + 1..];

            if key.is_empty() {
                rest = after;
                continue;
            }

            let (value, consumed) = if let Some(stripped) = after.strip_prefix('"') {
                match stripped.find('"') {
                    Some(close) => (&stripped[..close], close + 2),
                    None => (stripped, after.len()),
                }
            } else {
                let end = after
                    .find(|c: char| c.is_whitespace())
                    .unwrap_or(after.len());
                (&after[..end], end)
            };

            if !value.is_empty() {
                pairs.push((key.to_string(), value.to_string()));
            }
            rest = &after[consumed.min(after.len())..];
        }

        pairs
    }
}
