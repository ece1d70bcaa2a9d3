use regex::Regex;
use snafu::{ResultExt, Snafu};
use std::fmt;

/// Errors from compiling surface-syntax patterns.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum PatternError {
    #[snafu(display("invalid glob pattern \"{}\": {}", pattern, source))]
    InvalidGlob {
        pattern: String,
        source: regex::Error,
    },

    #[snafu(display("invalid regular expression \"{}\": {}", pattern, source))]
    InvalidRegex {
        pattern: String,
        source: regex::Error,
    },
}

/// A compiled `*`/`?` wildcard pattern.
///
/// Matching is case-insensitive and anchored at both ends. The compiled form
/// is an implementation detail; equality and ordering go by source text so
/// predicates stay comparable.
#[derive(Clone)]
pub struct GlobPattern {
    source: String,
    re: Regex,
}

impl GlobPattern {
    /// Compile `pattern`, where `*` matches any run of characters and `?`
    /// matches exactly one.
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        let mut re = String::with_capacity(pattern.len() + 8);
        re.push_str("(?i)^");
        for c in pattern.chars() {
            match c {
                '*' => re.push_str(".*"),
                '?' => re.push('.'),
                c => re.push_str(&regex::escape(&c.to_string())),
            }
        }
        re.push('$');

        let re = Regex::new(&re).context(InvalidGlobSnafu { pattern })?;
        Ok(Self {
            source: pattern.to_string(),
            re,
        })
    }

    /// The pattern as written.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether the pattern contains any wildcard at all.
    pub fn has_wildcard(&self) -> bool {
        self.source.contains(&['*', '?'][..])
    }

    /// The maximal literal run before the first wildcard. Empty when the
    /// pattern starts with a wildcard.
    pub fn literal_prefix(&self) -> &str {
        match self.source.find(&['*', '?'][..]) {
            Some(idx) => &self.source[..idx],
            None => &self.source,
        }
    }

    /// Whether `candidate` matches the pattern.
    pub fn matches(&self, candidate: &str) -> bool {
        self.re.is_match(candidate)
    }
}

impl fmt::Debug for GlobPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("GlobPattern").field(&self.source).finish()
    }
}

impl fmt::Display for GlobPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl PartialEq for GlobPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for GlobPattern {}

/// A compiled regular expression predicate, matched against raw record
/// bytes. Equality goes by source text.
#[derive(Clone)]
pub struct RegexPattern {
    source: String,
    re: regex::bytes::Regex,
}

impl RegexPattern {
    /// Compile `pattern` as a byte-oriented regular expression.
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        let re = regex::bytes::Regex::new(pattern).context(InvalidRegexSnafu { pattern })?;
        Ok(Self {
            source: pattern.to_string(),
            re,
        })
    }

    /// The pattern as written.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether `raw` contains a match.
    pub fn matches_bytes(&self, raw: &[u8]) -> bool {
        self.re.is_match(raw)
    }
}

impl fmt::Debug for RegexPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RegexPattern").field(&self.source).finish()
    }
}

impl fmt::Display for RegexPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl PartialEq for RegexPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for RegexPattern {}
