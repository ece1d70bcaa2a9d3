use crate::{
    glob::{GlobPattern, PatternError, RegexPattern},
    value::ScalarExpr,
};
use std::fmt;

/// Comparison operators usable in key/value predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// `=`
    Eq,
    /// `!=`
    Ne,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `<`
    Lt,
    /// `<=`
    Le,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
        };
        write!(f, "{}", s)
    }
}

/// A key position in a key/value predicate: either an exact key or a glob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyMatch {
    /// Match the key exactly (case-insensitive).
    Literal(String),
    /// Match keys against a wildcard pattern.
    Pattern(GlobPattern),
}

impl KeyMatch {
    /// The literal key, when this match is not a pattern.
    pub fn as_literal(&self) -> Option<&str> {
        match self {
            Self::Literal(s) => Some(s),
            Self::Pattern(_) => None,
        }
    }

    /// Whether `key` satisfies this match.
    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Literal(s) => s.eq_ignore_ascii_case(key),
            Self::Pattern(p) => p.matches(key),
        }
    }
}

impl fmt::Display for KeyMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(s) => write!(f, "{}", s),
            Self::Pattern(p) => write!(f, "{}", p),
        }
    }
}

/// A value position in a key/value predicate: either an exact value or a
/// glob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueMatch {
    /// Match the value exactly (case-insensitive).
    Literal(String),
    /// Match values against a wildcard pattern.
    Pattern(GlobPattern),
}

impl ValueMatch {
    /// The literal value, when this match is not a pattern.
    pub fn as_literal(&self) -> Option<&str> {
        match self {
            Self::Literal(s) => Some(s),
            Self::Pattern(_) => None,
        }
    }

    /// Whether `value` satisfies this match.
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Self::Literal(s) => s.eq_ignore_ascii_case(value),
            Self::Pattern(p) => p.matches(value),
        }
    }
}

impl fmt::Display for ValueMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(s) => write!(f, "{}", s),
            Self::Pattern(p) => write!(f, "{}", p),
        }
    }
}

/// A primitive predicate, the leaves of a query expression.
///
/// Compiled glob/regex matchers live inside the variants; the planner and
/// DNF conversion treat predicates as opaque and never rewrite them.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// A bare word matched against tokenized record bodies.
    Token {
        /// The word, as written in the query.
        term: String,
    },
    /// A wildcard word match against record bodies.
    Glob {
        /// The compiled pattern.
        pattern: GlobPattern,
    },
    /// A regular expression over raw record bytes.
    Regex {
        /// The compiled pattern.
        pattern: RegexPattern,
    },
    /// `key <op> value`, checked against attributes, extracted fields, and
    /// structural JSON paths.
    Kv {
        /// The key side; dotted literal keys address JSON paths.
        key: KeyMatch,
        /// The comparison operator.
        op: CompareOp,
        /// The value side.
        value: ValueMatch,
    },
    /// `key=*`: the key exists with any value.
    KeyExists {
        /// The key side.
        key: KeyMatch,
    },
    /// `*=value`: any key carries this value.
    ValueExists {
        /// The value side.
        value: ValueMatch,
    },
    /// `expr(<arith>) <op> literal`, always evaluated at runtime.
    Scalar {
        /// The arithmetic left-hand side.
        expr: ScalarExpr,
        /// The comparison operator.
        op: CompareOp,
        /// The literal right-hand side.
        value: String,
    },
}

impl Predicate {
    /// A token predicate.
    pub fn token(term: impl Into<String>) -> Self {
        Self::Token { term: term.into() }
    }

    /// A glob predicate compiled from `pattern`.
    pub fn glob(pattern: &str) -> Result<Self, PatternError> {
        Ok(Self::Glob {
            pattern: GlobPattern::new(pattern)?,
        })
    }

    /// A regex predicate compiled from `pattern`.
    pub fn regex(pattern: &str) -> Result<Self, PatternError> {
        Ok(Self::Regex {
            pattern: RegexPattern::new(pattern)?,
        })
    }

    /// A `key <op> value` predicate. Wildcards in either side compile to
    /// glob matches.
    pub fn kv(key: &str, op: CompareOp, value: &str) -> Result<Self, PatternError> {
        Ok(Self::Kv {
            key: key_match(key)?,
            op,
            value: value_match(value)?,
        })
    }

    /// The common `key=value` case.
    pub fn kv_eq(key: &str, value: &str) -> Result<Self, PatternError> {
        Self::kv(key, CompareOp::Eq, value)
    }

    /// A `key=*` existence predicate.
    pub fn key_exists(key: &str) -> Result<Self, PatternError> {
        Ok(Self::KeyExists {
            key: key_match(key)?,
        })
    }

    /// A `*=value` existence predicate.
    pub fn value_exists(value: &str) -> Result<Self, PatternError> {
        Ok(Self::ValueExists {
            value: value_match(value)?,
        })
    }

    /// A scalar-expression comparison predicate.
    pub fn scalar(expr: ScalarExpr, op: CompareOp, value: impl Into<String>) -> Self {
        Self::Scalar {
            expr,
            op,
            value: value.into(),
        }
    }
}

fn key_match(key: &str) -> Result<KeyMatch, PatternError> {
    if key.contains(&['*', '?'][..]) {
        Ok(KeyMatch::Pattern(GlobPattern::new(key)?))
    } else {
        Ok(KeyMatch::Literal(key.to_string()))
    }
}

fn value_match(value: &str) -> Result<ValueMatch, PatternError> {
    if value.contains(&['*', '?'][..]) {
        Ok(ValueMatch::Pattern(GlobPattern::new(value)?))
    } else {
        Ok(ValueMatch::Literal(value.to_string()))
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Token { term } => write!(f, "{}", term),
            Self::Glob { pattern } => write!(f, "{}", pattern),
            Self::Regex { pattern } => write!(f, "/{}/", pattern),
            Self::Kv { key, op, value } => write!(f, "{}{}{}", key, op, value),
            Self::KeyExists { key } => write!(f, "{}=*", key),
            Self::ValueExists { value } => write!(f, "*={}", value),
            Self::Scalar { expr, op, value } => write!(f, "expr({}){}{}", expr, op, value),
        }
    }
}

/// A boolean query expression over [`Predicate`] leaves.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// All terms must match.
    And(Vec<Expr>),
    /// At least one term must match.
    Or(Vec<Expr>),
    /// The inner expression must not match.
    Not(Box<Expr>),
    /// A primitive predicate.
    Pred(Predicate),
}

impl Expr {
    /// Conjunction of `terms`.
    pub fn and(terms: Vec<Expr>) -> Self {
        Self::And(terms)
    }

    /// Disjunction of `terms`.
    pub fn or(terms: Vec<Expr>) -> Self {
        Self::Or(terms)
    }

    /// Negation of `inner`.
    pub fn not(inner: Expr) -> Self {
        Self::Not(Box::new(inner))
    }

    /// Lift a predicate into an expression.
    pub fn pred(p: Predicate) -> Self {
        Self::Pred(p)
    }
}

impl From<Predicate> for Expr {
    fn from(p: Predicate) -> Self {
        Self::Pred(p)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join(f: &mut fmt::Formatter<'_>, terms: &[Expr], sep: &str) -> fmt::Result {
            write!(f, "(")?;
            for (i, t) in terms.iter().enumerate() {
                if i > 0 {
                    write!(f, "{}", sep)?;
                }
                write!(f, "{}", t)?;
            }
            write!(f, ")")
        }

        match self {
            Self::And(terms) => join(f, terms, " AND "),
            Self::Or(terms) => join(f, terms, " OR "),
            Self::Not(inner) => write!(f, "NOT {}", inner),
            Self::Pred(p) => write!(f, "{}", p),
        }
    }
}
