use crate::expr::CompareOp;
use std::fmt;

/// A dynamically typed value produced by field lookups and expression
/// evaluation.
///
/// Attributes and query literals are strings at the boundary; numbers are
/// parsed lazily at comparison and arithmetic time.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A numeric value.
    Num(f64),
    /// A string value.
    Str(String),
    /// Absent field or failed evaluation. Aggregates skip missing inputs.
    Missing,
}

impl Value {
    /// Whether this is the missing value.
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }

    /// Numeric view: `Num` directly, `Str` through lazy parsing.
    pub fn as_num(&self) -> Option<f64> {
        match self {
            Self::Num(n) => Some(*n),
            Self::Str(s) => parse_num(s),
            Self::Missing => None,
        }
    }

    /// Render for output cells. Missing renders as the empty string.
    pub fn render(&self) -> String {
        match self {
            Self::Num(n) => format_num(*n),
            Self::Str(s) => s.clone(),
            Self::Missing => String::new(),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Num(n)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Num(n) => write!(f, "{}", format_num(*n)),
            Self::Str(s) => write!(f, "\"{}\"", s),
            Self::Missing => write!(f, "<missing>"),
        }
    }
}

/// Parse a numeric string. Leading/trailing whitespace is tolerated.
pub fn parse_num(s: &str) -> Option<f64> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Render a float the short way: integral values drop the fraction.
pub(crate) fn format_num(n: f64) -> String {
    if n == n.trunc() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// Arithmetic operators in scalar expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
}

impl fmt::Display for ArithOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
        };
        write!(f, "{}", s)
    }
}

/// An arithmetic expression over record fields, used by the `eval` operator,
/// aggregate arguments, and scalar predicates.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarExpr {
    /// Look up a field by name.
    Field(String),
    /// A constant.
    Literal(Value),
    /// A binary arithmetic operation.
    Binary {
        /// The operator.
        op: ArithOp,
        /// Left operand.
        lhs: Box<ScalarExpr>,
        /// Right operand.
        rhs: Box<ScalarExpr>,
    },
}

impl ScalarExpr {
    /// A field reference.
    pub fn field(name: impl Into<String>) -> Self {
        Self::Field(name.into())
    }

    /// A literal.
    pub fn literal(v: impl Into<Value>) -> Self {
        Self::Literal(v.into())
    }

    /// A binary operation.
    pub fn binary(op: ArithOp, lhs: ScalarExpr, rhs: ScalarExpr) -> Self {
        Self::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// Evaluate against a field lookup function.
    ///
    /// Type mismatches and division by zero produce [`Value::Missing`], never
    /// an error: evaluation failures must not fail a query.
    pub fn eval(&self, lookup: &dyn Fn(&str) -> Value) -> Value {
        match self {
            Self::Field(name) => lookup(name),
            Self::Literal(v) => v.clone(),
            Self::Binary { op, lhs, rhs } => {
                let (l, r) = match (lhs.eval(lookup).as_num(), rhs.eval(lookup).as_num()) {
                    (Some(l), Some(r)) => (l, r),
                    _ => return Value::Missing,
                };
                let out = match op {
                    ArithOp::Add => l + r,
                    ArithOp::Sub => l - r,
                    ArithOp::Mul => l * r,
                    ArithOp::Div => {
                        if r == 0.0 {
                            return Value::Missing;
                        }
                        l / r
                    }
                };
                Value::Num(out)
            }
        }
    }
}

impl fmt::Display for ScalarExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(name) => write!(f, "{}", name),
            Self::Literal(v) => match v {
                Value::Str(s) => write!(f, "\"{}\"", s),
                v => write!(f, "{}", v),
            },
            Self::Binary { op, lhs, rhs } => write!(f, "{}{}{}", lhs, op, rhs),
        }
    }
}

/// Compare a record value against a query value under `op`.
///
/// `=` and `!=` are case-insensitive string comparisons. The ordering
/// operators compare numerically when both sides parse as numbers; when the
/// query side is numeric but the record side is not, the record never
/// matches; otherwise the comparison is case-insensitive lexicographic.
pub fn compare_values(op: CompareOp, record: &str, query: &str) -> bool {
    match op {
        CompareOp::Eq => record.eq_ignore_ascii_case(query),
        CompareOp::Ne => !record.eq_ignore_ascii_case(query),
        CompareOp::Gt | CompareOp::Ge | CompareOp::Lt | CompareOp::Le => {
            let ord = match (parse_num(record), parse_num(query)) {
                (Some(r), Some(q)) => match r.partial_cmp(&q) {
                    Some(ord) => ord,
                    None => return false,
                },
                (None, Some(_)) => return false,
                _ => record.to_lowercase().cmp(&query.to_lowercase()),
            };
            match op {
                CompareOp::Gt => ord.is_gt(),
                CompareOp::Ge => ord.is_ge(),
                CompareOp::Lt => ord.is_lt(),
                CompareOp::Le => ord.is_le(),
                _ => unreachable!(),
            }
        }
    }
}
