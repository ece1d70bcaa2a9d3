//! Filter-set derivation: splitting one DNF conjunction into index
//! acceleration hints and a residual runtime filter.
//!
//! Only positive, literal-shaped predicates can use an index. Everything
//! else — negatives, regexes, scalar expressions, wildcard keys — lands in
//! the residual set, and the scanner appends further fallbacks when a hinted
//! lookup turns out to be unavailable or inconclusive.

use predicate::{CompareOp, Conjunction, GlobPattern, KeyMatch, Predicate, ValueMatch};

/// A predicate to evaluate per record at runtime.
#[derive(Debug, Clone)]
pub(crate) struct RuntimePred {
    /// Matching records are dropped instead of kept.
    pub negated: bool,
    /// The predicate.
    pub pred: Predicate,
}

/// The index lookup shapes the scanner knows how to execute.
#[derive(Debug, Clone)]
pub(crate) enum Lookup {
    /// Exact token lookup. A miss is definitive when the tokenizer would
    /// have indexed the term.
    Token {
        /// Lowercased term.
        term: String,
    },
    /// Token prefix lookup producing glob candidates; the glob itself is
    /// always re-verified at runtime.
    TokenPrefix {
        /// Lowercased literal prefix of the glob.
        prefix: String,
    },
    /// `key=value` across the attribute, body, and JSON path-value indexes.
    KvEq {
        /// Lowercased key.
        key: String,
        /// Lowercased value.
        value: String,
    },
    /// Key existence across the attribute, body, and JSON path indexes.
    Key {
        /// Lowercased key.
        key: String,
    },
    /// Value existence across the attribute and body value indexes.
    Value {
        /// Lowercased value.
        value: String,
    },
}

/// One index acceleration opportunity.
#[derive(Debug, Clone)]
pub(crate) struct IndexHint {
    /// The lookup to attempt.
    pub lookup: Lookup,
    /// Predicate to fall back to at runtime when the lookup is unavailable
    /// or inconclusive. `None` when the residual set already re-checks the
    /// originating predicate.
    pub fallback: Option<Predicate>,
}

/// The derived filter set of one conjunction.
#[derive(Debug, Clone, Default)]
pub(crate) struct ConjunctionFilters {
    /// Index lookups, one per accelerable positive predicate.
    pub hints: Vec<IndexHint>,
    /// Runtime predicates that always apply.
    pub residual: Vec<RuntimePred>,
}

/// Split `conj` into acceleration hints and residual runtime predicates.
pub(crate) fn derive(conj: &Conjunction) -> ConjunctionFilters {
    let mut out = ConjunctionFilters::default();

    for pred in &conj.positive {
        match pred {
            Predicate::Token { term } => {
                out.hints.push(IndexHint {
                    lookup: Lookup::Token {
                        term: term.to_lowercase(),
                    },
                    fallback: Some(pred.clone()),
                });
            }
            Predicate::Glob { pattern } => {
                if let Some(hint) = glob_hint(pattern) {
                    out.hints.push(hint);
                }
                // prefix candidates over-approximate; globs always re-verify
                out.residual.push(RuntimePred {
                    negated: false,
                    pred: pred.clone(),
                });
            }
            Predicate::Kv {
                key: KeyMatch::Literal(key),
                op: CompareOp::Eq,
                value: ValueMatch::Literal(value),
            } => {
                out.hints.push(IndexHint {
                    lookup: Lookup::KvEq {
                        key: key.to_lowercase(),
                        value: value.to_lowercase(),
                    },
                    fallback: Some(pred.clone()),
                });
            }
            Predicate::Kv {
                key: KeyMatch::Literal(key),
                ..
            } => {
                // non-equality or wildcard-valued: the key must still exist,
                // which an index can prove; the value check is runtime-only
                out.hints.push(IndexHint {
                    lookup: Lookup::Key {
                        key: key.to_lowercase(),
                    },
                    fallback: None,
                });
                out.residual.push(RuntimePred {
                    negated: false,
                    pred: pred.clone(),
                });
            }
            Predicate::KeyExists {
                key: KeyMatch::Literal(key),
            } => {
                out.hints.push(IndexHint {
                    lookup: Lookup::Key {
                        key: key.to_lowercase(),
                    },
                    fallback: Some(pred.clone()),
                });
            }
            Predicate::ValueExists {
                value: ValueMatch::Literal(value),
            } => {
                out.hints.push(IndexHint {
                    lookup: Lookup::Value {
                        value: value.to_lowercase(),
                    },
                    fallback: Some(pred.clone()),
                });
            }
            // wildcard keys, regexes, scalar expressions: runtime only
            Predicate::Kv { .. }
            | Predicate::KeyExists { .. }
            | Predicate::ValueExists { .. }
            | Predicate::Regex { .. }
            | Predicate::Scalar { .. } => {
                out.residual.push(RuntimePred {
                    negated: false,
                    pred: pred.clone(),
                });
            }
        }
    }

    for pred in &conj.negative {
        out.residual.push(RuntimePred {
            negated: true,
            pred: pred.clone(),
        });
    }

    out
}

fn glob_hint(pattern: &GlobPattern) -> Option<IndexHint> {
    let prefix = pattern.literal_prefix();
    if prefix.is_empty() {
        return None;
    }
    Some(IndexHint {
        lookup: Lookup::TokenPrefix {
            prefix: prefix.to_lowercase(),
        },
        fallback: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use predicate::to_dnf;
    use predicate::Expr;

    fn filters_for(expr: Expr) -> ConjunctionFilters {
        let dnf = to_dnf(&expr);
        assert_eq!(dnf.branches.len(), 1, "test expression must be one branch");
        derive(&dnf.branches[0])
    }

    #[test]
    fn tokens_and_kv_become_hints() {
        let f = filters_for(Expr::and(vec![
            Expr::pred(Predicate::token("Error")),
            Expr::pred(Predicate::kv_eq("Level", "Warn").unwrap()),
        ]));

        assert_eq!(f.hints.len(), 2);
        assert!(f.residual.is_empty());
        assert!(matches!(
            &f.hints[0].lookup,
            Lookup::Token { term } if term == "error"
        ));
        assert!(matches!(
            &f.hints[1].lookup,
            Lookup::KvEq { key, value } if key == "level" && value == "warn"
        ));
    }

    #[test]
    fn glob_gets_prefix_hint_and_runtime_verify() {
        let f = filters_for(Expr::pred(Predicate::glob("Con*ler").unwrap()));
        assert_eq!(f.hints.len(), 1);
        assert!(matches!(
            &f.hints[0].lookup,
            Lookup::TokenPrefix { prefix } if prefix == "con"
        ));
        assert!(f.hints[0].fallback.is_none());
        assert_eq!(f.residual.len(), 1);
    }

    #[test]
    fn prefixless_glob_is_runtime_only() {
        let f = filters_for(Expr::pred(Predicate::glob("*ler").unwrap()));
        assert!(f.hints.is_empty());
        assert_eq!(f.residual.len(), 1);
    }

    #[test]
    fn non_eq_kv_narrows_by_key_and_verifies_value() {
        let f = filters_for(Expr::pred(
            Predicate::kv("latency", CompareOp::Gt, "100").unwrap(),
        ));
        assert_eq!(f.hints.len(), 1);
        assert!(matches!(&f.hints[0].lookup, Lookup::Key { key } if key == "latency"));
        assert!(f.hints[0].fallback.is_none());
        assert_eq!(f.residual.len(), 1);
    }

    #[test]
    fn negatives_and_regexes_are_residual() {
        let f = filters_for(Expr::and(vec![
            Expr::not(Expr::pred(Predicate::token("debug"))),
            Expr::pred(Predicate::regex(r"\d+ms").unwrap()),
        ]));
        assert!(f.hints.is_empty());
        assert_eq!(f.residual.len(), 2);
        assert_eq!(
            f.residual.iter().filter(|r| r.negated).count(),
            1
        );
    }

    #[test]
    fn wildcard_key_is_runtime_only() {
        let f = filters_for(Expr::pred(Predicate::kv_eq("app.*", "api").unwrap()));
        assert!(f.hints.is_empty());
        assert_eq!(f.residual.len(), 1);
    }
}
