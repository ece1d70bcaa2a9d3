use crate::expr::{Expr, Predicate};
use itertools::Itertools;

/// One AND-clause of a DNF: every positive predicate must hold and no
/// negative predicate may hold.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Conjunction {
    /// Predicates that must match.
    pub positive: Vec<Predicate>,
    /// Predicates that must not match.
    pub negative: Vec<Predicate>,
}

impl Conjunction {
    /// Evaluate this conjunction with `eval` deciding individual predicates.
    pub fn matches_with(&self, eval: &dyn Fn(&Predicate) -> bool) -> bool {
        self.positive.iter().all(|p| eval(p)) && !self.negative.iter().any(|p| eval(p))
    }

    fn merge(mut self, other: &Self) -> Self {
        self.positive.extend(other.positive.iter().cloned());
        self.negative.extend(other.negative.iter().cloned());
        self
    }
}

/// A boolean expression in disjunctive normal form: an OR of AND-clauses.
///
/// An empty branch list matches nothing.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Dnf {
    /// The OR branches.
    pub branches: Vec<Conjunction>,
}

impl Dnf {
    /// Evaluate the DNF with `eval` deciding individual predicates.
    pub fn matches_with(&self, eval: &dyn Fn(&Predicate) -> bool) -> bool {
        self.branches.iter().any(|b| b.matches_with(eval))
    }
}

/// Convert an arbitrary expression to DNF.
///
/// NOT is pushed through the connectives via De Morgan, AND is distributed
/// over OR, and nested connectives are flattened. Primitive predicates are
/// never rewritten. Conversion always terminates; the worst case is
/// exponential in the number of OR-terms under an AND, which is acceptable
/// for hand-written queries.
pub fn to_dnf(expr: &Expr) -> Dnf {
    Dnf {
        branches: convert(expr, false),
    }
}

fn convert(expr: &Expr, negated: bool) -> Vec<Conjunction> {
    match (expr, negated) {
        (Expr::Pred(p), false) => vec![Conjunction {
            positive: vec![p.clone()],
            negative: vec![],
        }],
        (Expr::Pred(p), true) => vec![Conjunction {
            positive: vec![],
            negative: vec![p.clone()],
        }],
        (Expr::Not(inner), negated) => convert(inner, !negated),
        // AND (or negated OR): distribute by cross product
        (Expr::And(terms), false) | (Expr::Or(terms), true) => terms
            .iter()
            .map(|t| convert(t, negated))
            .fold(vec![Conjunction::default()], |acc, branches| {
                acc.iter()
                    .cartesian_product(branches.iter())
                    .map(|(a, b)| a.clone().merge(b))
                    .collect()
            }),
        // OR (or negated AND): concatenate branches
        (Expr::Or(terms), false) | (Expr::And(terms), true) => terms
            .iter()
            .flat_map(|t| convert(t, negated))
            .collect(),
    }
}
