use crate::expr::{CompareOp, Expr, KeyMatch, Predicate, ValueMatch};
use data_types::{ChunkId, StoreId};

/// Reserved key selecting stores.
pub const STORE_KEY: &str = "store";
/// Reserved key selecting chunks.
pub const CHUNK_KEY: &str = "chunk";

/// The result of reserved-predicate extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    /// Stores the query is restricted to; `None` means all stores.
    pub store_ids: Option<Vec<StoreId>>,
    /// Chunks the query is restricted to; `None` means all chunks.
    pub chunk_ids: Option<Vec<ChunkId>>,
    /// What is left of the expression once selectors are removed.
    pub expr: Option<Expr>,
}

/// Pull `store=<id>` / `chunk=<id>` selectors out of `expr`.
///
/// A selector is extracted when it appears as a bare top-level AND term, or
/// as an OR whose branches are all selectors for the same key. Selectors
/// under NOT, inside mixed ORs, or whose value does not parse as an ID are
/// left in place and evaluated later as ordinary key/value predicates.
/// Duplicate IDs are collapsed; order is preserved but not meaningful.
pub fn extract_reserved(expr: Expr) -> Extracted {
    let mut store_ids: Vec<StoreId> = vec![];
    let mut chunk_ids: Vec<ChunkId> = vec![];
    let mut kept: Vec<Expr> = vec![];

    for term in flatten_and(expr) {
        if extract_term(&term, &mut store_ids, &mut chunk_ids) {
            continue;
        }
        kept.push(term);
    }

    let expr = match kept.len() {
        0 => None,
        1 => Some(kept.into_iter().next().expect("one kept term")),
        _ => Some(Expr::And(kept)),
    };

    Extracted {
        store_ids: (!store_ids.is_empty()).then(|| store_ids),
        chunk_ids: (!chunk_ids.is_empty()).then(|| chunk_ids),
        expr,
    }
}

/// Recursively flatten nested ANDs into a single term list.
fn flatten_and(expr: Expr) -> Vec<Expr> {
    match expr {
        Expr::And(terms) => terms.into_iter().flat_map(flatten_and).collect(),
        other => vec![other],
    }
}

/// Attempt to consume `term` as a selector; returns whether it was consumed.
fn extract_term(term: &Expr, store_ids: &mut Vec<StoreId>, chunk_ids: &mut Vec<ChunkId>) -> bool {
    match term {
        Expr::Pred(p) => match reserved_value(p) {
            Some((key, value)) => record_id(key, value, store_ids, chunk_ids),
            None => false,
        },
        Expr::Or(branches) => {
            let mut pairs = Vec::with_capacity(branches.len());
            for b in branches {
                match b {
                    Expr::Pred(p) => match reserved_value(p) {
                        Some(pair) => pairs.push(pair),
                        None => return false,
                    },
                    _ => return false,
                }
            }

            // all branches must name the same reserved key, and every value
            // must parse, or the whole OR stays behind
            let Some((first_key, _)) = pairs.first() else { return false };
            if !pairs.iter().all(|(k, _)| k == first_key) {
                return false;
            }
            let parseable = match *first_key {
                STORE_KEY => pairs.iter().all(|(_, v)| v.parse::<StoreId>().is_ok()),
                _ => pairs.iter().all(|(_, v)| v.parse::<ChunkId>().is_ok()),
            };
            if !parseable {
                return false;
            }

            for (key, value) in pairs {
                record_id(key, value, store_ids, chunk_ids);
            }
            true
        }
        _ => false,
    }
}

/// The `(reserved-key, literal value)` pair of a selector-shaped predicate.
fn reserved_value(p: &Predicate) -> Option<(&'static str, &str)> {
    let Predicate::Kv {
        key: KeyMatch::Literal(key),
        op: CompareOp::Eq,
        value: ValueMatch::Literal(value),
    } = p
    else {
        return None;
    };

    if key.eq_ignore_ascii_case(STORE_KEY) {
        Some((STORE_KEY, value))
    } else if key.eq_ignore_ascii_case(CHUNK_KEY) {
        Some((CHUNK_KEY, value))
    } else {
        None
    }
}

fn record_id(
    key: &str,
    value: &str,
    store_ids: &mut Vec<StoreId>,
    chunk_ids: &mut Vec<ChunkId>,
) -> bool {
    match key {
        STORE_KEY => match value.parse::<StoreId>() {
            Ok(id) => {
                if !store_ids.contains(&id) {
                    store_ids.push(id);
                }
                true
            }
            Err(_) => false,
        },
        _ => match value.parse::<ChunkId>() {
            Ok(id) => {
                if !chunk_ids.contains(&id) {
                    chunk_ids.push(id);
                }
                true
            }
            Err(_) => false,
        },
    }
}
