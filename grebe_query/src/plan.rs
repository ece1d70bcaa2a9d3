//! Query normalization and the explain plan.
//!
//! Normalization happens once per call: time bounds are ordered, an
//! inverted range flips the query into reverse, and reserved
//! `store=`/`chunk=` selectors are pulled out of the expression. Everything
//! downstream works off the [`NormalizedQuery`].

use crate::{pruning::SelectionBounds, Query};
use data_types::{ChunkId, RecordRef, StoreId};
use grebe_time::Time;
use predicate::{extract_reserved, to_dnf, Dnf, Expr};
use std::fmt;

/// A [`Query`] after bound ordering and reserved-predicate extraction.
#[derive(Debug, Clone)]
pub(crate) struct NormalizedQuery {
    pub bounds: SelectionBounds,
    pub reverse: bool,
    pub limit: Option<usize>,
    pub store_ids: Option<Vec<StoreId>>,
    pub chunk_ids: Option<Vec<ChunkId>>,
    pub expr: Option<Expr>,
    pub dnf: Option<Dnf>,
    pub pos: Option<RecordRef>,
}

impl NormalizedQuery {
    /// Drop the filter expression, keeping bounds and direction. Used by
    /// the follow phase of `search_then_follow`.
    pub fn without_filter(&self) -> Self {
        Self {
            expr: None,
            dnf: None,
            ..self.clone()
        }
    }
}

/// Normalize `query`.
pub(crate) fn normalize(query: &Query) -> NormalizedQuery {
    let (lower, upper, inverted) = order_bounds(query.start, query.end);
    let (ingest_lower, ingest_upper, _) = order_bounds(query.ingest_start, query.ingest_end);
    let (source_lower, source_upper, _) = order_bounds(query.source_start, query.source_end);

    let extracted = match query.expr.clone() {
        Some(expr) => extract_reserved(expr),
        None => predicate::Extracted {
            store_ids: None,
            chunk_ids: None,
            expr: None,
        },
    };

    let dnf = extracted.expr.as_ref().map(to_dnf);

    NormalizedQuery {
        bounds: SelectionBounds {
            lower,
            upper,
            ingest_lower,
            ingest_upper,
            source_lower,
            source_upper,
        },
        reverse: query.reverse || inverted,
        limit: query.limit,
        store_ids: extracted.store_ids,
        chunk_ids: extracted.chunk_ids,
        expr: extracted.expr,
        dnf,
        pos: query.pos,
    }
}

/// Order a `(start, end)` pair into `[lower, upper)`; reports whether the
/// caller wrote them inverted.
fn order_bounds(start: Option<Time>, end: Option<Time>) -> (Option<Time>, Option<Time>, bool) {
    match (start, end) {
        (Some(s), Some(e)) if e < s => (Some(e), Some(s), true),
        (start, end) => (start, end, false),
    }
}

/// How the scanner will read one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanAction {
    /// The chunk is provably free of matches and will not be opened.
    Skip,
    /// Seek exactly the index-provided positions.
    Positional {
        /// How many positions will be visited.
        positions: usize,
    },
    /// Walk the chunk record by record.
    Sequential,
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skip => write!(f, "skip"),
            Self::Positional { positions } => {
                write!(f, "positional scan over {} positions", positions)
            }
            Self::Sequential => write!(f, "sequential scan"),
        }
    }
}

/// The per-chunk portion of a [`QueryPlan`].
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    /// The store the chunk belongs to.
    pub store_id: StoreId,
    /// The chunk.
    pub chunk_id: ChunkId,
    /// Whether the chunk is sealed.
    pub sealed: bool,
    /// The chosen scan strategy.
    pub action: PlanAction,
    /// Why each index was or was not used, one note per planning step.
    pub steps: Vec<String>,
}

/// The result of [`Engine::explain`](crate::Engine::explain): the per-chunk
/// strategies a search would use, without reading any records.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    /// Whether the query runs newest-first.
    pub reverse: bool,
    /// Plans for every selected chunk, in scan order.
    pub chunks: Vec<ChunkPlan>,
}

impl fmt::Display for QueryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "query plan ({})",
            if self.reverse { "reverse" } else { "forward" }
        )?;
        for chunk in &self.chunks {
            writeln!(
                f,
                "  chunk {} ({}): {}",
                chunk.chunk_id,
                if chunk.sealed { "sealed" } else { "active" },
                chunk.action,
            )?;
            for step in &chunk.steps {
                writeln!(f, "    {}", step)?;
            }
        }
        Ok(())
    }
}
