//! Per-chunk execution: planning how to read one chunk (index acceleration
//! versus sequential scan) and the pull-based scanner that carries the plan
//! out.
//!
//! Planning is separate from execution so `explain` can produce the exact
//! plan a search would run, without opening a single cursor.

use crate::{
    error::{OpenFailedSnafu, ReadFailedSnafu, SeekFailedSnafu},
    filter::{self, ConjunctionFilters, Lookup, RuntimePred},
    plan::{ChunkPlan, NormalizedQuery, PlanAction},
    positions,
    runtime::RecordView,
    ChunkStore, Error, IndexStore, RecordCursor, Result, Tokenizer, JSON_PATH_SEPARATOR,
};
use data_types::{ChunkMeta, Record};
use grebe_time::Time;
use predicate::{Dnf, Expr, Predicate};
use snafu::ResultExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// A runtime filter attached to a chunk scan.
#[derive(Debug, Clone)]
pub(crate) enum ScanFilter {
    /// A single (possibly negated) predicate.
    Pred(RuntimePred),
    /// Re-verify full DNF branch matching; required whenever positions were
    /// unioned across branches and may over-approximate.
    DnfVerify(Dnf),
    /// Evaluate the whole expression; used on sequential fallbacks.
    Expr(Expr),
    /// Drop records outside the `ingest_ts` range.
    IngestBounds {
        lower: Option<Time>,
        upper: Option<Time>,
    },
    /// Drop records outside the `source_ts` range. Records without a
    /// `source_ts` cannot satisfy the bound.
    SourceBounds {
        lower: Option<Time>,
        upper: Option<Time>,
    },
}

impl ScanFilter {
    fn keeps(&self, view: &RecordView<'_>) -> bool {
        let record = view.record();
        match self {
            Self::Pred(rp) => view.matches_pred(&rp.pred) != rp.negated,
            Self::DnfVerify(dnf) => view.matches_dnf(dnf),
            Self::Expr(expr) => view.matches_expr(expr),
            Self::IngestBounds { lower, upper } => {
                in_bounds(Some(record.ingest_ts), *lower, *upper)
            }
            Self::SourceBounds { lower, upper } => in_bounds(record.source_ts, *lower, *upper),
        }
    }
}

fn in_bounds(t: Option<Time>, lower: Option<Time>, upper: Option<Time>) -> bool {
    let Some(t) = t else { return lower.is_none() && upper.is_none() };
    if let Some(lower) = lower {
        if t < lower {
            return false;
        }
    }
    if let Some(upper) = upper {
        if t >= upper {
            return false;
        }
    }
    true
}

/// The fully resolved strategy for one chunk.
#[derive(Debug)]
pub(crate) enum ScanStrategy {
    /// The chunk provably contains no matches.
    Skip,
    /// Read it.
    Scan(ScanPlan),
}

/// Everything the scanner needs to read one chunk.
#[derive(Debug)]
pub(crate) struct ScanPlan {
    pub meta: ChunkMeta,
    /// `None`: sequential scan. `Some`: seek exactly these, ascending.
    pub positions: Option<Vec<u64>>,
    /// First position a forward scan may yield.
    pub min_pos: u64,
    /// Where a reverse scan starts stepping backwards from; `None` means
    /// end-of-chunk.
    pub reverse_start: Option<u64>,
    /// Runtime filters, all of which must keep a record.
    pub filters: Vec<ScanFilter>,
    /// Inclusive lower `write_ts` bound.
    pub lower: Option<Time>,
    /// Exclusive upper `write_ts` bound.
    pub upper: Option<Time>,
}

/// Build the scan strategy and explain plan for one chunk.
///
/// `resume_pos` is the last position a previous run yielded from this chunk,
/// when resuming. The record at that position is skipped.
pub(crate) async fn plan_chunk(
    nq: &NormalizedQuery,
    meta: &ChunkMeta,
    chunk_store: &Arc<dyn ChunkStore>,
    index_store: Option<&Arc<dyn IndexStore>>,
    tokenizer: &Arc<dyn Tokenizer>,
    resume_pos: Option<u64>,
) -> Result<(ScanStrategy, ChunkPlan)> {
    let mut steps: Vec<String> = vec![];
    let mut min_pos = 0u64;
    let mut reverse_start = None;

    let skip = |steps: Vec<String>| ChunkPlan {
        store_id: meta.store_id,
        chunk_id: meta.id,
        sealed: meta.sealed,
        action: PlanAction::Skip,
        steps,
    };

    // 1. time seeks narrow the starting position on sealed chunks
    if meta.sealed {
        if let Some(lower) = nq.bounds.lower {
            match chunk_store
                .find_start_position(meta.id, lower)
                .await
                .context(SeekFailedSnafu {
                    chunk_id: meta.id,
                    position: 0u64,
                })? {
                Some(p) => {
                    steps.push(format!("time index: first write_ts >= {} at position {}", lower, p));
                    min_pos = min_pos.max(p);
                }
                None => {
                    steps.push(format!("time index: no write_ts >= {}", lower));
                    return Ok((ScanStrategy::Skip, skip(steps)));
                }
            }
        }

        if let Some(index_store) = index_store {
            if let Some(lower) = nq.bounds.ingest_lower {
                if let Ok(Some(p)) = index_store.find_ingest_start_position(meta.id, lower).await {
                    steps.push(format!("ingest index: first ingest_ts >= {} at position {}", lower, p));
                    min_pos = min_pos.max(p);
                }
            }
            if let Some(lower) = nq.bounds.source_lower {
                if let Ok(Some(p)) = index_store.find_source_start_position(meta.id, lower).await {
                    steps.push(format!("source index: first source_ts >= {} at position {}", lower, p));
                    min_pos = min_pos.max(p);
                }
            }
        }
    }

    // 2. resume overrides the starting position and skips the stored record
    if let Some(pos) = resume_pos {
        if nq.reverse {
            reverse_start = Some(pos);
        } else {
            min_pos = min_pos.max(pos.saturating_add(1));
        }
        steps.push(format!("resume after position {}", pos));
    }

    // 3. positional restriction pins the scan to exactly one record
    let mut acc: Option<Vec<u64>> = None;
    if let Some(r) = nq.pos {
        acc = Some(vec![r.position]);
        steps.push(format!("restricted to position {}", r.position));
    }

    // 4. the expression decides between index narrowing and runtime filters
    let mut filters: Vec<ScanFilter> = vec![];
    let indexes = meta
        .sealed
        .then(|| index_store)
        .flatten()
        .map(|store| IndexAccess {
            store,
            meta,
            tokenizer,
        });
    let mut fallbacks: Vec<Predicate> = vec![];

    match &nq.dnf {
        None => {}
        Some(dnf) if dnf.branches.is_empty() => {
            steps.push("expression matches nothing".to_string());
            return Ok((ScanStrategy::Skip, skip(steps)));
        }
        Some(dnf) if dnf.branches.len() == 1 => {
            let branch = &dnf.branches[0];
            match &indexes {
                Some(indexes) => {
                    let derived = filter::derive(branch);
                    let outcome = indexes
                        .narrow_branch(&derived, &mut steps, Some(&mut fallbacks))
                        .await;
                    match outcome {
                        BranchPositions::Empty => {
                            return Ok((ScanStrategy::Skip, skip(steps)));
                        }
                        BranchPositions::Narrowed(list) => {
                            acc = Some(match acc {
                                Some(base) => positions::intersect(&base, &list),
                                None => list,
                            });
                        }
                        BranchPositions::Unnarrowed => {}
                    }
                    for rp in derived.residual {
                        filters.push(ScanFilter::Pred(rp));
                    }
                    for pred in fallbacks.drain(..) {
                        filters.push(ScanFilter::Pred(RuntimePred {
                            negated: false,
                            pred,
                        }));
                    }
                }
                None => {
                    steps.push(no_index_note(meta));
                    filters.push(ScanFilter::Expr(
                        nq.expr.clone().expect("dnf implies expression"),
                    ));
                }
            }
        }
        Some(dnf) => {
            // multi-branch: union per-branch positions; any branch without
            // narrowing forces a sequential scan of the whole chunk. Unioned
            // positions over-approximate, so branch matching is always
            // re-verified per record.
            match &indexes {
                Some(indexes) => {
                    let mut union_acc: Vec<u64> = vec![];
                    let mut sequential = false;
                    let mut live_branches = 0usize;
                    for branch in &dnf.branches {
                        let derived = filter::derive(branch);
                        match indexes.narrow_branch(&derived, &mut steps, None).await {
                            BranchPositions::Empty => {}
                            BranchPositions::Narrowed(list) => {
                                live_branches += 1;
                                union_acc = positions::union(&union_acc, &list);
                            }
                            BranchPositions::Unnarrowed => {
                                live_branches += 1;
                                sequential = true;
                            }
                        }
                    }

                    if live_branches == 0 {
                        steps.push("all branches provably empty".to_string());
                        return Ok((ScanStrategy::Skip, skip(steps)));
                    }
                    if sequential {
                        steps.push("branch without index narrowing: sequential scan".to_string());
                    } else {
                        acc = Some(match acc {
                            Some(base) => positions::intersect(&base, &union_acc),
                            None => union_acc,
                        });
                    }
                }
                None => steps.push(no_index_note(meta)),
            }
            filters.push(ScanFilter::DnfVerify(dnf.clone()));
        }
    }

    // 5. runtime drops for secondary time dimensions
    if nq.bounds.ingest_lower.is_some() || nq.bounds.ingest_upper.is_some() {
        filters.push(ScanFilter::IngestBounds {
            lower: nq.bounds.ingest_lower,
            upper: nq.bounds.ingest_upper,
        });
    }
    if nq.bounds.source_lower.is_some() || nq.bounds.source_upper.is_some() {
        filters.push(ScanFilter::SourceBounds {
            lower: nq.bounds.source_lower,
            upper: nq.bounds.source_upper,
        });
    }

    // prune the position list to the scan window
    let positions = acc.map(|list| {
        let list = positions::prune(list, min_pos);
        match reverse_start {
            Some(cut) => {
                let keep = list.partition_point(|&p| p < cut);
                list[..keep].to_vec()
            }
            None => list,
        }
    });

    if let Some(list) = &positions {
        if list.is_empty() {
            steps.push("no candidate positions in scan window".to_string());
            return Ok((ScanStrategy::Skip, skip(steps)));
        }
    }

    let action = match &positions {
        Some(list) => PlanAction::Positional {
            positions: list.len(),
        },
        None => PlanAction::Sequential,
    };
    debug!(chunk_id=%meta.id, ?action, "planned chunk scan");

    let plan = ChunkPlan {
        store_id: meta.store_id,
        chunk_id: meta.id,
        sealed: meta.sealed,
        action,
        steps,
    };

    Ok((
        ScanStrategy::Scan(ScanPlan {
            meta: meta.clone(),
            positions,
            min_pos,
            reverse_start,
            filters,
            lower: nq.bounds.lower,
            upper: nq.bounds.upper,
        }),
        plan,
    ))
}

fn no_index_note(meta: &ChunkMeta) -> String {
    if meta.sealed {
        "no index store: runtime filtering".to_string()
    } else {
        "active chunk has no indexes: runtime filtering".to_string()
    }
}

/// Result of narrowing one branch through the indexes.
enum BranchPositions {
    /// Every complete lookup agreed the branch matches nothing here.
    Empty,
    /// Candidate positions (exact for a single branch, a superset across
    /// unioned branches).
    Narrowed(Vec<u64>),
    /// No usable index narrowing; scan and filter.
    Unnarrowed,
}

struct IndexAccess<'a> {
    store: &'a Arc<dyn IndexStore>,
    meta: &'a ChunkMeta,
    tokenizer: &'a Arc<dyn Tokenizer>,
}

impl<'a> IndexAccess<'a> {
    /// Intersect every complete lookup of `derived`; collect fallback
    /// predicates for inconclusive ones into `fallbacks` when supplied
    /// (multi-branch mode omits them because DNF re-verification subsumes
    /// per-predicate fallbacks).
    async fn narrow_branch(
        &self,
        derived: &ConjunctionFilters,
        steps: &mut Vec<String>,
        mut fallbacks: Option<&mut Vec<Predicate>>,
    ) -> BranchPositions {
        let mut acc: Option<Vec<u64>> = None;

        for hint in &derived.hints {
            match self.run_lookup(&hint.lookup, steps).await {
                LookupOutcome::Complete(list) => {
                    acc = Some(match acc {
                        Some(base) => positions::intersect(&base, &list),
                        None => list,
                    });
                    if acc.as_ref().map(Vec::is_empty).unwrap_or(false) {
                        return BranchPositions::Empty;
                    }
                }
                LookupOutcome::Inconclusive => {
                    if let (Some(fallbacks), Some(pred)) = (fallbacks.as_mut(), &hint.fallback) {
                        fallbacks.push(pred.clone());
                    }
                }
            }
        }

        match acc {
            Some(list) => BranchPositions::Narrowed(list),
            None => BranchPositions::Unnarrowed,
        }
    }

    async fn run_lookup(&self, lookup: &Lookup, steps: &mut Vec<String>) -> LookupOutcome {
        match lookup {
            Lookup::Token { term } => self.token_lookup(term, steps).await,
            Lookup::TokenPrefix { prefix } => self.prefix_lookup(prefix, steps).await,
            Lookup::KvEq { key, value } => self.kv_lookup(key, value, steps).await,
            Lookup::Key { key } => self.key_lookup(key, steps).await,
            Lookup::Value { value } => self.value_lookup(value, steps).await,
        }
    }

    async fn token_lookup(&self, term: &str, steps: &mut Vec<String>) -> LookupOutcome {
        let reader = match self.store.token_index(self.meta.id).await {
            Ok(reader) => reader,
            Err(e) => {
                trace!(chunk_id=%self.meta.id, %e, "token index unavailable");
                steps.push("token index unavailable: runtime filter".to_string());
                return LookupOutcome::Inconclusive;
            }
        };
        match reader.lookup(term).await {
            Ok(Some(list)) => {
                steps.push(format!("token index: \"{}\" -> {} positions", term, list.len()));
                LookupOutcome::Complete(list)
            }
            Ok(None) => {
                if self.tokenizer.is_indexable(term) {
                    steps.push(format!("token index: \"{}\" absent -> no matches", term));
                    LookupOutcome::Complete(vec![])
                } else {
                    steps.push(format!(
                        "token \"{}\" not indexable: runtime filter",
                        term
                    ));
                    LookupOutcome::Inconclusive
                }
            }
            Err(e) => {
                trace!(chunk_id=%self.meta.id, %e, "token lookup failed");
                steps.push("token lookup failed: runtime filter".to_string());
                LookupOutcome::Inconclusive
            }
        }
    }

    async fn prefix_lookup(&self, prefix: &str, steps: &mut Vec<String>) -> LookupOutcome {
        let reader = match self.store.token_index(self.meta.id).await {
            Ok(reader) => reader,
            Err(_) => {
                steps.push("token index unavailable for glob prefix".to_string());
                return LookupOutcome::Inconclusive;
            }
        };
        match reader.lookup_prefix(prefix).await {
            Ok(Some(list)) => {
                steps.push(format!(
                    "token index: prefix \"{}\" -> {} candidate positions",
                    prefix,
                    list.len()
                ));
                LookupOutcome::Complete(list)
            }
            _ => {
                steps.push(format!(
                    "token index: no candidates for prefix \"{}\": runtime filter",
                    prefix
                ));
                LookupOutcome::Inconclusive
            }
        }
    }

    async fn kv_lookup(&self, key: &str, value: &str, steps: &mut Vec<String>) -> LookupOutcome {
        let mut union: Vec<u64> = vec![];
        let mut complete = true;

        match self.store.attr_kv_index(self.meta.id).await {
            Ok(reader) if !reader.capped() => match reader.lookup(key, value).await {
                Ok(Some(list)) => union = positions::union(&union, &list),
                Ok(None) => {}
                Err(_) => complete = false,
            },
            _ => complete = false,
        }
        match self.store.kv_index(self.meta.id).await {
            Ok(reader) if !reader.capped() => match reader.lookup(key, value).await {
                Ok(Some(list)) => union = positions::union(&union, &list),
                Ok(None) => {}
                Err(_) => complete = false,
            },
            Ok(_) => {
                steps.push("body kv index capped: inconclusive".to_string());
                complete = false;
            }
            Err(_) => complete = false,
        }
        // the JSON path-value index only ever adds candidates
        if let Ok(reader) = self.store.json_index(self.meta.id).await {
            if !reader.pv_capped() {
                let path = json_path(key);
                if let Ok(Some(list)) = reader.lookup_path_value(&path, value).await {
                    union = positions::union(&union, &list);
                }
            }
        }

        if complete {
            steps.push(format!(
                "kv indexes: {}={} -> {} positions",
                key,
                value,
                union.len()
            ));
            LookupOutcome::Complete(union)
        } else {
            steps.push(format!("kv indexes incomplete for {}={}: runtime filter", key, value));
            LookupOutcome::Inconclusive
        }
    }

    async fn key_lookup(&self, key: &str, steps: &mut Vec<String>) -> LookupOutcome {
        let mut union: Vec<u64> = vec![];
        let mut complete = true;

        match self.store.attr_key_index(self.meta.id).await {
            Ok(reader) if !reader.capped() => match reader.lookup(key).await {
                Ok(Some(list)) => union = positions::union(&union, &list),
                Ok(None) => {}
                Err(_) => complete = false,
            },
            _ => complete = false,
        }
        match self.store.kv_key_index(self.meta.id).await {
            Ok(reader) if !reader.capped() => match reader.lookup(key).await {
                Ok(Some(list)) => union = positions::union(&union, &list),
                Ok(None) => {}
                Err(_) => complete = false,
            },
            _ => complete = false,
        }
        if let Ok(reader) = self.store.json_index(self.meta.id).await {
            let path = json_path(key);
            if let Ok(Some(list)) = reader.lookup_path(&path).await {
                union = positions::union(&union, &list);
            }
        }

        if complete {
            steps.push(format!("key indexes: {} -> {} positions", key, union.len()));
            LookupOutcome::Complete(union)
        } else {
            steps.push(format!("key indexes incomplete for {}: runtime filter", key));
            LookupOutcome::Inconclusive
        }
    }

    async fn value_lookup(&self, value: &str, steps: &mut Vec<String>) -> LookupOutcome {
        let mut union: Vec<u64> = vec![];
        let mut complete = true;

        match self.store.attr_value_index(self.meta.id).await {
            Ok(reader) if !reader.capped() => match reader.lookup(value).await {
                Ok(Some(list)) => union = positions::union(&union, &list),
                Ok(None) => {}
                Err(_) => complete = false,
            },
            _ => complete = false,
        }
        match self.store.kv_value_index(self.meta.id).await {
            Ok(reader) if !reader.capped() => match reader.lookup(value).await {
                Ok(Some(list)) => union = positions::union(&union, &list),
                Ok(None) => {}
                Err(_) => complete = false,
            },
            _ => complete = false,
        }

        if complete {
            steps.push(format!("value indexes: {} -> {} positions", value, union.len()));
            LookupOutcome::Complete(union)
        } else {
            steps.push(format!("value indexes incomplete for {}: runtime filter", value));
            LookupOutcome::Inconclusive
        }
    }
}

/// Convert a dotted user key into an on-disk JSON path.
fn json_path(key: &str) -> String {
    key.replace('.', &JSON_PATH_SEPARATOR.to_string())
}

enum LookupOutcome {
    /// The union covers every possible match: usable for narrowing, and an
    /// empty result proves the absence of matches.
    Complete(Vec<u64>),
    /// Some source was missing, failing, or capped: fall back to runtime.
    Inconclusive,
}

/// Pull-based execution of one [`ScanPlan`].
///
/// Yields matching records in position order (descending for reverse
/// queries), pairing each with its location via the record itself. The
/// cursor is opened on first use and released on drop.
#[derive(Debug)]
pub(crate) struct ChunkScanner {
    plan: ScanPlan,
    chunk_store: Arc<dyn ChunkStore>,
    tokenizer: Arc<dyn Tokenizer>,
    reverse: bool,
    cursor: Option<Box<dyn RecordCursor>>,
    /// Index of the next entry in `plan.positions` (counted from the end
    /// for reverse scans).
    pos_idx: usize,
    done: bool,
    cancel: CancellationToken,
    cancel_stride: usize,
    since_poll: usize,
}

impl ChunkScanner {
    pub(crate) fn new(
        plan: ScanPlan,
        chunk_store: Arc<dyn ChunkStore>,
        tokenizer: Arc<dyn Tokenizer>,
        reverse: bool,
        cancel: CancellationToken,
        cancel_stride: usize,
    ) -> Self {
        Self {
            plan,
            chunk_store,
            tokenizer,
            reverse,
            cursor: None,
            pos_idx: 0,
            done: false,
            cancel,
            cancel_stride: cancel_stride.max(1),
            since_poll: 0,
        }
    }

    pub(crate) fn meta(&self) -> &ChunkMeta {
        &self.plan.meta
    }

    /// The next matching record, or `None` when the chunk is exhausted for
    /// this query.
    pub(crate) async fn next(&mut self) -> Result<Option<Record>> {
        if self.done {
            return Ok(None);
        }
        if self.cursor.is_none() {
            self.open().await?;
        }

        loop {
            self.since_poll += 1;
            if self.since_poll >= self.cancel_stride {
                self.since_poll = 0;
                if self.cancel.is_cancelled() {
                    self.done = true;
                    return Err(Error::Canceled);
                }
            }

            let record = match &self.plan.positions {
                Some(list) => {
                    if self.pos_idx >= list.len() {
                        self.done = true;
                        return Ok(None);
                    }
                    let position = if self.reverse {
                        list[list.len() - 1 - self.pos_idx]
                    } else {
                        list[self.pos_idx]
                    };
                    self.pos_idx += 1;

                    let cursor = self.cursor.as_mut().expect("cursor opened");
                    cursor
                        .seek(position)
                        .await
                        .context(SeekFailedSnafu {
                            chunk_id: self.plan.meta.id,
                            position,
                        })?;
                    match cursor.next().await.context(ReadFailedSnafu {
                        chunk_id: self.plan.meta.id,
                    })? {
                        Some(record) => record,
                        None => {
                            self.done = true;
                            return Ok(None);
                        }
                    }
                }
                None => {
                    let cursor = self.cursor.as_mut().expect("cursor opened");
                    let read = if self.reverse {
                        cursor.prev().await
                    } else {
                        cursor.next().await
                    };
                    match read.context(ReadFailedSnafu {
                        chunk_id: self.plan.meta.id,
                    })? {
                        Some(record) => record,
                        None => {
                            self.done = true;
                            return Ok(None);
                        }
                    }
                }
            };

            // the write_ts window: crossing the far bound ends the scan,
            // slight out-of-order stragglers on the near side are skipped
            if self.reverse {
                if let Some(lower) = self.plan.lower {
                    if record.write_ts < lower {
                        self.done = true;
                        return Ok(None);
                    }
                }
                if let Some(upper) = self.plan.upper {
                    if record.write_ts >= upper {
                        continue;
                    }
                }
            } else {
                if let Some(upper) = self.plan.upper {
                    if record.write_ts >= upper {
                        self.done = true;
                        return Ok(None);
                    }
                }
                if let Some(lower) = self.plan.lower {
                    if record.write_ts < lower {
                        continue;
                    }
                }
            }

            let view = RecordView::new(&record, self.tokenizer.as_ref());
            if self.plan.filters.iter().all(|f| f.keeps(&view)) {
                drop(view);
                return Ok(Some(record));
            }
        }
    }

    async fn open(&mut self) -> Result<()> {
        let mut cursor = self
            .chunk_store
            .open_cursor(self.plan.meta.id)
            .await
            .context(OpenFailedSnafu {
                chunk_id: self.plan.meta.id,
            })?;

        if self.plan.positions.is_none() {
            let start = if self.reverse {
                self.plan
                    .reverse_start
                    .unwrap_or(self.plan.meta.record_count)
            } else {
                self.plan.min_pos
            };
            cursor.seek(start).await.context(SeekFailedSnafu {
                chunk_id: self.plan.meta.id,
                position: start,
            })?;
        }

        self.cursor = Some(cursor);
        Ok(())
    }
}
