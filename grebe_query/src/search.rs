//! The engine's search surface: lazy ordered search, first-match-then-tail,
//! infinite follow, context windows, and explain.

use crate::{
    error::ListFailedSnafu,
    merge::MergeCore,
    plan::{normalize, ChunkPlan, NormalizedQuery, QueryPlan},
    pruning::select_chunks,
    runtime,
    scan::{plan_chunk, ChunkScanner, ScanStrategy},
    ChunkStore, Engine, Error, IndexStore, Query, Result, StoreError,
};
use data_types::{ChunkId, ChunkMeta, Record, RecordRef, ResumeToken, StoreId, EXHAUSTED};
use hashbrown::{HashMap, HashSet};
use predicate::{Expr, Predicate};
use snafu::ResultExt;
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One store a query will touch, with its selected chunks in scan order.
#[derive(Debug)]
pub(crate) struct StoreTarget {
    pub(crate) store_id: StoreId,
    pub(crate) chunk_store: Arc<dyn ChunkStore>,
    pub(crate) index_store: Option<Arc<dyn IndexStore>>,
    pub(crate) selected: Vec<ChunkMeta>,
}

#[derive(Debug)]
pub(crate) struct Prepared {
    pub(crate) nq: NormalizedQuery,
    pub(crate) targets: Vec<StoreTarget>,
}

/// A lazy, `ingest_ts`-ordered stream of matching records.
///
/// Pull with [`next`](Self::next); [`resume_token`](Self::resume_token) is
/// valid whenever iteration stops and captures exactly where every touched
/// chunk left off.
#[derive(Debug)]
pub struct SearchResults {
    core: MergeCore,
}

impl SearchResults {
    /// The next matching record.
    pub async fn next(&mut self) -> Result<Option<Record>> {
        self.core.next().await
    }

    /// Continuation state for a later `search` call; `None` when everything
    /// the query could ever match has been yielded.
    pub fn resume_token(&self) -> Option<ResumeToken> {
        self.core.resume_token()
    }

    /// Drain the stream into a vector. Test and small-result convenience.
    pub async fn collect(&mut self) -> Result<Vec<Record>> {
        let mut out = vec![];
        while let Some(record) = self.next().await? {
            out.push(record);
        }
        Ok(out)
    }
}

impl Engine {
    /// Run a search and return the lazy record stream.
    ///
    /// With a `resume` token, iteration continues after the token's
    /// positions; a token referencing a chunk that no longer exists fails
    /// with [`Error::InvalidResumeToken`].
    pub async fn search(
        &self,
        cancel: CancellationToken,
        query: &Query,
        resume: Option<&ResumeToken>,
    ) -> Result<SearchResults> {
        let prepared = self.prepare(query, resume).await?;
        let (scanners, _) = self
            .build_scanners(&prepared, resume, &cancel)
            .await?;

        let seed = resume.map(|t| t.positions.clone()).unwrap_or_default();
        Ok(SearchResults {
            core: MergeCore::new(scanners, prepared.nq.reverse, prepared.nq.limit, cancel, seed),
        })
    }

    /// Dry-run a query: the per-chunk strategies and index decisions a
    /// `search` would make, without reading any records.
    pub async fn explain(&self, query: &Query) -> Result<QueryPlan> {
        let prepared = self.prepare(query, None).await?;
        let cancel = CancellationToken::new();
        let (_, plans) = self.build_scanners(&prepared, None, &cancel).await?;
        Ok(QueryPlan {
            reverse: prepared.nq.reverse,
            chunks: plans,
        })
    }

    /// Read one record by location.
    pub async fn read_record(
        &self,
        store_id: StoreId,
        chunk_id: ChunkId,
        position: u64,
    ) -> Result<Record> {
        let chunk_store = self.chunk_store(store_id)?;
        let mut cursor = chunk_store
            .open_cursor(chunk_id)
            .await
            .map_err(|e| open_error(chunk_id, e))?;

        cursor
            .seek(position)
            .await
            .context(crate::error::SeekFailedSnafu { chunk_id, position })?;
        match cursor
            .next()
            .await
            .context(crate::error::ReadFailedSnafu { chunk_id })?
        {
            Some(record) => Ok(record),
            None => Err(Error::ReadFailed {
                chunk_id,
                source: StoreError::PositionOutOfBounds { chunk_id, position },
            }),
        }
    }

    /// First-match-then-tail: search for the first matching record, then
    /// yield it and everything after it with the filter removed.
    pub async fn search_then_follow(
        &self,
        cancel: CancellationToken,
        query: &Query,
        resume: Option<&ResumeToken>,
    ) -> Result<SearchResults> {
        // a resume token already encodes phase-2 progress: skip re-anchoring
        if let Some(token) = resume {
            let unfiltered = Query {
                expr: None,
                ..query.clone()
            };
            return self.search(cancel, &unfiltered, Some(token)).await;
        }

        let mut anchored = self.search(cancel.clone(), query, None).await?;
        let anchor = match anchored.next().await? {
            Some(record) => record,
            None => {
                // nothing to anchor on: the stream ends here
                return Ok(anchored);
            }
        };
        drop(anchored);
        info!(chunk_id=%anchor.chunk_id, position=anchor.position, "anchored follow");

        let prepared = self.prepare(query, None).await?;
        let nq = prepared.nq.without_filter();
        let step = Duration::from_nanos(1);

        // non-anchor chunks start at the beginning but drop everything at or
        // before (at or after, in reverse) the anchor's ingest timestamp
        let mut nq_others = nq.clone();
        if nq.reverse {
            nq_others.bounds.ingest_upper = Some(anchor.ingest_ts);
        } else {
            nq_others.bounds.ingest_lower = Some(anchor.ingest_ts + step);
        }

        let mut scanners = vec![];
        for target in &prepared.targets {
            for meta in &target.selected {
                let is_anchor = meta.id == anchor.chunk_id && target.store_id == anchor.store_id;
                let (nq_chunk, resume_pos) = if is_anchor {
                    // start exactly at the anchor's position, inclusive
                    let pos = if nq.reverse {
                        Some(anchor.position + 1)
                    } else {
                        anchor.position.checked_sub(1)
                    };
                    (&nq, pos)
                } else {
                    (&nq_others, None)
                };

                let (strategy, _) = plan_chunk(
                    nq_chunk,
                    meta,
                    &target.chunk_store,
                    target.index_store.as_ref(),
                    self.tokenizer(),
                    resume_pos,
                )
                .await?;
                if let ScanStrategy::Scan(plan) = strategy {
                    scanners.push(ChunkScanner::new(
                        plan,
                        Arc::clone(&target.chunk_store),
                        Arc::clone(self.tokenizer()),
                        nq.reverse,
                        cancel.clone(),
                        self.config().cancel_poll_stride,
                    ));
                }
            }
        }

        Ok(SearchResults {
            core: MergeCore::new(scanners, nq.reverse, nq.limit, cancel, vec![]),
        })
    }

    /// Search with ±N context records around every match.
    ///
    /// Single-store only; selections spanning stores surface
    /// [`Error::MultiStoreNotSupported`].
    pub async fn search_with_context(
        &self,
        cancel: CancellationToken,
        query: &Query,
    ) -> Result<ContextSearchResults> {
        let prepared = self.prepare(query, None).await?;

        let populated: Vec<&StoreTarget> = prepared
            .targets
            .iter()
            .filter(|t| !t.selected.is_empty())
            .collect();
        if populated.len() > 1 {
            return Err(Error::MultiStoreNotSupported);
        }

        let fetcher = match populated.first() {
            Some(target) => {
                let mut chunks = target
                    .chunk_store
                    .list()
                    .await
                    .context(ListFailedSnafu {
                        store_id: target.store_id,
                    })?;
                chunks.sort_by(|a, b| (a.start_ts, a.id).cmp(&(b.start_ts, b.id)));
                Some(ContextFetcher {
                    chunk_store: Arc::clone(&target.chunk_store),
                    chunks,
                })
            }
            None => None,
        };

        let cap = self.config().max_context_records;
        let before = query.context_before.min(cap);
        let after = query.context_after.min(cap);
        let reverse = prepared.nq.reverse;

        let inner = self.search(cancel, query, None).await?;
        Ok(ContextSearchResults {
            inner,
            fetcher,
            before,
            after,
            reverse,
            window: VecDeque::new(),
        })
    }

    /// Read one record plus up to `before`/`after` surrounding records, by
    /// running two time-bounded unfiltered searches around the anchor.
    pub async fn get_context(
        &self,
        cancel: CancellationToken,
        at: RecordRef,
        before: usize,
        after: usize,
    ) -> Result<ContextResult> {
        let cap = self.config().max_context_records;
        let before = before.min(cap);
        let after = after.min(cap);

        let anchor = self
            .read_record(at.store_id, at.chunk_id, at.position)
            .await?;
        let store_expr =
            Expr::pred(Predicate::kv_eq("store", &at.store_id.to_string()).expect("literal kv"));
        let step = Duration::from_nanos(1);

        // ask for one extra in both directions to absorb the anchor itself
        let before_query = Query {
            end: Some(anchor.write_ts + step),
            reverse: true,
            limit: Some(before + 1),
            expr: Some(store_expr.clone()),
            ..Default::default()
        };
        let mut results = self.search(cancel.clone(), &before_query, None).await?;
        let mut before_records: Vec<Record> = results
            .collect()
            .await?
            .into_iter()
            .filter(|r| r.record_ref() != at)
            .take(before)
            .collect();
        // reverse search yields newest-first; contexts read chronologically
        before_records.reverse();

        let after_query = Query {
            start: Some(anchor.write_ts),
            limit: Some(after + 1),
            expr: Some(store_expr),
            ..Default::default()
        };
        let mut results = self.search(cancel, &after_query, None).await?;
        let after_records: Vec<Record> = results
            .collect()
            .await?
            .into_iter()
            .filter(|r| r.record_ref() != at)
            .take(after)
            .collect();

        Ok(ContextResult {
            anchor,
            before: before_records,
            after: after_records,
        })
    }

    /// Infinite tail: poll for newly written records matching the query's
    /// filter until cancelled. Never produces a resume token.
    ///
    /// Construction records the current tail position of every chunk; only
    /// records written afterwards are yielded.
    pub async fn follow(&self, cancel: CancellationToken, query: &Query) -> Result<FollowStream> {
        let nq = normalize(query);
        let mut stream = FollowStream {
            engine: self.clone(),
            cancel,
            nq,
            next_positions: HashMap::new(),
            known_stores: HashSet::new(),
            buffer: VecDeque::new(),
        };
        stream.observe_stores(true).await?;
        Ok(stream)
    }

    pub(crate) async fn prepare(
        &self,
        query: &Query,
        resume: Option<&ResumeToken>,
    ) -> Result<Prepared> {
        let nq = normalize(query);

        let store_ids = match &nq.store_ids {
            Some(ids) => ids.clone(),
            None => self.catalog().store_ids().await,
        };

        let mut targets = vec![];
        let mut all_chunks: HashSet<(StoreId, ChunkId)> = HashSet::new();
        for store_id in store_ids {
            let chunk_store = self.chunk_store(store_id)?;
            let chunks = chunk_store
                .list()
                .await
                .context(ListFailedSnafu { store_id })?;
            for meta in &chunks {
                all_chunks.insert((store_id, meta.id));
            }

            let mut selected = select_chunks(
                chunks,
                &nq.bounds,
                nq.chunk_ids.as_deref(),
                nq.reverse,
            );
            if let Some(at) = nq.pos {
                selected.retain(|m| m.id == at.chunk_id && at.store_id == store_id);
            }

            targets.push(StoreTarget {
                store_id,
                index_store: self.catalog().index_store(store_id),
                chunk_store,
                selected,
            });
        }

        // a resume token is only valid while every chunk it still points
        // into exists
        if let Some(token) = resume {
            for p in &token.positions {
                if !p.is_exhausted() && !all_chunks.contains(&(p.store_id, p.chunk_id)) {
                    return Err(Error::InvalidResumeToken {
                        chunk_id: p.chunk_id,
                    });
                }
            }
        }

        Ok(Prepared { nq, targets })
    }

    async fn build_scanners(
        &self,
        prepared: &Prepared,
        resume: Option<&ResumeToken>,
        cancel: &CancellationToken,
    ) -> Result<(Vec<ChunkScanner>, Vec<ChunkPlan>)> {
        let mut scanners = vec![];
        let mut plans = vec![];

        for target in &prepared.targets {
            for meta in &target.selected {
                let resume_pos = resume.and_then(|t| t.position_for(target.store_id, meta.id));
                if resume_pos == Some(EXHAUSTED) {
                    debug!(chunk_id=%meta.id, "chunk exhausted in resume token, skipping");
                    continue;
                }

                let (strategy, plan) = plan_chunk(
                    &prepared.nq,
                    meta,
                    &target.chunk_store,
                    target.index_store.as_ref(),
                    self.tokenizer(),
                    resume_pos,
                )
                .await?;
                plans.push(plan);

                if let ScanStrategy::Scan(scan_plan) = strategy {
                    scanners.push(ChunkScanner::new(
                        scan_plan,
                        Arc::clone(&target.chunk_store),
                        Arc::clone(self.tokenizer()),
                        prepared.nq.reverse,
                        cancel.clone(),
                        self.config().cancel_poll_stride,
                    ));
                }
            }
        }

        Ok((scanners, plans))
    }
}

fn open_error(chunk_id: ChunkId, e: StoreError) -> Error {
    match e {
        StoreError::ChunkNotFound { .. } => Error::UnknownChunk { chunk_id },
        source => Error::OpenFailed { chunk_id, source },
    }
}

/// One record with its surrounding context.
#[derive(Debug, Clone)]
pub struct ContextResult {
    /// The record itself.
    pub anchor: Record,
    /// Up to N records immediately before the anchor, chronological.
    pub before: Vec<Record>,
    /// Up to N records immediately after the anchor, chronological.
    pub after: Vec<Record>,
}

/// Stream of matches where every match is surrounded by its context window.
///
/// Windows may overlap: the same record can appear in the windows of two
/// nearby matches.
#[derive(Debug)]
pub struct ContextSearchResults {
    inner: SearchResults,
    fetcher: Option<ContextFetcher>,
    before: usize,
    after: usize,
    reverse: bool,
    window: VecDeque<Record>,
}

impl ContextSearchResults {
    /// The next record: either more of the current match's window or the
    /// start of the next one.
    pub async fn next(&mut self) -> Result<Option<Record>> {
        loop {
            if let Some(record) = self.window.pop_front() {
                return Ok(Some(record));
            }

            let Some(record) = self.inner.next().await? else { return Ok(None) };

            if let Some(fetcher) = &self.fetcher {
                let before = fetcher.gather_before(&record, self.before).await?;
                let after = fetcher.gather_after(&record, self.after).await?;
                if self.reverse {
                    // newest first: trailing context, match, leading context
                    self.window.extend(after.into_iter().rev());
                    self.window.push_back(record);
                    self.window.extend(before.into_iter().rev());
                } else {
                    self.window.extend(before);
                    self.window.push_back(record);
                    self.window.extend(after);
                }
            } else {
                self.window.push_back(record);
            }
        }
    }

    /// Continuation state of the underlying match stream.
    pub fn resume_token(&self) -> Option<ResumeToken> {
        self.inner.resume_token()
    }
}

/// Steps cursors backwards/forwards across chunk boundaries to collect
/// unfiltered context records.
#[derive(Debug)]
struct ContextFetcher {
    chunk_store: Arc<dyn ChunkStore>,
    /// Every chunk of the store, ascending by start time.
    chunks: Vec<ChunkMeta>,
}

impl ContextFetcher {
    fn chunk_index(&self, chunk_id: ChunkId) -> Option<usize> {
        self.chunks.iter().position(|m| m.id == chunk_id)
    }

    /// Up to `n` records immediately preceding `record`, chronological.
    async fn gather_before(&self, record: &Record, n: usize) -> Result<Vec<Record>> {
        let mut out: Vec<Record> = vec![];
        let Some(mut idx) = self.chunk_index(record.chunk_id) else { return Ok(vec![]) };
        let mut seek_to = Some(record.position);

        loop {
            if out.len() >= n {
                break;
            }
            let meta = &self.chunks[idx];
            let mut cursor = self
                .chunk_store
                .open_cursor(meta.id)
                .await
                .map_err(|e| open_error(meta.id, e))?;
            let start = seek_to.unwrap_or(meta.record_count);
            cursor
                .seek(start)
                .await
                .context(crate::error::SeekFailedSnafu {
                    chunk_id: meta.id,
                    position: start,
                })?;

            while out.len() < n {
                match cursor
                    .prev()
                    .await
                    .context(crate::error::ReadFailedSnafu { chunk_id: meta.id })?
                {
                    Some(r) => out.push(r),
                    None => break,
                }
            }

            if out.len() >= n || idx == 0 {
                break;
            }
            idx -= 1;
            seek_to = None;
        }

        out.reverse();
        Ok(out)
    }

    /// Up to `n` records immediately following `record`, chronological.
    async fn gather_after(&self, record: &Record, n: usize) -> Result<Vec<Record>> {
        let mut out: Vec<Record> = vec![];
        let Some(mut idx) = self.chunk_index(record.chunk_id) else { return Ok(vec![]) };
        let mut seek_to = Some(record.position + 1);

        loop {
            if out.len() >= n {
                break;
            }
            let meta = &self.chunks[idx];
            let mut cursor = self
                .chunk_store
                .open_cursor(meta.id)
                .await
                .map_err(|e| open_error(meta.id, e))?;
            let start = seek_to.unwrap_or(0);
            cursor
                .seek(start)
                .await
                .context(crate::error::SeekFailedSnafu {
                    chunk_id: meta.id,
                    position: start,
                })?;

            while out.len() < n {
                match cursor
                    .next()
                    .await
                    .context(crate::error::ReadFailedSnafu { chunk_id: meta.id })?
                {
                    Some(r) => out.push(r),
                    None => break,
                }
            }

            if out.len() >= n || idx + 1 >= self.chunks.len() {
                break;
            }
            idx += 1;
            seek_to = None;
        }

        Ok(out)
    }
}

/// The infinite tail produced by [`Engine::follow`].
///
/// Each poll lists stores and chunks afresh, reads strictly past the last
/// seen positions, filters, sorts the batch by `ingest_ts`, and yields it.
/// Newly created stores start at their current tail; new chunks inside known
/// stores are read from the beginning.
#[derive(Debug)]
pub struct FollowStream {
    engine: Engine,
    cancel: CancellationToken,
    nq: NormalizedQuery,
    /// Next unread position per chunk.
    next_positions: HashMap<(StoreId, ChunkId), u64>,
    known_stores: HashSet<StoreId>,
    buffer: VecDeque<Record>,
}

impl FollowStream {
    /// The next tailed record. Blocks across poll intervals until one
    /// arrives; returns [`Error::Canceled`] when the token fires.
    pub async fn next(&mut self) -> Result<Option<Record>> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                return Ok(Some(record));
            }
            if self.cancel.is_cancelled() {
                return Err(Error::Canceled);
            }

            let interval = self.engine.config().follow_poll_interval;
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Canceled),
                _ = tokio::time::sleep(interval) => {}
            }

            self.observe_stores(false).await?;
        }
    }

    /// List stores and chunks; on `init_only`, record current tails without
    /// reading. Otherwise read, filter, and buffer everything new.
    async fn observe_stores(&mut self, init_only: bool) -> Result<()> {
        let store_ids = match &self.nq.store_ids {
            Some(ids) => ids.clone(),
            None => self.engine.catalog().store_ids().await,
        };

        let mut batch: Vec<Record> = vec![];
        for store_id in store_ids {
            let Some(chunk_store) = self.engine.catalog().chunk_store(store_id) else { continue };
            let chunks = chunk_store
                .list()
                .await
                .context(ListFailedSnafu { store_id })?;

            // a store seen for the first time starts at its current tail so
            // history is not replayed into the tail stream
            let new_store = self.known_stores.insert(store_id);
            for meta in chunks {
                if let Some(ids) = &self.nq.chunk_ids {
                    if !ids.contains(&meta.id) {
                        continue;
                    }
                }

                let key = (store_id, meta.id);
                if init_only || new_store {
                    self.next_positions.entry(key).or_insert(meta.record_count);
                    continue;
                }

                let next = *self.next_positions.entry(key).or_insert(0);
                if meta.sealed && next >= meta.record_count {
                    continue;
                }
                self.read_new(&chunk_store, &meta, next, &mut batch).await?;
            }
        }

        batch.sort_by_key(|r| (r.ingest_ts, r.store_id, r.chunk_id, r.position));
        self.buffer.extend(batch);
        Ok(())
    }

    async fn read_new(
        &mut self,
        chunk_store: &Arc<dyn ChunkStore>,
        meta: &ChunkMeta,
        from: u64,
        batch: &mut Vec<Record>,
    ) -> Result<()> {
        let mut cursor = chunk_store
            .open_cursor(meta.id)
            .await
            .map_err(|e| open_error(meta.id, e))?;
        cursor
            .seek(from)
            .await
            .context(crate::error::SeekFailedSnafu {
                chunk_id: meta.id,
                position: from,
            })?;

        let mut last = None;
        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Canceled);
            }
            match cursor
                .next()
                .await
                .context(crate::error::ReadFailedSnafu { chunk_id: meta.id })?
            {
                Some(record) => {
                    last = Some(record.position);
                    let keep = match &self.nq.expr {
                        Some(expr) => runtime::expr_matches(
                            expr,
                            &record,
                            self.engine.tokenizer().as_ref(),
                        ),
                        None => true,
                    };
                    if keep {
                        batch.push(record);
                    }
                }
                None => break,
            }
        }

        if let Some(last) = last {
            self.next_positions
                .insert((meta.store_id, meta.id), last + 1);
        }
        Ok(())
    }
}
