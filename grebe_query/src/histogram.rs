//! Index-accelerated time histograms with optional severity breakdown.

use crate::{
    positions,
    scan::{plan_chunk, ChunkScanner, ScanStrategy},
    ChunkStore, Engine, IndexStore, Query, Result, Tokenizer,
};
use data_types::{ChunkMeta, Record};
use grebe_time::Time;
use predicate::Expr;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Canonical severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Errors and worse.
    Error,
    /// Warnings.
    Warn,
    /// Informational.
    Info,
    /// Debug chatter.
    Debug,
    /// Trace-level noise.
    Trace,
}

impl Severity {
    const ALL: [Self; 5] = [Self::Error, Self::Warn, Self::Info, Self::Debug, Self::Trace];

    /// Attribute keys that conventionally carry a level.
    const KEYS: [&'static str; 4] = ["level", "lvl", "severity", "severity_name"];

    /// The level spellings that map to this canonical severity.
    fn spellings(&self) -> &'static [&'static str] {
        match self {
            Self::Error => &["error", "err", "fatal", "critical", "crit"],
            Self::Warn => &["warn", "warning"],
            Self::Info => &["info", "informational", "notice"],
            Self::Debug => &["debug", "dbg"],
            Self::Trace => &["trace", "verbose"],
        }
    }

    /// Canonicalize a level value.
    pub fn from_value(value: &str) -> Option<Self> {
        let value = value.to_lowercase();
        Self::ALL
            .into_iter()
            .find(|s| s.spellings().contains(&value.as_str()))
    }
}

/// A histogram request.
#[derive(Debug, Clone)]
pub struct HistogramQuery {
    /// Range start (inclusive).
    pub start: Time,
    /// Range end (exclusive).
    pub end: Time,
    /// Requested bucket count; clamped to the engine limits.
    pub buckets: usize,
    /// Optional filter; reserved `store=`/`chunk=` selectors apply as usual.
    /// Any remaining filter forces the record-scan path.
    pub expr: Option<Expr>,
    /// Also break bucket counts down by severity.
    pub severity: bool,
}

/// One histogram bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistogramBucket {
    /// Total records in the bucket.
    pub count: u64,
    /// Per-severity counts, when the query asked for the breakdown.
    pub by_severity: BTreeMap<Severity, u64>,
}

/// The result of [`Engine::histogram`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistogramResult {
    /// Start of the first bucket.
    pub start: Time,
    /// Width of every bucket.
    pub bucket_width: Duration,
    /// The buckets, oldest first.
    pub buckets: Vec<HistogramBucket>,
    /// Set when the record-scan fallback hit its cap.
    pub truncated: bool,
}

impl Engine {
    /// Compute a time histogram of record counts over `[start, end)`.
    ///
    /// Sealed chunks are answered from timestamp side-indexes without
    /// reading records; the severity breakdown reads just the write
    /// timestamps of level-indexed positions. Unsealed chunks, and any
    /// residual filter, fall back to scanning records (capped).
    pub async fn histogram(
        &self,
        cancel: CancellationToken,
        hq: &HistogramQuery,
    ) -> Result<HistogramResult> {
        let query = Query {
            start: Some(hq.start),
            end: Some(hq.end),
            expr: hq.expr.clone(),
            ..Default::default()
        };
        let prepared = self.prepare(&query, None).await?;

        let buckets = hq.buckets.clamp(1, self.config().max_timechart_buckets);
        let span = hq.end.timestamp_nanos() - hq.start.timestamp_nanos();
        let width = span / buckets as i64;
        if width <= 0 {
            return Ok(HistogramResult {
                start: hq.start,
                bucket_width: Duration::from_nanos(0),
                buckets: vec![],
                truncated: false,
            });
        }

        let mut out = vec![HistogramBucket::default(); buckets];
        let mut truncated = false;
        let mut scanned = 0usize;
        let filtered = prepared.nq.expr.is_some();

        for target in &prepared.targets {
            for meta in &target.selected {
                if meta.sealed && !filtered {
                    // compute into a chunk-local set of buckets so a
                    // mid-way index failure can fall back to scanning
                    // without double counting
                    if let Some(partial) = self
                        .histogram_fast_chunk(
                            &target.chunk_store,
                            target.index_store.as_deref(),
                            meta,
                            hq,
                            width,
                            buckets,
                        )
                        .await
                    {
                        for (dst, src) in out.iter_mut().zip(partial) {
                            dst.count += src.count;
                            for (sev, n) in src.by_severity {
                                *dst.by_severity.entry(sev).or_insert(0) += n;
                            }
                        }
                        continue;
                    }
                }

                // record-scan fallback for active chunks and residual filters
                let (strategy, _) = plan_chunk(
                    &prepared.nq,
                    meta,
                    &target.chunk_store,
                    target.index_store.as_ref(),
                    self.tokenizer(),
                    None,
                )
                .await?;
                let ScanStrategy::Scan(plan) = strategy else { continue };
                let mut scanner = ChunkScanner::new(
                    plan,
                    Arc::clone(&target.chunk_store),
                    Arc::clone(self.tokenizer()),
                    false,
                    cancel.clone(),
                    self.config().cancel_poll_stride,
                );

                while let Some(record) = scanner.next().await? {
                    if let Some(i) = bucket_index(record.write_ts, hq.start, width, buckets) {
                        out[i].count += 1;
                        if hq.severity {
                            if let Some(sev) =
                                record_severity(&record, self.tokenizer().as_ref())
                            {
                                *out[i].by_severity.entry(sev).or_insert(0) += 1;
                            }
                        }
                    }
                    scanned += 1;
                    if scanned >= self.config().record_scan_cap {
                        truncated = true;
                        break;
                    }
                }
                if truncated {
                    break;
                }
            }
            if truncated {
                break;
            }
        }

        Ok(HistogramResult {
            start: hq.start,
            bucket_width: Duration::from_nanos(width as u64),
            buckets: out,
            truncated,
        })
    }

    /// Answer one sealed chunk from its indexes, or `None` when the chunk
    /// must be scanned instead.
    async fn histogram_fast_chunk(
        &self,
        chunk_store: &Arc<dyn ChunkStore>,
        index_store: Option<&dyn IndexStore>,
        meta: &ChunkMeta,
        hq: &HistogramQuery,
        width: i64,
        buckets: usize,
    ) -> Option<Vec<HistogramBucket>> {
        let mut out = vec![HistogramBucket::default(); buckets];

        // bucket counts from side-index edge positions
        let mut prev = edge_position(chunk_store, meta, hq.start).await?;
        for (i, bucket) in out.iter_mut().enumerate() {
            let edge = if i + 1 == buckets {
                hq.end
            } else {
                Time::from_timestamp_nanos(hq.start.timestamp_nanos() + width * (i as i64 + 1))
            };
            let next = edge_position(chunk_store, meta, edge).await?;
            bucket.count += next.saturating_sub(prev);
            prev = next;
        }

        if !hq.severity {
            return Some(out);
        }
        let index_store = index_store?;

        // level positions from both the attribute and body kv indexes,
        // deduplicated, then bucketed by their write timestamps alone
        for sev in Severity::ALL {
            let mut level_positions: Vec<u64> = vec![];
            for key in Severity::KEYS {
                for value in sev.spellings() {
                    if let Ok(reader) = index_store.attr_kv_index(meta.id).await {
                        if let Ok(Some(list)) = reader.lookup(key, value).await {
                            level_positions = positions::union(&level_positions, &list);
                        }
                    }
                    if let Ok(reader) = index_store.kv_index(meta.id).await {
                        if let Ok(Some(list)) = reader.lookup(key, value).await {
                            level_positions = positions::union(&level_positions, &list);
                        }
                    }
                }
            }
            if level_positions.is_empty() {
                continue;
            }

            let timestamps = chunk_store
                .read_write_timestamps(meta.id, &level_positions)
                .await
                .ok()?;
            for ts in timestamps {
                if let Some(i) = bucket_index(ts, hq.start, width, buckets) {
                    *out[i].by_severity.entry(sev).or_insert(0) += 1;
                }
            }
        }
        debug!(chunk_id=%meta.id, "histogram answered from indexes");
        Some(out)
    }
}

fn bucket_index(t: Time, start: Time, width: i64, buckets: usize) -> Option<usize> {
    let offset = t.timestamp_nanos() - start.timestamp_nanos();
    if offset < 0 || offset >= width * buckets as i64 {
        return None;
    }
    Some(((offset / width) as usize).min(buckets - 1))
}

async fn edge_position(
    chunk_store: &Arc<dyn ChunkStore>,
    meta: &ChunkMeta,
    t: Time,
) -> Option<u64> {
    match chunk_store.find_start_position(meta.id, t).await {
        Ok(Some(p)) => Some(p),
        Ok(None) => Some(meta.record_count),
        Err(_) => None,
    }
}

/// Derive a record's severity from its attributes or extracted pairs.
fn record_severity(record: &Record, tokenizer: &dyn Tokenizer) -> Option<Severity> {
    for key in Severity::KEYS {
        if let Some(value) = record
            .attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
        {
            return Severity::from_value(value);
        }
    }
    for (key, value) in tokenizer.kv_pairs(&record.raw) {
        if Severity::KEYS.iter().any(|k| key.eq_ignore_ascii_case(k)) {
            return Severity::from_value(&value);
        }
    }
    None
}
