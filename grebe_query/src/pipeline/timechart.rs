//! The `timechart` operator: time-bucketed counting with an index-only fast
//! path.

use crate::{pipeline::TimechartSpec, Engine, Query, Result};
use data_types::{ChunkMeta, Record, TableResult};
use grebe_time::Time;
use itertools::Itertools;
use std::collections::BTreeMap;
use tracing::debug;

impl Engine {
    fn clamp_buckets(&self, spec: &TimechartSpec) -> usize {
        spec.buckets
            .unwrap_or(self.config().default_timechart_buckets)
            .clamp(1, self.config().max_timechart_buckets)
    }

    /// Index-only bucketing: counts come from timestamp side-index binary
    /// searches at bucket edges, `O(buckets · log n)` per chunk with zero
    /// record reads.
    ///
    /// Returns `None` when ineligible (a filter, no explicit bounds, an
    /// unsealed chunk, or a side-index failure), in which case the caller
    /// runs the scanning path.
    pub(crate) async fn timechart_fast(
        &self,
        query: &Query,
        spec: &TimechartSpec,
    ) -> Result<Option<TableResult>> {
        let prepared = self.prepare(query, None).await?;
        let nq = &prepared.nq;
        if nq.expr.is_some() || nq.pos.is_some() {
            return Ok(None);
        }
        let (Some(start), Some(end)) = (nq.bounds.lower, nq.bounds.upper) else {
            return Ok(None);
        };

        let buckets = self.clamp_buckets(spec);
        let span = end.timestamp_nanos() - start.timestamp_nanos();
        let width = span / buckets as i64;
        if width <= 0 {
            return Ok(Some(empty_table(spec)));
        }

        let mut counts = vec![0u64; buckets];
        for target in &prepared.targets {
            for meta in &target.selected {
                if !meta.sealed {
                    return Ok(None);
                }

                let mut prev = match edge_position(&target.chunk_store, meta, start).await {
                    Some(p) => p,
                    None => return Ok(None),
                };
                for (i, count) in counts.iter_mut().enumerate() {
                    // the last edge is exactly `end` so integer width
                    // rounding never drops the tail of the range
                    let edge = if i + 1 == buckets {
                        end
                    } else {
                        Time::from_timestamp_nanos(
                            start.timestamp_nanos() + width * (i as i64 + 1),
                        )
                    };
                    let next = match edge_position(&target.chunk_store, meta, edge).await {
                        Some(p) => p,
                        None => return Ok(None),
                    };
                    *count += next.saturating_sub(prev);
                    prev = next;
                }
            }
        }
        debug!(buckets, "timechart answered from timestamp side-indexes");

        let rows = counts
            .iter()
            .enumerate()
            .map(|(i, count)| {
                vec![
                    bucket_label(start, width, i),
                    count.to_string(),
                ]
            })
            .collect();

        Ok(Some(TableResult {
            columns: vec!["_time".to_string(), "count".to_string()],
            rows,
            truncated: false,
        }))
    }

    /// Scanning path: bin already-collected (and pre-op processed) records.
    pub(crate) fn timechart_slow(
        &self,
        records: &[Record],
        spec: &TimechartSpec,
        start: Option<Time>,
        end: Option<Time>,
    ) -> Result<TableResult> {
        let (start, end) = match (start, end) {
            (Some(s), Some(e)) if s <= e => (s, e),
            (Some(e), Some(s)) => (s, e),
            _ => {
                let Some(min) = records.iter().map(|r| r.write_ts).min() else {
                    return Ok(empty_table(spec));
                };
                let max = records.iter().map(|r| r.write_ts).max().expect("non-empty");
                // a half-open range needs one step past the newest record
                (min, max + std::time::Duration::from_nanos(1))
            }
        };

        let buckets = self.clamp_buckets(spec);
        let width = (end.timestamp_nanos() - start.timestamp_nanos()) / buckets as i64;
        if width <= 0 {
            return Ok(empty_table(spec));
        }

        let bucket_of = |t: Time| -> Option<usize> {
            if t < start || t >= end {
                return None;
            }
            let idx = ((t.timestamp_nanos() - start.timestamp_nanos()) / width) as usize;
            Some(idx.min(buckets - 1))
        };

        match &spec.group_by {
            None => {
                let mut counts = vec![0u64; buckets];
                for r in records {
                    if let Some(i) = bucket_of(r.write_ts) {
                        counts[i] += 1;
                    }
                }
                let rows = counts
                    .iter()
                    .enumerate()
                    .map(|(i, count)| vec![bucket_label(start, width, i), count.to_string()])
                    .collect();
                Ok(TableResult {
                    columns: vec!["_time".to_string(), "count".to_string()],
                    rows,
                    truncated: false,
                })
            }
            Some(field) => {
                // group -> per-bucket counts; the empty group collects
                // counted records missing the attribute
                let mut groups: BTreeMap<String, Vec<u64>> = BTreeMap::new();
                for r in records {
                    let Some(i) = bucket_of(r.write_ts) else { continue };
                    let group = r.attrs.get(field).cloned().unwrap_or_default();
                    groups.entry(group).or_insert_with(|| vec![0u64; buckets])[i] += 1;
                }

                let rows = (0..buckets)
                    .cartesian_product(groups.iter())
                    .map(|(i, (group, counts))| {
                        vec![
                            bucket_label(start, width, i),
                            group.clone(),
                            counts[i].to_string(),
                        ]
                    })
                    .collect();
                Ok(TableResult {
                    columns: vec!["_time".to_string(), field.clone(), "count".to_string()],
                    rows,
                    truncated: false,
                })
            }
        }
    }
}

fn bucket_label(start: Time, width: i64, i: usize) -> String {
    Time::from_timestamp_nanos(start.timestamp_nanos() + width * i as i64).to_rfc3339()
}

fn empty_table(spec: &TimechartSpec) -> TableResult {
    let mut columns = vec!["_time".to_string()];
    if let Some(field) = &spec.group_by {
        columns.push(field.clone());
    }
    columns.push("count".to_string());
    TableResult {
        columns,
        rows: vec![],
        truncated: false,
    }
}

/// First position at or after `t`, from the timestamp side-index; `None`
/// means the caller should fall back to scanning.
async fn edge_position(
    chunk_store: &std::sync::Arc<dyn crate::ChunkStore>,
    meta: &ChunkMeta,
    t: Time,
) -> Option<u64> {
    match chunk_store.find_start_position(meta.id, t).await {
        Ok(Some(p)) => Some(p),
        // every record is earlier than t
        Ok(None) => Some(meta.record_count),
        Err(_) => None,
    }
}
