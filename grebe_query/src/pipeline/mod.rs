//! The post-scan pipeline: record-phase operators, at most one aggregation,
//! and table-phase operators over the aggregated result.

pub mod ops;
pub mod stats;
pub mod timechart;
pub mod viz;

use crate::{fields, Engine, Error, Query, Result};
use data_types::{Record, TableResult};
use predicate::{Expr, ScalarExpr};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One sort key of the `sort` operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortField {
    /// Field (or column) to sort by.
    pub field: String,
    /// Largest first.
    pub descending: bool,
}

/// One aggregate of a `stats` operator.
///
/// The function is carried by name, as parsed from the query text; it is
/// resolved (and validated) when the aggregator is built.
#[derive(Debug, Clone, PartialEq)]
pub struct AggSpec {
    /// Aggregate function name (`count`, `sum`, ...).
    pub func: String,
    /// Argument expression, when the function takes one.
    pub arg: Option<ScalarExpr>,
    /// Output column override.
    pub alias: Option<String>,
}

/// One grouping of a `stats` operator.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupSpec {
    /// Group by a field's value.
    Field(String),
    /// Group by a time bin.
    Bin {
        /// Bin width.
        width: Duration,
        /// Timestamp source; defaults to `_write_ts`.
        field: Option<String>,
    },
}

/// The `stats` operator configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSpec {
    /// Aggregates to compute, at least one.
    pub aggregates: Vec<AggSpec>,
    /// Group-by clauses, at most one of them a bin.
    pub groups: Vec<GroupSpec>,
}

/// The `timechart` operator configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimechartSpec {
    /// Bucket count; clamped to the engine's limits, default 50.
    pub buckets: Option<usize>,
    /// Optional attribute to partition counts by.
    pub group_by: Option<String>,
}

/// A pipeline operator.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOp {
    /// Keep records (or rows) matching the expression.
    Where(Expr),
    /// Compute a field from an expression.
    Eval {
        /// Destination field.
        field: String,
        /// The expression.
        expr: ScalarExpr,
    },
    /// Sort by one or more fields.
    Sort(Vec<SortField>),
    /// Keep the first N.
    Head(usize),
    /// Keep the last N.
    Tail(usize),
    /// Keep N starting at an offset.
    Slice {
        /// Zero-based start.
        offset: usize,
        /// How many to keep.
        len: usize,
    },
    /// Rename a field or column.
    Rename {
        /// Existing name.
        from: String,
        /// New name.
        to: String,
    },
    /// Project to exactly these fields or columns.
    Fields(Vec<String>),
    /// Force record output into a flat table.
    Raw,
    /// Aggregate.
    Stats(StatsSpec),
    /// Time-bucketed counting.
    Timechart(TimechartSpec),
}

/// An ordered sequence of operators.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pipeline {
    /// The operators, in execution order.
    pub ops: Vec<PipelineOp>,
}

/// The outcome of [`Engine::run_pipeline`].
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutput {
    /// Record output: no aggregation and no `raw` operator.
    Records(Vec<Record>),
    /// Tabular output.
    Table(TableResult),
}

/// The pipeline split into phases around its (at most one) aggregation.
#[derive(Debug)]
struct Classified<'a> {
    pre: Vec<&'a PipelineOp>,
    agg: Option<&'a PipelineOp>,
    post: Vec<&'a PipelineOp>,
    raw: bool,
}

fn classify(pipeline: &Pipeline) -> Result<Classified<'_>> {
    let mut pre = vec![];
    let mut agg = None;
    let mut post = vec![];
    let mut raw = false;

    for op in &pipeline.ops {
        match op {
            PipelineOp::Stats(_) | PipelineOp::Timechart(_) => {
                if agg.is_some() {
                    return Err(Error::UnsupportedPipeline {
                        reason: "more than one aggregation operator".to_string(),
                    });
                }
                agg = Some(op);
            }
            PipelineOp::Raw => {
                if agg.is_some() {
                    return Err(Error::UnsupportedPipeline {
                        reason: "raw output cannot follow an aggregation".to_string(),
                    });
                }
                raw = true;
            }
            op if agg.is_none() => pre.push(op),
            op => post.push(op),
        }
    }

    if raw && agg.is_some() {
        return Err(Error::UnsupportedPipeline {
            reason: "raw output cannot be combined with an aggregation".to_string(),
        });
    }

    Ok(Classified {
        pre,
        agg,
        post,
        raw,
    })
}

/// The limit a terminal `head n` can push down into the scan.
///
/// Only order-preserving, non-filtering operators may precede the `head`: a
/// `where` in between would make a pushed-down limit under-produce, and
/// `sort`/`tail`/`slice` need the full record set.
fn head_fast_path(pre: &[&PipelineOp]) -> Option<usize> {
    let (last, rest) = pre.split_last()?;
    let PipelineOp::Head(n) = last else { return None };
    rest.iter()
        .all(|op| {
            matches!(
                op,
                PipelineOp::Eval { .. } | PipelineOp::Rename { .. } | PipelineOp::Fields(_)
            )
        })
        .then(|| *n)
}

impl Engine {
    /// Run `pipeline` over the results of `query`.
    ///
    /// Aggregating pipelines ignore any incoming `limit` on the query:
    /// aggregates are computed over every match, never over a page.
    pub async fn run_pipeline(
        &self,
        cancel: CancellationToken,
        query: &Query,
        pipeline: &Pipeline,
    ) -> Result<PipelineOutput> {
        let classified = classify(pipeline)?;

        let mut query = query.clone();
        if classified.agg.is_some() {
            query.limit = None;
        } else if let Some(n) = head_fast_path(&classified.pre) {
            debug!(limit = n, "head-only pipeline: pushing limit into scan");
            query.limit = Some(query.limit.map_or(n, |l| l.min(n)));
        }

        // index-only timechart when nothing needs record reads
        if let Some(PipelineOp::Timechart(spec)) = classified.agg {
            if classified.pre.is_empty() && spec.group_by.is_none() {
                if let Some(mut table) = self.timechart_fast(&query, spec).await? {
                    ops::apply_table_ops(&mut table, &classified.post)?;
                    return Ok(PipelineOutput::Table(table));
                }
            }
        }

        // record collection; the scan cap only binds the timechart path
        let scan_cap = match classified.agg {
            Some(PipelineOp::Timechart(_)) => Some(self.config().record_scan_cap),
            _ => None,
        };
        let mut results = self.search(cancel, &query, None).await?;
        let mut records: Vec<Record> = vec![];
        let mut capped = false;
        while let Some(mut record) = results.next().await? {
            fields::materialize(&mut record.attrs, &record.raw, self.tokenizer().as_ref());
            records.push(record);
            if let Some(cap) = scan_cap {
                if records.len() >= cap {
                    capped = true;
                    break;
                }
            }
        }
        drop(results);

        ops::apply_record_ops(&mut records, &classified.pre, self.tokenizer().as_ref());

        let mut table = match classified.agg {
            None => {
                if classified.raw {
                    let table = ops::raw_table(&records);
                    return Ok(PipelineOutput::Table(table));
                }
                return Ok(PipelineOutput::Records(records));
            }
            Some(PipelineOp::Stats(spec)) => {
                let mut agg = stats::StatsAggregator::new(
                    spec,
                    self.config().max_group_cardinality,
                )?;
                for record in &records {
                    agg.push(record);
                }
                agg.finish(query.start, query.end)
            }
            Some(PipelineOp::Timechart(spec)) => {
                let mut table =
                    self.timechart_slow(&records, spec, query.start, query.end)?;
                table.truncated = table.truncated || capped;
                table
            }
            Some(_) => unreachable!("classification only yields aggregations"),
        };

        ops::apply_table_ops(&mut table, &classified.post)?;
        Ok(PipelineOutput::Table(table))
    }
}
