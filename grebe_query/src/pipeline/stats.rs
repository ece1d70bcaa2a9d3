//! The `stats` aggregator: grouped accumulation with optional time binning
//! and gap-filling.

use crate::{
    pipeline::{ops::record_field, AggSpec, GroupSpec, StatsSpec},
    Error, Result,
};
use data_types::{Record, TableResult};
use grebe_time::Time;
use hashbrown::{HashMap, HashSet};
use predicate::{parse_num, Value};
use std::cmp::Ordering;

/// Byte joining group values into one hashable key. Reserved: it cannot
/// appear inside attribute values that originated as text.
const GROUP_KEY_SEPARATOR: u8 = 0x00;

/// The aggregate functions `stats` understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    Dcount,
    Median,
    First,
    Last,
    Values,
}

impl AggFunc {
    fn from_name(name: &str) -> Result<Self> {
        Ok(match name.to_lowercase().as_str() {
            "count" => Self::Count,
            "sum" => Self::Sum,
            "avg" => Self::Avg,
            "min" => Self::Min,
            "max" => Self::Max,
            "dcount" => Self::Dcount,
            "median" => Self::Median,
            "first" => Self::First,
            "last" => Self::Last,
            "values" => Self::Values,
            _ => {
                return Err(Error::UnknownAggregate {
                    name: name.to_string(),
                })
            }
        })
    }

    fn accumulator(&self) -> Accumulator {
        match self {
            Self::Count => Accumulator::Count(0),
            Self::Sum => Accumulator::Sum { sum: 0.0, seen: false },
            Self::Avg => Accumulator::Avg { sum: 0.0, n: 0 },
            Self::Min => Accumulator::Min(None),
            Self::Max => Accumulator::Max(None),
            Self::Dcount => Accumulator::Dcount(Distinct::default()),
            Self::Median => Accumulator::Median(vec![]),
            Self::First => Accumulator::First(None),
            Self::Last => Accumulator::Last(None),
            Self::Values => Accumulator::Values(Distinct::default()),
        }
    }
}

/// Distinct strings in first-seen order.
#[derive(Debug, Default, Clone)]
struct Distinct {
    order: Vec<String>,
    seen: HashSet<String>,
}

impl Distinct {
    fn insert(&mut self, value: String) {
        if self.seen.insert(value.clone()) {
            self.order.push(value);
        }
    }
}

#[derive(Debug, Clone)]
enum Accumulator {
    Count(u64),
    Sum { sum: f64, seen: bool },
    Avg { sum: f64, n: u64 },
    Min(Option<f64>),
    Max(Option<f64>),
    Dcount(Distinct),
    Median(Vec<f64>),
    First(Option<String>),
    Last(Option<String>),
    Values(Distinct),
}

impl Accumulator {
    fn update(&mut self, input: &Value) {
        if input.is_missing() {
            return;
        }
        match self {
            Self::Count(n) => *n += 1,
            Self::Sum { sum, seen } => {
                if let Some(v) = input.as_num() {
                    *sum += v;
                    *seen = true;
                }
            }
            Self::Avg { sum, n } => {
                if let Some(v) = input.as_num() {
                    *sum += v;
                    *n += 1;
                }
            }
            Self::Min(v) => {
                if let Some(x) = input.as_num() {
                    *v = Some(v.map_or(x, |cur: f64| cur.min(x)));
                }
            }
            Self::Max(v) => {
                if let Some(x) = input.as_num() {
                    *v = Some(v.map_or(x, |cur: f64| cur.max(x)));
                }
            }
            Self::Dcount(d) | Self::Values(d) => d.insert(input.render()),
            Self::Median(vals) => {
                if let Some(x) = input.as_num() {
                    vals.push(x);
                }
            }
            Self::First(v) => {
                if v.is_none() {
                    *v = Some(input.render());
                }
            }
            Self::Last(v) => *v = Some(input.render()),
        }
    }

    /// Render the final cell. Missing results are the empty string; only
    /// `count` and `dcount` have non-missing zero states.
    fn result(&self) -> String {
        match self {
            Self::Count(n) => n.to_string(),
            Self::Sum { sum, seen } => seen.then(|| Value::Num(*sum).render()).unwrap_or_default(),
            Self::Avg { sum, n } => {
                if *n == 0 {
                    String::new()
                } else {
                    Value::Num(sum / *n as f64).render()
                }
            }
            Self::Min(v) | Self::Max(v) => {
                v.map(|x| Value::Num(x).render()).unwrap_or_default()
            }
            Self::Dcount(d) => d.order.len().to_string(),
            Self::Median(vals) => {
                if vals.is_empty() {
                    return String::new();
                }
                let mut sorted = vals.clone();
                sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
                let mid = sorted.len() / 2;
                let median = if sorted.len() % 2 == 1 {
                    sorted[mid]
                } else {
                    (sorted[mid - 1] + sorted[mid]) / 2.0
                };
                Value::Num(median).render()
            }
            Self::First(v) | Self::Last(v) => v.clone().unwrap_or_default(),
            Self::Values(d) => d.order.join(","),
        }
    }
}

#[derive(Debug)]
struct ResolvedAgg {
    func: AggFunc,
    spec: AggSpec,
    column: String,
}

/// One group value: either plain text or a time bin.
#[derive(Debug, Clone)]
enum GroupCell {
    Text(String),
    Bin(Time),
}

impl GroupCell {
    fn render(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Bin(t) => t.to_rfc3339(),
        }
    }

    fn cmp_cell(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Bin(a), Self::Bin(b)) => a.cmp(b),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            // a column is either always a bin or never one
            (Self::Bin(_), Self::Text(_)) => Ordering::Less,
            (Self::Text(_), Self::Bin(_)) => Ordering::Greater,
        }
    }
}

#[derive(Debug)]
struct GroupState {
    cells: Vec<GroupCell>,
    accs: Vec<Accumulator>,
}

/// Streaming group-by accumulator behind the `stats` operator.
#[derive(Debug)]
pub(crate) struct StatsAggregator {
    aggs: Vec<ResolvedAgg>,
    groups: Vec<GroupSpec>,
    /// `(group slot, width in nanos, timestamp field)` of the bin group.
    bin: Option<(usize, i64, Option<String>)>,
    index: HashMap<Vec<u8>, usize>,
    states: Vec<GroupState>,
    cap: usize,
    truncated: bool,
}

impl StatsAggregator {
    pub(crate) fn new(spec: &StatsSpec, cap: usize) -> Result<Self> {
        if spec.aggregates.is_empty() {
            return Err(Error::UnsupportedPipeline {
                reason: "stats requires at least one aggregate".to_string(),
            });
        }

        let mut bin = None;
        for (slot, group) in spec.groups.iter().enumerate() {
            if let GroupSpec::Bin { width, field } = group {
                if bin.is_some() {
                    return Err(Error::UnsupportedPipeline {
                        reason: "at most one bin() group is allowed".to_string(),
                    });
                }
                let nanos = width.as_nanos();
                if nanos == 0 || nanos > i64::MAX as u128 {
                    return Err(Error::InvalidBinDuration {
                        reason: format!("{:?}", width),
                    });
                }
                bin = Some((slot, nanos as i64, field.clone()));
            }
        }

        let aggs = spec
            .aggregates
            .iter()
            .map(|a| {
                let func = AggFunc::from_name(&a.func)?;
                let column = match (&a.alias, &a.arg) {
                    (Some(alias), _) => alias.clone(),
                    (None, None) => a.func.to_lowercase(),
                    (None, Some(arg)) => format!("{}_{}", a.func.to_lowercase(), arg),
                };
                Ok(ResolvedAgg {
                    func,
                    spec: a.clone(),
                    column,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            aggs,
            groups: spec.groups.clone(),
            bin,
            index: HashMap::new(),
            states: vec![],
            cap,
            truncated: false,
        })
    }

    /// Fold one record in. Records whose bin timestamp cannot be resolved
    /// are skipped entirely.
    pub(crate) fn push(&mut self, record: &Record) {
        let mut cells = Vec::with_capacity(self.groups.len());
        for group in &self.groups {
            match group {
                GroupSpec::Field(name) => {
                    cells.push(GroupCell::Text(record_field(record, name).render()));
                }
                GroupSpec::Bin { field, .. } => {
                    let (_, width, _) = self.bin.as_ref().expect("bin group registered");
                    let Some(ts) = bin_timestamp(record, field.as_deref()) else { return };
                    cells.push(GroupCell::Bin(ts.truncate_to(*width)));
                }
            }
        }

        let key = group_key(&cells);
        let slot = match self.index.get(&key) {
            Some(&slot) => slot,
            None => {
                // over the cardinality cap: silently drop new groups
                if self.states.len() >= self.cap {
                    self.truncated = true;
                    return;
                }
                let slot = self.states.len();
                self.states.push(GroupState {
                    cells,
                    accs: self.aggs.iter().map(|a| a.func.accumulator()).collect(),
                });
                self.index.insert(key, slot);
                slot
            }
        };

        for (agg, acc) in self.aggs.iter().zip(&mut self.states[slot].accs) {
            let input = match &agg.spec.arg {
                Some(expr) => expr.eval(&|name| record_field(record, name)),
                // a bare count() treats every record as contributing
                None => Value::Num(1.0),
            };
            acc.update(&input);
        }
    }

    /// Produce the final table: gap-fill bins, sort rows, render cells.
    pub(crate) fn finish(mut self, start: Option<Time>, end: Option<Time>) -> TableResult {
        if let Some((slot, width)) = self.bin.as_ref().map(|(slot, width, _)| (*slot, *width)) {
            self.fill_gaps(slot, width, start, end);
        }

        if self.states.is_empty() && self.groups.is_empty() {
            self.states.push(GroupState {
                cells: vec![],
                accs: self.aggs.iter().map(|a| a.func.accumulator()).collect(),
            });
        }

        self.states.sort_by(|a, b| {
            a.cells
                .iter()
                .zip(&b.cells)
                .map(|(x, y)| x.cmp_cell(y))
                .find(|o| *o != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        });

        let mut columns: Vec<String> = self
            .groups
            .iter()
            .map(|g| match g {
                GroupSpec::Field(name) => name.clone(),
                GroupSpec::Bin { .. } => "_time".to_string(),
            })
            .collect();
        columns.extend(self.aggs.iter().map(|a| a.column.clone()));

        let rows = self
            .states
            .iter()
            .map(|state| {
                let mut row: Vec<String> = state.cells.iter().map(GroupCell::render).collect();
                row.extend(state.accs.iter().map(Accumulator::result));
                row
            })
            .collect();

        TableResult {
            columns,
            rows,
            truncated: self.truncated,
        }
    }

    /// Insert zero-valued rows for every bin between the range ends for
    /// every combination of non-bin group values.
    fn fill_gaps(&mut self, slot: usize, width: i64, start: Option<Time>, end: Option<Time>) {
        let existing_bins: Vec<Time> = self
            .states
            .iter()
            .filter_map(|s| match s.cells[slot] {
                GroupCell::Bin(t) => Some(t),
                GroupCell::Text(_) => None,
            })
            .collect();

        let (first, last) = match (start, end) {
            (Some(start), Some(end)) => (start.truncate_to(width), end.truncate_to(width)),
            _ => {
                let Some(min) = existing_bins.iter().min().copied() else { return };
                let max = existing_bins.iter().max().copied().expect("non-empty");
                (min, max)
            }
        };

        // distinct non-bin combinations, first-seen order
        let mut combos: Vec<Vec<GroupCell>> = vec![];
        let mut combo_keys: HashSet<Vec<u8>> = HashSet::new();
        for state in &self.states {
            let combo: Vec<GroupCell> = state
                .cells
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != slot)
                .map(|(_, c)| c.clone())
                .collect();
            if combo_keys.insert(group_key(&combo)) {
                combos.push(combo);
            }
        }

        let step = std::time::Duration::from_nanos(width as u64);
        for combo in combos {
            let mut bin = first;
            loop {
                let mut cells = combo.clone();
                cells.insert(slot, GroupCell::Bin(bin));
                let key = group_key(&cells);
                if !self.index.contains_key(&key) && self.states.len() < self.cap {
                    let slot_idx = self.states.len();
                    self.states.push(GroupState {
                        cells,
                        accs: self.aggs.iter().map(|a| a.func.accumulator()).collect(),
                    });
                    self.index.insert(key, slot_idx);
                }

                if bin >= last {
                    break;
                }
                bin = bin + step;
            }
        }
    }
}

fn group_key(cells: &[GroupCell]) -> Vec<u8> {
    let mut key = vec![];
    for cell in cells {
        match cell {
            GroupCell::Text(s) => key.extend_from_slice(s.as_bytes()),
            GroupCell::Bin(t) => key.extend_from_slice(t.timestamp_nanos().to_string().as_bytes()),
        }
        key.push(GROUP_KEY_SEPARATOR);
    }
    key
}

/// Resolve the timestamp a bin group buckets by.
fn bin_timestamp(record: &Record, field: Option<&str>) -> Option<Time> {
    match field.unwrap_or("_write_ts") {
        "_write_ts" => Some(record.write_ts),
        "_ingest_ts" => Some(record.ingest_ts),
        "_source_ts" => record.source_ts,
        name => {
            let value = record.attrs.get(name)?;
            if let Ok(secs) = value.parse::<i64>() {
                return Some(Time::from_timestamp(secs, 0));
            }
            if let Some(secs) = parse_num(value) {
                return Some(Time::from_timestamp_nanos((secs * 1e9) as i64));
            }
            Time::from_rfc3339(value).ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{AggSpec, GroupSpec, StatsSpec};
    use assert_matches::assert_matches;
    use data_types::{ChunkId, StoreId};
    use predicate::ScalarExpr;
    use std::time::Duration;

    fn record(secs: i64, attrs: &[(&str, &str)]) -> Record {
        Record {
            write_ts: Time::from_timestamp(secs, 0),
            ingest_ts: Time::from_timestamp(secs, 0),
            source_ts: None,
            source_id: "src".to_string(),
            store_id: StoreId::new(),
            chunk_id: ChunkId::new(),
            position: 0,
            attrs: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            raw: vec![],
        }
    }

    fn agg(func: &str, arg: Option<&str>) -> AggSpec {
        AggSpec {
            func: func.to_string(),
            arg: arg.map(ScalarExpr::field),
            alias: None,
        }
    }

    fn spec(aggregates: Vec<AggSpec>, groups: Vec<GroupSpec>) -> StatsSpec {
        StatsSpec { aggregates, groups }
    }

    #[test]
    fn unknown_aggregate_is_rejected() {
        let err = StatsAggregator::new(&spec(vec![agg("p99", None)], vec![]), 100).unwrap_err();
        assert_matches!(err, Error::UnknownAggregate { name } if name == "p99");
    }

    #[test]
    fn zero_bin_duration_is_rejected() {
        let s = spec(
            vec![agg("count", None)],
            vec![GroupSpec::Bin {
                width: Duration::from_secs(0),
                field: None,
            }],
        );
        assert_matches!(
            StatsAggregator::new(&s, 100),
            Err(Error::InvalidBinDuration { .. })
        );
    }

    #[test]
    fn two_bins_are_rejected() {
        let bin = GroupSpec::Bin {
            width: Duration::from_secs(60),
            field: None,
        };
        let s = spec(vec![agg("count", None)], vec![bin.clone(), bin]);
        assert_matches!(
            StatsAggregator::new(&s, 100),
            Err(Error::UnsupportedPipeline { .. })
        );
    }

    #[test]
    fn count_by_field() {
        let s = spec(
            vec![agg("count", None)],
            vec![GroupSpec::Field("level".to_string())],
        );
        let mut a = StatsAggregator::new(&s, 100).unwrap();
        for r in [
            record(0, &[("level", "error")]),
            record(1, &[("level", "info")]),
            record(2, &[("level", "error")]),
        ] {
            a.push(&r);
        }
        let table = a.finish(None, None);
        assert_eq!(table.columns, vec!["level", "count"]);
        assert_eq!(
            table.rows,
            vec![
                vec!["error".to_string(), "2".to_string()],
                vec!["info".to_string(), "1".to_string()],
            ]
        );
    }

    #[test]
    fn numeric_aggregates_skip_non_numeric() {
        let s = spec(
            vec![
                agg("sum", Some("n")),
                agg("avg", Some("n")),
                agg("min", Some("n")),
                agg("max", Some("n")),
                agg("median", Some("n")),
            ],
            vec![],
        );
        let mut a = StatsAggregator::new(&s, 100).unwrap();
        for r in [
            record(0, &[("n", "4")]),
            record(1, &[("n", "oops")]),
            record(2, &[("n", "8")]),
            record(3, &[]),
            record(4, &[("n", "3")]),
        ] {
            a.push(&r);
        }
        let table = a.finish(None, None);
        assert_eq!(
            table.columns,
            vec!["sum_n", "avg_n", "min_n", "max_n", "median_n"]
        );
        assert_eq!(
            table.rows,
            vec![vec![
                "15".to_string(),
                "5".to_string(),
                "3".to_string(),
                "8".to_string(),
                "4".to_string(),
            ]]
        );
    }

    #[test]
    fn count_with_argument_counts_non_missing() {
        let s = spec(vec![agg("count", Some("n"))], vec![]);
        let mut a = StatsAggregator::new(&s, 100).unwrap();
        a.push(&record(0, &[("n", "1")]));
        a.push(&record(1, &[]));
        let table = a.finish(None, None);
        assert_eq!(table.rows, vec![vec!["1".to_string()]]);
    }

    #[test]
    fn distinct_first_last_values() {
        let s = spec(
            vec![
                agg("dcount", Some("u")),
                agg("first", Some("u")),
                agg("last", Some("u")),
                agg("values", Some("u")),
            ],
            vec![],
        );
        let mut a = StatsAggregator::new(&s, 100).unwrap();
        for r in [
            record(0, &[("u", "alice")]),
            record(1, &[("u", "bob")]),
            record(2, &[("u", "alice")]),
        ] {
            a.push(&r);
        }
        let table = a.finish(None, None);
        assert_eq!(
            table.rows,
            vec![vec![
                "2".to_string(),
                "alice".to_string(),
                "alice".to_string(),
                "alice,bob".to_string(),
            ]]
        );
    }

    #[test]
    fn empty_input_without_groups_yields_default_row() {
        let s = spec(vec![agg("count", None), agg("sum", Some("n"))], vec![]);
        let a = StatsAggregator::new(&s, 100).unwrap();
        let table = a.finish(None, None);
        assert_eq!(table.rows, vec![vec!["0".to_string(), String::new()]]);
    }

    #[test]
    fn empty_input_with_groups_yields_no_rows() {
        let s = spec(
            vec![agg("count", None)],
            vec![GroupSpec::Field("level".to_string())],
        );
        let a = StatsAggregator::new(&s, 100).unwrap();
        assert!(a.finish(None, None).rows.is_empty());
    }

    #[test]
    fn cardinality_cap_truncates() {
        let s = spec(
            vec![agg("count", None)],
            vec![GroupSpec::Field("k".to_string())],
        );
        let mut a = StatsAggregator::new(&s, 2).unwrap();
        for i in 0..5 {
            a.push(&record(i, &[("k", &format!("g{}", i))]));
        }
        let table = a.finish(None, None);
        assert!(table.truncated);
        assert_eq!(table.rows.len(), 2);
    }

    #[test]
    fn bin_groups_and_gap_fill_over_explicit_range() {
        // records at t+1m, t+3m, t+6m, t+11m with two levels; 5m bins over
        // [t, t+15m] must fill every level x bucket combination
        let s = spec(
            vec![agg("count", None)],
            vec![
                GroupSpec::Bin {
                    width: Duration::from_secs(300),
                    field: None,
                },
                GroupSpec::Field("level".to_string()),
            ],
        );
        let mut a = StatsAggregator::new(&s, 100).unwrap();
        for (m, level) in [(1, "error"), (3, "info"), (6, "error"), (11, "info")] {
            a.push(&record(m * 60, &[("level", level)]));
        }
        let table = a.finish(Some(Time::from_timestamp(0, 0)), Some(Time::from_timestamp(900, 0)));

        assert_eq!(table.columns, vec!["_time", "level", "count"]);
        // 2 levels x 4 bins (the range end lands exactly on a bin boundary)
        assert_eq!(table.rows.len(), 8);

        let find = |bin_secs: i64, level: &str| {
            let bin = Time::from_timestamp(bin_secs, 0).to_rfc3339();
            table
                .rows
                .iter()
                .find(|r| r[0] == bin && r[1] == level)
                .map(|r| r[2].clone())
                .unwrap()
        };
        assert_eq!(find(0, "error"), "1");
        assert_eq!(find(0, "info"), "1");
        assert_eq!(find(300, "error"), "1");
        assert_eq!(find(300, "info"), "0");
        assert_eq!(find(600, "error"), "0");
        assert_eq!(find(600, "info"), "1");
        assert_eq!(find(900, "error"), "0");
        assert_eq!(find(900, "info"), "0");

        // rows are sorted chronologically first
        let times: Vec<&String> = table.rows.iter().map(|r| &r[0]).collect();
        let mut sorted = times.clone();
        sorted.sort();
        assert_eq!(times, sorted);
    }

    #[test]
    fn gap_fill_uses_data_range_without_explicit_bounds() {
        let s = spec(
            vec![agg("count", None)],
            vec![GroupSpec::Bin {
                width: Duration::from_secs(60),
                field: None,
            }],
        );
        let mut a = StatsAggregator::new(&s, 100).unwrap();
        a.push(&record(0, &[]));
        a.push(&record(180, &[]));
        let table = a.finish(None, None);
        // bins 0m..3m inclusive
        assert_eq!(table.rows.len(), 4);
        assert_eq!(table.rows[1][1], "0");
        assert_eq!(table.rows[2][1], "0");
    }

    #[test]
    fn bin_timestamp_sources() {
        let mut r = record(10, &[("ts_int", "100"), ("ts_float", "1.5"), ("bad", "x")]);
        r.source_ts = None;

        assert_eq!(bin_timestamp(&r, None), Some(Time::from_timestamp(10, 0)));
        assert_eq!(
            bin_timestamp(&r, Some("_ingest_ts")),
            Some(Time::from_timestamp(10, 0))
        );
        // missing source_ts skips the record
        assert_eq!(bin_timestamp(&r, Some("_source_ts")), None);
        assert_eq!(
            bin_timestamp(&r, Some("ts_int")),
            Some(Time::from_timestamp(100, 0))
        );
        assert_eq!(
            bin_timestamp(&r, Some("ts_float")),
            Some(Time::from_timestamp_nanos(1_500_000_000))
        );
        assert_eq!(bin_timestamp(&r, Some("bad")), None);
        assert_eq!(bin_timestamp(&r, Some("absent")), None);

        let r2 = record(0, &[("when", "2022-07-01T00:00:00Z")]);
        assert_eq!(
            bin_timestamp(&r2, Some("when")),
            Some(Time::from_rfc3339("2022-07-01T00:00:00Z").unwrap())
        );
    }

    #[test]
    fn aliases_override_column_names() {
        let s = spec(
            vec![AggSpec {
                func: "count".to_string(),
                arg: None,
                alias: Some("events".to_string()),
            }],
            vec![],
        );
        let a = StatsAggregator::new(&s, 100).unwrap();
        assert_eq!(a.finish(None, None).columns, vec!["events"]);
    }
}
