//! Record-phase and table-phase operator application.

use crate::{
    pipeline::{PipelineOp, SortField},
    runtime, Result, Tokenizer,
};
use data_types::{Record, TableResult};
use predicate::{compare_values, parse_num, Expr, Predicate, Value};
use std::{cmp::Ordering, collections::BTreeSet};

/// Resolve a field on a materialized record: specials first, then attrs.
pub(crate) fn record_field(record: &Record, name: &str) -> Value {
    match name {
        "_raw" => Value::Str(String::from_utf8_lossy(&record.raw).into_owned()),
        "_write_ts" => Value::Str(record.write_ts.to_rfc3339()),
        "_ingest_ts" => Value::Str(record.ingest_ts.to_rfc3339()),
        "_source_ts" => match record.source_ts {
            Some(t) => Value::Str(t.to_rfc3339()),
            None => Value::Missing,
        },
        name => match record.attrs.get(name) {
            Some(v) => Value::Str(v.clone()),
            None => Value::Missing,
        },
    }
}

/// Numeric-aware ordering used by `sort` on both records and rows.
fn compare_cells(a: &str, b: &str) -> Ordering {
    match (parse_num(a), parse_num(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => a.cmp(b),
    }
}

fn sorted_by<T>(items: &mut [T], fields: &[SortField], value: impl Fn(&T, &str) -> String) {
    items.sort_by(|a, b| {
        for f in fields {
            let (va, vb) = (value(a, &f.field), value(b, &f.field));
            let ord = compare_cells(&va, &vb);
            let ord = if f.descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

fn keep_tail<T>(items: &mut Vec<T>, n: usize) {
    if items.len() > n {
        items.drain(..items.len() - n);
    }
}

fn keep_slice<T>(items: &mut Vec<T>, offset: usize, len: usize) {
    if offset >= items.len() {
        items.clear();
        return;
    }
    items.drain(..offset);
    items.truncate(len);
}

/// Apply record-phase operators in order.
pub(crate) fn apply_record_ops(
    records: &mut Vec<Record>,
    ops: &[&PipelineOp],
    tokenizer: &dyn Tokenizer,
) {
    for op in ops {
        match op {
            PipelineOp::Where(expr) => {
                records.retain(|r| runtime::expr_matches(expr, r, tokenizer));
            }
            PipelineOp::Eval { field, expr } => {
                for r in records.iter_mut() {
                    let v = expr.eval(&|name| record_field(r, name));
                    if !v.is_missing() {
                        r.attrs.insert(field.clone(), v.render());
                    }
                }
            }
            PipelineOp::Sort(fields) => {
                sorted_by(records, fields, |r, name| record_field(r, name).render());
            }
            PipelineOp::Head(n) => records.truncate(*n),
            PipelineOp::Tail(n) => keep_tail(records, *n),
            PipelineOp::Slice { offset, len } => keep_slice(records, *offset, *len),
            PipelineOp::Rename { from, to } => {
                for r in records.iter_mut() {
                    if let Some(v) = r.attrs.remove(from) {
                        r.attrs.insert(to.clone(), v);
                    }
                }
            }
            PipelineOp::Fields(keep) => {
                for r in records.iter_mut() {
                    r.attrs.retain(|k, _| keep.contains(k));
                }
            }
            // raw conversion and aggregations run outside the op loop
            PipelineOp::Raw | PipelineOp::Stats(_) | PipelineOp::Timechart(_) => {}
        }
    }
}

/// Flatten records into the fixed raw table shape.
pub(crate) fn raw_table(records: &[Record]) -> TableResult {
    let mut attr_keys: BTreeSet<&str> = BTreeSet::new();
    for r in records {
        attr_keys.extend(r.attrs.keys().map(String::as_str));
    }

    let mut columns = vec![
        "_write_ts".to_string(),
        "_ingest_ts".to_string(),
        "_source_ts".to_string(),
    ];
    columns.extend(attr_keys.iter().map(|k| k.to_string()));
    columns.push("_raw".to_string());

    let rows = records
        .iter()
        .map(|r| {
            let mut row = Vec::with_capacity(columns.len());
            row.push(r.write_ts.to_rfc3339());
            row.push(r.ingest_ts.to_rfc3339());
            row.push(r.source_ts.map(|t| t.to_rfc3339()).unwrap_or_default());
            for key in &attr_keys {
                row.push(r.attrs.get(*key).cloned().unwrap_or_default());
            }
            row.push(String::from_utf8_lossy(&r.raw).into_owned());
            row
        })
        .collect();

    TableResult {
        columns,
        rows,
        truncated: false,
    }
}

fn table_field(columns: &[String], row: &[String], name: &str) -> Value {
    match columns.iter().position(|c| c == name) {
        Some(i) => Value::Str(row[i].clone()),
        None => Value::Missing,
    }
}

fn table_pred_matches(pred: &Predicate, columns: &[String], row: &[String]) -> bool {
    match pred {
        Predicate::Token { term } => {
            let term = term.to_lowercase();
            row.iter().any(|cell| cell.to_lowercase().contains(&term))
        }
        Predicate::Glob { pattern } => row.iter().any(|cell| pattern.matches(cell)),
        Predicate::Regex { pattern } => row.iter().any(|cell| pattern.matches_bytes(cell.as_bytes())),
        Predicate::Kv { key, op, value } => columns
            .iter()
            .zip(row)
            .any(|(col, cell)| key.matches(col) && runtime::value_satisfies(*op, cell, value)),
        Predicate::KeyExists { key } => columns
            .iter()
            .zip(row)
            .any(|(col, cell)| key.matches(col) && !cell.is_empty()),
        Predicate::ValueExists { value } => row.iter().any(|cell| value.matches(cell)),
        Predicate::Scalar { expr, op, value } => {
            let result = expr.eval(&|name| table_field(columns, row, name));
            if result.is_missing() {
                return false;
            }
            compare_values(*op, &result.render(), value)
        }
    }
}

fn table_expr_matches(expr: &Expr, columns: &[String], row: &[String]) -> bool {
    match expr {
        Expr::And(terms) => terms.iter().all(|t| table_expr_matches(t, columns, row)),
        Expr::Or(terms) => terms.iter().any(|t| table_expr_matches(t, columns, row)),
        Expr::Not(inner) => !table_expr_matches(inner, columns, row),
        Expr::Pred(p) => table_pred_matches(p, columns, row),
    }
}

/// Apply table-phase operators in order.
pub(crate) fn apply_table_ops(table: &mut TableResult, ops: &[&PipelineOp]) -> Result<()> {
    for op in ops {
        match op {
            PipelineOp::Where(expr) => {
                let columns = table.columns.clone();
                table
                    .rows
                    .retain(|row| table_expr_matches(expr, &columns, row));
            }
            PipelineOp::Eval { field, expr } => {
                let columns = table.columns.clone();
                let existing = table.column_index(field);
                for row in &mut table.rows {
                    let v = expr.eval(&|name| table_field(&columns, row, name)).render();
                    match existing {
                        Some(i) => row[i] = v,
                        None => row.push(v),
                    }
                }
                if existing.is_none() {
                    table.columns.push(field.clone());
                }
            }
            PipelineOp::Sort(fields) => {
                let columns = table.columns.clone();
                sorted_by(&mut table.rows, fields, |row, name| {
                    table_field(&columns, row, name).render()
                });
            }
            PipelineOp::Head(n) => table.rows.truncate(*n),
            PipelineOp::Tail(n) => keep_tail(&mut table.rows, *n),
            PipelineOp::Slice { offset, len } => keep_slice(&mut table.rows, *offset, *len),
            PipelineOp::Rename { from, to } => {
                if let Some(i) = table.column_index(from) {
                    table.columns[i] = to.clone();
                }
            }
            PipelineOp::Fields(keep) => {
                let indices: Vec<usize> = keep
                    .iter()
                    .filter_map(|name| table.column_index(name))
                    .collect();
                table.columns = indices.iter().map(|&i| table.columns[i].clone()).collect();
                for row in &mut table.rows {
                    *row = indices.iter().map(|&i| row[i].clone()).collect();
                }
            }
            // aggregations and raw cannot appear post-aggregation
            PipelineOp::Raw | PipelineOp::Stats(_) | PipelineOp::Timechart(_) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenize::DefaultTokenizer;
    use data_types::{ChunkId, StoreId};
    use grebe_time::Time;
    use predicate::ScalarExpr;

    fn record(secs: i64, attrs: &[(&str, &str)], raw: &[u8]) -> Record {
        Record {
            write_ts: Time::from_timestamp(secs, 0),
            ingest_ts: Time::from_timestamp(secs, 0),
            source_ts: None,
            source_id: "src".to_string(),
            store_id: StoreId::new(),
            chunk_id: ChunkId::new(),
            position: secs as u64,
            attrs: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            raw: raw.to_vec(),
        }
    }

    fn level(records: &[Record]) -> Vec<String> {
        records
            .iter()
            .map(|r| r.attrs.get("level").cloned().unwrap_or_default())
            .collect()
    }

    #[test]
    fn where_filters_records() {
        let tok = DefaultTokenizer::new();
        let mut records = vec![
            record(0, &[("level", "error")], b"boom"),
            record(1, &[("level", "info")], b"fine"),
        ];
        apply_record_ops(
            &mut records,
            &[&PipelineOp::Where(Expr::pred(
                Predicate::kv_eq("level", "error").unwrap(),
            ))],
            &tok,
        );
        assert_eq!(level(&records), vec!["error"]);
    }

    #[test]
    fn eval_adds_fields() {
        let tok = DefaultTokenizer::new();
        let mut records = vec![record(0, &[("bytes", "2048")], b"")];
        apply_record_ops(
            &mut records,
            &[&PipelineOp::Eval {
                field: "kib".to_string(),
                expr: ScalarExpr::binary(
                    predicate::ArithOp::Div,
                    ScalarExpr::field("bytes"),
                    ScalarExpr::literal(1024.0),
                ),
            }],
            &tok,
        );
        assert_eq!(records[0].attrs.get("kib").map(String::as_str), Some("2"));
    }

    #[test]
    fn sort_is_numeric_aware() {
        let tok = DefaultTokenizer::new();
        let mut records = vec![
            record(0, &[("n", "10")], b""),
            record(1, &[("n", "9")], b""),
            record(2, &[("n", "100")], b""),
        ];
        apply_record_ops(
            &mut records,
            &[&PipelineOp::Sort(vec![SortField {
                field: "n".to_string(),
                descending: false,
            }])],
            &tok,
        );
        let ns: Vec<_> = records
            .iter()
            .map(|r| r.attrs.get("n").unwrap().clone())
            .collect();
        assert_eq!(ns, vec!["9", "10", "100"]);
    }

    #[test]
    fn head_tail_slice() {
        let tok = DefaultTokenizer::new();
        let mk = || (0..5).map(|i| record(i, &[], b"")).collect::<Vec<_>>();

        let mut records = mk();
        apply_record_ops(&mut records, &[&PipelineOp::Head(2)], &tok);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].position, 0);

        let mut records = mk();
        apply_record_ops(&mut records, &[&PipelineOp::Tail(2)], &tok);
        assert_eq!(records[0].position, 3);

        let mut records = mk();
        apply_record_ops(
            &mut records,
            &[&PipelineOp::Slice { offset: 1, len: 2 }],
            &tok,
        );
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].position, 1);
    }

    #[test]
    fn rename_and_fields_projection() {
        let tok = DefaultTokenizer::new();
        let mut records = vec![record(0, &[("level", "error"), ("env", "prod")], b"")];
        apply_record_ops(
            &mut records,
            &[
                &PipelineOp::Rename {
                    from: "level".to_string(),
                    to: "severity".to_string(),
                },
                &PipelineOp::Fields(vec!["severity".to_string()]),
            ],
            &tok,
        );
        assert_eq!(
            records[0].attrs.keys().collect::<Vec<_>>(),
            vec!["severity"]
        );
    }

    #[test]
    fn raw_table_shape() {
        let records = vec![
            record(0, &[("b", "2"), ("a", "1")], b"one"),
            record(1, &[("a", "3")], b"two"),
        ];
        let table = raw_table(&records);
        assert_eq!(
            table.columns,
            vec!["_write_ts", "_ingest_ts", "_source_ts", "a", "b", "_raw"]
        );
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0][3], "1");
        assert_eq!(table.rows[1][4], "");
        assert_eq!(table.rows[1][5], "two");
    }

    #[test]
    fn table_ops_filter_and_project() {
        let mut table = TableResult {
            columns: vec!["level".to_string(), "count".to_string()],
            rows: vec![
                vec!["error".to_string(), "10".to_string()],
                vec!["info".to_string(), "2".to_string()],
            ],
            truncated: false,
        };

        let wher = PipelineOp::Where(Expr::pred(
            Predicate::kv("count", predicate::CompareOp::Gt, "5").unwrap(),
        ));
        let fields = PipelineOp::Fields(vec!["level".to_string()]);
        apply_table_ops(&mut table, &[&wher, &fields]).unwrap();

        assert_eq!(table.columns, vec!["level"]);
        assert_eq!(table.rows, vec![vec!["error".to_string()]]);
    }

    #[test]
    fn table_sort_descending() {
        let mut table = TableResult {
            columns: vec!["count".to_string()],
            rows: vec![
                vec!["2".to_string()],
                vec!["10".to_string()],
                vec!["9".to_string()],
            ],
            truncated: false,
        };
        apply_table_ops(
            &mut table,
            &[&PipelineOp::Sort(vec![SortField {
                field: "count".to_string(),
                descending: true,
            }])],
        )
        .unwrap();
        assert_eq!(
            table.rows,
            vec![
                vec!["10".to_string()],
                vec!["9".to_string()],
                vec!["2".to_string()]
            ]
        );
    }
}
