//! Cheap shape checks for rendering a table as a visualization.

use crate::{Error, Result};
use data_types::TableResult;
use predicate::parse_num;

/// The visualizations a table can be rendered as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VizKind {
    /// Plain table: any shape.
    Table,
    /// Time series: a `_time` column plus at least one numeric series.
    TimeSeries,
    /// Bar chart: a label column plus a numeric value column.
    Bar,
}

/// Validate that `table` can be rendered as `kind`.
pub fn validate(kind: VizKind, table: &TableResult) -> Result<()> {
    match kind {
        VizKind::Table => Ok(()),
        VizKind::TimeSeries => {
            let time_idx = table.column_index("_time").ok_or_else(|| {
                Error::UnsupportedPipeline {
                    reason: "time series requires a _time column".to_string(),
                }
            })?;
            let has_series = (0..table.columns.len())
                .filter(|&i| i != time_idx)
                .any(|i| column_is_numeric(table, i));
            if !has_series {
                return Err(Error::UnsupportedPipeline {
                    reason: "time series requires a numeric series column".to_string(),
                });
            }
            Ok(())
        }
        VizKind::Bar => {
            if table.columns.len() < 2 {
                return Err(Error::UnsupportedPipeline {
                    reason: "bar chart requires a label and a value column".to_string(),
                });
            }
            if !column_is_numeric(table, table.columns.len() - 1) {
                return Err(Error::UnsupportedPipeline {
                    reason: "bar chart requires a numeric value column".to_string(),
                });
            }
            Ok(())
        }
    }
}

/// Whether every non-empty cell of the column parses as a number, with at
/// least one such cell.
fn column_is_numeric(table: &TableResult, idx: usize) -> bool {
    let mut any = false;
    for row in &table.rows {
        let cell = &row[idx];
        if cell.is_empty() {
            continue;
        }
        if parse_num(cell).is_none() {
            return false;
        }
        any = true;
    }
    any
}
