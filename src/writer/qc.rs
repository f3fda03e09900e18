//! Quality-control report assembly.
//!
//! The QC artifact is a long-form frame with `metric`, `column`, `value`
//! rows: baseline dataset stats, per-column profiles, validation issues and
//! the adapter counters. Row order is fixed so the artifact is byte-stable.

use std::collections::BTreeSet;

use crate::frame::{Frame, Scalar};
use crate::net::CounterSnapshot;
use crate::schema::Issue;

#[derive(Debug, Default)]
pub struct QcReport {
    pub issues: Vec<Issue>,
    pub counters: Vec<(String, CounterSnapshot)>,
}

impl QcReport {
    pub fn new(issues: Vec<Issue>, counters: Vec<(String, CounterSnapshot)>) -> Self {
        Self { issues, counters }
    }

    pub fn into_frame(self, dataset: &Frame) -> Frame {
        let mut frame = Frame::new(vec![
            "metric".to_string(),
            "column".to_string(),
            "value".to_string(),
        ]);
        let push = |frame: &mut Frame, metric: &str, column: &str, value: String| {
            frame.push_row(vec![
                Scalar::String(metric.to_string()),
                Scalar::String(column.to_string()),
                Scalar::String(value),
            ]);
        };

        push(&mut frame, "row_count", "", dataset.len().to_string());

        let total = dataset.len();
        for (col_idx, column) in dataset.columns().iter().enumerate() {
            let mut null_count = 0usize;
            let mut distinct: BTreeSet<String> = BTreeSet::new();
            let mut dtype = "null";
            for row in dataset.rows() {
                match &row[col_idx] {
                    Scalar::Null => null_count += 1,
                    value => {
                        distinct.insert(value.key_repr());
                        dtype = match value {
                            Scalar::Int(_) => "int64",
                            Scalar::Float(_) => "float64",
                            Scalar::Bool(_) => "bool",
                            Scalar::String(_) => "string",
                            Scalar::Encoded(_) => "encoded",
                            Scalar::Null => unreachable!(),
                        };
                    }
                }
            }
            let null_fraction = if total == 0 {
                0.0
            } else {
                null_count as f64 / total as f64
            };
            push(&mut frame, "null_count", column, null_count.to_string());
            push(
                &mut frame,
                "null_fraction",
                column,
                format!("{null_fraction:.6}"),
            );
            push(
                &mut frame,
                "unique_count",
                column,
                distinct.len().to_string(),
            );
            push(&mut frame, "dtype", column, dtype.to_string());
        }

        for issue in &self.issues {
            let location = issue
                .row_index
                .map_or_else(String::new, |idx| format!(" row={idx}"));
            push(
                &mut frame,
                "validation_issue",
                &issue.column,
                format!(
                    "{} {}:{}{}",
                    issue.severity, issue.check_name, issue.message, location
                ),
            );
        }

        for (source, counters) in &self.counters {
            push(
                &mut frame,
                "api_calls",
                source,
                counters.api_calls.to_string(),
            );
            push(
                &mut frame,
                "cache_hits",
                source,
                counters.cache_hits.to_string(),
            );
            push(
                &mut frame,
                "fallback_count",
                source,
                counters.fallback_count.to_string(),
            );
        }

        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Severity;

    #[test]
    fn test_qc_frame_shape() {
        let mut dataset = Frame::new(vec!["id".to_string(), "name".to_string()]);
        dataset.push_row(vec![Scalar::Int(1), Scalar::String("a".to_string())]);
        dataset.push_row(vec![Scalar::Int(2), Scalar::Null]);

        let issues = vec![Issue {
            column: "name".to_string(),
            row_index: Some(1),
            check_name: "nonnull".to_string(),
            message: "required column is null".to_string(),
            severity: Severity::Warning,
        }];
        let counters = vec![(
            "chembl".to_string(),
            CounterSnapshot {
                api_calls: 3,
                cache_hits: 1,
                fallback_count: 0,
            },
        )];

        let qc = QcReport::new(issues, counters).into_frame(&dataset);
        assert_eq!(qc.columns(), &["metric", "column", "value"]);

        let rows: Vec<(String, String, String)> = qc
            .rows()
            .iter()
            .map(|r| (r[0].key_repr(), r[1].key_repr(), r[2].key_repr()))
            .collect();
        assert!(rows.contains(&("row_count".into(), "".into(), "2".into())));
        assert!(rows.contains(&("null_count".into(), "name".into(), "1".into())));
        assert!(rows.contains(&("null_fraction".into(), "name".into(), "0.500000".into())));
        assert!(rows.contains(&("dtype".into(), "id".into(), "int64".into())));
        assert!(rows.contains(&("api_calls".into(), "chembl".into(), "3".into())));
        assert!(rows
            .iter()
            .any(|(metric, column, value)| metric == "validation_issue"
                && column == "name"
                && value.contains("nonnull")));
    }
}
