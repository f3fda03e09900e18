//! Tabular data model shared by every pipeline stage.
//!
//! A `Frame` is an ordered collection of rows over a fixed column list; every
//! row holds exactly one `Scalar` per column. Records produced by the source
//! adapters are ordered field maps that get aligned into a frame at stage
//! boundaries.

pub mod encode;

use std::cmp::Ordering;
use std::collections::HashSet;

use indexmap::IndexMap;
use serde_json::Value;

/// Default float precision used when rendering values for output and hashing.
pub const DEFAULT_FLOAT_PRECISION: usize = 6;

/// Strings treated as missing values unless the column is case-preserving.
pub const NA_SET: &[&str] = &["", "na", "n/a", "none"];

/// A single cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
    /// Serialized complex value (JSON text, pipe list, header/rows block).
    Encoded(String),
}

impl Scalar {
    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    /// Convert a JSON payload value into a scalar. Arrays and objects are
    /// stored in canonical serialized form so output stays byte-stable.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Scalar::Null,
            Value::Bool(b) => Scalar::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Scalar::Int(i)
                } else {
                    Scalar::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => Scalar::String(s.clone()),
            Value::Array(_) | Value::Object(_) => {
                Scalar::Encoded(encode::canonical_json(value))
            }
        }
    }

    pub fn from_opt_string(value: Option<String>) -> Self {
        match value {
            Some(s) => Scalar::String(s),
            None => Scalar::Null,
        }
    }

    /// Render the value for CSV output. `na` is the configured representation
    /// of missing values. Non-finite floats render as missing.
    pub fn render(&self, float_precision: usize, na: &str) -> String {
        match self {
            Scalar::Null => na.to_string(),
            Scalar::Int(i) => i.to_string(),
            Scalar::Float(f) => {
                if f.is_finite() {
                    format!("{:.*}", float_precision, f)
                } else {
                    na.to_string()
                }
            }
            Scalar::Bool(b) => b.to_string(),
            Scalar::String(s) | Scalar::Encoded(s) => s.clone(),
        }
    }

    /// String form used when concatenating business-key fields. Nulls render
    /// empty so the separator positions stay stable.
    pub fn key_repr(&self) -> String {
        match self {
            Scalar::Null => String::new(),
            other => other.render(DEFAULT_FLOAT_PRECISION, ""),
        }
    }

    /// Total ordering used by the deterministic sort. Nulls are handled by the
    /// caller (fixed NA-last); mixed types fall back to their rendered form.
    pub fn compare(&self, other: &Scalar) -> Ordering {
        match (self, other) {
            (Scalar::Int(a), Scalar::Int(b)) => a.cmp(b),
            (Scalar::Float(a), Scalar::Float(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Scalar::Int(a), Scalar::Float(b)) => {
                (*a as f64).partial_cmp(b).unwrap_or(Ordering::Equal)
            }
            (Scalar::Float(a), Scalar::Int(b)) => {
                a.partial_cmp(&(*b as f64)).unwrap_or(Ordering::Equal)
            }
            (Scalar::Bool(a), Scalar::Bool(b)) => a.cmp(b),
            (Scalar::String(a), Scalar::String(b)) => a.cmp(b),
            (Scalar::Encoded(a), Scalar::Encoded(b)) => a.cmp(b),
            (a, b) => a
                .render(DEFAULT_FLOAT_PRECISION, "")
                .cmp(&b.render(DEFAULT_FLOAT_PRECISION, "")),
        }
    }

    /// Value equality with fixed-precision float comparison, used by the
    /// idempotence checks.
    pub fn value_eq(&self, other: &Scalar) -> bool {
        match (self, other) {
            (Scalar::Float(a), Scalar::Float(b)) => {
                if !a.is_finite() && !b.is_finite() {
                    return true;
                }
                format!("{:.*}", DEFAULT_FLOAT_PRECISION, a)
                    == format!("{:.*}", DEFAULT_FLOAT_PRECISION, b)
            }
            (a, b) => a == b,
        }
    }
}

/// Ordered field-name to value mapping produced by the source adapters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: IndexMap<String, Scalar>,
}

impl Record {
    pub fn new() -> Self {
        Self {
            fields: IndexMap::new(),
        }
    }

    pub fn set(&mut self, name: impl Into<String>, value: Scalar) {
        self.fields.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Scalar> {
        self.fields.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Scalar)> {
        self.fields.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    /// Return a copy whose keys carry `prefix_`, leaving the listed shared
    /// contract fields untouched.
    pub fn with_prefix(&self, prefix: &str, shared: &[&str]) -> Record {
        let mut out = Record::new();
        for (key, value) in &self.fields {
            if shared.contains(&key.as_str()) || key.starts_with(&format!("{prefix}_")) {
                out.set(key.clone(), value.clone());
            } else {
                out.set(format!("{prefix}_{key}"), value.clone());
            }
        }
        out
    }

    /// Flatten a JSON object into a record, serializing nested values.
    pub fn from_json_object(value: &Value) -> Record {
        let mut record = Record::new();
        if let Value::Object(map) = value {
            for (key, val) in map {
                record.set(key.clone(), Scalar::from_json(val));
            }
        }
        record
    }
}

/// Ordered collection of rows sharing one column list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    columns: Vec<String>,
    rows: Vec<Vec<Scalar>>,
}

impl Frame {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Build a frame from records, unioning columns in first-seen order.
    pub fn from_records(records: &[Record]) -> Self {
        let mut columns: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for record in records {
            for key in record.keys() {
                if seen.insert(key.clone()) {
                    columns.push(key.clone());
                }
            }
        }
        let mut frame = Frame::new(columns);
        for record in records {
            frame.push_record(record);
        }
        frame
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Vec<Scalar>] {
        &self.rows
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn get(&self, row: usize, column: &str) -> Option<&Scalar> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    pub fn set(&mut self, row: usize, column: &str, value: Scalar) {
        if let Some(idx) = self.column_index(column) {
            if let Some(r) = self.rows.get_mut(row) {
                r[idx] = value;
            }
        }
    }

    /// Append a record, aligning it to the frame's columns. Unknown record
    /// fields become new columns backfilled with nulls.
    pub fn push_record(&mut self, record: &Record) {
        for key in record.keys() {
            if !self.columns.iter().any(|c| c == key) {
                self.add_column(key.clone(), Scalar::Null);
            }
        }
        let row = self
            .columns
            .iter()
            .map(|c| record.get(c).cloned().unwrap_or(Scalar::Null))
            .collect();
        self.rows.push(row);
    }

    pub fn push_row(&mut self, row: Vec<Scalar>) {
        debug_assert_eq!(row.len(), self.columns.len());
        self.rows.push(row);
    }

    pub fn add_column(&mut self, name: impl Into<String>, fill: Scalar) {
        let name = name.into();
        if self.columns.iter().any(|c| c == &name) {
            return;
        }
        self.columns.push(name);
        for row in &mut self.rows {
            row.push(fill.clone());
        }
    }

    pub fn rename_column(&mut self, from: &str, to: impl Into<String>) {
        if let Some(idx) = self.column_index(from) {
            self.columns[idx] = to.into();
        }
    }

    pub fn drop_column(&mut self, name: &str) {
        if let Some(idx) = self.column_index(name) {
            self.columns.remove(idx);
            for row in &mut self.rows {
                row.remove(idx);
            }
        }
    }

    /// Reorder so the declared columns come first in declared order; columns
    /// not listed keep their relative order after the prefix.
    pub fn reorder(&mut self, declared: &[String]) {
        let mut order: Vec<usize> = Vec::with_capacity(self.columns.len());
        for name in declared {
            if let Some(idx) = self.column_index(name) {
                order.push(idx);
            }
        }
        for (idx, name) in self.columns.iter().enumerate() {
            if !declared.contains(name) {
                order.push(idx);
            }
        }
        let reordered: Vec<String> = order.iter().map(|&i| self.columns[i].clone()).collect();
        self.columns = reordered;
        for row in &mut self.rows {
            let values: Vec<Scalar> = order.iter().map(|&i| row[i].clone()).collect();
            *row = values;
        }
    }

    pub fn select(&self, names: &[String]) -> Frame {
        let indices: Vec<usize> = names
            .iter()
            .filter_map(|n| self.column_index(n))
            .collect();
        let columns = indices.iter().map(|&i| self.columns[i].clone()).collect();
        let mut out = Frame::new(columns);
        for row in &self.rows {
            out.push_row(indices.iter().map(|&i| row[i].clone()).collect());
        }
        out
    }

    /// Stable multi-key sort. Missing values always sort last regardless of
    /// direction.
    pub fn sort_by(&mut self, keys: &[String], ascending: &[bool]) {
        let indices: Vec<(usize, bool)> = keys
            .iter()
            .enumerate()
            .filter_map(|(pos, name)| {
                self.column_index(name)
                    .map(|idx| (idx, ascending.get(pos).copied().unwrap_or(true)))
            })
            .collect();
        if indices.is_empty() {
            return;
        }
        self.rows.sort_by(|a, b| {
            for &(idx, asc) in &indices {
                let left = &a[idx];
                let right = &b[idx];
                let ord = match (left.is_null(), right.is_null()) {
                    (true, true) => Ordering::Equal,
                    (true, false) => Ordering::Greater,
                    (false, true) => Ordering::Less,
                    (false, false) => {
                        let ord = left.compare(right);
                        if asc {
                            ord
                        } else {
                            ord.reverse()
                        }
                    }
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
    }

    /// Coerce a column's string payloads to floats where they parse.
    pub fn coerce_float_column(&mut self, name: &str) {
        let Some(idx) = self.column_index(name) else {
            return;
        };
        for row in &mut self.rows {
            match &row[idx] {
                Scalar::String(s) => {
                    if let Ok(value) = s.trim().parse::<f64>() {
                        row[idx] = Scalar::Float(value);
                    }
                }
                Scalar::Int(i) => row[idx] = Scalar::Float(*i as f64),
                _ => {}
            }
        }
    }

    /// Coerce a column's string/float payloads to integers where exact.
    pub fn coerce_int_column(&mut self, name: &str) {
        let Some(idx) = self.column_index(name) else {
            return;
        };
        for row in &mut self.rows {
            match &row[idx] {
                Scalar::String(s) => {
                    if let Ok(value) = s.trim().parse::<i64>() {
                        row[idx] = Scalar::Int(value);
                    }
                }
                Scalar::Float(f) if f.fract() == 0.0 && f.is_finite() => {
                    row[idx] = Scalar::Int(*f as i64);
                }
                _ => {}
            }
        }
    }

    pub fn record(&self, row: usize) -> Option<Record> {
        let values = self.rows.get(row)?;
        let mut record = Record::new();
        for (column, value) in self.columns.iter().zip(values) {
            record.set(column.clone(), value.clone());
        }
        Some(record)
    }

    pub fn records(&self) -> Vec<Record> {
        (0..self.len()).filter_map(|i| self.record(i)).collect()
    }

    /// Value-level equality, tolerant of float formatting noise.
    pub fn value_eq(&self, other: &Frame) -> bool {
        if self.columns != other.columns || self.rows.len() != other.rows.len() {
            return false;
        }
        self.rows
            .iter()
            .zip(&other.rows)
            .all(|(a, b)| a.iter().zip(b).all(|(x, y)| x.value_eq(y)))
    }
}

/// Trim a string and map members of the NA set to null. Case-preserving
/// columns skip both steps.
pub fn apply_na_value(value: &Scalar, case_preserving: bool) -> Scalar {
    match value {
        Scalar::String(s) if !case_preserving => {
            let trimmed = s.trim();
            if NA_SET.contains(&trimmed.to_lowercase().as_str()) {
                Scalar::Null
            } else {
                Scalar::String(trimmed.to_string())
            }
        }
        Scalar::Float(f) if !f.is_finite() => Scalar::Null,
        other => other.clone(),
    }
}

/// Apply the NA policy to every cell of a frame.
pub fn apply_na_policy(frame: &mut Frame, case_preserving: &HashSet<String>) {
    let preserve: Vec<bool> = frame
        .columns()
        .iter()
        .map(|c| case_preserving.contains(c))
        .collect();
    for row_idx in 0..frame.len() {
        for (col_idx, column) in frame.columns.clone().iter().enumerate() {
            let keep_case = preserve[col_idx];
            let current = frame.rows[row_idx][col_idx].clone();
            let next = apply_na_value(&current, keep_case);
            if next != current {
                frame.set(row_idx, column, next);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> Frame {
        let mut frame = Frame::new(vec!["id".into(), "value".into()]);
        frame.push_row(vec![Scalar::Int(2), Scalar::String("b".into())]);
        frame.push_row(vec![Scalar::Int(1), Scalar::String("a".into())]);
        frame.push_row(vec![Scalar::Null, Scalar::String("c".into())]);
        frame
    }

    #[test]
    fn test_sort_puts_nulls_last() {
        let mut frame = sample_frame();
        frame.sort_by(&["id".into()], &[true]);
        assert_eq!(frame.get(0, "id"), Some(&Scalar::Int(1)));
        assert_eq!(frame.get(1, "id"), Some(&Scalar::Int(2)));
        assert_eq!(frame.get(2, "id"), Some(&Scalar::Null));

        let mut frame = sample_frame();
        frame.sort_by(&["id".into()], &[false]);
        assert_eq!(frame.get(0, "id"), Some(&Scalar::Int(2)));
        assert_eq!(frame.get(2, "id"), Some(&Scalar::Null));
    }

    #[test]
    fn test_push_record_aligns_columns() {
        let mut frame = Frame::new(vec!["id".into()]);
        let mut record = Record::new();
        record.set("extra", Scalar::Bool(true));
        frame.push_record(&record);
        assert_eq!(frame.columns(), &["id".to_string(), "extra".to_string()]);
        assert_eq!(frame.get(0, "id"), Some(&Scalar::Null));
        assert_eq!(frame.get(0, "extra"), Some(&Scalar::Bool(true)));
    }

    #[test]
    fn test_reorder_keeps_extras_after_prefix() {
        let mut frame = Frame::new(vec!["x".into(), "id".into(), "y".into()]);
        frame.push_row(vec![Scalar::Int(1), Scalar::Int(2), Scalar::Int(3)]);
        frame.reorder(&["id".into(), "missing".into()]);
        assert_eq!(
            frame.columns(),
            &["id".to_string(), "x".to_string(), "y".to_string()]
        );
        assert_eq!(frame.get(0, "id"), Some(&Scalar::Int(2)));
    }

    #[test]
    fn test_na_policy_trims_and_nulls() {
        assert_eq!(
            apply_na_value(&Scalar::String("  N/A ".into()), false),
            Scalar::Null
        );
        assert_eq!(
            apply_na_value(&Scalar::String(" text ".into()), false),
            Scalar::String("text".into())
        );
        // Case-preserving columns keep surrounding whitespace semantics.
        assert_eq!(
            apply_na_value(&Scalar::String("None".into()), true),
            Scalar::String("None".into())
        );
        assert_eq!(apply_na_value(&Scalar::Float(f64::NAN), false), Scalar::Null);
    }

    #[test]
    fn test_prefix_skips_shared_fields() {
        let mut record = Record::new();
        record.set("title", Scalar::String("x".into()));
        record.set("doi_clean", Scalar::String("10.1/x".into()));
        let prefixed = record.with_prefix("pubmed", &["doi_clean", "pmid"]);
        assert!(prefixed.contains("pubmed_title"));
        assert!(prefixed.contains("doi_clean"));
        assert!(!prefixed.contains("pubmed_doi_clean"));
    }
}
