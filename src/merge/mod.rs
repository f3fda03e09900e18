//! Multi-source merge policy.
//!
//! Enrichment frames arrive with per-source column prefixes and share a join
//! key (DOI, PMID or ChEMBL id). `left_join` aligns them onto the baseline by
//! normalized key; `apply_rules` then fuses candidate columns into the target
//! fields, recording the winning source, conflicts and rejected values.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::debug;

use crate::frame::encode::canonical_json;
use crate::frame::{Frame, Scalar};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    PreferSource,
    PreferFresh,
    ConcatUnique,
    ScoreBased,
}

#[derive(Debug, Clone)]
pub struct MergeCandidate {
    pub source: String,
    pub column: String,
    /// ISO-8601 timestamp column consulted by `PreferFresh`.
    pub freshness_column: Option<String>,
    /// Numeric column consulted by `ScoreBased`.
    pub score_column: Option<String>,
}

impl MergeCandidate {
    pub fn new(source: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            column: column.into(),
            freshness_column: None,
            score_column: None,
        }
    }

    pub fn with_freshness(mut self, column: impl Into<String>) -> Self {
        self.freshness_column = Some(column.into());
        self
    }

    pub fn with_score(mut self, column: impl Into<String>) -> Self {
        self.score_column = Some(column.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct MergeRule {
    pub target_field: String,
    pub strategy: MergeStrategy,
    pub candidates: Vec<MergeCandidate>,
}

fn normalize_key(value: &Scalar) -> Option<String> {
    if value.is_null() {
        return None;
    }
    let text = value.key_repr().trim().to_lowercase();
    (!text.is_empty()).then_some(text)
}

/// Left join `other` onto `base` by normalized key. The original-case key
/// columns survive untouched; unmatched base rows get nulls for every column
/// of `other`, never an error.
pub fn left_join(base: &Frame, base_key: &str, other: &Frame, other_key: &str) -> Frame {
    let mut index: HashMap<String, usize> = HashMap::new();
    if let Some(key_idx) = other.column_index(other_key) {
        for (row_idx, row) in other.rows().iter().enumerate() {
            if let Some(key) = normalize_key(&row[key_idx]) {
                // First occurrence wins so the join is deterministic.
                index.entry(key).or_insert(row_idx);
            }
        }
    }

    let mut out = base.clone();
    let appended: Vec<String> = other
        .columns()
        .iter()
        .filter(|c| out.column_index(c).is_none())
        .cloned()
        .collect();
    for column in &appended {
        out.add_column(column.clone(), Scalar::Null);
    }

    let base_key_idx = match base.column_index(base_key) {
        Some(idx) => idx,
        None => {
            debug!(base_key, "join_key_missing_in_base");
            return out;
        }
    };

    for row_idx in 0..out.len() {
        let key = normalize_key(&base.rows()[row_idx][base_key_idx]);
        let Some(other_row) = key.and_then(|k| index.get(&k)).copied() else {
            continue;
        };
        for column in &appended {
            if let Some(value) = other.get(other_row, column) {
                out.set(row_idx, column, value.clone());
            }
        }
    }
    out
}

fn text_for_compare(value: &Scalar) -> String {
    value.key_repr().trim().to_lowercase()
}

fn parse_freshness(value: Option<&Scalar>) -> Option<DateTime<Utc>> {
    let text = match value {
        Some(Scalar::String(s)) => s.clone(),
        _ => return None,
    };
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn list_elements(value: &Scalar) -> Vec<String> {
    match value {
        Scalar::Encoded(text) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => canonical_json(other),
                })
                .collect(),
            _ => vec![text.clone()],
        },
        Scalar::String(text) if text.contains("; ") => {
            text.split("; ").map(|s| s.to_string()).collect()
        }
        other => vec![other.key_repr()],
    }
}

struct Pick {
    winner: Option<usize>,
    value: Scalar,
}

fn pick(rule: &MergeRule, frame: &Frame, row: usize) -> Pick {
    let values: Vec<Scalar> = rule
        .candidates
        .iter()
        .map(|c| {
            frame
                .get(row, &c.column)
                .cloned()
                .unwrap_or(Scalar::Null)
        })
        .collect();

    match rule.strategy {
        MergeStrategy::PreferSource => {
            let winner = values.iter().position(|v| !v.is_null());
            Pick {
                winner,
                value: winner.map_or(Scalar::Null, |i| values[i].clone()),
            }
        }
        MergeStrategy::PreferFresh => {
            let mut winner: Option<(usize, Option<DateTime<Utc>>)> = None;
            for (idx, value) in values.iter().enumerate() {
                if value.is_null() {
                    continue;
                }
                let freshness = rule.candidates[idx]
                    .freshness_column
                    .as_deref()
                    .and_then(|col| parse_freshness(frame.get(row, col)));
                match &winner {
                    None => winner = Some((idx, freshness)),
                    // Strictly fresher wins; ties keep the earlier candidate.
                    Some((_, best)) if freshness > *best => winner = Some((idx, freshness)),
                    Some(_) => {}
                }
            }
            let winner = winner.map(|(idx, _)| idx);
            Pick {
                winner,
                value: winner.map_or(Scalar::Null, |i| values[i].clone()),
            }
        }
        MergeStrategy::ScoreBased => {
            let mut winner: Option<(usize, f64)> = None;
            for (idx, value) in values.iter().enumerate() {
                if value.is_null() {
                    continue;
                }
                let score = rule.candidates[idx]
                    .score_column
                    .as_deref()
                    .and_then(|col| match frame.get(row, col) {
                        Some(Scalar::Float(f)) => Some(*f),
                        Some(Scalar::Int(i)) => Some(*i as f64),
                        _ => None,
                    })
                    .unwrap_or(f64::NEG_INFINITY);
                match &winner {
                    None => winner = Some((idx, score)),
                    Some((_, best)) if score > *best => winner = Some((idx, score)),
                    Some(_) => {}
                }
            }
            let winner = winner.map(|(idx, _)| idx);
            Pick {
                winner,
                value: winner.map_or(Scalar::Null, |i| values[i].clone()),
            }
        }
        MergeStrategy::ConcatUnique => {
            let mut merged: Vec<String> = Vec::new();
            let mut first_contributor: Option<usize> = None;
            for (idx, value) in values.iter().enumerate() {
                if value.is_null() {
                    continue;
                }
                first_contributor.get_or_insert(idx);
                for element in list_elements(value) {
                    if !element.is_empty() && !merged.contains(&element) {
                        merged.push(element);
                    }
                }
            }
            Pick {
                winner: first_contributor,
                value: if merged.is_empty() {
                    Scalar::Null
                } else {
                    Scalar::String(merged.join("; "))
                },
            }
        }
    }
}

/// Apply the merge rules in order, adding `<field>`, `<field>_source`,
/// `<field>_extras` and per-source conflict columns.
pub fn apply_rules(frame: &mut Frame, rules: &[MergeRule]) {
    for rule in rules {
        let target = rule.target_field.clone();
        let source_col = format!("{target}_source");
        let extras_col = format!("{target}_extras");
        frame.add_column(target.clone(), Scalar::Null);
        frame.add_column(source_col.clone(), Scalar::Null);
        frame.add_column(extras_col.clone(), Scalar::Null);
        let conflict_cols: Vec<String> = rule
            .candidates
            .iter()
            .map(|c| format!("conflict_{}_{target}", c.source))
            .collect();
        if rule.candidates.len() > 1 {
            for col in &conflict_cols {
                frame.add_column(col.clone(), Scalar::Bool(false));
            }
        }

        for row in 0..frame.len() {
            let picked = pick(rule, frame, row);
            let Some(winner) = picked.winner else {
                continue;
            };
            let winner_source = rule.candidates[winner].source.clone();
            let winner_text = text_for_compare(&picked.value);

            let mut extras: Vec<Value> = Vec::new();
            let mut conflict = false;
            for (idx, candidate) in rule.candidates.iter().enumerate() {
                if idx == winner {
                    continue;
                }
                let value = frame
                    .get(row, &candidate.column)
                    .cloned()
                    .unwrap_or(Scalar::Null);
                if value.is_null() {
                    continue;
                }
                if text_for_compare(&value) != winner_text {
                    conflict = true;
                }
                extras.push(json!({
                    "source": candidate.source,
                    "column": candidate.column,
                    "value": value.key_repr(),
                }));
            }

            frame.set(row, &target, picked.value);
            frame.set(row, &source_col, Scalar::String(winner_source));
            if !extras.is_empty() {
                frame.set(
                    row,
                    &extras_col,
                    Scalar::Encoded(canonical_json(&Value::Array(extras))),
                );
            }
            if conflict && rule.candidates.len() > 1 {
                frame.set(row, &conflict_cols[winner], Scalar::Bool(true));
            }
        }
    }
}
