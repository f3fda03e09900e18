//! Versioned schema registry and column-level validation.
//!
//! Registrations are built once at program start and read-only afterwards.
//! Validation never stops at the first failure: every issue is collected so a
//! run reports its full defect list, and the pipeline decides afterwards
//! whether the worst severity crosses the configured threshold.

pub mod entities;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use regex::Regex;
use semver::Version;
use thiserror::Error;

use crate::frame::{Frame, Scalar};

/// Comparison relations accepted by `relation_in` columns.
pub const RELATIONS: &[&str] = &["=", "<", ">", "<=", ">=", "~", "~=", "<>"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One validation failure. Row-less issues (column order, uniqueness summary)
/// leave `row_index` empty.
#[derive(Debug, Clone)]
pub struct Issue {
    pub column: String,
    pub row_index: Option<usize>,
    pub check_name: String,
    pub message: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Int,
    Float,
    Bool,
    String,
    Encoded,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Int => "int64",
            ColumnType::Float => "float64",
            ColumnType::Bool => "bool",
            ColumnType::String => "string",
            ColumnType::Encoded => "encoded",
        }
    }

    fn accepts(&self, value: &Scalar) -> bool {
        match (self, value) {
            (_, Scalar::Null) => true,
            (ColumnType::Int, Scalar::Int(_)) => true,
            (ColumnType::Float, Scalar::Float(_) | Scalar::Int(_)) => true,
            (ColumnType::Bool, Scalar::Bool(_)) => true,
            (ColumnType::String, Scalar::String(_)) => true,
            (ColumnType::Encoded, Scalar::Encoded(_) | Scalar::String(_)) => true,
            _ => false,
        }
    }
}

/// Expected element shape inside a serialized JSON array column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonShape {
    String,
    Number,
    Object,
}

#[derive(Debug, Clone)]
pub enum Predicate {
    Regex(Regex),
    Range {
        min: Option<f64>,
        max: Option<f64>,
        inclusive: bool,
    },
    Membership(Vec<String>),
    NonNull,
    Unique,
    JsonArrayOf(JsonShape),
    RelationIn,
}

/// A named check with its failure severity.
#[derive(Debug, Clone)]
pub struct Check {
    pub name: String,
    pub predicate: Predicate,
    pub severity: Severity,
}

impl Check {
    pub fn new(name: impl Into<String>, predicate: Predicate) -> Self {
        Self {
            name: name.into(),
            predicate,
            severity: Severity::Error,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ColumnRule {
    pub name: String,
    pub dtype: ColumnType,
    pub nullable: bool,
    pub checks: Vec<Check>,
}

impl ColumnRule {
    pub fn new(name: impl Into<String>, dtype: ColumnType) -> Self {
        Self {
            name: name.into(),
            dtype,
            nullable: true,
            checks: Vec::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn check(mut self, check: Check) -> Self {
        self.checks.push(check);
        self
    }
}

/// Immutable identity of an entity's tabular contract.
#[derive(Debug, Clone)]
pub struct EntityDescriptor {
    pub entity_id: String,
    pub schema_version: String,
    pub column_order: Vec<String>,
    pub business_key_fields: Vec<String>,
    pub row_hash_fields: Vec<String>,
}

/// Descriptor plus the column rules and determinism metadata consumed by the
/// transform, validate and write stages.
#[derive(Debug, Clone)]
pub struct SchemaRegistration {
    pub descriptor: EntityDescriptor,
    pub columns: Vec<ColumnRule>,
    pub case_preserving: HashSet<String>,
    pub sort_by: Vec<String>,
    pub ascending: Vec<bool>,
}

impl SchemaRegistration {
    pub fn entity_id(&self) -> &str {
        &self.descriptor.entity_id
    }

    pub fn column_rule(&self, name: &str) -> Option<&ColumnRule> {
        self.columns.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Error)]
pub enum SchemaRegistryError {
    #[error("unknown entity: {0}")]
    UnknownEntity(String),
    #[error("unknown schema version {version} for entity {entity}")]
    UnknownVersion { entity: String, version: String },
    #[error("invalid schema version {0}: expected semver")]
    InvalidVersion(String),
}

#[derive(Default)]
pub struct SchemaRegistry {
    entries: HashMap<String, BTreeMap<Version, Arc<SchemaRegistration>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with every built-in entity schema.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        entities::register_all(&mut registry).expect("built-in schemas are valid");
        registry
    }

    pub fn register(
        &mut self,
        registration: SchemaRegistration,
    ) -> Result<(), SchemaRegistryError> {
        let version = Version::parse(&registration.descriptor.schema_version)
            .map_err(|_| SchemaRegistryError::InvalidVersion(
                registration.descriptor.schema_version.clone(),
            ))?;
        self.entries
            .entry(registration.descriptor.entity_id.clone())
            .or_default()
            .insert(version, Arc::new(registration));
        Ok(())
    }

    /// Resolve a schema; `"latest"` picks the highest semver.
    pub fn get(
        &self,
        entity: &str,
        version: &str,
    ) -> Result<Arc<SchemaRegistration>, SchemaRegistryError> {
        let versions = self
            .entries
            .get(entity)
            .ok_or_else(|| SchemaRegistryError::UnknownEntity(entity.to_string()))?;
        if version == "latest" {
            return versions
                .values()
                .next_back()
                .cloned()
                .ok_or_else(|| SchemaRegistryError::UnknownEntity(entity.to_string()));
        }
        let parsed = Version::parse(version)
            .map_err(|_| SchemaRegistryError::InvalidVersion(version.to_string()))?;
        versions
            .get(&parsed)
            .cloned()
            .ok_or_else(|| SchemaRegistryError::UnknownVersion {
                entity: entity.to_string(),
                version: version.to_string(),
            })
    }

    pub fn entities(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// Major version increments are incompatible; minor and patch are fine.
    pub fn is_compatible(old: &str, new: &str) -> bool {
        match (Version::parse(old), Version::parse(new)) {
            (Ok(old), Ok(new)) => new.major <= old.major,
            _ => false,
        }
    }
}

fn scalar_text(value: &Scalar) -> Option<String> {
    match value {
        Scalar::String(s) | Scalar::Encoded(s) => Some(s.clone()),
        Scalar::Int(i) => Some(i.to_string()),
        Scalar::Float(f) => Some(f.to_string()),
        Scalar::Bool(b) => Some(b.to_string()),
        Scalar::Null => None,
    }
}

fn scalar_number(value: &Scalar) -> Option<f64> {
    match value {
        Scalar::Int(i) => Some(*i as f64),
        Scalar::Float(f) => Some(*f),
        _ => None,
    }
}

fn predicate_failure(predicate: &Predicate, value: &Scalar) -> Option<String> {
    if value.is_null() {
        // Nullability is handled separately; predicates skip missing values.
        return match predicate {
            Predicate::NonNull => Some("value is null".to_string()),
            _ => None,
        };
    }
    match predicate {
        Predicate::NonNull => None,
        Predicate::Regex(regex) => {
            let text = scalar_text(value)?;
            (!regex.is_match(&text)).then(|| format!("{text:?} does not match {}", regex.as_str()))
        }
        Predicate::Range {
            min,
            max,
            inclusive,
        } => {
            let number = match scalar_number(value) {
                Some(n) => n,
                None => return Some("value is not numeric".to_string()),
            };
            let below = match min {
                Some(min) if *inclusive => number < *min,
                Some(min) => number <= *min,
                None => false,
            };
            let above = match max {
                Some(max) if *inclusive => number > *max,
                Some(max) => number >= *max,
                None => false,
            };
            (below || above).then(|| format!("{number} outside [{min:?}, {max:?}]"))
        }
        Predicate::Membership(allowed) => {
            let text = scalar_text(value)?;
            (!allowed.contains(&text)).then(|| format!("{text:?} not in {allowed:?}"))
        }
        Predicate::RelationIn => {
            let text = scalar_text(value)?;
            (!RELATIONS.contains(&text.as_str()))
                .then(|| format!("{text:?} is not a known relation"))
        }
        Predicate::JsonArrayOf(shape) => {
            let text = scalar_text(value)?;
            let parsed: serde_json::Value = match serde_json::from_str(&text) {
                Ok(parsed) => parsed,
                Err(e) => return Some(format!("not valid JSON: {e}")),
            };
            let items = match parsed.as_array() {
                Some(items) => items,
                None => return Some("not a JSON array".to_string()),
            };
            let ok = items.iter().all(|item| match shape {
                JsonShape::String => item.is_string(),
                JsonShape::Number => item.is_number(),
                JsonShape::Object => item.is_object(),
            });
            (!ok).then(|| format!("array elements are not all {shape:?}"))
        }
        Predicate::Unique => None, // column-level, handled in validate()
    }
}

/// Apply a registration to a frame. Checks run in declared order and every
/// failure is recorded; the caller compares the worst severity against its
/// threshold.
pub fn validate(frame: &Frame, registration: &SchemaRegistration) -> Vec<Issue> {
    let mut issues: Vec<Issue> = Vec::new();

    // Declared columns must be a prefix of the frame, in order.
    let declared = &registration.descriptor.column_order;
    let prefix: Vec<&String> = frame.columns().iter().take(declared.len()).collect();
    if prefix.len() < declared.len()
        || prefix.iter().zip(declared).any(|(have, want)| *have != want)
    {
        issues.push(Issue {
            column: String::new(),
            row_index: None,
            check_name: "column_order".to_string(),
            message: format!(
                "frame columns {:?} do not start with declared order {:?}",
                frame.columns(),
                declared
            ),
            severity: Severity::Critical,
        });
    }

    for rule in &registration.columns {
        let Some(col_idx) = frame.column_index(&rule.name) else {
            issues.push(Issue {
                column: rule.name.clone(),
                row_index: None,
                check_name: "column_present".to_string(),
                message: "column is missing".to_string(),
                severity: Severity::Critical,
            });
            continue;
        };

        let mut seen: HashMap<String, usize> = HashMap::new();
        for (row_idx, row) in frame.rows().iter().enumerate() {
            let value = &row[col_idx];

            if !rule.nullable && value.is_null() {
                issues.push(Issue {
                    column: rule.name.clone(),
                    row_index: Some(row_idx),
                    check_name: "nonnull".to_string(),
                    message: "required column is null".to_string(),
                    severity: Severity::Error,
                });
            }
            if !rule.dtype.accepts(value) {
                issues.push(Issue {
                    column: rule.name.clone(),
                    row_index: Some(row_idx),
                    check_name: "dtype".to_string(),
                    message: format!("value {value:?} is not {}", rule.dtype.as_str()),
                    severity: Severity::Error,
                });
            }

            for check in &rule.checks {
                if matches!(check.predicate, Predicate::Unique) {
                    if let Some(text) = scalar_text(value) {
                        if let Some(first) = seen.insert(text.clone(), row_idx) {
                            issues.push(Issue {
                                column: rule.name.clone(),
                                row_index: Some(row_idx),
                                check_name: check.name.clone(),
                                message: format!(
                                    "duplicate value {text:?} (first seen at row {first})"
                                ),
                                severity: check.severity,
                            });
                        }
                    }
                    continue;
                }
                if let Some(message) = predicate_failure(&check.predicate, value) {
                    issues.push(Issue {
                        column: rule.name.clone(),
                        row_index: Some(row_idx),
                        check_name: check.name.clone(),
                        message,
                        severity: check.severity,
                    });
                }
            }
        }
    }

    issues
}

pub fn max_severity(issues: &[Issue]) -> Option<Severity> {
    issues.iter().map(|i| i.severity).max()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration() -> SchemaRegistration {
        SchemaRegistration {
            descriptor: EntityDescriptor {
                entity_id: "sample".to_string(),
                schema_version: "1.0.0".to_string(),
                column_order: vec!["id".to_string(), "relation".to_string()],
                business_key_fields: vec!["id".to_string()],
                row_hash_fields: vec!["id".to_string()],
            },
            columns: vec![
                ColumnRule::new("id", ColumnType::Int)
                    .required()
                    .check(Check::new("unique_id", Predicate::Unique)),
                ColumnRule::new("relation", ColumnType::String)
                    .check(Check::new("relation_in", Predicate::RelationIn)),
            ],
            case_preserving: HashSet::new(),
            sort_by: vec!["id".to_string()],
            ascending: vec![true],
        }
    }

    fn frame(rows: Vec<Vec<Scalar>>) -> Frame {
        let mut frame = Frame::new(vec!["id".to_string(), "relation".to_string()]);
        for row in rows {
            frame.push_row(row);
        }
        frame
    }

    #[test]
    fn test_collects_all_failures() {
        let frame = frame(vec![
            vec![Scalar::Int(1), Scalar::String("=".to_string())],
            vec![Scalar::Null, Scalar::String("between".to_string())],
            vec![Scalar::Int(1), Scalar::Null],
        ]);
        let issues = validate(&frame, &registration());
        let names: Vec<&str> = issues.iter().map(|i| i.check_name.as_str()).collect();
        assert!(names.contains(&"nonnull"));
        assert!(names.contains(&"relation_in"));
        assert!(names.contains(&"unique_id"));
        assert_eq!(max_severity(&issues), Some(Severity::Error));
    }

    #[test]
    fn test_column_order_prefix_enforced() {
        let mut bad = Frame::new(vec!["relation".to_string(), "id".to_string()]);
        bad.push_row(vec![Scalar::String("=".to_string()), Scalar::Int(1)]);
        let issues = validate(&bad, &registration());
        assert!(issues
            .iter()
            .any(|i| i.check_name == "column_order" && i.severity == Severity::Critical));
    }

    #[test]
    fn test_registry_latest_and_compatibility() {
        let mut registry = SchemaRegistry::new();
        let mut v1 = registration();
        v1.descriptor.schema_version = "1.0.0".to_string();
        let mut v2 = registration();
        v2.descriptor.schema_version = "1.2.0".to_string();
        registry.register(v1).unwrap();
        registry.register(v2).unwrap();

        let latest = registry.get("sample", "latest").unwrap();
        assert_eq!(latest.descriptor.schema_version, "1.2.0");
        assert!(registry.get("sample", "1.0.0").is_ok());
        assert!(matches!(
            registry.get("sample", "2.0.0"),
            Err(SchemaRegistryError::UnknownVersion { .. })
        ));
        assert!(matches!(
            registry.get("missing", "latest"),
            Err(SchemaRegistryError::UnknownEntity(_))
        ));

        assert!(SchemaRegistry::is_compatible("1.0.0", "1.4.2"));
        assert!(!SchemaRegistry::is_compatible("1.0.0", "2.0.0"));
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::Error);
        assert!(Severity::Error > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
        assert_eq!("warning".parse::<Severity>().unwrap(), Severity::Warning);
    }
}
