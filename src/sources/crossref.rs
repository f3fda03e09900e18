//! Crossref adapter: bibliographic enrichment by DOI.

use std::sync::Arc;

use serde_json::Value;

use crate::frame::encode::{canonical_json, serialize_simple_list};
use crate::frame::{Record, Scalar};
use crate::ident;
use crate::net::{ApiClient, ApiError, ApiOutcome, CounterSnapshot};
use crate::pipeline::Shutdown;

use super::fan_out;

const SOURCE: &str = "crossref";

pub struct CrossrefClient {
    api: Arc<ApiClient>,
    workers: usize,
    mailto: Option<String>,
}

impl CrossrefClient {
    pub fn new(api: Arc<ApiClient>, workers: usize, mailto: Option<String>) -> Self {
        Self {
            api,
            workers,
            mailto,
        }
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.api.counters()
    }

    /// One `/works/{doi}` lookup per DOI, fanned out over the worker pool.
    pub async fn fetch_by_dois(
        &self,
        dois: &[String],
        shutdown: &Shutdown,
        fallback_timestamp: &str,
    ) -> Result<Vec<Record>, ApiError> {
        let tasks: Vec<_> = dois
            .iter()
            .map(|doi| self.fetch_one(doi.clone(), fallback_timestamp))
            .collect();
        fan_out(tasks, self.workers, shutdown).await
    }

    async fn fetch_one(
        &self,
        doi: String,
        fallback_timestamp: &str,
    ) -> Result<Vec<Record>, ApiError> {
        let clean = ident::normalize_doi(&doi).unwrap_or_else(|| doi.trim().to_lowercase());
        let mut params: Vec<(String, String)> = Vec::new();
        if let Some(mailto) = &self.mailto {
            params.push(("mailto".to_string(), mailto.clone()));
        }
        let endpoint = format!("/works/{clean}");
        match self.api.get_with_fallback(&endpoint, &params).await? {
            ApiOutcome::Payload(payload) => {
                let message = payload.get("message").unwrap_or(&payload);
                Ok(vec![normalize_work(message, &clean)])
            }
            ApiOutcome::Fallback(info) => Ok(vec![info.into_record(
                "doi_clean",
                Scalar::String(clean),
                fallback_timestamp,
            )]),
        }
    }
}

fn first_string(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::Array(items)) => items.first().and_then(Value::as_str).map(str::to_string),
        Some(Value::String(s)) => Some(s.clone()),
        _ => None,
    }
}

fn normalize_work(message: &Value, doi_clean: &str) -> Record {
    let mut record = Record::new();
    record.set("doi_clean", Scalar::String(doi_clean.to_string()));
    if let Some(doi) = message.get("DOI").and_then(Value::as_str) {
        record.set(format!("{SOURCE}_doi"), Scalar::String(doi.to_string()));
    }
    if let Some(title) = first_string(message.get("title")) {
        record.set(format!("{SOURCE}_title"), Scalar::String(title));
    }
    if let Some(journal) = first_string(message.get("container-title")) {
        record.set(format!("{SOURCE}_journal"), Scalar::String(journal));
    }
    if let Some(issn) = message.get("ISSN") {
        record.set(
            format!("{SOURCE}_issn"),
            Scalar::Encoded(serialize_simple_list(issn)),
        );
    }
    if let Some(authors) = message.get("author").and_then(Value::as_array) {
        let names: Vec<Value> = authors
            .iter()
            .filter_map(|author| {
                let given = author.get("given").and_then(Value::as_str);
                let family = author.get("family").and_then(Value::as_str);
                match (given, family) {
                    (Some(given), Some(family)) => Some(Value::String(format!("{given} {family}"))),
                    (None, Some(family)) => Some(Value::String(family.to_string())),
                    (Some(given), None) => Some(Value::String(given.to_string())),
                    (None, None) => author
                        .get("name")
                        .and_then(Value::as_str)
                        .map(|n| Value::String(n.to_string())),
                }
            })
            .collect();
        if !names.is_empty() {
            record.set(
                format!("{SOURCE}_authors"),
                Scalar::Encoded(canonical_json(&Value::Array(names))),
            );
        }
    }
    // issued.date-parts = [[year, month, day]]
    if let Some(year) = message
        .get("issued")
        .and_then(|issued| issued.get("date-parts"))
        .and_then(Value::as_array)
        .and_then(|parts| parts.first())
        .and_then(Value::as_array)
        .and_then(|first| first.first())
        .and_then(Value::as_i64)
    {
        record.set(format!("{SOURCE}_year"), Scalar::Int(year));
    }
    for field in ["volume", "issue", "page", "publisher", "type"] {
        if let Some(value) = message.get(field).and_then(Value::as_str) {
            record.set(
                format!("{SOURCE}_{field}"),
                Scalar::String(value.to_string()),
            );
        }
    }
    record
}
