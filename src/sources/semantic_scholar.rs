//! Semantic Scholar adapter: paper lookups by DOI or paper id.

use std::sync::Arc;

use serde_json::Value;

use crate::frame::{Record, Scalar};
use crate::ident;
use crate::net::{ApiClient, ApiError, ApiOutcome, CounterSnapshot};
use crate::pipeline::Shutdown;

use super::fan_out;

const SOURCE: &str = "semantic_scholar";
const FIELDS: &str = "title,year,abstract,venue,citationCount,externalIds,paperId";

pub struct SemanticScholarClient {
    api: Arc<ApiClient>,
    workers: usize,
}

impl SemanticScholarClient {
    /// `api_key` becomes the `x-api-key` header on every request when set.
    pub fn new(api: ApiClient, workers: usize, api_key: Option<String>) -> Self {
        let api = match api_key {
            Some(key) => api.with_header("x-api-key", key),
            None => api,
        };
        Self {
            api: Arc::new(api),
            workers,
        }
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.api.counters()
    }

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
        let endpoint = format!("/graph/v1/paper/DOI:{clean}");
        let params = vec![("fields".to_string(), FIELDS.to_string())];
        match self.api.get_with_fallback(&endpoint, &params).await? {
            ApiOutcome::Payload(payload) => Ok(vec![normalize_paper(&payload, &clean)]),
            ApiOutcome::Fallback(info) => Ok(vec![info.into_record(
                "doi_clean",
                Scalar::String(clean),
                fallback_timestamp,
            )]),
        }
    }
}

fn normalize_paper(paper: &Value, doi_clean: &str) -> Record {
    let mut record = Record::new();
    record.set("doi_clean", Scalar::String(doi_clean.to_string()));
    if let Some(paper_id) = paper.get("paperId").and_then(Value::as_str) {
        record.set(
            format!("{SOURCE}_paper_id"),
            Scalar::String(paper_id.to_string()),
        );
    }
    if let Some(title) = paper.get("title").and_then(Value::as_str) {
        record.set(format!("{SOURCE}_title"), Scalar::String(title.to_string()));
    }
    if let Some(year) = paper.get("year").and_then(Value::as_i64) {
        record.set(format!("{SOURCE}_year"), Scalar::Int(year));
    }
    if let Some(text) = paper.get("abstract").and_then(Value::as_str) {
        record.set(format!("{SOURCE}_abstract"), Scalar::String(text.to_string()));
    }
    if let Some(venue) = paper.get("venue").and_then(Value::as_str) {
        record.set(format!("{SOURCE}_venue"), Scalar::String(venue.to_string()));
    }
    if let Some(count) = paper.get("citationCount").and_then(Value::as_i64) {
        record.set(format!("{SOURCE}_citation_count"), Scalar::Int(count));
    }
    if let Some(pmid) = paper
        .get("externalIds")
        .and_then(|ids| ids.get("PubMed"))
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<i64>().ok())
    {
        record.set("pmid", Scalar::Int(pmid));
    }
    record
}
