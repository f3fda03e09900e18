//! OpenAlex adapter: works lookup by DOI with cursor pagination.
//!
//! Batch filters (`filter=doi:a|b|c`) walk pages via `meta.next_cursor`
//! until the server returns no cursor. Work ids arrive as canonical URLs and
//! are reduced to their short form (`https://openalex.org/W123` -> `W123`).

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::frame::{Record, Scalar};
use crate::ident;
use crate::net::{ApiClient, ApiError, CounterSnapshot};
use crate::pipeline::Shutdown;

use super::fan_out;

const SOURCE: &str = "openalex";
const PER_PAGE_CAP: usize = 200;
const FILTER_BATCH: usize = 50;
const CURSOR_PAGE_CAP: usize = 500;

pub struct OpenAlexClient {
    api: Arc<ApiClient>,
    workers: usize,
    per_page: usize,
}

impl OpenAlexClient {
    pub fn new(api: Arc<ApiClient>, workers: usize, per_page: usize) -> Self {
        Self {
            api,
            workers,
            per_page: per_page.clamp(1, PER_PAGE_CAP),
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
        let clean: Vec<String> = dois
            .iter()
            .filter_map(|doi| ident::normalize_doi(doi))
            .collect();
        let tasks: Vec<_> = clean
            .chunks(FILTER_BATCH)
            .map(|chunk| self.fetch_batch(chunk.to_vec(), fallback_timestamp))
            .collect();
        fan_out(tasks, self.workers, shutdown).await
    }

    async fn fetch_batch(
        &self,
        dois: Vec<String>,
        fallback_timestamp: &str,
    ) -> Result<Vec<Record>, ApiError> {
        let filter = format!("doi:{}", dois.join("|"));
        let mut cursor = "*".to_string();
        let mut records: Vec<Record> = Vec::new();
        let mut pages = 0usize;

        loop {
            let params = vec![
                ("filter".to_string(), filter.clone()),
                ("per-page".to_string(), self.per_page.to_string()),
                ("cursor".to_string(), cursor.clone()),
            ];
            let payload = match self.api.get("/works", &params).await {
                Ok(payload) => payload,
                Err(error) => match self.api.fallback_info(&error) {
                    Some(info) => {
                        warn!(dois = dois.len(), error = %error, "openalex_batch_failed");
                        return Ok(dois
                            .iter()
                            .map(|doi| {
                                info.clone().into_record(
                                    "doi_clean",
                                    Scalar::String(doi.clone()),
                                    fallback_timestamp,
                                )
                            })
                            .collect());
                    }
                    None => return Err(error),
                },
            };

            if let Some(results) = payload.get("results").and_then(Value::as_array) {
                records.extend(results.iter().map(normalize_work));
            }
            pages += 1;
            match payload
                .get("meta")
                .and_then(|meta| meta.get("next_cursor"))
                .and_then(Value::as_str)
            {
                Some(next) if !next.is_empty() && pages < CURSOR_PAGE_CAP => {
                    cursor = next.to_string();
                }
                _ => break,
            }
        }
        Ok(records)
    }
}

fn normalize_work(work: &Value) -> Record {
    let mut record = Record::new();
    if let Some(id) = work
        .get("id")
        .and_then(Value::as_str)
        .and_then(ident::normalize_openalex_id)
    {
        record.set(format!("{SOURCE}_id"), Scalar::String(id));
    }
    if let Some(doi) = work.get("doi").and_then(Value::as_str) {
        if let Some(clean) = ident::normalize_doi(doi) {
            record.set("doi_clean", Scalar::String(clean));
        }
    }
    if let Some(title) = work.get("display_name").and_then(Value::as_str) {
        record.set(format!("{SOURCE}_title"), Scalar::String(title.to_string()));
    }
    if let Some(year) = work.get("publication_year").and_then(Value::as_i64) {
        record.set(format!("{SOURCE}_year"), Scalar::Int(year));
    }
    if let Some(date) = work.get("publication_date").and_then(Value::as_str) {
        record.set(
            format!("{SOURCE}_publication_date"),
            Scalar::String(date.to_string()),
        );
    }
    if let Some(cited) = work.get("cited_by_count").and_then(Value::as_i64) {
        record.set(format!("{SOURCE}_cited_by_count"), Scalar::Int(cited));
    }
    if let Some(work_type) = work.get("type").and_then(Value::as_str) {
        record.set(
            format!("{SOURCE}_type"),
            Scalar::String(work_type.to_string()),
        );
    }
    if let Some(is_oa) = work
        .get("open_access")
        .and_then(|oa| oa.get("is_oa"))
        .and_then(Value::as_bool)
    {
        record.set(format!("{SOURCE}_is_oa"), Scalar::Bool(is_oa));
    }
    record
}
