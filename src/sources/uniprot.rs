//! UniProt adapter: accession search plus the asynchronous id-mapping job.
//!
//! The id-mapping flow is submit -> poll `jobStatus` every `poll_interval`
//! until `FINISHED` -> fetch results, with a hard iteration cap so a stuck
//! job cannot wedge the run.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::frame::{Record, Scalar};
use crate::net::{ApiClient, ApiError, CounterSnapshot};
use crate::pipeline::Shutdown;

use super::fan_out;

const SOURCE: &str = "uniprot";
const SEARCH_BATCH: usize = 100;
const SEARCH_SIZE: usize = 500;

pub struct UniProtClient {
    api: Arc<ApiClient>,
    workers: usize,
    poll_interval: Duration,
    poll_max_iterations: u32,
}

impl UniProtClient {
    pub fn new(
        api: Arc<ApiClient>,
        workers: usize,
        poll_interval: Duration,
        poll_max_iterations: u32,
    ) -> Self {
        Self {
            api,
            workers,
            poll_interval,
            poll_max_iterations: poll_max_iterations.max(1),
        }
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.api.counters()
    }

    /// Build an `accession:` OR-query per batch and fan the batches out.
    pub async fn fetch_by_accessions(
        &self,
        accessions: &[String],
        shutdown: &Shutdown,
        fallback_timestamp: &str,
    ) -> Result<Vec<Record>, ApiError> {
        let tasks: Vec<_> = accessions
            .chunks(SEARCH_BATCH)
            .map(|chunk| self.search_batch(chunk.to_vec(), fallback_timestamp))
            .collect();
        fan_out(tasks, self.workers, shutdown).await
    }

    async fn search_batch(
        &self,
        accessions: Vec<String>,
        fallback_timestamp: &str,
    ) -> Result<Vec<Record>, ApiError> {
        let query = accessions
            .iter()
            .map(|acc| format!("accession:{acc}"))
            .collect::<Vec<_>>()
            .join(" OR ");
        let params = vec![
            ("query".to_string(), query),
            ("format".to_string(), "json".to_string()),
            ("size".to_string(), SEARCH_SIZE.to_string()),
        ];
        match self.api.get("/uniprotkb/search", &params).await {
            Ok(payload) => {
                let results = payload
                    .get("results")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                Ok(results.iter().map(normalize_entry).collect())
            }
            Err(error) => match self.api.fallback_info(&error) {
                Some(info) => {
                    warn!(accessions = accessions.len(), error = %error, "uniprot_batch_failed");
                    Ok(accessions
                        .iter()
                        .map(|acc| {
                            info.clone().into_record(
                                "uniprot_id",
                                Scalar::String(acc.clone()),
                                fallback_timestamp,
                            )
                        })
                        .collect())
                }
                None => Err(error),
            },
        }
    }

    /// Submit an id-mapping job and poll it to completion. Returns the
    /// `(from, to)` pairs of the finished job.
    pub async fn map_ids(
        &self,
        from_db: &str,
        to_db: &str,
        ids: &[String],
    ) -> Result<Vec<(String, String)>, ApiError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let submit_params = vec![
            ("from".to_string(), from_db.to_string()),
            ("to".to_string(), to_db.to_string()),
            ("ids".to_string(), ids.join(",")),
        ];
        let submitted = self.api.get("/idmapping/run", &submit_params).await?;
        let job_id = submitted
            .get("jobId")
            .and_then(Value::as_str)
            .ok_or_else(|| ApiError::Decode("idmapping submit returned no jobId".into()))?
            .to_string();
        debug!(job_id = %job_id, ids = ids.len(), "idmapping_submitted");

        let mut finished = false;
        for iteration in 0..self.poll_max_iterations {
            let status = self
                .api
                .get(&format!("/idmapping/status/{job_id}"), &[])
                .await?;
            let job_status = status.get("jobStatus").and_then(Value::as_str);
            match job_status {
                Some("FINISHED") => {
                    finished = true;
                    break;
                }
                // Servers answer the status poll with the results payload
                // once the job is done.
                None if status.get("results").is_some() => {
                    finished = true;
                    break;
                }
                Some(other) => {
                    debug!(job_id = %job_id, status = other, iteration, "idmapping_pending");
                }
                None => {}
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        if !finished {
            return Err(ApiError::Timeout(format!(
                "idmapping job {job_id} did not finish within {} polls",
                self.poll_max_iterations
            )));
        }

        let results = self
            .api
            .get(&format!("/idmapping/results/{job_id}"), &[])
            .await?;
        let pairs = results
            .get("results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(pairs
            .iter()
            .filter_map(|pair| {
                let from = pair.get("from").and_then(Value::as_str)?.to_string();
                let to = match pair.get("to") {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Object(map)) => map
                        .get("primaryAccession")
                        .and_then(Value::as_str)?
                        .to_string(),
                    _ => return None,
                };
                Some((from, to))
            })
            .collect())
    }
}

fn normalize_entry(entry: &Value) -> Record {
    let mut record = Record::new();
    if let Some(accession) = entry.get("primaryAccession").and_then(Value::as_str) {
        record.set("uniprot_id", Scalar::String(accession.to_string()));
    }
    if let Some(name) = entry
        .get("proteinDescription")
        .and_then(|d| d.get("recommendedName"))
        .and_then(|n| n.get("fullName"))
        .and_then(|f| f.get("value"))
        .and_then(Value::as_str)
    {
        record.set(
            format!("{SOURCE}_protein_name"),
            Scalar::String(name.to_string()),
        );
    }
    if let Some(gene) = entry
        .get("genes")
        .and_then(Value::as_array)
        .and_then(|genes| genes.first())
        .and_then(|g| g.get("geneName"))
        .and_then(|n| n.get("value"))
        .and_then(Value::as_str)
    {
        record.set(format!("{SOURCE}_gene"), Scalar::String(gene.to_string()));
    }
    if let Some(organism) = entry
        .get("organism")
        .and_then(|o| o.get("scientificName"))
        .and_then(Value::as_str)
    {
        record.set(
            format!("{SOURCE}_organism"),
            Scalar::String(organism.to_string()),
        );
    }
    if let Some(tax_id) = entry
        .get("organism")
        .and_then(|o| o.get("taxonId"))
        .and_then(Value::as_i64)
    {
        record.set(format!("{SOURCE}_tax_id"), Scalar::Int(tax_id));
    }
    if let Some(length) = entry
        .get("sequence")
        .and_then(|s| s.get("length"))
        .and_then(Value::as_i64)
    {
        record.set(format!("{SOURCE}_sequence_length"), Scalar::Int(length));
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpProfile;
    use crate::net::testing::{json_ok, MockTransport};

    fn client(transport: Arc<MockTransport>) -> UniProtClient {
        let mut profile = HttpProfile::default();
        profile.max_calls = 1000;
        profile.retry.total = 0;
        let api = Arc::new(ApiClient::new(
            "uniprot",
            "https://rest.uniprot.org",
            &profile,
            transport,
        ));
        UniProtClient::new(api, 2, Duration::from_millis(5), 5)
    }

    #[tokio::test]
    async fn test_search_normalizes_entries() {
        let transport = Arc::new(MockTransport::new(vec![json_ok(
            r#"{"results": [{"primaryAccession": "P23219", "proteinDescription": {"recommendedName": {"fullName": {"value": "Prostaglandin G/H synthase 1"}}}, "genes": [{"geneName": {"value": "PTGS1"}}], "organism": {"scientificName": "Homo sapiens", "taxonId": 9606}, "sequence": {"length": 599}}]}"#,
        )]));
        let client = client(transport.clone());
        let records = client
            .fetch_by_accessions(
                &["P23219".to_string()],
                &Shutdown::new(),
                "2024-01-01T00:00:00Z",
            )
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].get("uniprot_id"),
            Some(&Scalar::String("P23219".into()))
        );
        assert_eq!(
            records[0].get("uniprot_gene"),
            Some(&Scalar::String("PTGS1".into()))
        );
        assert_eq!(records[0].get("uniprot_tax_id"), Some(&Scalar::Int(9606)));

        let query = transport.requests()[0]
            .params
            .iter()
            .find(|(k, _)| k == "query")
            .map(|(_, v)| v.clone())
            .unwrap();
        assert_eq!(query, "accession:P23219");
    }

    #[tokio::test]
    async fn test_idmapping_polls_until_finished() {
        let transport = Arc::new(MockTransport::new(vec![
            json_ok(r#"{"jobId": "job-1"}"#),
            json_ok(r#"{"jobStatus": "RUNNING"}"#),
            json_ok(r#"{"jobStatus": "FINISHED"}"#),
            json_ok(r#"{"results": [{"from": "PTGS1", "to": {"primaryAccession": "P23219"}}]}"#),
        ]));
        let client = client(transport.clone());
        let pairs = client
            .map_ids("Gene_Name", "UniProtKB", &["PTGS1".to_string()])
            .await
            .unwrap();
        assert_eq!(pairs, vec![("PTGS1".to_string(), "P23219".to_string())]);
        assert_eq!(transport.calls(), 4);
    }

    #[tokio::test]
    async fn test_idmapping_poll_cap_times_out() {
        let mut responses = vec![json_ok(r#"{"jobId": "job-2"}"#)];
        for _ in 0..10 {
            responses.push(json_ok(r#"{"jobStatus": "RUNNING"}"#));
        }
        let transport = Arc::new(MockTransport::new(responses));
        let client = client(transport);
        let error = client
            .map_ids("Gene_Name", "UniProtKB", &["PTGS2".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(error, ApiError::Timeout(_)));
    }
}
