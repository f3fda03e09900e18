//! ChEMBL adapter: the baseline source for every entity.
//!
//! One `/status` handshake per run captures the database release that gets
//! stamped into every row. Entity endpoints use cursor pagination with
//! comma-joined `__in` filters. Setting `BIOETL_OFFLINE_CHEMBL_CLIENT=true`
//! swaps the network path for a deterministic stub so pipelines can run
//! without touching the API.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{info, warn};

use crate::frame::{Record, Scalar};
use crate::ident;
use crate::net::{ApiClient, ApiError, CounterSnapshot};
use crate::paginate::CursorPaginator;
use crate::pipeline::Shutdown;

use super::chunk::{chunk_ids, comma_filter_len};
use super::fan_out;

pub const OFFLINE_ENV: &str = "BIOETL_OFFLINE_CHEMBL_CLIENT";
pub const DEFAULT_BASE_URL: &str = "https://www.ebi.ac.uk/chembl/api/data";

const PAGE_SIZE: usize = 200;

/// Endpoint wiring per ChEMBL entity.
#[derive(Debug, Clone, Copy)]
pub struct EntityEndpoint {
    pub endpoint: &'static str,
    pub filter_param: &'static str,
    pub id_key: &'static str,
    pub items_key: &'static str,
}

pub fn entity_endpoint(entity: &str) -> Option<EntityEndpoint> {
    let config = match entity {
        "activity" => EntityEndpoint {
            endpoint: "/activity.json",
            filter_param: "activity_id__in",
            id_key: "activity_id",
            items_key: "activities",
        },
        "assay" => EntityEndpoint {
            endpoint: "/assay.json",
            filter_param: "assay_chembl_id__in",
            id_key: "assay_chembl_id",
            items_key: "assays",
        },
        "document" => EntityEndpoint {
            endpoint: "/document.json",
            filter_param: "document_chembl_id__in",
            id_key: "document_chembl_id",
            items_key: "documents",
        },
        "target" => EntityEndpoint {
            endpoint: "/target.json",
            filter_param: "target_chembl_id__in",
            id_key: "target_chembl_id",
            items_key: "targets",
        },
        "testitem" => EntityEndpoint {
            endpoint: "/molecule.json",
            filter_param: "molecule_chembl_id__in",
            id_key: "molecule_chembl_id",
            items_key: "molecules",
        },
        _ => return None,
    };
    Some(config)
}

pub struct ChemblClient {
    api: Arc<ApiClient>,
    batch_size: usize,
    max_url_length: usize,
    workers: usize,
    offline: bool,
    release: Mutex<Option<String>>,
}

impl ChemblClient {
    pub fn new(
        api: Arc<ApiClient>,
        batch_size: usize,
        max_url_length: usize,
        workers: usize,
    ) -> Self {
        let offline = std::env::var(OFFLINE_ENV)
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        if offline {
            info!("chembl_offline_stub_enabled");
        }
        Self {
            api,
            batch_size: batch_size.max(1),
            max_url_length,
            workers,
            offline,
            release: Mutex::new(None),
        }
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.api.counters()
    }

    /// Release captured by an earlier handshake, if any.
    pub fn release(&self) -> Option<String> {
        self.release.lock().clone()
    }

    /// `/status` handshake, performed once per run and cached.
    pub async fn handshake(&self) -> Result<String, ApiError> {
        if let Some(release) = self.release.lock().clone() {
            return Ok(release);
        }
        let release = if self.offline {
            "ChEMBL_35".to_string()
        } else {
            let payload = self.api.get("/status", &[]).await?;
            payload
                .get("chembl_db_version")
                .and_then(Value::as_str)
                .map(|s| s.to_string())
                .ok_or_else(|| {
                    ApiError::Decode("status payload missing chembl_db_version".into())
                })?
        };
        info!(chembl_release = %release, "chembl_handshake");
        *self.release.lock() = Some(release.clone());
        Ok(release)
    }

    /// Fetch all records for `ids`, one fallback record per id on chunk-level
    /// failure that matches a configured strategy.
    pub async fn fetch_entity(
        &self,
        entity: &str,
        ids: &[String],
        shutdown: &Shutdown,
        fallback_timestamp: &str,
    ) -> Result<Vec<Record>, ApiError> {
        let config = entity_endpoint(entity)
            .ok_or_else(|| ApiError::Decode(format!("unknown ChEMBL entity {entity}")))?;
        self.handshake().await?;

        if self.offline {
            return Ok(stub_records(entity, &config, ids));
        }

        let base = format!("{}{}", self.api.base_url(), config.endpoint);
        let chunks = chunk_ids(
            ids,
            self.batch_size,
            self.max_url_length,
            comma_filter_len(&base, config.filter_param),
        );
        let tasks: Vec<_> = chunks
            .into_iter()
            .map(|chunk| self.fetch_chunk(config, chunk, fallback_timestamp))
            .collect();
        fan_out(tasks, self.workers, shutdown).await
    }

    async fn fetch_chunk(
        &self,
        config: EntityEndpoint,
        chunk: Vec<String>,
        fallback_timestamp: &str,
    ) -> Result<Vec<Record>, ApiError> {
        let params = vec![
            (config.filter_param.to_string(), chunk.join(",")),
            ("limit".to_string(), PAGE_SIZE.to_string()),
        ];
        let paginator = CursorPaginator::new(self.api.clone(), config.endpoint, params)
            .with_items_key(config.items_key);
        match paginator.collect(None).await {
            Ok(items) => Ok(items
                .iter()
                .map(|item| normalize_record(config, item))
                .collect()),
            Err(error) => match self.api.fallback_info(&error) {
                Some(info) => {
                    warn!(
                        entity_ids = chunk.len(),
                        error = %error,
                        "chembl_chunk_failed_emitting_fallbacks"
                    );
                    Ok(chunk
                        .iter()
                        .map(|id| {
                            info.clone().into_record(
                                config.id_key,
                                id_scalar(config.id_key, id),
                                fallback_timestamp,
                            )
                        })
                        .collect())
                }
                None => Err(error),
            },
        }
    }
}

fn id_scalar(id_key: &str, id: &str) -> Scalar {
    if id_key == "activity_id" {
        if let Ok(value) = id.parse::<i64>() {
            return Scalar::Int(value);
        }
    }
    Scalar::String(id.to_string())
}

/// Flatten one payload item. The baseline source keeps unprefixed keys; the
/// shared `doi_clean` and `pmid` fields are derived when present.
fn normalize_record(config: EntityEndpoint, item: &Value) -> Record {
    let mut record = Record::from_json_object(item);
    if let Some(doi) = item.get("doi").and_then(Value::as_str) {
        if let Some(clean) = ident::normalize_doi(doi) {
            record.set("doi_clean", Scalar::String(clean));
        }
    }
    if let Some(pmid) = item.get("pubmed_id").and_then(Value::as_i64) {
        record.set("pmid", Scalar::Int(pmid));
    } else if let Some(pmid) = item
        .get("pubmed_id")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<i64>().ok())
    {
        record.set("pmid", Scalar::Int(pmid));
    }
    // Ensure the id key survives even for sparse payloads.
    if !record.contains(config.id_key) {
        record.set(config.id_key, Scalar::Null);
    }
    record
}

/// Deterministic offline dataset: one minimal row per requested id, with the
/// same fixed attributes the real API would enrich.
fn stub_records(entity: &str, config: &EntityEndpoint, ids: &[String]) -> Vec<Record> {
    let ids: Vec<String> = if ids.is_empty() {
        vec![default_stub_id(entity).to_string()]
    } else {
        ids.to_vec()
    };

    ids.iter()
        .map(|id| {
            let mut record = Record::new();
            record.set(config.id_key, id_scalar(config.id_key, id));
            match entity {
                "activity" => {
                    record.set("assay_chembl_id", Scalar::String("CHEMBL615156".into()));
                    record.set("molecule_chembl_id", Scalar::String("CHEMBL25".into()));
                    record.set("target_chembl_id", Scalar::String("CHEMBL230".into()));
                    record.set("document_chembl_id", Scalar::String("CHEMBL1158643".into()));
                    record.set("standard_type", Scalar::String("IC50".into()));
                    record.set("standard_relation", Scalar::String("=".into()));
                    record.set("standard_value", Scalar::Float(10.0));
                    record.set("standard_units", Scalar::String("nM".into()));
                    record.set("bao_format", Scalar::String("BAO_0000015".into()));
                    record.set(
                        "canonical_smiles",
                        Scalar::String("CC(=O)Oc1ccccc1C(=O)O".into()),
                    );
                }
                "assay" => {
                    record.set("assay_type", Scalar::String("B".into()));
                    record.set("description", Scalar::String("Binding assay".into()));
                    record.set("assay_organism", Scalar::String("Homo sapiens".into()));
                    record.set("assay_tax_id", Scalar::Int(9606));
                    record.set("target_chembl_id", Scalar::String("CHEMBL230".into()));
                    record.set("document_chembl_id", Scalar::String("CHEMBL1158643".into()));
                    record.set("bao_format", Scalar::String("BAO_0000357".into()));
                    record.set("confidence_score", Scalar::Int(9));
                }
                "document" => {
                    record.set("doi", Scalar::String("10.1021/jm00178a015".into()));
                    record.set("doi_clean", Scalar::String("10.1021/jm00178a015".into()));
                    record.set("pmid", Scalar::Int(2231594));
                    record.set(
                        "title",
                        Scalar::String("Synthesis and biological evaluation".into()),
                    );
                    record.set("journal", Scalar::String("J. Med. Chem.".into()));
                    record.set("year", Scalar::Int(1990));
                }
                "target" => {
                    record.set("pref_name", Scalar::String("Cyclooxygenase-1".into()));
                    record.set("target_type", Scalar::String("SINGLE PROTEIN".into()));
                    record.set("organism", Scalar::String("Homo sapiens".into()));
                    record.set("tax_id", Scalar::Int(9606));
                }
                "testitem" => {
                    record.set("pref_name", Scalar::String("ASPIRIN".into()));
                    record.set(
                        "canonical_smiles",
                        Scalar::String("CC(=O)Oc1ccccc1C(=O)O".into()),
                    );
                    record.set(
                        "standard_inchi_key",
                        Scalar::String("BSYNRYMUTXBXSQ-UHFFFAOYSA-N".into()),
                    );
                    record.set("molecular_formula", Scalar::String("C9H8O4".into()));
                    record.set("full_mwt", Scalar::Float(180.16));
                }
                _ => {}
            }
            record
        })
        .collect()
}

fn default_stub_id(entity: &str) -> &'static str {
    match entity {
        "activity" => "1",
        "assay" => "CHEMBL615156",
        "document" => "CHEMBL1158643",
        "target" => "CHEMBL230",
        "testitem" => "CHEMBL25",
        _ => "CHEMBL1",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpProfile;
    use crate::net::testing::{json_ok, MockTransport};

    fn client(transport: Arc<MockTransport>, fallback: &[&str]) -> ChemblClient {
        let mut profile = HttpProfile::default();
        profile.max_calls = 1000;
        profile.retry.total = 0;
        profile.fallback_strategies = fallback.iter().map(|s| s.to_string()).collect();
        let api = Arc::new(ApiClient::new("chembl", "http://chembl", &profile, transport));
        ChemblClient::new(api, 10, 2000, 2)
    }

    #[tokio::test]
    async fn test_handshake_once_per_run() {
        let transport = Arc::new(MockTransport::new(vec![
            json_ok(r#"{"chembl_db_version": "ChEMBL_35", "api_version": "2.x"}"#),
        ]));
        let chembl = client(transport.clone(), &[]);
        assert_eq!(chembl.handshake().await.unwrap(), "ChEMBL_35");
        assert_eq!(chembl.handshake().await.unwrap(), "ChEMBL_35");
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_fetch_entity_normalizes_items() {
        let transport = Arc::new(MockTransport::new(vec![
            json_ok(r#"{"chembl_db_version": "ChEMBL_35"}"#),
            json_ok(
                r#"{"activities": [{"activity_id": 123, "standard_type": "IC50", "standard_value": 10.0, "standard_units": "nM"}], "page_meta": {"next": null}}"#,
            ),
        ]));
        let chembl = client(transport.clone(), &[]);
        let records = chembl
            .fetch_entity(
                "activity",
                &["123".to_string()],
                &Shutdown::new(),
                "2024-01-01T00:00:00Z",
            )
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("activity_id"), Some(&Scalar::Int(123)));
        assert_eq!(
            records[0].get("standard_type"),
            Some(&Scalar::String("IC50".into()))
        );

        let requests = transport.requests();
        let filter = requests[1]
            .params
            .iter()
            .find(|(k, _)| k == "activity_id__in")
            .map(|(_, v)| v.clone());
        assert_eq!(filter, Some("123".to_string()));
    }

    #[tokio::test]
    async fn test_chunk_failure_emits_per_id_fallbacks() {
        let transport = Arc::new(MockTransport::new(vec![
            json_ok(r#"{"chembl_db_version": "ChEMBL_35"}"#),
            crate::net::testing::http_status(503),
        ]));
        let chembl = client(transport, &["5xx"]);
        let records = chembl
            .fetch_entity(
                "activity",
                &["1".to_string(), "2".to_string()],
                &Shutdown::new(),
                "2024-01-01T00:00:00Z",
            )
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        for (record, id) in records.iter().zip([1i64, 2]) {
            assert_eq!(record.get("activity_id"), Some(&Scalar::Int(id)));
            assert_eq!(
                record.get("fallback_reason"),
                Some(&Scalar::String("5xx".into()))
            );
            assert_eq!(record.get("fallback_http_status"), Some(&Scalar::Int(503)));
        }
    }

    #[tokio::test]
    async fn test_document_doi_is_cleaned() {
        let transport = Arc::new(MockTransport::new(vec![
            json_ok(r#"{"chembl_db_version": "ChEMBL_35"}"#),
            json_ok(
                r#"{"documents": [{"document_chembl_id": "CHEMBL1158643", "doi": "10.1021/JM00178A015", "pubmed_id": "2231594"}], "page_meta": {"next": null}}"#,
            ),
        ]));
        let chembl = client(transport, &[]);
        let records = chembl
            .fetch_entity(
                "document",
                &["CHEMBL1158643".to_string()],
                &Shutdown::new(),
                "2024-01-01T00:00:00Z",
            )
            .await
            .unwrap();
        assert_eq!(
            records[0].get("doi_clean"),
            Some(&Scalar::String("10.1021/jm00178a015".into()))
        );
        assert_eq!(records[0].get("pmid"), Some(&Scalar::Int(2231594)));
    }

    #[test]
    fn test_stub_is_deterministic_per_id() {
        let config = entity_endpoint("activity").unwrap();
        let a = stub_records("activity", &config, &["123".to_string()]);
        let b = stub_records("activity", &config, &["123".to_string()]);
        assert_eq!(a, b);
        assert_eq!(a[0].get("activity_id"), Some(&Scalar::Int(123)));
        assert_eq!(a[0].get("standard_value"), Some(&Scalar::Float(10.0)));
    }
}
