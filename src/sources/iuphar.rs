//! IUPHAR / Guide to Pharmacology adapter.
//!
//! Two interchangeable modes: a bundled CSV dictionary loaded into in-memory
//! indices, or the GtoPdb REST service. Lookup precedence is fixed:
//! target id, then UniProt accession, then gene symbol, then name.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::frame::{Record, Scalar};
use crate::net::{ApiClient, ApiError, ApiOutcome, CounterSnapshot};
use crate::pipeline::{PipelineError, Shutdown};

use super::fan_out;

const SOURCE: &str = "iuphar";

/// Lookup key precedence, first match wins.
pub const LOOKUP_PRECEDENCE: &[&str] = &["target_id", "uniprot", "gene", "name"];

/// One canonical dictionary row.
#[derive(Debug, Clone, Default)]
pub struct DictionaryTarget {
    pub target_id: String,
    pub uniprot_id: String,
    pub gene_name: String,
    pub target_name: String,
    pub target_type: String,
    pub family_id: String,
    pub family_name: String,
}

/// Mixed-case dictionary headers are renamed to the canonical form before
/// indexing, mirroring the bundled `_IUPHAR_target.csv` variants.
fn canonical_header(raw: &str) -> String {
    match raw {
        "swissprot" | "SWISSPROT" => "uniprot_id".to_string(),
        "HGNC_NAME" | "HGNC_name" => "hgnc_name".to_string(),
        "HGNC_ID" | "HGNC_id" => "hgnc_id".to_string(),
        "name" | "Name" => "target_name".to_string(),
        "Type" | "Type_name" => "type".to_string(),
        other => other.to_lowercase(),
    }
}

pub struct IupharDictionary {
    targets: Vec<DictionaryTarget>,
    by_target_id: HashMap<String, usize>,
    by_uniprot: HashMap<String, usize>,
    by_gene: HashMap<String, usize>,
    by_name: HashMap<String, usize>,
}

impl IupharDictionary {
    /// Load `_IUPHAR_target.csv` and `_IUPHAR_family.csv`, joining family
    /// names onto targets and building the four lookup indices.
    pub fn load(target_path: &Path, family_path: Option<&Path>) -> Result<Self, PipelineError> {
        let input_error = |path: &Path, message: String| PipelineError::Input {
            path: path.display().to_string(),
            message,
        };

        let mut family_names: HashMap<String, String> = HashMap::new();
        if let Some(family_path) = family_path {
            let mut reader = csv::ReaderBuilder::new()
                .flexible(true)
                .from_path(family_path)
                .map_err(|e| input_error(family_path, e.to_string()))?;
            let headers: Vec<String> = reader
                .headers()
                .map_err(|e| input_error(family_path, e.to_string()))?
                .iter()
                .map(canonical_header)
                .collect();
            let id_idx = headers.iter().position(|h| h == "family_id");
            let name_idx = headers
                .iter()
                .position(|h| h == "family_name" || h == "family_name_backup");
            for row in reader.records() {
                let row = row.map_err(|e| input_error(family_path, e.to_string()))?;
                if let (Some(id_idx), Some(name_idx)) = (id_idx, name_idx) {
                    let id = row.get(id_idx).unwrap_or("").trim().to_string();
                    let name = row.get(name_idx).unwrap_or("").trim().to_string();
                    if !id.is_empty() && !name.is_empty() {
                        family_names.entry(id).or_insert(name);
                    }
                }
            }
        }

        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(target_path)
            .map_err(|e| input_error(target_path, e.to_string()))?;
        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| input_error(target_path, e.to_string()))?
            .iter()
            .map(canonical_header)
            .collect();
        let field = |headers: &[String], name: &str| headers.iter().position(|h| h == name);
        let target_id_idx = field(&headers, "target_id");
        let uniprot_idx = field(&headers, "uniprot_id");
        let gene_idx = field(&headers, "gene_name");
        let name_idx = field(&headers, "target_name");
        let type_idx = field(&headers, "type");
        let family_idx = field(&headers, "family_id");

        let mut targets: Vec<DictionaryTarget> = Vec::new();
        for row in reader.records() {
            let row = row.map_err(|e| input_error(target_path, e.to_string()))?;
            let cell = |idx: Option<usize>| {
                idx.and_then(|i| row.get(i))
                    .unwrap_or("")
                    .trim()
                    .to_string()
            };
            let family_id = cell(family_idx);
            targets.push(DictionaryTarget {
                target_id: cell(target_id_idx),
                uniprot_id: cell(uniprot_idx),
                gene_name: cell(gene_idx),
                target_name: cell(name_idx),
                target_type: cell(type_idx),
                family_name: family_names.get(&family_id).cloned().unwrap_or_default(),
                family_id,
            });
        }

        let mut dictionary = Self {
            targets,
            by_target_id: HashMap::new(),
            by_uniprot: HashMap::new(),
            by_gene: HashMap::new(),
            by_name: HashMap::new(),
        };
        for (idx, target) in dictionary.targets.iter().enumerate() {
            if !target.target_id.is_empty() {
                dictionary
                    .by_target_id
                    .entry(target.target_id.clone())
                    .or_insert(idx);
            }
            if !target.uniprot_id.is_empty() {
                dictionary
                    .by_uniprot
                    .entry(target.uniprot_id.to_uppercase())
                    .or_insert(idx);
            }
            if !target.gene_name.is_empty() {
                dictionary
                    .by_gene
                    .entry(target.gene_name.to_lowercase())
                    .or_insert(idx);
            }
            if !target.target_name.is_empty() {
                dictionary
                    .by_name
                    .entry(target.target_name.to_lowercase())
                    .or_insert(idx);
            }
        }
        info!(targets = dictionary.targets.len(), "iuphar_dictionary_loaded");
        Ok(dictionary)
    }

    /// Resolve one query following [`LOOKUP_PRECEDENCE`].
    pub fn lookup(
        &self,
        target_id: Option<&str>,
        uniprot: Option<&str>,
        gene: Option<&str>,
        name: Option<&str>,
    ) -> Option<&DictionaryTarget> {
        for key in LOOKUP_PRECEDENCE {
            let hit = match *key {
                "target_id" => target_id.and_then(|id| self.by_target_id.get(id.trim())),
                "uniprot" => {
                    uniprot.and_then(|acc| self.by_uniprot.get(&acc.trim().to_uppercase()))
                }
                "gene" => gene.and_then(|g| self.by_gene.get(&g.trim().to_lowercase())),
                "name" => name.and_then(|n| self.by_name.get(&n.trim().to_lowercase())),
                _ => None,
            };
            if let Some(&idx) = hit {
                return self.targets.get(idx);
            }
        }
        None
    }
}

fn target_record(target: &DictionaryTarget, uniprot: &str) -> Record {
    let mut record = Record::new();
    record.set("uniprot_id", Scalar::String(uniprot.to_string()));
    if let Ok(id) = target.target_id.parse::<i64>() {
        record.set(format!("{SOURCE}_target_id"), Scalar::Int(id));
    }
    if !target.target_name.is_empty() {
        record.set(
            format!("{SOURCE}_name"),
            Scalar::String(target.target_name.clone()),
        );
    }
    if !target.target_type.is_empty() {
        record.set(
            format!("{SOURCE}_type"),
            Scalar::String(target.target_type.clone()),
        );
    }
    if let Ok(id) = target.family_id.parse::<i64>() {
        record.set(format!("{SOURCE}_family_id"), Scalar::Int(id));
    }
    if !target.family_name.is_empty() {
        record.set(
            format!("{SOURCE}_family_name"),
            Scalar::String(target.family_name.clone()),
        );
    }
    record
}

enum Mode {
    Dictionary(IupharDictionary),
    Rest(Arc<ApiClient>),
}

pub struct IupharClient {
    mode: Mode,
    workers: usize,
}

impl IupharClient {
    pub fn from_dictionary(dictionary: IupharDictionary) -> Self {
        Self {
            mode: Mode::Dictionary(dictionary),
            workers: 1,
        }
    }

    /// REST mode; `api_key` rides as a header when configured.
    pub fn from_rest(api: ApiClient, workers: usize, api_key: Option<String>) -> Self {
        let api = match api_key {
            Some(key) => api.with_header("x-api-key", key),
            None => api,
        };
        Self {
            mode: Mode::Rest(Arc::new(api)),
            workers,
        }
    }

    pub fn counters(&self) -> CounterSnapshot {
        match &self.mode {
            Mode::Dictionary(_) => CounterSnapshot::default(),
            Mode::Rest(api) => api.counters(),
        }
    }

    /// Enrich by UniProt accession. Dictionary misses are silent (null
    /// enrichment); REST failures degrade to fallback records.
    pub async fn fetch_by_uniprot(
        &self,
        accessions: &[String],
        shutdown: &Shutdown,
        fallback_timestamp: &str,
    ) -> Result<Vec<Record>, ApiError> {
        match &self.mode {
            Mode::Dictionary(dictionary) => Ok(accessions
                .iter()
                .filter_map(|acc| {
                    dictionary
                        .lookup(None, Some(acc), None, None)
                        .map(|target| target_record(target, acc))
                })
                .collect()),
            Mode::Rest(api) => {
                let tasks: Vec<_> = accessions
                    .iter()
                    .map(|acc| fetch_rest_one(api.clone(), acc.clone(), fallback_timestamp))
                    .collect();
                fan_out(tasks, self.workers, shutdown).await
            }
        }
    }
}

async fn fetch_rest_one(
    api: Arc<ApiClient>,
    accession: String,
    fallback_timestamp: &str,
) -> Result<Vec<Record>, ApiError> {
    let params = vec![("accession".to_string(), accession.clone())];
    match api.get_with_fallback("/targets", &params).await? {
        ApiOutcome::Payload(payload) => {
            let targets = payload.as_array().cloned().unwrap_or_default();
            let Some(first) = targets.first() else {
                return Ok(Vec::new());
            };
            let mut target = DictionaryTarget::default();
            if let Some(id) = first.get("targetId").and_then(Value::as_i64) {
                target.target_id = id.to_string();
            }
            if let Some(name) = first.get("name").and_then(Value::as_str) {
                target.target_name = name.to_string();
            }
            if let Some(kind) = first.get("type").and_then(Value::as_str) {
                target.target_type = kind.to_string();
            }
            if let Some(family) = first.get("familyIds").and_then(Value::as_array) {
                if let Some(id) = family.first().and_then(Value::as_i64) {
                    target.family_id = id.to_string();
                }
            }
            Ok(vec![target_record(&target, &accession)])
        }
        ApiOutcome::Fallback(info) => {
            warn!(accession = %accession, "iuphar_rest_fallback");
            Ok(vec![info.into_record(
                "uniprot_id",
                Scalar::String(accession),
                fallback_timestamp,
            )])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_dictionary(dir: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
        let targets = dir.join("_IUPHAR_target.csv");
        let mut file = std::fs::File::create(&targets).unwrap();
        writeln!(file, "target_id,SWISSPROT,gene_name,name,Type,family_id").unwrap();
        writeln!(file, "1375,P23219,PTGS1,Cyclooxygenase-1,Enzyme,269").unwrap();
        writeln!(file, "1376,P35354,PTGS2,Cyclooxygenase-2,Enzyme,269").unwrap();
        drop(file);

        let families = dir.join("_IUPHAR_family.csv");
        let mut file = std::fs::File::create(&families).unwrap();
        writeln!(file, "family_id,family_name,Type").unwrap();
        writeln!(file, "269,Cyclooxygenases,Enzyme").unwrap();
        drop(file);
        (targets, families)
    }

    #[test]
    fn test_dictionary_lookup_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let (targets, families) = write_dictionary(dir.path());
        let dictionary = IupharDictionary::load(&targets, Some(&families)).unwrap();

        // target_id outranks a conflicting uniprot key.
        let hit = dictionary
            .lookup(Some("1375"), Some("P35354"), None, None)
            .unwrap();
        assert_eq!(hit.target_name, "Cyclooxygenase-1");

        let by_uniprot = dictionary.lookup(None, Some("p35354"), None, None).unwrap();
        assert_eq!(by_uniprot.target_name, "Cyclooxygenase-2");

        let by_gene = dictionary.lookup(None, None, Some("ptgs1"), None).unwrap();
        assert_eq!(by_gene.target_id, "1375");

        let by_name = dictionary
            .lookup(None, None, None, Some("cyclooxygenase-2"))
            .unwrap();
        assert_eq!(by_name.target_id, "1376");

        assert!(dictionary.lookup(None, Some("Q00000"), None, None).is_none());
    }

    #[tokio::test]
    async fn test_dictionary_mode_enrichment() {
        let dir = tempfile::tempdir().unwrap();
        let (targets, families) = write_dictionary(dir.path());
        let dictionary = IupharDictionary::load(&targets, Some(&families)).unwrap();
        let client = IupharClient::from_dictionary(dictionary);

        let records = client
            .fetch_by_uniprot(
                &["P23219".to_string(), "Q00000".to_string()],
                &Shutdown::new(),
                "2024-01-01T00:00:00Z",
            )
            .await
            .unwrap();
        // Misses are silent, not fallback rows.
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("iuphar_target_id"), Some(&Scalar::Int(1375)));
        assert_eq!(
            records[0].get("iuphar_family_name"),
            Some(&Scalar::String("Cyclooxygenases".into()))
        );
    }
}
