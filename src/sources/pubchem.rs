//! PubChem adapter: InChIKey -> CID resolution plus property, synonym and
//! cross-reference fetches joined per requested identifier.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::frame::encode::canonical_json;
use crate::frame::{Record, Scalar};
use crate::ident;
use crate::net::{ApiClient, ApiError, CounterSnapshot};
use crate::pipeline::Shutdown;

use super::fan_out;

const SOURCE: &str = "pubchem";
const PROPERTIES: &str = "MolecularFormula,MolecularWeight,CanonicalSMILES,InChIKey,IUPACName";
const SYNONYM_CAP: usize = 20;

pub struct PubChemClient {
    api: Arc<ApiClient>,
    workers: usize,
}

impl PubChemClient {
    pub fn new(api: Arc<ApiClient>, workers: usize) -> Self {
        Self { api, workers }
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.api.counters()
    }

    /// One record per requested InChIKey; the submitted key always survives
    /// in `pubchem_lookup_inchikey` even when resolution fails.
    pub async fn fetch_by_inchikeys(
        &self,
        inchikeys: &[String],
        shutdown: &Shutdown,
        fallback_timestamp: &str,
    ) -> Result<Vec<Record>, ApiError> {
        let tasks: Vec<_> = inchikeys
            .iter()
            .map(|key| self.fetch_one(key.clone(), fallback_timestamp))
            .collect();
        fan_out(tasks, self.workers, shutdown).await
    }

    async fn fetch_one(
        &self,
        inchikey: String,
        fallback_timestamp: &str,
    ) -> Result<Vec<Record>, ApiError> {
        let lookup = ident::normalize_inchi_key(&inchikey).unwrap_or_else(|| inchikey.clone());

        let cid = match self.resolve_cid(&lookup).await {
            Ok(cid) => cid,
            Err(error) => match self.api.fallback_info(&error) {
                Some(info) => {
                    return Ok(vec![info.into_record(
                        "pubchem_lookup_inchikey",
                        Scalar::String(lookup),
                        fallback_timestamp,
                    )]);
                }
                None => return Err(error),
            },
        };

        let mut record = Record::new();
        record.set("pubchem_lookup_inchikey", Scalar::String(lookup.clone()));
        let Some(cid) = cid else {
            debug!(inchikey = %lookup, "pubchem_cid_not_found");
            return Ok(vec![record]);
        };
        record.set(format!("{SOURCE}_cid"), Scalar::Int(cid));

        if let Some(properties) = self.fetch_properties(cid).await? {
            for (field, key) in [
                ("molecular_formula", "MolecularFormula"),
                ("canonical_smiles", "CanonicalSMILES"),
                ("inchikey", "InChIKey"),
                ("iupac_name", "IUPACName"),
            ] {
                if let Some(value) = properties.get(key).and_then(Value::as_str) {
                    record.set(
                        format!("{SOURCE}_{field}"),
                        Scalar::String(value.to_string()),
                    );
                }
            }
            // MolecularWeight arrives as a string in PUG REST payloads.
            let weight = match properties.get("MolecularWeight") {
                Some(Value::String(s)) => s.parse::<f64>().ok(),
                Some(Value::Number(n)) => n.as_f64(),
                _ => None,
            };
            if let Some(weight) = weight {
                record.set(format!("{SOURCE}_molecular_weight"), Scalar::Float(weight));
            }
        }

        let synonyms = self.fetch_synonyms(cid).await?;
        if !synonyms.is_empty() {
            record.set(
                format!("{SOURCE}_synonyms"),
                Scalar::Encoded(canonical_json(&Value::Array(
                    synonyms.into_iter().map(Value::String).collect(),
                ))),
            );
        }

        let registry_ids = self.fetch_registry_ids(cid).await?;
        if !registry_ids.is_empty() {
            record.set(
                format!("{SOURCE}_registry_ids"),
                Scalar::Encoded(canonical_json(&Value::Array(
                    registry_ids.into_iter().map(Value::String).collect(),
                ))),
            );
        }

        Ok(vec![record])
    }

    async fn resolve_cid(&self, inchikey: &str) -> Result<Option<i64>, ApiError> {
        let endpoint = format!("/rest/pug/compound/inchikey/{inchikey}/cids/JSON");
        let payload = self.api.get(&endpoint, &[]).await?;
        Ok(payload
            .get("IdentifierList")
            .and_then(|list| list.get("CID"))
            .and_then(Value::as_array)
            .and_then(|cids| cids.first())
            .and_then(Value::as_i64))
    }

    async fn fetch_properties(&self, cid: i64) -> Result<Option<Value>, ApiError> {
        let endpoint = format!("/rest/pug/compound/cid/{cid}/property/{PROPERTIES}/JSON");
        let payload = self.api.get(&endpoint, &[]).await?;
        Ok(payload
            .get("PropertyTable")
            .and_then(|table| table.get("Properties"))
            .and_then(Value::as_array)
            .and_then(|props| props.first())
            .cloned())
    }

    async fn fetch_synonyms(&self, cid: i64) -> Result<Vec<String>, ApiError> {
        let endpoint = format!("/rest/pug/compound/cid/{cid}/synonyms/JSON");
        let payload = self.api.get(&endpoint, &[]).await?;
        Ok(payload
            .get("InformationList")
            .and_then(|list| list.get("Information"))
            .and_then(Value::as_array)
            .and_then(|info| info.first())
            .and_then(|first| first.get("Synonym"))
            .and_then(Value::as_array)
            .map(|synonyms| {
                synonyms
                    .iter()
                    .filter_map(Value::as_str)
                    .take(SYNONYM_CAP)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_registry_ids(&self, cid: i64) -> Result<Vec<String>, ApiError> {
        let endpoint = format!("/rest/pug/compound/cid/{cid}/xrefs/RegistryID/JSON");
        let payload = self.api.get(&endpoint, &[]).await?;
        Ok(payload
            .get("InformationList")
            .and_then(|list| list.get("Information"))
            .and_then(Value::as_array)
            .and_then(|info| info.first())
            .and_then(|first| first.get("RegistryID"))
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_str)
                    .take(SYNONYM_CAP)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }
}
