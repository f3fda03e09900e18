//! Test-compound pipeline: ChEMBL molecules enriched with PubChem.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;

use crate::config::Config;
use crate::frame::{Frame, Record, Scalar};
use crate::merge;
use crate::net::CounterSnapshot;
use crate::sources::chembl::{ChemblClient, DEFAULT_BASE_URL};
use crate::sources::pubchem::PubChemClient;

use super::input::column_values;
use super::{
    api_client_for, source_limits, EntityPipeline, ExtractOutput, PipelineError, Shutdown,
};

const PUBCHEM_BASE_URL: &str = "https://pubchem.ncbi.nlm.nih.gov";

pub struct TestitemPipeline {
    chembl: ChemblClient,
    pubchem: Option<PubChemClient>,
    extracted_at: String,
}

impl TestitemPipeline {
    pub fn from_config(config: &Config) -> Result<Self, PipelineError> {
        let api = api_client_for(config, "chembl", DEFAULT_BASE_URL)?;
        let (batch_size, max_url_length) = source_limits(config, "chembl");
        let chembl = ChemblClient::new(
            std::sync::Arc::new(api),
            batch_size,
            max_url_length,
            config.runtime.workers,
        );

        let pubchem_enabled = config.sources.get("pubchem").map_or(true, |s| s.enabled);
        let pubchem = if pubchem_enabled {
            let api = api_client_for(config, "pubchem", PUBCHEM_BASE_URL)?;
            Some(PubChemClient::new(
                std::sync::Arc::new(api),
                config.runtime.workers,
            ))
        } else {
            None
        };

        Ok(Self {
            chembl,
            pubchem,
            extracted_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        })
    }
}

/// Lift structure and property fields out of the nested molecule payload.
fn flatten_molecule(record: &mut Record) {
    if let Some(Scalar::Encoded(text)) = record.get("molecule_structures").cloned() {
        if let Ok(parsed) = serde_json::from_str::<Value>(&text) {
            if let Some(smiles) = parsed.get("canonical_smiles").and_then(Value::as_str) {
                record.set("canonical_smiles", Scalar::String(smiles.to_string()));
            }
            if let Some(inchikey) = parsed.get("standard_inchi_key").and_then(Value::as_str) {
                record.set("standard_inchi_key", Scalar::String(inchikey.to_string()));
            }
        }
    }
    if let Some(Scalar::Encoded(text)) = record.get("molecule_properties").cloned() {
        if let Ok(parsed) = serde_json::from_str::<Value>(&text) {
            if let Some(formula) = parsed.get("full_molformula").and_then(Value::as_str) {
                record.set("molecular_formula", Scalar::String(formula.to_string()));
            }
            let mwt = match parsed.get("full_mwt") {
                Some(Value::String(s)) => s.parse::<f64>().ok(),
                Some(Value::Number(n)) => n.as_f64(),
                _ => None,
            };
            if let Some(mwt) = mwt {
                record.set("full_mwt", Scalar::Float(mwt));
            }
        }
    }
}

#[async_trait]
impl EntityPipeline for TestitemPipeline {
    fn entity(&self) -> &str {
        "testitem"
    }

    async fn extract(
        &self,
        input: &Frame,
        shutdown: &Shutdown,
    ) -> Result<ExtractOutput, PipelineError> {
        let ids = column_values(input, "molecule_chembl_id");
        let mut records = self
            .chembl
            .fetch_entity("testitem", &ids, shutdown, &self.extracted_at)
            .await?;
        for record in &mut records {
            flatten_molecule(record);
        }
        let mut frame = Frame::from_records(&records);
        frame.add_column("standard_inchi_key", Scalar::Null);

        if let Some(pubchem) = &self.pubchem {
            let inchikeys = column_values(&frame, "standard_inchi_key");
            if !inchikeys.is_empty() {
                let enrichment = pubchem
                    .fetch_by_inchikeys(&inchikeys, shutdown, &self.extracted_at)
                    .await?;
                let enrichment = Frame::from_records(&enrichment);
                frame = merge::left_join(
                    &frame,
                    "standard_inchi_key",
                    &enrichment,
                    "pubchem_lookup_inchikey",
                );
            }
        }

        Ok(ExtractOutput {
            release: self.chembl.release(),
            frame,
        })
    }

    fn transform(&self, mut frame: Frame) -> Result<Frame, PipelineError> {
        frame.coerce_float_column("full_mwt");
        frame.coerce_int_column("pubchem_cid");
        Ok(frame)
    }

    fn counters(&self) -> Vec<(String, CounterSnapshot)> {
        let mut counters = vec![("chembl".to_string(), self.chembl.counters())];
        if let Some(pubchem) = &self.pubchem {
            counters.push(("pubchem".to_string(), pubchem.counters()));
        }
        counters
    }
}
