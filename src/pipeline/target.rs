//! Target pipeline: ChEMBL baseline enriched with UniProt and IUPHAR.
//!
//! Enrichment order matters: UniProt resolves protein annotations for the
//! accessions found in the ChEMBL target components, and the IUPHAR lookup
//! consumes those same accessions. Both join back on `uniprot_id`.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;

use crate::config::Config;
use crate::frame::{Frame, Scalar};
use crate::merge::{self, MergeCandidate, MergeRule, MergeStrategy};
use crate::net::CounterSnapshot;
use crate::sources::chembl::{ChemblClient, DEFAULT_BASE_URL};
use crate::sources::iuphar::{IupharClient, IupharDictionary};
use crate::sources::uniprot::UniProtClient;

use super::input::column_values;
use super::{
    api_client_for, source_limits, source_secret, EntityPipeline, ExtractOutput, PipelineError,
    Shutdown,
};

const UNIPROT_BASE_URL: &str = "https://rest.uniprot.org";
const IUPHAR_BASE_URL: &str = "https://www.guidetopharmacology.org/services";

pub struct TargetPipeline {
    chembl: ChemblClient,
    uniprot: Option<UniProtClient>,
    iuphar: Option<IupharClient>,
    extracted_at: String,
}

impl TargetPipeline {
    pub fn from_config(config: &Config) -> Result<Self, PipelineError> {
        let api = api_client_for(config, "chembl", DEFAULT_BASE_URL)?;
        let (batch_size, max_url_length) = source_limits(config, "chembl");
        let chembl = ChemblClient::new(
            std::sync::Arc::new(api),
            batch_size,
            max_url_length,
            config.runtime.workers,
        );

        let uniprot_enabled = config
            .sources
            .get("uniprot")
            .map_or(true, |s| s.enabled);
        let uniprot = if uniprot_enabled {
            let api = api_client_for(config, "uniprot", UNIPROT_BASE_URL)?;
            Some(UniProtClient::new(
                std::sync::Arc::new(api),
                config.runtime.workers,
                std::time::Duration::from_secs_f64(config.runtime.poll_interval_seconds),
                config.runtime.poll_max_iterations,
            ))
        } else {
            None
        };

        let iuphar_enabled = config.sources.get("iuphar").map_or(true, |s| s.enabled);
        let iuphar = if iuphar_enabled {
            match config.sources.get("iuphar").and_then(|s| s.dictionary.clone()) {
                Some(path) => {
                    let family = path
                        .parent()
                        .map(|dir| dir.join("_IUPHAR_family.csv"))
                        .filter(|p| p.exists());
                    let dictionary = IupharDictionary::load(&path, family.as_deref())?;
                    Some(IupharClient::from_dictionary(dictionary))
                }
                None => {
                    let api = api_client_for(config, "iuphar", IUPHAR_BASE_URL)?;
                    let key = source_secret(
                        config,
                        "iuphar",
                        |s| s.api_key_env.clone(),
                        "IUPHAR_API_KEY",
                    );
                    Some(IupharClient::from_rest(api, config.runtime.workers, key))
                }
            }
        } else {
            None
        };

        Ok(Self {
            chembl,
            uniprot,
            iuphar,
            extracted_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        })
    }
}

/// Pull the first component accession out of the serialized
/// `target_components` payload.
fn component_accession(record: &crate::frame::Record) -> Option<String> {
    let encoded = match record.get("target_components") {
        Some(Scalar::Encoded(text)) => text.clone(),
        _ => return None,
    };
    let parsed: Value = serde_json::from_str(&encoded).ok()?;
    parsed
        .as_array()?
        .iter()
        .filter_map(|component| component.get("accession").and_then(Value::as_str))
        .next()
        .map(str::to_string)
}

#[async_trait]
impl EntityPipeline for TargetPipeline {
    fn entity(&self) -> &str {
        "target"
    }

    async fn extract(
        &self,
        input: &Frame,
        shutdown: &Shutdown,
    ) -> Result<ExtractOutput, PipelineError> {
        let ids = column_values(input, "target_chembl_id");
        let mut records = self
            .chembl
            .fetch_entity("target", &ids, shutdown, &self.extracted_at)
            .await?;

        // Surface the primary component accession as the join key.
        for record in &mut records {
            if let Some(accession) = component_accession(record) {
                record.set("uniprot_id", Scalar::String(accession));
            }
        }
        let mut frame = Frame::from_records(&records);
        frame.add_column("uniprot_id", Scalar::Null);

        let accessions = column_values(&frame, "uniprot_id");
        if let Some(uniprot) = &self.uniprot {
            if !accessions.is_empty() {
                let enrichment = uniprot
                    .fetch_by_accessions(&accessions, shutdown, &self.extracted_at)
                    .await?;
                let enrichment = Frame::from_records(&enrichment);
                frame = merge::left_join(&frame, "uniprot_id", &enrichment, "uniprot_id");
            }
        }
        if let Some(iuphar) = &self.iuphar {
            if !accessions.is_empty() {
                let enrichment = iuphar
                    .fetch_by_uniprot(&accessions, shutdown, &self.extracted_at)
                    .await?;
                let enrichment = Frame::from_records(&enrichment);
                frame = merge::left_join(&frame, "uniprot_id", &enrichment, "uniprot_id");
            }
        }

        Ok(ExtractOutput {
            release: self.chembl.release(),
            frame,
        })
    }

    fn transform(&self, mut frame: Frame) -> Result<Frame, PipelineError> {
        frame.coerce_int_column("tax_id");
        frame.coerce_int_column("iuphar_target_id");
        frame.coerce_int_column("iuphar_family_id");
        let rules = vec![MergeRule {
            target_field: "gene_symbol".to_string(),
            strategy: MergeStrategy::PreferSource,
            candidates: vec![MergeCandidate::new("uniprot", "uniprot_gene")],
        }];
        merge::apply_rules(&mut frame, &rules);
        Ok(frame)
    }

    fn counters(&self) -> Vec<(String, CounterSnapshot)> {
        let mut counters = vec![("chembl".to_string(), self.chembl.counters())];
        if let Some(uniprot) = &self.uniprot {
            counters.push(("uniprot".to_string(), uniprot.counters()));
        }
        if let Some(iuphar) = &self.iuphar {
            counters.push(("iuphar".to_string(), iuphar.counters()));
        }
        counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Record;

    #[test]
    fn test_component_accession_from_encoded_payload() {
        let mut record = Record::new();
        record.set(
            "target_components",
            Scalar::Encoded(
                r#"[{"accession":"P23219","component_type":"PROTEIN"},{"accession":"P35354"}]"#
                    .to_string(),
            ),
        );
        assert_eq!(component_accession(&record), Some("P23219".to_string()));

        let mut empty = Record::new();
        empty.set("target_components", Scalar::Encoded("[]".to_string()));
        assert_eq!(component_accession(&empty), None);
    }
}
