//! Document pipeline: ChEMBL baseline enriched with PubMed, Crossref,
//! OpenAlex and Semantic Scholar, fused under declared merge rules.
//!
//! The enrichment order is fixed: the ChEMBL baseline supplies the DOI and
//! PMID join keys every later source depends on. Baseline columns carry the
//! `chembl_` prefix so the merge rules can name their candidates explicitly.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};

use crate::config::Config;
use crate::frame::{Frame, Scalar};
use crate::merge::{self, MergeCandidate, MergeRule, MergeStrategy};
use crate::net::CounterSnapshot;
use crate::sources::chembl::{ChemblClient, DEFAULT_BASE_URL};
use crate::sources::crossref::CrossrefClient;
use crate::sources::openalex::OpenAlexClient;
use crate::sources::pubmed::PubMedClient;
use crate::sources::semantic_scholar::SemanticScholarClient;

use super::input::column_values;
use super::{
    api_client_for, source_limits, source_secret, EntityPipeline, ExtractOutput, PipelineError,
    Shutdown,
};

const PUBMED_BASE_URL: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";
const CROSSREF_BASE_URL: &str = "https://api.crossref.org";
const OPENALEX_BASE_URL: &str = "https://api.openalex.org";
const SEMANTIC_SCHOLAR_BASE_URL: &str = "https://api.semanticscholar.org";

/// Baseline fields that stay unprefixed: the shared contract keys, the
/// entity's business key and the fallback marker columns.
const BASELINE_SHARED: &[&str] = &[
    "doi_clean",
    "pmid",
    "document_chembl_id",
    "fallback_reason",
    "fallback_error_type",
    "fallback_http_status",
    "fallback_retry_after_sec",
    "fallback_attempt",
    "fallback_timestamp",
];

pub struct DocumentPipeline {
    chembl: ChemblClient,
    pubmed: Option<PubMedClient>,
    crossref: Option<CrossrefClient>,
    openalex: Option<OpenAlexClient>,
    semantic_scholar: Option<SemanticScholarClient>,
    extracted_at: String,
}

impl DocumentPipeline {
    pub fn from_config(config: &Config) -> Result<Self, PipelineError> {
        let api = api_client_for(config, "chembl", DEFAULT_BASE_URL)?;
        let (batch_size, max_url_length) = source_limits(config, "chembl");
        let chembl = ChemblClient::new(
            std::sync::Arc::new(api),
            batch_size,
            max_url_length,
            config.runtime.workers,
        );

        let enabled = |name: &str| config.sources.get(name).map_or(true, |s| s.enabled);

        let pubmed = if enabled("pubmed") {
            let api = api_client_for(config, "pubmed", PUBMED_BASE_URL)?;
            let (pubmed_batch, _) = source_limits(config, "pubmed");
            Some(PubMedClient::new(
                std::sync::Arc::new(api),
                pubmed_batch,
                std::time::Duration::from_secs(config.runtime.webenv_timeout_seconds),
                source_secret(config, "pubmed", |s| s.contact_env.clone(), "PUBMED_EMAIL"),
                source_secret(config, "pubmed", |s| s.api_key_env.clone(), "PUBMED_API_KEY"),
            ))
        } else {
            None
        };

        let crossref = if enabled("crossref") {
            let api = api_client_for(config, "crossref", CROSSREF_BASE_URL)?;
            Some(CrossrefClient::new(
                std::sync::Arc::new(api),
                config.runtime.workers,
                source_secret(config, "crossref", |s| s.contact_env.clone(), "CROSSREF_MAILTO"),
            ))
        } else {
            None
        };

        let openalex = if enabled("openalex") {
            let api = api_client_for(config, "openalex", OPENALEX_BASE_URL)?;
            Some(OpenAlexClient::new(
                std::sync::Arc::new(api),
                config.runtime.workers,
                200,
            ))
        } else {
            None
        };

        let semantic_scholar = if enabled("semantic_scholar") {
            let api = api_client_for(config, "semantic_scholar", SEMANTIC_SCHOLAR_BASE_URL)?;
            let key = source_secret(
                config,
                "semantic_scholar",
                |s| s.api_key_env.clone(),
                "SEMANTIC_SCHOLAR_API_KEY",
            );
            Some(SemanticScholarClient::new(api, config.runtime.workers, key))
        } else {
            None
        };

        Ok(Self {
            chembl,
            pubmed,
            crossref,
            openalex,
            semantic_scholar,
            extracted_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        })
    }

    /// Merge rules fusing the enrichment columns into the declared fields.
    fn merge_rules() -> Vec<MergeRule> {
        vec![
            MergeRule {
                target_field: "title".to_string(),
                strategy: MergeStrategy::PreferSource,
                candidates: vec![
                    MergeCandidate::new("pubmed", "pubmed_article_title"),
                    MergeCandidate::new("crossref", "crossref_title"),
                    MergeCandidate::new("openalex", "openalex_title"),
                    MergeCandidate::new("chembl", "chembl_title"),
                ],
            },
            MergeRule {
                target_field: "abstract".to_string(),
                strategy: MergeStrategy::PreferSource,
                candidates: vec![
                    MergeCandidate::new("pubmed", "pubmed_abstract"),
                    MergeCandidate::new("semantic_scholar", "semantic_scholar_abstract"),
                    MergeCandidate::new("chembl", "chembl_abstract"),
                ],
            },
            MergeRule {
                target_field: "journal".to_string(),
                strategy: MergeStrategy::PreferSource,
                candidates: vec![
                    MergeCandidate::new("pubmed", "pubmed_journal"),
                    MergeCandidate::new("crossref", "crossref_journal"),
                    MergeCandidate::new("chembl", "chembl_journal"),
                ],
            },
            MergeRule {
                target_field: "year".to_string(),
                strategy: MergeStrategy::PreferSource,
                candidates: vec![
                    MergeCandidate::new("pubmed", "pubmed_year"),
                    MergeCandidate::new("crossref", "crossref_year"),
                    MergeCandidate::new("openalex", "openalex_year"),
                    MergeCandidate::new("chembl", "chembl_year"),
                ],
            },
            MergeRule {
                target_field: "authors".to_string(),
                strategy: MergeStrategy::PreferSource,
                candidates: vec![
                    MergeCandidate::new("pubmed", "pubmed_authors"),
                    MergeCandidate::new("crossref", "crossref_authors"),
                    MergeCandidate::new("chembl", "chembl_authors"),
                ],
            },
        ]
    }
}

#[async_trait]
impl EntityPipeline for DocumentPipeline {
    fn entity(&self) -> &str {
        "document"
    }

    async fn extract(
        &self,
        input: &Frame,
        shutdown: &Shutdown,
    ) -> Result<ExtractOutput, PipelineError> {
        let ids = column_values(input, "document_chembl_id");
        let baseline = self
            .chembl
            .fetch_entity("document", &ids, shutdown, &self.extracted_at)
            .await?;
        let baseline: Vec<_> = baseline
            .iter()
            .map(|record| record.with_prefix("chembl", BASELINE_SHARED))
            .collect();
        let mut frame = Frame::from_records(&baseline);
        frame.add_column("doi_clean", Scalar::Null);
        frame.add_column("pmid", Scalar::Null);

        let pmids = column_values(&frame, "pmid");
        let dois = column_values(&frame, "doi_clean");

        if let Some(pubmed) = &self.pubmed {
            if !pmids.is_empty() {
                let records = pubmed
                    .fetch_by_pmids(&pmids, shutdown, &self.extracted_at)
                    .await?;
                frame = merge::left_join(&frame, "pmid", &Frame::from_records(&records), "pmid");
            }
        }
        if let Some(crossref) = &self.crossref {
            if !dois.is_empty() {
                let records = crossref
                    .fetch_by_dois(&dois, shutdown, &self.extracted_at)
                    .await?;
                frame = merge::left_join(
                    &frame,
                    "doi_clean",
                    &Frame::from_records(&records),
                    "doi_clean",
                );
            }
        }
        if let Some(openalex) = &self.openalex {
            if !dois.is_empty() {
                let records = openalex
                    .fetch_by_dois(&dois, shutdown, &self.extracted_at)
                    .await?;
                frame = merge::left_join(
                    &frame,
                    "doi_clean",
                    &Frame::from_records(&records),
                    "doi_clean",
                );
            }
        }
        if let Some(semantic_scholar) = &self.semantic_scholar {
            if !dois.is_empty() {
                let records = semantic_scholar
                    .fetch_by_dois(&dois, shutdown, &self.extracted_at)
                    .await?;
                frame = merge::left_join(
                    &frame,
                    "doi_clean",
                    &Frame::from_records(&records),
                    "doi_clean",
                );
            }
        }

        Ok(ExtractOutput {
            release: self.chembl.release(),
            frame,
        })
    }

    fn transform(&self, mut frame: Frame) -> Result<Frame, PipelineError> {
        frame.coerce_int_column("pmid");
        frame.coerce_int_column("chembl_year");
        merge::apply_rules(&mut frame, &Self::merge_rules());
        frame.coerce_int_column("year");
        Ok(frame)
    }

    fn counters(&self) -> Vec<(String, CounterSnapshot)> {
        let mut counters = vec![("chembl".to_string(), self.chembl.counters())];
        if let Some(pubmed) = &self.pubmed {
            counters.push(("pubmed".to_string(), pubmed.counters()));
        }
        if let Some(crossref) = &self.crossref {
            counters.push(("crossref".to_string(), crossref.counters()));
        }
        if let Some(openalex) = &self.openalex {
            counters.push(("openalex".to_string(), openalex.counters()));
        }
        if let Some(semantic_scholar) = &self.semantic_scholar {
            counters.push(("semantic_scholar".to_string(), semantic_scholar.counters()));
        }
        counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_pipeline() -> DocumentPipeline {
        use crate::config::HttpProfile;
        use crate::net::testing::MockTransport;
        use crate::net::ApiClient;
        use std::sync::Arc;

        let transport = Arc::new(MockTransport::new(Vec::new()));
        let api = ApiClient::new("chembl", "http://chembl", &HttpProfile::default(), transport);
        DocumentPipeline {
            chembl: ChemblClient::new(Arc::new(api), 10, 2000, 1),
            pubmed: None,
            crossref: None,
            openalex: None,
            semantic_scholar: None,
            extracted_at: "2024-01-01T00:00:00Z".to_string(),
        }
    }

    fn joined_frame() -> Frame {
        let mut frame = Frame::new(vec![
            "document_chembl_id".to_string(),
            "doi_clean".to_string(),
            "pmid".to_string(),
            "chembl_title".to_string(),
            "pubmed_article_title".to_string(),
        ]);
        frame.push_row(vec![
            Scalar::String("CHEMBL1158643".to_string()),
            Scalar::String("10.1/x".to_string()),
            Scalar::Int(9),
            Scalar::String("A".to_string()),
            Scalar::String("B".to_string()),
        ]);
        frame
    }

    #[test]
    fn test_merge_prefers_pubmed_title() {
        let pipeline = bare_pipeline();
        let transformed = pipeline.transform(joined_frame()).unwrap();
        assert_eq!(
            transformed.get(0, "title"),
            Some(&Scalar::String("B".to_string()))
        );
        assert_eq!(
            transformed.get(0, "title_source"),
            Some(&Scalar::String("pubmed".to_string()))
        );
        assert_eq!(
            transformed.get(0, "conflict_pubmed_title"),
            Some(&Scalar::Bool(true))
        );
    }

    #[test]
    fn test_transform_is_idempotent() {
        let pipeline = bare_pipeline();
        let once = pipeline.transform(joined_frame()).unwrap();
        let twice = pipeline.transform(once.clone()).unwrap();
        assert!(once.value_eq(&twice));
    }
}
