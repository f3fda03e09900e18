//! Assay pipeline: ChEMBL assay descriptions.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};

use crate::config::Config;
use crate::frame::Frame;
use crate::net::CounterSnapshot;
use crate::sources::chembl::{ChemblClient, DEFAULT_BASE_URL};

use super::input::column_values;
use super::{
    api_client_for, source_limits, EntityPipeline, ExtractOutput, PipelineError, Shutdown,
};

pub struct AssayPipeline {
    chembl: ChemblClient,
    extracted_at: String,
}

impl AssayPipeline {
    pub fn from_config(config: &Config) -> Result<Self, PipelineError> {
        let api = api_client_for(config, "chembl", DEFAULT_BASE_URL)?;
        let (batch_size, max_url_length) = source_limits(config, "chembl");
        let chembl = ChemblClient::new(
            std::sync::Arc::new(api),
            batch_size,
            max_url_length,
            config.runtime.workers,
        );
        Ok(Self {
            chembl,
            extracted_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        })
    }
}

#[async_trait]
impl EntityPipeline for AssayPipeline {
    fn entity(&self) -> &str {
        "assay"
    }

    async fn extract(
        &self,
        input: &Frame,
        shutdown: &Shutdown,
    ) -> Result<ExtractOutput, PipelineError> {
        let ids = column_values(input, "assay_chembl_id");
        let records = self
            .chembl
            .fetch_entity("assay", &ids, shutdown, &self.extracted_at)
            .await?;
        Ok(ExtractOutput {
            frame: Frame::from_records(&records),
            release: self.chembl.release(),
        })
    }

    fn transform(&self, mut frame: Frame) -> Result<Frame, PipelineError> {
        frame.coerce_int_column("assay_tax_id");
        frame.coerce_int_column("confidence_score");
        Ok(frame)
    }

    fn counters(&self) -> Vec<(String, CounterSnapshot)> {
        vec![("chembl".to_string(), self.chembl.counters())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Scalar;

    #[test]
    fn test_transform_coerces_numeric_strings() {
        use crate::config::HttpProfile;
        use crate::net::testing::MockTransport;
        use crate::net::ApiClient;
        use std::sync::Arc;

        let transport = Arc::new(MockTransport::new(Vec::new()));
        let api = ApiClient::new("chembl", "http://chembl", &HttpProfile::default(), transport);
        let pipeline = AssayPipeline {
            chembl: ChemblClient::new(Arc::new(api), 10, 2000, 1),
            extracted_at: "2024-01-01T00:00:00Z".to_string(),
        };

        let mut frame = Frame::new(vec![
            "assay_chembl_id".to_string(),
            "confidence_score".to_string(),
        ]);
        frame.push_row(vec![
            Scalar::String("CHEMBL615156".to_string()),
            Scalar::String("9".to_string()),
        ]);
        let transformed = pipeline.transform(frame).unwrap();
        assert_eq!(transformed.get(0, "confidence_score"), Some(&Scalar::Int(9)));

        let twice = pipeline.transform(transformed.clone()).unwrap();
        assert!(transformed.value_eq(&twice));
    }
}
