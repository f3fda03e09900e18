//! Activity pipeline: ChEMBL bioactivity measurements.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};

use crate::config::Config;
use crate::frame::{Frame, Scalar};
use crate::ident;
use crate::net::CounterSnapshot;
use crate::sources::chembl::{ChemblClient, DEFAULT_BASE_URL};

use super::input::column_values;
use super::{
    api_client_for, source_limits, EntityPipeline, ExtractOutput, PipelineError, Shutdown,
};

/// Conversion factors into nanomolar.
const UNIT_CONVERSION: &[(&str, f64)] = &[
    ("nM", 1.0),
    ("uM", 1e3),
    ("µM", 1e3),
    ("mM", 1e6),
    ("M", 1e9),
    ("pM", 1e-3),
];

pub struct ActivityPipeline {
    chembl: ChemblClient,
    extracted_at: String,
}

impl ActivityPipeline {
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

    #[cfg(test)]
    pub fn for_tests(chembl: ChemblClient) -> Self {
        Self {
            chembl,
            extracted_at: "2024-01-01T00:00:00Z".to_string(),
        }
    }
}

#[async_trait]
impl EntityPipeline for ActivityPipeline {
    fn entity(&self) -> &str {
        "activity"
    }

    async fn extract(
        &self,
        input: &Frame,
        shutdown: &Shutdown,
    ) -> Result<ExtractOutput, PipelineError> {
        let ids = column_values(input, "activity_id");
        let records = self
            .chembl
            .fetch_entity("activity", &ids, shutdown, &self.extracted_at)
            .await?;
        Ok(ExtractOutput {
            frame: Frame::from_records(&records),
            release: self.chembl.release(),
        })
    }

    fn transform(&self, mut frame: Frame) -> Result<Frame, PipelineError> {
        frame.rename_column("molecule_chembl_id", "compound_id");
        frame.rename_column("canonical_smiles", "smiles");
        frame.coerce_int_column("activity_id");
        frame.coerce_float_column("standard_value");
        frame.coerce_float_column("pchembl_value");
        convert_units_to_nanomolar(&mut frame);
        derive_pchembl(&mut frame);
        derive_doi_clean(&mut frame);
        Ok(frame)
    }

    fn counters(&self) -> Vec<(String, CounterSnapshot)> {
        vec![("chembl".to_string(), self.chembl.counters())]
    }
}

/// Scale `standard_value` into nanomolar where the unit is known, leaving
/// unknown units untouched. Converting an already nanomolar row is a no-op.
fn convert_units_to_nanomolar(frame: &mut Frame) {
    let Some(units_idx) = frame.column_index("standard_units") else {
        return;
    };
    let Some(value_idx) = frame.column_index("standard_value") else {
        return;
    };
    for row in 0..frame.len() {
        let unit = match &frame.rows()[row][units_idx] {
            Scalar::String(s) => s.clone(),
            _ => continue,
        };
        let Some(&(_, factor)) = UNIT_CONVERSION.iter().find(|(name, _)| *name == unit) else {
            continue;
        };
        let value = match &frame.rows()[row][value_idx] {
            Scalar::Float(f) => *f,
            Scalar::Int(i) => *i as f64,
            _ => continue,
        };
        frame.set(row, "standard_value", Scalar::Float(value * factor));
        frame.set(row, "standard_units", Scalar::String("nM".to_string()));
    }
}

/// Measurement types whose nanomolar concentration maps onto the pChEMBL
/// scale.
const PCHEMBL_TYPES: &[&str] = &["IC50", "EC50", "XC50", "AC50", "Ki", "Kd", "Potency"];

/// Fill a missing `pchembl_value` as `9 - log10(standard_value)` for exact
/// nanomolar measurements of the eligible types. Rows that already carry a
/// pChEMBL value keep it, which also makes the derivation idempotent.
fn derive_pchembl(frame: &mut Frame) {
    if frame.column_index("standard_value").is_none() {
        return;
    }
    frame.add_column("pchembl_value", Scalar::Null);
    for row in 0..frame.len() {
        if !matches!(frame.get(row, "pchembl_value"), Some(Scalar::Null)) {
            continue;
        }
        let eligible_type = matches!(
            frame.get(row, "standard_type"),
            Some(Scalar::String(t)) if PCHEMBL_TYPES.contains(&t.as_str())
        );
        let exact = matches!(
            frame.get(row, "standard_relation"),
            Some(Scalar::String(r)) if r == "="
        );
        let nanomolar = matches!(
            frame.get(row, "standard_units"),
            Some(Scalar::String(u)) if u == "nM"
        );
        if !eligible_type || !exact || !nanomolar {
            continue;
        }
        let value = match frame.get(row, "standard_value") {
            Some(Scalar::Float(v)) if *v > 0.0 => *v,
            _ => continue,
        };
        frame.set(row, "pchembl_value", Scalar::Float(9.0 - value.log10()));
    }
}

pub(crate) fn derive_doi_clean(frame: &mut Frame) {
    if frame.column_index("doi").is_none() {
        return;
    }
    frame.add_column("doi_clean", Scalar::Null);
    for row in 0..frame.len() {
        if !matches!(frame.get(row, "doi_clean"), Some(Scalar::Null)) {
            continue;
        }
        let raw = match frame.get(row, "doi") {
            Some(Scalar::String(s)) => s.clone(),
            _ => continue,
        };
        if let Some(clean) = ident::normalize_doi(&raw) {
            frame.set(row, "doi_clean", Scalar::String(clean));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_frame() -> Frame {
        let mut frame = Frame::new(vec![
            "activity_id".to_string(),
            "molecule_chembl_id".to_string(),
            "standard_value".to_string(),
            "standard_units".to_string(),
        ]);
        frame.push_row(vec![
            Scalar::Int(1),
            Scalar::String("CHEMBL25".to_string()),
            Scalar::Float(2.5),
            Scalar::String("uM".to_string()),
        ]);
        frame.push_row(vec![
            Scalar::Int(2),
            Scalar::String("CHEMBL26".to_string()),
            Scalar::Float(10.0),
            Scalar::String("nM".to_string()),
        ]);
        frame
    }

    fn pipeline() -> ActivityPipeline {
        use crate::config::HttpProfile;
        use crate::net::testing::MockTransport;
        use crate::net::ApiClient;
        use std::sync::Arc;

        let transport = Arc::new(MockTransport::new(Vec::new()));
        let api = ApiClient::new("chembl", "http://chembl", &HttpProfile::default(), transport);
        ActivityPipeline::for_tests(ChemblClient::new(Arc::new(api), 10, 2000, 1))
    }

    #[test]
    fn test_transform_converts_units_and_renames() {
        let transformed = pipeline().transform(raw_frame()).unwrap();
        assert!(transformed.column_index("compound_id").is_some());
        assert!(transformed.column_index("molecule_chembl_id").is_none());
        assert_eq!(
            transformed.get(0, "standard_value"),
            Some(&Scalar::Float(2500.0))
        );
        assert_eq!(
            transformed.get(0, "standard_units"),
            Some(&Scalar::String("nM".to_string()))
        );
        assert_eq!(
            transformed.get(1, "standard_value"),
            Some(&Scalar::Float(10.0))
        );
    }

    #[test]
    fn test_transform_is_idempotent() {
        let pipeline = pipeline();
        let once = pipeline.transform(raw_frame()).unwrap();
        let twice = pipeline.transform(once.clone()).unwrap();
        assert!(once.value_eq(&twice));
    }

    #[test]
    fn test_pchembl_derived_for_exact_nanomolar_ic50() {
        let mut frame = Frame::new(vec![
            "standard_type".to_string(),
            "standard_relation".to_string(),
            "standard_value".to_string(),
            "standard_units".to_string(),
        ]);
        frame.push_row(vec![
            Scalar::String("IC50".to_string()),
            Scalar::String("=".to_string()),
            Scalar::Float(10.0),
            Scalar::String("nM".to_string()),
        ]);
        frame.push_row(vec![
            Scalar::String("IC50".to_string()),
            Scalar::String(">".to_string()),
            Scalar::Float(10.0),
            Scalar::String("nM".to_string()),
        ]);
        derive_pchembl(&mut frame);
        match frame.get(0, "pchembl_value") {
            Some(Scalar::Float(p)) => assert!((p - 8.0).abs() < 1e-9),
            other => panic!("expected derived pChEMBL, got {other:?}"),
        }
        // A censored relation is not a point estimate.
        assert_eq!(frame.get(1, "pchembl_value"), Some(&Scalar::Null));
    }

    #[test]
    fn test_unknown_units_left_alone() {
        let mut frame = Frame::new(vec![
            "standard_value".to_string(),
            "standard_units".to_string(),
        ]);
        frame.push_row(vec![
            Scalar::Float(3.0),
            Scalar::String("percent".to_string()),
        ]);
        convert_units_to_nanomolar(&mut frame);
        assert_eq!(frame.get(0, "standard_value"), Some(&Scalar::Float(3.0)));
        assert_eq!(
            frame.get(0, "standard_units"),
            Some(&Scalar::String("percent".to_string()))
        );
    }
}
