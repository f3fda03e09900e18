//! Deterministic writer.
//!
//! `finalize` shapes a frame into its byte-stable form (column order, NA
//! policy, sort, hash columns); `write_artifacts` serializes it plus the
//! sidecar metadata, checksum and QC files. Every file goes through the same
//! atomic sequence: write `<path>.tmp`, fsync, rename.

pub mod qc;
pub mod report;

use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::{Datelike, SecondsFormat, Utc};
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::config::DeterminismSection;
use crate::frame::{apply_na_policy, Frame, Scalar};
use crate::hashing;
use crate::ident;
use crate::pipeline::context::RunContext;
use crate::schema::SchemaRegistration;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("write error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("csv serialization error: {0}")]
    Csv(#[from] csv::Error),
    #[error("metadata error: {0}")]
    Meta(String),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> WriteError + '_ {
    move |source| WriteError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Planned locations of one run's artifacts, all under a single directory.
#[derive(Debug, Clone)]
pub struct ArtifactPlan {
    pub dataset: PathBuf,
    pub meta: PathBuf,
    pub checksum: PathBuf,
    pub qc: PathBuf,
    pub correlation: Option<PathBuf>,
    pub summary: Option<PathBuf>,
}

impl ArtifactPlan {
    /// Layout: `<root>/<entity>/<entity>_<date_tag>.<ext>` plus sidecars.
    pub fn new(
        output_root: &Path,
        entity: &str,
        date_tag: &str,
        correlation: bool,
        summary: bool,
    ) -> Self {
        let dir = output_root.join(entity);
        let stem = format!("{entity}_{date_tag}");
        Self {
            dataset: dir.join(format!("{stem}.csv")),
            meta: dir.join(format!("{stem}_meta.yaml")),
            checksum: dir.join(format!("{stem}_meta.sha256")),
            qc: dir.join(format!("{stem}_qc.csv")),
            correlation: correlation.then(|| dir.join(format!("{stem}_correlation.csv"))),
            summary: summary.then(|| dir.join(format!("{stem}_summary.csv"))),
        }
    }

    /// Remove any stale `.tmp` leftovers from an interrupted earlier run.
    pub fn clean_stale_tmp(&self) {
        for path in [
            &self.dataset,
            &self.meta,
            &self.checksum,
            &self.qc,
        ]
        .into_iter()
        .chain(self.correlation.iter())
        .chain(self.summary.iter())
        {
            let _ = fs::remove_file(tmp_path(path));
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Write bytes through the `.tmp` + fsync + rename sequence. A failed write
/// removes the partial `.tmp` so no torn state survives.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), WriteError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    let tmp = tmp_path(path);
    let result = (|| {
        let mut file = fs::File::create(&tmp).map_err(io_err(&tmp))?;
        file.write_all(bytes).map_err(io_err(&tmp))?;
        file.sync_all().map_err(io_err(&tmp))?;
        fs::rename(&tmp, path).map_err(io_err(path))?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Steps 1-4 of the write algorithm: column order, NA policy, deterministic
/// sort, hash columns. Declared columns missing from the frame are created as
/// nulls; unknown columns stay after the declared prefix.
pub fn finalize(
    frame: &mut Frame,
    registration: &SchemaRegistration,
    settings: &DeterminismSection,
    ctx: &RunContext,
) {
    ctx.stamp(frame);
    for column in &registration.descriptor.column_order {
        frame.add_column(column.clone(), Scalar::Null);
    }
    apply_na_policy(frame, &registration.case_preserving);
    frame.reorder(&registration.descriptor.column_order);

    let (sort_by, ascending) = if settings.sort_by.is_empty() {
        (registration.sort_by.clone(), registration.ascending.clone())
    } else {
        (settings.sort_by.clone(), settings.ascending.clone())
    };
    frame.sort_by(&sort_by, &ascending);

    let key_fields = registration.descriptor.business_key_fields.clone();
    let hash_fields = registration.descriptor.row_hash_fields.clone();
    for row in 0..frame.len() {
        let key_values: Vec<Scalar> = key_fields
            .iter()
            .map(|f| frame.get(row, f).cloned().unwrap_or(Scalar::Null))
            .collect();
        let row_values: Vec<(String, Scalar)> = hash_fields
            .iter()
            .map(|f| {
                (
                    f.clone(),
                    frame.get(row, f).cloned().unwrap_or(Scalar::Null),
                )
            })
            .collect();
        frame.set(
            row,
            "hash_business_key",
            Scalar::String(hashing::hash_business_key(&key_values)),
        );
        frame.set(row, "hash_row", Scalar::String(hashing::hash_row(&row_values)));
    }
}

/// Serialize a frame as RFC-4180 CSV with the configured NA representation,
/// float precision and line terminator.
pub fn frame_to_csv(frame: &Frame, settings: &DeterminismSection) -> Result<Vec<u8>, WriteError> {
    let terminator = match settings.line_terminator.as_str() {
        "\r\n" => csv::Terminator::CRLF,
        _ => csv::Terminator::Any(b'\n'),
    };
    let mut writer = csv::WriterBuilder::new()
        .terminator(terminator)
        .from_writer(Vec::new());
    writer.write_record(frame.columns())?;
    for row in frame.rows() {
        let rendered: Vec<String> = row
            .iter()
            .map(|v| v.render(settings.float_precision, &settings.na_representation))
            .collect();
        writer.write_record(&rendered)?;
    }
    writer
        .into_inner()
        .map_err(|e| WriteError::Meta(format!("csv buffer flush failed: {e}")))
}

#[derive(Debug, Serialize)]
struct RunMeta {
    pipeline: String,
    pipeline_version: String,
    run_id: String,
    chembl_release: String,
    chembl_release_source: String,
    row_count: usize,
    started_at: String,
    finished_at: String,
    current_year: i32,
    checksums: BTreeMap<String, String>,
}

fn validated_release(ctx: &RunContext) -> Result<String, WriteError> {
    let release = ctx
        .release_tag
        .clone()
        .ok_or_else(|| WriteError::Meta("chembl_release was never resolved".to_string()))?;
    let trimmed = release.trim().to_string();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("unknown") {
        return Err(WriteError::Meta(
            "chembl_release must not be empty or 'unknown'".to_string(),
        ));
    }
    let pattern = Regex::new(ident::CHEMBL_RELEASE_PATTERN).expect("static pattern compiles");
    if !pattern.is_match(&trimmed) {
        return Err(WriteError::Meta(format!(
            "chembl_release {trimmed:?} does not match {}",
            ident::CHEMBL_RELEASE_PATTERN
        )));
    }
    Ok(trimmed)
}

/// Artifacts produced by one write call.
#[derive(Debug, Clone)]
pub struct WriteReport {
    pub row_count: usize,
    pub dataset_checksum: String,
    pub plan: ArtifactPlan,
}

/// Steps 5-9: dataset, meta.yaml + meta.sha256, QC and the optional report
/// CSVs, each written atomically.
pub fn write_artifacts(
    frame: &Frame,
    settings: &DeterminismSection,
    ctx: &RunContext,
    plan: &ArtifactPlan,
    qc_frame: &Frame,
) -> Result<WriteReport, WriteError> {
    let release = validated_release(ctx)?;

    let csv_bytes = frame_to_csv(frame, settings)?;
    write_atomic(&plan.dataset, &csv_bytes)?;
    let dataset_checksum =
        hashing::blake2b256_file(&plan.dataset).map_err(io_err(&plan.dataset))?;

    let mut checksums = BTreeMap::new();
    let dataset_name = plan
        .dataset
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "dataset.csv".to_string());
    checksums.insert(dataset_name, dataset_checksum.clone());

    let started_at = ctx.started_at_iso();
    let mut finished_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    if finished_at < started_at {
        finished_at = started_at.clone();
    }

    let meta = RunMeta {
        pipeline: ctx.source_system.clone(),
        pipeline_version: ctx.pipeline_version.clone(),
        run_id: ctx.run_id.clone(),
        chembl_release: release,
        chembl_release_source: ctx.release_source.as_str().to_string(),
        row_count: frame.len(),
        started_at,
        finished_at,
        current_year: Utc::now().year(),
        checksums,
    };
    let meta_yaml = serde_yaml::to_string(&meta)
        .map_err(|e| WriteError::Meta(format!("meta serialization failed: {e}")))?;
    write_atomic(&plan.meta, meta_yaml.as_bytes())?;

    let meta_checksum = hashing::sha256_file(&plan.meta).map_err(io_err(&plan.meta))?;
    write_atomic(&plan.checksum, format!("{meta_checksum}\n").as_bytes())?;

    let qc_bytes = frame_to_csv(qc_frame, settings)?;
    write_atomic(&plan.qc, &qc_bytes)?;

    if let Some(path) = &plan.correlation {
        let correlation = report::correlation_frame(frame);
        write_atomic(path, &frame_to_csv(&correlation, settings)?)?;
    }
    if let Some(path) = &plan.summary {
        let summary = report::summary_frame(frame);
        write_atomic(path, &frame_to_csv(&summary, settings)?)?;
    }

    info!(
        dataset = %plan.dataset.display(),
        rows = frame.len(),
        checksum = %dataset_checksum,
        "artifacts_written"
    );
    Ok(WriteReport {
        row_count: frame.len(),
        dataset_checksum,
        plan: plan.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::context::ReleaseSource;
    use crate::schema::entities;

    fn settings() -> DeterminismSection {
        DeterminismSection::default()
    }

    fn ctx() -> RunContext {
        RunContext::new("1.0.0", "chembl").with_release("35", ReleaseSource::Status)
    }

    fn sample_frame() -> Frame {
        let mut frame = Frame::new(vec!["activity_id".to_string(), "standard_value".to_string()]);
        frame.push_row(vec![Scalar::Int(2), Scalar::Float(20.0)]);
        frame.push_row(vec![Scalar::Int(1), Scalar::Float(10.0)]);
        frame
    }

    #[test]
    fn test_finalize_orders_sorts_and_hashes() {
        let registration = entities::activity();
        let mut frame = sample_frame();
        finalize(&mut frame, &registration, &settings(), &ctx());

        assert_eq!(frame.columns()[0], "activity_id");
        assert_eq!(frame.get(0, "activity_id"), Some(&Scalar::Int(1)));
        let hash = match frame.get(0, "hash_business_key") {
            Some(Scalar::String(s)) => s.clone(),
            other => panic!("missing hash: {other:?}"),
        };
        assert_eq!(hash, hashing::hash_business_key(&[Scalar::Int(1)]));
    }

    #[test]
    fn test_row_hash_survives_row_reordering() {
        let registration = entities::activity();
        let context = ctx();

        let mut forward = sample_frame();
        finalize(&mut forward, &registration, &settings(), &context);

        let mut reversed = Frame::new(vec![
            "activity_id".to_string(),
            "standard_value".to_string(),
        ]);
        reversed.push_row(vec![Scalar::Int(1), Scalar::Float(10.0)]);
        reversed.push_row(vec![Scalar::Int(2), Scalar::Float(20.0)]);
        finalize(&mut reversed, &registration, &settings(), &context);

        assert_eq!(
            forward.get(0, "hash_row"),
            reversed.get(0, "hash_row"),
        );
        assert_eq!(
            forward.get(1, "hash_row"),
            reversed.get(1, "hash_row"),
        );
    }

    #[test]
    fn test_csv_rendering_fixed_floats() {
        let settings = settings();
        let mut frame = Frame::new(vec!["id".to_string(), "v".to_string()]);
        frame.push_row(vec![Scalar::Int(1), Scalar::Float(10.0)]);
        frame.push_row(vec![Scalar::Int(2), Scalar::Null]);
        let bytes = frame_to_csv(&frame, &settings).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text, "id,v\n1,10.000000\n2,\n");
    }

    #[test]
    fn test_atomic_write_leaves_no_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        write_atomic(&path, b"data").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "data");
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn test_write_artifacts_meta_and_checksums() {
        let dir = tempfile::tempdir().unwrap();
        let registration = entities::activity();
        let context = ctx();
        let settings = settings();

        let mut frame = sample_frame();
        finalize(&mut frame, &registration, &settings, &context);

        let plan = ArtifactPlan::new(dir.path(), "activity", "20240101", false, false);
        let qc = qc::QcReport::default().into_frame(&frame);
        let report = write_artifacts(&frame, &settings, &context, &plan, &qc).unwrap();

        assert_eq!(report.row_count, 2);
        let meta_text = fs::read_to_string(&plan.meta).unwrap();
        assert!(meta_text.contains("chembl_release: '35'"));
        assert!(meta_text.contains("chembl_release_source: status"));
        assert!(meta_text.contains("row_count: 2"));
        assert!(meta_text.contains(&context.run_id));

        let checksum_line = fs::read_to_string(&plan.checksum).unwrap();
        assert_eq!(checksum_line.trim().len(), 64);
        assert!(plan.qc.exists());
    }

    #[test]
    fn test_unknown_release_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registration = entities::activity();
        let context =
            RunContext::new("1.0.0", "chembl").with_release("unknown", ReleaseSource::Cli);
        let settings = settings();

        let mut frame = sample_frame();
        finalize(&mut frame, &registration, &settings, &context);
        let plan = ArtifactPlan::new(dir.path(), "activity", "20240101", false, false);
        let qc = qc::QcReport::default().into_frame(&frame);
        let result = write_artifacts(&frame, &settings, &context, &plan, &qc);
        assert!(matches!(result, Err(WriteError::Meta(_))));
        assert!(!plan.dataset.exists());
    }
}
