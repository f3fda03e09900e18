//! End-to-end determinism over the offline ChEMBL stub.
//!
//! Two runs of the activity pipeline with identical input and configuration
//! must produce byte-identical artifacts apart from `run_id`, `started_at`,
//! `finished_at` and the per-row run metadata those feed.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use bioetl::hashing;
use bioetl::pipeline::activity::ActivityPipeline;
use bioetl::writer::WriteReport;
use bioetl::{Config, PipelineRunner, Scalar, SchemaRegistry, Shutdown};

fn write_input(dir: &Path) -> PathBuf {
    let path = dir.join("activity.csv");
    let mut file = fs::File::create(&path).unwrap();
    writeln!(file, "activity_id").unwrap();
    writeln!(file, "123").unwrap();
    writeln!(file, "456").unwrap();
    path
}

fn config_for(input: &Path, output: &Path) -> Config {
    let yaml = format!(
        r#"
pipeline:
  name: activity
  version: 1.0.0
io:
  input:
    path: {input}
  output:
    root: {output}
    date_tag: "20240101"
runtime:
  workers: 2
  batch_size: 50
  max_url_length: 2000
  webenv_timeout_seconds: 60
  poll_interval_seconds: 0.1
  poll_max_iterations: 5
"#,
        input = input.display(),
        output = output.display(),
    );
    Config::from_yaml(&yaml).unwrap()
}

async fn run_once(input: &Path, output: &Path) -> WriteReport {
    std::env::set_var("BIOETL_OFFLINE_CHEMBL_CLIENT", "true");
    let config = config_for(input, output);
    let registry = SchemaRegistry::with_builtin();
    let pipeline = ActivityPipeline::from_config(&config).unwrap();
    let runner = PipelineRunner::new(config, &registry, Shutdown::new()).unwrap();
    runner.run(&pipeline).await.unwrap()
}

/// Blank the columns that legitimately vary between runs (`run_id`,
/// `extracted_at`) so the rest of the CSV can be compared byte for byte.
fn mask_varying_columns(csv_text: &str) -> String {
    let mut lines = csv_text.lines();
    let header: Vec<String> = lines
        .next()
        .unwrap()
        .split(',')
        .map(str::to_string)
        .collect();
    let masked: Vec<usize> = header
        .iter()
        .enumerate()
        .filter(|(_, name)| name.as_str() == "run_id" || name.as_str() == "extracted_at")
        .map(|(idx, _)| idx)
        .collect();

    let mut out = vec![header.join(",")];
    for line in lines {
        let mut cells: Vec<String> = line.split(',').map(str::to_string).collect();
        for &idx in &masked {
            if idx < cells.len() {
                cells[idx] = "<varies>".to_string();
            }
        }
        out.push(cells.join(","));
    }
    out.join("\n")
}

fn mask_meta(yaml_text: &str) -> String {
    yaml_text
        .lines()
        .filter(|line| {
            !line.starts_with("run_id:")
                && !line.starts_with("started_at:")
                && !line.starts_with("finished_at:")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[tokio::test]
async fn identical_runs_produce_identical_artifacts() {
    let workspace = tempfile::tempdir().unwrap();
    let input = write_input(workspace.path());

    let out_a = workspace.path().join("run_a");
    let out_b = workspace.path().join("run_b");
    let report_a = run_once(&input, &out_a).await;
    let report_b = run_once(&input, &out_b).await;

    assert_eq!(report_a.row_count, 2);
    assert_eq!(report_b.row_count, 2);

    let dataset_a = fs::read_to_string(&report_a.plan.dataset).unwrap();
    let dataset_b = fs::read_to_string(&report_b.plan.dataset).unwrap();
    assert_eq!(mask_varying_columns(&dataset_a), mask_varying_columns(&dataset_b));

    let meta_a = fs::read_to_string(&report_a.plan.meta).unwrap();
    let meta_b = fs::read_to_string(&report_b.plan.meta).unwrap();
    assert_eq!(mask_meta(&meta_a), mask_meta(&meta_b));

    // The run ids themselves must differ: they are the allowed variation.
    assert_ne!(
        meta_a.lines().find(|l| l.starts_with("run_id:")),
        meta_b.lines().find(|l| l.starts_with("run_id:")),
    );
}

#[tokio::test]
async fn dataset_rows_are_sorted_and_hashed() {
    let workspace = tempfile::tempdir().unwrap();
    let input = write_input(workspace.path());
    let output = workspace.path().join("out");
    let report = run_once(&input, &output).await;

    let dataset = fs::read_to_string(&report.plan.dataset).unwrap();
    let mut lines = dataset.lines();
    let header: Vec<&str> = lines.next().unwrap().split(',').collect();
    assert_eq!(header[0], "activity_id");
    let first_row: Vec<&str> = lines.next().unwrap().split(',').collect();

    let column = |name: &str| header.iter().position(|h| *h == name).unwrap();
    assert_eq!(first_row[column("activity_id")], "123");
    assert_eq!(first_row[column("standard_type")], "IC50");
    assert_eq!(first_row[column("standard_value")], "10.000000");
    assert_eq!(first_row[column("standard_units")], "nM");
    assert_eq!(
        first_row[column("hash_business_key")],
        hashing::hash_business_key(&[Scalar::Int(123)]),
    );

    // meta.yaml carries the handshake-derived release and its provenance.
    let meta = fs::read_to_string(&report.plan.meta).unwrap();
    assert!(meta.contains("row_count: 2"));
    assert!(meta.contains("chembl_release: ChEMBL_35"));
    assert!(meta.contains("chembl_release_source: status"));

    // meta.sha256 is the checksum of meta.yaml.
    let recorded = fs::read_to_string(&report.plan.checksum).unwrap();
    assert_eq!(
        recorded.trim(),
        hashing::sha256_file(&report.plan.meta).unwrap()
    );
}

#[tokio::test]
async fn stale_tmp_files_are_ignored_and_removed() {
    let workspace = tempfile::tempdir().unwrap();
    let input = write_input(workspace.path());
    let output = workspace.path().join("out");

    // Simulate a crash between .tmp creation and rename from an earlier run.
    let entity_dir = output.join("activity");
    fs::create_dir_all(&entity_dir).unwrap();
    let stale = entity_dir.join("activity_20240101.csv.tmp");
    fs::write(&stale, "half-written").unwrap();

    let report = run_once(&input, &output).await;
    assert!(report.plan.dataset.exists());
    assert!(!stale.exists());

    let leftovers: Vec<_> = fs::read_dir(&entity_dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "tmp"))
        .collect();
    assert!(leftovers.is_empty(), "tmp files left behind: {leftovers:?}");
}

#[tokio::test]
async fn qc_report_contains_row_count_and_counters() {
    let workspace = tempfile::tempdir().unwrap();
    let input = write_input(workspace.path());
    let output = workspace.path().join("out");
    let report = run_once(&input, &output).await;

    let qc = fs::read_to_string(&report.plan.qc).unwrap();
    assert!(qc.starts_with("metric,column,value"));
    assert!(qc.contains("row_count,,2"));
    assert!(qc.contains("api_calls,chembl,0"));
    assert!(qc.contains("dtype,activity_id,int64"));
}
