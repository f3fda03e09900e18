//! CLI entrypoint: load configuration, run one pipeline, map errors to
//! process exit codes (0 success, 1 internal, 2 configuration, 3 external
//! API).

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bioetl::pipeline::activity::ActivityPipeline;
use bioetl::pipeline::assay::AssayPipeline;
use bioetl::pipeline::document::DocumentPipeline;
use bioetl::pipeline::target::TargetPipeline;
use bioetl::pipeline::testitem::TestitemPipeline;
use bioetl::schema::SchemaRegistryError;
use bioetl::{Config, EntityPipeline, PipelineError, PipelineRunner, SchemaRegistry, Shutdown};

#[derive(Debug, Parser)]
#[command(name = "bioetl", about = "Bioactivity data-acquisition ETL")]
struct Cli {
    /// Path to the pipeline YAML configuration.
    #[arg(short, long)]
    config: PathBuf,

    /// Override the upstream release tag (otherwise taken from the ChEMBL
    /// /status handshake).
    #[arg(long)]
    release: Option<String>,

    /// Skip extraction and write empty artifacts with the declared schema.
    #[arg(long)]
    dry_run: bool,

    /// Override io.input.path.
    #[arg(long)]
    input: Option<PathBuf>,

    /// Override io.output.root.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Override the artifact date tag (defaults to the run date).
    #[arg(long)]
    date_tag: Option<String>,
}

fn build_pipeline(config: &Config) -> Result<Box<dyn EntityPipeline>, PipelineError> {
    let pipeline: Box<dyn EntityPipeline> = match config.pipeline.name.as_str() {
        "activity" => Box::new(ActivityPipeline::from_config(config)?),
        "assay" => Box::new(AssayPipeline::from_config(config)?),
        "document" => Box::new(DocumentPipeline::from_config(config)?),
        "target" => Box::new(TargetPipeline::from_config(config)?),
        "testitem" => Box::new(TestitemPipeline::from_config(config)?),
        other => {
            return Err(PipelineError::Registry(SchemaRegistryError::UnknownEntity(
                other.to_string(),
            )))
        }
    };
    Ok(pipeline)
}

async fn run(cli: Cli) -> Result<(), PipelineError> {
    let mut config = Config::from_path(&cli.config)?;
    if let Some(release) = cli.release {
        config.pipeline.release_tag = Some(release);
    }
    if cli.dry_run {
        config.runtime.dry_run = true;
    }
    if let Some(input) = cli.input {
        config.io.input.path = input;
    }
    if let Some(output) = cli.output {
        config.io.output.root = output;
    }
    if let Some(date_tag) = cli.date_tag {
        config.io.output.date_tag = Some(date_tag);
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let registry = SchemaRegistry::with_builtin();
    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown_requested");
                shutdown.cancel();
            }
        });
    }

    let pipeline = build_pipeline(&config)?;
    let runner = PipelineRunner::new(config, &registry, shutdown)?;
    let report = runner.run(pipeline.as_ref()).await?;
    info!(
        dataset = %report.plan.dataset.display(),
        rows = report.row_count,
        "run_finished"
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    if let Err(error) = run(cli).await {
        let code = error.exit_code();
        let line = serde_json::json!({
            "error_code": code,
            "error_label": error.error_label(),
            "message": error.to_string(),
            "context": "bioetl",
        });
        eprintln!("{line}");
        std::process::exit(code);
    }
}
