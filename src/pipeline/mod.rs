//! Pipeline template: Extract -> Transform -> Validate -> Write.
//!
//! Every entity runs the same four-stage state machine; a descriptor names
//! the schema, sources and sort order, and the per-entity pipelines plug in
//! extraction and transformation. Transitions are linear and the only legal
//! error transition is to the terminal failed state.

pub mod activity;
pub mod assay;
pub mod context;
pub mod document;
pub mod input;
pub mod target;
pub mod testitem;

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::{error, info};

use crate::config::{Config, ConfigError};
use crate::frame::Frame;
use crate::net::{ApiError, CounterSnapshot};
use crate::schema::{self, Issue, SchemaRegistration, SchemaRegistryError, Severity};
use crate::writer::{self, qc::QcReport, ArtifactPlan, WriteError, WriteReport};

use context::{ReleaseSource, RunContext};

/// Cooperative shutdown flag. Stages and adapters check it between batches;
/// in-flight calls always run to completion.
#[derive(Debug, Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Registry(#[from] SchemaRegistryError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("input error at {path}: {message}")]
    Input { path: String, message: String },
    #[error("validation failed: {worst} severity reached with {} issue(s)", issues.len())]
    Validation { worst: Severity, issues: Vec<Issue> },
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl PipelineError {
    /// Process exit code: 2 configuration, 3 external API, 1 anything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Config(_) => 2,
            PipelineError::Api(_) => 3,
            _ => 1,
        }
    }

    pub fn error_label(&self) -> &'static str {
        match self {
            PipelineError::Config(_) => "config_error",
            PipelineError::Registry(_) => "schema_registry_error",
            PipelineError::Api(_) => "external_api_error",
            PipelineError::Input { .. } => "input_error",
            PipelineError::Validation { .. } => "validation_failed",
            PipelineError::Write(_) => "write_error",
            PipelineError::Internal(_) => "internal_error",
        }
    }
}

const USER_AGENT: &str = concat!("bioetl/", env!("CARGO_PKG_VERSION"));

/// Build the API client for one configured source: its HTTP profile, base
/// URL override and a fresh reqwest transport with the profile's timeouts.
pub(crate) fn api_client_for(
    config: &Config,
    source: &str,
    default_base: &str,
) -> Result<crate::net::ApiClient, PipelineError> {
    use std::time::Duration;

    let source_cfg = config.sources.get(source).cloned().unwrap_or_default();
    let profile = config.http.profile(source_cfg.http_profile.as_deref());
    let transport = crate::net::ReqwestTransport::new(
        Duration::from_secs_f64(profile.connect_timeout_seconds.max(0.1)),
        Duration::from_secs_f64(profile.read_timeout_seconds.max(0.1)),
        USER_AGENT,
    )?;
    let base = source_cfg
        .base_url
        .clone()
        .unwrap_or_else(|| default_base.to_string());
    Ok(crate::net::ApiClient::new(
        source,
        base,
        profile,
        Arc::new(transport),
    ))
}

/// Effective batch/URL limits for a source: the source override wins over
/// the runtime defaults.
pub(crate) fn source_limits(config: &Config, source: &str) -> (usize, usize) {
    let source_cfg = config.sources.get(source);
    let batch = source_cfg
        .and_then(|s| s.batch_size)
        .unwrap_or(config.runtime.batch_size);
    let url = source_cfg
        .and_then(|s| s.max_url_length)
        .unwrap_or(config.runtime.max_url_length);
    (batch, url)
}

/// Resolve a source's secret from its configured env-var name, falling back
/// to the conventional variable.
pub(crate) fn source_secret(
    config: &Config,
    source: &str,
    configured: impl Fn(&crate::config::SourceConfig) -> Option<String>,
    default_var: &str,
) -> Option<String> {
    let var = config
        .sources
        .get(source)
        .and_then(configured)
        .unwrap_or_else(|| default_var.to_string());
    crate::config::optional_secret(&var)
}

/// Extraction result: the raw frame plus the upstream release tag when the
/// source reported one (ChEMBL `/status` handshake).
pub struct ExtractOutput {
    pub frame: Frame,
    pub release: Option<String>,
}

/// One entity's extract and transform behaviour; validation and writing are
/// shared by the runner.
#[async_trait]
pub trait EntityPipeline: Send + Sync {
    fn entity(&self) -> &str;

    async fn extract(
        &self,
        input: &Frame,
        shutdown: &Shutdown,
    ) -> Result<ExtractOutput, PipelineError>;

    /// Pure and idempotent: transforming a transformed frame is a no-op.
    fn transform(&self, frame: Frame) -> Result<Frame, PipelineError>;

    /// Adapter counters for the QC report.
    fn counters(&self) -> Vec<(String, CounterSnapshot)>;
}

pub struct PipelineRunner {
    config: Config,
    registration: Arc<SchemaRegistration>,
    shutdown: Shutdown,
}

impl PipelineRunner {
    /// Resolve the entity schema up front; an unknown entity or version is
    /// fatal before any stage runs.
    pub fn new(
        config: Config,
        registry: &schema::SchemaRegistry,
        shutdown: Shutdown,
    ) -> Result<Self, PipelineError> {
        let registration = registry.get(&config.pipeline.name, "latest")?;
        Ok(Self {
            config,
            registration,
            shutdown,
        })
    }

    pub fn registration(&self) -> &SchemaRegistration {
        &self.registration
    }

    pub async fn run(&self, pipeline: &dyn EntityPipeline) -> Result<WriteReport, PipelineError> {
        let entity = pipeline.entity();
        let mut ctx = RunContext::new(
            self.config.pipeline.version.clone(),
            entity.to_string(),
        );
        info!(entity, run_id = %ctx.run_id, "pipeline_started");

        // Extract
        info!(entity, stage = "extract", "stage_started");
        let extracted = if self.config.runtime.dry_run {
            ExtractOutput {
                frame: Frame::new(self.registration.descriptor.column_order.clone()),
                release: None,
            }
        } else {
            let input = input::read_input_csv(&self.config.io.input.path)?;
            pipeline.extract(&input, &self.shutdown).await?
        };
        info!(
            entity,
            stage = "extract",
            rows = extracted.frame.len(),
            "stage_complete"
        );

        // Release tag: a CLI override wins, otherwise the handshake value.
        if let Some(tag) = &self.config.pipeline.release_tag {
            ctx = ctx.with_release(tag.clone(), ReleaseSource::Cli);
        } else if let Some(tag) = &extracted.release {
            ctx = ctx.with_release(tag.clone(), ReleaseSource::Status);
        }

        // Transform
        info!(entity, stage = "transform", "stage_started");
        let mut frame = pipeline.transform(extracted.frame)?;
        writer::finalize(&mut frame, &self.registration, &self.config.determinism, &ctx);
        info!(entity, stage = "transform", rows = frame.len(), "stage_complete");

        // Validate
        info!(entity, stage = "validate", "stage_started");
        let issues = schema::validate(&frame, &self.registration);
        let threshold = Severity::from_str(&self.config.validation.severity_threshold)
            .unwrap_or(Severity::Error);
        if let Some(worst) = schema::max_severity(&issues) {
            if worst >= threshold {
                error!(
                    entity,
                    stage = "validate",
                    worst = %worst,
                    issues = issues.len(),
                    "stage_failed"
                );
                return Err(PipelineError::Validation { worst, issues });
            }
        }
        info!(
            entity,
            stage = "validate",
            issues = issues.len(),
            "stage_complete"
        );

        // Write
        info!(entity, stage = "write", "stage_started");
        let date_tag = self
            .config
            .io
            .output
            .date_tag
            .clone()
            .unwrap_or_else(|| Utc::now().format("%Y%m%d").to_string());
        let plan = ArtifactPlan::new(
            &self.config.io.output.root,
            entity,
            &date_tag,
            self.config.materialization.correlation,
            self.config.materialization.summary,
        );
        plan.clean_stale_tmp();
        let qc = QcReport::new(issues, pipeline.counters()).into_frame(&frame);
        let report = writer::write_artifacts(&frame, &self.config.determinism, &ctx, &plan, &qc)?;
        info!(
            entity,
            stage = "write",
            rows = report.row_count,
            run_id = %ctx.run_id,
            "pipeline_complete"
        );
        Ok(report)
    }
}
