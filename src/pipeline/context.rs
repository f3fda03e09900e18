//! Per-run execution context stamped into every emitted row.

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use crate::frame::{Frame, Scalar};

/// Where the release tag came from; recorded in meta.yaml.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseSource {
    Cli,
    Status,
}

impl ReleaseSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseSource::Cli => "cli",
            ReleaseSource::Status => "status",
        }
    }
}

/// Identity of a single execution. `run_id`, `started_at` and `finished_at`
/// are the only values allowed to differ between otherwise identical runs.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub pipeline_version: String,
    pub source_system: String,
    pub release_tag: Option<String>,
    pub release_source: ReleaseSource,
    pub started_at: DateTime<Utc>,
}

impl RunContext {
    pub fn new(pipeline_version: impl Into<String>, source_system: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            pipeline_version: pipeline_version.into(),
            source_system: source_system.into(),
            release_tag: None,
            release_source: ReleaseSource::Status,
            started_at: Utc::now(),
        }
    }

    pub fn with_release(mut self, tag: impl Into<String>, source: ReleaseSource) -> Self {
        self.release_tag = Some(tag.into());
        self.release_source = source;
        self
    }

    /// Second-precision ISO-8601 Z timestamp of run start; also used as the
    /// deterministic `extracted_at` value for every row.
    pub fn started_at_iso(&self) -> String {
        self.started_at
            .to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    /// Stamp the metadata columns onto every row of a frame.
    pub fn stamp(&self, frame: &mut Frame) {
        let columns = [
            ("run_id", Scalar::String(self.run_id.clone())),
            (
                "pipeline_version",
                Scalar::String(self.pipeline_version.clone()),
            ),
            ("source_system", Scalar::String(self.source_system.clone())),
            (
                "chembl_release",
                self.release_tag
                    .clone()
                    .map_or(Scalar::Null, Scalar::String),
            ),
            ("extracted_at", Scalar::String(self.started_at_iso())),
        ];
        for (name, value) in columns {
            frame.add_column(name, Scalar::Null);
            for row in 0..frame.len() {
                frame.set(row, name, value.clone());
            }
        }
    }
}
