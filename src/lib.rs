//! Bioactivity data-acquisition ETL engine.
//!
//! Harvests bio-chemical records (activities, assays, documents, targets,
//! test compounds) from public web services, normalizes and fuses them, and
//! materializes byte-stable tabular artifacts with sidecar metadata and QC
//! reports. The binary in `main.rs` is a thin CLI over this library.

pub mod config;
pub mod frame;
pub mod hashing;
pub mod ident;
pub mod merge;
pub mod net;
pub mod paginate;
pub mod pipeline;
pub mod schema;
pub mod sources;
pub mod writer;

pub use config::Config;
pub use frame::{Frame, Record, Scalar};
pub use pipeline::{EntityPipeline, PipelineError, PipelineRunner, Shutdown};
pub use schema::SchemaRegistry;
