//! Per-API source adapters.
//!
//! Every adapter wraps one external service: it chunks the requested ids,
//! walks the service's pagination style, normalizes payloads into records
//! with the source's column prefix, and turns per-id failures into fallback
//! marker records instead of errors.

pub mod chembl;
pub mod chunk;
pub mod crossref;
pub mod iuphar;
pub mod openalex;
pub mod pubchem;
pub mod pubmed;
pub mod semantic_scholar;
pub mod uniprot;

use futures_util::stream::{self, StreamExt};

use crate::frame::Record;
use crate::net::ApiError;
use crate::pipeline::Shutdown;

/// Fields shared across all sources and therefore never prefixed.
pub const SHARED_FIELDS: &[&str] = &["doi_clean", "pmid"];

/// Run chunk futures with bounded concurrency. New chunks stop being
/// dispatched once shutdown is requested; in-flight calls run to completion.
pub(crate) async fn fan_out<F>(
    tasks: Vec<F>,
    workers: usize,
    shutdown: &Shutdown,
) -> Result<Vec<Record>, ApiError>
where
    F: std::future::Future<Output = Result<Vec<Record>, ApiError>>,
{
    let mut stream = stream::iter(tasks)
        .take_while(|_| futures_util::future::ready(!shutdown.is_cancelled()))
        .buffer_unordered(workers.max(1));

    let mut records: Vec<Record> = Vec::new();
    while let Some(result) = stream.next().await {
        records.extend(result?);
    }
    Ok(records)
}
