//! Pushing a marshalled cache graph to a content store.
//!
//! The exporter owns a [`crate::chains::CacheChains`] for the solver to
//! populate; [`Exporter::finalize`] marshals it, copies every referenced
//! layer blob into the configured [`crate::content::Ingester`], and writes
//! the config blob plus the wrapping manifest list.

mod config;
mod export;
mod progress;

pub use config::ExporterConfig;
pub use export::{ExportError, Exporter, EXPORTER_RESPONSE_MANIFEST_DESC};
pub use progress::{NoopProgress, ProgressSink, ProgressState};
