//! Exporter configuration.

use std::env;
use std::time::Duration;

/// Environment variable overriding the per-layer export timeout, in minutes.
const ENV_LAYER_EXPORT_TIMEOUT: &str = "LAYER_EXPORT_TIMEOUT_MINUTE";

/// Default per-layer export timeout in minutes.
const DEFAULT_LAYER_EXPORT_TIMEOUT_MINUTES: u64 = 5;

/// Configuration for a cache exporter.
#[derive(Debug, Clone)]
pub struct ExporterConfig {
    /// Emit an OCI image index rather than a Docker manifest list.
    pub oci: bool,
    /// Elide the empty gzip layer from marshalled chains. Image exporters
    /// remove empty layers; layer-store based consumers do not.
    pub empty_layer_removal_supported: bool,
    /// Upper bound on each layer blob copy.
    pub layer_export_timeout: Duration,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            oci: true,
            empty_layer_removal_supported: true,
            layer_export_timeout: layer_export_timeout_from_env(),
        }
    }
}

/// Read the layer export timeout from the environment, falling back to the
/// default on any parse failure.
pub fn layer_export_timeout_from_env() -> Duration {
    parse_timeout_minutes(env::var(ENV_LAYER_EXPORT_TIMEOUT).ok())
}

fn parse_timeout_minutes(value: Option<String>) -> Duration {
    let minutes = value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_LAYER_EXPORT_TIMEOUT_MINUTES);
    Duration::from_secs(minutes * 60)
}
