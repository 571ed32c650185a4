//! Export finalization: layer copies, config blob, manifest list.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::chains::{CacheChains, ChainsOptions};
use crate::content::{ContentError, DescriptorProviderPair, Ingester};
use crate::digest::Digest;
use crate::manifest::{
    ManifestList, CACHE_CONFIG_MEDIA_TYPE_V0, MEDIA_TYPE_DOCKER_MANIFEST_LIST,
    MEDIA_TYPE_OCI_INDEX,
};
use crate::remote::Descriptor;

use super::config::ExporterConfig;
use super::progress::{NoopProgress, ProgressSink, ProgressState};

/// Key under which the finalize response carries the JSON descriptor of
/// the written manifest.
pub const EXPORTER_RESPONSE_MANIFEST_DESC: &str = "cache.manifest";

/// Errors surfaced while finalizing an export.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error(transparent)]
    Chains(#[from] crate::chains::Error),

    #[error("missing blob {digest}")]
    MissingBlob { digest: Digest },

    #[error("timed out writing layer {digest}")]
    LayerTimeout { digest: Digest },

    #[error("error writing blob: {0}")]
    Content(#[from] ContentError),

    #[error("failed to encode manifest: {0}")]
    Json(#[from] serde_json::Error),
}

/// Exports a cache graph to a content store as a manifest list.
pub struct Exporter {
    chains: CacheChains,
    ingester: Arc<dyn Ingester>,
    progress: Arc<dyn ProgressSink>,
    target: String,
    config: ExporterConfig,
}

impl Exporter {
    /// Create an exporter writing into `ingester`. `target` names the
    /// destination in progress events.
    pub fn new(
        ingester: Arc<dyn Ingester>,
        target: impl Into<String>,
        config: ExporterConfig,
    ) -> Self {
        let chains = CacheChains::with_options(ChainsOptions {
            empty_layer_removal_supported: config.empty_layer_removal_supported,
        });
        Self {
            chains,
            ingester,
            progress: Arc::new(NoopProgress),
            target: target.into(),
            config,
        }
    }

    /// Replace the progress sink.
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// The cache graph this exporter marshals; populated by the solver.
    pub fn chains(&self) -> &CacheChains {
        &self.chains
    }

    /// Marshal the graph, push every referenced blob, and write the
    /// manifest list.
    ///
    /// Returns metadata for the client, including the JSON descriptor of
    /// the written manifest under [`EXPORTER_RESPONSE_MANIFEST_DESC`].
    pub async fn finalize(&self) -> Result<HashMap<String, String>, ExportError> {
        let marshal_id = format!("marshalling {}", self.target);
        self.progress.status(&marshal_id, ProgressState::Started);
        let marshalled = self.chains.marshal();
        self.progress.status(&marshal_id, ProgressState::Completed);
        let (config, descriptors) = marshalled?;

        let mut manifests: Vec<Descriptor> = Vec::with_capacity(config.layers.len() + 1);
        for layer in &config.layers {
            let pair = descriptors
                .get(&layer.blob)
                .ok_or_else(|| ExportError::MissingBlob {
                    digest: layer.blob.clone(),
                })?;
            let layer_id = format!("writing layer {}", layer.blob);
            self.progress.status(&layer_id, ProgressState::Started);
            let copied = self.copy_layer(pair).await;
            self.progress.status(&layer_id, ProgressState::Completed);
            copied?;
            manifests.push(pair.descriptor.clone());
        }

        let config_bytes = Bytes::from(serde_json::to_vec(&config)?);
        let config_descriptor = Descriptor::new(
            Digest::from_bytes(&config_bytes),
            CACHE_CONFIG_MEDIA_TYPE_V0,
            config_bytes.len() as i64,
        );
        self.write_blob(&config_descriptor, config_bytes, "config")
            .await?;
        manifests.push(config_descriptor);

        let media_type = if self.config.oci {
            MEDIA_TYPE_OCI_INDEX
        } else {
            MEDIA_TYPE_DOCKER_MANIFEST_LIST
        };
        let list = ManifestList {
            schema_version: 2,
            media_type: media_type.to_string(),
            manifests,
        };
        let list_bytes = Bytes::from(serde_json::to_vec(&list)?);
        let list_descriptor = Descriptor::new(
            Digest::from_bytes(&list_bytes),
            media_type,
            list_bytes.len() as i64,
        );
        self.write_blob(&list_descriptor, list_bytes, "manifest")
            .await?;

        info!(
            target = %self.target,
            layers = config.layers.len(),
            manifest = %list_descriptor.digest,
            "cache manifest written"
        );
        let mut response = HashMap::new();
        response.insert(
            EXPORTER_RESPONSE_MANIFEST_DESC.to_string(),
            serde_json::to_string(&list_descriptor)?,
        );
        Ok(response)
    }

    /// Copy one layer blob from its provider into the ingester, bounded by
    /// the configured timeout.
    async fn copy_layer(&self, pair: &DescriptorProviderPair) -> Result<(), ExportError> {
        let digest = &pair.descriptor.digest;
        debug!(digest = %digest, "copying layer blob");
        let copy = async {
            let mut stream = pair.provider.fetch(digest).await?;
            let mut buffer = BytesMut::new();
            while let Some(chunk) = stream.next().await {
                buffer.extend_from_slice(&chunk?);
            }
            self.ingester
                .write_blob(digest, buffer.freeze(), &pair.descriptor)
                .await
        };
        match timeout(self.config.layer_export_timeout, copy).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ExportError::LayerTimeout {
                digest: digest.clone(),
            }),
        }
    }

    async fn write_blob(
        &self,
        descriptor: &Descriptor,
        data: Bytes,
        what: &str,
    ) -> Result<(), ExportError> {
        let id = format!("writing {} {}", what, descriptor.digest);
        self.progress.status(&id, ProgressState::Started);
        let written = self
            .ingester
            .write_blob(&descriptor.digest, data, descriptor)
            .await;
        self.progress.status(&id, ProgressState::Completed);
        Ok(written?)
    }
}
