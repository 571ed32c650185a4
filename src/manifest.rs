//! Wire format of the cache manifest.
//!
//! Defines the JSON objects pushed to the registry: the cache config (layer
//! forest plus record graph) and the manifest list that wraps the exported
//! layer descriptors together with the config descriptor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::remote::Descriptor;

/// Media type of the cache config blob.
pub const CACHE_CONFIG_MEDIA_TYPE_V0: &str = "application/vnd.buildkit.cacheconfig.v0";

/// Media type of an OCI image index.
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Media type of a Docker schema-2 manifest list.
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

// =============================================================================
// Cache config
// =============================================================================

/// The marshalled cache graph: a layer forest plus the record graph.
///
/// Two configs representing the same logical graph compare byte-equal after
/// JSON encoding; the canonical sort guarantees it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CacheConfig {
    /// Layer forest. Parents strictly precede children.
    pub layers: Vec<CacheLayer>,
    /// Cache records in canonical order.
    pub records: Vec<CacheRecord>,
}

/// A content-addressed layer and its position in the layer forest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CacheLayer {
    /// Digest of the layer blob.
    pub blob: Digest,
    /// Index of the parent layer within the same array, or `-1` when the
    /// layer has no parent.
    pub parent_index: i64,
}

/// A cache record: its digest, input alternatives per position, and results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CacheRecord {
    /// The record's cache key.
    pub digest: Digest,
    /// For each input position, the set of links that satisfy it.
    pub inputs: Vec<Vec<CacheInput>>,
    /// Result layer chains. At most one entry.
    pub results: Vec<CacheResult>,
}

/// One link satisfying an input position of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CacheInput {
    /// Domain-specific selector; may be empty.
    pub selector: String,
    /// Index of the source record within `Records`.
    pub link_index: usize,
}

/// A record's result: the terminal layer of its chain and its timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CacheResult {
    /// Index of the terminal layer within `Layers`.
    pub layer_index: usize,
    /// When the result was produced. Breaks sorting ties.
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Manifest list
// =============================================================================

/// The manifest list wrapping exported layers plus the config descriptor.
///
/// The OCI index cannot be pushed to every registry and the Docker list
/// carries no annotations, so the exporter writes its own shape and selects
/// the media type per target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestList {
    /// Always 2.
    pub schema_version: i32,
    /// [`MEDIA_TYPE_OCI_INDEX`] or [`MEDIA_TYPE_DOCKER_MANIFEST_LIST`].
    pub media_type: String,
    /// Layer descriptors followed by the config descriptor.
    pub manifests: Vec<Descriptor>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_config_wire_field_names() {
        let config = CacheConfig {
            layers: vec![CacheLayer {
                blob: Digest::from_bytes(b"layer"),
                parent_index: -1,
            }],
            records: vec![CacheRecord {
                digest: Digest::from_bytes(b"record"),
                inputs: vec![vec![CacheInput {
                    selector: String::new(),
                    link_index: 0,
                }]],
                results: vec![CacheResult {
                    layer_index: 0,
                    created_at: Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap(),
                }],
            }],
        };

        let json = serde_json::to_string(&config).unwrap();
        for field in [
            "\"Layers\"",
            "\"Records\"",
            "\"Blob\"",
            "\"ParentIndex\":-1",
            "\"Digest\"",
            "\"Inputs\"",
            "\"Results\"",
            "\"Selector\":\"\"",
            "\"LinkIndex\":0",
            "\"LayerIndex\":0",
            "\"CreatedAt\"",
        ] {
            assert!(json.contains(field), "missing {field} in {json}");
        }
    }

    #[test]
    fn test_empty_config_serializes_empty_arrays() {
        let json = serde_json::to_string(&CacheConfig::default()).unwrap();
        assert_eq!(json, r#"{"Layers":[],"Records":[]}"#);
    }

    #[test]
    fn test_config_round_trip() {
        let config = CacheConfig {
            layers: vec![
                CacheLayer {
                    blob: Digest::from_bytes(b"a"),
                    parent_index: -1,
                },
                CacheLayer {
                    blob: Digest::from_bytes(b"b"),
                    parent_index: 0,
                },
            ],
            records: vec![CacheRecord {
                digest: Digest::from_bytes(b"r"),
                inputs: Vec::new(),
                results: vec![CacheResult {
                    layer_index: 1,
                    created_at: Utc.with_ymd_and_hms(2023, 7, 1, 0, 0, 0).unwrap(),
                }],
            }],
        };

        let bytes = serde_json::to_vec(&config).unwrap();
        let parsed: CacheConfig = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, config);
        // re-encoding is byte-stable
        assert_eq!(serde_json::to_vec(&parsed).unwrap(), bytes);
    }

    #[test]
    fn test_manifest_list_wire_shape() {
        let list = ManifestList {
            schema_version: 2,
            media_type: MEDIA_TYPE_OCI_INDEX.to_string(),
            manifests: vec![Descriptor::new(
                Digest::from_bytes(b"cfg"),
                CACHE_CONFIG_MEDIA_TYPE_V0,
                3,
            )],
        };
        let json = serde_json::to_string(&list).unwrap();
        assert!(json.contains("\"schemaVersion\":2"));
        assert!(json.contains("\"mediaType\":\"application/vnd.oci.image.index.v1+json\""));
        assert!(json.contains("\"manifests\""));
    }
}
