//! Image manifest model
//!
//! Only the fields needed to move an image between locations are modelled:
//! the blobs a single-image manifest references, and the platform entries of
//! a manifest list / OCI index.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST_V2: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const OCI_MANIFEST_V1: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX_V1: &str = "application/vnd.oci.image.index.v1+json";

/// Manifest media types sent in `Accept` when fetching manifests
pub const ACCEPTED_MANIFEST_TYPES: &[&str] = &[
    DOCKER_MANIFEST_V2,
    DOCKER_MANIFEST_LIST_V2,
    OCI_MANIFEST_V1,
    OCI_INDEX_V1,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Default for Platform {
    fn default() -> Self {
        Self {
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            variant: None,
        }
    }
}

impl Platform {
    pub fn new(os: &str, architecture: &str) -> Self {
        Self {
            architecture: architecture.to_string(),
            os: os.to_string(),
            variant: None,
        }
    }

    /// A requested platform without a variant matches any variant
    pub fn matches(&self, candidate: &Platform) -> bool {
        self.os == candidate.os
            && self.architecture == candidate.architecture
            && (self.variant.is_none() || self.variant == candidate.variant)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub digest: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

impl ImageManifest {
    /// Every blob the manifest references, each digest listed once
    ///
    /// Layers come first in manifest order, then the config. A digest that
    /// appears under several entries is only enumerated the first time.
    pub fn blobs(&self) -> Vec<&Descriptor> {
        let mut seen = HashSet::new();
        self.layers
            .iter()
            .chain(std::iter::once(&self.config))
            .filter(|descriptor| seen.insert(descriptor.digest.as_str()))
            .collect()
    }

    pub fn total_size(&self) -> u64 {
        self.blobs().iter().map(|d| d.size).sum()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestIndex {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
}

impl ManifestIndex {
    pub fn select(&self, platform: &Platform) -> Option<&Descriptor> {
        self.manifests.iter().find(|entry| {
            entry
                .platform
                .as_ref()
                .is_some_and(|candidate| platform.matches(candidate))
        })
    }
}

#[derive(Debug, Clone)]
pub enum ParsedManifest {
    Image(ImageManifest),
    Index(ManifestIndex),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestShape {
    #[serde(default)]
    schema_version: Option<u32>,
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    manifests: Option<serde_json::Value>,
    #[serde(default)]
    config: Option<serde_json::Value>,
}

impl ParsedManifest {
    /// Parse manifest bytes, using the transport-reported content type when
    /// the document does not carry its own `mediaType`
    pub fn parse(bytes: &[u8], content_type: Option<&str>) -> Result<Self> {
        let shape: ManifestShape = serde_json::from_slice(bytes)?;
        if shape.schema_version == Some(1) {
            return Err(SyncError::NotImplemented(
                "Docker schema1 manifests are not supported".to_string(),
            ));
        }

        let media_type = shape.media_type.as_deref().or(content_type);
        let is_index = matches!(media_type, Some(DOCKER_MANIFEST_LIST_V2) | Some(OCI_INDEX_V1))
            || (shape.manifests.is_some() && shape.config.is_none());

        if is_index {
            Ok(ParsedManifest::Index(serde_json::from_slice(bytes)?))
        } else {
            Ok(ParsedManifest::Image(serde_json::from_slice(bytes)?))
        }
    }

    /// The media type to report when storing or pushing this manifest
    pub fn media_type(&self, content_type: Option<&str>) -> String {
        let declared = match self {
            ParsedManifest::Image(m) => m.media_type.as_deref(),
            ParsedManifest::Index(m) => m.media_type.as_deref(),
        };
        declared
            .or(content_type)
            .unwrap_or(match self {
                ParsedManifest::Image(_) => OCI_MANIFEST_V1,
                ParsedManifest::Index(_) => OCI_INDEX_V1,
            })
            .to_string()
    }
}
