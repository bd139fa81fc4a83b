use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::digest::Digest;

pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
pub const INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
pub const DOCKER_MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("manifest media type {declared} does not match Content-Type {header}")]
    MediaTypeMismatch { declared: String, header: String },
}

/// Reference to a blob or manifest as it appears in config/layers/subject
/// fields and in referrers responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// The fields of a manifest or index document the registry itself inspects.
/// Stored bytes stay verbatim; this is only a parsed view. Index documents
/// deserialize here too (`manifests` populated, `config`/`layers` absent),
/// which also covers arbitrarily nested indexes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<Descriptor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manifests: Vec<Descriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Manifest {
    /// Parses manifest bytes and enforces the media-type contract: a
    /// declared `mediaType` must agree with the Content-Type header when
    /// the header is present. Callers MAY omit the header entirely.
    pub fn parse(bytes: &[u8], content_type: Option<&str>) -> Result<Manifest, ManifestError> {
        let manifest: Manifest = serde_json::from_slice(bytes)?;
        if let (Some(declared), Some(header)) = (manifest.media_type.as_deref(), content_type) {
            if declared != header {
                return Err(ManifestError::MediaTypeMismatch {
                    declared: declared.to_string(),
                    header: header.to_string(),
                });
            }
        }
        Ok(manifest)
    }

    /// The artifact type a referrers listing reports for this manifest:
    /// the explicit `artifactType` when present, otherwise the config
    /// descriptor's media type (OCI image-spec 1.1 artifact convention).
    pub fn effective_artifact_type(&self) -> Option<String> {
        self.artifact_type
            .clone()
            .or_else(|| self.config.as_ref().map(|c| c.media_type.clone()))
    }
}

/// Referrers responses are a schemaVersion-2 image index.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferrersIndex {
    pub schema_version: u32,
    pub media_type: String,
    pub manifests: Vec<Descriptor>,
}

impl ReferrersIndex {
    pub fn new(manifests: Vec<Descriptor>) -> Self {
        ReferrersIndex {
            schema_version: 2,
            media_type: INDEX_MEDIA_TYPE.to_string(),
            manifests,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TagList {
    pub name: String,
    pub tags: Vec<String>,
}

/// Repository names per the distribution spec grammar: lowercase
/// alphanumeric path components separated by `/`, with `.`, `_`, `__` or
/// `-` runs as inner separators.
pub fn is_valid_repository_name(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    name.split('/').all(is_valid_name_component)
}

fn is_valid_name_component(component: &str) -> bool {
    let bytes = component.as_bytes();
    let is_alnum = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if bytes.first().is_none_or(|b| !is_alnum(b)) || bytes.last().is_none_or(|b| !is_alnum(b)) {
        return false;
    }
    let mut prev_separator = false;
    for &b in bytes {
        if is_alnum(&b) {
            prev_separator = false;
        } else if b == b'.' || b == b'_' || b == b'-' {
            // runs of separators are fine for `_`/`-` but not for `.`
            if prev_separator && b == b'.' {
                return false;
            }
            prev_separator = true;
        } else {
            return false;
        }
    }
    true
}

/// Tags are 1-128 chars of word characters, starting alphanumeric or `_`.
pub fn is_valid_tag_name(tag: &str) -> bool {
    if tag.is_empty() || tag.len() > 128 {
        return false;
    }
    let bytes = tag.as_bytes();
    let first = bytes[0];
    if !(first.is_ascii_alphanumeric() || first == b'_') {
        return false;
    }
    bytes[1..]
        .iter()
        .all(|&b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'-')
}
