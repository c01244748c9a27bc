//! Wire types for the scan coordinator's HTTP API.

use serde::{Deserialize, Serialize};

/// Path of the scan-result set, relative to the coordinator base URL.
pub const SCAN_RESULTS_PATH: &str = "scanresults";
/// Path accepting a single image descriptor to enqueue for scanning.
pub const IMAGE_PATH: &str = "image";
/// Path accepting a full pod-inventory replacement.
pub const ALL_PODS_PATH: &str = "allpods";
/// Path accepting a full image-inventory replacement.
pub const ALL_IMAGES_PATH: &str = "allimages";

/// The full payload fetched from the coordinator each tick.
///
/// The coordinator enforces no uniqueness on either sequence; consumers
/// must take the first match in received order.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScanResults {
    #[serde(default)]
    pub pods: Vec<ScannedPod>,
    #[serde(default)]
    pub images: Vec<ScanRecord>,
}

/// One scanned artifact's vulnerability and policy facts.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScanRecord {
    pub repository_name: String,
    /// Hex digest, compared case-sensitively as an opaque key.
    pub content_hash: String,
    #[serde(default)]
    pub policy_violation_count: u64,
    #[serde(default)]
    pub vulnerability_count: u64,
    #[serde(default)]
    pub overall_status: String,
    #[serde(default, rename = "componentsURL")]
    pub components_url: String,
    #[serde(default)]
    pub scanner_metadata_version: String,
    #[serde(default)]
    pub coordinator_version: String,
}

/// Pod-level scan facts, keyed by name and namespace.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScannedPod {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub policy_violation_count: u64,
    #[serde(default)]
    pub vulnerability_count: u64,
    #[serde(default)]
    pub overall_status: String,
}

/// An image descriptor, both for the scan queue (`POST /image`) and the
/// full inventory replacement (`PUT /allimages`).
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImageRef {
    pub repository: String,
    #[serde(default)]
    pub tag: String,
    pub content_hash: String,
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_version: Option<String>,
}

impl ImageRef {
    pub fn new(repository: impl Into<String>, tag: impl Into<String>, content_hash: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
            content_hash: content_hash.into(),
            priority: 1,
            project_name: None,
            project_version: None,
        }
    }
}

/// A pod inventory entry for `PUT /allpods`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PodDescriptor {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub containers: Vec<ContainerDescriptor>,
}

/// One container within a pod inventory entry.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerDescriptor {
    pub name: String,
    pub image: ImageRef,
}
