//! The annotation model: pure functions turning scan facts into the
//! label and annotation maps written onto target objects.

use crate::api::{ScanRecord, ScannedPod};
use crate::mapdiff::KvMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Namespace prefix for all labels written by the perceivers.
pub const LABEL_NS: &str = "com.blackducksoftware";
/// Namespace prefix for pod annotations.
pub const POD_ANNOTATION_NS: &str = "quality.pod.openshift.io";
/// Namespace prefix for image annotations.
pub const IMAGE_ANNOTATION_NS: &str = "quality.image.openshift.io";
/// Vendor domain carrying the provenance annotations.
pub const VENDOR_NS: &str = "blackducksoftware.com";

/// Hosting platforms cap label keys and values at this many characters.
pub const MAX_LABEL_LEN: usize = 63;

/// Key markers identifying the entries this system owns. Used to scope
/// the map-diff `contains` check so unrelated user labels are ignored.
pub const RELEVANT_KEY_MARKERS: &[&str] = &["blackduck", POD_ANNOTATION_NS, IMAGE_ANNOTATION_NS];

/// Returns true when the key holds a serialized [`SecuritySummary`] and
/// must be compared structurally rather than byte-for-byte.
pub fn is_summary_key(key: &str) -> bool {
    key.contains(POD_ANNOTATION_NS) || key.contains(IMAGE_ANNOTATION_NS)
}

fn clip(value: String) -> String {
    if value.chars().count() <= MAX_LABEL_LEN {
        value
    } else {
        value.chars().take(MAX_LABEL_LEN).collect()
    }
}

fn label_insert(labels: &mut KvMap, key: String, value: String) {
    labels.insert(clip(key), clip(value));
}

/// Scan facts for one image, as reported by the coordinator.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageFacts {
    pub policy_violations: u64,
    pub vulnerabilities: u64,
    pub overall_status: String,
    pub components_url: String,
    pub scanner_version: String,
    pub coordinator_version: String,
}

impl ImageFacts {
    pub fn from_record(record: &ScanRecord) -> Self {
        Self {
            policy_violations: record.policy_violation_count,
            vulnerabilities: record.vulnerability_count,
            overall_status: record.overall_status.clone(),
            components_url: record.components_url.clone(),
            scanner_version: record.scanner_metadata_version.clone(),
            coordinator_version: record.coordinator_version.clone(),
        }
    }

    pub fn has_policy_violations(&self) -> bool {
        self.policy_violations > 0
    }

    pub fn has_vulnerabilities(&self) -> bool {
        self.vulnerabilities > 0
    }

    /// Builds the label map for this image.
    ///
    /// A non-empty `name` marks a positional (multi-container) target: an
    /// `image<index>` key carries the repository name with `/` replaced
    /// by `.`, and the five fixed keys gain the `<index>` suffix. Every
    /// key and value is clipped to [`MAX_LABEL_LEN`] characters.
    pub fn labels(&self, name: &str, index: usize) -> KvMap {
        let mut labels = BTreeMap::new();
        let suffix = if name.is_empty() {
            String::new()
        } else {
            label_insert(
                &mut labels,
                format!("{LABEL_NS}.image{index}"),
                name.replace('/', "."),
            );
            index.to_string()
        };

        label_insert(
            &mut labels,
            format!("{LABEL_NS}.image{suffix}.policy-violations"),
            self.policy_violations.to_string(),
        );
        label_insert(
            &mut labels,
            format!("{LABEL_NS}.image{suffix}.has-policy-violations"),
            self.has_policy_violations().to_string(),
        );
        label_insert(
            &mut labels,
            format!("{LABEL_NS}.image{suffix}.vulnerabilities"),
            self.vulnerabilities.to_string(),
        );
        label_insert(
            &mut labels,
            format!("{LABEL_NS}.image{suffix}.has-vulnerabilities"),
            self.has_vulnerabilities().to_string(),
        );
        label_insert(
            &mut labels,
            format!("{LABEL_NS}.image{suffix}.overall-status"),
            self.overall_status.clone(),
        );
        labels
    }

    /// Builds the annotation map for this image: provenance keys plus the
    /// two JSON security summaries. Annotations are not length-clipped.
    pub fn annotations(&self, name: &str, index: usize) -> KvMap {
        let mut annotations = BTreeMap::new();
        let prefix = if name.is_empty() {
            String::new()
        } else {
            let dotted = name.replace('/', ".");
            let prefix = format!("image{index}.");
            annotations.insert(format!("{prefix}{VENDOR_NS}"), dotted.clone());
            annotations.insert(format!("{prefix}{IMAGE_ANNOTATION_NS}"), dotted);
            prefix
        };

        annotations.insert(
            format!("{prefix}{VENDOR_NS}/hub-scanner-version"),
            self.scanner_version.clone(),
        );
        annotations.insert(
            format!("{prefix}{VENDOR_NS}/attestation-hub-server"),
            self.coordinator_version.clone(),
        );
        annotations.insert(
            format!("{prefix}{VENDOR_NS}/project-endpoint"),
            self.components_url.clone(),
        );

        let vulns = SecuritySummary::vulnerability(
            self.has_vulnerabilities(),
            &self.components_url,
            self.vulnerabilities,
        );
        let policy = SecuritySummary::policy(
            self.has_policy_violations(),
            &self.components_url,
            self.policy_violations,
        );
        annotations.insert(
            format!("{prefix}{IMAGE_ANNOTATION_NS}/vulnerability.blackduck"),
            vulns.to_json(),
        );
        annotations.insert(
            format!("{prefix}{IMAGE_ANNOTATION_NS}/policy.blackduck"),
            policy.to_json(),
        );
        annotations
    }
}

/// Scan facts for one pod (or pod-like object such as a swarm service).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PodFacts {
    pub policy_violations: u64,
    pub vulnerabilities: u64,
    pub overall_status: String,
}

impl PodFacts {
    pub fn from_record(record: &ScannedPod) -> Self {
        Self {
            policy_violations: record.policy_violation_count,
            vulnerabilities: record.vulnerability_count,
            overall_status: record.overall_status.clone(),
        }
    }

    pub fn has_policy_violations(&self) -> bool {
        self.policy_violations > 0
    }

    pub fn has_vulnerabilities(&self) -> bool {
        self.vulnerabilities > 0
    }

    /// The five fixed pod-level label keys.
    pub fn labels(&self) -> KvMap {
        let mut labels = BTreeMap::new();
        label_insert(
            &mut labels,
            format!("{LABEL_NS}.pod.policy-violations"),
            self.policy_violations.to_string(),
        );
        label_insert(
            &mut labels,
            format!("{LABEL_NS}.pod.has-policy-violations"),
            self.has_policy_violations().to_string(),
        );
        label_insert(
            &mut labels,
            format!("{LABEL_NS}.pod.vulnerabilities"),
            self.vulnerabilities.to_string(),
        );
        label_insert(
            &mut labels,
            format!("{LABEL_NS}.pod.has-vulnerabilities"),
            self.has_vulnerabilities().to_string(),
        );
        label_insert(
            &mut labels,
            format!("{LABEL_NS}.pod.overall-status"),
            self.overall_status.clone(),
        );
        labels
    }

    /// The two pod-level security-summary annotations.
    pub fn annotations(&self) -> KvMap {
        let mut annotations = BTreeMap::new();
        let vulns =
            SecuritySummary::vulnerability(self.has_vulnerabilities(), "", self.vulnerabilities);
        let policy =
            SecuritySummary::policy(self.has_policy_violations(), "", self.policy_violations);
        annotations.insert(
            format!("{POD_ANNOTATION_NS}/vulnerability.blackduck"),
            vulns.to_json(),
        );
        annotations.insert(
            format!("{POD_ANNOTATION_NS}/policy.blackduck"),
            policy.to_json(),
        );
        annotations
    }
}

/// The structured summary object embedded as a JSON annotation value,
/// following the OpenShift container-security annotation convention.
///
/// The `timestamp` is wall-clock time at construction and is ignored by
/// [`SecuritySummary::matches`] so that repeated reconciliations remain
/// idempotent.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct SecuritySummary {
    pub name: String,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub reference: String,
    pub compliant: bool,
    pub summary: BTreeMap<String, String>,
}

impl SecuritySummary {
    pub fn vulnerability(has_vulns: bool, url: &str, count: u64) -> Self {
        Self::new("Vulnerability Info", "high", has_vulns, url, count)
    }

    pub fn policy(has_violations: bool, url: &str, count: u64) -> Self {
        Self::new("Policy Info", "important", has_violations, url, count)
    }

    fn new(description: &str, severity: &str, has_finding: bool, url: &str, count: u64) -> Self {
        let mut summary = BTreeMap::new();
        summary.insert("label".to_string(), severity.to_string());
        summary.insert("score".to_string(), count.to_string());
        summary.insert("severityIndex".to_string(), "1".to_string());
        Self {
            name: "blackducksoftware".to_string(),
            description: description.to_string(),
            timestamp: Utc::now(),
            reference: url.to_string(),
            compliant: !has_finding,
            summary,
        }
    }

    pub fn from_json(value: &str) -> Option<Self> {
        serde_json::from_str(value).ok()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Field-wise equality, ignoring the embedded timestamp.
    pub fn matches(&self, other: &Self) -> bool {
        self.name == other.name
            && self.description == other.description
            && self.reference == other.reference
            && self.compliant == other.compliant
            && self.summary == other.summary
    }
}

/// Compares two annotation values that may hold serialized summaries.
///
/// When both parse as [`SecuritySummary`] the comparison is structural
/// and timestamp-insensitive; otherwise it falls back to raw string
/// equality.
pub fn summary_values_equal(current: &str, desired: &str) -> bool {
    match (
        SecuritySummary::from_json(current),
        SecuritySummary::from_json(desired),
    ) {
        (Some(current), Some(desired)) => current.matches(&desired),
        _ => current == desired,
    }
}
