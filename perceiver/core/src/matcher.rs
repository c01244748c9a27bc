//! Matches a target's image identity against the coordinator's scan
//! records.

use crate::api::{ScanRecord, ScannedPod};

/// Finds the first record whose repository name and content hash both
/// match exactly (case-sensitive), in received order.
///
/// `None` is not an error: it means the image has not been scanned yet
/// and the caller should skip it this tick.
pub fn find_match<'r>(name: &str, hash: &str, records: &'r [ScanRecord]) -> Option<&'r ScanRecord> {
    records
        .iter()
        .find(|record| record.repository_name == name && record.content_hash == hash)
}

/// Finds the pod-level record for a (name, namespace) pair.
pub fn find_pod<'r>(name: &str, namespace: &str, pods: &'r [ScannedPod]) -> Option<&'r ScannedPod> {
    pods.iter()
        .find(|pod| pod.name == name && pod.namespace == namespace)
}
