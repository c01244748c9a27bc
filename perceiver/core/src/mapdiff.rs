//! The map-diff engine: decides whether a target's current
//! label/annotation maps already satisfy the desired maps, and merges
//! them when they do not.

use crate::annotations::{is_summary_key, summary_values_equal, RELEVANT_KEY_MARKERS};
use std::collections::BTreeMap;

/// The label/annotation map type, matching Kubernetes object metadata.
pub type KvMap = BTreeMap<String, String>;

/// Right-biased union of two maps. Neither input is mutated.
pub fn merge(base: &KvMap, overlay: &KvMap) -> KvMap {
    let mut merged = base.clone();
    for (key, value) in overlay {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Returns true iff every entry of `desired` is present in `current`
/// with an equal value.
///
/// Keys holding a serialized security summary are compared structurally,
/// ignoring the embedded timestamp; this is what keeps reconciliation
/// idempotent despite the non-deterministic field. An empty `desired`
/// is always contained.
pub fn contains(current: &KvMap, desired: &KvMap) -> bool {
    desired.iter().all(|(key, want)| match current.get(key) {
        None => false,
        Some(have) if is_summary_key(key) => summary_values_equal(have, want),
        Some(have) => have == want,
    })
}

/// Keeps only the entries whose key contains one of the given markers.
pub fn filter_relevant(map: &KvMap, markers: &[&str]) -> KvMap {
    map.iter()
        .filter(|(key, _)| markers.iter().any(|marker| key.contains(marker)))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// [`contains`], scoped to the keys this system owns: entries of
/// `desired` outside the owned namespaces are ignored.
pub fn contains_relevant(current: &KvMap, desired: &KvMap) -> bool {
    contains(current, &filter_relevant(desired, RELEVANT_KEY_MARKERS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::SecuritySummary;
    use chrono::{DateTime, Utc};
    use maplit::btreemap;

    #[test]
    fn merge_is_right_biased_and_leaves_inputs_alone() {
        let base = btreemap! {
            "a".to_string() => "1".to_string(),
            "b".to_string() => "2".to_string(),
        };
        let overlay = btreemap! {
            "b".to_string() => "20".to_string(),
            "c".to_string() => "3".to_string(),
        };
        let merged = merge(&base, &overlay);
        assert_eq!(merged["a"], "1");
        assert_eq!(merged["b"], "20");
        assert_eq!(merged["c"], "3");
        assert_eq!(base["b"], "2");
        assert_eq!(overlay.len(), 2);
    }

    #[test]
    fn contains_merge_of_any_base_with_desired_holds() {
        let base = btreemap! {
            "user-key".to_string() => "unrelated".to_string(),
            "b".to_string() => "stale".to_string(),
        };
        let desired = btreemap! {
            "b".to_string() => "fresh".to_string(),
            "c".to_string() => "3".to_string(),
        };
        assert!(contains(&merge(&base, &desired), &desired));
    }

    #[test]
    fn empty_desired_is_always_contained() {
        let current = btreemap! { "a".to_string() => "1".to_string() };
        assert!(contains(&current, &KvMap::new()));
        assert!(contains(&KvMap::new(), &KvMap::new()));
    }

    #[test]
    fn missing_or_unequal_values_fail_containment() {
        let current = btreemap! { "a".to_string() => "1".to_string() };
        assert!(!contains(&current, &btreemap! { "b".to_string() => "1".to_string() }));
        assert!(!contains(&current, &btreemap! { "a".to_string() => "2".to_string() }));
    }

    #[test]
    fn summary_keys_compare_timestamp_insensitively() {
        let key = "quality.image.openshift.io/vulnerability.blackduck".to_string();
        let mut old = SecuritySummary::vulnerability(true, "http://u", 3);
        old.timestamp = DateTime::<Utc>::MIN_UTC;
        let new = SecuritySummary::vulnerability(true, "http://u", 3);

        let current = btreemap! { key.clone() => old.to_json() };
        let desired = btreemap! { key.clone() => new.to_json() };
        assert!(contains(&current, &desired));

        let changed = SecuritySummary::vulnerability(true, "http://u", 4);
        let desired = btreemap! { key => changed.to_json() };
        assert!(!contains(&current, &desired));
    }

    #[test]
    fn filter_relevant_drops_foreign_keys() {
        let map = btreemap! {
            "com.blackducksoftware.pod.vulnerabilities".to_string() => "1".to_string(),
            "quality.pod.openshift.io/policy.blackduck".to_string() => "{}".to_string(),
            "app.kubernetes.io/name".to_string() => "web".to_string(),
        };
        let relevant = filter_relevant(&map, RELEVANT_KEY_MARKERS);
        assert_eq!(relevant.len(), 2);
        assert!(!relevant.contains_key("app.kubernetes.io/name"));
    }

    #[test]
    fn empty_current_map_is_updated_to_exactly_desired() {
        let facts = crate::ImageFacts {
            vulnerabilities: 3,
            overall_status: "IN_VIOLATION".to_string(),
            ..Default::default()
        };
        let desired = facts.annotations("", 0);
        let current = KvMap::new();
        assert!(!contains(&current, &desired));
        assert_eq!(merge(&current, &desired), desired);
    }
}
