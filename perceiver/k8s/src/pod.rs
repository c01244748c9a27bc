//! Pod perceiver backend: reconciles scan results onto pod metadata and
//! snapshots the cluster pod inventory for the coordinator.

use crate::adapter_error;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    Client, ResourceExt,
};
use perceiver_annotate::{AdapterError, Inventory, InventorySource, TargetAdapter};
use perceiver_core::{
    api::{ContainerDescriptor, ImageRef, PodDescriptor, ScanResults},
    matcher::find_pod,
    parse_image_id, parse_repo_tag, KvMap, PodFacts,
};
use serde_json::json;
use tracing::warn;

/// Reconciles labels and annotations onto cluster pods.
#[derive(Clone)]
pub struct PodAdapter {
    client: Client,
}

impl PodAdapter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TargetAdapter for PodAdapter {
    type Target = Pod;

    fn kind(&self) -> &'static str {
        "pod"
    }

    async fn list(&self) -> Result<Vec<Pod>, AdapterError> {
        let pods = Api::<Pod>::all(self.client.clone())
            .list(&ListParams::default())
            .await
            .map_err(|error| adapter_error("pods", error))?;
        Ok(pods.items)
    }

    fn name(&self, pod: &Pod) -> String {
        format!("{}/{}", pod.namespace().unwrap_or_default(), pod.name_any())
    }

    fn image_ids(&self, pod: &Pod) -> Vec<String> {
        container_image_ids(pod)
    }

    fn labels(&self, pod: &Pod) -> KvMap {
        pod.metadata.labels.clone().unwrap_or_default()
    }

    fn annotations(&self, pod: &Pod) -> KvMap {
        pod.metadata.annotations.clone().unwrap_or_default()
    }

    fn base_maps(&self, pod: &Pod, results: &ScanResults) -> Option<(KvMap, KvMap)> {
        let record = find_pod(
            &pod.name_any(),
            &pod.namespace().unwrap_or_default(),
            &results.pods,
        )?;
        let facts = PodFacts::from_record(record);
        Some((facts.labels(), facts.annotations()))
    }

    async fn apply(
        &self,
        pod: &Pod,
        labels: KvMap,
        annotations: KvMap,
    ) -> Result<(), AdapterError> {
        let name = pod.name_any();
        let namespace = pod
            .namespace()
            .ok_or_else(|| AdapterError::NotFound(name.clone()))?;
        let patch = json!({
            "metadata": {
                "labels": labels,
                "annotations": annotations,
            }
        });
        Api::<Pod>::namespaced(self.client.clone(), &namespace)
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|error| adapter_error(&format!("{namespace}/{name}"), error))?;
        Ok(())
    }
}

/// Snapshots the cluster's pods for the coordinator inventory.
#[derive(Clone)]
pub struct PodInventory {
    client: Client,
}

impl PodInventory {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl InventorySource for PodInventory {
    fn kind(&self) -> &'static str {
        "pod"
    }

    async fn snapshot(&self) -> Result<Inventory, AdapterError> {
        let pods = Api::<Pod>::all(self.client.clone())
            .list(&ListParams::default())
            .await
            .map_err(|error| adapter_error("pods", error))?;

        let mut descriptors = Vec::with_capacity(pods.items.len());
        for pod in &pods.items {
            match describe_pod(pod) {
                Ok(descriptor) => descriptors.push(descriptor),
                Err(error) => {
                    let namespace = pod.namespace().unwrap_or_default();
                    let name = pod.name_any();
                    warn!(%namespace, %name, %error, "skipping pod with unusable image identity");
                }
            }
        }
        Ok(Inventory::Pods(descriptors))
    }
}

/// Image IDs reported by the pod's container statuses. Containers that
/// have not pulled yet report an empty ID and are picked up on a later
/// tick.
fn container_image_ids(pod: &Pod) -> Vec<String> {
    pod.status
        .as_ref()
        .and_then(|status| status.container_statuses.as_ref())
        .map(|statuses| {
            statuses
                .iter()
                .map(|status| status.image_id.clone())
                .filter(|id| !id.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Maps a pod into the coordinator's inventory shape. Containers that
/// have not pulled an image yet are omitted; a malformed image ID fails
/// the whole pod so a half-described pod is never reported.
fn describe_pod(pod: &Pod) -> anyhow::Result<PodDescriptor> {
    let mut containers = Vec::new();
    if let Some(statuses) = pod
        .status
        .as_ref()
        .and_then(|status| status.container_statuses.as_ref())
    {
        for status in statuses {
            if status.image_id.is_empty() {
                continue;
            }
            let (repository, content_hash) = parse_image_id(&status.image_id)?;
            let (_, tag) = parse_repo_tag(&status.image);
            containers.push(ContainerDescriptor {
                name: status.name.clone(),
                image: ImageRef::new(repository, tag, content_hash),
            });
        }
    }
    Ok(PodDescriptor {
        name: pod.name_any(),
        namespace: pod.namespace().unwrap_or_default(),
        uid: pod.uid().unwrap_or_default(),
        containers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use perceiver_core::api::ScannedPod;

    const SHA: &str = "cb4983d8399a59bb5ee6e68b6177d878966a8fe41abe18a45c3b1d8809f1d043";

    fn running_pod() -> Pod {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "web-1",
                "namespace": "prod",
                "uid": "uid-123",
                "labels": {"app": "web"},
            },
            "status": {
                "containerStatuses": [
                    {
                        "name": "web",
                        "image": "registry.example.com:5000/team/web:1.2",
                        "imageID": format!("docker-pullable://registry.example.com:5000/team/web@sha256:{SHA}"),
                        "ready": true,
                        "restartCount": 0,
                        "imagePullPolicy": "IfNotPresent",
                    },
                    {
                        "name": "init-wait",
                        "image": "busybox:latest",
                        "imageID": "",
                        "ready": false,
                        "restartCount": 0,
                        "imagePullPolicy": "IfNotPresent",
                    },
                ],
            },
        }))
        .expect("pod must deserialize")
    }

    #[test]
    fn image_ids_skip_unpulled_containers() {
        let ids = container_image_ids(&running_pod());
        assert_eq!(ids.len(), 1);
        assert!(ids[0].contains("team/web@sha256:"));
    }

    #[test]
    fn describe_pod_maps_containers_and_tags() {
        let descriptor = describe_pod(&running_pod()).expect("must describe");
        assert_eq!(descriptor.name, "web-1");
        assert_eq!(descriptor.namespace, "prod");
        assert_eq!(descriptor.uid, "uid-123");
        assert_eq!(descriptor.containers.len(), 1);

        let container = &descriptor.containers[0];
        assert_eq!(container.name, "web");
        assert_eq!(container.image.repository, "registry.example.com:5000/team/web");
        assert_eq!(container.image.tag, "1.2");
        assert_eq!(container.image.content_hash, SHA);
    }

    #[test]
    fn describe_pod_rejects_malformed_image_ids() {
        let mut pod = running_pod();
        if let Some(statuses) = pod
            .status
            .as_mut()
            .and_then(|status| status.container_statuses.as_mut())
        {
            statuses[0].image_id = "no-digest-here".to_string();
        }
        assert!(describe_pod(&pod).is_err());
    }

    #[test]
    fn base_maps_match_pods_by_name_and_namespace() {
        let pod = running_pod();
        let results = ScanResults {
            pods: vec![ScannedPod {
                name: "web-1".to_string(),
                namespace: "prod".to_string(),
                policy_violation_count: 1,
                vulnerability_count: 0,
                overall_status: "IN_VIOLATION".to_string(),
            }],
            images: Vec::new(),
        };
        let record = find_pod(
            &pod.name_any(),
            &pod.namespace().unwrap_or_default(),
            &results.pods,
        )
        .expect("pod record must match");
        let facts = PodFacts::from_record(record);
        assert_eq!(
            facts.labels()["com.blackducksoftware.pod.policy-violations"],
            "1"
        );
    }
}
