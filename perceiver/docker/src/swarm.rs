use crate::client::{SwarmClient, SwarmClientError, SwarmService};
use async_trait::async_trait;
use perceiver_annotate::{AdapterError, Inventory, InventorySource, TargetAdapter};
use perceiver_core::{
    api::{ContainerDescriptor, ImageRef, PodDescriptor, ScanResults},
    matcher::find_pod,
    parse_swarm_image, KvMap, PodFacts,
};
use tracing::warn;

/// Namespace swarm services are reported under; swarm itself has no
/// namespace concept.
pub const SWARM_NAMESPACE: &str = "swarm";

fn adapter_error(name: &str, error: SwarmClientError) -> AdapterError {
    match &error {
        SwarmClientError::Status { status: 404, .. } => AdapterError::NotFound(name.to_string()),
        SwarmClientError::Status { status: 409, .. } => AdapterError::Conflict(name.to_string()),
        SwarmClientError::Status {
            status: 401 | 403, ..
        } => AdapterError::Auth(name.to_string()),
        _ => AdapterError::Other(error.into()),
    }
}

/// Reconciles labels onto swarm service specs. Services carry no
/// annotations, so the annotation half of each reconciliation is empty.
#[derive(Clone)]
pub struct SwarmAdapter {
    client: SwarmClient,
}

impl SwarmAdapter {
    pub fn new(client: SwarmClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TargetAdapter for SwarmAdapter {
    type Target = SwarmService;

    fn kind(&self) -> &'static str {
        "swarm"
    }

    async fn list(&self) -> Result<Vec<SwarmService>, AdapterError> {
        self.client
            .list_services()
            .await
            .map_err(|error| adapter_error("services", error))
    }

    fn name(&self, service: &SwarmService) -> String {
        service.spec.name.clone()
    }

    fn image_ids(&self, service: &SwarmService) -> Vec<String> {
        vec![canonical_image_id(
            &service.spec.task_template.container_spec.image,
        )]
    }

    fn labels(&self, service: &SwarmService) -> KvMap {
        service.spec.labels.clone()
    }

    fn annotations(&self, _service: &SwarmService) -> KvMap {
        KvMap::new()
    }

    fn base_maps(&self, service: &SwarmService, results: &ScanResults) -> Option<(KvMap, KvMap)> {
        let record = find_pod(&service.spec.name, SWARM_NAMESPACE, &results.pods)?;
        let facts = PodFacts::from_record(record);
        Some((facts.labels(), KvMap::new()))
    }

    fn supports_annotations(&self) -> bool {
        false
    }

    async fn apply(
        &self,
        service: &SwarmService,
        labels: KvMap,
        _annotations: KvMap,
    ) -> Result<(), AdapterError> {
        let mut spec = service.spec.clone();
        spec.labels = labels;
        self.client
            .update_service(&service.id, service.version.index, &spec)
            .await
            .map_err(|error| adapter_error(&service.spec.name, error))
    }
}

/// Normalizes a swarm image string (`repo[:tag]@sha256:hex`) to the
/// canonical `repo@sha256:hex` identity. Strings without a digest pass
/// through unchanged and fail identity parsing downstream, where the
/// failure is logged and counted.
fn canonical_image_id(raw: &str) -> String {
    match parse_swarm_image(raw) {
        Ok((repo, _, hex)) => format!("{repo}@sha256:{hex}"),
        Err(_) => raw.to_string(),
    }
}

/// Snapshots swarm services as pod-shaped inventory entries.
#[derive(Clone)]
pub struct SwarmInventory {
    client: SwarmClient,
}

impl SwarmInventory {
    pub fn new(client: SwarmClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl InventorySource for SwarmInventory {
    fn kind(&self) -> &'static str {
        "swarm"
    }

    async fn snapshot(&self) -> Result<Inventory, AdapterError> {
        let services = self
            .client
            .list_services()
            .await
            .map_err(|error| adapter_error("services", error))?;

        let mut pods = Vec::with_capacity(services.len());
        for service in &services {
            match describe_service(service) {
                Some(pod) => pods.push(pod),
                None => {
                    warn!(
                        name = %service.spec.name,
                        image = %service.spec.task_template.container_spec.image,
                        "skipping service without a digest-pinned image"
                    );
                }
            }
        }
        Ok(Inventory::Pods(pods))
    }
}

fn describe_service(service: &SwarmService) -> Option<PodDescriptor> {
    let image = &service.spec.task_template.container_spec.image;
    let (repository, tag, content_hash) = parse_swarm_image(image).ok()?;
    Some(PodDescriptor {
        name: service.spec.name.clone(),
        namespace: SWARM_NAMESPACE.to_string(),
        uid: service.id.clone(),
        containers: vec![ContainerDescriptor {
            name: service.spec.name.clone(),
            image: ImageRef::new(repository, tag, content_hash),
        }],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SHA: &str = "cb4983d8399a59bb5ee6e68b6177d878966a8fe41abe18a45c3b1d8809f1d043";

    fn service(image: &str) -> SwarmService {
        serde_json::from_value(json!({
            "ID": "svc-1",
            "Version": {"Index": 4},
            "Spec": {
                "Name": "web",
                "Labels": {"team": "payments"},
                "TaskTemplate": {"ContainerSpec": {"Image": image}},
            },
        }))
        .expect("service must deserialize")
    }

    #[test]
    fn canonical_ids_drop_the_tag() {
        assert_eq!(
            canonical_image_id(&format!("team/web:1.2@sha256:{SHA}")),
            format!("team/web@sha256:{SHA}")
        );
        assert_eq!(
            canonical_image_id(&format!("team/web@sha256:{SHA}")),
            format!("team/web@sha256:{SHA}")
        );
        // No digest: passed through for downstream identity handling.
        assert_eq!(canonical_image_id("team/web:1.2"), "team/web:1.2");
    }

    #[test]
    fn describe_service_reports_a_pod_shaped_entry() {
        let pod = describe_service(&service(&format!("team/web:1.2@sha256:{SHA}")))
            .expect("must describe");
        assert_eq!(pod.name, "web");
        assert_eq!(pod.namespace, SWARM_NAMESPACE);
        assert_eq!(pod.uid, "svc-1");
        assert_eq!(pod.containers.len(), 1);
        assert_eq!(pod.containers[0].image.repository, "team/web");
        assert_eq!(pod.containers[0].image.tag, "1.2");
        assert_eq!(pod.containers[0].image.content_hash, SHA);
    }

    #[test]
    fn untagged_services_are_skipped_from_inventory() {
        assert!(describe_service(&service("team/web:latest")).is_none());
    }

    #[test]
    fn base_maps_match_by_service_name_in_the_swarm_namespace() {
        use perceiver_core::api::ScannedPod;

        let adapter_less_results = ScanResults {
            pods: vec![ScannedPod {
                name: "web".to_string(),
                namespace: SWARM_NAMESPACE.to_string(),
                policy_violation_count: 0,
                vulnerability_count: 2,
                overall_status: "NOT_IN_VIOLATION".to_string(),
            }],
            images: Vec::new(),
        };
        let record = find_pod("web", SWARM_NAMESPACE, &adapter_less_results.pods)
            .expect("record must match");
        let facts = PodFacts::from_record(record);
        assert_eq!(facts.labels()["com.blackducksoftware.pod.vulnerabilities"], "2");
    }
}
