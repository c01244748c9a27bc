//! OpenShift image perceiver backend.
//!
//! `image.openshift.io/v1` Image objects are cluster-scoped and named by
//! their manifest digest (`sha256:<hex>`). k8s-openapi does not model
//! them, so the resource is declared here with just the fields the
//! perceiver reads.

use crate::adapter_error;
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    core::{ClusterResourceScope, Resource},
    Client, ResourceExt,
};
use perceiver_annotate::{AdapterError, Inventory, InventorySource, TargetAdapter};
use perceiver_core::{api::ImageRef, parse_repo_tag, KvMap};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::borrow::Cow;
use tracing::warn;

/// An OpenShift Image, reduced to the metadata the perceiver touches
/// plus the pull reference it derives the repository name from.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_image_reference: Option<String>,
}

impl Resource for Image {
    type DynamicType = ();
    type Scope = ClusterResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        "Image".into()
    }

    fn group(_: &()) -> Cow<'_, str> {
        "image.openshift.io".into()
    }

    fn version(_: &()) -> Cow<'_, str> {
        "v1".into()
    }

    fn plural(_: &()) -> Cow<'_, str> {
        "images".into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Canonical `<repository>@sha256:<hex>` identity for an Image.
///
/// The digest comes from the object name, never from the pull reference,
/// so a reference pointing at a different digest cannot attach someone
/// else's scan results to this image.
fn image_identity(image: &Image) -> Option<String> {
    let hex = image.metadata.name.as_deref()?.strip_prefix("sha256:")?;
    if hex.is_empty() {
        return None;
    }
    let reference = image.docker_image_reference.as_deref()?;
    let repo_tag = match reference.split_once('@') {
        Some((repo_tag, _)) => repo_tag,
        None => reference,
    };
    let (repository, _) = parse_repo_tag(repo_tag);
    Some(format!("{repository}@sha256:{hex}"))
}

/// Reconciles labels and annotations onto OpenShift Image objects.
#[derive(Clone)]
pub struct ImageAdapter {
    client: Client,
}

impl ImageAdapter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TargetAdapter for ImageAdapter {
    type Target = Image;

    fn kind(&self) -> &'static str {
        "image"
    }

    async fn list(&self) -> Result<Vec<Image>, AdapterError> {
        let images = Api::<Image>::all(self.client.clone())
            .list(&ListParams::default())
            .await
            .map_err(|error| adapter_error("images", error))?;
        Ok(images.items)
    }

    fn name(&self, image: &Image) -> String {
        image.name_any()
    }

    fn image_ids(&self, image: &Image) -> Vec<String> {
        match image_identity(image) {
            Some(identity) => vec![identity],
            None => {
                warn!(name = %image.name_any(), "image has no usable digest identity");
                Vec::new()
            }
        }
    }

    fn labels(&self, image: &Image) -> KvMap {
        image.metadata.labels.clone().unwrap_or_default()
    }

    fn annotations(&self, image: &Image) -> KvMap {
        image.metadata.annotations.clone().unwrap_or_default()
    }

    // One image per object, so keys carry no container ordinal.
    fn positional_names(&self) -> bool {
        false
    }

    async fn apply(
        &self,
        image: &Image,
        labels: KvMap,
        annotations: KvMap,
    ) -> Result<(), AdapterError> {
        let name = image.name_any();
        let patch = json!({
            "metadata": {
                "labels": labels,
                "annotations": annotations,
            }
        });
        Api::<Image>::all(self.client.clone())
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|error| adapter_error(&name, error))?;
        Ok(())
    }
}

/// Snapshots the cluster's Image objects for the coordinator inventory.
#[derive(Clone)]
pub struct ImageInventory {
    client: Client,
}

impl ImageInventory {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl InventorySource for ImageInventory {
    fn kind(&self) -> &'static str {
        "image"
    }

    async fn snapshot(&self) -> Result<Inventory, AdapterError> {
        let images = Api::<Image>::all(self.client.clone())
            .list(&ListParams::default())
            .await
            .map_err(|error| adapter_error("images", error))?;

        let mut refs = Vec::with_capacity(images.items.len());
        for image in &images.items {
            match describe_image(image) {
                Some(image_ref) => refs.push(image_ref),
                None => {
                    warn!(name = %image.name_any(), "skipping image with unusable identity");
                }
            }
        }
        Ok(Inventory::Images(refs))
    }
}

fn describe_image(image: &Image) -> Option<ImageRef> {
    let hex = image.metadata.name.as_deref()?.strip_prefix("sha256:")?;
    if hex.is_empty() {
        return None;
    }
    let reference = image.docker_image_reference.as_deref()?;
    let repo_tag = match reference.split_once('@') {
        Some((repo_tag, _)) => repo_tag,
        None => reference,
    };
    let (repository, tag) = parse_repo_tag(repo_tag);
    Some(ImageRef::new(repository, tag, hex))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA: &str = "cb4983d8399a59bb5ee6e68b6177d878966a8fe41abe18a45c3b1d8809f1d043";

    fn openshift_image(reference: &str) -> Image {
        Image {
            metadata: ObjectMeta {
                name: Some(format!("sha256:{SHA}")),
                ..Default::default()
            },
            docker_image_reference: Some(reference.to_string()),
        }
    }

    #[test]
    fn identity_prefers_digest_from_the_object_name() {
        let image = openshift_image(&format!(
            "registry.default.svc:5000/team/web@sha256:{}",
            "0".repeat(64)
        ));
        assert_eq!(
            image_identity(&image).expect("must resolve"),
            format!("registry.default.svc:5000/team/web@sha256:{SHA}")
        );
    }

    #[test]
    fn identity_handles_tagged_references() {
        let image = openshift_image("registry.default.svc:5000/team/web:1.2");
        assert_eq!(
            image_identity(&image).expect("must resolve"),
            format!("registry.default.svc:5000/team/web@sha256:{SHA}")
        );
    }

    #[test]
    fn identity_rejects_non_digest_names() {
        let mut image = openshift_image("team/web:1.2");
        image.metadata.name = Some("not-a-digest".to_string());
        assert!(image_identity(&image).is_none());

        image.metadata.name = None;
        assert!(image_identity(&image).is_none());
    }

    #[test]
    fn describe_image_carries_repo_tag_and_hash() {
        let image = openshift_image("registry.default.svc:5000/team/web:1.2");
        let image_ref = describe_image(&image).expect("must describe");
        assert_eq!(image_ref.repository, "registry.default.svc:5000/team/web");
        assert_eq!(image_ref.tag, "1.2");
        assert_eq!(image_ref.content_hash, SHA);
        assert_eq!(image_ref.priority, 1);
    }

    #[test]
    fn images_deserialize_from_cluster_json() {
        let image: Image = serde_json::from_value(json!({
            "apiVersion": "image.openshift.io/v1",
            "kind": "Image",
            "metadata": {
                "name": format!("sha256:{SHA}"),
                "annotations": {"owner": "team"},
            },
            "dockerImageReference": format!("quay.example.com/team/web@sha256:{SHA}"),
        }))
        .expect("image must deserialize");
        assert_eq!(
            image.docker_image_reference.as_deref(),
            Some(format!("quay.example.com/team/web@sha256:{SHA}").as_str())
        );
    }
}
