//! Artifactory backend: scan results land as artifact properties, and a
//! periodic walk of the docker repositories feeds the coordinator's
//! scan queue.

use crate::{auth::RegistryAuth, error::RegistryError};
use perceiver_annotate::Metrics;
use perceiver_client::Coordinator;
use perceiver_core::{
    api::{ImageRef, ScanRecord},
    mapdiff, KvMap,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time;
use tracing::{debug, info, warn};

/// Property keys owned by this perceiver on Artifactory artifacts.
const PROP_POLICY: &str = "blackduck.policyViolations";
const PROP_VULNS: &str = "blackduck.vulnerabilities";
const PROP_STATUS: &str = "blackduck.overallStatus";
const PROP_COMPONENTS: &str = "blackduck.componentsURL";

#[derive(Debug, Default, Deserialize)]
struct ChecksumResults {
    #[serde(default)]
    results: Vec<ChecksumResult>,
}

#[derive(Debug, Deserialize)]
struct ChecksumResult {
    uri: String,
}

#[derive(Debug, Default, Deserialize)]
struct PropertiesResponse {
    #[serde(default)]
    properties: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RepositoryEntry {
    key: String,
}

#[derive(Debug, Default, Deserialize)]
struct Catalog {
    #[serde(default)]
    repositories: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Vec<String>,
}

/// HTTP client for one Artifactory instance, bound to a base URL that
/// has been verified by a ping.
#[derive(Clone)]
pub struct ArtifactoryClient {
    http: reqwest::Client,
    base_url: String,
    user: String,
    password: String,
}

impl ArtifactoryClient {
    /// Probes the instance and returns a client bound to the base URL
    /// that answered the ping. Instances may live under https or http
    /// and may or may not be rooted at `/artifactory`.
    pub async fn connect(auth: &RegistryAuth, timeout: Duration) -> Result<Self, RegistryError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| RegistryError::Request {
                url: auth.url.clone(),
                source,
            })?;

        let candidates = [
            format!("https://{}", auth.url),
            format!("https://{}/artifactory", auth.url),
            format!("http://{}", auth.url),
            format!("http://{}/artifactory", auth.url),
        ];
        let mut credentials_rejected = false;
        let mut last_error = None;
        for base_url in candidates {
            let url = format!("{base_url}/api/system/ping");
            let response = http
                .get(&url)
                .basic_auth(&auth.user, Some(&auth.password))
                .send()
                .await;
            match response {
                Ok(response) if response.status().is_success() => {
                    debug!(%base_url, "artifactory ping succeeded");
                    return Ok(Self {
                        http,
                        base_url,
                        user: auth.user.clone(),
                        password: auth.password.clone(),
                    });
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    debug!(%url, status, "artifactory ping rejected");
                    if status == 401 || status == 403 {
                        credentials_rejected = true;
                    }
                    last_error = Some(RegistryError::Status { url, status });
                }
                Err(error) => {
                    debug!(%url, %error, "artifactory ping failed");
                    last_error = Some(RegistryError::Request { url, source: error });
                }
            }
        }
        if credentials_rejected {
            return Err(RegistryError::Auth {
                url: auth.url.clone(),
            });
        }
        Err(last_error.unwrap_or(RegistryError::Auth {
            url: auth.url.clone(),
        }))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json<T: Default + serde::de::DeserializeOwned>(
        &self,
        url: String,
    ) -> Result<T, RegistryError> {
        let response = self
            .http
            .get(&url)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await
            .map_err(|source| RegistryError::Request {
                url: url.clone(),
                source,
            })?;
        let status = response.status();
        // Artifactory answers 404 for empty property sets and empty
        // search results alike.
        if status.as_u16() == 404 {
            return Ok(T::default());
        }
        if !status.is_success() {
            return Err(RegistryError::Status {
                url,
                status: status.as_u16(),
            });
        }
        let body = response
            .text()
            .await
            .map_err(|source| RegistryError::Request {
                url: url.clone(),
                source,
            })?;
        serde_json::from_str(&body).map_err(|source| RegistryError::Deserialize { url, source })
    }

    /// Storage URIs of every artifact whose sha256 checksum matches.
    pub async fn search_by_checksum(&self, sha256: &str) -> Result<Vec<String>, RegistryError> {
        let url = format!("{}/api/search/checksum?sha256={sha256}", self.base_url);
        let results: ChecksumResults = self.get_json(url).await?;
        Ok(results.results.into_iter().map(|r| r.uri).collect())
    }

    /// Current properties on a storage URI; an unset property set reads
    /// as empty. Multi-valued properties collapse to their first value.
    pub async fn properties(&self, storage_uri: &str) -> Result<KvMap, RegistryError> {
        let response: PropertiesResponse =
            self.get_json(format!("{storage_uri}?properties")).await?;
        Ok(response
            .properties
            .into_iter()
            .filter_map(|(key, mut values)| {
                if values.is_empty() {
                    None
                } else {
                    Some((key, values.remove(0)))
                }
            })
            .collect())
    }

    /// Sets properties on a storage URI in one PUT.
    pub async fn set_properties(
        &self,
        storage_uri: &str,
        properties: &KvMap,
    ) -> Result<(), RegistryError> {
        let url = format!("{storage_uri}?properties={}", property_query(properties));
        let response = self
            .http
            .put(&url)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await
            .map_err(|source| RegistryError::Request {
                url: url.clone(),
                source,
            })?;
        let status = response.status();
        if status.as_u16() != 204 {
            return Err(RegistryError::Status {
                url,
                status: status.as_u16(),
            });
        }
        Ok(())
    }

    /// Keys of all docker-type repositories on the instance.
    pub async fn docker_repositories(&self) -> Result<Vec<String>, RegistryError> {
        let url = format!("{}/api/repositories?packageType=docker", self.base_url);
        let entries: Vec<RepositoryEntry> = self.get_json(url).await?;
        Ok(entries.into_iter().map(|e| e.key).collect())
    }

    /// Image names in one docker repository.
    pub async fn catalog(&self, repo_key: &str) -> Result<Vec<String>, RegistryError> {
        let url = format!("{}/api/docker/{repo_key}/v2/_catalog", self.base_url);
        let catalog: Catalog = self.get_json(url).await?;
        Ok(catalog.repositories)
    }

    /// Tags of one image.
    pub async fn tags(&self, repo_key: &str, image: &str) -> Result<Vec<String>, RegistryError> {
        let url = format!(
            "{}/api/docker/{repo_key}/v2/{image}/tags/list",
            self.base_url
        );
        let tags: TagList = self.get_json(url).await?;
        Ok(tags.tags)
    }

    /// The sha256 properties recorded on one tag's manifest.
    pub async fn manifest_digests(
        &self,
        repo_key: &str,
        image: &str,
        tag: &str,
    ) -> Result<Vec<String>, RegistryError> {
        let url = format!(
            "{}/api/storage/{repo_key}/{image}/{tag}/manifest.json?properties=sha256",
            self.base_url
        );
        let response: PropertiesResponse = self.get_json(url).await?;
        Ok(response
            .properties
            .into_iter()
            .filter(|(key, _)| key == "sha256")
            .flat_map(|(_, values)| values)
            .collect())
    }
}

/// Serializes a property map into Artifactory's `k=v;k=v` query form.
fn property_query(properties: &KvMap) -> String {
    let mut query = String::new();
    for (key, value) in properties {
        query.push_str(key);
        query.push('=');
        query.push_str(value);
        query.push(';');
    }
    query
}

/// The property map a scan record should leave on its artifacts.
pub(crate) fn desired_properties(record: &ScanRecord) -> KvMap {
    let mut properties = KvMap::new();
    properties.insert(PROP_STATUS.to_string(), record.overall_status.clone());
    properties.insert(
        PROP_VULNS.to_string(),
        record.vulnerability_count.to_string(),
    );
    properties.insert(
        PROP_POLICY.to_string(),
        record.policy_violation_count.to_string(),
    );
    properties.insert(PROP_COMPONENTS.to_string(), record.components_url.clone());
    properties
}

/// Strips the `/manifest.json` leaf off a checksum-search URI, leaving
/// the storage URI properties are attached to.
fn artifact_uri(search_uri: &str) -> &str {
    search_uri.strip_suffix("/manifest.json").unwrap_or(search_uri)
}

/// Writes scan results onto matching Artifactory artifacts as
/// properties. A registry that fails its ping is skipped for the tick
/// and retried on the next one.
pub struct ArtifactoryAnnotator {
    coordinator: Coordinator,
    registries: Vec<RegistryAuth>,
    metrics: Metrics,
    interval: Duration,
    timeout: Duration,
}

impl ArtifactoryAnnotator {
    pub fn new(
        coordinator: Coordinator,
        registries: Vec<RegistryAuth>,
        metrics: Metrics,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            coordinator,
            registries,
            metrics,
            interval,
            timeout,
        }
    }

    pub async fn run(self, shutdown: drain::Watch) {
        info!(registries = self.registries.len(), "starting artifactory annotator loop");
        loop {
            tokio::select! {
                _ = time::sleep(self.interval) => {}
                _ = shutdown.clone().signaled() => {
                    debug!("artifactory annotator loop shutting down");
                    return;
                }
            }

            self.metrics.record_tick("artifactory");
            if let Err(error) = self.tick().await {
                self.metrics.record_error("artifactory", "fetch");
                warn!(%error, "artifactory annotation pass failed");
            }
        }
    }

    async fn tick(&self) -> anyhow::Result<()> {
        let results = self.coordinator.scan_results().await?;
        for auth in &self.registries {
            let client = match ArtifactoryClient::connect(auth, self.timeout).await {
                Ok(client) => client,
                Err(error) => {
                    self.metrics.record_error("artifactory", "auth");
                    warn!(registry = %auth.url, %error, "skipping registry for this pass");
                    continue;
                }
            };
            for record in &results.images {
                if let Err(error) = self.annotate_record(&client, record).await {
                    self.metrics.record_error("artifactory", "update");
                    warn!(
                        registry = %auth.url,
                        repository = %record.repository_name,
                        %error,
                        "failed to annotate artifact"
                    );
                }
            }
        }
        Ok(())
    }

    async fn annotate_record(
        &self,
        client: &ArtifactoryClient,
        record: &ScanRecord,
    ) -> Result<(), RegistryError> {
        let desired = desired_properties(record);
        for uri in client.search_by_checksum(&record.content_hash).await? {
            let uri = artifact_uri(&uri);
            let current = client.properties(uri).await?;
            if mapdiff::contains(&current, &desired) {
                continue;
            }
            client.set_properties(uri, &desired).await?;
            self.metrics.record_update("artifactory");
            info!(
                repository = %record.repository_name,
                %uri,
                "updated artifact properties"
            );
        }
        Ok(())
    }
}

/// Walks every docker repository on each registry and enqueues the
/// images it finds for scanning. Discovery runs at startup and then on
/// the interval; the coordinator dedups, so re-submission is harmless.
pub struct ArtifactoryController {
    coordinator: Coordinator,
    registries: Vec<RegistryAuth>,
    metrics: Metrics,
    interval: Duration,
    timeout: Duration,
}

impl ArtifactoryController {
    pub fn new(
        coordinator: Coordinator,
        registries: Vec<RegistryAuth>,
        metrics: Metrics,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            coordinator,
            registries,
            metrics,
            interval,
            timeout,
        }
    }

    pub async fn run(self, shutdown: drain::Watch) {
        info!(registries = self.registries.len(), "starting artifactory discovery loop");
        loop {
            self.metrics.record_tick("artifactory_discovery");
            if let Err(error) = self.tick().await {
                self.metrics.record_error("artifactory_discovery", "walk");
                warn!(%error, "artifactory discovery pass failed");
            }

            tokio::select! {
                _ = time::sleep(self.interval) => {}
                _ = shutdown.clone().signaled() => {
                    debug!("artifactory discovery loop shutting down");
                    return;
                }
            }
        }
    }

    async fn tick(&self) -> anyhow::Result<()> {
        for auth in &self.registries {
            let client = match ArtifactoryClient::connect(auth, self.timeout).await {
                Ok(client) => client,
                Err(error) => {
                    self.metrics.record_error("artifactory_discovery", "auth");
                    warn!(registry = %auth.url, %error, "skipping registry for this pass");
                    continue;
                }
            };
            if let Err(error) = self.walk_registry(auth, &client).await {
                self.metrics.record_error("artifactory_discovery", "walk");
                warn!(registry = %auth.url, %error, "registry walk failed");
            }
        }
        Ok(())
    }

    async fn walk_registry(
        &self,
        auth: &RegistryAuth,
        client: &ArtifactoryClient,
    ) -> anyhow::Result<()> {
        let mut discovered = 0usize;
        for repo_key in client.docker_repositories().await? {
            for image in client.catalog(&repo_key).await? {
                for tag in client.tags(&repo_key, &image).await? {
                    for digest in client.manifest_digests(&repo_key, &image, &tag).await? {
                        let image_ref = discovered_image(&auth.url, &repo_key, &image, &tag, &digest);
                        self.coordinator.enqueue_image(&image_ref).await?;
                        discovered += 1;
                    }
                }
            }
        }
        info!(registry = %auth.url, discovered, "finished registry walk");
        Ok(())
    }
}

/// An image found by the discovery walk, queued at background priority
/// so webhook-driven submissions scan first.
pub(crate) fn discovered_image(
    registry_url: &str,
    repo_key: &str,
    image: &str,
    tag: &str,
    digest: &str,
) -> ImageRef {
    let repository = format!("{registry_url}/{repo_key}/{image}");
    let mut image_ref = ImageRef::new(repository.clone(), tag, digest);
    image_ref.priority = 0;
    image_ref.project_name = Some(repository);
    image_ref.project_version = Some(tag.to_string());
    image_ref
}
