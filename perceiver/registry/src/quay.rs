//! Quay backend: scan results land as manifest labels, keyed lowercase
//! because Quay rejects uppercase label keys.

use crate::{auth::RegistryAuth, error::RegistryError};
use perceiver_annotate::Metrics;
use perceiver_client::Coordinator;
use perceiver_core::{api::ScanRecord, mapdiff, KvMap};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time;
use tracing::{debug, info, warn};

/// Label keys owned by this perceiver on Quay manifests.
const LABEL_POLICY: &str = "blackduck.policyviolations";
const LABEL_VULNS: &str = "blackduck.vulnerabilities";
const LABEL_STATUS: &str = "blackduck.overallstatus";
const LABEL_COMPONENTS: &str = "blackduck.componentsurl";

/// One label as returned by the manifest labels endpoint.
#[derive(Clone, Debug, Deserialize)]
pub struct QuayLabel {
    pub id: String,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Default, Deserialize)]
struct LabelList {
    #[serde(default)]
    labels: Vec<QuayLabel>,
}

#[derive(Serialize)]
struct NewLabel<'a> {
    media_type: &'static str,
    key: &'a str,
    value: &'a str,
}

/// One tag row from the repository tag listing.
#[derive(Clone, Debug, Deserialize)]
pub struct QuayTag {
    pub name: String,
    #[serde(default)]
    pub manifest_digest: String,
}

#[derive(Debug, Default, Deserialize)]
struct TagPage {
    #[serde(default)]
    tags: Vec<QuayTag>,
}

/// HTTP client for one Quay instance, authenticated by a bearer token.
#[derive(Clone)]
pub struct QuayClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl QuayClient {
    /// Probes the instance (https first) and returns a client bound to
    /// the base URL that accepted the token.
    pub async fn connect(
        host: &str,
        token: &str,
        timeout: Duration,
    ) -> Result<Self, RegistryError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| RegistryError::Request {
                url: host.to_string(),
                source,
            })?;

        let mut token_rejected = false;
        let mut last_error = None;
        for base_url in [format!("https://{host}"), format!("http://{host}")] {
            let url = format!("{base_url}/api/v1/user");
            let response = http.get(&url).bearer_auth(token).send().await;
            match response {
                Ok(response) if response.status().is_success() => {
                    debug!(%base_url, "quay ping succeeded");
                    return Ok(Self {
                        http,
                        base_url,
                        token: token.to_string(),
                    });
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    debug!(%url, status, "quay ping rejected");
                    if status == 401 || status == 403 {
                        token_rejected = true;
                    }
                    last_error = Some(RegistryError::Status { url, status });
                }
                Err(error) => {
                    debug!(%url, %error, "quay ping failed");
                    last_error = Some(RegistryError::Request { url, source: error });
                }
            }
        }
        if token_rejected {
            return Err(RegistryError::Auth {
                url: host.to_string(),
            });
        }
        Err(last_error.unwrap_or(RegistryError::Auth {
            url: host.to_string(),
        }))
    }

    async fn get_json<T: Default + serde::de::DeserializeOwned>(
        &self,
        url: String,
    ) -> Result<T, RegistryError> {
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|source| RegistryError::Request {
                url: url.clone(),
                source,
            })?;
        let status = response.status();
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

    fn labels_url(&self, repo: &str, digest_hex: &str) -> String {
        format!(
            "{}/api/v1/repository/{repo}/manifest/sha256:{digest_hex}/labels",
            self.base_url
        )
    }

    /// All labels currently on a manifest.
    pub async fn manifest_labels(
        &self,
        repo: &str,
        digest_hex: &str,
    ) -> Result<Vec<QuayLabel>, RegistryError> {
        let list: LabelList = self.get_json(self.labels_url(repo, digest_hex)).await?;
        Ok(list.labels)
    }

    /// Adds one label to a manifest; Quay answers 201 on success.
    pub async fn add_label(
        &self,
        repo: &str,
        digest_hex: &str,
        key: &str,
        value: &str,
    ) -> Result<(), RegistryError> {
        let url = self.labels_url(repo, digest_hex);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&NewLabel {
                media_type: "text/plain",
                key,
                value,
            })
            .send()
            .await
            .map_err(|source| RegistryError::Request {
                url: url.clone(),
                source,
            })?;
        let status = response.status();
        if status.as_u16() != 201 {
            return Err(RegistryError::Status {
                url,
                status: status.as_u16(),
            });
        }
        Ok(())
    }

    /// Deletes one label by id; Quay answers 204 on success.
    pub async fn delete_label(
        &self,
        repo: &str,
        digest_hex: &str,
        label_id: &str,
    ) -> Result<(), RegistryError> {
        let url = format!("{}/{label_id}", self.labels_url(repo, digest_hex));
        let response = self
            .http
            .delete(&url)
            .bearer_auth(&self.token)
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

    /// The repository's tags with their manifest digests.
    pub async fn tags(&self, repo: &str) -> Result<Vec<QuayTag>, RegistryError> {
        let url = format!("{}/api/v1/repository/{repo}/tag", self.base_url);
        let page: TagPage = self.get_json(url).await?;
        Ok(page.tags)
    }
}

/// The label map a scan record should leave on its manifests.
pub(crate) fn desired_labels(record: &ScanRecord) -> KvMap {
    let mut labels = KvMap::new();
    labels.insert(LABEL_COMPONENTS.to_string(), record.components_url.clone());
    labels.insert(
        LABEL_POLICY.to_string(),
        record.policy_violation_count.to_string(),
    );
    labels.insert(LABEL_STATUS.to_string(), record.overall_status.clone());
    labels.insert(
        LABEL_VULNS.to_string(),
        record.vulnerability_count.to_string(),
    );
    labels
}

/// If the record's repository lives on this registry host, the
/// repository path relative to the host; `None` otherwise.
pub(crate) fn repo_on_registry(repository: &str, host: &str) -> Option<String> {
    let (repo_host, path) = repository.split_once('/')?;
    if repo_host == host && !path.is_empty() {
        Some(path.to_string())
    } else {
        None
    }
}

/// Writes scan results onto matching Quay manifests as labels. Only the
/// owned `blackduck.*` keys are ever rewritten; other labels are left
/// alone. A registry that rejects the token is skipped for the tick.
pub struct QuayAnnotator {
    coordinator: Coordinator,
    registries: Vec<RegistryAuth>,
    token: String,
    metrics: Metrics,
    interval: Duration,
    timeout: Duration,
}

impl QuayAnnotator {
    pub fn new(
        coordinator: Coordinator,
        registries: Vec<RegistryAuth>,
        token: String,
        metrics: Metrics,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            coordinator,
            registries,
            token,
            metrics,
            interval,
            timeout,
        }
    }

    pub async fn run(self, shutdown: drain::Watch) {
        info!(registries = self.registries.len(), "starting quay annotator loop");
        loop {
            tokio::select! {
                _ = time::sleep(self.interval) => {}
                _ = shutdown.clone().signaled() => {
                    debug!("quay annotator loop shutting down");
                    return;
                }
            }

            self.metrics.record_tick("quay");
            if let Err(error) = self.tick().await {
                self.metrics.record_error("quay", "fetch");
                warn!(%error, "quay annotation pass failed");
            }
        }
    }

    async fn tick(&self) -> anyhow::Result<()> {
        let results = self.coordinator.scan_results().await?;
        for auth in &self.registries {
            let client = match QuayClient::connect(auth.host(), &self.token, self.timeout).await {
                Ok(client) => client,
                Err(error) => {
                    self.metrics.record_error("quay", "auth");
                    warn!(registry = %auth.url, %error, "skipping registry for this pass");
                    continue;
                }
            };
            for record in &results.images {
                let repo = match repo_on_registry(&record.repository_name, auth.host()) {
                    Some(repo) => repo,
                    None => continue,
                };
                if let Err(error) = self.annotate_manifest(&client, &repo, record).await {
                    self.metrics.record_error("quay", "update");
                    warn!(
                        registry = %auth.url,
                        repository = %record.repository_name,
                        %error,
                        "failed to label manifest"
                    );
                }
            }
        }
        Ok(())
    }

    async fn annotate_manifest(
        &self,
        client: &QuayClient,
        repo: &str,
        record: &ScanRecord,
    ) -> Result<(), RegistryError> {
        let labels = client.manifest_labels(repo, &record.content_hash).await?;
        let current: KvMap = labels
            .iter()
            .map(|label| (label.key.clone(), label.value.clone()))
            .collect();
        let desired = desired_labels(record);
        if mapdiff::contains(&current, &desired) {
            return Ok(());
        }

        // Replace only the owned keys whose value changed; Quay labels
        // are immutable, so an update is a delete plus an add.
        for (key, value) in &desired {
            if current.get(key) == Some(value) {
                continue;
            }
            for stale in labels.iter().filter(|label| &label.key == key) {
                client
                    .delete_label(repo, &record.content_hash, &stale.id)
                    .await?;
            }
            client
                .add_label(repo, &record.content_hash, key, value)
                .await?;
        }
        self.metrics.record_update("quay");
        info!(repository = %record.repository_name, %repo, "updated manifest labels");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    fn record() -> ScanRecord {
        ScanRecord {
            repository_name: "quay.example.com/team/web".to_string(),
            content_hash: "abc123".to_string(),
            policy_violation_count: 0,
            vulnerability_count: 7,
            overall_status: "NOT_IN_VIOLATION".to_string(),
            components_url: "https://hub.example.com/ui/projects/web".to_string(),
            scanner_metadata_version: "5.0.0".to_string(),
            coordinator_version: "2.0.0".to_string(),
        }
    }

    #[test]
    fn desired_labels_use_lowercase_keys() {
        let labels = desired_labels(&record());
        assert_eq!(
            labels,
            btreemap! {
                "blackduck.componentsurl".to_string() => "https://hub.example.com/ui/projects/web".to_string(),
                "blackduck.policyviolations".to_string() => "0".to_string(),
                "blackduck.overallstatus".to_string() => "NOT_IN_VIOLATION".to_string(),
                "blackduck.vulnerabilities".to_string() => "7".to_string(),
            }
        );
    }

    #[test]
    fn repositories_match_only_their_own_registry() {
        assert_eq!(
            repo_on_registry("quay.example.com/team/web", "quay.example.com").as_deref(),
            Some("team/web")
        );
        assert_eq!(
            repo_on_registry("other.example.com/team/web", "quay.example.com"),
            None
        );
        assert_eq!(repo_on_registry("no-host-segment", "quay.example.com"), None);
        assert_eq!(repo_on_registry("quay.example.com/", "quay.example.com"), None);
    }

    #[test]
    fn up_to_date_labels_pass_the_contains_check() {
        let desired = desired_labels(&record());
        let mut current = desired.clone();
        current.insert("maintainer".to_string(), "team@example.com".to_string());
        assert!(mapdiff::contains(&current, &desired));

        current.remove("blackduck.vulnerabilities");
        assert!(!mapdiff::contains(&current, &desired));
    }

    #[tokio::test]
    async fn unreachable_registry_yields_request_error() {
        match QuayClient::connect("192.0.2.1:1", "token", Duration::from_millis(100)).await {
            Err(RegistryError::Request { .. }) => {}
            other => panic!("expected request error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn rejected_token_yields_auth_error() {
        let addr = crate::testutil::stub_server("HTTP/1.1 401 Unauthorized").await;
        let host = addr.to_string();
        match QuayClient::connect(&host, "bad-token", Duration::from_secs(5)).await {
            Err(RegistryError::Auth { url }) => assert_eq!(url, host),
            other => panic!("expected auth error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn non_auth_ping_failures_keep_their_status() {
        let addr = crate::testutil::stub_server("HTTP/1.1 502 Bad Gateway").await;
        match QuayClient::connect(&addr.to_string(), "token", Duration::from_secs(5)).await {
            Err(RegistryError::Status { status, .. }) => assert_eq!(status, 502),
            other => panic!("expected status error, got {:?}", other.map(|_| ())),
        }
    }
}
