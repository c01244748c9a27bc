//! Minimal Docker Engine API client for swarm services.
//!
//! Only the fields the perceiver reads are modeled explicitly; the rest
//! of each service spec is captured verbatim so a label update never
//! clobbers configuration this crate does not understand.

use perceiver_core::KvMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SwarmClientError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("could not decode response from {url}: {source}")]
    Deserialize {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// One swarm service as listed by `GET /services`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SwarmService {
    #[serde(rename = "ID")]
    pub id: String,

    #[serde(rename = "Version")]
    pub version: ServiceVersion,

    #[serde(rename = "Spec")]
    pub spec: ServiceSpec,
}

/// The optimistic-concurrency version counter for service updates.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ServiceVersion {
    #[serde(rename = "Index")]
    pub index: u64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ServiceSpec {
    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "Labels", default)]
    pub labels: KvMap,

    #[serde(rename = "TaskTemplate", default)]
    pub task_template: TaskTemplate,

    #[serde(flatten)]
    rest: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct TaskTemplate {
    #[serde(rename = "ContainerSpec", default)]
    pub container_spec: ContainerSpec,

    #[serde(flatten)]
    rest: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ContainerSpec {
    #[serde(rename = "Image", default)]
    pub image: String,

    #[serde(flatten)]
    rest: serde_json::Map<String, serde_json::Value>,
}

/// HTTP client for the Docker Engine API (`DOCKER_HOST` over TCP).
#[derive(Clone)]
pub struct SwarmClient {
    http: reqwest::Client,
    base_url: String,
}

impl SwarmClient {
    pub fn new(base_url: &str, timeout: std::time::Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn list_services(&self) -> Result<Vec<SwarmService>, SwarmClientError> {
        let url = format!("{}/services", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|source| SwarmClientError::Request {
                url: url.clone(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(SwarmClientError::Status {
                url,
                status: status.as_u16(),
            });
        }
        let body = response
            .text()
            .await
            .map_err(|source| SwarmClientError::Request {
                url: url.clone(),
                source,
            })?;
        serde_json::from_str(&body).map_err(|source| SwarmClientError::Deserialize { url, source })
    }

    /// Updates a service's spec under its version counter. The engine
    /// rejects the write with a conflict when the counter is stale.
    pub async fn update_service(
        &self,
        id: &str,
        version: u64,
        spec: &ServiceSpec,
    ) -> Result<(), SwarmClientError> {
        let url = format!("{}/services/{}/update?version={}", self.base_url, id, version);
        let response = self
            .http
            .post(&url)
            .json(spec)
            .send()
            .await
            .map_err(|source| SwarmClientError::Request {
                url: url.clone(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(SwarmClientError::Status {
                url,
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn service_specs_round_trip_unknown_fields() {
        let raw = json!({
            "ID": "svc-1",
            "Version": {"Index": 17},
            "Spec": {
                "Name": "web",
                "Labels": {"team": "payments"},
                "TaskTemplate": {
                    "ContainerSpec": {
                        "Image": "team/web:1.2@sha256:abc",
                        "Env": ["MODE=prod"],
                    },
                    "Placement": {"Constraints": ["node.role==worker"]},
                },
                "Mode": {"Replicated": {"Replicas": 3}},
            },
        });

        let service: SwarmService = serde_json::from_value(raw).expect("must deserialize");
        assert_eq!(service.id, "svc-1");
        assert_eq!(service.version.index, 17);
        assert_eq!(service.spec.name, "web");
        assert_eq!(service.spec.task_template.container_spec.image, "team/web:1.2@sha256:abc");

        let spec = serde_json::to_value(&service.spec).expect("must serialize");
        assert_eq!(spec["Mode"]["Replicated"]["Replicas"], 3);
        assert_eq!(spec["TaskTemplate"]["Placement"]["Constraints"][0], "node.role==worker");
        assert_eq!(spec["TaskTemplate"]["ContainerSpec"]["Env"][0], "MODE=prod");
    }

    #[tokio::test]
    async fn unreachable_engine_yields_request_error() {
        let client = SwarmClient::new(
            "http://192.0.2.1:1",
            std::time::Duration::from_millis(100),
        )
        .expect("client must build");
        match client.list_services().await {
            Err(SwarmClientError::Request { .. }) => {}
            other => panic!("expected request error, got {other:?}"),
        }
    }
}
