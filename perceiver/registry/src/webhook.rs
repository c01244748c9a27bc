//! Push-notification webhook server.
//!
//! Registries POST a push payload to `/webhook`; the affected images
//! are resolved to digests through the registry API and enqueued for
//! scanning immediately, instead of waiting for the next discovery
//! walk.

use crate::{
    artifactory::ArtifactoryClient,
    auth::RegistryAuth,
    quay::QuayClient,
};
use async_trait::async_trait;
use futures::future;
use hyper::{Body, Method, Request, Response, StatusCode};
use perceiver_client::Coordinator;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// A handler for one registry's push payload format.
#[async_trait]
pub trait PushEvents: Send + Sync + 'static {
    async fn handle(&self, body: &[u8]) -> anyhow::Result<()>;
}

/// Serves `POST /webhook`, feeding each payload to the handler. Handler
/// failures answer 400 so the registry's delivery log shows them.
pub async fn serve<H: PushEvents>(addr: SocketAddr, handler: Arc<H>) -> Result<(), hyper::Error> {
    let server =
        hyper::server::Server::bind(&addr).serve(hyper::service::make_service_fn(move |_conn| {
            let handler = handler.clone();
            future::ok::<_, hyper::Error>(hyper::service::service_fn(
                move |req: Request<Body>| {
                    let handler = handler.clone();
                    async move { Ok::<_, hyper::Error>(handle(handler, req).await) }
                },
            ))
        }));
    let addr = server.local_addr();
    info!(%addr, "webhook server listening");
    server.await
}

async fn handle<H: PushEvents>(handler: Arc<H>, req: Request<Body>) -> Response<Body> {
    if req.uri().path() != "/webhook" {
        return status_response(StatusCode::NOT_FOUND);
    }
    if req.method() != Method::POST {
        return status_response(StatusCode::METHOD_NOT_ALLOWED);
    }
    let body = match hyper::body::to_bytes(req.into_body()).await {
        Ok(body) => body,
        Err(error) => {
            warn!(%error, "failed to read webhook body");
            return status_response(StatusCode::BAD_REQUEST);
        }
    };
    match handler.handle(&body).await {
        Ok(()) => status_response(StatusCode::OK),
        Err(error) => {
            warn!(%error, "webhook payload rejected");
            status_response(StatusCode::BAD_REQUEST)
        }
    }
}

fn status_response(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::default())
        .unwrap_or_default()
}

/// A Quay repository-push payload.
#[derive(Clone, Debug, Deserialize)]
pub struct QuayPushEvent {
    pub name: String,
    pub repository: String,
    pub namespace: String,
    pub docker_url: String,
    #[serde(default)]
    pub homepage: String,
    #[serde(default)]
    pub updated_tags: Vec<String>,
}

/// Resolves Quay push events to manifest digests and enqueues them.
pub struct QuayWebhook {
    coordinator: Coordinator,
    token: String,
    timeout: Duration,
}

impl QuayWebhook {
    pub fn new(coordinator: Coordinator, token: String, timeout: Duration) -> Self {
        Self {
            coordinator,
            token,
            timeout,
        }
    }
}

#[async_trait]
impl PushEvents for QuayWebhook {
    async fn handle(&self, body: &[u8]) -> anyhow::Result<()> {
        let event: QuayPushEvent = serde_json::from_slice(body)?;
        let host = event
            .docker_url
            .split('/')
            .next()
            .unwrap_or(&event.docker_url);
        let client = QuayClient::connect(host, &self.token, self.timeout).await?;

        let mut enqueued = 0usize;
        for tag in client.tags(&event.repository).await? {
            let hex = match tag.manifest_digest.strip_prefix("sha256:") {
                Some(hex) if !hex.is_empty() => hex,
                _ => {
                    warn!(
                        repository = %event.repository,
                        tag = %tag.name,
                        "tag has no manifest digest, skipping"
                    );
                    continue;
                }
            };
            let mut image = perceiver_core::api::ImageRef::new(
                event.docker_url.clone(),
                tag.name.clone(),
                hex,
            );
            image.project_name = Some(event.docker_url.clone());
            image.project_version = Some(tag.name.clone());
            self.coordinator.enqueue_image(&image).await?;
            enqueued += 1;
        }
        info!(
            repository = %event.repository,
            namespace = %event.namespace,
            name = %event.name,
            enqueued,
            "processed quay push event"
        );
        Ok(())
    }
}

/// An Artifactory webhook-plugin payload.
#[derive(Clone, Debug, Deserialize)]
pub struct ArtifactoryPushEvent {
    #[serde(default)]
    pub artifacts: Vec<PushedArtifact>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PushedArtifact {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub reference: String,
}

/// Resolves Artifactory push events to manifest digests and enqueues
/// them against every configured registry that recognizes the artifact.
pub struct ArtifactoryWebhook {
    coordinator: Coordinator,
    registries: Vec<RegistryAuth>,
    timeout: Duration,
}

impl ArtifactoryWebhook {
    pub fn new(coordinator: Coordinator, registries: Vec<RegistryAuth>, timeout: Duration) -> Self {
        Self {
            coordinator,
            registries,
            timeout,
        }
    }
}

#[async_trait]
impl PushEvents for ArtifactoryWebhook {
    async fn handle(&self, body: &[u8]) -> anyhow::Result<()> {
        let event: ArtifactoryPushEvent = serde_json::from_slice(body)?;
        for auth in &self.registries {
            let client = match ArtifactoryClient::connect(auth, self.timeout).await {
                Ok(client) => client,
                Err(error) => {
                    warn!(registry = %auth.url, %error, "skipping registry for this event");
                    continue;
                }
            };
            for artifact in &event.artifacts {
                let repo_key = match repo_key(
                    &artifact.reference,
                    client.base_url(),
                    &artifact.name,
                    &artifact.version,
                ) {
                    Some(key) => key,
                    None => {
                        warn!(
                            reference = %artifact.reference,
                            "artifact reference does not match this registry"
                        );
                        continue;
                    }
                };
                let digests = client
                    .manifest_digests(&repo_key, &artifact.name, &artifact.version)
                    .await?;
                for digest in digests {
                    let image = crate::artifactory::discovered_image(
                        &auth.url,
                        &repo_key,
                        &artifact.name,
                        &artifact.version,
                        &digest,
                    );
                    // Push events scan ahead of the discovery walk.
                    let image = perceiver_core::api::ImageRef {
                        priority: 1,
                        ..image
                    };
                    self.coordinator.enqueue_image(&image).await?;
                    info!(
                        repository = %image.repository,
                        tag = %artifact.version,
                        "enqueued pushed image"
                    );
                }
            }
        }
        Ok(())
    }
}

/// Extracts the repository key from an artifact reference of the form
/// `<base-url>/<repo-key>/<name>:<version>`. The name may itself
/// contain slashes, so the reference is peeled from both ends rather
/// than split.
fn repo_key(reference: &str, base_url: &str, name: &str, version: &str) -> Option<String> {
    let path = reference
        .strip_prefix(base_url)?
        .strip_prefix('/')?
        .strip_suffix(version)?
        .strip_suffix(':')?;
    let key = path.strip_suffix(name)?.strip_suffix('/')?;
    if key.is_empty() {
        None
    } else {
        Some(key.to_string())
    }
}
