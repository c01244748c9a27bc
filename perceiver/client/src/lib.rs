#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! HTTP client for the scan coordinator's API.

use perceiver_core::api::{self, ImageRef, PodDescriptor, ScanResults};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to build HTTP client: {0}")]
    Build(#[source] reqwest::Error),

    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("failed to deserialize response from {url}: {source}")]
    Deserialize {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Client for the coordinator endpoints the perceivers consume.
///
/// Every call carries the configured per-request timeout; a slow
/// coordinator stalls only the owning loop's current tick.
#[derive(Clone, Debug)]
pub struct Coordinator {
    http: reqwest::Client,
    base_url: String,
}

impl Coordinator {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ClientError::Build)?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Fetches the full scan-result set.
    pub async fn scan_results(&self) -> Result<ScanResults, ClientError> {
        let url = self.endpoint(api::SCAN_RESULTS_PATH);
        debug!(%url, "fetching scan results");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|source| ClientError::Request {
                url: url.clone(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                url,
                status: status.as_u16(),
            });
        }
        let body = response
            .text()
            .await
            .map_err(|source| ClientError::Request {
                url: url.clone(),
                source,
            })?;
        serde_json::from_str(&body).map_err(|source| ClientError::Deserialize { url, source })
    }

    /// Replaces the coordinator's pod inventory with a full snapshot.
    pub async fn put_all_pods(&self, pods: &[PodDescriptor]) -> Result<(), ClientError> {
        self.put(api::ALL_PODS_PATH, &pods).await
    }

    /// Replaces the coordinator's image inventory with a full snapshot.
    pub async fn put_all_images(&self, images: &[ImageRef]) -> Result<(), ClientError> {
        self.put(api::ALL_IMAGES_PATH, &images).await
    }

    /// Enqueues a single image for scanning.
    pub async fn enqueue_image(&self, image: &ImageRef) -> Result<(), ClientError> {
        let url = self.endpoint(api::IMAGE_PATH);
        debug!(%url, repository = %image.repository, "enqueueing image");
        let response = self
            .http
            .post(&url)
            .json(image)
            .send()
            .await
            .map_err(|source| ClientError::Request {
                url: url.clone(),
                source,
            })?;
        Self::expect_success(&url, response.status())
    }

    async fn put<B: Serialize>(&self, path: &str, body: &B) -> Result<(), ClientError> {
        let url = self.endpoint(path);
        let response = self
            .http
            .put(&url)
            .json(body)
            .send()
            .await
            .map_err(|source| ClientError::Request {
                url: url.clone(),
                source,
            })?;
        Self::expect_success(&url, response.status())
    }

    fn expect_success(url: &str, status: reqwest::StatusCode) -> Result<(), ClientError> {
        if status.is_success() {
            Ok(())
        } else {
            Err(ClientError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Serves the given status line to every connection.
    async fn stub_server(status_line: &'static str) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener must bind");
        let addr = listener.local_addr().expect("listener must have an addr");
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let response = format!("{status_line}\r\ncontent-length: 0\r\n\r\n");
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        addr
    }

    #[test]
    fn trailing_slash_is_normalized() {
        let client = Coordinator::new("http://coordinator:3001/", Duration::from_secs(5))
            .expect("client must build");
        assert_eq!(
            client.endpoint(api::SCAN_RESULTS_PATH),
            "http://coordinator:3001/scanresults"
        );
    }

    #[tokio::test]
    async fn unauthorized_coordinator_yields_status_error() {
        let addr = stub_server("HTTP/1.1 401 Unauthorized").await;
        let client = Coordinator::new(&format!("http://{addr}"), Duration::from_secs(5))
            .expect("client must build");
        match client.scan_results().await {
            Err(ClientError::Status { url, status }) => {
                assert_eq!(status, 401);
                assert!(url.ends_with("/scanresults"), "unexpected url: {url}");
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejected_put_yields_status_error() {
        let addr = stub_server("HTTP/1.1 503 Service Unavailable").await;
        let client = Coordinator::new(&format!("http://{addr}"), Duration::from_secs(5))
            .expect("client must build");
        match client.put_all_pods(&[]).await {
            Err(ClientError::Status { status, .. }) => assert_eq!(status, 503),
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_coordinator_yields_request_error() {
        // Reserved TEST-NET-1 address; nothing listens there.
        let client = Coordinator::new("http://192.0.2.1:1", Duration::from_millis(50))
            .expect("client must build");
        match client.scan_results().await {
            Err(ClientError::Request { url, .. }) => {
                assert_eq!(url, "http://192.0.2.1:1/scanresults")
            }
            other => panic!("expected request error, got {other:?}"),
        }
    }
}
