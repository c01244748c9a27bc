//! Registry perceiver backends: Artifactory and Quay.
//!
//! Registries have no Kubernetes-style metadata, so scan results land
//! as artifact properties (Artifactory) or manifest labels (Quay), with
//! the same fetch/match/diff policy the cluster perceivers use. Both
//! backends also push newly seen images onto the coordinator's scan
//! queue: Artifactory by periodically walking its docker repositories,
//! both by reacting to registry push webhooks.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod artifactory;
pub mod auth;
pub mod quay;
pub mod webhook;

mod error;

pub use self::artifactory::{ArtifactoryAnnotator, ArtifactoryClient, ArtifactoryController};
pub use self::auth::RegistryAuth;
pub use self::error::RegistryError;
pub use self::quay::{QuayAnnotator, QuayClient};
pub use self::webhook::{ArtifactoryWebhook, PushEvents, QuayWebhook};

#[cfg(test)]
pub(crate) mod testutil {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Serves the given status line to every connection.
    pub(crate) async fn stub_server(status_line: &'static str) -> std::net::SocketAddr {
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
}
