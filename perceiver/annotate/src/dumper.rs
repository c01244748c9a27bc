use crate::{adapter::AdapterError, metrics::Metrics};
use async_trait::async_trait;
use perceiver_client::Coordinator;
use perceiver_core::api::{ImageRef, PodDescriptor};
use tokio::time;
use tracing::{debug, info, warn};

/// One full inventory snapshot in the coordinator's wire format.
#[derive(Clone, Debug)]
pub enum Inventory {
    Pods(Vec<PodDescriptor>),
    Images(Vec<ImageRef>),
}

impl Inventory {
    fn len(&self) -> usize {
        match self {
            Inventory::Pods(pods) => pods.len(),
            Inventory::Images(images) => images.len(),
        }
    }
}

/// A source that can be snapshotted into coordinator inventory.
#[async_trait]
pub trait InventorySource: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn snapshot(&self) -> Result<Inventory, AdapterError>;
}

/// The push-direction loop: periodically PUTs the full current
/// inventory to the coordinator. Full-replace semantics; the
/// coordinator owns dedup, so a failed push is simply retried with a
/// fresh snapshot next tick.
pub struct Dumper<S> {
    source: S,
    coordinator: Coordinator,
    metrics: Metrics,
    interval: time::Duration,
}

impl<S: InventorySource> Dumper<S> {
    pub fn new(
        source: S,
        coordinator: Coordinator,
        metrics: Metrics,
        interval: time::Duration,
    ) -> Self {
        Self {
            source,
            coordinator,
            metrics,
            interval,
        }
    }

    pub async fn run(self, shutdown: drain::Watch) {
        info!(kind = self.source.kind(), "starting dumper loop");
        loop {
            tokio::select! {
                _ = time::sleep(self.interval) => {}
                _ = shutdown.clone().signaled() => {
                    debug!(kind = self.source.kind(), "dumper loop shutting down");
                    return;
                }
            }

            self.metrics.record_tick(self.source.kind());
            if let Err(error) = self.tick().await {
                self.metrics.record_error(self.source.kind(), "dump");
                warn!(kind = self.source.kind(), %error, "inventory push failed");
            }
        }
    }

    async fn tick(&self) -> anyhow::Result<()> {
        let inventory = self.source.snapshot().await?;
        let count = inventory.len();
        match &inventory {
            Inventory::Pods(pods) => self.coordinator.put_all_pods(pods).await?,
            Inventory::Images(images) => self.coordinator.put_all_images(images).await?,
        }
        info!(kind = self.source.kind(), count, "pushed inventory snapshot");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct FakeInventory {
        pods: Vec<PodDescriptor>,
        fail: bool,
    }

    #[async_trait]
    impl InventorySource for FakeInventory {
        fn kind(&self) -> &'static str {
            "fake"
        }

        async fn snapshot(&self) -> Result<Inventory, AdapterError> {
            if self.fail {
                return Err(AdapterError::Other(anyhow::anyhow!("source down")));
            }
            Ok(Inventory::Pods(self.pods.clone()))
        }
    }

    /// Answers every connection with the given status line.
    async fn stub_coordinator(status_line: &'static str) -> std::net::SocketAddr {
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

    fn pod(name: &str) -> PodDescriptor {
        PodDescriptor {
            name: name.to_string(),
            namespace: "test".to_string(),
            uid: "uid-1".to_string(),
            containers: vec![],
        }
    }

    fn dumper(source: FakeInventory, coordinator_url: &str) -> Dumper<FakeInventory> {
        let coordinator = Coordinator::new(coordinator_url, time::Duration::from_millis(500))
            .expect("client must build");
        Dumper::new(
            source,
            coordinator,
            Metrics::default(),
            time::Duration::from_secs(300),
        )
    }

    #[tokio::test]
    async fn tick_pushes_the_snapshot() {
        let addr = stub_coordinator("HTTP/1.1 200 OK").await;
        let source = FakeInventory {
            pods: vec![pod("web-1")],
            fail: false,
        };
        dumper(source, &format!("http://{addr}"))
            .tick()
            .await
            .expect("push must succeed");
    }

    #[tokio::test]
    async fn failed_snapshot_fails_the_tick() {
        let addr = stub_coordinator("HTTP/1.1 200 OK").await;
        let source = FakeInventory {
            pods: vec![],
            fail: true,
        };
        assert!(dumper(source, &format!("http://{addr}")).tick().await.is_err());
    }

    #[tokio::test]
    async fn rejected_push_fails_the_tick() {
        let addr = stub_coordinator("HTTP/1.1 503 Service Unavailable").await;
        let source = FakeInventory {
            pods: vec![pod("web-1")],
            fail: false,
        };
        assert!(dumper(source, &format!("http://{addr}")).tick().await.is_err());
    }
}
