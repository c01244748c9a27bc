use crate::admin;
use anyhow::Result;
use clap::Parser;
use perceiver_annotate::{Annotator, Dumper, Metrics};
use perceiver_client::Coordinator;
use perceiver_docker::{SwarmAdapter, SwarmClient, SwarmInventory};
use perceiver_k8s::{ImageAdapter, ImageInventory, PodAdapter, PodInventory};
use perceiver_registry::{
    webhook, ArtifactoryAnnotator, ArtifactoryController, ArtifactoryWebhook, PushEvents,
    QuayAnnotator, QuayWebhook, RegistryAuth,
};
use prometheus_client::registry::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, info_span, Instrument};

#[derive(Parser)]
#[clap(name = "perceiver", version, about = "Bridges a vulnerability-scan coordinator with container image sources")]
pub struct Args {
    #[clap(long, default_value = "perceiver=info,warn", env = "PERCEIVER_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain", env = "PERCEIVER_LOG_FORMAT")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    common: CommonArgs,

    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct CommonArgs {
    /// Base URL of the scan coordinator.
    #[clap(long, env = "PERCEIVER_COORDINATOR_URL")]
    coordinator_url: String,

    /// Seconds between annotation passes.
    #[clap(long, default_value = "30")]
    annotation_interval: u64,

    /// Seconds between inventory pushes and registry discovery walks.
    #[clap(long, default_value = "300")]
    dump_interval: u64,

    /// Per-call timeout for outbound HTTP requests, in seconds.
    #[clap(long, default_value = "30")]
    http_timeout: u64,

    #[clap(long, default_value = "0.0.0.0:9090")]
    admin_addr: SocketAddr,
}

impl CommonArgs {
    fn annotation_interval(&self) -> Duration {
        Duration::from_secs(self.annotation_interval)
    }

    fn dump_interval(&self) -> Duration {
        Duration::from_secs(self.dump_interval)
    }

    fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout)
    }
}

#[derive(clap::Subcommand)]
enum Command {
    /// Perceive Kubernetes pods.
    Pod,

    /// Perceive OpenShift Image objects.
    Image,

    /// Perceive Docker Swarm services.
    Swarm {
        /// Docker Engine API endpoint.
        #[clap(long, env = "DOCKER_HOST", default_value = "http://localhost:2375")]
        docker_host: String,
    },

    /// Perceive Artifactory registries.
    Artifactory {
        /// Registry credentials as url=user=password; repeatable.
        #[clap(long = "registry", required = true)]
        registries: Vec<RegistryAuth>,

        /// Address the push webhook listens on.
        #[clap(long, default_value = "0.0.0.0:3001")]
        webhook_addr: SocketAddr,
    },

    /// Perceive Quay registries.
    Quay {
        /// Registry hosts as url=user=password; repeatable. Labeling
        /// uses the bearer token; the user/password pair is accepted
        /// for config parity with the other registries.
        #[clap(long = "registry", required = true)]
        registries: Vec<RegistryAuth>,

        /// OAuth bearer token for the Quay API.
        #[clap(long, env = "QUAY_ACCESS_TOKEN")]
        token: String,

        /// Address the push webhook listens on.
        #[clap(long, default_value = "0.0.0.0:3002")]
        webhook_addr: SocketAddr,
    },
}

impl Args {
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            common,
            command,
        } = self;

        log_format
            .try_init(log_level)
            .expect("must configure logging");

        let mut prom = <Registry>::default();
        let metrics = Metrics::register(prom.sub_registry_with_prefix("perceiver"));
        let coordinator = Coordinator::new(&common.coordinator_url, common.http_timeout())?;
        let timeout = common.http_timeout();

        tokio::spawn(serve_admin(common.admin_addr, Arc::new(prom)));

        let (shutdown_tx, shutdown_rx) = drain::channel();

        match command {
            Command::Pod => {
                let client = kube::Client::try_default().await?;
                let annotator = Annotator::new(
                    PodAdapter::new(client.clone()),
                    coordinator.clone(),
                    metrics.clone(),
                    common.annotation_interval(),
                );
                let dumper = Dumper::new(
                    PodInventory::new(client),
                    coordinator,
                    metrics,
                    common.dump_interval(),
                );
                tokio::spawn(
                    annotator
                        .run(shutdown_rx.clone())
                        .instrument(info_span!("annotator")),
                );
                tokio::spawn(dumper.run(shutdown_rx).instrument(info_span!("dumper")));
            }

            Command::Image => {
                let client = kube::Client::try_default().await?;
                let annotator = Annotator::new(
                    ImageAdapter::new(client.clone()),
                    coordinator.clone(),
                    metrics.clone(),
                    common.annotation_interval(),
                );
                let dumper = Dumper::new(
                    ImageInventory::new(client),
                    coordinator,
                    metrics,
                    common.dump_interval(),
                );
                tokio::spawn(
                    annotator
                        .run(shutdown_rx.clone())
                        .instrument(info_span!("annotator")),
                );
                tokio::spawn(dumper.run(shutdown_rx).instrument(info_span!("dumper")));
            }

            Command::Swarm { docker_host } => {
                let client = SwarmClient::new(&docker_host, timeout)?;
                let annotator = Annotator::new(
                    SwarmAdapter::new(client.clone()),
                    coordinator.clone(),
                    metrics.clone(),
                    common.annotation_interval(),
                );
                let dumper = Dumper::new(
                    SwarmInventory::new(client),
                    coordinator,
                    metrics,
                    common.dump_interval(),
                );
                tokio::spawn(
                    annotator
                        .run(shutdown_rx.clone())
                        .instrument(info_span!("annotator")),
                );
                tokio::spawn(dumper.run(shutdown_rx).instrument(info_span!("dumper")));
            }

            Command::Artifactory {
                registries,
                webhook_addr,
            } => {
                let annotator = ArtifactoryAnnotator::new(
                    coordinator.clone(),
                    registries.clone(),
                    metrics.clone(),
                    common.annotation_interval(),
                    timeout,
                );
                let controller = ArtifactoryController::new(
                    coordinator.clone(),
                    registries.clone(),
                    metrics,
                    common.dump_interval(),
                    timeout,
                );
                let hook = ArtifactoryWebhook::new(coordinator, registries, timeout);
                tokio::spawn(
                    annotator
                        .run(shutdown_rx.clone())
                        .instrument(info_span!("annotator")),
                );
                tokio::spawn(
                    controller
                        .run(shutdown_rx)
                        .instrument(info_span!("discovery")),
                );
                tokio::spawn(serve_webhook(webhook_addr, Arc::new(hook)));
            }

            Command::Quay {
                registries,
                token,
                webhook_addr,
            } => {
                let annotator = QuayAnnotator::new(
                    coordinator.clone(),
                    registries,
                    token.clone(),
                    metrics,
                    common.annotation_interval(),
                    timeout,
                );
                let hook = QuayWebhook::new(coordinator, token, timeout);
                tokio::spawn(
                    annotator
                        .run(shutdown_rx)
                        .instrument(info_span!("annotator")),
                );
                tokio::spawn(serve_webhook(webhook_addr, Arc::new(hook)));
            }
        }

        tokio::signal::ctrl_c().await?;
        info!("shutdown signal received, draining");
        shutdown_tx.drain().await;
        Ok(())
    }
}

async fn serve_admin(addr: SocketAddr, registry: Arc<Registry>) {
    if let Err(error) = admin::serve(addr, registry).await {
        error!(%error, "admin server failed");
    }
}

async fn serve_webhook<H: PushEvents>(addr: SocketAddr, handler: Arc<H>) {
    if let Err(error) = webhook::serve(addr, handler).await {
        error!(%error, "webhook server failed");
    }
}
