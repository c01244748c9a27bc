use async_trait::async_trait;
use perceiver_core::{api::ScanResults, KvMap};
use thiserror::Error;

/// Errors surfaced by source-system adapters.
///
/// None of these abort a loop; they are logged at the smallest enclosing
/// unit of work and the object or registry is revisited next tick.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The target vanished between enumeration and update.
    #[error("target not found: {0}")]
    NotFound(String),

    /// The update was rejected, e.g. a stale resource version.
    #[error("write conflict on {0}")]
    Conflict(String),

    /// The source system rejected our credentials.
    #[error("authentication rejected by {0}")]
    Auth(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Capability surface of one image source (cluster pods, OpenShift
/// images, swarm services). One implementation per source type replaces
/// the per-source reconciliation loops.
#[async_trait]
pub trait TargetAdapter: Send + Sync {
    type Target: Send + Sync;

    /// Short source-kind tag used in logs and metrics.
    fn kind(&self) -> &'static str;

    /// Enumerates all live target objects.
    async fn list(&self) -> Result<Vec<Self::Target>, AdapterError>;

    /// Human-readable identity for logging.
    fn name(&self, target: &Self::Target) -> String;

    /// Raw container image identifiers declared by the target. A target
    /// may run multiple containers; order fixes the positional index.
    fn image_ids(&self, target: &Self::Target) -> Vec<String>;

    /// The target's current labels.
    fn labels(&self, target: &Self::Target) -> KvMap;

    /// The target's current annotations.
    fn annotations(&self, target: &Self::Target) -> KvMap;

    /// Label/annotation maps derived from an object-level scan record
    /// (pod-level facts), when the result set carries one for this
    /// target. `None` means the object itself has no scan record.
    fn base_maps(&self, target: &Self::Target, results: &ScanResults) -> Option<(KvMap, KvMap)> {
        let _ = (target, results);
        None
    }

    /// Whether image keys carry a container-ordinal disambiguator.
    /// Single-image sources (OpenShift images) turn this off.
    fn positional_names(&self) -> bool {
        true
    }

    /// Whether the source has an annotation surface at all. Swarm
    /// services only carry labels.
    fn supports_annotations(&self) -> bool {
        true
    }

    /// Persists the merged maps in exactly one update call.
    async fn apply(
        &self,
        target: &Self::Target,
        labels: KvMap,
        annotations: KvMap,
    ) -> Result<(), AdapterError>;
}
