use crate::{
    adapter::{AdapterError, TargetAdapter},
    metrics::Metrics,
};
use perceiver_client::Coordinator;
use perceiver_core::{api::ScanResults, identity, mapdiff, matcher, ImageFacts, KvMap};
use tokio::time;
use tracing::{debug, info, warn};

/// The periodic reconciliation loop: fetch scan results, match each
/// live target by (repository, content hash), compute the minimal
/// idempotent label/annotation update, and apply it only when needed.
pub struct Annotator<A> {
    adapter: A,
    coordinator: Coordinator,
    metrics: Metrics,
    interval: time::Duration,
}

impl<A: TargetAdapter> Annotator<A> {
    pub fn new(
        adapter: A,
        coordinator: Coordinator,
        metrics: Metrics,
        interval: time::Duration,
    ) -> Self {
        Self {
            adapter,
            coordinator,
            metrics,
            interval,
        }
    }

    /// Runs until the shutdown signal fires. The signal is checked once
    /// per iteration, so the loop may finish one in-flight pass after
    /// shutdown is requested.
    pub async fn run(self, shutdown: drain::Watch) {
        info!(kind = self.adapter.kind(), "starting annotator loop");
        loop {
            tokio::select! {
                _ = time::sleep(self.interval) => {}
                _ = shutdown.clone().signaled() => {
                    debug!(kind = self.adapter.kind(), "annotator loop shutting down");
                    return;
                }
            }

            self.metrics.record_tick(self.adapter.kind());
            if let Err(error) = self.tick().await {
                self.metrics.record_error(self.adapter.kind(), "tick");
                warn!(kind = self.adapter.kind(), %error, "annotation pass failed");
            }
        }
    }

    /// One full pass. A fetch or enumeration failure abandons the whole
    /// tick; no partial state is retained and the next tick starts from
    /// scratch.
    async fn tick(&self) -> anyhow::Result<()> {
        let results = self.coordinator.scan_results().await?;
        let targets = self.adapter.list().await?;
        debug!(
            kind = self.adapter.kind(),
            targets = targets.len(),
            records = results.images.len(),
            "reconciling targets"
        );

        for target in &targets {
            let name = self.adapter.name(target);
            match self.reconcile(target, &results).await {
                Ok(true) => {
                    self.metrics.record_update(self.adapter.kind());
                    info!(kind = self.adapter.kind(), target = %name, "updated target");
                }
                Ok(false) => {}
                Err(error) => {
                    self.metrics.record_error(self.adapter.kind(), "update");
                    warn!(
                        kind = self.adapter.kind(),
                        target = %name,
                        %error,
                        "failed to update target"
                    );
                }
            }
        }
        Ok(())
    }

    /// Reconciles one target against the result set. Returns whether a
    /// write was issued.
    async fn reconcile(
        &self,
        target: &A::Target,
        results: &ScanResults,
    ) -> Result<bool, AdapterError> {
        let mut matched = false;
        let (mut labels, mut annotations) = match self.adapter.base_maps(target, results) {
            Some(maps) => {
                matched = true;
                maps
            }
            None => (KvMap::new(), KvMap::new()),
        };

        for (index, raw) in self.adapter.image_ids(target).iter().enumerate() {
            let (name, sha) = match identity::parse_image_id(raw) {
                Ok(id) => id,
                Err(error) => {
                    // One bad identity must not block the others.
                    self.metrics.record_error(self.adapter.kind(), "identity");
                    warn!(
                        kind = self.adapter.kind(),
                        target = %self.adapter.name(target),
                        image_id = %raw,
                        %error,
                        "skipping unparseable image identity"
                    );
                    continue;
                }
            };

            let record = match matcher::find_match(&name, &sha, &results.images) {
                Some(record) => record,
                // Not scanned yet.
                None => continue,
            };
            matched = true;

            let facts = ImageFacts::from_record(record);
            let (pos_name, pos_index) = if self.adapter.positional_names() {
                (name.as_str(), index)
            } else {
                ("", 0)
            };
            labels = mapdiff::merge(&labels, &facts.labels(pos_name, pos_index));
            annotations = mapdiff::merge(&annotations, &facts.annotations(pos_name, pos_index));
        }

        if !matched {
            return Ok(false);
        }
        if !self.adapter.supports_annotations() {
            annotations.clear();
        }

        let current_labels = self.adapter.labels(target);
        let current_annotations = self.adapter.annotations(target);
        let labels_satisfied = mapdiff::contains_relevant(&current_labels, &labels);
        let annotations_satisfied = mapdiff::contains_relevant(&current_annotations, &annotations);
        if labels_satisfied && annotations_satisfied {
            return Ok(false);
        }

        self.adapter
            .apply(
                target,
                mapdiff::merge(&current_labels, &labels),
                mapdiff::merge(&current_annotations, &annotations),
            )
            .await?;
        Ok(true)
    }
}
