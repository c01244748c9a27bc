//! Prometheus handles shared by the perceiver loops. The registry is
//! owned by the runtime and passed in at construction; there is no
//! process-global registry.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::{counter::Counter, family::Family};
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ComponentLabels {
    component: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ErrorLabels {
    component: String,
    kind: String,
}

#[derive(Clone, Debug, Default)]
pub struct Metrics {
    ticks: Family<ComponentLabels, Counter>,
    updates: Family<ComponentLabels, Counter>,
    errors: Family<ErrorLabels, Counter>,
}

impl Metrics {
    pub fn register(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "ticks",
            "Completed perceiver loop iterations",
            metrics.ticks.clone(),
        );
        registry.register(
            "target_updates",
            "Target objects written with scan results",
            metrics.updates.clone(),
        );
        registry.register(
            "errors",
            "Errors encountered by perceiver loops",
            metrics.errors.clone(),
        );
        metrics
    }

    pub fn record_tick(&self, component: &str) {
        self.ticks
            .get_or_create(&ComponentLabels {
                component: component.to_string(),
            })
            .inc();
    }

    pub fn record_update(&self, component: &str) {
        self.updates
            .get_or_create(&ComponentLabels {
                component: component.to_string(),
            })
            .inc();
    }

    pub fn record_error(&self, component: &str, kind: &str) {
        self.errors
            .get_or_create(&ErrorLabels {
                component: component.to_string(),
                kind: kind.to_string(),
            })
            .inc();
    }
}
