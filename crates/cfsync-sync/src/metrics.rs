//! Sync engine counters, registered into the daemon's Prometheus registry.

use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

type Labels = Vec<(String, String)>;

/// Cheap to clone; every clone updates the same series. `Default` gives an
/// unregistered set for tests.
#[derive(Clone, Default)]
pub struct SyncMetrics {
    pub hydrations: Counter,
    pub hydrated_bytes: Counter,
    pub uploads: Counter,
    /// outcome = applied | skipped
    pub placeholder_updates: Family<Labels, Counter>,
    /// source = connector | client_watcher | remote_watcher | shell
    pub handler_failures: Family<Labels, Counter>,
}

impl SyncMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "cfsync_hydrations",
            "Files fully hydrated through fetch-data",
            metrics.hydrations.clone(),
        );
        registry.register(
            "cfsync_hydrated_bytes",
            "Bytes transferred into placeholders",
            metrics.hydrated_bytes.clone(),
        );
        registry.register(
            "cfsync_uploads",
            "Local files and directories pushed to the remote",
            metrics.uploads.clone(),
        );
        registry.register(
            "cfsync_placeholder_updates",
            "Placeholder updates by outcome",
            metrics.placeholder_updates.clone(),
        );
        registry.register(
            "cfsync_handler_failures",
            "Event handler failures by source",
            metrics.handler_failures.clone(),
        );
        metrics
    }

    fn labels(key: &str, value: &str) -> Labels {
        vec![(key.to_string(), value.to_string())]
    }

    pub fn update_applied(&self) {
        self.placeholder_updates
            .get_or_create(&Self::labels("outcome", "applied"))
            .inc();
    }

    pub fn update_skipped(&self) {
        self.placeholder_updates
            .get_or_create(&Self::labels("outcome", "skipped"))
            .inc();
    }

    pub fn updates(&self, outcome: &str) -> u64 {
        self.placeholder_updates
            .get_or_create(&Self::labels("outcome", outcome))
            .get()
    }

    pub fn handler_failed(&self, source: &str) {
        self.handler_failures
            .get_or_create(&Self::labels("source", source))
            .inc();
    }

    pub fn failures(&self, source: &str) -> u64 {
        self.handler_failures
            .get_or_create(&Self::labels("source", source))
            .get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn registered_counters_encode() {
        let mut registry = Registry::default();
        let metrics = SyncMetrics::new(&mut registry);
        metrics.uploads.inc();
        metrics.update_skipped();
        metrics.handler_failed("remote_watcher");

        let mut body = String::new();
        encode(&mut body, &registry).unwrap();
        assert!(body.contains("cfsync_uploads_total 1"));
        assert!(body.contains("outcome=\"skipped\""));
        assert!(body.contains("source=\"remote_watcher\""));
        assert_eq!(metrics.updates("skipped"), 1);
        assert_eq!(metrics.updates("applied"), 0);
    }
}
