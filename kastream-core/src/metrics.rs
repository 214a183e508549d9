//! Prometheus metrics for partition workers. Only the registry and the metric
//! families live here; serving them over HTTP is the embedder's concern.

use std::sync::OnceLock;

use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

// Counter names; the `_total` suffix is appended by the client library.
const READ_TOTAL: &str = "kastream_read";
const PRODUCED_TOTAL: &str = "kastream_produced";
const ACK_TOTAL: &str = "kastream_ack";
const OFFSETS_MARKED_TOTAL: &str = "kastream_offsets_marked";

const IN_FLIGHT_GROUPS: &str = "kastream_in_flight_groups";

/// The global register of all metrics.
#[derive(Default)]
pub struct GlobalRegistry {
    // A sync mutex is fine here: each metric is registered exactly once.
    pub registry: parking_lot::Mutex<Registry>,
}

static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

/// The registry every kastream metric is registered under. Embedders encode
/// it into their metrics endpoint.
pub fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(GlobalRegistry::default)
}

/// Metric families shared by all partition workers in the process,
/// differentiated by their label values (topic, partition).
pub struct PartitionMetrics {
    pub read_total: Family<Vec<(String, String)>, Counter>,
    pub produced_total: Family<Vec<(String, String)>, Counter>,
    pub ack_total: Family<Vec<(String, String)>, Counter>,
    pub offsets_marked_total: Family<Vec<(String, String)>, Counter>,
    pub in_flight_groups: Family<Vec<(String, String)>, Gauge>,
}

impl PartitionMetrics {
    fn new() -> Self {
        let metrics = Self {
            read_total: Family::default(),
            produced_total: Family::default(),
            ack_total: Family::default(),
            offsets_marked_total: Family::default(),
            in_flight_groups: Family::default(),
        };

        let mut registry = global_registry().registry.lock();
        registry.register(
            READ_TOTAL,
            "Total number of input records read",
            metrics.read_total.clone(),
        );
        registry.register(
            PRODUCED_TOTAL,
            "Total number of records dispatched to the producer",
            metrics.produced_total.clone(),
        );
        registry.register(
            ACK_TOTAL,
            "Total number of produce acknowledgements applied",
            metrics.ack_total.clone(),
        );
        registry.register(
            OFFSETS_MARKED_TOTAL,
            "Total number of durable offset marks",
            metrics.offsets_marked_total.clone(),
        );
        registry.register(
            IN_FLIGHT_GROUPS,
            "Number of in-flight message groups currently held",
            metrics.in_flight_groups.clone(),
        );
        metrics
    }
}

static PARTITION_METRICS: OnceLock<PartitionMetrics> = OnceLock::new();

pub fn partition_metrics() -> &'static PartitionMetrics {
    PARTITION_METRICS.get_or_init(PartitionMetrics::new)
}
