//! Prometheus collectors for the cluster node.

use lazy_static::lazy_static;
use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry instance
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    /// Client write requests by how they were handled.
    pub static ref SQL_REQUEST_COUNTER: CounterVec = CounterVec::new(
        Opts::new("sql_requests", "client sql requests by disposition"),
        &["disposition"]
    )
    .unwrap();

    /// Time from submission to applied result, by command kind.
    pub static ref SUBMIT_HISTOGRAM: HistogramVec = HistogramVec::new(
        HistogramOpts::new("submit_seconds", "submit-to-applied latency"),
        &["kind"]
    )
    .unwrap();
}

/// Registers all collectors with the global registry.
pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(SQL_REQUEST_COUNTER.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(SUBMIT_HISTOGRAM.clone()));
}
