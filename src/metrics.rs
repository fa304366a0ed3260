//! Discovery and resolution metrics (spec §10.C), namespaced the same way the
//! reference load-test harness namespaces its own counters.

use std::env;

use prometheus::{Encoder, GaugeVec, IntCounter, IntCounterVec, Opts, TextEncoder};

lazy_static::lazy_static! {
    pub static ref METRIC_NAMESPACE: String =
        env::var("METRIC_NAMESPACE").unwrap_or_else(|_| "discovery_resolution".to_string());

    pub static ref DISCOVERY_PROBES_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("discovery_probes_total", "Total number of destination probes attempted")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["outcome"] // outcome: matched, failed, timed_out
        ).unwrap();

    pub static ref DISCOVERY_PHASE2_RETRIES_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new(
                "discovery_phase2_retries_total",
                "Number of times discovery escalated to a phase-2 reprobe of all configured endpoints"
            ).namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref RESOLVER_RESOLUTIONS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("resolver_resolutions_total", "Total number of resolution attempts")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["strategy", "outcome"] // strategy: direct-uri, cluster, any; outcome: resolved, failed
        ).unwrap();

    pub static ref RESOLVER_BLACKLIST_SIZE: GaugeVec =
        GaugeVec::new(
            Opts::new("resolver_blacklist_size", "Size of a context's destination blacklist at resolution time")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["strategy"]
        ).unwrap();
}

/// Registers all metrics with the default Prometheus registry.
pub fn register_metrics() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    prometheus::default_registry().register(Box::new(DISCOVERY_PROBES_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(DISCOVERY_PHASE2_RETRIES_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(RESOLVER_RESOLUTIONS_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(RESOLVER_BLACKLIST_SIZE.clone()))?;
    Ok(())
}

/// Gathers and encodes the default registry's metrics as a string, for tests
/// and the demonstration binary's final summary (spec §10.C).
pub fn gather_metrics_string() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::default_registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap_or_else(|e| {
        eprintln!("Error encoding metrics to UTF-8: {}", e);
        String::from("# ERROR ENCODING METRICS TO UTF-8")
    })
}
