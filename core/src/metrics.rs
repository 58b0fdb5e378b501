// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Prometheus metrics registered on the default registry.

use prometheus::{
    register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

struct Metrics {
    tags_copied: IntCounterVec,
    tags_skipped: IntCounterVec,
    tags_failed: IntCounterVec,
    bytes_transferred: IntCounterVec,
    circuit_transitions: IntCounterVec,
    cache_ops: IntCounterVec,
    rpc_requests: IntCounterVec,
    rpc_latency: HistogramVec,
}

fn metrics() -> &'static Metrics {
    static METRICS: OnceLock<Metrics> = OnceLock::new();
    METRICS.get_or_init(|| Metrics {
        tags_copied: register_int_counter_vec!(
            "freightliner_tags_copied_total",
            "Tags copied to a destination registry",
            &["registry"]
        )
        .unwrap(),
        tags_skipped: register_int_counter_vec!(
            "freightliner_tags_skipped_total",
            "Tags skipped because the destination already matched",
            &["registry"]
        )
        .unwrap(),
        tags_failed: register_int_counter_vec!(
            "freightliner_tags_failed_total",
            "Tags that failed after all retries",
            &["registry"]
        )
        .unwrap(),
        bytes_transferred: register_int_counter_vec!(
            "freightliner_bytes_transferred_total",
            "Blob bytes streamed to destinations",
            &["registry"]
        )
        .unwrap(),
        circuit_transitions: register_int_counter_vec!(
            "freightliner_circuit_transitions_total",
            "Circuit breaker state transitions",
            &["breaker", "to"]
        )
        .unwrap(),
        cache_ops: register_int_counter_vec!(
            "freightliner_cache_ops_total",
            "Distributed cache operations",
            &["store", "op"]
        )
        .unwrap(),
        rpc_requests: register_int_counter_vec!(
            "freightliner_rpc_requests_total",
            "Mesh RPC requests by method and outcome",
            &["method", "outcome"]
        )
        .unwrap(),
        rpc_latency: register_histogram_vec!(
            "freightliner_rpc_latency_seconds",
            "Mesh RPC latency",
            &["method"]
        )
        .unwrap(),
    })
}

pub(crate) fn tags_copied(registry: &str) {
    metrics().tags_copied.with_label_values(&[registry]).inc();
}

pub(crate) fn tags_skipped(registry: &str) {
    metrics().tags_skipped.with_label_values(&[registry]).inc();
}

pub(crate) fn tags_failed(registry: &str) {
    metrics().tags_failed.with_label_values(&[registry]).inc();
}

pub(crate) fn bytes_transferred(registry: &str, bytes: u64) {
    metrics()
        .bytes_transferred
        .with_label_values(&[registry])
        .inc_by(bytes);
}

pub(crate) fn circuit_transitions(breaker: &str, to: &str) {
    metrics()
        .circuit_transitions
        .with_label_values(&[breaker, to])
        .inc();
}

pub(crate) fn cache_op(store: &str, op: &str) {
    metrics().cache_ops.with_label_values(&[store, op]).inc();
}

pub(crate) fn rpc_request(method: &str, outcome: &str) {
    metrics()
        .rpc_requests
        .with_label_values(&[method, outcome])
        .inc();
}

pub(crate) fn rpc_latency(method: &str, seconds: f64) {
    metrics()
        .rpc_latency
        .with_label_values(&[method])
        .observe(seconds);
}

/// Render the default registry in the Prometheus text format
pub fn render() -> String {
    let encoder = TextEncoder::new();
    encoder
        .encode_to_string(&prometheus::gather())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_registered_metrics() {
        tags_copied("docker.io");
        let text = render();
        assert!(text.contains("freightliner_tags_copied_total"));
    }
}
