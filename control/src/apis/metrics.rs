//! Controller metrics
//!
//! Counters for Ingress syncs and watch restarts, exposed in Prometheus text
//! format when a metrics port is configured.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, Response, StatusCode};
use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

lazy_static! {
    /// Controller metrics registry
    pub static ref CONTROLLER_METRICS_REGISTRY: Registry = Registry::new();

    /// Ingress sync attempts by outcome
    static ref INGRESS_SYNCS_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "ingress_sync_total",
            "Total number of Ingress sync attempts",
        );
        #[allow(clippy::expect_used)]
        let counter = IntCounterVec::new(opts, &["namespace", "ingress", "result"])
            .expect("Failed to create counter");
        if let Err(e) = CONTROLLER_METRICS_REGISTRY.register(Box::new(counter.clone())) {
            eprintln!("WARN: Failed to register ingress_sync_total counter: {}", e);
        }
        counter
    };

    /// Watch stream failures by resource kind
    static ref WATCH_FAILURES_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "watch_failures_total",
            "Total number of watch stream failures and restarts",
        );
        #[allow(clippy::expect_used)]
        let counter = IntCounterVec::new(opts, &["kind"])
            .expect("Failed to create counter");
        if let Err(e) = CONTROLLER_METRICS_REGISTRY.register(Box::new(counter.clone())) {
            eprintln!("WARN: Failed to register watch_failures_total counter: {}", e);
        }
        counter
    };
}

/// Record the outcome of one Ingress sync
pub fn record_ingress_sync(namespace: &str, ingress: &str, result: &str) {
    INGRESS_SYNCS_TOTAL
        .with_label_values(&[namespace, ingress, result])
        .inc();
}

/// Record one watch stream failure
pub fn record_watch_failure(kind: &str) {
    WATCH_FAILURES_TOTAL.with_label_values(&[kind]).inc();
}

/// Gather controller metrics
pub fn gather_controller_metrics() -> Result<String, String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = CONTROLLER_METRICS_REGISTRY.gather();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Failed to convert to UTF-8: {}", e))
}

/// `GET /metrics` handler for the metrics listener
pub fn metrics_response(method: &Method, path: &str) -> Response<Full<Bytes>> {
    let (status, content_type, body) = if method != Method::GET || path != "/metrics" {
        (StatusCode::NOT_FOUND, "text/plain", "Not Found".to_string())
    } else {
        match gather_controller_metrics() {
            Ok(text) => (
                StatusCode::OK,
                "text/plain; version=0.0.4; charset=utf-8",
                text,
            ),
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, "text/plain", e),
        }
    };

    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_counter_is_exported() {
        record_ingress_sync("default", "metrics-test", "applied");
        record_ingress_sync("default", "metrics-test", "applied");

        let text = gather_controller_metrics().unwrap();
        assert!(
            text.contains(
                r#"ingress_sync_total{ingress="metrics-test",namespace="default",result="applied"} 2"#
            ),
            "got: {}",
            text
        );
    }

    #[test]
    fn test_watch_failure_counter_is_exported() {
        record_watch_failure("MetricsTestKind");
        let text = gather_controller_metrics().unwrap();
        assert!(text.contains(r#"watch_failures_total{kind="MetricsTestKind"} 1"#));
    }

    #[test]
    fn test_metrics_route() {
        assert_eq!(
            metrics_response(&Method::GET, "/metrics").status(),
            StatusCode::OK
        );
        assert_eq!(
            metrics_response(&Method::GET, "/").status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            metrics_response(&Method::POST, "/metrics").status(),
            StatusCode::NOT_FOUND
        );
    }
}
