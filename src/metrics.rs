//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Once;

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedicore_http_requests_total", "Total number of HTTP requests"),
        &["method", "endpoint", "status"]
    ).expect("metric can be created");
    pub static ref HTTP_REQUEST_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "fedicore_http_request_duration_seconds",
            "HTTP request duration in seconds"
        ).buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["method", "endpoint"]
    ).expect("metric can be created");

    // Federation Metrics
    pub static ref ACTIVITYPUB_ACTIVITIES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("fedicore_activitypub_activities_received_total", "Total number of ActivityPub activities received"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref FEDERATION_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedicore_federation_requests_total", "Total number of federation requests"),
        &["direction", "status"]
    ).expect("metric can be created");
    pub static ref FEDERATION_REQUEST_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "fedicore_federation_request_duration_seconds",
            "Federation request duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["direction"]
    ).expect("metric can be created");
    pub static ref INBOX_DELIVERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedicore_inbox_deliveries_total", "Inbox deliveries by outcome"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref RESOLVER_FETCHES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedicore_resolver_fetches_total", "Remote resolve fetches by result"),
        &["result"]
    ).expect("metric can be created");
    pub static ref INSTANCE_REQUESTS_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("fedicore_instance_requests_received_total", "Verified inbound requests per remote host"),
        &["host"]
    ).expect("metric can be created");

    // Queue Metrics
    pub static ref INBOX_QUEUE_DEPTH: IntGauge = IntGauge::new(
        "fedicore_inbox_queue_depth",
        "Inbox jobs waiting for a worker"
    ).expect("metric can be created");
    pub static ref INBOX_QUEUE_RETRIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedicore_inbox_queue_retries_total", "Inbox job retries and give-ups"),
        &["result"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedicore_errors_total", "Total number of errors"),
        &["error_type", "endpoint"]
    ).expect("metric can be created");
}

static INIT: Once = Once::new();

/// Initialize metrics registry.
///
/// Safe to call more than once; registration happens on the first call.
pub fn init_metrics() {
    INIT.call_once(register_metrics);
}

fn register_metrics() {
    REGISTRY
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .expect("HTTP_REQUESTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(HTTP_REQUEST_DURATION_SECONDS.clone()))
        .expect("HTTP_REQUEST_DURATION_SECONDS can be registered");
    REGISTRY
        .register(Box::new(ACTIVITYPUB_ACTIVITIES_RECEIVED.clone()))
        .expect("ACTIVITYPUB_ACTIVITIES_RECEIVED can be registered");
    REGISTRY
        .register(Box::new(FEDERATION_REQUESTS_TOTAL.clone()))
        .expect("FEDERATION_REQUESTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(FEDERATION_REQUEST_DURATION_SECONDS.clone()))
        .expect("FEDERATION_REQUEST_DURATION_SECONDS can be registered");
    REGISTRY
        .register(Box::new(INBOX_DELIVERIES_TOTAL.clone()))
        .expect("INBOX_DELIVERIES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(RESOLVER_FETCHES_TOTAL.clone()))
        .expect("RESOLVER_FETCHES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(INSTANCE_REQUESTS_RECEIVED.clone()))
        .expect("INSTANCE_REQUESTS_RECEIVED can be registered");
    REGISTRY
        .register(Box::new(INBOX_QUEUE_DEPTH.clone()))
        .expect("INBOX_QUEUE_DEPTH can be registered");
    REGISTRY
        .register(Box::new(INBOX_QUEUE_RETRIES_TOTAL.clone()))
        .expect("INBOX_QUEUE_RETRIES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(ERRORS_TOTAL.clone()))
        .expect("ERRORS_TOTAL can be registered");

    tracing::info!("Metrics registry initialized");
}
