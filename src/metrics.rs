//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Federation Metrics
    pub static ref ACTIVITIES_RECEIVED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("castfed_activities_received_total", "Total number of ActivityPub activities received"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref ACTIVITIES_SENT_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("castfed_activities_sent_total", "Total number of ActivityPub activities broadcast"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref DELIVERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("castfed_deliveries_total", "Total number of signed inbox deliveries"),
        &["status"]
    ).expect("metric can be created");
    pub static ref INBOX_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("castfed_inbox_requests_total", "Total number of inbound federation requests"),
        &["status"]
    ).expect("metric can be created");
    pub static ref INBOX_REQUEST_DURATION_SECONDS: prometheus::Histogram = prometheus::Histogram::with_opts(
        HistogramOpts::new(
            "castfed_inbox_request_duration_seconds",
            "Inbound federation request duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
    ).expect("metric can be created");

    pub static ref FOLLOWERS_TOTAL: IntGauge = IntGauge::new(
        "castfed_followers_total",
        "Current number of federated followers"
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("castfed_errors_total", "Total number of errors"),
        &["error_type"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(ACTIVITIES_RECEIVED_TOTAL.clone()))
        .expect("ACTIVITIES_RECEIVED_TOTAL can be registered");
    REGISTRY
        .register(Box::new(ACTIVITIES_SENT_TOTAL.clone()))
        .expect("ACTIVITIES_SENT_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DELIVERIES_TOTAL.clone()))
        .expect("DELIVERIES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(INBOX_REQUESTS_TOTAL.clone()))
        .expect("INBOX_REQUESTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(INBOX_REQUEST_DURATION_SECONDS.clone()))
        .expect("INBOX_REQUEST_DURATION_SECONDS can be registered");
    REGISTRY
        .register(Box::new(FOLLOWERS_TOTAL.clone()))
        .expect("FOLLOWERS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(ERRORS_TOTAL.clone()))
        .expect("ERRORS_TOTAL can be registered");

    tracing::info!("Metrics registry initialized");
}
