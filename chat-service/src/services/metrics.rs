//! Prometheus metrics for chat-service.
//!
//! Relay outcomes, delta throughput and upstream token usage.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::{Mutex, OnceLock};

static INIT_LOCK: Mutex<()> = Mutex::new(());

// Global registry
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

// Relay metrics
pub static CHAT_SESSIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static CHAT_VALIDATION_FAILURES_TOTAL: OnceLock<IntCounter> = OnceLock::new();
pub static CHAT_DELTAS_TOTAL: OnceLock<IntCounter> = OnceLock::new();
pub static CHAT_TIME_TO_FIRST_DELTA_SECONDS: OnceLock<Histogram> = OnceLock::new();

// Upstream metrics
pub static CHAT_UPSTREAM_TOKENS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static CHAT_UPSTREAM_ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Safe to call more than once; only the first call
/// registers anything.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _guard = INIT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let sessions = IntCounterVec::new(
        Opts::new("chat_sessions_total", "Relay sessions by terminal outcome"),
        &["outcome"],
    )?;

    let validation_failures = IntCounter::new(
        "chat_validation_failures_total",
        "Requests rejected before any upstream call",
    )?;

    let deltas = IntCounter::new("chat_deltas_total", "Text deltas relayed to clients")?;

    let time_to_first_delta = Histogram::with_opts(
        HistogramOpts::new(
            "chat_time_to_first_delta_seconds",
            "Time from upstream call to first non-empty delta",
        )
        .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
    )?;

    let upstream_tokens = IntCounterVec::new(
        Opts::new("chat_upstream_tokens_total", "Tokens reported by the provider"),
        &["type"], // type: input, output
    )?;

    let upstream_errors = IntCounterVec::new(
        Opts::new("chat_upstream_errors_total", "Upstream failures by kind"),
        &["error_type"],
    )?;

    registry.register(Box::new(sessions.clone()))?;
    registry.register(Box::new(validation_failures.clone()))?;
    registry.register(Box::new(deltas.clone()))?;
    registry.register(Box::new(time_to_first_delta.clone()))?;
    registry.register(Box::new(upstream_tokens.clone()))?;
    registry.register(Box::new(upstream_errors.clone()))?;

    // Initialize globals
    let _ = REGISTRY.set(registry);
    let _ = CHAT_SESSIONS_TOTAL.set(sessions);
    let _ = CHAT_VALIDATION_FAILURES_TOTAL.set(validation_failures);
    let _ = CHAT_DELTAS_TOTAL.set(deltas);
    let _ = CHAT_TIME_TO_FIRST_DELTA_SECONDS.set(time_to_first_delta);
    let _ = CHAT_UPSTREAM_TOKENS_TOTAL.set(upstream_tokens);
    let _ = CHAT_UPSTREAM_ERRORS_TOTAL.set(upstream_errors);

    tracing::info!("Prometheus metrics initialized");
    Ok(())
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();

    let registry = match REGISTRY.get() {
        Some(r) => r,
        None => {
            tracing::error!("Metrics registry not initialized");
            return "# Metrics registry not initialized\n".to_string();
        }
    };

    let metric_families = registry.gather();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return format!("# Failed to encode metrics: {}\n", e);
    }

    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "Failed to convert metrics to UTF-8");
            format!("# Failed to convert metrics to UTF-8: {}\n", e)
        }
    }
}

// Helper functions for recording metrics

/// Record a session reaching a terminal outcome.
pub fn record_session(outcome: &str) {
    if let Some(counter) = CHAT_SESSIONS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn record_validation_failure() {
    if let Some(counter) = CHAT_VALIDATION_FAILURES_TOTAL.get() {
        counter.inc();
    }
}

pub fn record_delta() {
    if let Some(counter) = CHAT_DELTAS_TOTAL.get() {
        counter.inc();
    }
}

pub fn record_time_to_first_delta(duration_secs: f64) {
    if let Some(histogram) = CHAT_TIME_TO_FIRST_DELTA_SECONDS.get() {
        histogram.observe(duration_secs);
    }
}

/// Record token usage reported at the end of a stream.
pub fn record_tokens(input_tokens: i32, output_tokens: i32) {
    if let Some(counter) = CHAT_UPSTREAM_TOKENS_TOTAL.get() {
        counter
            .with_label_values(&["input"])
            .inc_by(input_tokens.max(0) as u64);
        counter
            .with_label_values(&["output"])
            .inc_by(output_tokens.max(0) as u64);
    }
}

/// Record an upstream failure.
pub fn record_upstream_error(error_type: &str) {
    if let Some(counter) = CHAT_UPSTREAM_ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type]).inc();
    }
}
