//! Prometheus metrics for the bridge.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup **before** constructing a
//! bridge. The helper functions (`inc_request`, `observe_predict_duration`,
//! …) are no-ops if `init_metrics` was never called, so the bridge is always
//! safe to run — observability simply degrades gracefully.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `bridge_requests_total` | Counter | `kind` |
//! | `bridge_requests_rejected_total` | Counter | `reason` |
//! | `bridge_forwarded_total` | Counter | `direction` |
//! | `bridge_decisions_total` | Counter | `decision` |
//! | `bridge_predict_duration_seconds` | Histogram | — |
//! | `bridge_queue_depth` | Gauge | — |

use crate::BridgeError;
use prometheus::{
    CounterVec, Encoder, Histogram, HistogramOpts, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;
use std::time::Duration;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All Prometheus metrics for the bridge, bundled together so they can be
/// stored in a single [`OnceLock`] and initialised atomically.
pub struct Metrics {
    /// Prometheus registry that owns all metric descriptors.
    pub registry: Registry,
    /// Requests enqueued, by request kind.
    pub requests_total: CounterVec,
    /// Requests rejected before processing, by reason
    /// (`queue_full`, `filtered`, `invalid`).
    pub requests_rejected: CounterVec,
    /// Requests forwarded, by direction (`to_kernel`, `to_caller`).
    pub forwarded_total: CounterVec,
    /// Model decisions, by decision class.
    pub decisions_total: CounterVec,
    /// Model inference latency histogram.
    pub predict_duration: Histogram,
    /// Current pending-request queue depth.
    pub queue_depth: IntGauge,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all Prometheus metrics and register them with a private
/// registry.
///
/// Must be called once at process startup before a bridge is constructed.
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`BridgeError::InvalidArgument`] if metric construction or
/// registry registration fails (e.g., duplicate descriptor names).
///
/// # Panics
///
/// This function never panics.
pub fn init_metrics() -> Result<(), BridgeError> {
    if METRICS.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let requests_total = CounterVec::new(
        Opts::new("bridge_requests_total", "Requests enqueued by kind"),
        &["kind"],
    )
    .map_err(|e| BridgeError::InvalidArgument(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(requests_total.clone()))
        .map_err(|e| BridgeError::InvalidArgument(format!("metrics registration failed: {e}")))?;

    let requests_rejected = CounterVec::new(
        Opts::new(
            "bridge_requests_rejected_total",
            "Requests rejected before processing, by reason",
        ),
        &["reason"],
    )
    .map_err(|e| BridgeError::InvalidArgument(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(requests_rejected.clone()))
        .map_err(|e| BridgeError::InvalidArgument(format!("metrics registration failed: {e}")))?;

    let forwarded_total = CounterVec::new(
        Opts::new("bridge_forwarded_total", "Requests forwarded by direction"),
        &["direction"],
    )
    .map_err(|e| BridgeError::InvalidArgument(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(forwarded_total.clone()))
        .map_err(|e| BridgeError::InvalidArgument(format!("metrics registration failed: {e}")))?;

    let decisions_total = CounterVec::new(
        Opts::new("bridge_decisions_total", "Model decisions by class"),
        &["decision"],
    )
    .map_err(|e| BridgeError::InvalidArgument(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(decisions_total.clone()))
        .map_err(|e| BridgeError::InvalidArgument(format!("metrics registration failed: {e}")))?;

    let predict_duration = Histogram::with_opts(HistogramOpts::new(
        "bridge_predict_duration_seconds",
        "Model inference latency",
    ))
    .map_err(|e| BridgeError::InvalidArgument(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(predict_duration.clone()))
        .map_err(|e| BridgeError::InvalidArgument(format!("metrics registration failed: {e}")))?;

    let queue_depth = IntGauge::new("bridge_queue_depth", "Current pending-request queue depth")
        .map_err(|e| BridgeError::InvalidArgument(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(queue_depth.clone()))
        .map_err(|e| BridgeError::InvalidArgument(format!("metrics registration failed: {e}")))?;

    // If another thread raced us, the first one wins — both initializations
    // produce identical metric descriptors, so neither outcome is incorrect.
    let _ = METRICS.set(Metrics {
        registry,
        requests_total,
        requests_rejected,
        forwarded_total,
        decisions_total,
        predict_duration,
        queue_depth,
    });

    Ok(())
}

/// Return a reference to the initialised [`Metrics`], or `None` if
/// [`init_metrics`] has not been called yet.
fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Public helper functions ────────────────────────────────────────────────

/// Increment the enqueued-request counter for a request kind label.
///
/// No-op if metrics have not been initialised.
///
/// # Panics
///
/// This function never panics.
pub fn inc_request(kind: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.requests_total.get_metric_with_label_values(&[kind]) {
            c.inc();
        }
    }
}

/// Increment the rejected-request counter for a reason label.
///
/// No-op if metrics have not been initialised.
///
/// # Panics
///
/// This function never panics.
pub fn inc_rejected(reason: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.requests_rejected.get_metric_with_label_values(&[reason]) {
            c.inc();
        }
    }
}

/// Increment the forwarded counter for a direction label
/// (`"to_kernel"` or `"to_caller"`).
///
/// No-op if metrics have not been initialised.
///
/// # Panics
///
/// This function never panics.
pub fn inc_forwarded(direction: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.forwarded_total.get_metric_with_label_values(&[direction]) {
            c.inc();
        }
    }
}

/// Increment the decision counter for a decision-class label.
///
/// No-op if metrics have not been initialised.
///
/// # Panics
///
/// This function never panics.
pub fn inc_decision(decision: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.decisions_total.get_metric_with_label_values(&[decision]) {
            c.inc();
        }
    }
}

/// Record one model-inference duration.
///
/// No-op if metrics have not been initialised.
///
/// # Panics
///
/// This function never panics.
pub fn observe_predict_duration(d: Duration) {
    if let Some(m) = metrics() {
        m.predict_duration.observe(d.as_secs_f64());
    }
}

/// Set the pending-request queue depth gauge.
///
/// No-op if metrics have not been initialised.
///
/// # Panics
///
/// This function never panics.
pub fn set_queue_depth(depth: i64) {
    if let Some(m) = metrics() {
        m.queue_depth.set(depth);
    }
}

/// Gather and encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised or if
/// encoding fails. Observability degrades gracefully rather than panicking.
///
/// # Panics
///
/// This function never panics.
pub fn gather_metrics() -> String {
    let Some(m) = metrics() else {
        return String::new();
    };
    let families = m.registry.gather();
    if families.is_empty() {
        return String::new();
    }
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
