//! # tokio-request-bridge
//!
//! An AI-assisted request bridging engine over Tokio.
//!
//! ## Architecture
//!
//! Callers enqueue device requests into a bounded queue; a single batching
//! worker drains the queue on wake (new work or batch-window timeout) and
//! routes each entry through a small quantized feed-forward decision model
//! before forwarding it to the kernel-side collaborator:
//!
//! ```text
//! caller → RequestQueue(1024) → BatchWorker → DecisionModel → KernelForwarder
//!                                      ↑ feedback (latency, success)
//! ```
//!
//! The model predicts a handling decision, a confidence, an estimated service
//! latency, and a batching recommendation. Execution feedback only updates
//! rolling statistics; weights are never adjusted online.

// ── Lint policy (aerospace-grade) ─────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Instant;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod bridge;
pub mod config;
pub mod metrics;
pub mod model;
pub mod queue;
pub mod worker;

// Re-exports for convenience
pub use bridge::{Bridge, BridgeStats, DeviceContext};
pub use config::BridgeConfig;
pub use model::DecisionModel;
pub use worker::{KernelForwarder, PacketFilter, SimulatedKernel, WorkerState};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"` — structured JSON output for production log aggregators
/// - anything else (including unset) — human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`BridgeError::InvalidArgument`] if the global subscriber has
/// already been set (e.g. by a previous call or a test harness).
///
/// # Panics
///
/// This function never panics.
pub fn init_tracing() -> Result<(), BridgeError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| BridgeError::InvalidArgument(format!("tracing init failed: {e}")))
}

/// Top-level bridge errors.
///
/// Every error surface in the engine is mapped to a variant here.
/// All variants implement `std::error::Error` via [`thiserror`].
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The bridge (or its AI subsystem) has not been initialised, or has
    /// already been shut down.
    #[error("bridge not initialized")]
    NotInitialized,

    /// A required field is missing or out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A bounded resource (request queue, device registry) is full.
    ///
    /// Recoverable and expected under load; callers should retry later.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// The referenced device is not registered.
    #[error("not found: {0}")]
    NotFound(String),

    /// Reading or writing a model snapshot failed at the I/O layer.
    #[error("model i/o failed: {0}")]
    Io(#[from] std::io::Error),

    /// A model snapshot was read successfully but its byte layout does not
    /// match the expected model shape.
    #[error("model snapshot corrupt: {0}")]
    ModelCorrupt(String),
}

/// Kind of a device request crossing the bridge.
///
/// The discriminant values are part of the feature-encoding contract
/// (`kind / 7` is the first model feature) and of the history pattern
/// encoding (`kind << 24 | device_id & 0xFF_FFFF`). Do not reorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum RequestKind {
    /// Memory-mapped or port I/O read.
    IoRead = 0,
    /// Memory-mapped or port I/O write.
    IoWrite = 1,
    /// DMA buffer allocation.
    DmaAlloc = 2,
    /// Interrupt delivery or acknowledgement.
    Interrupt = 3,
    /// PCI configuration-space access.
    PciConfig = 4,
    /// Device power-state transition.
    PowerState = 5,
    /// Anything the caller could not classify.
    Unknown = 6,
}

impl RequestKind {
    /// Number of known discriminants, including [`RequestKind::Unknown`].
    pub const COUNT: u32 = 7;

    /// The discriminant as a byte, as used in history pattern encoding.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Handling decision predicted by the model for a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Pass directly to the kernel side.
    PassThrough,
    /// Buffer and batch with similar requests.
    Buffer,
    /// Optimise (align/round sizes) before passing.
    Optimize,
    /// Defer to a later batch.
    Defer,
    /// Reject as invalid.
    Reject,
    /// Retry with modifications.
    Retry,
}

impl Decision {
    /// Map an output-class index (0..6) back to a decision.
    ///
    /// Out-of-range indices fold to [`Decision::PassThrough`]; the model
    /// only ever produces indices in range.
    pub(crate) fn from_class_index(index: usize) -> Self {
        match index {
            1 => Decision::Buffer,
            2 => Decision::Optimize,
            3 => Decision::Defer,
            4 => Decision::Reject,
            5 => Decision::Retry,
            _ => Decision::PassThrough,
        }
    }
}

/// Chipset family of a registered device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChipsetKind {
    /// Intel chipsets.
    Intel,
    /// AMD chipsets.
    Amd,
    /// NVIDIA chipsets.
    Nvidia,
    /// Qualcomm chipsets.
    Qualcomm,
    /// Unrecognised chipset, handled generically.
    Unknown,
}

/// Bridge operation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BridgeMode {
    /// Direct pass-through; requests are forwarded without inference.
    Passthrough,
    /// The model predicts a decision for every request.
    AiAssisted,
    /// As [`BridgeMode::AiAssisted`]; reserved for callers that act on
    /// predictions without confirmation.
    Autonomous,
    /// As [`BridgeMode::AiAssisted`], and execution feedback is recorded
    /// into the model's history.
    Learning,
}

/// A single device request submitted to the bridge.
///
/// Immutable once enqueued. The queue stores an owned clone, so producers
/// may drop or reuse their copy immediately after
/// [`Bridge::enqueue_request`](bridge::Bridge::enqueue_request) returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRequest {
    /// What the request asks the kernel side to do.
    pub kind: RequestKind,
    /// Identifier of the originating device.
    pub device_id: u32,
    /// Target address, if the kind addresses memory or I/O space.
    pub address: u64,
    /// Payload or transfer size in bytes.
    pub size: u32,
    /// Optional payload bytes.
    pub data: Option<Vec<u8>>,
    /// Kind-specific flag bits.
    pub flags: u32,
    /// Monotonic creation timestamp in nanoseconds
    /// (see [`monotonic_now_ns`]).
    pub timestamp_ns: u64,
    /// Priority in `0..=10`; higher is more urgent.
    pub priority: u32,
}

impl DeviceRequest {
    /// Highest accepted priority value.
    pub const MAX_PRIORITY: u32 = 10;

    /// Create a request of the given kind for a device, stamped with the
    /// current monotonic time and default (zero) fields.
    pub fn new(kind: RequestKind, device_id: u32) -> Self {
        Self {
            kind,
            device_id,
            address: 0,
            size: 0,
            data: None,
            flags: 0,
            timestamp_ns: monotonic_now_ns(),
            priority: 0,
        }
    }

    /// Set the target address.
    pub fn with_address(mut self, address: u64) -> Self {
        self.address = address;
        self
    }

    /// Set the transfer size in bytes.
    pub fn with_size(mut self, size: u32) -> Self {
        self.size = size;
        self
    }

    /// Attach payload bytes (also sets `size` to the payload length).
    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.size = data.len() as u32;
        self.data = Some(data);
        self
    }

    /// Set kind-specific flag bits.
    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    /// Set the priority (`0..=10`).
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Check field-level invariants that the type system cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidArgument`] if `priority` exceeds
    /// [`DeviceRequest::MAX_PRIORITY`].
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.priority > Self::MAX_PRIORITY {
            return Err(BridgeError::InvalidArgument(format!(
                "priority {} exceeds maximum {}",
                self.priority,
                Self::MAX_PRIORITY
            )));
        }
        Ok(())
    }
}

/// Full prediction produced by the decision model for one request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    /// The predicted handling decision (argmax over the decision classes).
    pub decision: Decision,
    /// Probability mass assigned to the chosen decision, in `[0, 1]`.
    pub confidence: f32,
    /// Estimated service latency in microseconds.
    pub estimated_latency_us: u32,
    /// Whether the request should be held for batching.
    pub should_batch: bool,
    /// Suggested batching delay in microseconds; zero unless
    /// `should_batch` is set.
    pub batch_delay_us: u32,
}

/// Nanoseconds elapsed on a process-wide monotonic clock.
///
/// Request timestamps and the age feature both derive from this clock, so
/// ages computed inside the engine are always non-negative.
///
/// # Panics
///
/// This function never panics.
pub fn monotonic_now_ns() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = *EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_kind_discriminants_are_stable() {
        assert_eq!(RequestKind::IoRead.as_u8(), 0);
        assert_eq!(RequestKind::IoWrite.as_u8(), 1);
        assert_eq!(RequestKind::DmaAlloc.as_u8(), 2);
        assert_eq!(RequestKind::Interrupt.as_u8(), 3);
        assert_eq!(RequestKind::PciConfig.as_u8(), 4);
        assert_eq!(RequestKind::PowerState.as_u8(), 5);
        assert_eq!(RequestKind::Unknown.as_u8(), 6);
        assert_eq!(RequestKind::COUNT, 7);
    }

    #[test]
    fn test_decision_from_class_index_round_trips() {
        assert_eq!(Decision::from_class_index(0), Decision::PassThrough);
        assert_eq!(Decision::from_class_index(1), Decision::Buffer);
        assert_eq!(Decision::from_class_index(2), Decision::Optimize);
        assert_eq!(Decision::from_class_index(3), Decision::Defer);
        assert_eq!(Decision::from_class_index(4), Decision::Reject);
        assert_eq!(Decision::from_class_index(5), Decision::Retry);
    }

    #[test]
    fn test_request_builder_sets_fields() {
        let req = DeviceRequest::new(RequestKind::IoWrite, 0x1234)
            .with_address(0xDEAD_BEEF)
            .with_size(128)
            .with_flags(0x3)
            .with_priority(7);
        assert_eq!(req.kind, RequestKind::IoWrite);
        assert_eq!(req.device_id, 0x1234);
        assert_eq!(req.address, 0xDEAD_BEEF);
        assert_eq!(req.size, 128);
        assert_eq!(req.flags, 0x3);
        assert_eq!(req.priority, 7);
        assert!(req.data.is_none());
    }

    #[test]
    fn test_with_data_sets_size_from_payload() {
        let req = DeviceRequest::new(RequestKind::IoWrite, 1).with_data(vec![0u8; 77]);
        assert_eq!(req.size, 77);
        assert_eq!(req.data.as_ref().map(Vec::len), Some(77));
    }

    #[test]
    fn test_validate_rejects_priority_over_ten() {
        let req = DeviceRequest::new(RequestKind::IoRead, 1).with_priority(11);
        assert!(matches!(
            req.validate(),
            Err(BridgeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_validate_accepts_priority_boundary() {
        let req = DeviceRequest::new(RequestKind::IoRead, 1).with_priority(10);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_monotonic_now_ns_is_non_decreasing() {
        let a = monotonic_now_ns();
        let b = monotonic_now_ns();
        assert!(b >= a);
    }

    #[test]
    fn test_bridge_error_display_includes_detail() {
        let err = BridgeError::CapacityExceeded("request queue full (1024 entries)".to_string());
        assert!(err.to_string().contains("request queue full"));
    }

    #[test]
    fn test_request_kind_serializes_to_snake_case() {
        let json = serde_json::to_string(&RequestKind::DmaAlloc).unwrap_or_default();
        assert_eq!(json, "\"dma_alloc\"");
    }

    #[test]
    fn test_bridge_mode_deserializes_from_snake_case() {
        let mode: Result<BridgeMode, _> = serde_json::from_str("\"ai_assisted\"");
        assert_eq!(mode.ok(), Some(BridgeMode::AiAssisted));
    }
}
