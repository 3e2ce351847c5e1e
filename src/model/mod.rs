//! The quantized decision model.
//!
//! ## Responsibility
//! Turn a device request plus rolling history into a [`Prediction`], collect
//! execution feedback into rolling statistics, and snapshot/restore the whole
//! model state. Also hosts the model-adjacent pure helpers: request
//! optimization, failure-probability estimation, and batch grouping.
//!
//! ## Guarantees
//! - Thread-safe: the entire model state sits behind one mutex; predict,
//!   feedback, stats, save and load all serialize on it. Inference is cheap
//!   and bounded, so serialized access is not the throughput bottleneck.
//! - Reproducible: identical weights + features produce identical output.
//! - No online learning: feedback is recorded, weights are never updated.
//!   The tuning block carries a learning rate for forward compatibility,
//!   but no code path consumes it.
//!
//! ## NOT Responsible For
//! - Queueing or forwarding (that belongs to `queue` / `worker`)
//! - Device bookkeeping (that belongs to `bridge`)

pub mod features;
pub mod history;
pub mod network;
mod store;

use crate::{BridgeError, Decision, DeviceRequest, Prediction, RequestKind};
use history::{HistoryEntry, HistoryLog, StatsTracker};
use network::QuantizedNetwork;
use parking_lot::Mutex;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info};

pub use history::{ModelStats, HISTORY_CAPACITY};
pub use network::{HIDDEN_SIZE, INPUT_SIZE, OUTPUT_SIZE};

/// Model configuration carried inside the persisted state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelTuning {
    /// Whether feedback is recorded into the history ring. This flag gates
    /// recording only; nothing learns regardless.
    pub learning_enabled: bool,
    /// Learning rate recorded for forward compatibility; unused today.
    pub learning_rate: f32,
    /// Batch size hint recorded for forward compatibility; unused today.
    pub batch_size: u32,
}

impl Default for ModelTuning {
    fn default() -> Self {
        Self {
            learning_enabled: false,
            learning_rate: 0.01,
            batch_size: 10,
        }
    }
}

/// The complete mutable model state; the unit of persistence.
pub(crate) struct ModelState {
    pub(crate) network: QuantizedNetwork,
    pub(crate) stats: StatsTracker,
    pub(crate) history: HistoryLog,
    pub(crate) tuning: ModelTuning,
}

impl ModelState {
    pub(crate) fn zeroed() -> Self {
        Self {
            network: QuantizedNetwork::zeroed(),
            stats: StatsTracker::default(),
            history: HistoryLog::new(),
            tuning: ModelTuning::default(),
        }
    }
}

/// Quantized feed-forward decision model with rolling feedback statistics.
///
/// Construct one per bridge instance; there are no process-wide singletons,
/// so tests build independent models per case.
pub struct DecisionModel {
    state: Mutex<ModelState>,
}

impl DecisionModel {
    /// Create a model with freshly initialised random weights.
    pub fn new(tuning: ModelTuning) -> Self {
        let mut rng = rand::thread_rng();
        Self::with_network(QuantizedNetwork::random(&mut rng), tuning)
    }

    /// Create a model over explicit network parameters.
    ///
    /// Primarily useful for deterministic tests.
    pub fn with_network(network: QuantizedNetwork, tuning: ModelTuning) -> Self {
        Self {
            state: Mutex::new(ModelState {
                network,
                stats: StatsTracker::default(),
                history: HistoryLog::new(),
                tuning,
            }),
        }
    }

    /// Run one request through the network and interpret the output vector.
    ///
    /// Output convention (fixed): outputs 0..6 are the decision classes,
    /// where argmax picks the decision and the max probability is the
    /// confidence;
    /// output 6 × 10000 is the latency estimate in µs; output 7 > 0.5 means
    /// batch; output 8 × 1000 is the batch delay in µs. Outputs 9..16 are
    /// computed but unused, since softmax normalization depends on all of
    /// them.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidArgument`] if the request fails field
    /// validation.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn predict(&self, request: &DeviceRequest) -> Result<Prediction, BridgeError> {
        request.validate()?;

        let started = Instant::now();
        let mut state = self.state.lock();

        let feature_vec = features::extract(request, &state.history, crate::monotonic_now_ns());
        let output = state.network.forward(&feature_vec);

        let mut class = 0usize;
        let mut confidence = output[0];
        for (i, &p) in output.iter().enumerate().take(6).skip(1) {
            if p > confidence {
                confidence = p;
                class = i;
            }
        }

        let should_batch = output[7] > 0.5;
        let prediction = Prediction {
            decision: Decision::from_class_index(class),
            confidence,
            estimated_latency_us: (output[6] * 10_000.0) as u32,
            should_batch,
            batch_delay_us: if should_batch {
                (output[8] * 1_000.0) as u32
            } else {
                0
            },
        };

        state.stats.note_request();
        drop(state);

        crate::metrics::observe_predict_duration(started.elapsed());
        debug!(
            target: "bridge::model",
            device_id = request.device_id,
            decision = ?prediction.decision,
            confidence = prediction.confidence,
            "prediction served"
        );

        Ok(prediction)
    }

    /// Record one execution outcome.
    ///
    /// Appends a history record, bumps the success/failure counters, and
    /// folds the observed latency into the moving average. A no-op when
    /// learning is disabled in the tuning block; the flag gates recording
    /// even though no weight update exists either way.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn record_feedback(
        &self,
        request: &DeviceRequest,
        prediction: &Prediction,
        actual_latency_us: u32,
        success: bool,
    ) {
        let mut state = self.state.lock();
        if !state.tuning.learning_enabled {
            return;
        }

        state.history.push(HistoryEntry {
            pattern: HistoryEntry::encode_pattern(request.kind, request.device_id),
            decision: prediction.decision,
            latency_us: actual_latency_us,
            success,
        });
        state.stats.record_outcome(actual_latency_us, success);
    }

    /// Estimate the failure probability for a request from matching history.
    ///
    /// Scans the history for entries whose encoded kind matches and returns
    /// `failures / total`, or `0.5` when no matching history exists, the
    /// prior under total ignorance.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn predict_failure(&self, request: &DeviceRequest) -> f32 {
        let state = self.state.lock();

        let mut failures = 0u32;
        let mut total = 0u32;
        for entry in state.history.iter() {
            if entry.kind_byte() == request.kind.as_u8() {
                total += 1;
                if !entry.success {
                    failures += 1;
                }
            }
        }

        if total > 0 {
            failures as f32 / total as f32
        } else {
            0.5
        }
    }

    /// Pure size optimization; no model involvement.
    ///
    /// Read/write requests are aligned up to the 64-byte cache line (minimum
    /// 64); DMA allocations are aligned up to the 4096-byte page; all other
    /// kinds pass through unchanged.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn optimize(request: &DeviceRequest) -> DeviceRequest {
        let mut optimized = request.clone();
        match request.kind {
            RequestKind::IoRead | RequestKind::IoWrite => {
                optimized.size = if optimized.size < 64 {
                    64
                } else {
                    (optimized.size + 63) & !63
                };
            }
            RequestKind::DmaAlloc => {
                optimized.size = (optimized.size + 4095) & !4095;
            }
            _ => {}
        }
        optimized
    }

    /// Group pending requests for batching.
    ///
    /// Two requests share a group iff their `(kind, device_id)` pairs are
    /// exactly equal; group ids are assigned in first-seen order. Returns
    /// the per-request group ids and the group count. No model inference is
    /// involved despite the name.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn predict_batch(requests: &[DeviceRequest]) -> (Vec<u32>, u32) {
        let mut groups = vec![0u32; requests.len()];
        let mut next_group = 0u32;

        for i in 0..requests.len() {
            let mut found = None;
            for j in 0..i {
                if requests[i].kind == requests[j].kind
                    && requests[i].device_id == requests[j].device_id
                {
                    found = Some(groups[j]);
                    break;
                }
            }
            groups[i] = match found {
                Some(g) => g,
                None => {
                    let g = next_group;
                    next_group += 1;
                    g
                }
            };
        }

        (groups, next_group)
    }

    /// Snapshot of the rolling statistics.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn stats(&self) -> ModelStats {
        self.state.lock().stats.snapshot()
    }

    /// Current tuning block.
    pub fn tuning(&self) -> ModelTuning {
        self.state.lock().tuning
    }

    /// Toggle feedback recording.
    pub fn set_learning_enabled(&self, enabled: bool) {
        self.state.lock().tuning.learning_enabled = enabled;
    }

    /// Write the full model state to `path` as one opaque binary blob.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Io`] on write failure.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn save(&self, path: &Path) -> Result<(), BridgeError> {
        let state = self.state.lock();
        store::save(&state, path)
    }

    /// Replace the full model state from a snapshot at `path`.
    ///
    /// On any failure the previous in-memory state is left unchanged.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::Io`] if the file is missing or unreadable.
    /// - [`BridgeError::ModelCorrupt`] if the read succeeded but the byte
    ///   count or shape does not match the expected layout.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn load(&self, path: &Path) -> Result<(), BridgeError> {
        let restored = store::load(path)?;
        let mut state = self.state.lock();
        *state = restored;
        info!(
            target: "bridge::model",
            path = %path.display(),
            "model state replaced from snapshot"
        );
        Ok(())
    }
}

impl std::fmt::Debug for DecisionModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DecisionModel")
            .field("requests_processed", &state.stats.snapshot().requests_processed)
            .field("history_len", &state.history.len())
            .field("learning_enabled", &state.tuning.learning_enabled)
            .finish()
    }
}
