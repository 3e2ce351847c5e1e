//! Binary snapshot/restore of the full model state.
//!
//! ## Responsibility
//! Serialize the complete model state (weights, biases, scales, counters,
//! the full history ring, and the tuning block) to one opaque binary blob
//! and restore it bit-exactly.
//!
//! ## Guarantees
//! - Deterministic: every field is fixed-size, so the snapshot has a single
//!   expected byte count, checked on load
//! - Atomic restore: a failed load never partially overwrites the caller's
//!   in-memory state (decode happens into a fresh value)
//! - Error split: a missing/unreadable file is an I/O error; a file that
//!   read fine but has the wrong byte count or shape is a corrupt snapshot
//!
//! ## NOT Responsible For
//! - Locking (the owning model serializes save/load against inference)
//! - Snapshot versioning: the format carries no version field; an
//!   incompatible layout is reported as corrupt by the byte-count check

use super::history::{HistoryEntry, HistoryLog, StatsTracker, HISTORY_CAPACITY};
use super::network::{QuantizedNetwork, HIDDEN_SIZE, INPUT_SIZE, OUTPUT_SIZE};
use super::{ModelState, ModelTuning};
use crate::BridgeError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

/// On-disk layout of the model state.
///
/// Weight matrices are flattened row-major; all lengths are fixed by the
/// network topology and the history capacity.
#[derive(Debug, Serialize, Deserialize)]
struct ModelSnapshot {
    weights_input_hidden: Vec<i8>,
    weights_hidden_output: Vec<i8>,
    bias_hidden: Vec<i8>,
    bias_output: Vec<i8>,
    scale_input: f32,
    scale_hidden: f32,
    scale_output: f32,
    requests_processed: u64,
    successful_predictions: u64,
    failed_predictions: u64,
    avg_latency_us: u32,
    history: Vec<HistoryEntry>,
    history_index: u64,
    learning_enabled: bool,
    learning_rate: f32,
    batch_size: u32,
}

impl ModelSnapshot {
    fn from_state(state: &ModelState) -> Self {
        let (requests_processed, successful_predictions, failed_predictions, avg_latency_us) =
            state.stats.counters();
        Self {
            weights_input_hidden: state
                .network
                .weights_input_hidden
                .iter()
                .flatten()
                .copied()
                .collect(),
            weights_hidden_output: state
                .network
                .weights_hidden_output
                .iter()
                .flatten()
                .copied()
                .collect(),
            bias_hidden: state.network.bias_hidden.to_vec(),
            bias_output: state.network.bias_output.to_vec(),
            scale_input: state.network.scale_input,
            scale_hidden: state.network.scale_hidden,
            scale_output: state.network.scale_output,
            requests_processed,
            successful_predictions,
            failed_predictions,
            avg_latency_us,
            history: state.history.to_vec(),
            history_index: state.history.total_pushed(),
            learning_enabled: state.tuning.learning_enabled,
            learning_rate: state.tuning.learning_rate,
            batch_size: state.tuning.batch_size,
        }
    }

    fn into_state(self) -> Result<ModelState, BridgeError> {
        if self.weights_input_hidden.len() != INPUT_SIZE * HIDDEN_SIZE
            || self.weights_hidden_output.len() != HIDDEN_SIZE * OUTPUT_SIZE
            || self.bias_hidden.len() != HIDDEN_SIZE
            || self.bias_output.len() != OUTPUT_SIZE
            || self.history.len() != HISTORY_CAPACITY
        {
            return Err(BridgeError::ModelCorrupt(format!(
                "snapshot shape mismatch: weights {}x{}, biases {}/{}, history {}",
                self.weights_input_hidden.len(),
                self.weights_hidden_output.len(),
                self.bias_hidden.len(),
                self.bias_output.len(),
                self.history.len()
            )));
        }

        let mut network = QuantizedNetwork::zeroed();
        for (i, row) in network.weights_input_hidden.iter_mut().enumerate() {
            let offset = i * HIDDEN_SIZE;
            row.copy_from_slice(&self.weights_input_hidden[offset..offset + HIDDEN_SIZE]);
        }
        for (h, row) in network.weights_hidden_output.iter_mut().enumerate() {
            let offset = h * OUTPUT_SIZE;
            row.copy_from_slice(&self.weights_hidden_output[offset..offset + OUTPUT_SIZE]);
        }
        network.bias_hidden.copy_from_slice(&self.bias_hidden);
        network.bias_output.copy_from_slice(&self.bias_output);
        network.scale_input = self.scale_input;
        network.scale_hidden = self.scale_hidden;
        network.scale_output = self.scale_output;

        let mut entries = [HistoryEntry::EMPTY; HISTORY_CAPACITY];
        entries.copy_from_slice(&self.history);

        Ok(ModelState {
            network,
            stats: StatsTracker::from_counters(
                self.requests_processed,
                self.successful_predictions,
                self.failed_predictions,
                self.avg_latency_us,
            ),
            history: HistoryLog::from_parts(entries, self.history_index),
            tuning: ModelTuning {
                learning_enabled: self.learning_enabled,
                learning_rate: self.learning_rate,
                batch_size: self.batch_size,
            },
        })
    }
}

/// Exact byte count of a serialized snapshot.
///
/// Every field is fixed-size, so this is a constant of the layout.
pub(crate) fn snapshot_len() -> u64 {
    let empty = ModelSnapshot::from_state(&ModelState::zeroed());
    bincode::serialized_size(&empty).unwrap_or(0)
}

/// Serialize the model state and write it to `path`.
pub(crate) fn save(state: &ModelState, path: &Path) -> Result<(), BridgeError> {
    let snapshot = ModelSnapshot::from_state(state);
    let bytes = bincode::serialize(&snapshot)
        .map_err(|e| BridgeError::ModelCorrupt(format!("snapshot encode failed: {e}")))?;
    std::fs::write(path, &bytes)?;

    debug!(
        target: "bridge::model",
        path = %path.display(),
        bytes = bytes.len(),
        "model snapshot saved"
    );
    Ok(())
}

/// Read a snapshot from `path` and decode it into a fresh model state.
///
/// The caller swaps the returned state in only on success, which keeps a
/// failed load from clobbering live state.
pub(crate) fn load(path: &Path) -> Result<ModelState, BridgeError> {
    let bytes = std::fs::read(path)?;

    let expected = snapshot_len();
    if bytes.len() as u64 != expected {
        warn!(
            target: "bridge::model",
            path = %path.display(),
            got = bytes.len(),
            expected,
            "model snapshot has wrong byte count"
        );
        return Err(BridgeError::ModelCorrupt(format!(
            "snapshot is {} bytes, expected {expected}",
            bytes.len()
        )));
    }

    let snapshot: ModelSnapshot = bincode::deserialize(&bytes)
        .map_err(|e| BridgeError::ModelCorrupt(format!("snapshot decode failed: {e}")))?;
    let state = snapshot.into_state()?;

    debug!(
        target: "bridge::model",
        path = %path.display(),
        history_index = state.history.total_pushed(),
        "model snapshot restored"
    );
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn state_with_traffic() -> ModelState {
        let mut rng = StdRng::seed_from_u64(21);
        let mut state = ModelState {
            network: QuantizedNetwork::random(&mut rng),
            stats: StatsTracker::default(),
            history: HistoryLog::new(),
            tuning: ModelTuning {
                learning_enabled: true,
                learning_rate: 0.01,
                batch_size: 10,
            },
        };
        for i in 0..1500u32 {
            state.history.push(HistoryEntry {
                pattern: HistoryEntry::encode_pattern(crate::RequestKind::IoRead, i),
                decision: crate::Decision::Buffer,
                latency_us: i,
                success: i % 3 != 0,
            });
            state.stats.record_outcome(i, i % 3 != 0);
        }
        state.stats.note_request();
        state
    }

    #[test]
    fn test_snapshot_len_is_stable() {
        assert_eq!(snapshot_len(), snapshot_len());
        assert!(snapshot_len() > 0);
    }

    #[test]
    fn test_snapshot_len_independent_of_contents() {
        let empty = bincode::serialized_size(&ModelSnapshot::from_state(&ModelState::zeroed()))
            .unwrap_or(0);
        let busy =
            bincode::serialized_size(&ModelSnapshot::from_state(&state_with_traffic()))
                .unwrap_or(1);
        assert_eq!(empty, busy);
    }

    #[test]
    fn test_roundtrip_preserves_everything() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("model.bin");
        let state = state_with_traffic();

        save(&state, &path).expect("save must succeed");
        let restored = load(&path).expect("load must succeed");

        assert_eq!(restored.network, state.network);
        assert_eq!(restored.stats, state.stats);
        assert_eq!(restored.history.total_pushed(), state.history.total_pushed());
        assert!(restored.history.iter().eq(state.history.iter()));
        assert_eq!(restored.tuning, state.tuning);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = load(&dir.path().join("does-not-exist.bin"));
        assert!(matches!(result, Err(BridgeError::Io(_))));
    }

    #[test]
    fn test_truncated_file_is_model_corrupt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("model.bin");
        save(&state_with_traffic(), &path).expect("save must succeed");

        let mut bytes = std::fs::read(&path).expect("read back");
        bytes.truncate(bytes.len() / 2);
        std::fs::write(&path, &bytes).expect("rewrite truncated");

        let result = load(&path);
        assert!(matches!(result, Err(BridgeError::ModelCorrupt(_))));
    }

    #[test]
    fn test_oversized_file_is_model_corrupt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("model.bin");
        save(&state_with_traffic(), &path).expect("save must succeed");

        let mut bytes = std::fs::read(&path).expect("read back");
        bytes.extend_from_slice(&[0u8; 16]);
        std::fs::write(&path, &bytes).expect("rewrite padded");

        let result = load(&path);
        assert!(matches!(result, Err(BridgeError::ModelCorrupt(_))));
    }
}
