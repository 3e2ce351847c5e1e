//! Declarative bridge configuration.
//!
//! ## Responsibility
//! Parse and validate TOML bridge configuration. Users define the bridge
//! topology declaratively and run the demo with:
//! ```text
//! cargo run --bin bridge-demo -- --config bridge.toml
//! ```
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `BridgeConfig`
//! - Validated: all semantic constraints are checked before a config is used
//! - Type-safe: invalid field combinations are caught at parse time via serde
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Building the runtime bridge from config (that belongs to `bridge`)
//! - Model state (that belongs to `model`)
//! - Metrics collection (that belongs to `metrics`)

use crate::{BridgeError, BridgeMode};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ── Default value functions ──────────────────────────────────────────────

/// Default request queue capacity: 1024 entries.
fn default_queue_capacity() -> usize {
    1024
}

/// Default batch window: 10ms.
fn default_batch_window_ms() -> u64 {
    10
}

/// Default device registry capacity: 256 devices.
fn default_max_devices() -> usize {
    256
}

/// Default enabled state: true.
fn default_true() -> bool {
    true
}

/// Default learning rate (recorded in the model state; no learning path
/// consumes it today).
fn default_learning_rate() -> f32 {
    0.01
}

/// Default model batch size hint.
fn default_model_batch_size() -> u32 {
    10
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for a bridge instance.
///
/// Deserialized from a TOML file and validated before use.
/// Every field has either a required value or a documented default.
///
/// # Example
///
/// ```toml
/// mode = "learning"
/// ai_enabled = true
/// queue_capacity = 1024
/// batch_window_ms = 10
///
/// [model]
/// learning_rate = 0.01
/// batch_size = 10
/// ```
///
/// # Panics
///
/// This type never panics during construction or access.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct BridgeConfig {
    /// Bridge operation mode. `learning` additionally records execution
    /// feedback into the model history.
    pub mode: BridgeMode,
    /// Whether the decision model is constructed and consulted per request.
    #[serde(default = "default_true")]
    pub ai_enabled: bool,
    /// Maximum number of pending requests in the bounded queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Batch window in milliseconds: how long the worker waits for more
    /// work before draining on timeout.
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,
    /// Maximum number of registered devices.
    #[serde(default = "default_max_devices")]
    pub max_devices: usize,
    /// Decision-model tuning block.
    #[serde(default)]
    pub model: ModelSection,
}

/// Decision-model tuning parameters.
///
/// `learning_rate` and `batch_size` are carried in the persisted model
/// state for forward compatibility; no online-learning path consumes them.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ModelSection {
    /// Learning rate recorded in the model state.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    /// Batch size hint recorded in the model state.
    #[serde(default = "default_model_batch_size")]
    pub batch_size: u32,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            batch_size: default_model_batch_size(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            mode: BridgeMode::AiAssisted,
            ai_enabled: true,
            queue_capacity: default_queue_capacity(),
            batch_window_ms: default_batch_window_ms(),
            max_devices: default_max_devices(),
            model: ModelSection::default(),
        }
    }
}

impl BridgeConfig {
    /// Parse a configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidArgument`] on parse or validation
    /// failure.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn from_toml_str(input: &str) -> Result<Self, BridgeError> {
        let config: Self = toml::from_str(input)
            .map_err(|e| BridgeError::InvalidArgument(format!("config parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Io`] if the file cannot be read and
    /// [`BridgeError::InvalidArgument`] on parse or validation failure.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn from_path(path: &Path) -> Result<Self, BridgeError> {
        let input = std::fs::read_to_string(path)?;
        Self::from_toml_str(&input)
    }

    /// Check semantic constraints that the type system cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidArgument`] naming the offending field.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.queue_capacity == 0 {
            return Err(BridgeError::InvalidArgument(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.batch_window_ms == 0 {
            return Err(BridgeError::InvalidArgument(
                "batch_window_ms must be at least 1".to_string(),
            ));
        }
        if self.max_devices == 0 {
            return Err(BridgeError::InvalidArgument(
                "max_devices must be at least 1".to_string(),
            ));
        }
        if !self.model.learning_rate.is_finite() || self.model.learning_rate <= 0.0 {
            return Err(BridgeError::InvalidArgument(format!(
                "model.learning_rate must be a positive finite number, got {}",
                self.model.learning_rate
            )));
        }
        Ok(())
    }

    /// Whether feedback recording is enabled for this configuration.
    ///
    /// Only [`BridgeMode::Learning`] records feedback; every other mode
    /// leaves the model history untouched.
    pub fn learning_enabled(&self) -> bool {
        self.mode == BridgeMode::Learning
    }
}

/// Export the JSON Schema for [`BridgeConfig`].
///
/// This enables IDE autocomplete when editing TOML config files.
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails (should not
/// happen with well-formed derive macros).
///
/// # Panics
///
/// This function never panics.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(BridgeConfig);
    serde_json::to_string_pretty(&schema)
}
