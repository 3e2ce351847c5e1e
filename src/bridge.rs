//! The bridge: device registry, statistics, and lifecycle.
//!
//! ## Responsibility
//! Own every piece of runtime state (the bounded queue, the optional
//! decision model, the device registry, the counters) and expose the
//! caller-facing API: register/unregister devices, enqueue requests, submit
//! feedback, complete responses, snapshot the model, and read statistics.
//!
//! ## Guarantees
//! - No ambient singletons: all state lives in the constructed `Bridge`;
//!   tests build independent instances per case
//! - One worker: exactly one background task drains the queue per instance
//! - Independent locks: the registry, the queue, and the model each have
//!   their own lock, so device bookkeeping never contends with the hot
//!   request path
//! - Cooperative shutdown: the worker observes the stop flag at the top of
//!   its next cycle and is woken immediately rather than waiting out its
//!   batch window
//!
//! ## NOT Responsible For
//! - Actual device I/O (the injected [`KernelForwarder`] collaborator)
//! - Model numerics (that belongs to `model`)

use crate::config::BridgeConfig;
use crate::model::{DecisionModel, ModelTuning};
use crate::queue::{QueueEntry, RequestQueue};
use crate::worker::{BatchWorker, KernelForwarder, PacketFilter, WorkerState};
use crate::{metrics, BridgeError, BridgeMode, ChipsetKind, DeviceRequest, Prediction, RequestKind};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Registry record correlating an external device with bridge-managed state.
///
/// Handed out as `Arc<DeviceContext>`; the queue clones the `Arc` into every
/// entry it holds, so a context stays alive until its last queued request
/// has drained even if the device was unregistered in the meantime.
#[derive(Debug)]
pub struct DeviceContext {
    /// External device identifier.
    pub device_id: u32,
    /// Chipset family reported at registration.
    pub chipset: ChipsetKind,
    /// Whether requests from this device are routed through the model.
    pub ai_managed: bool,
    active_requests: AtomicU32,
}

impl DeviceContext {
    /// Create a context record. Used by the bridge at registration time.
    pub fn new(device_id: u32, chipset: ChipsetKind, ai_managed: bool) -> Self {
        Self {
            device_id,
            chipset,
            ai_managed,
            active_requests: AtomicU32::new(0),
        }
    }

    /// Number of requests enqueued for this device and not yet completed.
    pub fn active_requests(&self) -> u32 {
        self.active_requests.load(Ordering::Relaxed)
    }

    pub(crate) fn note_enqueued(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_completed(&self) {
        // Saturating decrement: completions can race unregistration.
        let _ = self
            .active_requests
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }
}

/// Shared counters mutated by the bridge and its worker.
#[derive(Debug, Default)]
pub(crate) struct BridgeCounters {
    pub(crate) total_requests: AtomicU64,
    pub(crate) forwarded_to_kernel: AtomicU64,
    pub(crate) forwarded_to_caller: AtomicU64,
    pub(crate) ai_optimized: AtomicU64,
    pub(crate) ai_batched: AtomicU64,
    pub(crate) dropped: AtomicU64,
    pub(crate) failures: AtomicU64,
}

/// Point-in-time snapshot of the bridge's observability surface.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BridgeStats {
    /// Requests submitted via `enqueue_request`, accepted or not.
    pub total_requests: u64,
    /// Requests the worker forwarded to the kernel collaborator.
    pub forwarded_to_kernel: u64,
    /// Responses completed back toward the caller side.
    pub forwarded_to_caller: u64,
    /// Requests that received a model decision.
    pub ai_optimized: u64,
    /// Requests whose prediction recommended batching.
    pub ai_batched: u64,
    /// Requests vetoed by the packet filter.
    pub dropped: u64,
    /// Enqueue rejections, prediction errors, and forwarding failures.
    pub failures: u64,
    /// Smoothed observed latency from feedback, in microseconds.
    pub avg_latency_us: u32,
    /// Model prediction accuracy from feedback, in `[0, 1]`.
    pub ai_accuracy: f32,
}

/// The AI-assisted request bridge.
///
/// Construct with [`Bridge::new`]; drop or [`Bridge::shutdown`] to stop the
/// worker. All methods are safe to call concurrently with the worker and
/// with each other.
pub struct Bridge {
    mode: Mutex<BridgeMode>,
    ai_enabled: bool,
    queue: Arc<RequestQueue>,
    model: Option<Arc<DecisionModel>>,
    registry: Mutex<HashMap<u32, Arc<DeviceContext>>>,
    max_devices: usize,
    counters: Arc<BridgeCounters>,
    shutdown_tx: watch::Sender<bool>,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
    worker_state: Arc<AtomicU8>,
    running: AtomicBool,
}

impl Bridge {
    /// Build a bridge and spawn its worker on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::InvalidArgument`] if the configuration fails
    ///   validation, or if no tokio runtime is available to host the worker;
    ///   that is the only fatal init condition.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn new(
        config: BridgeConfig,
        forwarder: Arc<dyn KernelForwarder>,
    ) -> Result<Self, BridgeError> {
        Self::with_filter(config, forwarder, None)
    }

    /// As [`Bridge::new`], with an inbound [`PacketFilter`] veto hook.
    ///
    /// # Errors
    ///
    /// See [`Bridge::new`].
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn with_filter(
        config: BridgeConfig,
        forwarder: Arc<dyn KernelForwarder>,
        filter: Option<Arc<dyn PacketFilter>>,
    ) -> Result<Self, BridgeError> {
        config.validate()?;

        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            BridgeError::InvalidArgument(format!(
                "bridge worker needs a running tokio runtime: {e}"
            ))
        })?;

        let model = config.ai_enabled.then(|| {
            Arc::new(DecisionModel::new(ModelTuning {
                learning_enabled: config.learning_enabled(),
                learning_rate: config.model.learning_rate,
                batch_size: config.model.batch_size,
            }))
        });

        let queue = Arc::new(RequestQueue::new(config.queue_capacity));
        let counters = Arc::new(BridgeCounters::default());
        let worker_state = Arc::new(AtomicU8::new(WorkerState::Idle as u8));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = BatchWorker {
            queue: Arc::clone(&queue),
            model: model.clone(),
            forwarder,
            filter,
            counters: Arc::clone(&counters),
            batch_window: Duration::from_millis(config.batch_window_ms),
            shutdown: shutdown_rx,
            state: Arc::clone(&worker_state),
        };
        let worker_handle = runtime.spawn(worker.run());

        info!(
            target: "bridge",
            mode = ?config.mode,
            ai_enabled = config.ai_enabled,
            queue_capacity = config.queue_capacity,
            batch_window_ms = config.batch_window_ms,
            "bridge initialised"
        );

        Ok(Self {
            mode: Mutex::new(config.mode),
            ai_enabled: config.ai_enabled,
            queue,
            model,
            registry: Mutex::new(HashMap::new()),
            max_devices: config.max_devices,
            counters,
            shutdown_tx,
            worker_handle: Mutex::new(Some(worker_handle)),
            worker_state,
            running: AtomicBool::new(true),
        })
    }

    fn ensure_running(&self) -> Result<(), BridgeError> {
        if self.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BridgeError::NotInitialized)
        }
    }

    /// Register a device and receive its context handle.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::NotInitialized`] after shutdown.
    /// - [`BridgeError::CapacityExceeded`] when the registry is full.
    /// - [`BridgeError::InvalidArgument`] for a duplicate device id.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn register_device(
        &self,
        device_id: u32,
        chipset: ChipsetKind,
    ) -> Result<Arc<DeviceContext>, BridgeError> {
        self.ensure_running()?;

        let mut registry = self.registry.lock();
        if registry.len() >= self.max_devices {
            return Err(BridgeError::CapacityExceeded(format!(
                "device registry full ({} devices)",
                self.max_devices
            )));
        }
        if registry.contains_key(&device_id) {
            return Err(BridgeError::InvalidArgument(format!(
                "device {device_id:#x} already registered"
            )));
        }

        let ctx = Arc::new(DeviceContext::new(device_id, chipset, self.ai_enabled));
        registry.insert(device_id, Arc::clone(&ctx));

        info!(
            target: "bridge",
            device_id = format_args!("{device_id:#x}"),
            chipset = ?chipset,
            registered = registry.len(),
            "device registered"
        );
        Ok(ctx)
    }

    /// Remove a device from the registry.
    ///
    /// Requests already queued for the device are still processed; every
    /// queue entry holds its own keep-alive on the context.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::NotInitialized`] after shutdown.
    /// - [`BridgeError::NotFound`] for an unknown device id.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn unregister_device(&self, device_id: u32) -> Result<(), BridgeError> {
        self.ensure_running()?;

        let removed = self
            .registry
            .lock()
            .remove(&device_id)
            .ok_or_else(|| BridgeError::NotFound(format!("device {device_id:#x}")))?;

        let outstanding = removed.active_requests();
        if outstanding > 0 {
            warn!(
                target: "bridge",
                device_id = format_args!("{device_id:#x}"),
                outstanding,
                "device unregistered with requests still queued"
            );
        } else {
            info!(
                target: "bridge",
                device_id = format_args!("{device_id:#x}"),
                "device unregistered"
            );
        }
        Ok(())
    }

    /// Enqueue a request for the worker's next batch.
    ///
    /// The queue takes an owned clone; the caller keeps its copy. The
    /// consumer is woken on every successful enqueue, but whether this
    /// request lands in an in-progress drain or the next one is an accepted
    /// race.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::NotInitialized`] after shutdown.
    /// - [`BridgeError::InvalidArgument`] if the request fails validation.
    /// - [`BridgeError::NotFound`] for an unregistered device.
    /// - [`BridgeError::CapacityExceeded`] when the queue is full.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn enqueue_request(
        &self,
        device_id: u32,
        request: &DeviceRequest,
    ) -> Result<(), BridgeError> {
        self.ensure_running()?;
        self.counters.total_requests.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = request.validate() {
            metrics::inc_rejected("invalid");
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        let ctx = self
            .registry
            .lock()
            .get(&device_id)
            .cloned()
            .ok_or_else(|| BridgeError::NotFound(format!("device {device_id:#x}")))?;

        metrics::inc_request(kind_label(request.kind));
        match self.queue.enqueue(QueueEntry {
            request: request.clone(),
            context: Arc::clone(&ctx),
        }) {
            Ok(()) => {
                ctx.note_enqueued();
                Ok(())
            }
            Err(e) => {
                metrics::inc_rejected("queue_full");
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Report the observed outcome of a previously predicted request.
    ///
    /// Recorded into the model history when learning is enabled; a no-op
    /// when the model is disabled.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotInitialized`] after shutdown.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn submit_feedback(
        &self,
        request: &DeviceRequest,
        prediction: &Prediction,
        actual_latency_us: u32,
        success: bool,
    ) -> Result<(), BridgeError> {
        self.ensure_running()?;
        if let Some(model) = &self.model {
            model.record_feedback(request, prediction, actual_latency_us, success);
        }
        Ok(())
    }

    /// Complete a response back toward the caller side of the bridge.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::NotInitialized`] after shutdown.
    /// - [`BridgeError::NotFound`] for an unregistered device.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn complete_request(&self, device_id: u32, data: &[u8]) -> Result<(), BridgeError> {
        self.ensure_running()?;

        let ctx = self
            .registry
            .lock()
            .get(&device_id)
            .cloned()
            .ok_or_else(|| BridgeError::NotFound(format!("device {device_id:#x}")))?;

        ctx.note_completed();
        self.counters
            .forwarded_to_caller
            .fetch_add(1, Ordering::Relaxed);
        metrics::inc_forwarded("to_caller");

        debug!(
            target: "bridge",
            device_id = format_args!("{device_id:#x}"),
            size = data.len(),
            "response completed toward caller"
        );
        Ok(())
    }

    /// Change the operation mode.
    ///
    /// Switching into [`BridgeMode::Learning`] enables feedback recording;
    /// switching out disables it.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotInitialized`] after shutdown.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn set_mode(&self, mode: BridgeMode) -> Result<(), BridgeError> {
        self.ensure_running()?;
        *self.mode.lock() = mode;
        if let Some(model) = &self.model {
            model.set_learning_enabled(mode == BridgeMode::Learning);
        }
        info!(target: "bridge", mode = ?mode, "mode changed");
        Ok(())
    }

    /// Current operation mode.
    pub fn mode(&self) -> BridgeMode {
        *self.mode.lock()
    }

    /// The decision model, when AI is enabled.
    pub fn model(&self) -> Option<&Arc<DecisionModel>> {
        self.model.as_ref()
    }

    /// Number of currently registered devices.
    pub fn device_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// Number of requests currently queued.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Current worker lifecycle state.
    pub fn worker_state(&self) -> WorkerState {
        WorkerState::from_u8(self.worker_state.load(Ordering::Acquire))
    }

    /// Persist the model state to `path`.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::NotInitialized`] after shutdown or when AI is
    ///   disabled.
    /// - [`BridgeError::Io`] on write failure.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn save_model(&self, path: &Path) -> Result<(), BridgeError> {
        self.ensure_running()?;
        self.model
            .as_ref()
            .ok_or(BridgeError::NotInitialized)?
            .save(path)
    }

    /// Restore the model state from `path`, fully replacing it on success.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::NotInitialized`] after shutdown or when AI is
    ///   disabled.
    /// - [`BridgeError::Io`] / [`BridgeError::ModelCorrupt`] from the
    ///   snapshot layer; the previous state is kept on failure.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn load_model(&self, path: &Path) -> Result<(), BridgeError> {
        self.ensure_running()?;
        self.model
            .as_ref()
            .ok_or(BridgeError::NotInitialized)?
            .load(path)
    }

    /// Snapshot the observability surface.
    ///
    /// Counter reads are relaxed; the snapshot is consistent enough for
    /// monitoring, not a linearizable view.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn stats(&self) -> BridgeStats {
        let (avg_latency_us, ai_accuracy) = match &self.model {
            Some(model) => {
                let stats = model.stats();
                (stats.avg_latency_us, stats.accuracy)
            }
            None => (0, 0.0),
        };

        BridgeStats {
            total_requests: self.counters.total_requests.load(Ordering::Relaxed),
            forwarded_to_kernel: self.counters.forwarded_to_kernel.load(Ordering::Relaxed),
            forwarded_to_caller: self.counters.forwarded_to_caller.load(Ordering::Relaxed),
            ai_optimized: self.counters.ai_optimized.load(Ordering::Relaxed),
            ai_batched: self.counters.ai_batched.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            avg_latency_us,
            ai_accuracy,
        }
    }

    /// Stop the worker and mark the bridge as shut down.
    ///
    /// Idempotent: a second call returns immediately. After shutdown every
    /// other operation returns [`BridgeError::NotInitialized`].
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        info!(target: "bridge", "shutting down");
        let _ = self.shutdown_tx.send(true);
        // Wake a worker blocked in its wait so it observes the flag now.
        self.queue.wake_consumer();

        let handle = self.worker_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(target: "bridge", error = %e, "worker task ended abnormally");
            }
        }
        info!(target: "bridge", "shutdown complete");
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("mode", &self.mode())
            .field("ai_enabled", &self.ai_enabled)
            .field("devices", &self.device_count())
            .field("queued", &self.queue_len())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

/// Metric label for a request kind.
fn kind_label(kind: RequestKind) -> &'static str {
    match kind {
        RequestKind::IoRead => "io_read",
        RequestKind::IoWrite => "io_write",
        RequestKind::DmaAlloc => "dma_alloc",
        RequestKind::Interrupt => "interrupt",
        RequestKind::PciConfig => "pci_config",
        RequestKind::PowerState => "power_state",
        RequestKind::Unknown => "unknown",
    }
}
