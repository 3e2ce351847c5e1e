//! Kernel forwarding seam and the batching worker.
//!
//! Provides the `KernelForwarder` trait and the single background task that
//! drains the request queue:
//! - `SimulatedKernel`: logging collaborator for demos and tests (real
//!   device I/O is out of scope, so forwarding is openly simulated)
//! - `BatchWorker`: the queue's sole consumer, modeled as an explicit state
//!   machine `Idle → Waiting → Draining → Idle` with terminal `Stopped`
//!
//! ## Wait discipline
//!
//! In `Waiting` the worker blocks until the queue signals new work **or**
//! the configured batch window elapses; both paths transition to `Draining`
//! and drain whatever is queued, including nothing. Shutdown is observed at
//! the top of each cycle and wakes a blocked worker immediately.

use crate::bridge::{BridgeCounters, DeviceContext};
use crate::model::DecisionModel;
use crate::queue::RequestQueue;
use crate::{metrics, BridgeError, DeviceRequest};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Outbound capability: forward one request to the kernel-side collaborator.
///
/// Implementations must be thread-safe (Send + Sync) for use across tasks.
/// The trait is object-safe to allow dynamic dispatch via
/// `Arc<dyn KernelForwarder>`.
#[async_trait]
pub trait KernelForwarder: Send + Sync {
    /// Deliver `request` on behalf of the device behind `ctx`.
    ///
    /// # Errors
    ///
    /// Implementations report delivery failure; the worker counts it and
    /// continues the batch.
    async fn forward(&self, ctx: &DeviceContext, request: &DeviceRequest)
        -> Result<(), BridgeError>;
}

/// Inbound veto capability, checked before a request is processed.
///
/// Returning `true` drops the item: the worker increments the drop counter
/// and short-circuits all further processing of that entry.
pub trait PacketFilter: Send + Sync {
    /// Whether this request should be dropped instead of processed.
    fn should_drop(&self, ctx: &DeviceContext, request: &DeviceRequest) -> bool;
}

// ============================================================================
// Simulated Kernel (demo/testing)
// ============================================================================

/// Simulated kernel-side collaborator.
///
/// Logs each forwarded request and acknowledges unconditionally, with an
/// optional artificial delay to mimic device latency.
pub struct SimulatedKernel {
    /// Simulated per-request forwarding delay.
    pub delay: Duration,
}

impl SimulatedKernel {
    /// Create a simulated kernel with no artificial delay.
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
        }
    }

    /// Create a simulated kernel that sleeps `delay` per forwarded request.
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for SimulatedKernel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KernelForwarder for SimulatedKernel {
    async fn forward(
        &self,
        ctx: &DeviceContext,
        request: &DeviceRequest,
    ) -> Result<(), BridgeError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        debug!(
            target: "bridge::kernel",
            device_id = format_args!("{:#x}", ctx.device_id),
            kind = ?request.kind,
            size = request.size,
            "request forwarded to kernel"
        );
        Ok(())
    }
}

// ============================================================================
// Batch worker
// ============================================================================

/// Observable worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    /// Between cycles; about to re-enter `Waiting`.
    Idle = 0,
    /// Blocked on new work or the batch-window timeout.
    Waiting = 1,
    /// Processing a drained batch.
    Draining = 2,
    /// Terminal state entered once the shutdown signal was observed.
    Stopped = 3,
}

impl WorkerState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => WorkerState::Waiting,
            2 => WorkerState::Draining,
            3 => WorkerState::Stopped,
            _ => WorkerState::Idle,
        }
    }
}

/// The queue's single consumer.
///
/// Owned by the task spawned at bridge construction; drops with it.
pub(crate) struct BatchWorker {
    pub(crate) queue: Arc<RequestQueue>,
    pub(crate) model: Option<Arc<DecisionModel>>,
    pub(crate) forwarder: Arc<dyn KernelForwarder>,
    pub(crate) filter: Option<Arc<dyn PacketFilter>>,
    pub(crate) counters: Arc<BridgeCounters>,
    pub(crate) batch_window: Duration,
    pub(crate) shutdown: watch::Receiver<bool>,
    pub(crate) state: Arc<AtomicU8>,
}

impl BatchWorker {
    /// Run the wait/drain loop until the shutdown flag is observed.
    pub(crate) async fn run(mut self) {
        info!(target: "bridge::worker", "batch worker started");

        loop {
            // Shutdown is checked at the top of every cycle.
            if *self.shutdown.borrow() {
                break;
            }
            self.enter(WorkerState::Waiting);

            tokio::select! {
                changed = self.shutdown.changed() => {
                    // A closed channel means the bridge was dropped without
                    // an explicit shutdown; stop rather than spin.
                    if changed.is_err() {
                        break;
                    }
                }
                _ = self.queue.wait_for_work() => {}
                _ = tokio::time::sleep(self.batch_window) => {}
            }

            if *self.shutdown.borrow() {
                break;
            }

            // Signal or timeout: either way, drain what is there.
            self.enter(WorkerState::Draining);
            let batch = self.queue.drain_batch();
            if !batch.is_empty() {
                debug!(
                    target: "bridge::worker",
                    batch_size = batch.len(),
                    "processing batch"
                );
            }
            for entry in batch {
                self.process(&entry.context, &entry.request).await;
            }

            self.enter(WorkerState::Idle);
        }

        self.enter(WorkerState::Stopped);
        info!(target: "bridge::worker", "batch worker stopped");
    }

    /// Handle a single drained entry: veto filter, optional inference,
    /// forward. Per-item failures never abort the batch.
    async fn process(&self, ctx: &Arc<DeviceContext>, request: &DeviceRequest) {
        if let Some(filter) = &self.filter {
            if filter.should_drop(ctx, request) {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::inc_rejected("filtered");
                debug!(
                    target: "bridge::worker",
                    device_id = ctx.device_id,
                    "request dropped by packet filter"
                );
                return;
            }
        }

        if let Some(model) = &self.model {
            match model.predict(request) {
                Ok(prediction) => {
                    self.counters.ai_optimized.fetch_add(1, Ordering::Relaxed);
                    if prediction.should_batch {
                        self.counters.ai_batched.fetch_add(1, Ordering::Relaxed);
                    }
                    metrics::inc_decision(decision_label(prediction.decision));
                    debug!(
                        target: "bridge::worker",
                        device_id = ctx.device_id,
                        decision = ?prediction.decision,
                        confidence = prediction.confidence,
                        estimated_latency_us = prediction.estimated_latency_us,
                        "model decision"
                    );
                }
                Err(e) => {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        target: "bridge::worker",
                        device_id = ctx.device_id,
                        error = %e,
                        "prediction failed; forwarding without decision"
                    );
                }
            }
        }

        match self.forwarder.forward(ctx, request).await {
            Ok(()) => {
                self.counters
                    .forwarded_to_kernel
                    .fetch_add(1, Ordering::Relaxed);
                metrics::inc_forwarded("to_kernel");
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "bridge::worker",
                    device_id = ctx.device_id,
                    error = %e,
                    "forwarding failed"
                );
            }
        }
    }

    fn enter(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Metric label for a decision class.
fn decision_label(decision: crate::Decision) -> &'static str {
    match decision {
        crate::Decision::PassThrough => "pass_through",
        crate::Decision::Buffer => "buffer",
        crate::Decision::Optimize => "optimize",
        crate::Decision::Defer => "defer",
        crate::Decision::Reject => "reject",
        crate::Decision::Retry => "retry",
    }
}
