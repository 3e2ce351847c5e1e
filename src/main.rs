//! Demo binary for tokio-request-bridge.
//!
//! Builds a learning-mode bridge over the simulated kernel, registers a few
//! devices, drives mixed request traffic through the batching worker, feeds
//! back simulated outcomes, and reports statistics.
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json` — structured JSON output (production)
//! - `RUST_LOG=info` — log level filter (default: info)

use std::sync::Arc;
use std::time::Duration;
use tokio_request_bridge::{
    config::BridgeConfig, init_tracing, metrics, Bridge, BridgeMode, ChipsetKind, DecisionModel,
    DeviceRequest, RequestKind, SimulatedKernel,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize structured tracing (JSON or pretty, based on LOG_FORMAT env)
    let _ = init_tracing();

    // Initialize Prometheus metrics registry before the bridge runs.
    metrics::init_metrics()?;

    info!("Starting tokio-request-bridge demo");

    let config = BridgeConfig {
        mode: BridgeMode::Learning,
        batch_window_ms: 10,
        ..BridgeConfig::default()
    };
    let kernel = Arc::new(SimulatedKernel::with_delay(Duration::from_micros(50)));
    let bridge = Bridge::new(config, kernel)?;

    // Register a small device fleet across chipset families.
    let devices = [
        (0x8086_0100, ChipsetKind::Intel),
        (0x1022_0200, ChipsetKind::Amd),
        (0x10DE_0300, ChipsetKind::Nvidia),
        (0x17CB_0400, ChipsetKind::Qualcomm),
    ];
    for (device_id, chipset) in devices {
        bridge.register_device(device_id, chipset)?;
    }

    info!(count = devices.len(), "Devices registered");

    // Drive mixed traffic through the queue.
    let demo_requests = vec![
        DeviceRequest::new(RequestKind::IoRead, 0x8086_0100)
            .with_address(0xF000_1000)
            .with_size(10),
        DeviceRequest::new(RequestKind::IoWrite, 0x8086_0100)
            .with_address(0xF000_2000)
            .with_data(vec![0xAB; 100]),
        DeviceRequest::new(RequestKind::DmaAlloc, 0x1022_0200)
            .with_size(3000)
            .with_priority(5),
        DeviceRequest::new(RequestKind::Interrupt, 0x10DE_0300).with_priority(9),
        DeviceRequest::new(RequestKind::PciConfig, 0x17CB_0400)
            .with_address(0x40)
            .with_size(4),
        DeviceRequest::new(RequestKind::PowerState, 0x10DE_0300).with_flags(0x3),
        DeviceRequest::new(RequestKind::IoRead, 0x1022_0200)
            .with_address(0xF000_3000)
            .with_size(512),
    ];

    info!(count = demo_requests.len(), "Sending demo requests");

    for request in &demo_requests {
        // Show the pure optimizer on the way in.
        let optimized = DecisionModel::optimize(request);
        if optimized.size != request.size {
            info!(
                kind = ?request.kind,
                original = request.size,
                optimized = optimized.size,
                "request size aligned"
            );
        }

        bridge.enqueue_request(request.device_id, &optimized)?;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Let the worker drain the tail of the traffic.
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Feed back simulated outcomes so the history and accuracy move.
    if let Some(model) = bridge.model() {
        for (i, request) in demo_requests.iter().enumerate() {
            let prediction = model.predict(request)?;
            let simulated_latency_us = 80 + (i as u32) * 35;
            let success = i % 5 != 4;
            bridge.submit_feedback(request, &prediction, simulated_latency_us, success)?;
        }

        let risky = DeviceRequest::new(RequestKind::IoRead, 0x8086_0100).with_size(64);
        info!(
            failure_probability = model.predict_failure(&risky),
            "failure estimate for the next read"
        );
    }

    let stats = bridge.stats();
    info!(
        total_requests = stats.total_requests,
        forwarded_to_kernel = stats.forwarded_to_kernel,
        ai_optimized = stats.ai_optimized,
        ai_batched = stats.ai_batched,
        failures = stats.failures,
        avg_latency_us = stats.avg_latency_us,
        ai_accuracy = stats.ai_accuracy,
        "Bridge statistics"
    );

    info!("Demo complete - shutting down");
    bridge.shutdown().await;

    Ok(())
}
