//! Feature extraction: raw request + rolling history → normalized vector.
//!
//! Ten meaningful slots, the remainder derived padding. All values land in
//! `[0, 1]` except the size feature, which is page-normalized and may exceed
//! 1.0 for multi-page requests.

use super::history::HistoryLog;
use super::network::INPUT_SIZE;
use crate::DeviceRequest;

/// How many recent history entries the pattern features look at.
const PATTERN_WINDOW: usize = 100;

/// Extract the fixed-length feature vector for one request.
///
/// Deterministic given the history snapshot and `now_ns`. Always succeeds.
///
/// # Panics
///
/// This function never panics.
pub fn extract(request: &DeviceRequest, history: &HistoryLog, now_ns: u64) -> [f32; INPUT_SIZE] {
    let mut features = [0.0f32; INPUT_SIZE];

    features[0] = f32::from(request.kind.as_u8()) / crate::RequestKind::COUNT as f32;
    features[1] = (request.device_id & 0xFF) as f32 / 255.0;
    features[2] = ((request.device_id >> 8) & 0xFF) as f32 / 255.0;
    features[3] = (request.address & 0xFFFF) as f32 / 65535.0;
    // Page-size normalization; deliberately unclamped so multi-page
    // requests read above 1.0.
    features[4] = request.size as f32 / 4096.0;
    features[5] = (request.flags & 0xFF) as f32 / 255.0;
    features[6] = request.priority as f32 / 10.0;

    // Request age in milliseconds, clamped to 1.0.
    let age_ns = now_ns.saturating_sub(request.timestamp_ns);
    features[7] = (age_ns as f32 / 1_000_000.0).min(1.0);

    // Pattern features over the most recent window.
    let window = history.len().min(PATTERN_WINDOW);
    if window > 0 {
        let mut same_kind = 0usize;
        let mut latency_sum = 0u64;
        for entry in history.recent(PATTERN_WINDOW) {
            if entry.kind_byte() == request.kind.as_u8() {
                same_kind += 1;
            }
            latency_sum += u64::from(entry.latency_us);
        }
        features[8] = same_kind as f32 / window as f32;
        features[9] = (latency_sum as f32 / window as f32) / 10_000.0;
    } else {
        features[8] = 0.0;
        // Prior under total ignorance.
        features[9] = 0.5;
    }

    // Derived padding, no new information.
    for i in 10..INPUT_SIZE {
        features[i] = features[i % 10] * 0.5;
    }

    features
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::history::{HistoryEntry, HistoryLog};
    use crate::{Decision, RequestKind};

    fn request(kind: RequestKind) -> DeviceRequest {
        DeviceRequest {
            kind,
            device_id: 0x1234,
            address: 0xABCD_EF01,
            size: 2048,
            data: None,
            flags: 0x0F,
            timestamp_ns: 0,
            priority: 5,
        }
    }

    fn feedback(kind: RequestKind, latency_us: u32) -> HistoryEntry {
        HistoryEntry {
            pattern: HistoryEntry::encode_pattern(kind, 1),
            decision: Decision::PassThrough,
            latency_us,
            success: true,
        }
    }

    #[test]
    fn test_identity_features_normalized() {
        let req = request(RequestKind::DmaAlloc);
        let f = extract(&req, &HistoryLog::new(), 0);

        assert!((f[0] - 2.0 / 7.0).abs() < 1e-6);
        assert!((f[1] - 0x34 as f32 / 255.0).abs() < 1e-6);
        assert!((f[2] - 0x12 as f32 / 255.0).abs() < 1e-6);
        assert!((f[3] - 0xEF01 as f32 / 65535.0).abs() < 1e-6);
        assert!((f[4] - 0.5).abs() < 1e-6);
        assert!((f[5] - 15.0 / 255.0).abs() < 1e-6);
        assert!((f[6] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_size_feature_unclamped_above_one_page() {
        let mut req = request(RequestKind::IoWrite);
        req.size = 3 * 4096;
        let f = extract(&req, &HistoryLog::new(), 0);
        assert!((f[4] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_age_feature_clamps_at_one() {
        let req = request(RequestKind::IoRead);
        // Ten seconds old, far beyond the 1ms normalization range.
        let f = extract(&req, &HistoryLog::new(), 10_000_000_000);
        assert!((f[7] - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_age_feature_scales_within_one_ms() {
        let req = request(RequestKind::IoRead);
        let f = extract(&req, &HistoryLog::new(), 500_000);
        assert!((f[7] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_empty_history_yields_latency_prior() {
        let req = request(RequestKind::IoRead);
        let f = extract(&req, &HistoryLog::new(), 0);
        assert!((f[8] - 0.0).abs() < f32::EPSILON);
        assert!((f[9] - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_same_kind_fraction_over_window() {
        let mut history = HistoryLog::new();
        for _ in 0..3 {
            history.push(feedback(RequestKind::IoRead, 100));
        }
        history.push(feedback(RequestKind::DmaAlloc, 100));

        let f = extract(&request(RequestKind::IoRead), &history, 0);
        assert!((f[8] - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_latency_feature_averages_recent_window() {
        let mut history = HistoryLog::new();
        history.push(feedback(RequestKind::IoRead, 1000));
        history.push(feedback(RequestKind::IoRead, 3000));

        let f = extract(&request(RequestKind::IoRead), &history, 0);
        // mean 2000us / 10000 = 0.2
        assert!((f[9] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_pattern_window_ignores_older_entries() {
        let mut history = HistoryLog::new();
        // 50 old DmaAlloc entries, then 100 IoRead entries fill the window.
        for _ in 0..50 {
            history.push(feedback(RequestKind::DmaAlloc, 100));
        }
        for _ in 0..100 {
            history.push(feedback(RequestKind::IoRead, 100));
        }

        let f = extract(&request(RequestKind::IoRead), &history, 0);
        assert!((f[8] - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_padding_is_half_of_base_slot() {
        let req = request(RequestKind::PciConfig);
        let f = extract(&req, &HistoryLog::new(), 0);
        for i in 10..INPUT_SIZE {
            assert!(
                (f[i] - f[i % 10] * 0.5).abs() < f32::EPSILON,
                "slot {i} must derive from slot {}",
                i % 10
            );
        }
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let mut history = HistoryLog::new();
        history.push(feedback(RequestKind::IoWrite, 250));
        let req = request(RequestKind::IoWrite);
        assert_eq!(extract(&req, &history, 42), extract(&req, &history, 42));
    }
}
