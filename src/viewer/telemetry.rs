//! Viewer telemetry
//!
//! Bounded sample rings instead of unbounded arrays: 100 recent
//! end-to-end latency samples (median and P95 recomputed per result) and
//! 10 transport statistics snapshots for bandwidth derivation.

use std::collections::VecDeque;

use crate::events::{BandwidthSnapshot, LatencySnapshot};
use crate::signaling::message::DetectionResult;

/// Bounded ring of latency samples with order statistics
#[derive(Debug)]
pub struct LatencyWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Append a sample, evicting the oldest when the ring is full
    pub fn push(&mut self, sample_ms: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample_ms);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Median over the current ring (upper median for even sizes)
    pub fn median(&self) -> f64 {
        let sorted = self.sorted();
        if sorted.is_empty() {
            return 0.0;
        }
        sorted[sorted.len() / 2]
    }

    /// 95th percentile: index `floor(0.95 * n)` into the sorted copy
    pub fn p95(&self) -> f64 {
        let sorted = self.sorted();
        if sorted.is_empty() {
            return 0.0;
        }
        let index = ((0.95 * sorted.len() as f64).floor() as usize).min(sorted.len() - 1);
        sorted[index]
    }

    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    pub fn min(&self) -> f64 {
        self.samples.iter().copied().fold(f64::INFINITY, f64::min)
    }

    pub fn max(&self) -> f64 {
        self.samples
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max)
    }

    /// All order statistics at once
    pub fn snapshot(&self) -> LatencySnapshot {
        if self.samples.is_empty() {
            return LatencySnapshot::default();
        }
        LatencySnapshot {
            median_ms: self.median(),
            p95_ms: self.p95(),
            average_ms: self.average(),
            min_ms: self.min(),
            max_ms: self.max(),
        }
    }

    fn sorted(&self) -> Vec<f64> {
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        sorted
    }
}

/// One transport statistics snapshot
#[derive(Debug, Clone, Copy)]
struct TransportSnapshot {
    ts_ms: u64,
    bytes_sent: u64,
    bytes_received: u64,
}

/// Bounded ring of transport snapshots; rates derive from the
/// oldest-to-newest deltas over the elapsed wall time
#[derive(Debug)]
pub struct BandwidthTracker {
    snapshots: VecDeque<TransportSnapshot>,
    capacity: usize,
}

impl BandwidthTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            snapshots: VecDeque::with_capacity(capacity),
            capacity: capacity.max(2),
        }
    }

    /// Record a (timestamp, bytes-sent, bytes-received) snapshot
    pub fn record(&mut self, ts_ms: u64, bytes_sent: u64, bytes_received: u64) {
        if self.snapshots.len() == self.capacity {
            self.snapshots.pop_front();
        }
        self.snapshots.push_back(TransportSnapshot {
            ts_ms,
            bytes_sent,
            bytes_received,
        });
    }

    /// Current uplink/downlink estimate in kbps
    pub fn rates(&self) -> BandwidthSnapshot {
        let (Some(first), Some(last)) = (self.snapshots.front(), self.snapshots.back()) else {
            return BandwidthSnapshot::default();
        };
        let elapsed_ms = last.ts_ms.saturating_sub(first.ts_ms);
        if elapsed_ms == 0 {
            return BandwidthSnapshot::default();
        }

        // bits per millisecond == kilobits per second
        let sent_bits = last.bytes_sent.saturating_sub(first.bytes_sent) as f64 * 8.0;
        let received_bits = last.bytes_received.saturating_sub(first.bytes_received) as f64 * 8.0;

        BandwidthSnapshot {
            uplink_kbps: sent_bits / elapsed_ms as f64,
            downlink_kbps: received_bits / elapsed_ms as f64,
        }
    }
}

/// Aggregated per-session telemetry
///
/// End-to-end latency feeds the 100-sample ring; server and network
/// latency keep their own rings so the benchmark record can report full
/// order statistics for each.
pub struct ViewerTelemetry {
    e2e: LatencyWindow,
    server: LatencyWindow,
    network: LatencyWindow,
    bandwidth: BandwidthTracker,
    started_ms: u64,
    total_frames: u64,
    frames_with_detections: u64,
    last_server_ms: f64,
    last_network_ms: f64,
    total_bytes_sent: u64,
    total_bytes_received: u64,
}

/// Per-result derived latencies
#[derive(Debug, Clone, Copy)]
pub struct ResultLatencies {
    pub e2e_ms: f64,
    pub server_ms: f64,
    pub network_ms: f64,
}

/// Final report data for a session
#[derive(Debug, Clone)]
pub struct TelemetrySummary {
    pub duration_seconds: f64,
    pub total_frames: u64,
    pub frames_with_detections: u64,
    pub processed_fps: f64,
    pub e2e: LatencySnapshot,
    pub server: LatencySnapshot,
    pub network: LatencySnapshot,
    pub bandwidth: BandwidthSnapshot,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
}

impl TelemetrySummary {
    /// Share of processed frames that produced at least one detection
    pub fn detection_rate_percent(&self) -> f64 {
        if self.total_frames == 0 {
            return 0.0;
        }
        self.frames_with_detections as f64 * 100.0 / self.total_frames as f64
    }
}

impl ViewerTelemetry {
    pub fn new(latency_window: usize, bandwidth_window: usize, now_ms: u64) -> Self {
        Self {
            e2e: LatencyWindow::new(latency_window),
            server: LatencyWindow::new(latency_window),
            network: LatencyWindow::new(latency_window),
            bandwidth: BandwidthTracker::new(bandwidth_window),
            started_ms: now_ms,
            total_frames: 0,
            frames_with_detections: 0,
            last_server_ms: 0.0,
            last_network_ms: 0.0,
            total_bytes_sent: 0,
            total_bytes_received: 0,
        }
    }

    /// Fold one detection result into the windows
    ///
    /// Server and network latency are defined as 0 in local mode; in
    /// offload mode they split at the engine ingress timestamp.
    pub fn on_result(
        &mut self,
        result: &DetectionResult,
        now_ms: u64,
        local_mode: bool,
    ) -> ResultLatencies {
        let e2e_ms = now_ms.saturating_sub(result.capture_ts) as f64;
        let (server_ms, network_ms) = if local_mode {
            (0.0, 0.0)
        } else {
            (
                result.inference_ts.saturating_sub(result.recv_ts) as f64,
                result.recv_ts.saturating_sub(result.capture_ts) as f64,
            )
        };

        self.e2e.push(e2e_ms);
        self.server.push(server_ms);
        self.network.push(network_ms);
        self.last_server_ms = server_ms;
        self.last_network_ms = network_ms;

        self.total_frames += 1;
        if !result.detections.is_empty() {
            self.frames_with_detections += 1;
        }

        ResultLatencies {
            e2e_ms,
            server_ms,
            network_ms,
        }
    }

    /// Record a transport statistics snapshot
    pub fn record_transport(&mut self, now_ms: u64, bytes_sent: u64, bytes_received: u64) {
        self.total_bytes_sent = bytes_sent;
        self.total_bytes_received = bytes_received;
        self.bandwidth.record(now_ms, bytes_sent, bytes_received);
    }

    pub fn e2e_snapshot(&self) -> LatencySnapshot {
        self.e2e.snapshot()
    }

    pub fn bandwidth_rates(&self) -> BandwidthSnapshot {
        self.bandwidth.rates()
    }

    pub fn last_server_ms(&self) -> f64 {
        self.last_server_ms
    }

    pub fn last_network_ms(&self) -> f64 {
        self.last_network_ms
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    /// Processed frames per second since session start
    pub fn processed_fps(&self, now_ms: u64) -> f64 {
        let elapsed_ms = now_ms.saturating_sub(self.started_ms);
        if elapsed_ms == 0 {
            return 0.0;
        }
        self.total_frames as f64 * 1000.0 / elapsed_ms as f64
    }

    /// Build the final summary
    pub fn summary(&self, now_ms: u64) -> TelemetrySummary {
        TelemetrySummary {
            duration_seconds: now_ms.saturating_sub(self.started_ms) as f64 / 1000.0,
            total_frames: self.total_frames,
            frames_with_detections: self.frames_with_detections,
            processed_fps: self.processed_fps(now_ms),
            e2e: self.e2e.snapshot(),
            server: self.server.snapshot(),
            network: self.network.snapshot(),
            bandwidth: self.bandwidth.rates(),
            total_bytes_sent: self.total_bytes_sent,
            total_bytes_received: self.total_bytes_received,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(capture_ts: u64, recv_ts: u64, inference_ts: u64, detections: usize) -> DetectionResult {
        use crate::signaling::message::Detection;

        DetectionResult {
            frame_id: "f".to_string(),
            capture_ts,
            recv_ts,
            inference_ts,
            detections: (0..detections)
                .map(|_| Detection {
                    label: "person".to_string(),
                    score: 0.9,
                    xmin: 0.1,
                    ymin: 0.1,
                    xmax: 0.5,
                    ymax: 0.5,
                })
                .collect(),
        }
    }

    #[test]
    fn test_latency_window_bounded() {
        let mut window = LatencyWindow::new(100);
        for i in 0..250 {
            window.push(i as f64);
        }
        assert_eq!(window.len(), 100);
        // Oldest samples evicted
        assert_eq!(window.min(), 150.0);
        assert_eq!(window.max(), 249.0);
    }

    #[test]
    fn test_p95_index_law() {
        // n = 20: index floor(0.95 * 20) = 19 -> the maximum
        let mut window = LatencyWindow::new(100);
        for i in 1..=20 {
            window.push(i as f64);
        }
        assert_eq!(window.p95(), 20.0);

        // n = 10: index floor(0.95 * 10) = 9
        let mut window = LatencyWindow::new(100);
        for i in 1..=10 {
            window.push(i as f64);
        }
        assert_eq!(window.p95(), 10.0);
    }

    #[test]
    fn test_median_unsorted_input() {
        let mut window = LatencyWindow::new(100);
        for value in [50.0, 10.0, 90.0, 20.0, 70.0] {
            window.push(value);
        }
        assert_eq!(window.median(), 50.0);
    }

    #[test]
    fn test_empty_window_statistics() {
        let window = LatencyWindow::new(100);
        let snapshot = window.snapshot();
        assert_eq!(snapshot.median_ms, 0.0);
        assert_eq!(snapshot.p95_ms, 0.0);
    }

    #[test]
    fn test_bandwidth_from_deltas() {
        let mut tracker = BandwidthTracker::new(10);
        // 1000 bytes sent and 4000 received over 1000 ms
        tracker.record(0, 0, 0);
        tracker.record(500, 400, 2000);
        tracker.record(1000, 1000, 4000);

        let rates = tracker.rates();
        assert!((rates.uplink_kbps - 8.0).abs() < 1e-9);
        assert!((rates.downlink_kbps - 32.0).abs() < 1e-9);
    }

    #[test]
    fn test_bandwidth_ring_bounded() {
        let mut tracker = BandwidthTracker::new(10);
        for i in 0..50u64 {
            tracker.record(i * 100, i * 1000, i * 1000);
        }
        // Only the last 10 snapshots contribute: 9000 bytes over 900 ms
        let rates = tracker.rates();
        assert!((rates.uplink_kbps - 80.0).abs() < 1e-9);
    }

    #[test]
    fn test_bandwidth_insufficient_samples() {
        let mut tracker = BandwidthTracker::new(10);
        assert_eq!(tracker.rates().uplink_kbps, 0.0);
        tracker.record(100, 500, 500);
        assert_eq!(tracker.rates().uplink_kbps, 0.0);
    }

    #[test]
    fn test_offload_latency_split() {
        let mut telemetry = ViewerTelemetry::new(100, 10, 0);
        let latencies = telemetry.on_result(&result(1000, 1020, 1070, 1), 1085, false);

        assert_eq!(latencies.e2e_ms, 85.0);
        assert_eq!(latencies.server_ms, 50.0);
        assert_eq!(latencies.network_ms, 20.0);
    }

    #[test]
    fn test_local_mode_zeroes_split() {
        let mut telemetry = ViewerTelemetry::new(100, 10, 0);
        let latencies = telemetry.on_result(&result(1000, 1010, 1040, 1), 1050, true);

        assert_eq!(latencies.e2e_ms, 50.0);
        assert_eq!(latencies.server_ms, 0.0);
        assert_eq!(latencies.network_ms, 0.0);
    }

    #[test]
    fn test_summary_counters() {
        let mut telemetry = ViewerTelemetry::new(100, 10, 0);
        telemetry.on_result(&result(0, 10, 40, 2), 50, false);
        telemetry.on_result(&result(100, 110, 140, 0), 150, false);
        telemetry.record_transport(0, 0, 0);
        telemetry.record_transport(1000, 1000, 2000);

        let summary = telemetry.summary(2000);
        assert_eq!(summary.total_frames, 2);
        assert_eq!(summary.frames_with_detections, 1);
        assert_eq!(summary.detection_rate_percent(), 50.0);
        assert_eq!(summary.duration_seconds, 2.0);
        assert_eq!(summary.processed_fps, 1.0);
        assert_eq!(summary.total_bytes_sent, 1000);
        assert_eq!(summary.total_bytes_received, 2000);
    }
}
