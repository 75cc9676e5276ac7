//! Receive-rate and bandwidth estimation from packet timing
//!
//! Two ring buffers of microsecond intervals:
//! - gaps between consecutive data packets (receive speed)
//! - gaps inside back-to-back probe pairs (bottleneck bandwidth, the
//!   classic packet-pair technique)
//!
//! Both estimates use a median-filtered mean so a handful of stalls or
//! bursts cannot swing the result. Buffers start at conservative non-zero
//! intervals: a zero interval would read as infinite bandwidth.

use std::time::{Duration, Instant};

use tracing::debug;

// ============================================================================
// Constants
// ============================================================================

pub const DEFAULT_NUM_PACKET_INTERVALS: usize = 16;
pub const DEFAULT_NUM_PROBE_INTERVALS: usize = 16;

/// Initial packet gap: one packet per second
pub const DEFAULT_PACKET_INTERVAL_US: u64 = 1_000_000;

/// Initial probe gap: one millisecond
pub const DEFAULT_PROBE_INTERVAL_US: u64 = 1_000;

/// Samples further than this factor from the median are discarded
const MEDIAN_FILTER_FACTOR: u64 = 8;

const USECS_PER_SECOND: f64 = 1_000_000.0;

/// Rolling packet/probe interval window for one observer connection
#[derive(Debug, Clone)]
pub struct PacketTimeWindow {
    packet_intervals: Vec<u64>,
    probe_intervals: Vec<u64>,
    packet_cursor: usize,
    probe_cursor: usize,
    last_packet_time: Instant,
    first_probe_time: Instant,
}

impl Default for PacketTimeWindow {
    fn default() -> Self {
        Self::new(DEFAULT_NUM_PACKET_INTERVALS, DEFAULT_NUM_PROBE_INTERVALS)
    }
}

impl PacketTimeWindow {
    /// Window with the given ring sizes (each at least one sample)
    pub fn new(num_packet_intervals: usize, num_probe_intervals: usize) -> Self {
        let now = Instant::now();
        Self {
            packet_intervals: vec![DEFAULT_PACKET_INTERVAL_US; num_packet_intervals.max(1)],
            probe_intervals: vec![DEFAULT_PROBE_INTERVAL_US; num_probe_intervals.max(1)],
            packet_cursor: 0,
            probe_cursor: 0,
            last_packet_time: now,
            first_probe_time: now,
        }
    }

    pub fn num_packet_intervals(&self) -> usize {
        self.packet_intervals.len()
    }

    pub fn num_probe_intervals(&self) -> usize {
        self.probe_intervals.len()
    }

    /// Back to the conservative defaults (reconnect or timing discontinuity)
    pub fn reset(&mut self) {
        self.packet_intervals.fill(DEFAULT_PACKET_INTERVAL_US);
        self.probe_intervals.fill(DEFAULT_PROBE_INTERVAL_US);
        self.packet_cursor = 0;
        self.probe_cursor = 0;
        let now = Instant::now();
        self.last_packet_time = now;
        self.first_probe_time = now;
        debug!("Packet time window reset to defaults");
    }

    pub fn on_packet_arrival(&mut self) {
        self.on_packet_arrival_at(Instant::now());
    }

    /// Record a data packet arriving at `now`
    pub fn on_packet_arrival_at(&mut self, now: Instant) {
        let interval = micros_between(self.last_packet_time, now);
        self.packet_intervals[self.packet_cursor] = interval;
        self.packet_cursor = (self.packet_cursor + 1) % self.packet_intervals.len();
        self.last_packet_time = now;
    }

    pub fn on_probe_pair1_arrival(&mut self) {
        self.on_probe_pair1_arrival_at(Instant::now());
    }

    /// Record the first packet of a probe pair
    pub fn on_probe_pair1_arrival_at(&mut self, now: Instant) {
        self.first_probe_time = now;
    }

    pub fn on_probe_pair2_arrival(&mut self) {
        self.on_probe_pair2_arrival_at(Instant::now());
    }

    /// Record the second packet of a probe pair; its gap is one sample
    pub fn on_probe_pair2_arrival_at(&mut self, now: Instant) {
        let interval = micros_between(self.first_probe_time, now);
        self.probe_intervals[self.probe_cursor] = interval;
        self.probe_cursor = (self.probe_cursor + 1) % self.probe_intervals.len();
    }

    /// Packets per second the observer is receiving, or 0 when fewer than
    /// half the samples agree with the median
    pub fn get_packet_receive_speed(&self) -> u32 {
        let min_samples = self.packet_intervals.len() / 2;
        median_filtered_rate(&self.packet_intervals, min_samples)
    }

    /// Packets per second the bottleneck link can carry, from probe pairs
    pub fn get_estimated_bandwidth(&self) -> u32 {
        median_filtered_rate(&self.probe_intervals, 0)
    }
}

#[inline]
fn micros_between(earlier: Instant, later: Instant) -> u64 {
    let elapsed: Duration = later.saturating_duration_since(earlier);
    u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX)
}

/// Mean of the samples strictly within [median / 8, median * 8], as a rate
///
/// Returns 0 when fewer than `min_samples` (or no) samples survive.
fn median_filtered_rate(samples: &[u64], min_samples: usize) -> u32 {
    if samples.is_empty() {
        return 0;
    }

    let mut sorted = samples.to_vec();
    let middle = sorted.len() / 2;
    let (_, &mut median, _) = sorted.select_nth_unstable(middle);

    let upper_bound = median.saturating_mul(MEDIAN_FILTER_FACTOR);
    let lower_bound = median / MEDIAN_FILTER_FACTOR;

    let (count, sum) = samples
        .iter()
        .filter(|&&interval| interval > lower_bound && interval < upper_bound)
        .fold((0usize, 0u128), |(count, sum), &interval| {
            (count + 1, sum + u128::from(interval))
        });

    if count == 0 || count < min_samples {
        return 0;
    }

    let mean_interval = sum as f64 / count as f64;
    let rate = (USECS_PER_SECOND / mean_interval).ceil();
    if rate >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        rate as u32
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Feed `intervals` (microseconds) as consecutive packet arrivals
    fn feed_packets(window: &mut PacketTimeWindow, intervals: &[u64]) {
        let mut now = Instant::now();
        window.last_packet_time = now;
        for &interval in intervals {
            now += Duration::from_micros(interval);
            window.on_packet_arrival_at(now);
        }
    }

    fn feed_probes(window: &mut PacketTimeWindow, gaps: &[u64]) {
        let mut now = Instant::now();
        for &gap in gaps {
            window.on_probe_pair1_arrival_at(now);
            now += Duration::from_micros(gap);
            window.on_probe_pair2_arrival_at(now);
            now += Duration::from_millis(50);
        }
    }

    #[test]
    fn test_fresh_window_reports_defaults() {
        let window = PacketTimeWindow::default();
        // 1 ms probe gap -> 1000 packets/s, 1 s packet gap -> 1 packet/s
        assert_eq!(window.get_estimated_bandwidth(), 1000);
        assert_eq!(window.get_packet_receive_speed(), 1);
    }

    #[test]
    fn test_constant_packet_interval() {
        let mut window = PacketTimeWindow::default();
        feed_packets(&mut window, &[10_000; 16]);
        assert_eq!(window.get_packet_receive_speed(), 100);
    }

    #[test]
    fn test_ring_buffer_wraps() {
        let mut window = PacketTimeWindow::new(4, 4);
        feed_packets(&mut window, &[1_000; 4]);
        assert_eq!(window.get_packet_receive_speed(), 1000);

        // Four more samples fully replace the ring
        feed_packets(&mut window, &[2_000; 4]);
        assert_eq!(window.get_packet_receive_speed(), 500);
        assert_eq!(window.packet_cursor, 0);
    }

    #[test]
    fn test_median_filter_ignores_high_outliers() {
        let mut window = PacketTimeWindow::default();
        let mut intervals = vec![5_000u64; 16];
        for slot in intervals.iter_mut().take(7) {
            *slot = 5_000 * 8;
        }
        feed_packets(&mut window, &intervals);
        assert_eq!(window.get_packet_receive_speed(), 200);
    }

    #[test]
    fn test_median_filter_ignores_low_outliers() {
        let mut window = PacketTimeWindow::default();
        let mut intervals = vec![5_000u64; 16];
        for slot in intervals.iter_mut().skip(9) {
            *slot = 5_000 / 8;
        }
        feed_packets(&mut window, &intervals);
        assert_eq!(window.get_packet_receive_speed(), 200);
    }

    #[test]
    fn test_median_filter_exactly_half_outliers_picks_upper_median() {
        // 8 high of 16: the upper middle sample is an outlier, so the
        // outliers win and the true intervals fall outside the filter
        let mut window = PacketTimeWindow::default();
        let mut intervals = vec![5_000u64; 16];
        for slot in intervals.iter_mut().take(8) {
            *slot = 5_000 * 8;
        }
        feed_packets(&mut window, &intervals);
        assert_eq!(window.get_packet_receive_speed(), 25);

        // 8 low of 16: the upper middle sample is a true interval
        let mut window = PacketTimeWindow::default();
        let mut intervals = vec![5_000u64; 16];
        for slot in intervals.iter_mut().take(8) {
            *slot = 5_000 / 8;
        }
        feed_packets(&mut window, &intervals);
        assert_eq!(window.get_packet_receive_speed(), 200);
    }

    #[test]
    fn test_median_filter_half_mixed_outliers() {
        let mut window = PacketTimeWindow::default();
        let mut intervals = vec![4_000u64; 16];
        for (i, slot) in intervals.iter_mut().enumerate().take(8) {
            *slot = if i % 2 == 0 { 4_000 * 20 } else { 100 };
        }
        feed_packets(&mut window, &intervals);
        assert_eq!(window.get_packet_receive_speed(), 250);
    }

    #[test]
    fn test_noisy_samples_stay_close() {
        let mut window = PacketTimeWindow::default();
        let intervals: Vec<u64> = (0..16).map(|i| 10_000 + (i % 4) * 100 - 150).collect();
        feed_packets(&mut window, &intervals);
        let speed = window.get_packet_receive_speed();
        assert!((99..=101).contains(&speed), "speed {}", speed);
    }

    #[test]
    fn test_too_few_agreeing_samples_returns_zero() {
        let mut window = PacketTimeWindow::new(8, 8);
        // Spread so wide only the median itself is within 8x: 1 < 8/2 survivors
        feed_packets(&mut window, &[1, 10, 100, 1_000, 10_000, 100_000, 1_000_000, 10_000_000]);
        assert_eq!(window.get_packet_receive_speed(), 0);
    }

    #[test]
    fn test_probe_pairs_estimate_bandwidth() {
        let mut window = PacketTimeWindow::default();
        feed_probes(&mut window, &[250; 16]);
        assert_eq!(window.get_estimated_bandwidth(), 4000);
    }

    #[test]
    fn test_probe_estimate_needs_no_quorum() {
        let mut window = PacketTimeWindow::new(4, 4);
        // Half the probe ring is wild; the rest still yields an estimate
        feed_probes(&mut window, &[500, 500, 500, 1_000_000]);
        assert_eq!(window.get_estimated_bandwidth(), 2000);
    }

    #[test]
    fn test_reset_restores_defaults() {
        let mut window = PacketTimeWindow::default();
        feed_packets(&mut window, &[1_000; 16]);
        feed_probes(&mut window, &[100; 16]);
        assert_ne!(window.get_packet_receive_speed(), 1);

        window.reset();
        assert_eq!(window.get_packet_receive_speed(), 1);
        assert_eq!(window.get_estimated_bandwidth(), 1000);
        assert!(window.packet_intervals.iter().all(|&i| i == DEFAULT_PACKET_INTERVAL_US));
    }

    #[test]
    fn test_zero_sized_window_is_clamped() {
        let window = PacketTimeWindow::new(0, 0);
        assert_eq!(window.num_packet_intervals(), 1);
        assert_eq!(window.num_probe_intervals(), 1);
        assert_eq!(window.get_estimated_bandwidth(), 1000);
    }

    #[test]
    fn test_out_of_order_timestamp_saturates() {
        let mut window = PacketTimeWindow::new(2, 2);
        let later = Instant::now() + Duration::from_secs(1);
        window.last_packet_time = later;
        window.on_packet_arrival_at(later - Duration::from_millis(10));
        assert_eq!(window.packet_intervals[0], 0);
    }
}
