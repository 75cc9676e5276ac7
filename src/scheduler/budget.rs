//! Per-tick send budget from measured link rates
//!
//! The timing window supplies two rate signals (receive speed and probe
//! bandwidth, both packets/second, 0 = no confidence). The policy turns them
//! into a packet count for one tick, capped by server and client limits, and
//! a byte allowance elements are charged against.

use tracing::trace;

use crate::config::ServerConfig;
use crate::net::packet_time_window::PacketTimeWindow;

/// Rate-to-budget conversion, fixed for the server's lifetime
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetPolicy {
    pub tick_rate_hz: u32,
    pub max_packets_per_tick: u32,
    pub default_packets_per_second: u32,
    pub packet_payload_bytes: usize,
}

impl Default for BudgetPolicy {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

impl BudgetPolicy {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            tick_rate_hz: config.tick_rate_hz.max(1),
            max_packets_per_tick: config.max_packets_per_tick.max(1),
            default_packets_per_second: config.default_packets_per_second.max(1),
            packet_payload_bytes: config.packet_payload_bytes.max(1),
        }
    }

    /// Smallest non-zero signal; the default rate when neither is known
    pub fn measured_rate(&self, receive_speed: u32, bandwidth: u32) -> u32 {
        match (receive_speed, bandwidth) {
            (0, 0) => self.default_packets_per_second,
            (0, rate) | (rate, 0) => rate,
            (a, b) => a.min(b),
        }
    }

    /// Packets allowed this tick, never below one
    ///
    /// `client_max_pps` of `None` or 0 means the observer set no cap.
    pub fn packets_per_tick(&self, receive_speed: u32, bandwidth: u32, client_max_pps: Option<u32>) -> u32 {
        let measured = self.measured_rate(receive_speed, bandwidth);
        let mut packets = measured.div_ceil(self.tick_rate_hz).min(self.max_packets_per_tick);
        if let Some(cap) = client_max_pps.filter(|&cap| cap > 0) {
            packets = packets.min(cap.div_ceil(self.tick_rate_hz));
        }
        packets.max(1)
    }

    /// Budget for the next drain of one observer's queue
    pub fn budget(&self, window: &PacketTimeWindow, client_max_pps: Option<u32>) -> SendBudget {
        let receive_speed = window.get_packet_receive_speed();
        let bandwidth = window.get_estimated_bandwidth();
        let packets = self.packets_per_tick(receive_speed, bandwidth, client_max_pps);
        trace!(receive_speed, bandwidth, packets, "Send budget computed");
        SendBudget::new(packets, self.packet_payload_bytes)
    }
}

/// Bytes an observer may be sent in one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendBudget {
    packets: u32,
    total_bytes: usize,
    spent_bytes: usize,
    elements: u32,
}

impl SendBudget {
    pub fn new(packets: u32, payload_bytes: usize) -> Self {
        Self {
            packets,
            total_bytes: packets as usize * payload_bytes,
            spent_bytes: 0,
            elements: 0,
        }
    }

    #[inline]
    pub fn packets(&self) -> u32 {
        self.packets
    }

    #[inline]
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    #[inline]
    pub fn spent_bytes(&self) -> usize {
        self.spent_bytes
    }

    #[inline]
    pub fn remaining_bytes(&self) -> usize {
        self.total_bytes.saturating_sub(self.spent_bytes)
    }

    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.spent_bytes >= self.total_bytes
    }

    /// Charge `size` bytes if they fit
    ///
    /// The first element of a tick is always accepted, even when it alone
    /// exceeds the whole budget; otherwise it could never be sent.
    pub fn try_spend(&mut self, size: usize) -> bool {
        let fits = size <= self.remaining_bytes();
        if fits || self.elements == 0 {
            self.spent_bytes = self.spent_bytes.saturating_add(size);
            self.elements += 1;
            true
        } else {
            false
        }
    }
}
