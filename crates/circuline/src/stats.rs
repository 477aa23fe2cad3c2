//! Per-circuit traffic counters and the 1 Hz moving throughput window.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters updated on the hot paths plus a ring the stats
/// scheduler samples once per second.
#[derive(Debug, Default)]
pub struct CircuitStats {
    pub sent_packets: AtomicU64,
    pub recv_packets: AtomicU64,
    pub sent_bytes: AtomicU64,
    pub recv_bytes: AtomicU64,
    pub resent_packets: AtomicU64,
    pub received_resends: AtomicU64,
    pub dropped_packets: AtomicU64,
    /// Most recent ping round trip, microseconds. 0 = no sample yet.
    pub last_rtt_us: AtomicU64,
    window: Mutex<ThroughputWindow>,
}

#[derive(Debug)]
struct ThroughputWindow {
    sent: VecDeque<u64>,
    recv: VecDeque<u64>,
    capacity: usize,
}

impl Default for ThroughputWindow {
    fn default() -> Self {
        Self {
            sent: VecDeque::new(),
            recv: VecDeque::new(),
            capacity: crate::consts::STATS_QUEUE_SIZE,
        }
    }
}

/// Point-in-time copy handed to callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub sent_packets: u64,
    pub recv_packets: u64,
    pub sent_bytes: u64,
    pub recv_bytes: u64,
    pub resent_packets: u64,
    pub received_resends: u64,
    pub dropped_packets: u64,
    pub last_rtt_us: u64,
    pub sent_bps: u64,
    pub recv_bps: u64,
}

impl CircuitStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes the current byte counters into the window. Called by the
    /// stats scheduler at a fixed 1 Hz cadence.
    pub fn roll_window(&self) {
        let mut window = self.window.lock().unwrap();
        let capacity = window.capacity;
        window.sent.push_back(self.sent_bytes.load(Ordering::Relaxed));
        window.recv.push_back(self.recv_bytes.load(Ordering::Relaxed));
        while window.sent.len() > capacity {
            window.sent.pop_front();
        }
        while window.recv.len() > capacity {
            window.recv.pop_front();
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let window = self.window.lock().unwrap();
        StatsSnapshot {
            sent_packets: self.sent_packets.load(Ordering::Relaxed),
            recv_packets: self.recv_packets.load(Ordering::Relaxed),
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
            recv_bytes: self.recv_bytes.load(Ordering::Relaxed),
            resent_packets: self.resent_packets.load(Ordering::Relaxed),
            received_resends: self.received_resends.load(Ordering::Relaxed),
            dropped_packets: self.dropped_packets.load(Ordering::Relaxed),
            last_rtt_us: self.last_rtt_us.load(Ordering::Relaxed),
            sent_bps: bps(&window.sent),
            recv_bps: bps(&window.recv),
        }
    }
}

/// Average bytes/second over the window: `(newest − oldest) / slots`.
fn bps(samples: &VecDeque<u64>) -> u64 {
    match (samples.front(), samples.back()) {
        (Some(&oldest), Some(&newest)) if samples.len() > 1 => {
            (newest - oldest) / samples.len() as u64
        }
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_reports_average_rate() {
        let stats = CircuitStats::new();
        for chunk in [0u64, 1000, 2000, 3000, 4000] {
            stats.sent_bytes.store(chunk, Ordering::Relaxed);
            stats.roll_window();
        }
        // (4000 - 0) / 5 slots.
        assert_eq!(stats.snapshot().sent_bps, 800);
    }

    #[test]
    fn window_is_bounded() {
        let stats = CircuitStats::new();
        for i in 0..20u64 {
            stats.recv_bytes.store(i * 100, Ordering::Relaxed);
            stats.roll_window();
        }
        // Oldest surviving sample is 15*100 after FIFO eviction.
        assert_eq!(stats.snapshot().recv_bps, (1900 - 1500) / 5);
    }

    #[test]
    fn empty_window_reports_zero() {
        let stats = CircuitStats::new();
        assert_eq!(stats.snapshot().sent_bps, 0);
        stats.roll_window();
        assert_eq!(stats.snapshot().sent_bps, 0);
    }
}
