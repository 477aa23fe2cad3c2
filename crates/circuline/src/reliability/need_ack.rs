use crate::protocol::FLAG_RESENT;
use crate::throttle::ThrottleCategory;
use bytes::BytesMut;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// An outbound datagram owned by the sender until acknowledged. The buffer
/// holds the stamped header and body; appended ACKs are added per emission
/// and never stored.
#[derive(Debug, Clone)]
pub struct OutgoingPacket {
    pub buffer: BytesMut,
    pub num: u32,
    pub sequence: u32,
    pub category: ThrottleCategory,
    pub reliable: bool,
    /// Stamped by the final emitter; `None` means "restamp on next send".
    pub first_sent: Option<Instant>,
    pub resend_count: u8,
}

/// Result of one resend sweep.
#[derive(Debug, Default)]
pub struct ResendSweep {
    /// Packets to re-emit, RESENT flag set, original sequence kept.
    pub resends: Vec<OutgoingPacket>,
    /// `(sequence, message number)` of packets that exhausted their
    /// resends and were dropped.
    pub evicted: Vec<(u32, u32)>,
}

/// Ordered map of reliable sends awaiting acknowledgment.
#[derive(Debug, Default)]
pub struct NeedAckMap {
    inner: Mutex<BTreeMap<u32, OutgoingPacket>>,
}

impl NeedAckMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, packet: OutgoingPacket) {
        self.inner.lock().unwrap().insert(packet.sequence, packet);
    }

    /// Retires `sequence`, returning the message number of the removed
    /// packet when one was outstanding.
    pub fn acknowledge(&self, sequence: u32) -> Option<u32> {
        self.inner
            .lock()
            .unwrap()
            .remove(&sequence)
            .map(|packet| packet.num)
    }

    /// Records the emission time of `sequence` unless already stamped.
    /// Resends clear the stamp first, so a re-emission restamps here.
    pub fn mark_sent(&self, sequence: u32, now: Instant) {
        if let Some(packet) = self.inner.lock().unwrap().get_mut(&sequence) {
            if packet.first_sent.is_none() {
                packet.first_sent = Some(now);
            }
        }
    }

    /// Smallest outstanding sequence, for StartPingCheck.
    pub fn oldest_unacked(&self) -> Option<u32> {
        self.inner.lock().unwrap().keys().next().copied()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Scans for packets whose last emission is older than `timeout`.
    /// Each either becomes a resend (flag set, stamp cleared, counters
    /// bumped) or is evicted once `max_resends` is spent.
    pub fn sweep(&self, now: Instant, timeout: Duration, max_resends: u8) -> ResendSweep {
        let mut result = ResendSweep::default();
        let mut map = self.inner.lock().unwrap();
        let expired: Vec<u32> = map
            .iter()
            .filter(|(_, p)| {
                p.first_sent
                    .is_some_and(|sent| now.duration_since(sent) > timeout)
            })
            .map(|(&seq, _)| seq)
            .collect();

        for seq in expired {
            let exhausted = map
                .get(&seq)
                .is_some_and(|p| p.resend_count >= max_resends);
            if exhausted {
                if let Some(packet) = map.remove(&seq) {
                    result.evicted.push((packet.sequence, packet.num));
                }
            } else if let Some(packet) = map.get_mut(&seq) {
                if !packet.buffer.is_empty() {
                    packet.buffer[0] |= FLAG_RESENT;
                }
                packet.first_sent = None;
                packet.resend_count += 1;
                result.resends.push(packet.clone());
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(sequence: u32) -> OutgoingPacket {
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&[crate::protocol::FLAG_RELIABLE, 0, 0, 0, sequence as u8, 0]);
        OutgoingPacket {
            buffer,
            num: 0xFFFF_0003,
            sequence,
            category: ThrottleCategory::Task,
            reliable: true,
            first_sent: None,
            resend_count: 0,
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(4);

    #[test]
    fn acknowledge_removes_and_reports_num() {
        let map = NeedAckMap::new();
        map.insert(packet(10));
        assert_eq!(map.acknowledge(10), Some(0xFFFF_0003));
        assert_eq!(map.acknowledge(10), None);
        assert!(map.is_empty());
    }

    #[test]
    fn oldest_unacked_is_the_smallest_sequence() {
        let map = NeedAckMap::new();
        map.insert(packet(30));
        map.insert(packet(12));
        assert_eq!(map.oldest_unacked(), Some(12));
    }

    #[test]
    fn unsent_packets_are_never_swept() {
        let map = NeedAckMap::new();
        map.insert(packet(1));
        let sweep = map.sweep(Instant::now() + TIMEOUT * 10, TIMEOUT, 3);
        assert!(sweep.resends.is_empty());
        assert!(sweep.evicted.is_empty());
    }

    #[test]
    fn resend_then_drop_ladder() {
        let map = NeedAckMap::new();
        map.insert(packet(10));
        let t0 = Instant::now();
        map.mark_sent(10, t0);

        for round in 1..=3u8 {
            let sweep = map.sweep(t0 + TIMEOUT * round as u32 + Duration::from_millis(1), TIMEOUT, 3);
            assert_eq!(sweep.resends.len(), 1, "round {}", round);
            let resend = &sweep.resends[0];
            assert_eq!(resend.sequence, 10, "resends keep the sequence");
            assert_eq!(resend.resend_count, round);
            assert_ne!(resend.buffer[0] & FLAG_RESENT, 0);
            // The stamp was cleared; the emitter restamps it.
            assert!(resend.first_sent.is_none());
            map.mark_sent(10, t0 + TIMEOUT * round as u32);
        }

        let sweep = map.sweep(t0 + TIMEOUT * 4 + Duration::from_millis(1), TIMEOUT, 3);
        assert!(sweep.resends.is_empty());
        assert_eq!(sweep.evicted, vec![(10, 0xFFFF_0003)]);
        assert!(map.is_empty());
    }

    #[test]
    fn mark_sent_does_not_overwrite_an_existing_stamp() {
        let map = NeedAckMap::new();
        map.insert(packet(5));
        let t0 = Instant::now();
        map.mark_sent(5, t0);
        map.mark_sent(5, t0 + Duration::from_secs(2));
        // Still due for resend at t0 + timeout, not t0 + 2s + timeout.
        let sweep = map.sweep(t0 + TIMEOUT + Duration::from_millis(1), TIMEOUT, 3);
        assert_eq!(sweep.resends.len(), 1);
    }
}
