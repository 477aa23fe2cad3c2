//! Appended-ACK tail handling. Any outbound datagram may carry piggyback
//! acknowledgments: up to K 4-byte big-endian sequence numbers followed by
//! a single count byte. The tail is never zero-encoded.

use std::collections::VecDeque;

/// Bytes one appended ACK costs on the wire.
pub const ACK_SIZE: usize = 4;

/// Bytes reserved for the trailing count.
pub const COUNT_SIZE: usize = 1;

/// Drains up to `budget`-many bytes of pending ACKs from the front of the
/// queue onto `out`, appending the count byte. Returns how many ACKs were
/// taken; zero means `out` is untouched and the flag must stay clear.
pub fn append_acks(out: &mut Vec<u8>, pending: &mut VecDeque<u32>, mtu: usize) -> usize {
    if pending.is_empty() {
        return 0;
    }
    let room = mtu.saturating_sub(out.len() + COUNT_SIZE) / ACK_SIZE;
    let take = room.min(pending.len()).min(u8::MAX as usize);
    if take == 0 {
        return 0;
    }
    let mut taken = 0usize;
    while taken < take {
        let Some(seq) = pending.pop_front() else { break };
        out.extend_from_slice(&seq.to_be_bytes());
        taken += 1;
    }
    out.push(taken as u8);
    taken
}

/// Splits a received datagram tail into `(body, acks)`. The caller has
/// already checked the APPENDED_ACKS flag. Malformed tails yield `None`.
pub fn strip_acks(data: &[u8]) -> Option<(&[u8], Vec<u32>)> {
    let (&count, rest) = data.split_last()?;
    let count = count as usize;
    if count == 0 || rest.len() < count * ACK_SIZE {
        return None;
    }
    let (body, tail) = rest.split_at(rest.len() - count * ACK_SIZE);
    let acks = tail
        .chunks_exact(ACK_SIZE)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Some((body, acks))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_strip_round_trips() {
        let mut pending: VecDeque<u32> = (100..105).collect();
        let mut out = vec![0xAA, 0xBB, 0xCC];
        let taken = append_acks(&mut out, &mut pending, 1200);
        assert_eq!(taken, 5);
        assert!(pending.is_empty());
        assert_eq!(*out.last().unwrap(), 5);

        let (body, acks) = strip_acks(&out).unwrap();
        assert_eq!(body, &[0xAA, 0xBB, 0xCC]);
        assert_eq!(acks, vec![100, 101, 102, 103, 104]);
    }

    #[test]
    fn budget_limits_the_tail() {
        let mut pending: VecDeque<u32> = (0..50).collect();
        // Room for the count byte plus exactly three ACKs.
        let mut out = vec![0u8; 100];
        let taken = append_acks(&mut out, &mut pending, 100 + COUNT_SIZE + 3 * ACK_SIZE);
        assert_eq!(taken, 3);
        assert_eq!(pending.len(), 47);
        assert_eq!(pending.front(), Some(&3));
    }

    #[test]
    fn no_room_leaves_queue_untouched() {
        let mut pending: VecDeque<u32> = (0..4).collect();
        let mut out = vec![0u8; 1199];
        assert_eq!(append_acks(&mut out, &mut pending, 1200), 0);
        assert_eq!(out.len(), 1199);
        assert_eq!(pending.len(), 4);
    }

    #[test]
    fn malformed_tail_is_rejected() {
        assert!(strip_acks(&[]).is_none());
        assert!(strip_acks(&[0x01, 0x02, 5]).is_none());
        assert!(strip_acks(&[0x01, 0]).is_none());
    }
}
