//! Run-length compression of zero bytes ("zero-encoding"). Applied to the
//! body only; header bytes and appended ACKs always travel raw.

use crate::error::CircuitError;

/// Encodes `body`, replacing every run of zero bytes with `{0x00, count}`
/// pairs (count 1..=255, longer runs emit multiple pairs). Returns `None`
/// when the encoded form would exceed `budget` bytes; the caller must then
/// send the raw body and clear the ZEROCODED flag.
pub fn zero_encode(body: &[u8], budget: usize) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(body.len().min(budget));
    let mut i = 0;
    while i < body.len() {
        let byte = body[i];
        if byte == 0 {
            let mut run = 1usize;
            while i + run < body.len() && body[i + run] == 0 {
                run += 1;
            }
            i += run;
            while run > 0 {
                let chunk = run.min(255);
                out.push(0x00);
                out.push(chunk as u8);
                run -= chunk;
            }
        } else {
            out.push(byte);
            i += 1;
        }
        if out.len() > budget {
            return None;
        }
    }
    Some(out)
}

/// Inverts [`zero_encode`]. The output is bounded by `max` bytes; payloads
/// expanding past that are treated as malformed.
pub fn zero_decode(body: &[u8], max: usize) -> Result<Vec<u8>, CircuitError> {
    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        let byte = body[i];
        if byte == 0 {
            if i + 1 >= body.len() {
                return Err(CircuitError::Truncated { len: body.len() });
            }
            let count = body[i + 1] as usize;
            if count == 0 {
                return Err(CircuitError::Binary(
                    opaline_binary::error::BinaryError::InvalidData(
                        "zero run with a count of 0".to_string(),
                    ),
                ));
            }
            if out.len() + count > max {
                return Err(CircuitError::DecodeOverflow { max });
            }
            out.resize(out.len() + count, 0);
            i += 2;
        } else {
            if out.len() + 1 > max {
                return Err(CircuitError::DecodeOverflow { max });
            }
            out.push(byte);
            i += 1;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::MAX_DECODED_SIZE;

    #[test]
    fn round_trip_mixed_payload() {
        let body: Vec<u8> = vec![1, 0, 0, 0, 2, 3, 0, 4, 0, 0, 5];
        let encoded = zero_encode(&body, 1200).unwrap();
        assert_eq!(encoded, vec![1, 0, 3, 2, 3, 0, 1, 4, 0, 2, 5]);
        assert_eq!(zero_decode(&encoded, MAX_DECODED_SIZE).unwrap(), body);
    }

    #[test]
    fn all_zero_payload_emits_ceil_pairs() {
        for n in [1usize, 254, 255, 256, 600, 1020] {
            let body = vec![0u8; n];
            let encoded = zero_encode(&body, 4096).unwrap();
            assert_eq!(encoded.len(), n.div_ceil(255) * 2, "n = {}", n);
            assert_eq!(zero_decode(&encoded, MAX_DECODED_SIZE).unwrap(), body);
        }
    }

    #[test]
    fn incompressible_payload_overflows_budget() {
        // Alternating single zeros double in size; a tight budget forces
        // the raw fallback.
        let body: Vec<u8> = (0..100).flat_map(|i| [i as u8 + 1, 0]).collect();
        assert!(zero_encode(&body, body.len()).is_none());
        assert!(zero_encode(&body, body.len() * 2).is_some());
    }

    #[test]
    fn truncated_run_is_malformed() {
        assert!(matches!(
            zero_decode(&[5, 0], MAX_DECODED_SIZE),
            Err(CircuitError::Truncated { .. })
        ));
    }

    #[test]
    fn decode_respects_output_bound() {
        // 40 pairs of 255 zeros each would inflate past the bound.
        let mut body = Vec::new();
        for _ in 0..40 {
            body.extend_from_slice(&[0x00, 0xFF]);
        }
        assert!(matches!(
            zero_decode(&body, MAX_DECODED_SIZE),
            Err(CircuitError::DecodeOverflow { .. })
        ));
    }
}
