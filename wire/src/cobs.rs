//! COBS (Consistent Overhead Byte Stuffing) encoding and decoding.
//!
//! COBS removes all zero bytes from data, allowing 0x00 to be used as a frame
//! delimiter. Overhead is one code byte per 254 bytes of payload, so a mount
//! frame (at most 64 bytes) always encodes to `len + 1` bytes.

use thiserror::Error;

/// Decoding failures. Either way the block did not come out of a conforming
/// encoder and must be discarded.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CobsError {
    #[error("invalid COBS block: zero code byte")]
    ZeroCode,
    #[error("invalid COBS block: code extends beyond input")]
    TruncatedBlock,
}

/// Encode `input` so that the result contains no zero bytes.
///
/// The caller appends the `0x00` delimiter when framing a packet; it is not
/// part of the encoded block.
pub fn encode(input: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len() + input.len() / 254 + 2);
    // Placeholder for the first code byte.
    output.push(0);
    let mut code_idx = 0;
    let mut code: u8 = 0x01;

    for &byte in input {
        if byte == 0 {
            output[code_idx] = code;
            code_idx = output.len();
            output.push(0);
            code = 0x01;
        } else {
            output.push(byte);
            code += 1;
            if code == 0xFF {
                // Block full: 254 literal bytes with no implied zero.
                output[code_idx] = code;
                code_idx = output.len();
                output.push(0);
                code = 0x01;
            }
        }
    }

    output[code_idx] = code;
    output
}

/// Decode an encoded block (without the trailing delimiter).
pub fn decode(input: &[u8]) -> Result<Vec<u8>, CobsError> {
    let mut output = Vec::with_capacity(input.len());
    let mut idx = 0;

    while idx < input.len() {
        let code = input[idx];
        if code == 0 {
            return Err(CobsError::ZeroCode);
        }
        idx += 1;

        let run = code as usize - 1;
        if idx + run > input.len() {
            return Err(CobsError::TruncatedBlock);
        }
        output.extend_from_slice(&input[idx..idx + run]);
        idx += run;

        if code != 0xFF && idx < input.len() {
            output.push(0);
        }
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_encode_empty() {
        assert_eq!(encode(&[]), [0x01]);
    }

    #[test]
    fn test_encode_no_zeros() {
        assert_eq!(
            encode(&[0x11, 0x22, 0x33, 0x44]),
            [0x05, 0x11, 0x22, 0x33, 0x44]
        );
    }

    #[test]
    fn test_encode_with_zeros() {
        assert_eq!(
            encode(&[0x11, 0x00, 0x00, 0x11]),
            [0x02, 0x11, 0x01, 0x02, 0x11]
        );
    }

    #[test]
    fn test_encode_leading_zero() {
        assert_eq!(encode(&[0x00, 0x11, 0x22]), [0x01, 0x03, 0x11, 0x22]);
    }

    #[test]
    fn test_encode_trailing_zero() {
        assert_eq!(encode(&[0x11, 0x22, 0x00]), [0x03, 0x11, 0x22, 0x01]);
    }

    #[test]
    fn test_decode_with_zeros() {
        assert_eq!(
            decode(&[0x02, 0x11, 0x01, 0x02, 0x11]).unwrap(),
            [0x11, 0x00, 0x00, 0x11]
        );
    }

    #[test]
    fn test_decode_zero_code_byte() {
        assert_eq!(decode(&[0x02, 0x11, 0x00, 0x11]), Err(CobsError::ZeroCode));
    }

    #[test]
    fn test_decode_truncated_block() {
        assert_eq!(
            decode(&[0x05, 0x11, 0x22]),
            Err(CobsError::TruncatedBlock)
        );
    }

    #[test]
    fn test_long_run_block_split() {
        // 254 non-zero bytes fill a block exactly; the encoder must emit the
        // 0xFF code and start a fresh block with no implied zero between.
        let input = [0x42u8; 254];
        let encoded = encode(&input);
        assert_eq!(encoded.len(), 256);
        assert_eq!(encoded[0], 0xFF);
        assert_eq!(encoded[255], 0x01);
        assert_eq!(decode(&encoded).unwrap(), input);

        let input = [0x42u8; 255];
        let encoded = encode(&input);
        assert_eq!(encoded[0], 0xFF);
        assert_eq!(encoded[255], 0x02);
        assert_eq!(decode(&encoded).unwrap(), input);
    }

    #[test]
    fn test_roundtrip_all_lengths() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for len in 0..=1024usize {
            let input: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let encoded = encode(&input);
            assert!(
                !encoded.contains(&0x00),
                "encoded output contains a zero at len {len}"
            );
            assert!(encoded.len() <= input.len() + input.len().div_ceil(254) + 1);
            assert_eq!(decode(&encoded).unwrap(), input, "round trip at len {len}");
        }
    }

    #[test]
    fn test_roundtrip_zero_runs() {
        let input = [0x00u8; 64];
        let encoded = encode(&input);
        assert!(!encoded.contains(&0x00));
        assert_eq!(decode(&encoded).unwrap(), input);
    }
}
