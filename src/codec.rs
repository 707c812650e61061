//! Conversions between instrument wire formats and numeric arrays.
//!
//! Three formats show up on the bench:
//!
//! - controller readings such as `R+00123`: an echoed command letter, a sign
//!   and the digits,
//! - `FORM2` binary blocks from the network analyzer: `#A`, a 16-bit
//!   big-endian byte count, then interleaved big-endian `f32` pairs,
//! - comma-separated float lists returned by SCPI data queries.

use crate::error::{InstrumentError, Result};

/// Size of the `FORM2` block header (`#A` plus a two byte length).
pub const FORM2_HEADER_LEN: usize = 4;

/// Bytes used by one complex point in a `FORM2` block.
pub const FORM2_POINT_LEN: usize = 8;

/// Total size of a `FORM2` block carrying `points` complex samples.
pub fn form2_block_len(points: usize) -> usize {
    FORM2_POINT_LEN * points + FORM2_HEADER_LEN
}

/// True when the controller flagged the command as not understood or failed.
pub fn is_error_reply(reply: &str) -> bool {
    reply.contains('?') || reply.contains('E')
}

/// Parses a controller reading like `R+00123` into its value.
///
/// The first character is the echoed command letter and is dropped, then the
/// sign. A reply without a sign is read as positive.
pub fn parse_reading(command: &str, reply: &str) -> Result<f64> {
    let reply = reply.trim();
    let invalid = || InstrumentError::invalid_reply(command, reply);

    let mut chars = reply.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return Err(invalid()),
    }
    let rest = chars.as_str();
    let (negative, digits) = match rest.as_bytes().first() {
        Some(b'+') => (false, &rest[1..]),
        Some(b'-') => (true, &rest[1..]),
        _ => (false, rest),
    };
    if digits.is_empty() || !digits.starts_with(|c: char| c.is_ascii_digit() || c == '.') {
        return Err(invalid());
    }
    let value: f64 = digits.parse().map_err(|_| invalid())?;
    Ok(if negative { -value } else { value })
}

/// Decodes a `FORM2` block into its two de-interleaved sequences.
///
/// Even samples go to the first sequence (real / I), odd samples to the
/// second (imaginary / Q). Both have exactly `points` entries.
pub fn decode_form2(block: &[u8], points: usize) -> Result<(Vec<f64>, Vec<f64>)> {
    let expected = form2_block_len(points);
    if block.len() != expected {
        return Err(InstrumentError::BlockLength {
            expected,
            actual: block.len(),
        });
    }
    if &block[..2] != b"#A" {
        return Err(InstrumentError::BlockHeader(format!(
            "expected '#A', found {:?}",
            &block[..2]
        )));
    }
    let declared = u16::from_be_bytes([block[2], block[3]]) as usize;
    let payload = &block[FORM2_HEADER_LEN..];
    if declared != payload.len() {
        return Err(InstrumentError::BlockHeader(format!(
            "header declares {declared} bytes, payload has {}",
            payload.len()
        )));
    }

    let mut real = Vec::with_capacity(points);
    let mut imag = Vec::with_capacity(points);
    for pair in payload.chunks_exact(FORM2_POINT_LEN) {
        real.push(f32::from_be_bytes([pair[0], pair[1], pair[2], pair[3]]) as f64);
        imag.push(f32::from_be_bytes([pair[4], pair[5], pair[6], pair[7]]) as f64);
    }
    Ok((real, imag))
}

/// Builds a `FORM2` block from two sequences of equal length.
///
/// Fails when the payload does not fit the 16-bit length field.
pub fn encode_form2(real: &[f64], imag: &[f64]) -> Result<Vec<u8>> {
    if real.len() != imag.len() {
        return Err(InstrumentError::BlockLength {
            expected: real.len(),
            actual: imag.len(),
        });
    }
    let payload_len = FORM2_POINT_LEN * real.len();
    let declared = u16::try_from(payload_len).map_err(|_| {
        InstrumentError::BlockHeader(format!("{payload_len} bytes do not fit a FORM2 header"))
    })?;

    let mut block = Vec::with_capacity(payload_len + FORM2_HEADER_LEN);
    block.extend_from_slice(b"#A");
    block.extend_from_slice(&declared.to_be_bytes());
    for (re, im) in real.iter().zip(imag) {
        block.extend_from_slice(&(*re as f32).to_be_bytes());
        block.extend_from_slice(&(*im as f32).to_be_bytes());
    }
    Ok(block)
}

/// Parses a comma-separated list of floats as returned by SCPI data queries.
///
/// Surrounding whitespace and a trailing empty field are tolerated.
pub fn parse_float_list(command: &str, reply: &str) -> Result<Vec<f64>> {
    let trimmed = reply.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let body = trimmed.strip_suffix(',').unwrap_or(trimmed);
    body.split(',')
        .map(|field| {
            field
                .trim()
                .parse::<f64>()
                .map_err(|_| InstrumentError::invalid_reply(command, field.trim()))
        })
        .collect()
}

/// Parses an integer reply, accepting the float notation some instruments use
/// (`+1.00000E+01`).
pub fn parse_count(command: &str, reply: &str) -> Result<u32> {
    let trimmed = reply.trim();
    let invalid = || InstrumentError::invalid_reply(command, trimmed);
    if let Ok(n) = trimmed.parse::<u32>() {
        return Ok(n);
    }
    let value: f64 = trimmed.parse().map_err(|_| invalid())?;
    if value < 0.0 || value.fract() != 0.0 || value > u32::MAX as f64 {
        return Err(invalid());
    }
    Ok(value as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- Controller readings ---

    #[test]
    fn reading_with_positive_sign() {
        assert_eq!(parse_reading("R3", "R+00123").unwrap(), 123.0);
    }

    #[test]
    fn reading_with_negative_sign() {
        assert_eq!(parse_reading("R3", "R-00042").unwrap(), -42.0);
    }

    #[test]
    fn reading_without_sign_and_with_terminator() {
        assert_eq!(parse_reading("R2", "R01500\r\n").unwrap(), 1500.0);
    }

    #[test]
    fn reading_rejects_garbage() {
        assert!(matches!(
            parse_reading("R3", "R+"),
            Err(InstrumentError::InvalidReply { .. })
        ));
        assert!(parse_reading("R3", "+00123").is_err());
        assert!(parse_reading("R3", "").is_err());
        assert!(parse_reading("R3", "R+12a").is_err());
        assert!(parse_reading("R3", "R+-12").is_err());
    }

    #[test]
    fn error_markers() {
        assert!(is_error_reply("?R3"));
        assert!(is_error_reply("E"));
        assert!(!is_error_reply("R+00123"));
    }

    // --- FORM2 blocks ---

    fn block_of(values: &[f32]) -> Vec<u8> {
        let mut block = b"#A".to_vec();
        block.extend_from_slice(&((values.len() * 4) as u16).to_be_bytes());
        for v in values {
            block.extend_from_slice(&v.to_be_bytes());
        }
        block
    }

    #[test]
    fn form2_is_deinterleaved() {
        let block = block_of(&[1.0, -1.0, 2.5, 0.5, -3.0, 4.0]);
        let (i, q) = decode_form2(&block, 3).unwrap();
        assert_eq!(i, vec![1.0, 2.5, -3.0]);
        assert_eq!(q, vec![-1.0, 0.5, 4.0]);
    }

    #[test]
    fn form2_rejects_short_block() {
        let block = block_of(&[1.0, 2.0]);
        let err = decode_form2(&block, 2).unwrap_err();
        assert!(matches!(
            err,
            InstrumentError::BlockLength {
                expected: 20,
                actual: 12
            }
        ));
    }

    #[test]
    fn form2_rejects_bad_header() {
        let mut block = block_of(&[1.0, 2.0]);
        block[0] = b'X';
        assert!(matches!(
            decode_form2(&block, 1),
            Err(InstrumentError::BlockHeader(_))
        ));

        let mut block = block_of(&[1.0, 2.0]);
        block[3] = 4;
        assert!(matches!(
            decode_form2(&block, 1),
            Err(InstrumentError::BlockHeader(_))
        ));
    }

    #[test]
    fn form2_with_zero_points() {
        let (i, q) = decode_form2(b"#A\0\0", 0).unwrap();
        assert!(i.is_empty() && q.is_empty());
    }

    #[test]
    fn encode_rejects_mismatched_lengths() {
        assert!(encode_form2(&[1.0, 2.0], &[1.0]).is_err());
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let big = vec![0.0; 9000];
        assert!(matches!(
            encode_form2(&big, &big),
            Err(InstrumentError::BlockHeader(_))
        ));
    }

    // --- ASCII lists ---

    #[test]
    fn float_list_parses_scientific_notation() {
        let values = parse_float_list("CALC:DATA:FDAT?", "+1.5E+00, -2.0E-03,3\n").unwrap();
        assert_eq!(values, vec![1.5, -0.002, 3.0]);
    }

    #[test]
    fn float_list_tolerates_trailing_comma_and_empty_reply() {
        assert_eq!(parse_float_list("X", "1,2,").unwrap(), vec![1.0, 2.0]);
        assert!(parse_float_list("X", " \n").unwrap().is_empty());
    }

    #[test]
    fn float_list_rejects_bad_field() {
        let err = parse_float_list("FREQ:DATA?", "1,abc,3").unwrap_err();
        match err {
            InstrumentError::InvalidReply { command, reply } => {
                assert_eq!(command, "FREQ:DATA?");
                assert_eq!(reply, "abc");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn count_accepts_float_notation() {
        assert_eq!(parse_count("AVER:COUN?", "16\n").unwrap(), 16);
        assert_eq!(parse_count("AVER:COUN?", "+1.00000E+01").unwrap(), 10);
        assert!(parse_count("AVER:COUN?", "2.5").is_err());
        assert!(parse_count("AVER:COUN?", "-1").is_err());
    }
}
