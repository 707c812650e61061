//! Property-based tests for the instrument reply codecs.

use cryolab::codec::{decode_form2, encode_form2, form2_block_len, parse_reading};
use proptest::prelude::*;

/// Finite values that survive the trip through `f32` unchanged.
fn arb_sample() -> impl Strategy<Value = f64> {
    (-1.0e6_f32..1.0e6_f32).prop_map(f64::from)
}

fn arb_trace() -> impl Strategy<Value = (Vec<f64>, Vec<f64>)> {
    (0_usize..200).prop_flat_map(|n| {
        (
            prop::collection::vec(arb_sample(), n),
            prop::collection::vec(arb_sample(), n),
        )
    })
}

proptest! {
    #[test]
    fn decoded_sequences_have_point_count_length((real, imag) in arb_trace()) {
        let block = encode_form2(&real, &imag).unwrap();
        prop_assert_eq!(block.len(), form2_block_len(real.len()));
        let (i, q) = decode_form2(&block, real.len()).unwrap();
        prop_assert_eq!(i.len(), real.len());
        prop_assert_eq!(q.len(), real.len());
        prop_assert_eq!(i, real);
        prop_assert_eq!(q, imag);
    }

    #[test]
    fn even_samples_are_in_phase(values in prop::collection::vec(arb_sample(), 0..100)) {
        // Build the block by hand from one flat interleaved list.
        let values: Vec<f64> = if values.len() % 2 == 1 {
            values[..values.len() - 1].to_vec()
        } else {
            values
        };
        let points = values.len() / 2;
        let mut block = b"#A".to_vec();
        block.extend_from_slice(&((values.len() * 4) as u16).to_be_bytes());
        for v in &values {
            block.extend_from_slice(&(*v as f32).to_be_bytes());
        }
        let (i, q) = decode_form2(&block, points).unwrap();
        let even: Vec<f64> = values.iter().step_by(2).copied().collect();
        let odd: Vec<f64> = values.iter().skip(1).step_by(2).copied().collect();
        prop_assert_eq!(i, even);
        prop_assert_eq!(q, odd);
    }

    #[test]
    fn wrong_block_length_is_rejected(points in 1_usize..100, delta in 1_usize..8, shorter in any::<bool>()) {
        let expected = form2_block_len(points);
        let len = if shorter { expected - delta } else { expected + delta };
        let block = vec![0u8; len];
        prop_assert!(decode_form2(&block, points).is_err());
    }

    #[test]
    fn arbitrary_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..64), points in 0_usize..8) {
        let _ = decode_form2(&bytes, points);
    }

    #[test]
    fn signed_readings(value in -99_999_i32..=99_999, letter in "[A-Z]") {
        let reply = format!("{}{:+06}", letter, value);
        prop_assert_eq!(parse_reading("R1", &reply).unwrap(), f64::from(value));
    }
}
