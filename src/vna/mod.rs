//! Vector network analyzer drivers.
//!
//! Two generations of analyzer are on the bench: an HP 8753-family unit on
//! GPIB that ships data as `FORM2` binary blocks, and a SCPI analyzer on the
//! LAN that answers in ASCII.

mod hp8753;
mod scpi;

pub use hp8753::{DisplayFormat, Hp8753, OutputArray, HP8753_MAX_POINTS};
pub use scpi::{InstrumentMode, ScanSettings, ScpiVna, TraceFormat};

use crate::error::Result;
use crate::spectrum::IqSpectrum;

/// Anything that can hand back one I/Q spectrum per call.
pub trait Analyzer {
    /// Identification string of the instrument.
    fn identify(&mut self) -> Result<String>;

    /// Take one spectrum with the current settings.
    fn acquire(&mut self) -> Result<IqSpectrum>;
}

impl<A: Analyzer + ?Sized> Analyzer for Box<A> {
    fn identify(&mut self) -> Result<String> {
        (**self).identify()
    }

    fn acquire(&mut self) -> Result<IqSpectrum> {
        (**self).acquire()
    }
}

/// `n` equally spaced frequencies from `start` to `stop`, inclusive.
pub fn linear_frequencies(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => (0..n)
            .map(|k| start + (stop - start) * k as f64 / (n - 1) as f64)
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_frequencies_hit_both_ends() {
        let f = linear_frequencies(1.0, 2.0, 5);
        assert_eq!(f, vec![1.0, 1.25, 1.5, 1.75, 2.0]);
        assert_eq!(linear_frequencies(3.0, 4.0, 1), vec![3.0]);
        assert!(linear_frequencies(3.0, 4.0, 0).is_empty());
    }
}
