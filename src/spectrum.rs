//! I/Q spectra and the quantities derived from them.

use crate::codec;
use crate::error::{InstrumentError, Result};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::io::Write;

/// One sweep of the analyzer as in-phase and quadrature components.
///
/// `i` and `q` always have the same length. `frequencies` is either empty
/// (the instrument did not report them) or has that length too.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IqSpectrum {
    pub frequencies: Vec<f64>,
    pub i: Vec<f64>,
    pub q: Vec<f64>,
}

/// Amplitude and phase of a spectrum, point by point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AmpPhaseSpectrum {
    pub frequencies: Vec<f64>,
    pub amplitude: Vec<f64>,
    /// Radians, in (-π, π].
    pub phase: Vec<f64>,
}

impl IqSpectrum {
    pub fn new(frequencies: Vec<f64>, i: Vec<f64>, q: Vec<f64>) -> Result<Self> {
        if i.len() != q.len() {
            return Err(InstrumentError::BlockLength {
                expected: i.len(),
                actual: q.len(),
            });
        }
        if !frequencies.is_empty() && frequencies.len() != i.len() {
            return Err(InstrumentError::BlockLength {
                expected: i.len(),
                actual: frequencies.len(),
            });
        }
        Ok(Self { frequencies, i, q })
    }

    /// Spectrum from a `FORM2` block of `points` complex samples.
    pub fn from_form2(block: &[u8], points: usize) -> Result<Self> {
        let (i, q) = codec::decode_form2(block, points)?;
        Ok(Self {
            frequencies: Vec::new(),
            i,
            q,
        })
    }

    pub fn len(&self) -> usize {
        self.i.len()
    }

    pub fn is_empty(&self) -> bool {
        self.i.is_empty()
    }

    pub fn samples(&self) -> impl Iterator<Item = Complex64> + '_ {
        self.i
            .iter()
            .zip(&self.q)
            .map(|(&re, &im)| Complex64::new(re, im))
    }

    /// `sqrt(I² + Q²)` per point.
    pub fn amplitude(&self) -> Vec<f64> {
        self.samples().map(|s| s.norm()).collect()
    }

    /// `atan2(Q, I)` per point, in radians.
    pub fn phase(&self) -> Vec<f64> {
        self.samples().map(|s| s.arg()).collect()
    }

    /// `20·log10(amplitude)` per point.
    pub fn s21_db(&self) -> Vec<f64> {
        iq_to_s21_db(&self.i, &self.q)
    }

    pub fn to_amp_phase(&self) -> AmpPhaseSpectrum {
        AmpPhaseSpectrum {
            frequencies: self.frequencies.clone(),
            amplitude: self.amplitude(),
            phase: self.phase(),
        }
    }

    /// Writes one CSV row per point.
    pub fn write_csv<W: Write>(&self, mut out: W) -> Result<()> {
        writeln!(out, "point,frequency_hz,i,q,amplitude,phase_rad,s21_db")?;
        self.write_csv_rows(&mut out, None)
    }

    fn write_csv_rows<W: Write>(&self, out: &mut W, temperature: Option<f64>) -> Result<()> {
        for (k, s) in self.samples().enumerate() {
            if let Some(t) = temperature {
                write!(out, "{t},")?;
            }
            let frequency = self
                .frequencies
                .get(k)
                .map(|f| f.to_string())
                .unwrap_or_default();
            writeln!(
                out,
                "{},{},{},{},{},{},{}",
                k,
                frequency,
                s.re,
                s.im,
                s.norm(),
                s.arg(),
                20.0 * s.norm().log10()
            )?;
        }
        Ok(())
    }
}

/// S21 in dB from separate I and Q sequences.
pub fn iq_to_s21_db(i: &[f64], q: &[f64]) -> Vec<f64> {
    i.iter()
        .zip(q)
        .map(|(&re, &im)| 20.0 * Complex64::new(re, im).norm().log10())
        .collect()
}

/// A spectrum taken once the fridge settled at a temperature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepPoint {
    pub temperature_mk: f64,
    pub spectrum: IqSpectrum,
}

/// Spectra taken at a series of temperatures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemperatureSweep {
    pub points: Vec<SweepPoint>,
}

impl TemperatureSweep {
    pub fn push(&mut self, temperature_mk: f64, spectrum: IqSpectrum) {
        self.points.push(SweepPoint {
            temperature_mk,
            spectrum,
        });
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn temperatures(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.temperature_mk).collect()
    }

    /// Amplitudes, one row per temperature.
    pub fn amplitude_matrix(&self) -> Vec<Vec<f64>> {
        self.points.iter().map(|p| p.spectrum.amplitude()).collect()
    }

    /// Phases, one row per temperature.
    pub fn phase_matrix(&self) -> Vec<Vec<f64>> {
        self.points.iter().map(|p| p.spectrum.phase()).collect()
    }

    /// Long-format CSV: one row per temperature and point.
    pub fn write_csv<W: Write>(&self, mut out: W) -> Result<()> {
        writeln!(
            out,
            "temperature_mk,point,frequency_hz,i,q,amplitude,phase_rad,s21_db"
        )?;
        for point in &self.points {
            point
                .spectrum
                .write_csv_rows(&mut out, Some(point.temperature_mk))?;
        }
        Ok(())
    }

    pub fn write_json<W: Write>(&self, out: W) -> Result<()> {
        serde_json::to_writer_pretty(out, self).map_err(std::io::Error::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::{FRAC_PI_2, PI};

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn amplitude_and_phase() {
        let s = IqSpectrum::new(vec![], vec![3.0, 0.0, -1.0], vec![4.0, 2.0, 0.0]).unwrap();
        assert_eq!(s.amplitude(), vec![5.0, 2.0, 1.0]);
        let phase = s.phase();
        assert!(approx(phase[0], (4.0f64).atan2(3.0)));
        assert!(approx(phase[1], FRAC_PI_2));
        assert!(approx(phase[2], PI));
    }

    #[test]
    fn s21_in_decibels() {
        let db = iq_to_s21_db(&[0.1, 1.0], &[0.0, 0.0]);
        assert!(approx(db[0], -20.0));
        assert!(approx(db[1], 0.0));
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        assert!(IqSpectrum::new(vec![], vec![1.0], vec![]).is_err());
        assert!(IqSpectrum::new(vec![1.0, 2.0], vec![1.0], vec![1.0]).is_err());
        assert!(IqSpectrum::new(vec![1e9], vec![1.0], vec![1.0]).is_ok());
    }

    #[test]
    fn from_form2_block() {
        let block = codec::encode_form2(&[1.0, 0.5], &[0.0, -0.5]).unwrap();
        let s = IqSpectrum::from_form2(&block, 2).unwrap();
        assert_eq!(s.i, vec![1.0, 0.5]);
        assert_eq!(s.q, vec![0.0, -0.5]);
        assert!(s.frequencies.is_empty());
    }

    #[test]
    fn matrices_have_one_row_per_temperature() {
        let mut sweep = TemperatureSweep::default();
        sweep.push(20.0, IqSpectrum::new(vec![], vec![1.0, 0.0], vec![0.0, 1.0]).unwrap());
        sweep.push(40.0, IqSpectrum::new(vec![], vec![0.0, 2.0], vec![2.0, 0.0]).unwrap());
        assert_eq!(sweep.temperatures(), vec![20.0, 40.0]);
        assert_eq!(sweep.amplitude_matrix(), vec![vec![1.0, 1.0], vec![2.0, 2.0]]);
        assert!(approx(sweep.phase_matrix()[1][0], FRAC_PI_2));
    }

    #[test]
    fn csv_export() {
        let s = IqSpectrum::new(vec![1e9, 2e9], vec![1.0, 0.0], vec![0.0, 1.0]).unwrap();
        let mut out = Vec::new();
        s.write_csv(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "point,frequency_hz,i,q,amplitude,phase_rad,s21_db");
        assert!(lines[1].starts_with("0,1000000000,1,0,1,0,0"));
    }

    #[test]
    fn sweep_csv_prefixes_temperature() {
        let mut sweep = TemperatureSweep::default();
        sweep.push(25.5, IqSpectrum::new(vec![], vec![1.0], vec![0.0]).unwrap());
        let mut out = Vec::new();
        sweep.write_csv(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().nth(1).unwrap(), "25.5,0,,1,0,1,0,0");
    }

    #[test]
    fn json_export_is_readable_back() {
        let mut sweep = TemperatureSweep::default();
        sweep.push(30.0, IqSpectrum::new(vec![5e9], vec![0.25], vec![-0.5]).unwrap());
        let mut out = Vec::new();
        sweep.write_json(&mut out).unwrap();
        let back: TemperatureSweep = serde_json::from_slice(&out).unwrap();
        assert_eq!(back, sweep);
    }
}
