//! HP 8753-family analyzer: GPIB mnemonics and `FORM2` traces.

use super::{linear_frequencies, Analyzer};
use crate::codec;
use crate::error::{InstrumentError, Result};
use crate::spectrum::IqSpectrum;
use crate::transport::{MessageLink, Transport};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

/// Largest trace the 8753 family holds.
pub const HP8753_MAX_POINTS: usize = 1601;

/// How the analyzer formats the trace it displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DisplayFormat {
    /// Real and imaginary parts; what the I/Q acquisition wants.
    #[default]
    Polar,
    LogMagnitude,
    Phase,
    Delay,
    SmithChart,
    LinearMagnitude,
    Swr,
    Real,
    Imaginary,
}

impl DisplayFormat {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::Polar => "POLA;",
            Self::LogMagnitude => "LOGM;",
            Self::Phase => "PHAS;",
            Self::Delay => "DELA;",
            Self::SmithChart => "SMIC;",
            Self::LinearMagnitude => "LINM;",
            Self::Swr => "SWR;",
            Self::Real => "REAL;",
            Self::Imaginary => "IMAG;",
        }
    }
}

impl FromStr for DisplayFormat {
    type Err = InstrumentError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace(['_', '-'], " ");
        Ok(match normalized.as_str() {
            "polar" => Self::Polar,
            "log magnitude" | "logm" => Self::LogMagnitude,
            "phase" | "phas" => Self::Phase,
            "delay" | "dela" => Self::Delay,
            "smith chart" | "smith" | "smic" => Self::SmithChart,
            "linear magnitude" | "linm" => Self::LinearMagnitude,
            "swr" => Self::Swr,
            "real" => Self::Real,
            "imaginary" | "imag" => Self::Imaginary,
            _ => return Err(InstrumentError::Unsupported(format!("display format {s:?}"))),
        })
    }
}

impl fmt::Display for DisplayFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic().trim_end_matches(';'))
    }
}

/// Which internal array the analyzer sends back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputArray {
    Raw1,
    Raw2,
    Raw3,
    Raw4,
    ErrorCorrectedData,
    ErrorCorrectedMemory,
    #[default]
    FormattedData,
    FormattedMemory,
    DataDividedByMemory,
    DataMinusMemory,
}

impl OutputArray {
    /// Mnemonics that select and request this array.
    pub fn request(self) -> &'static str {
        match self {
            Self::Raw1 => "OUTPRAW1;",
            Self::Raw2 => "OUTPRAW2;",
            Self::Raw3 => "OUTPRAW3;",
            Self::Raw4 => "OUTPRAW4;",
            Self::ErrorCorrectedData => "OUTPDATA;",
            Self::ErrorCorrectedMemory => "OUTPMEMO;",
            Self::FormattedData => "DISPDATA;OUTPFORM",
            Self::FormattedMemory => "DISPMEMO;OUTPFORM",
            Self::DataDividedByMemory => "DISPDDM;OUTPFORM",
            Self::DataMinusMemory => "DISPDMM;OUTPFORM",
        }
    }
}

impl FromStr for OutputArray {
    type Err = InstrumentError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace(['_', '-'], " ");
        Ok(match normalized.as_str() {
            "raw1" | "raw 1" => Self::Raw1,
            "raw2" | "raw 2" => Self::Raw2,
            "raw3" | "raw 3" => Self::Raw3,
            "raw4" | "raw 4" => Self::Raw4,
            "error corrected data" | "data" => Self::ErrorCorrectedData,
            "error corrected memory" | "memory" => Self::ErrorCorrectedMemory,
            "formatted data" | "formatted" => Self::FormattedData,
            "formatted memory" => Self::FormattedMemory,
            "data divided by memory" | "ddm" => Self::DataDividedByMemory,
            "data minus memory" | "dmm" => Self::DataMinusMemory,
            _ => return Err(InstrumentError::Unsupported(format!("output array {s:?}"))),
        })
    }
}

/// HP/Agilent 8753-family analyzer.
///
/// Traces come back as `FORM2` blocks: a 4 byte header and then one pair of
/// big-endian `f32` per point.
pub struct Hp8753<T> {
    link: MessageLink<T>,
    points: usize,
    range_hz: Option<(f64, f64)>,
    format: DisplayFormat,
    output: OutputArray,
}

impl<T: Transport> Hp8753<T> {
    /// Puts the analyzer into binary output, channel 1, S21 and `points`
    /// points per sweep.
    pub fn open(transport: T, points: usize) -> Result<Self> {
        if !(3..=HP8753_MAX_POINTS).contains(&points) {
            return Err(InstrumentError::OutOfRange {
                what: "sweep points",
                value: points as f64,
            });
        }
        let mut link = MessageLink::new(transport, "\n", b'\n');
        link.clear()?;
        for command in ["FORM2;", "CHAN1;", "S21;"] {
            link.write(command)?;
        }
        link.write(&format!("POIN {points};"))?;
        info!("{} ready, {} points", link.describe(), points);
        Ok(Self {
            link,
            points,
            range_hz: None,
            format: DisplayFormat::default(),
            output: OutputArray::default(),
        })
    }

    pub fn points(&self) -> usize {
        self.points
    }

    /// Linear sweep between two frequencies in GHz, continuous trigger.
    pub fn set_frequency_range(&mut self, start_ghz: f64, stop_ghz: f64) -> Result<()> {
        if !(start_ghz.is_finite() && start_ghz > 0.0) {
            return Err(InstrumentError::OutOfRange {
                what: "start frequency",
                value: start_ghz,
            });
        }
        if !(stop_ghz.is_finite() && stop_ghz > start_ghz) {
            return Err(InstrumentError::OutOfRange {
                what: "stop frequency",
                value: stop_ghz,
            });
        }
        self.link.write("LINFREQ;")?;
        self.link.write(&format!("STAR {start_ghz} GHZ;"))?;
        self.link.write(&format!("STOP {stop_ghz} GHZ;"))?;
        self.link.write("CONT;")?;
        self.range_hz = Some((start_ghz * 1e9, stop_ghz * 1e9));
        Ok(())
    }

    pub fn beep(&mut self) -> Result<()> {
        self.link.write("EMIB;")
    }

    pub fn set_display_format(&mut self, format: DisplayFormat) -> Result<()> {
        self.link.write(format.mnemonic())?;
        self.format = format;
        Ok(())
    }

    pub fn request_output(&mut self, output: OutputArray) -> Result<()> {
        self.link.write(output.request())?;
        self.output = output;
        Ok(())
    }

    /// Format, request and read one trace.
    pub fn read_data(&mut self, format: DisplayFormat, output: OutputArray) -> Result<IqSpectrum> {
        self.link.clear()?;
        self.set_display_format(format)?;
        self.request_output(output)?;
        let block = self.link.read_block(codec::form2_block_len(self.points))?;
        let mut spectrum = IqSpectrum::from_form2(&block, self.points)?;
        if let Some((start, stop)) = self.range_hz {
            spectrum.frequencies = linear_frequencies(start, stop, self.points);
        }
        debug!("read {} points as {}", spectrum.len(), format);
        Ok(spectrum)
    }

    /// Use `format` and `output` for later [`Analyzer::acquire`] calls.
    pub fn configure_acquisition(&mut self, format: DisplayFormat, output: OutputArray) {
        self.format = format;
        self.output = output;
    }

    pub fn into_transport(self) -> T {
        self.link.into_inner()
    }
}

impl<T: Transport> Analyzer for Hp8753<T> {
    fn identify(&mut self) -> Result<String> {
        self.link.clear()?;
        self.link.query("OUTPIDEN;")
    }

    fn acquire(&mut self) -> Result<IqSpectrum> {
        self.read_data(self.format, self.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Hp8753Simulator, SimTransport};
    use std::sync::{Arc, Mutex};

    fn analyzer(points: usize) -> (Hp8753<SimTransport<Hp8753Simulator>>, Arc<Mutex<Hp8753Simulator>>) {
        let sim = Arc::new(Mutex::new(Hp8753Simulator::new()));
        let vna = Hp8753::open(SimTransport::shared(sim.clone()), points).unwrap();
        (vna, sim)
    }

    #[test]
    fn open_configures_binary_output() {
        let (vna, sim) = analyzer(101);
        let sim = sim.lock().unwrap();
        assert!(sim.binary);
        assert_eq!(sim.points, 101);
        assert_eq!(vna.points(), 101);
        assert!(sim.history.iter().any(|c| c == "S21"));
    }

    #[test]
    fn rejects_too_many_points() {
        let sim = SimTransport::new(Hp8753Simulator::new());
        assert!(Hp8753::open(sim, 1602).is_err());
    }

    #[test]
    fn frequency_range_in_ghz() {
        let (mut vna, sim) = analyzer(11);
        vna.set_frequency_range(5.0, 5.5).unwrap();
        let sim = sim.lock().unwrap();
        assert_eq!(sim.start_hz, 5.0e9);
        assert_eq!(sim.stop_hz, 5.5e9);
        assert!(sim.continuous);
        assert!(vna.set_frequency_range(5.0, 4.0).is_err());
    }

    #[test]
    fn read_polar_trace() {
        let (mut vna, _sim) = analyzer(21);
        vna.set_frequency_range(4.0, 6.0).unwrap();
        let spectrum = vna
            .read_data(DisplayFormat::Polar, OutputArray::FormattedData)
            .unwrap();
        assert_eq!(spectrum.len(), 21);
        assert_eq!(spectrum.frequencies.first(), Some(&4.0e9));
        assert_eq!(spectrum.frequencies.last(), Some(&6.0e9));
        // the resonance sits in the middle of the span
        let amplitude = spectrum.amplitude();
        let dip = amplitude
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(k, _)| k);
        assert_eq!(dip, Some(10));
    }

    #[test]
    fn acquire_uses_configured_arrays() {
        let (mut vna, sim) = analyzer(11);
        vna.configure_acquisition(DisplayFormat::LogMagnitude, OutputArray::Raw1);
        let spectrum = vna.acquire().unwrap();
        assert_eq!(spectrum.len(), 11);
        let sim = sim.lock().unwrap();
        assert_eq!(sim.format, "LOGM");
        assert!(sim.history.iter().any(|c| c == "OUTPRAW1"));
    }

    #[test]
    fn identify_and_beep() {
        let (mut vna, sim) = analyzer(11);
        assert!(vna.identify().unwrap().contains("8753"));
        vna.beep().unwrap();
        assert_eq!(sim.lock().unwrap().beeps, 1);
    }

    #[test]
    fn names_parse() {
        assert_eq!("log magnitude".parse::<DisplayFormat>().unwrap(), DisplayFormat::LogMagnitude);
        assert_eq!("smith-chart".parse::<DisplayFormat>().unwrap(), DisplayFormat::SmithChart);
        assert_eq!("formatted data".parse::<OutputArray>().unwrap(), OutputArray::FormattedData);
        assert_eq!("raw1".parse::<OutputArray>().unwrap(), OutputArray::Raw1);
        assert!("sideways".parse::<DisplayFormat>().is_err());
    }
}
