//! SCPI network analyzer reached over a LAN socket.

use super::Analyzer;
use crate::codec;
use crate::error::{InstrumentError, Result};
use crate::spectrum::IqSpectrum;
use crate::transport::{MessageLink, Transport};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const MIN_POWER_DBM: f64 = -45.0;
const MAX_POWER_DBM: f64 = 3.0;
const MAX_POINTS: f64 = 10_001.0;
const MAX_AVERAGES: f64 = 100.0;

/// Application the analyzer runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentMode {
    /// Network analyzer.
    Na,
    /// Spectrum analyzer.
    Sa,
}

impl InstrumentMode {
    fn name(self) -> &'static str {
        match self {
            Self::Na => "NA",
            Self::Sa => "SA",
        }
    }
}

/// Trace format selected with `CALC:FORM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceFormat {
    Mlog,
    Mlin,
    Phas,
    Real,
    Imag,
}

impl TraceFormat {
    fn name(self) -> &'static str {
        match self {
            Self::Mlog => "MLOG",
            Self::Mlin => "MLIN",
            Self::Phas => "PHAS",
            Self::Real => "REAL",
            Self::Imag => "IMAG",
        }
    }
}

/// Everything a single scan needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    pub start_hz: f64,
    pub stop_hz: f64,
    pub power_dbm: f64,
    pub points: u32,
    pub averages: u32,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            start_hz: 4.0e9,
            stop_hz: 8.0e9,
            power_dbm: -20.0,
            points: 1601,
            averages: 1,
        }
    }
}

/// SCPI network analyzer, usually on a LAN socket.
pub struct ScpiVna<T> {
    link: MessageLink<T>,
    scan: ScanSettings,
}

impl<T: Transport> ScpiVna<T> {
    pub fn new(transport: T) -> Self {
        Self {
            link: MessageLink::new(transport, "\n", b'\n'),
            scan: ScanSettings::default(),
        }
    }

    /// Settings used by [`Analyzer::acquire`].
    pub fn with_scan(mut self, scan: ScanSettings) -> Self {
        self.scan = scan;
        self
    }

    pub fn query(&mut self, command: &str) -> Result<String> {
        self.link.query(command)
    }

    /// Sends `command` and blocks until the analyzer reports it complete.
    pub fn command(&mut self, command: &str) -> Result<()> {
        let full = format!("{command};*OPC?");
        let reply = self.link.query(&full)?;
        if reply.trim() != "1" {
            return Err(InstrumentError::invalid_reply(full, reply));
        }
        Ok(())
    }

    pub fn reset(&mut self) -> Result<()> {
        self.link.write("*RST")?;
        self.wait_complete()
    }

    fn wait_complete(&mut self) -> Result<()> {
        let reply = self.link.query("*OPC?")?;
        if reply.trim() != "1" {
            return Err(InstrumentError::invalid_reply("*OPC?", reply));
        }
        Ok(())
    }

    pub fn set_mode(&mut self, mode: InstrumentMode) -> Result<()> {
        self.command(&format!("INST:SEL \"{}\"", mode.name()))
    }

    pub fn set_start_frequency(&mut self, hz: f64) -> Result<()> {
        self.command(&format!("FREQ:START {hz}"))
    }

    pub fn set_stop_frequency(&mut self, hz: f64) -> Result<()> {
        self.command(&format!("FREQ:STOP {hz}"))
    }

    pub fn set_frequency_range(&mut self, start_hz: f64, stop_hz: f64) -> Result<()> {
        if !(start_hz.is_finite() && stop_hz.is_finite() && 0.0 < start_hz && start_hz < stop_hz) {
            return Err(InstrumentError::OutOfRange {
                what: "frequency range",
                value: start_hz,
            });
        }
        self.set_start_frequency(start_hz)?;
        self.set_stop_frequency(stop_hz)
    }

    /// Source power, clamped to the analyzer's range and rounded to 0.1 dB.
    /// Returns what was sent.
    pub fn set_power(&mut self, dbm: f64) -> Result<f64> {
        if !dbm.is_finite() {
            return Err(InstrumentError::OutOfRange {
                what: "source power",
                value: dbm,
            });
        }
        let power = (dbm.clamp(MIN_POWER_DBM, MAX_POWER_DBM) * 10.0).round() / 10.0;
        self.command(&format!("SOUR:POW {power:.1}"))?;
        Ok(power)
    }

    /// Points per sweep, rounded to at least 1 and at most `MAX_POINTS`.
    /// Returns what was sent.
    pub fn set_sweep_points(&mut self, points: f64) -> Result<u32> {
        let points = whole_count(points, MAX_POINTS, "sweep points")?;
        self.command(&format!("SWE:POIN {points}"))?;
        Ok(points)
    }

    /// Averaging factor, rounded to at least 1 and at most `MAX_AVERAGES`.
    /// Returns what was sent.
    pub fn set_average(&mut self, averages: f64) -> Result<u32> {
        let averages = whole_count(averages, MAX_AVERAGES, "averages")?;
        self.command(&format!("AVER:COUN {averages}"))?;
        Ok(averages)
    }

    pub fn average(&mut self) -> Result<u32> {
        let reply = self.link.query("AVER:COUN?")?;
        codec::parse_count("AVER:COUN?", &reply)
    }

    pub fn autoscale(&mut self) -> Result<()> {
        self.command("CALC:PAR1:SEL")?;
        self.command("DISP:WIND:TRAC1:Y:AUTO")
    }

    pub fn set_format(&mut self, format: TraceFormat) -> Result<()> {
        self.command(&format!("CALC:FORM {}", format.name()))
    }

    pub fn set_log_scale(&mut self) -> Result<()> {
        self.set_format(TraceFormat::Mlog)
    }

    pub fn set_lin_scale(&mut self) -> Result<()> {
        self.set_format(TraceFormat::Mlin)
    }

    /// Clears the average and triggers as many sweeps as it needs.
    pub fn make_sweeps(&mut self) -> Result<u32> {
        self.command("AVER:CLE")?;
        self.command("INIT:CONT 0")?;
        let count = self.average()?;
        for _ in 0..count {
            self.command("INIT:IMM")?;
        }
        debug!("{} sweeps done", count);
        Ok(count)
    }

    /// Frequencies and values of the active trace.
    pub fn read_trace(&mut self) -> Result<(Vec<f64>, Vec<f64>)> {
        let data = self.link.query("CALC:DATA:FDAT?")?;
        let data = codec::parse_float_list("CALC:DATA:FDAT?", &data)?;
        let frequencies = self.link.query("FREQ:DATA?")?;
        let frequencies = codec::parse_float_list("FREQ:DATA?", &frequencies)?;
        self.wait_complete()?;
        if frequencies.len() != data.len() {
            return Err(InstrumentError::BlockLength {
                expected: frequencies.len(),
                actual: data.len(),
            });
        }
        Ok((frequencies, data))
    }

    /// Real and imaginary traces of the last sweep. The display is left in
    /// log magnitude.
    pub fn read_iq(&mut self) -> Result<IqSpectrum> {
        self.set_format(TraceFormat::Real)?;
        self.autoscale()?;
        let (frequencies, i) = self.read_trace()?;
        self.set_format(TraceFormat::Imag)?;
        self.autoscale()?;
        let (_, q) = self.read_trace()?;
        self.set_log_scale()?;
        self.autoscale()?;
        IqSpectrum::new(frequencies, i, q)
    }

    /// Configure, sweep and read one spectrum, then hand the front panel
    /// back in continuous mode without averaging.
    pub fn single_scan(&mut self, scan: &ScanSettings) -> Result<IqSpectrum> {
        info!(
            "scan {} to {} Hz, {} points at {} dBm",
            scan.start_hz, scan.stop_hz, scan.points, scan.power_dbm
        );
        self.set_mode(InstrumentMode::Na)?;
        self.set_frequency_range(scan.start_hz, scan.stop_hz)?;
        self.set_power(scan.power_dbm)?;
        self.set_sweep_points(f64::from(scan.points))?;
        self.set_average(f64::from(scan.averages))?;
        self.autoscale()?;
        let result = self.make_sweeps().and_then(|_| self.read_iq());
        self.command("INIT:CONT 1")?;
        self.set_average(1.0)?;
        result
    }

    pub fn into_transport(self) -> T {
        self.link.into_inner()
    }
}

/// Rounds `|value|` into `1..=max`. Zero is raised to one.
fn whole_count(value: f64, max: f64, what: &'static str) -> Result<u32> {
    if !value.is_finite() {
        return Err(InstrumentError::OutOfRange { what, value });
    }
    Ok(value.abs().round().clamp(1.0, max) as u32)
}

impl<T: Transport> Analyzer for ScpiVna<T> {
    fn identify(&mut self) -> Result<String> {
        self.link.query("*IDN?")
    }

    fn acquire(&mut self) -> Result<IqSpectrum> {
        let scan = self.scan.clone();
        self.single_scan(&scan)
    }
}
