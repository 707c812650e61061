//! # Instrument simulators
//!
//! In-process stand-ins for the fridge controller and the two network
//! analyzers. Each one keeps the internal state of the simulated hardware
//! and processes commands to modify that state, returning responses
//! identical to the real hardware. [`SimTransport`] plugs a simulator in
//! where a serial port or socket would normally go.

use crate::codec;
use crate::error::{InstrumentError, Result};
use crate::transport::Transport;
use crate::vna::linear_frequencies;
use num_complex::Complex64;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Something that answers instrument commands.
pub trait SimulatedInstrument: Send {
    /// Handle one command (terminator stripped). `None` means no reply.
    fn respond(&mut self, command: &str) -> Option<Vec<u8>>;

    /// Byte that ends a command on the wire.
    fn terminator(&self) -> u8;
}

/// A [`Transport`] wired to a simulator instead of real hardware.
///
/// The simulator is shared so tests can inspect it while a driver owns the
/// transport.
pub struct SimTransport<S> {
    instrument: Arc<Mutex<S>>,
    inbox: Vec<u8>,
    outbox: VecDeque<u8>,
    name: String,
}

impl<S: SimulatedInstrument> SimTransport<S> {
    pub fn new(instrument: S) -> Self {
        Self::shared(Arc::new(Mutex::new(instrument)))
    }

    /// Use a simulator that is also held elsewhere.
    pub fn shared(instrument: Arc<Mutex<S>>) -> Self {
        Self {
            instrument,
            inbox: Vec::new(),
            outbox: VecDeque::new(),
            name: String::from("simulator"),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn timeout(&self) -> InstrumentError {
        InstrumentError::Timeout {
            waited: Duration::ZERO,
        }
    }
}

impl<S: SimulatedInstrument> Transport for SimTransport<S> {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let mut sim = self.instrument.lock().unwrap_or_else(PoisonError::into_inner);
        let terminator = sim.terminator();
        for &b in bytes {
            if b == terminator {
                let command = String::from_utf8_lossy(&self.inbox).trim().to_string();
                self.inbox.clear();
                if command.is_empty() {
                    continue;
                }
                if let Some(reply) = sim.respond(&command) {
                    self.outbox.extend(reply);
                }
            } else {
                self.inbox.push(b);
            }
        }
        Ok(())
    }

    fn read_until(&mut self, terminator: u8) -> Result<Vec<u8>> {
        let pos = self
            .outbox
            .iter()
            .position(|&b| b == terminator)
            .ok_or_else(|| self.timeout())?;
        let mut line: Vec<u8> = self.outbox.drain(..=pos).collect();
        line.pop();
        Ok(line)
    }

    fn read_exact_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        if self.outbox.len() < len {
            return Err(self.timeout());
        }
        Ok(self.outbox.drain(..len).collect())
    }

    fn clear(&mut self) -> Result<()> {
        self.outbox.clear();
        Ok(())
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

// --- Fridge controller ---

/// Number of sensor channels the controller reports.
pub const FRIDGE_SENSORS: usize = 32;

/// Simulated dilution-refrigerator controller.
///
/// Temperatures are held in 0.1 mK counts like the hardware reports them.
/// The mixing chamber moves towards the setpoint by `relaxation` of the
/// remaining distance every time it is read.
#[derive(Debug, Clone)]
pub struct FridgeSimulator {
    /// ISOBUS address, when the controller sits on a shared bus.
    pub isobus_address: Option<u8>,
    /// Raw sensor table indexed by channel.
    pub sensors: [f64; FRIDGE_SENSORS],
    pub setpoint: f64,
    pub power_range: u8,
    pub control_mode: u8,
    pub remote: u8,
    pub relaxation: f64,
    /// Channels that follow the setpoint.
    pub mixing_chamber_channels: Vec<usize>,
    /// Number of upcoming `R` queries to answer with a garbled reply.
    pub garbled_replies: u32,
}

impl FridgeSimulator {
    /// Creates a controller sitting at 100 mK with healthy pressures.
    pub fn new() -> Self {
        let mut sensors = [0.0; FRIDGE_SENSORS];
        sensors[2] = 1000.0;
        sensors[3] = 1000.0;
        sensors[14] = 1200.0;
        sensors[15] = 5000.0;
        Self {
            isobus_address: None,
            sensors,
            setpoint: 1000.0,
            power_range: 0,
            control_mode: 0,
            remote: 0,
            relaxation: 0.5,
            mixing_chamber_channels: vec![2, 3],
            garbled_replies: 0,
        }
    }

    pub fn with_isobus_address(mut self, address: u8) -> Self {
        self.isobus_address = Some(address);
        self
    }

    /// Places the mixing chamber at `counts` (0.1 mK) immediately.
    pub fn set_mixing_chamber(&mut self, counts: f64) {
        for &ch in &self.mixing_chamber_channels {
            self.sensors[ch] = counts;
        }
    }

    fn relax(&mut self, channel: usize) {
        if !self.mixing_chamber_channels.contains(&channel) {
            return;
        }
        let current = self.sensors[channel];
        let mut next = current + (self.setpoint - current) * self.relaxation;
        if (self.setpoint - next).abs() < 1.0 {
            next = self.setpoint;
        }
        for &ch in &self.mixing_chamber_channels {
            self.sensors[ch] = next;
        }
    }

    fn status(&self) -> String {
        format!(
            "X0A{}C{}P{:08}S0H{}",
            self.control_mode,
            self.remote,
            self.setpoint as u32,
            self.power_range
        )
    }

    /// Processes one command and returns the reply, if the hardware would send one.
    pub fn process_command(&mut self, command: &str) -> Option<String> {
        let content = command.trim();

        // On ISOBUS the '$' comes before the '@n' address.
        let (silent, mut content) = match content.strip_prefix('$') {
            Some(rest) => (true, rest),
            None => (false, content),
        };

        if let Some(rest) = content.strip_prefix('@') {
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            let address: u8 = digits.parse().ok()?;
            if Some(address) != self.isobus_address {
                return None; // Silently ignore
            }
            content = &rest[digits.len()..];
        } else if self.isobus_address.is_some() {
            return None;
        }

        let reply = self.execute_command(content);
        if silent {
            None
        } else {
            Some(reply)
        }
    }

    /// Executes a command and returns the response string.
    fn execute_command(&mut self, content: &str) -> String {
        let unknown = || format!("?{content}");
        let mut chars = content.chars();
        let Some(letter) = chars.next() else {
            return unknown();
        };
        let arg = chars.as_str();

        match letter {
            'R' => {
                let Ok(channel) = arg.parse::<usize>() else {
                    return unknown();
                };
                if channel >= FRIDGE_SENSORS {
                    return unknown();
                }
                if self.garbled_replies > 0 {
                    self.garbled_replies -= 1;
                    return format!("?R{channel}");
                }
                self.relax(channel);
                let value = self.sensors[channel].round();
                let sign = if value < 0.0 { '-' } else { '+' };
                format!("R{}{:05}", sign, value.abs() as u64)
            }
            'X' if arg.is_empty() => self.status(),
            'T' => match arg.parse::<u32>() {
                Ok(counts) if arg.len() == 5 => {
                    self.setpoint = counts as f64;
                    String::from("T")
                }
                _ => unknown(),
            },
            'E' => match arg.parse::<u8>() {
                Ok(range) if (1..=5).contains(&range) => {
                    self.power_range = range;
                    String::from("E")
                }
                _ => unknown(),
            },
            'A' => match arg.parse::<u8>() {
                Ok(mode) if mode <= 3 => {
                    self.control_mode = mode;
                    String::from("A")
                }
                _ => unknown(),
            },
            'C' => match arg.parse::<u8>() {
                Ok(mode) if mode <= 3 => {
                    self.remote = mode;
                    String::from("C")
                }
                _ => unknown(),
            },
            _ => unknown(),
        }
    }
}

impl Default for FridgeSimulator {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedInstrument for FridgeSimulator {
    fn respond(&mut self, command: &str) -> Option<Vec<u8>> {
        self.process_command(command).map(|mut reply| {
            reply.push('\r');
            reply.into_bytes()
        })
    }

    fn terminator(&self) -> u8 {
        b'\r'
    }
}

// --- Network analyzers ---

/// Transmission through a notch-type resonator at `f0`.
pub fn resonator_s21(frequency: f64, f0: f64) -> Complex64 {
    const Q_LOADED: f64 = 2.0e4;
    const Q_COUPLING: f64 = 4.0e4;
    let detuning = Complex64::new(0.0, 2.0 * Q_LOADED * (frequency - f0) / f0);
    let dip = Complex64::new(Q_LOADED / Q_COUPLING, 0.0) / (Complex64::new(1.0, 0.0) + detuning);
    Complex64::new(0.1, 0.0) * (Complex64::new(1.0, 0.0) - dip)
}

/// Parses `1.5 GHZ`, `300 MHZ`, `10e6` into Hz.
fn parse_frequency(arg: &str) -> Option<f64> {
    let arg = arg.trim().to_ascii_uppercase();
    let (number, scale) = if let Some(n) = arg.strip_suffix("GHZ") {
        (n, 1e9)
    } else if let Some(n) = arg.strip_suffix("MHZ") {
        (n, 1e6)
    } else if let Some(n) = arg.strip_suffix("KHZ") {
        (n, 1e3)
    } else if let Some(n) = arg.strip_suffix("HZ") {
        (n, 1.0)
    } else {
        (arg.as_str(), 1.0)
    };
    number.trim().parse::<f64>().ok().map(|v| v * scale)
}

/// Display formats of the legacy analyzer, by mnemonic.
const HP8753_FORMATS: [&str; 9] = [
    "POLA", "LOGM", "PHAS", "DELA", "SMIC", "LINM", "SWR", "REAL", "IMAG",
];

/// Simulated HP 8753-family analyzer answering over GPIB.
#[derive(Debug, Clone)]
pub struct Hp8753Simulator {
    pub points: usize,
    pub start_hz: f64,
    pub stop_hz: f64,
    pub format: String,
    pub binary: bool,
    pub continuous: bool,
    pub beeps: u32,
    /// Every mnemonic received, in order.
    pub history: Vec<String>,
}

impl Hp8753Simulator {
    pub fn new() -> Self {
        Self {
            points: 201,
            start_hz: 4.0e9,
            stop_hz: 6.0e9,
            format: String::from("LOGM"),
            binary: false,
            continuous: true,
            beeps: 0,
            history: Vec::new(),
        }
    }

    fn trace(&self) -> Vec<Complex64> {
        let f0 = 0.5 * (self.start_hz + self.stop_hz);
        linear_frequencies(self.start_hz, self.stop_hz, self.points)
            .into_iter()
            .map(|f| resonator_s21(f, f0))
            .collect()
    }

    fn formatted(&self) -> (Vec<f64>, Vec<f64>) {
        let trace = self.trace();
        let first = |f: fn(&Complex64) -> f64| trace.iter().map(f).collect::<Vec<_>>();
        let zeros = vec![0.0; trace.len()];
        match self.format.as_str() {
            "LOGM" => (first(|s| 20.0 * s.norm().log10()), zeros),
            "PHAS" => (first(|s| s.arg().to_degrees()), zeros),
            "LINM" => (first(|s| s.norm()), zeros),
            "REAL" => (first(|s| s.re), zeros),
            "IMAG" => (first(|s| s.im), zeros),
            "SWR" => (first(|s| (1.0 + s.norm()) / (1.0 - s.norm())), zeros),
            "DELA" => (zeros.clone(), zeros),
            _ => (first(|s| s.re), first(|s| s.im)),
        }
    }

    fn output(&self, formatted: bool) -> Vec<u8> {
        let (re, im) = if formatted {
            self.formatted()
        } else {
            let trace = self.trace();
            (
                trace.iter().map(|s| s.re).collect(),
                trace.iter().map(|s| s.im).collect(),
            )
        };
        if self.binary {
            codec::encode_form2(&re, &im).unwrap_or_default()
        } else {
            let mut text = re
                .iter()
                .zip(&im)
                .map(|(a, b)| format!("{a:+.6E},{b:+.6E}"))
                .collect::<Vec<_>>()
                .join("\n");
            text.push('\n');
            text.into_bytes()
        }
    }

    /// Processes one mnemonic and returns the bytes the analyzer would send.
    pub fn process_command(&mut self, command: &str) -> Option<Vec<u8>> {
        let command = command.trim().to_ascii_uppercase();
        if command.is_empty() {
            return None;
        }
        self.history.push(command.clone());
        let (mnemonic, arg) = match command.split_once(' ') {
            Some((m, a)) => (m, a.trim()),
            None => (command.as_str(), ""),
        };

        match mnemonic {
            "FORM2" => self.binary = true,
            "FORM4" => self.binary = false,
            "POIN" => {
                if let Ok(points) = arg.parse::<f64>() {
                    self.points = points.round().clamp(3.0, 1601.0) as usize;
                }
            }
            "STAR" => {
                if let Some(f) = parse_frequency(arg) {
                    self.start_hz = f;
                }
            }
            "STOP" => {
                if let Some(f) = parse_frequency(arg) {
                    self.stop_hz = f;
                }
            }
            "CONT" => self.continuous = true,
            "SING" | "HOLD" => self.continuous = false,
            "EMIB" => self.beeps += 1,
            "OUTPIDEN" => return Some(b"HEWLETT PACKARD,8753ES,0,7.74\n".to_vec()),
            "OUTPPOIN" => return Some(format!("{}\n", self.points).into_bytes()),
            "OUTPFORM" => return Some(self.output(true)),
            "OUTPDATA" | "OUTPMEMO" | "OUTPRAW1" | "OUTPRAW2" | "OUTPRAW3" | "OUTPRAW4" => {
                return Some(self.output(false))
            }
            m if HP8753_FORMATS.contains(&m) => self.format = m.to_string(),
            _ => {}
        }
        None
    }
}

impl Default for Hp8753Simulator {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedInstrument for Hp8753Simulator {
    fn respond(&mut self, command: &str) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        for part in command.split(';') {
            if let Some(reply) = self.process_command(part) {
                out.extend(reply);
            }
        }
        (!out.is_empty()).then_some(out)
    }

    fn terminator(&self) -> u8 {
        b'\n'
    }
}

/// Simulated SCPI network analyzer reached over LAN.
#[derive(Debug, Clone)]
pub struct ScpiVnaSimulator {
    pub idn: String,
    pub mode: String,
    pub start_hz: f64,
    pub stop_hz: f64,
    pub points: usize,
    pub power_dbm: f64,
    pub averages: u32,
    pub format: String,
    pub continuous: bool,
    pub sweeps_since_clear: u32,
    pub autoscales: u32,
    /// Every SCPI command received, in order.
    pub history: Vec<String>,
}

impl ScpiVnaSimulator {
    pub fn new() -> Self {
        Self {
            idn: String::from("Keysight Technologies,N9914A,SIM00001,A.12.34"),
            mode: String::from("NA"),
            start_hz: 1.0e9,
            stop_hz: 2.0e9,
            points: 201,
            power_dbm: -15.0,
            averages: 1,
            format: String::from("MLOG"),
            continuous: true,
            sweeps_since_clear: 0,
            autoscales: 0,
            history: Vec::new(),
        }
    }

    fn frequencies(&self) -> Vec<f64> {
        linear_frequencies(self.start_hz, self.stop_hz, self.points)
    }

    fn formatted_data(&self) -> Vec<f64> {
        let f0 = 0.5 * (self.start_hz + self.stop_hz);
        self.frequencies()
            .into_iter()
            .map(|f| {
                let s = resonator_s21(f, f0);
                match self.format.as_str() {
                    "REAL" => s.re,
                    "IMAG" => s.im,
                    "MLIN" => s.norm(),
                    "PHAS" => s.arg().to_degrees(),
                    _ => 20.0 * s.norm().log10(),
                }
            })
            .collect()
    }

    fn join(values: &[f64]) -> String {
        values
            .iter()
            .map(|v| format!("{v:+.9E}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Handles one SCPI command (no `;`) and returns its reply, if any.
    pub fn process_command(&mut self, command: &str) -> Option<String> {
        let command = command.trim();
        if command.is_empty() {
            return None;
        }
        self.history.push(command.to_string());
        let (header, arg) = match command.split_once(' ') {
            Some((h, a)) => (h.to_ascii_uppercase(), a.trim()),
            None => (command.to_ascii_uppercase(), ""),
        };
        let header = header.trim_start_matches(':');

        match header {
            "*IDN?" => return Some(self.idn.clone()),
            "*OPC?" => return Some(String::from("1")),
            "*RST" => {
                let history = std::mem::take(&mut self.history);
                *self = Self::new();
                self.history = history;
            }
            "INST:SEL" => self.mode = arg.trim_matches('"').to_string(),
            "FREQ:START" => {
                if let Some(f) = parse_frequency(arg) {
                    self.start_hz = f;
                }
            }
            "FREQ:STOP" => {
                if let Some(f) = parse_frequency(arg) {
                    self.stop_hz = f;
                }
            }
            "SWE:POIN" => {
                if let Ok(n) = arg.parse::<usize>() {
                    self.points = n.clamp(2, 10001);
                }
            }
            "SOUR:POW" => {
                if let Ok(p) = arg.parse::<f64>() {
                    self.power_dbm = p;
                }
            }
            "AVER:COUN" => {
                if let Ok(n) = arg.parse::<u32>() {
                    self.averages = n.clamp(1, 100);
                }
            }
            "AVER:COUN?" => return Some(self.averages.to_string()),
            "AVER:CLE" => self.sweeps_since_clear = 0,
            "INIT:CONT" => self.continuous = matches!(arg, "1" | "ON"),
            "INIT:IMM" | "INIT" => self.sweeps_since_clear += 1,
            "CALC:FORM" | "CALC:FORMAT" => self.format = arg.to_ascii_uppercase(),
            "CALC:PAR1:SEL" => {}
            "DISP:WIND:TRAC1:Y:AUTO" => self.autoscales += 1,
            "CALC:DATA:FDAT?" => return Some(Self::join(&self.formatted_data())),
            "FREQ:DATA?" => return Some(Self::join(&self.frequencies())),
            _ => return Some(String::from("-113,\"Undefined header\"")).filter(|_| header.ends_with('?')),
        }
        None
    }
}

impl Default for ScpiVnaSimulator {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedInstrument for ScpiVnaSimulator {
    fn respond(&mut self, command: &str) -> Option<Vec<u8>> {
        let replies: Vec<String> = command
            .split(';')
            .filter_map(|part| self.process_command(part))
            .collect();
        if replies.is_empty() {
            return None;
        }
        let mut reply = replies.join(";");
        reply.push('\n');
        Some(reply.into_bytes())
    }

    fn terminator(&self) -> u8 {
        b'\n'
    }
}
