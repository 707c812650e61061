//! Blocking byte links to instruments.
//!
//! A [`Transport`] moves raw bytes. [`MessageLink`] layers command and reply
//! framing on top: it appends the write terminator, splits replies on the
//! read terminator and logs the traffic.

use crate::error::{InstrumentError, Result};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// A bidirectional byte link to a single instrument.
pub trait Transport: Send {
    /// Write every byte of `bytes`.
    fn write_all(&mut self, bytes: &[u8]) -> Result<()>;

    /// Read up to and including `terminator`. The terminator is not returned.
    fn read_until(&mut self, terminator: u8) -> Result<Vec<u8>>;

    /// Read exactly `len` bytes.
    fn read_exact_bytes(&mut self, len: usize) -> Result<Vec<u8>>;

    /// Drop any input received but not consumed yet.
    fn clear(&mut self) -> Result<()>;

    /// Human readable name of the link, for logs.
    fn describe(&self) -> String;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        (**self).write_all(bytes)
    }

    fn read_until(&mut self, terminator: u8) -> Result<Vec<u8>> {
        (**self).read_until(terminator)
    }

    fn read_exact_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        (**self).read_exact_bytes(len)
    }

    fn clear(&mut self) -> Result<()> {
        (**self).clear()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Parity setting of a serial line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        }
    }
}

/// Serial line settings.
///
/// The defaults match the fridge controller: 9600 baud, 8N2.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
    pub timeout_ms: u64,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 2,
            timeout_ms: 1000,
        }
    }
}

impl SerialSettings {
    fn data_bits(&self) -> Result<serialport::DataBits> {
        match self.data_bits {
            5 => Ok(serialport::DataBits::Five),
            6 => Ok(serialport::DataBits::Six),
            7 => Ok(serialport::DataBits::Seven),
            8 => Ok(serialport::DataBits::Eight),
            n => Err(InstrumentError::OutOfRange {
                what: "data bits",
                value: n as f64,
            }),
        }
    }

    fn stop_bits(&self) -> Result<serialport::StopBits> {
        match self.stop_bits {
            1 => Ok(serialport::StopBits::One),
            2 => Ok(serialport::StopBits::Two),
            n => Err(InstrumentError::OutOfRange {
                what: "stop bits",
                value: n as f64,
            }),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Socket timeouts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpSettings {
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
}

impl Default for TcpSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            read_timeout_ms: 10_000,
            write_timeout_ms: 5_000,
        }
    }
}

/// A transport over anything that implements `Read + Write`.
///
/// Bytes read past a terminator are kept for the next read.
pub struct StreamTransport<S> {
    stream: S,
    name: String,
    timeout: Duration,
    pending: Vec<u8>,
}

/// Serial port transport.
pub type SerialTransport = StreamTransport<Box<dyn serialport::SerialPort>>;

/// Raw socket transport.
pub type TcpTransport = StreamTransport<TcpStream>;

impl<S: Read + Write + Send> StreamTransport<S> {
    /// Wrap an already opened stream.
    pub fn new(stream: S, name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            stream,
            name: name.into(),
            timeout,
            pending: Vec::new(),
        }
    }

    fn fill(&mut self) -> Result<()> {
        let mut buf = [0u8; 512];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("{} closed the connection", self.name),
                    )
                    .into())
                }
                Ok(n) => {
                    trace!("{}: read {} bytes", self.name, n);
                    self.pending.extend_from_slice(&buf[..n]);
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
                    ) =>
                {
                    return Err(InstrumentError::Timeout {
                        waited: self.timeout,
                    })
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl<S: Read + Write + Send> Transport for StreamTransport<S> {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes)?;
        self.stream.flush()?;
        Ok(())
    }

    fn read_until(&mut self, terminator: u8) -> Result<Vec<u8>> {
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == terminator) {
                let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
                line.pop();
                return Ok(line);
            }
            self.fill()?;
        }
    }

    fn read_exact_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        while self.pending.len() < len {
            self.fill()?;
        }
        Ok(self.pending.drain(..len).collect())
    }

    fn clear(&mut self) -> Result<()> {
        if !self.pending.is_empty() {
            debug!("{}: discarding {} stale bytes", self.name, self.pending.len());
        }
        self.pending.clear();
        Ok(())
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

/// Open a serial port.
pub fn open_serial(port: &str, settings: &SerialSettings) -> Result<SerialTransport> {
    debug!("Opening serial port {port} at {} baud", settings.baud_rate);
    let stream = serialport::new(port, settings.baud_rate)
        .data_bits(settings.data_bits()?)
        .parity(settings.parity.into())
        .stop_bits(settings.stop_bits()?)
        .timeout(settings.timeout())
        .open()?;
    Ok(StreamTransport::new(stream, port, settings.timeout()))
}

/// Connect a raw socket.
pub fn connect_tcp(host: &str, port: u16, settings: &TcpSettings) -> Result<TcpTransport> {
    let name = format!("{host}:{port}");
    let addr = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| InstrumentError::InvalidResource(name.clone()))?;

    debug!("Connecting to {name}");
    let stream = TcpStream::connect_timeout(&addr, Duration::from_millis(settings.connect_timeout_ms))
        .map_err(|e| {
            warn!("Failed to connect to {name}: {e}");
            if e.kind() == io::ErrorKind::TimedOut {
                InstrumentError::Timeout {
                    waited: Duration::from_millis(settings.connect_timeout_ms),
                }
            } else {
                InstrumentError::Io(e)
            }
        })?;
    stream.set_read_timeout(Some(Duration::from_millis(settings.read_timeout_ms)))?;
    stream.set_write_timeout(Some(Duration::from_millis(settings.write_timeout_ms)))?;
    stream.set_nodelay(true)?;

    Ok(StreamTransport::new(
        stream,
        name,
        Duration::from_millis(settings.read_timeout_ms),
    ))
}

const PROLOGIX_ESC: u8 = 27;

/// GPIB device reached through a Prologix-style bus controller.
///
/// The controller runs in controller mode with auto read-after-write off and
/// no terminator of its own, so the bytes written here reach the device as
/// they are. Data bytes the controller would interpret are escaped.
pub struct GpibTransport<L> {
    link: L,
    address: u8,
}

impl<L: Transport> GpibTransport<L> {
    /// Configure the controller on `link` to talk to the device at `address`.
    pub fn open(mut link: L, address: u8) -> Result<Self> {
        if address > 30 {
            return Err(InstrumentError::OutOfRange {
                what: "GPIB primary address",
                value: address as f64,
            });
        }
        for setup in ["++mode 1", "++auto 0", "++eos 3", "++eoi 1"] {
            link.write_all(format!("{setup}\n").as_bytes())?;
        }
        link.write_all(format!("++addr {address}\n").as_bytes())?;
        debug!("GPIB device {address} selected on {}", link.describe());
        Ok(Self { link, address })
    }

    /// Primary address of the device.
    pub fn address(&self) -> u8 {
        self.address
    }

    fn request_read(&mut self) -> Result<()> {
        self.link.write_all(b"++read eoi\n")
    }
}

impl<L: Transport> Transport for GpibTransport<L> {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let mut framed = Vec::with_capacity(bytes.len() + 8);
        for &b in bytes {
            if matches!(b, b'\r' | b'\n' | b'+' | PROLOGIX_ESC) {
                framed.push(PROLOGIX_ESC);
            }
            framed.push(b);
        }
        framed.push(b'\n');
        self.link.write_all(&framed)
    }

    fn read_until(&mut self, terminator: u8) -> Result<Vec<u8>> {
        self.request_read()?;
        self.link.read_until(terminator)
    }

    fn read_exact_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        self.request_read()?;
        self.link.read_exact_bytes(len)
    }

    fn clear(&mut self) -> Result<()> {
        self.link.clear()
    }

    fn describe(&self) -> String {
        format!("GPIB::{} via {}", self.address, self.link.describe())
    }
}

/// Command/reply framing over a [`Transport`].
pub struct MessageLink<T> {
    transport: T,
    write_terminator: Vec<u8>,
    read_terminator: u8,
}

impl<T: Transport> MessageLink<T> {
    /// Frame messages with the given terminators.
    pub fn new(transport: T, write_terminator: &str, read_terminator: u8) -> Self {
        Self {
            transport,
            write_terminator: write_terminator.as_bytes().to_vec(),
            read_terminator,
        }
    }

    /// Send one command.
    pub fn write(&mut self, command: &str) -> Result<()> {
        debug!("{} <- {}", self.transport.describe(), command);
        let mut bytes = Vec::with_capacity(command.len() + self.write_terminator.len());
        bytes.extend_from_slice(command.as_bytes());
        bytes.extend_from_slice(&self.write_terminator);
        self.transport.write_all(&bytes)
    }

    /// Read one reply line, without terminator or trailing whitespace.
    pub fn read_line(&mut self) -> Result<String> {
        let raw = self.transport.read_until(self.read_terminator)?;
        let line = String::from_utf8_lossy(&raw).trim_end().to_string();
        debug!("{} -> {}", self.transport.describe(), line);
        Ok(line)
    }

    /// Send a command and read its reply line.
    pub fn query(&mut self, command: &str) -> Result<String> {
        self.write(command)?;
        self.read_line()
    }

    /// Read a binary block of exactly `len` bytes.
    pub fn read_block(&mut self, len: usize) -> Result<Vec<u8>> {
        let block = self.transport.read_exact_bytes(len)?;
        debug!("{} -> {} byte block", self.transport.describe(), block.len());
        Ok(block)
    }

    /// Drop unread input.
    pub fn clear(&mut self) -> Result<()> {
        self.transport.clear()
    }

    pub fn describe(&self) -> String {
        self.transport.describe()
    }

    pub fn into_inner(self) -> T {
        self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// In-memory stream: reads come from `input`, writes land in `output`.
    struct Loopback {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Loopback {
        fn new(input: &[u8]) -> Self {
            Self {
                input: Cursor::new(input.to_vec()),
                output: Vec::new(),
            }
        }
    }

    impl Read for Loopback {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.input.read(buf)?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
            }
            Ok(n)
        }
    }

    impl Write for Loopback {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn stream(input: &[u8]) -> StreamTransport<Loopback> {
        StreamTransport::new(Loopback::new(input), "loopback", Duration::from_millis(10))
    }

    #[test]
    fn read_until_keeps_leftover_bytes() {
        let mut t = stream(b"R+00100\rR+00200\r");
        assert_eq!(t.read_until(b'\r').unwrap(), b"R+00100");
        assert_eq!(t.read_until(b'\r').unwrap(), b"R+00200");
    }

    #[test]
    fn read_until_times_out_without_terminator() {
        let mut t = stream(b"partial");
        let err = t.read_until(b'\n').unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn read_exact_uses_pending_first() {
        let mut t = stream(b"line\n#A\x00\x08abcdefgh");
        assert_eq!(t.read_until(b'\n').unwrap(), b"line");
        let block = t.read_exact_bytes(12).unwrap();
        assert_eq!(&block[..2], b"#A");
        assert_eq!(&block[4..], b"abcdefgh");
    }

    #[test]
    fn clear_discards_pending() {
        let mut t = stream(b"a\nb\n");
        t.read_until(b'\n').unwrap();
        t.clear().unwrap();
        assert!(t.read_until(b'\n').unwrap_err().is_timeout());
    }

    #[test]
    fn message_link_frames_commands() {
        let mut link = MessageLink::new(stream(b"HEWLETT PACKARD,8753ES\r\n"), "\n", b'\n');
        let reply = link.query("*IDN?").unwrap();
        assert_eq!(reply, "HEWLETT PACKARD,8753ES");
        let inner = link.into_inner();
        assert_eq!(inner.stream.output, b"*IDN?\n");
    }

    #[test]
    fn gpib_setup_and_escaping() {
        let gpib = GpibTransport::open(stream(b"+1.0\n"), 16).unwrap();
        let mut link = MessageLink::new(gpib, "\n", b'\n');
        link.write("STAR 1 GHZ;").unwrap();
        assert_eq!(link.read_line().unwrap(), "+1.0");

        let written = String::from_utf8(link.into_inner().link.stream.output).unwrap();
        assert!(written.starts_with("++mode 1\n++auto 0\n++eos 3\n++eoi 1\n++addr 16\n"));
        assert!(written.contains("STAR 1 GHZ;\u{1b}\n\n"));
        assert!(written.ends_with("++read eoi\n"));
    }

    #[test]
    fn gpib_escapes_plus_sign() {
        let mut gpib = GpibTransport::open(stream(b""), 3).unwrap();
        gpib.write_all(b"+1").unwrap();
        let written = gpib.link.stream.output;
        assert!(written.ends_with(&[PROLOGIX_ESC, b'+', b'1', b'\n']));
    }

    #[test]
    fn gpib_rejects_bad_address() {
        assert!(GpibTransport::open(stream(b""), 31).is_err());
    }

    #[test]
    fn serial_defaults_match_controller() {
        let s = SerialSettings::default();
        assert_eq!(s.baud_rate, 9600);
        assert_eq!(s.stop_bits().unwrap(), serialport::StopBits::Two);
        assert_eq!(s.data_bits().unwrap(), serialport::DataBits::Eight);
        assert!(SerialSettings { data_bits: 9, ..s }.data_bits().is_err());
    }
}
