//! VISA-style resource strings.
//!
//! Resource names are the ones lab notebooks already use
//! (`ASRL1::INSTR`, `GPIB0::16::INSTR`, `TCPIP0::10.0.0.5::inst0::INSTR`)
//! and are mapped onto the transports this crate implements.

use crate::error::{InstrumentError, Result};
use crate::transport::{self, GpibTransport, SerialSettings, TcpSettings, Transport};
use std::fmt;
use std::str::FromStr;
use tracing::info;

/// Port used for raw SCPI sockets when the resource names a LAN device.
pub const SCPI_SOCKET_PORT: u16 = 5025;

/// A parsed instrument address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    /// Serial port, by device name (`/dev/ttyS0`, `COM1`).
    Serial { port: String },
    /// GPIB device behind a bus controller.
    Gpib { board: u8, address: u8 },
    /// Raw socket.
    Socket { host: String, port: u16 },
    /// LAN instrument named by device (`inst0`, `hislip0`), reached through
    /// its raw SCPI socket.
    Lan { host: String, device: String },
}

impl Resource {
    /// Serial device name of `ASRL<n>`.
    fn serial_port_name(n: u32) -> String {
        if cfg!(windows) {
            format!("COM{n}")
        } else {
            format!("/dev/ttyS{}", n.saturating_sub(1))
        }
    }
}

fn invalid(s: &str) -> InstrumentError {
    InstrumentError::InvalidResource(s.to_string())
}

impl FromStr for Resource {
    type Err = InstrumentError;

    fn from_str(s: &str) -> Result<Self> {
        let tokens: Vec<&str> = s.trim().split("::").collect();
        let head = tokens.first().copied().unwrap_or_default();
        let upper = head.to_ascii_uppercase();

        let ends_with = |kind: &str| {
            tokens
                .last()
                .map(|t| t.eq_ignore_ascii_case(kind))
                .unwrap_or(false)
        };

        if let Some(rest) = upper.strip_prefix("ASRL") {
            if tokens.len() > 2 || (tokens.len() == 2 && !ends_with("INSTR")) {
                return Err(invalid(s));
            }
            let rest_original = &head[4..];
            let port = if rest.is_empty() {
                return Err(invalid(s));
            } else if let Ok(n) = rest.parse::<u32>() {
                Self::serial_port_name(n)
            } else {
                rest_original.to_string()
            };
            return Ok(Resource::Serial { port });
        }

        if let Some(rest) = upper.strip_prefix("GPIB") {
            let board = if rest.is_empty() {
                0
            } else {
                rest.parse::<u8>().map_err(|_| invalid(s))?
            };
            if !(tokens.len() == 3 && ends_with("INSTR")) && tokens.len() != 2 {
                return Err(invalid(s));
            }
            let address: u8 = tokens[1].parse().map_err(|_| invalid(s))?;
            if address > 30 {
                return Err(invalid(s));
            }
            return Ok(Resource::Gpib { board, address });
        }

        if let Some(rest) = upper.strip_prefix("TCPIP") {
            if !rest.is_empty() && rest.parse::<u8>().is_err() {
                return Err(invalid(s));
            }
            if tokens.len() < 2 || tokens[1].is_empty() {
                return Err(invalid(s));
            }
            let host = tokens[1].to_string();
            return match tokens.len() {
                2 => Ok(Resource::Lan {
                    host,
                    device: "inst0".to_string(),
                }),
                3 if ends_with("INSTR") => Ok(Resource::Lan {
                    host,
                    device: "inst0".to_string(),
                }),
                4 if ends_with("SOCKET") => {
                    let port = tokens[2].parse().map_err(|_| invalid(s))?;
                    Ok(Resource::Socket { host, port })
                }
                4 if ends_with("INSTR") => Ok(Resource::Lan {
                    host,
                    device: tokens[2].to_string(),
                }),
                _ => Err(invalid(s)),
            };
        }

        Err(invalid(s))
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Serial { port } => write!(f, "ASRL{port}::INSTR"),
            Resource::Gpib { board, address } => write!(f, "GPIB{board}::{address}::INSTR"),
            Resource::Socket { host, port } => write!(f, "TCPIP0::{host}::{port}::SOCKET"),
            Resource::Lan { host, device } => write!(f, "TCPIP0::{host}::{device}::INSTR"),
        }
    }
}

/// Everything needed to open a resource.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    pub serial: SerialSettings,
    pub tcp: TcpSettings,
    /// Resource of the GPIB bus controller, required for GPIB resources.
    pub gpib_controller: Option<String>,
}

/// Open a transport for `resource`.
pub fn open(resource: &Resource, options: &OpenOptions) -> Result<Box<dyn Transport>> {
    info!("Opening {resource}");
    match resource {
        Resource::Serial { port } => Ok(Box::new(transport::open_serial(port, &options.serial)?)),
        Resource::Socket { host, port } => {
            Ok(Box::new(transport::connect_tcp(host, *port, &options.tcp)?))
        }
        Resource::Lan { host, device } => {
            info!("{device} on {host} is reached through its SCPI socket");
            Ok(Box::new(transport::connect_tcp(
                host,
                SCPI_SOCKET_PORT,
                &options.tcp,
            )?))
        }
        Resource::Gpib { address, .. } => {
            let controller = options.gpib_controller.as_deref().ok_or_else(|| {
                InstrumentError::Unsupported(format!(
                    "{resource} needs a GPIB controller resource"
                ))
            })?;
            let controller: Resource = controller.parse()?;
            if matches!(controller, Resource::Gpib { .. }) {
                return Err(InstrumentError::InvalidResource(controller.to_string()));
            }
            let link = open(&controller, options)?;
            Ok(Box::new(GpibTransport::open(link, *address)?))
        }
    }
}

/// Parse and open in one step.
pub fn open_str(resource: &str, options: &OpenOptions) -> Result<Box<dyn Transport>> {
    open(&resource.parse()?, options)
}
