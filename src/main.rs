//! Cryolab CLI: fridge control, VNA scans and temperature sweeps.

mod config;
mod tui;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use config::{LabConfig, VnaKind};
use cryolab::fridge::Fridge;
use cryolab::resource;
use cryolab::sim::{FridgeSimulator, Hp8753Simulator, ScpiVnaSimulator, SimTransport};
use cryolab::spectrum::TemperatureSweep;
use cryolab::stability::{wait_for_stability, Sleeper, StabilityCriteria, ThreadSleeper};
use cryolab::sweep::measure;
use cryolab::transport::Transport;
use cryolab::vna::{Analyzer, Hp8753, ScpiVna};
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "cryolab")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Lab configuration file (TOML, or JSON with a .json extension)
    #[arg(short, long, env = "CRYOLAB_CONFIG")]
    config: Option<PathBuf>,

    /// Talk to simulated instruments instead of hardware
    #[arg(long)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Talk to the fridge controller
    Fridge {
        #[command(subcommand)]
        action: FridgeCommand,
    },

    /// Talk to the network analyzer
    Vna {
        #[command(subcommand)]
        action: VnaCommand,
    },

    /// Take a spectrum at each temperature
    Sweep {
        /// Temperatures in mK (overrides the configuration)
        #[arg(short, long, value_delimiter = ',')]
        temperatures: Vec<f64>,

        /// Output directory (overrides the configuration)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Export format
        #[arg(short, long, default_value = "both")]
        format: ExportFormat,
    },

    /// Live dashboard of temperature and pressures
    Monitor {
        /// Seconds between readings
        #[arg(short, long, default_value = "2")]
        interval: f64,

        /// Readings kept on the chart
        #[arg(long, default_value = "600")]
        history: usize,
    },

    /// Answer as the fridge controller on a serial port
    Serve {
        /// Serial port; lists the available ports when omitted
        #[arg(short, long)]
        port: Option<String>,

        #[arg(short, long, default_value = "9600")]
        baud: u32,

        /// ISOBUS address to answer on
        #[arg(long)]
        isobus: Option<u8>,
    },
}

#[derive(Subcommand)]
enum FridgeCommand {
    /// Read a sensor channel (the mixing chamber when omitted)
    Read { channel: Option<u8> },

    /// Print the controller status
    Status,

    /// Move the setpoint
    Set {
        /// Target in mK
        temperature: f64,
    },

    /// Set a temperature and block until it is stable
    Wait {
        /// Target in mK
        temperature: f64,

        /// Allowed deviation in mK (defaults to the sweep tolerance fraction)
        #[arg(long)]
        tolerance: Option<f64>,
    },

    /// Read a channel at a fixed interval
    Scan {
        channel: u8,

        /// Seconds between readings
        #[arg(short, long, default_value = "5")]
        interval: f64,

        /// Seconds to scan for
        #[arg(short, long, default_value = "60")]
        duration: f64,
    },
}

#[derive(Subcommand)]
enum VnaCommand {
    /// Print the identification string
    Idn,

    /// Take one spectrum
    Scan {
        /// Write the spectrum as CSV here instead of a summary to stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum ExportFormat {
    Csv,
    Json,
    #[default]
    Both,
}

/// Simulated instruments answer at once, so there is nothing to wait for.
struct SimulatedClock;

impl Sleeper for SimulatedClock {
    fn sleep(&mut self, duration: Duration) {
        tracing::debug!("Skipping {:?} wait against simulated instruments", duration);
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let config = match &cli.config {
        Some(path) => {
            tracing::info!("Loading configuration from {:?}", path);
            config::load_config(path)?
        }
        None => LabConfig::default(),
    };

    let mut sleeper: Box<dyn Sleeper> = if cli.simulate {
        Box::new(SimulatedClock)
    } else {
        Box::new(ThreadSleeper)
    };

    match cli.command {
        Commands::Fridge { action } => {
            let mut fridge = open_fridge(&config, cli.simulate)?;
            run_fridge(&mut fridge, action, &config, sleeper.as_mut())?;
        }
        Commands::Vna { action } => {
            let mut analyzer = open_analyzer(&config, cli.simulate)?;
            run_vna(analyzer.as_mut(), action)?;
        }
        Commands::Sweep {
            temperatures,
            output,
            format,
        } => {
            let mut plan = config.sweep_plan();
            if !temperatures.is_empty() {
                plan.temperatures_mk = temperatures;
            }
            if plan.temperatures_mk.is_empty() {
                anyhow::bail!("No temperatures to sweep; pass --temperatures or set sweep.temperatures_mk");
            }
            let output_dir = output.unwrap_or_else(|| config.output_dir.clone());
            let mut fridge = open_fridge(&config, cli.simulate)?;
            let mut analyzer = open_analyzer(&config, cli.simulate)?;
            tracing::info!("Analyzer: {}", analyzer.identify()?);
            let sweep = measure(&mut fridge, analyzer.as_mut(), &plan, sleeper.as_mut())
                .context("Temperature sweep failed")?;
            write_sweep(&sweep, &output_dir, format)?;
            println!(
                "{} spectra written to {}",
                sweep.len(),
                output_dir.display()
            );
        }
        Commands::Monitor { interval, history } => {
            let interval = Duration::try_from_secs_f64(interval)
                .ok()
                .filter(|d| !d.is_zero())
                .with_context(|| format!("Invalid monitor interval {interval}"))?;
            let mut fridge = open_fridge(&config, cli.simulate)?;
            tui::run_monitor(&mut fridge, interval, history)?;
        }
        Commands::Serve { port, baud, isobus } => {
            let mut simulator = FridgeSimulator::new();
            simulator.isobus_address = isobus;
            match port {
                Some(port) => run_serial_mode(&mut simulator, &port, baud)?,
                None => list_ports()?,
            }
        }
    }

    Ok(())
}

fn open_fridge(config: &LabConfig, simulate: bool) -> Result<Fridge<Box<dyn Transport>>> {
    let settings = config.fridge.settings.clone();
    let transport: Box<dyn Transport> = if simulate {
        let mut simulator = FridgeSimulator::new();
        simulator.isobus_address = settings.isobus_address;
        Box::new(SimTransport::new(simulator).named("simulated fridge"))
    } else {
        resource::open_str(&config.fridge.resource, &config.fridge_open_options())
            .with_context(|| format!("Failed to open fridge at {}", config.fridge.resource))?
    };
    Ok(Fridge::new(transport, settings))
}

fn open_analyzer(config: &LabConfig, simulate: bool) -> Result<Box<dyn Analyzer>> {
    let vna = &config.vna;
    let transport: Box<dyn Transport> = match (simulate, vna.kind) {
        (true, VnaKind::Hp8753) => {
            Box::new(SimTransport::new(Hp8753Simulator::new()).named("simulated 8753"))
        }
        (true, VnaKind::Scpi) => {
            Box::new(SimTransport::new(ScpiVnaSimulator::new()).named("simulated SCPI VNA"))
        }
        (false, _) => resource::open_str(&vna.resource, &config.vna_open_options())
            .with_context(|| format!("Failed to open VNA at {}", vna.resource))?,
    };

    Ok(match vna.kind {
        VnaKind::Hp8753 => {
            let mut analyzer = Hp8753::open(transport, vna.points)?;
            if let (Some(start), Some(stop)) = (vna.start_ghz, vna.stop_ghz) {
                analyzer.set_frequency_range(start, stop)?;
            }
            analyzer.configure_acquisition(vna.format, vna.output);
            Box::new(analyzer)
        }
        VnaKind::Scpi => Box::new(ScpiVna::new(transport).with_scan(vna.scan.clone())),
    })
}

fn run_fridge<T: Transport>(
    fridge: &mut Fridge<T>,
    action: FridgeCommand,
    config: &LabConfig,
    sleeper: &mut dyn Sleeper,
) -> Result<()> {
    match action {
        FridgeCommand::Read { channel } => match channel {
            Some(channel) => println!("R{}: {}", channel, fridge.read_sensor(channel)?),
            None => println!("{:.1} mK", fridge.temperature_mk()?),
        },
        FridgeCommand::Status => println!("{}", fridge.status()?),
        FridgeCommand::Set { temperature } => {
            fridge.set_temperature(temperature)?;
            println!("Setpoint {temperature} mK");
        }
        FridgeCommand::Wait {
            temperature,
            tolerance,
        } => {
            let tolerance =
                tolerance.unwrap_or(config.sweep.tolerance_fraction * temperature);
            let criteria = StabilityCriteria::with_timing(temperature, tolerance, &config.stability)?;
            fridge.set_temperature(temperature)?;
            let report = wait_for_stability(fridge, sleeper, &criteria)?;
            println!(
                "Stable at {:.1} mK after {} samples ({} resets, {:?})",
                report.last_temperature.unwrap_or(temperature),
                report.samples,
                report.resets,
                report.waited
            );
        }
        FridgeCommand::Scan {
            channel,
            interval,
            duration,
        } => {
            let interval = Duration::try_from_secs_f64(interval)
                .with_context(|| format!("Invalid interval {interval}"))?;
            let duration = Duration::try_from_secs_f64(duration)
                .with_context(|| format!("Invalid duration {duration}"))?;
            let values = fridge.scan(channel, interval, duration, sleeper)?;
            for (step, value) in values.iter().enumerate() {
                println!("{step}\t{value}");
            }
        }
    }
    Ok(())
}

fn run_vna(analyzer: &mut dyn Analyzer, action: VnaCommand) -> Result<()> {
    match action {
        VnaCommand::Idn => println!("{}", analyzer.identify()?),
        VnaCommand::Scan { output } => {
            let spectrum = analyzer.acquire()?;
            match output {
                Some(path) => {
                    let file = File::create(&path)
                        .with_context(|| format!("Failed to create {:?}", path))?;
                    spectrum.write_csv(BufWriter::new(file))?;
                    println!("{} points written to {}", spectrum.len(), path.display());
                }
                None => {
                    let db = spectrum.s21_db();
                    let (k, min) = db
                        .iter()
                        .copied()
                        .enumerate()
                        .fold((0, f64::INFINITY), |best, (k, v)| if v < best.1 { (k, v) } else { best });
                    println!("Points: {}", spectrum.len());
                    match spectrum.frequencies.get(k) {
                        Some(f) => println!("Deepest S21: {min:.2} dB at {:.6} GHz", f / 1e9),
                        None => println!("Deepest S21: {min:.2} dB at point {k}"),
                    }
                }
            }
        }
    }
    Ok(())
}

fn write_sweep(sweep: &TemperatureSweep, output_dir: &Path, format: ExportFormat) -> Result<()> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create output directory {:?}", output_dir))?;
    if matches!(format, ExportFormat::Csv | ExportFormat::Both) {
        let path = output_dir.join("sweep.csv");
        let file = File::create(&path).with_context(|| format!("Failed to create {:?}", path))?;
        sweep.write_csv(BufWriter::new(file))?;
        tracing::info!("Wrote {:?}", path);
    }
    if matches!(format, ExportFormat::Json | ExportFormat::Both) {
        let path = output_dir.join("sweep.json");
        let file = File::create(&path).with_context(|| format!("Failed to create {:?}", path))?;
        sweep.write_json(BufWriter::new(file))?;
        tracing::info!("Wrote {:?}", path);
    }
    Ok(())
}

fn list_ports() -> Result<()> {
    let ports = serialport::available_ports().context("Could not enumerate serial ports")?;
    if ports.is_empty() {
        anyhow::bail!("No serial ports found");
    }
    println!("Available serial ports:");
    for port in ports {
        println!("  {}", port.port_name);
    }
    Ok(())
}

// Answers controller commands on a serial port until interrupted.
fn run_serial_mode(simulator: &mut FridgeSimulator, port_name: &str, baud_rate: u32) -> Result<()> {
    let mut port = serialport::new(port_name, baud_rate)
        .timeout(Duration::from_millis(10))
        .open()
        .with_context(|| format!("Failed to open port '{}'", port_name))?;

    println!(
        "Listening on {} at {} baud. Press Ctrl+C to exit.",
        port_name, baud_rate
    );

    let mut serial_buf: Vec<u8> = vec![0; 128];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        match port.read(serial_buf.as_mut_slice()) {
            Ok(bytes_read) => {
                pending.extend_from_slice(&serial_buf[..bytes_read]);
                while let Some(end) = pending.iter().position(|&b| b == b'\r' || b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=end).collect();
                    let command = String::from_utf8_lossy(&line);
                    let command = command.trim();
                    if command.is_empty() {
                        continue;
                    }
                    tracing::info!("> {}", command);
                    if let Some(reply) = simulator.process_command(command) {
                        tracing::info!("< {}", reply);
                        if let Err(e) = port.write_all(format!("{reply}\r").as_bytes()) {
                            tracing::error!("Failed to write to serial port: {}", e);
                        }
                    }
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => (),
            Err(e) => tracing::error!("Serial port error: {}", e),
        }
    }
}
