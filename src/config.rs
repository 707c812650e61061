//! Lab configuration loading and validation.

use anyhow::{Context, Result};
use cryolab::fridge::FridgeSettings;
use cryolab::resource::{OpenOptions, Resource};
use cryolab::stability::StabilityTiming;
use cryolab::sweep::SweepPlan;
use cryolab::transport::{SerialSettings, TcpSettings};
use cryolab::vna::{DisplayFormat, OutputArray, ScanSettings, HP8753_MAX_POINTS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LabConfig {
    pub fridge: FridgeConfig,

    /// Timing of the stability wait, in seconds.
    pub stability: StabilityTiming,

    pub vna: VnaConfig,

    /// Resource of the GPIB bus controller (Prologix-style, on serial or LAN).
    pub gpib_controller: Option<String>,

    /// Socket timeouts for LAN instruments.
    pub tcp: TcpSettings,

    pub sweep: SweepConfig,

    /// Where sweep results are written.
    pub output_dir: PathBuf,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            fridge: FridgeConfig::default(),
            stability: StabilityTiming::default(),
            vna: VnaConfig::default(),
            gpib_controller: None,
            tcp: TcpSettings::default(),
            sweep: SweepConfig::default(),
            output_dir: PathBuf::from("output"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FridgeConfig {
    pub resource: String,
    pub serial: SerialSettings,
    #[serde(flatten)]
    pub settings: FridgeSettings,
}

impl Default for FridgeConfig {
    fn default() -> Self {
        Self {
            resource: String::from("ASRL1::INSTR"),
            serial: SerialSettings::default(),
            settings: FridgeSettings::default(),
        }
    }
}

/// Analyzer family.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VnaKind {
    /// HP 8753 family, binary transfers over GPIB.
    #[default]
    Hp8753,
    /// SCPI analyzer on the LAN.
    Scpi,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct VnaConfig {
    pub kind: VnaKind,
    pub resource: String,
    /// Points per trace on the HP 8753.
    pub points: usize,
    pub format: DisplayFormat,
    pub output: OutputArray,
    /// Sweep span of the HP 8753, in GHz.
    pub start_ghz: Option<f64>,
    pub stop_ghz: Option<f64>,
    /// Scan used by the SCPI analyzer.
    pub scan: ScanSettings,
}

impl Default for VnaConfig {
    fn default() -> Self {
        Self {
            kind: VnaKind::default(),
            resource: String::from("GPIB0::16::INSTR"),
            points: HP8753_MAX_POINTS,
            format: DisplayFormat::default(),
            output: OutputArray::default(),
            start_ghz: None,
            stop_ghz: None,
            scan: ScanSettings::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Targets in mK.
    pub temperatures_mk: Vec<f64>,
    /// Allowed deviation as a fraction of each target.
    pub tolerance_fraction: f64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            temperatures_mk: Vec::new(),
            tolerance_fraction: 0.1,
        }
    }
}

impl LabConfig {
    /// Options for opening the fridge.
    pub fn fridge_open_options(&self) -> OpenOptions {
        OpenOptions {
            serial: self.fridge.serial.clone(),
            tcp: self.tcp.clone(),
            gpib_controller: self.gpib_controller.clone(),
        }
    }

    /// Options for opening the analyzer. A serial GPIB controller runs at
    /// its own default line settings.
    pub fn vna_open_options(&self) -> OpenOptions {
        OpenOptions {
            serial: SerialSettings {
                baud_rate: 115_200,
                stop_bits: 1,
                ..SerialSettings::default()
            },
            tcp: self.tcp.clone(),
            gpib_controller: self.gpib_controller.clone(),
        }
    }

    pub fn sweep_plan(&self) -> SweepPlan {
        SweepPlan {
            temperatures_mk: self.sweep.temperatures_mk.clone(),
            tolerance_fraction: self.sweep.tolerance_fraction,
            timing: self.stability.clone(),
        }
    }
}

/// Load configuration from a file; `.json` files are JSON, anything else TOML.
pub fn load_config(path: &Path) -> Result<LabConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: LabConfig = if path.extension().map_or(false, |e| e == "json") {
        serde_json::from_str(&content).with_context(|| "Failed to parse config as JSON")?
    } else {
        toml::from_str(&content).with_context(|| "Failed to parse config as TOML")?
    };

    validate_config(&config)?;

    Ok(config)
}

/// Check the parts that serde cannot.
pub fn validate_config(config: &LabConfig) -> Result<()> {
    config
        .fridge
        .resource
        .parse::<Resource>()
        .with_context(|| format!("Invalid fridge resource {:?}", config.fridge.resource))?;
    let vna: Resource = config
        .vna
        .resource
        .parse()
        .with_context(|| format!("Invalid VNA resource {:?}", config.vna.resource))?;
    if let Some(controller) = &config.gpib_controller {
        let controller: Resource = controller
            .parse()
            .with_context(|| format!("Invalid GPIB controller resource {:?}", controller))?;
        if matches!(controller, Resource::Gpib { .. }) {
            anyhow::bail!("GPIB controller must be a serial or LAN resource, got {controller}");
        }
    }
    if matches!(vna, Resource::Gpib { .. }) && config.gpib_controller.is_none() {
        tracing::warn!("VNA is on GPIB but no gpib_controller is configured");
    }

    let timing = &config.stability;
    for (name, value) in [
        ("poll_interval_s", timing.poll_interval_s),
        ("recovery_interval_s", timing.recovery_interval_s),
    ] {
        if !(value.is_finite() && value > 0.0) {
            anyhow::bail!("stability.{name} must be positive (got {value})");
        }
    }
    if !(timing.min_stable_s.is_finite() && timing.min_stable_s >= 0.0) {
        anyhow::bail!(
            "stability.min_stable_s must not be negative (got {})",
            timing.min_stable_s
        );
    }
    if let Some(timeout) = timing.timeout_s {
        if !(timeout.is_finite() && timeout > 0.0) {
            anyhow::bail!("stability.timeout_s must be positive (got {timeout})");
        }
    }

    if !(3..=HP8753_MAX_POINTS).contains(&config.vna.points) {
        anyhow::bail!(
            "vna.points must be between 3 and {} (got {})",
            HP8753_MAX_POINTS,
            config.vna.points
        );
    }
    if let (Some(start), Some(stop)) = (config.vna.start_ghz, config.vna.stop_ghz) {
        if !(start > 0.0 && stop > start) {
            anyhow::bail!("vna span {start}..{stop} GHz is empty");
        }
    }

    if !(config.sweep.tolerance_fraction.is_finite() && config.sweep.tolerance_fraction > 0.0) {
        anyhow::bail!(
            "sweep.tolerance_fraction must be positive (got {})",
            config.sweep.tolerance_fraction
        );
    }
    if config.sweep.temperatures_mk.iter().any(|t| !(t.is_finite() && *t > 0.0)) {
        anyhow::bail!("sweep.temperatures_mk must all be positive");
    }

    Ok(())
}
