//! Temperature sweeps: settle the fridge, take a spectrum, move on.

use crate::error::{InstrumentError, Result};
use crate::fridge::Fridge;
use crate::spectrum::TemperatureSweep;
use crate::stability::{wait_for_stability, Sleeper, StabilityCriteria, StabilityTiming};
use crate::transport::Transport;
use crate::vna::Analyzer;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// Which temperatures to visit and how settled each must be.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepPlan {
    /// Targets in mK, visited in order.
    pub temperatures_mk: Vec<f64>,
    /// Allowed deviation as a fraction of each target.
    pub tolerance_fraction: f64,
    pub timing: StabilityTiming,
}

impl Default for SweepPlan {
    fn default() -> Self {
        Self {
            temperatures_mk: Vec::new(),
            tolerance_fraction: 0.1,
            timing: StabilityTiming::default(),
        }
    }
}

impl SweepPlan {
    pub fn new(temperatures_mk: Vec<f64>) -> Self {
        Self {
            temperatures_mk,
            ..Self::default()
        }
    }

    pub fn criteria_for(&self, target_mk: f64) -> Result<StabilityCriteria> {
        StabilityCriteria::with_timing(target_mk, self.tolerance_fraction * target_mk, &self.timing)
    }
}

/// Runs `plan` and returns one spectrum per temperature.
///
/// The first failure ends the sweep and is returned as is.
pub fn measure<T, A, S>(
    fridge: &mut Fridge<T>,
    analyzer: &mut A,
    plan: &SweepPlan,
    sleeper: &mut S,
) -> Result<TemperatureSweep>
where
    T: Transport,
    A: Analyzer + ?Sized,
    S: Sleeper + ?Sized,
{
    if plan.temperatures_mk.is_empty() {
        return Err(InstrumentError::OutOfRange {
            what: "number of sweep temperatures",
            value: 0.0,
        });
    }
    if !(plan.tolerance_fraction.is_finite() && plan.tolerance_fraction > 0.0) {
        return Err(InstrumentError::OutOfRange {
            what: "tolerance fraction",
            value: plan.tolerance_fraction,
        });
    }

    let mut sweep = TemperatureSweep::default();
    for &target in &plan.temperatures_mk {
        match measure_point(fridge, analyzer, plan, target, sleeper) {
            Ok(spectrum) => {
                info!("{} mK done, {} points", target, spectrum.len());
                sweep.push(target, spectrum);
            }
            Err(err) => {
                error!(
                    "Sweep stopped at {} mK after {} of {} temperatures: {}",
                    target,
                    sweep.len(),
                    plan.temperatures_mk.len(),
                    err
                );
                return Err(err);
            }
        }
    }
    Ok(sweep)
}

fn measure_point<T, A, S>(
    fridge: &mut Fridge<T>,
    analyzer: &mut A,
    plan: &SweepPlan,
    target: f64,
    sleeper: &mut S,
) -> Result<crate::spectrum::IqSpectrum>
where
    T: Transport,
    A: Analyzer + ?Sized,
    S: Sleeper + ?Sized,
{
    let criteria = plan.criteria_for(target)?;
    fridge.set_temperature(target)?;
    let report = wait_for_stability(fridge, &mut *sleeper, &criteria)?;
    info!(
        "Stable at {:.1} mK after {:?} ({} resets)",
        report.last_temperature.unwrap_or(target),
        report.waited,
        report.resets
    );
    analyzer.acquire()
}
