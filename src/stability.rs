//! Waiting for the mixing chamber to settle before a measurement.
//!
//! The loop polls the pressure gauges and the temperature at a fixed
//! interval. Every in-band sample with healthy pressures bumps a counter;
//! anything else resets it and backs off for the recovery interval. The
//! temperature counts as stable once the counter reaches
//! `ceil(min_stable / poll_interval)`.
//!
//! Unlike the bench scripts this grew out of, the loop can give up: with a
//! `timeout` set it returns [`InstrumentError::NotStable`] once the time spent
//! waiting reaches it.

use crate::error::{InstrumentError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Source of the readings the loop needs.
pub trait StabilitySource {
    /// True when the pressure safety check passes.
    fn pressure_ok(&mut self) -> Result<bool>;

    /// Current temperature in mK.
    fn temperature(&mut self) -> Result<f64>;
}

/// Blocking delay, replaceable in tests.
pub trait Sleeper {
    fn sleep(&mut self, duration: Duration);
}

/// Sleeps the current thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

impl<S: Sleeper + ?Sized> Sleeper for &mut S {
    fn sleep(&mut self, duration: Duration) {
        (**self).sleep(duration)
    }
}

/// Timing of the stability check, independent of the target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityTiming {
    /// Minimum time the temperature must stay in band, in seconds.
    pub min_stable_s: f64,
    /// Time between samples, in seconds.
    pub poll_interval_s: f64,
    /// Back-off after an unstable sample, in seconds.
    pub recovery_interval_s: f64,
    /// Give up after this many seconds of waiting. `None` waits forever.
    pub timeout_s: Option<f64>,
}

impl Default for StabilityTiming {
    fn default() -> Self {
        Self {
            min_stable_s: 90.0,
            poll_interval_s: 5.0,
            recovery_interval_s: 360.0,
            timeout_s: Some(4.0 * 3600.0),
        }
    }
}

fn seconds(what: &'static str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value).map_err(|_| InstrumentError::OutOfRange { what, value })
}

/// Everything the wait loop needs to decide whether a temperature is stable.
#[derive(Debug, Clone, PartialEq)]
pub struct StabilityCriteria {
    /// Target temperature in mK.
    pub target: f64,
    /// Allowed deviation from the target in mK.
    pub tolerance: f64,
    pub min_stable: Duration,
    pub poll_interval: Duration,
    pub recovery_interval: Duration,
    pub timeout: Option<Duration>,
}

impl StabilityCriteria {
    /// Criteria with the default timing: 5 s polling, 90 s stable, 6 min recovery.
    pub fn new(target: f64, tolerance: f64) -> Self {
        Self {
            target,
            tolerance,
            min_stable: Duration::from_secs(90),
            poll_interval: Duration::from_secs(5),
            recovery_interval: Duration::from_secs(360),
            timeout: Some(Duration::from_secs(4 * 3600)),
        }
    }

    /// Criteria with the timing taken from configuration.
    pub fn with_timing(target: f64, tolerance: f64, timing: &StabilityTiming) -> Result<Self> {
        Ok(Self {
            target,
            tolerance,
            min_stable: seconds("minimum stable time", timing.min_stable_s)?,
            poll_interval: seconds("poll interval", timing.poll_interval_s)?,
            recovery_interval: seconds("recovery interval", timing.recovery_interval_s)?,
            timeout: timing
                .timeout_s
                .map(|t| seconds("stability timeout", t))
                .transpose()?,
        })
    }

    pub fn min_stable(mut self, duration: Duration) -> Self {
        self.min_stable = duration;
        self
    }

    pub fn poll_interval(mut self, duration: Duration) -> Self {
        self.poll_interval = duration;
        self
    }

    pub fn recovery_interval(mut self, duration: Duration) -> Self {
        self.recovery_interval = duration;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Number of consecutive good samples needed, at least one.
    pub fn required_samples(&self) -> u32 {
        let poll = self.poll_interval.as_nanos().max(1);
        let samples = self.min_stable.as_nanos().div_ceil(poll);
        u32::try_from(samples).unwrap_or(u32::MAX).max(1)
    }

    /// True when `temperature` lies in `[target - tolerance, target + tolerance]`.
    pub fn in_band(&self, temperature: f64) -> bool {
        temperature >= self.target - self.tolerance && temperature <= self.target + self.tolerance
    }

    fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(InstrumentError::OutOfRange {
                what: "poll interval",
                value: 0.0,
            });
        }
        if !self.tolerance.is_finite() || self.tolerance < 0.0 {
            return Err(InstrumentError::OutOfRange {
                what: "tolerance",
                value: self.tolerance,
            });
        }
        if !self.target.is_finite() {
            return Err(InstrumentError::OutOfRange {
                what: "target temperature",
                value: self.target,
            });
        }
        Ok(())
    }
}

/// How the wait went.
#[derive(Debug, Clone, PartialEq)]
pub struct StabilityReport {
    /// Samples taken, good and bad.
    pub samples: u32,
    /// Times the counter went back to zero.
    pub resets: u32,
    /// Total time spent sleeping.
    pub waited: Duration,
    /// Last temperature read, if any.
    pub last_temperature: Option<f64>,
}

/// Block until the source reports a stable temperature, or the timeout passes.
pub fn wait_for_stability<P, S>(
    source: &mut P,
    sleeper: &mut S,
    criteria: &StabilityCriteria,
) -> Result<StabilityReport>
where
    P: StabilitySource + ?Sized,
    S: Sleeper + ?Sized,
{
    criteria.validate()?;
    let required = criteria.required_samples();
    info!(
        "Waiting for {} mK ± {} mK ({} consecutive samples)",
        criteria.target, criteria.tolerance, required
    );

    let mut counter = 0u32;
    let mut report = StabilityReport {
        samples: 0,
        resets: 0,
        waited: Duration::ZERO,
        last_temperature: None,
    };

    loop {
        if let Some(limit) = criteria.timeout {
            if report.waited >= limit {
                warn!(
                    "Gave up on {} mK after {:?} ({} resets)",
                    criteria.target, report.waited, report.resets
                );
                return Err(InstrumentError::NotStable {
                    target: criteria.target,
                    waited: report.waited,
                });
            }
        }

        report.samples += 1;
        let stable = if source.pressure_ok()? {
            let temperature = source.temperature()?;
            report.last_temperature = Some(temperature);
            criteria.in_band(temperature)
        } else {
            false
        };

        if stable {
            counter += 1;
            debug!("Stable sample {counter}/{required}");
            if counter >= required {
                break;
            }
            sleeper.sleep(criteria.poll_interval);
            report.waited += criteria.poll_interval;
        } else {
            if counter > 0 {
                debug!("Stability counter reset after {counter} samples");
            }
            counter = 0;
            report.resets += 1;
            info!(
                "Not stable (last reading {:?} mK), retrying in {:?}",
                report.last_temperature, criteria.recovery_interval
            );
            sleeper.sleep(criteria.recovery_interval);
            report.waited += criteria.recovery_interval;
        }
    }

    info!("Temperature is stable at {} mK", criteria.target);
    Ok(report)
}
