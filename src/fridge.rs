//! Driver for the dilution-refrigerator temperature controller.
//!
//! The controller speaks a terse ASCII protocol over RS-232: a command letter
//! followed by its argument, terminated by a carriage return. Prefixing a
//! command with `$` tells the controller not to answer. Readings come back as
//! the echoed letter, a sign and five digits (`R+01234`).

use crate::codec;
use crate::error::{InstrumentError, Result};
use crate::stability::{Sleeper, StabilitySource};
use crate::transport::{MessageLink, Transport};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

/// Upper bound of the setpoint field: five digits of 0.1 mK.
pub const MAX_SETPOINT_COUNTS: f64 = 99_999.0;

/// A pressure gauge and the reading it must stay below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PressureLimit {
    pub channel: u8,
    pub below: f64,
}

/// How the controller is wired and what the readings mean.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FridgeSettings {
    /// Channel of the mixing chamber thermometer used for stability checks.
    pub temperature_channel: u8,
    /// mK per raw count of a temperature reading.
    pub mk_per_count: f64,
    /// Gauges checked before a temperature is trusted.
    pub pressure_limits: Vec<PressureLimit>,
    /// Re-queries allowed when the controller answers with an error marker.
    pub max_query_retries: u32,
    /// Control mode sent with every new setpoint (`A<n>`).
    pub control_mode: Option<u8>,
    /// ISOBUS address, when the controller shares the line.
    pub isobus_address: Option<u8>,
}

impl Default for FridgeSettings {
    fn default() -> Self {
        Self {
            temperature_channel: 2,
            mk_per_count: 0.1,
            pressure_limits: vec![
                PressureLimit {
                    channel: 14,
                    below: 10_000.0,
                },
                PressureLimit {
                    channel: 15,
                    below: 100_000.0,
                },
            ],
            max_query_retries: 10,
            control_mode: Some(2),
            isobus_address: None,
        }
    }
}

/// Heater power range for a target temperature in mK.
pub fn power_range_for(target_mk: f64) -> u8 {
    if target_mk <= 35.0 {
        1
    } else if target_mk <= 55.0 {
        2
    } else if target_mk <= 140.0 {
        3
    } else if target_mk <= 400.0 {
        4
    } else {
        5
    }
}

/// Setpoint command for a target in mK, five digits of 0.1 mK.
pub fn setpoint_command(target_mk: f64) -> Result<String> {
    let counts = (target_mk * 10.0).round();
    if !target_mk.is_finite() || counts < 0.0 || counts > MAX_SETPOINT_COUNTS {
        return Err(InstrumentError::OutOfRange {
            what: "setpoint (mK)",
            value: target_mk,
        });
    }
    Ok(format!("T{:05}", counts as u32))
}

/// A dilution-refrigerator controller on some transport.
pub struct Fridge<T> {
    link: MessageLink<T>,
    settings: FridgeSettings,
}

impl<T: Transport> Fridge<T> {
    pub fn new(transport: T, settings: FridgeSettings) -> Self {
        Self {
            link: MessageLink::new(transport, "\r", b'\r'),
            settings,
        }
    }

    pub fn settings(&self) -> &FridgeSettings {
        &self.settings
    }

    fn address(&self) -> String {
        self.settings
            .isobus_address
            .map(|a| format!("@{a}"))
            .unwrap_or_default()
    }

    /// Send a command without waiting for a reply.
    pub fn execute(&mut self, command: &str) -> Result<()> {
        let framed = format!("${}{}", self.address(), command);
        self.link.write(&framed)
    }

    /// Send a command and return its reply.
    ///
    /// Replies carrying an error marker are re-queried up to
    /// `max_query_retries` times, so at most `max_query_retries + 1` queries
    /// go out.
    pub fn query(&mut self, command: &str) -> Result<String> {
        let framed = format!("{}{}", self.address(), command);
        let attempts = self.settings.max_query_retries.saturating_add(1);
        for attempt in 1..=attempts {
            self.link.clear()?;
            let reply = self.link.query(&framed)?;
            if !codec::is_error_reply(&reply) {
                return Ok(reply);
            }
            warn!("Controller rejected '{command}' with {reply:?} (attempt {attempt}/{attempts})");
        }
        Err(InstrumentError::RetriesExhausted {
            command: command.to_string(),
            attempts,
        })
    }

    /// Raw reading of a sensor channel.
    pub fn read_sensor(&mut self, channel: u8) -> Result<f64> {
        let command = format!("R{channel}");
        let reply = self.query(&command)?;
        codec::parse_reading(&command, &reply)
    }

    /// Mixing chamber temperature in mK.
    pub fn temperature_mk(&mut self) -> Result<f64> {
        let raw = self.read_sensor(self.settings.temperature_channel)?;
        Ok(raw * self.settings.mk_per_count)
    }

    /// True when every gauge reads below its limit.
    pub fn check_pressure(&mut self) -> Result<bool> {
        let limits = self.settings.pressure_limits.clone();
        for limit in &limits {
            let value = self.read_sensor(limit.channel)?;
            if value >= limit.below {
                warn!(
                    "High pressure on channel {}: {} (limit {})",
                    limit.channel, value, limit.below
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Move the setpoint to `target_mk`, picking the matching heater range.
    pub fn set_temperature(&mut self, target_mk: f64) -> Result<()> {
        let setpoint = setpoint_command(target_mk)?;
        let range = power_range_for(target_mk);
        info!("Setting mixing chamber to {target_mk} mK (power range E{range})");
        self.execute(&format!("E{range}"))?;
        if let Some(mode) = self.settings.control_mode {
            self.execute(&format!("A{mode}"))?;
        }
        self.execute(&setpoint)
    }

    /// The controller's status string (`X` command).
    pub fn status(&mut self) -> Result<String> {
        let framed = format!("{}X", self.address());
        self.link.clear()?;
        let reply = self.link.query(&framed)?;
        if !reply.starts_with('X') {
            return Err(InstrumentError::invalid_reply("X", reply));
        }
        Ok(reply)
    }

    /// Read `channel` every `interval` for `duration`.
    ///
    /// Takes `floor(duration / interval)` readings, sleeping after each one.
    pub fn scan<S: Sleeper + ?Sized>(
        &mut self,
        channel: u8,
        interval: Duration,
        duration: Duration,
        sleeper: &mut S,
    ) -> Result<Vec<f64>> {
        if interval.is_zero() {
            return Err(InstrumentError::OutOfRange {
                what: "scan interval",
                value: 0.0,
            });
        }
        let steps = (duration.as_secs_f64() / interval.as_secs_f64()).floor() as usize;
        let mut values = Vec::with_capacity(steps);
        for step in 0..steps {
            let value = self.read_sensor(channel)?;
            info!("Channel {channel} at step {step} is {value}");
            values.push(value);
            sleeper.sleep(interval);
        }
        Ok(values)
    }

    pub fn into_transport(self) -> T {
        self.link.into_inner()
    }
}

impl<T: Transport> StabilitySource for Fridge<T> {
    fn pressure_ok(&mut self) -> Result<bool> {
        self.check_pressure()
    }

    fn temperature(&mut self) -> Result<f64> {
        self.temperature_mk()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{FridgeSimulator, SimTransport};
    use std::sync::{Arc, Mutex};

    fn fridge_with(sim: FridgeSimulator) -> (Fridge<SimTransport<FridgeSimulator>>, Arc<Mutex<FridgeSimulator>>) {
        let shared = Arc::new(Mutex::new(sim));
        let fridge = Fridge::new(SimTransport::shared(Arc::clone(&shared)), FridgeSettings::default());
        (fridge, shared)
    }

    struct NoSleep(u32);

    impl Sleeper for NoSleep {
        fn sleep(&mut self, _duration: Duration) {
            self.0 += 1;
        }
    }

    #[test]
    fn power_ranges() {
        assert_eq!(power_range_for(20.0), 1);
        assert_eq!(power_range_for(35.0), 1);
        assert_eq!(power_range_for(35.1), 2);
        assert_eq!(power_range_for(55.0), 2);
        assert_eq!(power_range_for(100.0), 3);
        assert_eq!(power_range_for(400.0), 4);
        assert_eq!(power_range_for(401.0), 5);
    }

    #[test]
    fn setpoint_is_five_digits_of_tenth_millikelvin() {
        assert_eq!(setpoint_command(50.0).unwrap(), "T00500");
        assert_eq!(setpoint_command(12.34).unwrap(), "T00123");
        assert_eq!(setpoint_command(9999.9).unwrap(), "T99999");
        assert!(setpoint_command(10_000.0).is_err());
        assert!(setpoint_command(-1.0).is_err());
        assert!(setpoint_command(f64::NAN).is_err());
    }

    #[test]
    fn reads_temperature_in_millikelvin() {
        let (mut fridge, _) = fridge_with(FridgeSimulator::new());
        assert_eq!(fridge.read_sensor(14).unwrap(), 1200.0);
        assert_eq!(fridge.temperature_mk().unwrap(), 100.0);
    }

    #[test]
    fn set_temperature_sends_range_mode_and_setpoint() {
        let (mut fridge, sim) = fridge_with(FridgeSimulator::new());
        fridge.set_temperature(50.0).unwrap();
        let sim = sim.lock().unwrap();
        assert_eq!(sim.power_range, 2);
        assert_eq!(sim.control_mode, 2);
        assert_eq!(sim.setpoint, 500.0);
    }

    #[test]
    fn query_retries_error_replies() {
        let mut sim = FridgeSimulator::new();
        sim.garbled_replies = 2;
        let (mut fridge, _) = fridge_with(sim);
        assert_eq!(fridge.read_sensor(15).unwrap(), 5000.0);
    }

    #[test]
    fn query_gives_up_after_retries() {
        let mut sim = FridgeSimulator::new();
        sim.garbled_replies = 100;
        let (mut fridge, _) = fridge_with(sim);
        let err = fridge.read_sensor(2).unwrap_err();
        assert!(matches!(
            err,
            InstrumentError::RetriesExhausted { attempts: 11, .. }
        ));
    }

    #[test]
    fn query_retries_exactly_the_configured_count() {
        // first reply plus ten re-queries, all garbled but the last
        let mut sim = FridgeSimulator::new();
        sim.garbled_replies = 10;
        let (mut fridge, sim) = fridge_with(sim);
        assert_eq!(fridge.read_sensor(15).unwrap(), 5000.0);
        assert_eq!(sim.lock().unwrap().garbled_replies, 0);

        let settings = FridgeSettings {
            max_query_retries: 0,
            ..FridgeSettings::default()
        };
        let mut sim = FridgeSimulator::new();
        sim.garbled_replies = 1;
        let mut fridge = Fridge::new(SimTransport::new(sim), settings);
        assert!(matches!(
            fridge.read_sensor(15).unwrap_err(),
            InstrumentError::RetriesExhausted { attempts: 1, .. }
        ));
    }

    #[test]
    fn pressure_check_uses_both_gauges() {
        let (mut fridge, sim) = fridge_with(FridgeSimulator::new());
        assert!(fridge.check_pressure().unwrap());
        sim.lock().unwrap().sensors[15] = 200_000.0;
        assert!(!fridge.check_pressure().unwrap());
        sim.lock().unwrap().sensors[15] = 5000.0;
        sim.lock().unwrap().sensors[14] = 10_000.0;
        assert!(!fridge.check_pressure().unwrap());
    }

    #[test]
    fn status_string() {
        let (mut fridge, _) = fridge_with(FridgeSimulator::new());
        assert!(fridge.status().unwrap().starts_with("X0A0"));
    }

    #[test]
    fn isobus_prefix_is_sent() {
        let sim = FridgeSimulator::new().with_isobus_address(3);
        let shared = Arc::new(Mutex::new(sim));
        let settings = FridgeSettings {
            isobus_address: Some(3),
            ..FridgeSettings::default()
        };
        let mut fridge = Fridge::new(SimTransport::shared(Arc::clone(&shared)), settings);
        assert_eq!(fridge.read_sensor(14).unwrap(), 1200.0);
        fridge.set_temperature(30.0).unwrap();
        assert_eq!(shared.lock().unwrap().setpoint, 300.0);
    }

    #[test]
    fn scan_takes_floor_of_duration_over_interval() {
        let (mut fridge, _) = fridge_with(FridgeSimulator::new());
        let mut sleeper = NoSleep(0);
        let values = fridge
            .scan(14, Duration::from_secs(5), Duration::from_secs(17), &mut sleeper)
            .unwrap();
        assert_eq!(values, vec![1200.0; 3]);
        assert_eq!(sleeper.0, 3);
    }

    #[test]
    fn fridge_is_a_stability_source() {
        use crate::stability::{wait_for_stability, StabilityCriteria};

        let (mut fridge, _) = fridge_with(FridgeSimulator::new());
        fridge.set_temperature(40.0).unwrap();
        let criteria = StabilityCriteria::new(40.0, 4.0)
            .min_stable(Duration::from_secs(10))
            .poll_interval(Duration::from_secs(5))
            .timeout(Some(Duration::from_secs(3600)));
        let mut sleeper = NoSleep(0);
        let report = wait_for_stability(&mut fridge, &mut sleeper, &criteria).unwrap();
        assert!(report.resets > 0);
        assert!(criteria.in_band(report.last_temperature.unwrap()));
    }
}
