//! # Cryolab
//!
//! Drives a dilution refrigerator's temperature controller and a vector
//! network analyzer to take S21 spectra at a series of stabilized
//! temperatures.
//!
//! The instruments are reached over serial lines, GPIB (through a
//! Prologix-style controller) or raw SCPI sockets. Each driver speaks its
//! instrument's reply format, and [`sim`] answers those formats the way the
//! hardware does, so everything can run on a desk without a cryostat.

pub mod codec;
pub mod error;
pub mod fridge;
pub mod resource;
pub mod sim;
pub mod spectrum;
pub mod stability;
pub mod sweep;
pub mod transport;
pub mod vna;

pub use error::{InstrumentError, Result};
pub use fridge::{Fridge, FridgeSettings};
pub use spectrum::{IqSpectrum, TemperatureSweep};
pub use stability::{wait_for_stability, StabilityCriteria, StabilitySource};
pub use sweep::{measure, SweepPlan};
pub use transport::{MessageLink, Transport};
pub use vna::{Analyzer, Hp8753, ScpiVna};
