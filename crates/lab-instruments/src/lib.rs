//! Instrument runtime: profile-driven SCPI drivers and bench composition.
//!
//! Each device family gets its own typed driver (oscilloscope, power supply,
//! multimeter, waveform generator, DC load, spectrum analyzer, VNA, power
//! meter) built on a shared [`instrument::InstrumentCore`]: validate against
//! the profile and safety overlay, format SCPI from templates, parse the
//! response grammar, attach uncertainty, and keep the command trace that
//! feeds measurement provenance. [`bench::Bench`] composes drivers from a
//! descriptor and owns their lifecycle.

pub mod bench;
pub mod dc_load;
pub mod instrument;
pub mod multimeter;
pub mod oscilloscope;
pub mod power_meter;
pub mod power_supply;
pub mod safety;
pub mod scpi;
pub mod spectrum_analyzer;
pub mod vna;
pub mod waveform_generator;

pub use bench::{Bench, BenchOptions, Device};
pub use dc_load::{DcLoad, LoadMode};
pub use instrument::{ErrorSweep, InstrumentCore};
pub use multimeter::{IntegrationTime, Multimeter};
pub use oscilloscope::{
    AcquisitionMode, AcquisitionType, Coupling, Oscilloscope, Slope, TriggerSource,
};
pub use power_meter::PowerMeter;
pub use power_supply::PowerSupply;
pub use safety::SafetyOverlay;
pub use spectrum_analyzer::SpectrumAnalyzer;
pub use vna::Vna;
pub use waveform_generator::WaveformGenerator;
