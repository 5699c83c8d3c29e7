//! Core types for the labkit instrument-control runtime.
//!
//! This crate holds everything the layered stack shares: the error taxonomy,
//! dual-clock timestamps, the measurement data model, runtime settings, and
//! the external-store contract. It has no I/O of its own.

pub mod data;
pub mod error;
pub mod settings;
pub mod store;
pub mod timestamp;

pub use data::{
    Cell, Column, DataFrame, Envelope, Measured, MeasurementKind, MeasurementResult,
    MeasurementValue, Provenance,
};
pub use error::{
    ComplianceError, ConfigError, InstrumentError, LabError, LabResult, ProfileError,
    Quantity, ReplayError, SafetyLimitError, SessionError, TransportError,
    TransportErrorKind,
};
pub use settings::Settings;
pub use store::{envelope_key, MeasurementStore, MemoryStore, SearchHit};
pub use timestamp::{MonotonicClock, Timestamp};
