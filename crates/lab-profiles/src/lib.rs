//! Declarative instrument profiles and bench descriptors.
//!
//! A profile describes one instrument model (identity, channels, accuracy,
//! safety bounds, SCPI overrides, simulation rules); a bench descriptor
//! composes profiles into a named set of live instruments. Both are YAML with
//! typed, validated schemas - patterns and expressions are compiled at load
//! time, so files that parse are files that will dispatch.

pub mod bench;
pub mod loader;
pub mod schema;
pub mod validation;

pub use bench::{
    Automation, BackendOverride, BackendSettings, BackendType, BenchDescriptor,
    ExperimentMeta, HookStep, InstrumentEntry, InstrumentMap, SafetyLimits,
};
pub use loader::{builtin_catalog, load_profile, merge_documents, override_diff, CatalogEntry, ProfileCatalog};
pub use schema::{
    AccuracySpec, Bound, ChannelSpec, DeviceType, Endianness, EvalOrder, ProfileSpec,
    ReadoutConfig, SafetySchema, SimAction, SimErrorRule, SimRule, SimValue,
    SimulationConfig, WaveformFormat,
};
pub use validation::{validate_profile, KNOWN_QUANTITIES};
