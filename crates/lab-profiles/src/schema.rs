//! Schema definitions for declarative instrument profiles.
//!
//! A profile is the YAML description of one instrument model: its identity,
//! channels, measurement-accuracy table, safety-limit skeleton, SCPI command
//! overrides, and simulation rules. Profiles are data; the runtime is the
//! interpreter.
//!
//! # Profile structure
//!
//! ```yaml
//! model_id: EDU36311A          # identity
//! device_type: power_supply
//! channels: [...]              # ordered channel descriptors
//! accuracy_table: {...}        # mode/range key -> accuracy entry
//! safety_schema: {...}         # hard per-channel bounds
//! scpi: {...}                  # command template overrides
//! simulation:                  # deterministic simulator definition
//!   state: {...}
//!   scpi: [...]
//!   errors: [...]
//! ```

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_valid::Validate;
use std::collections::BTreeMap;

use super::validation::{validate_expression, validate_optional_expression, validate_pattern};

// =============================================================================
// Device identity
// =============================================================================

/// Instrument family a profile describes. Each family maps to exactly one
/// typed driver; cross-type operations are unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Oscilloscope,
    PowerSupply,
    Multimeter,
    WaveformGenerator,
    DcLoad,
    SpectrumAnalyzer,
    Vna,
    PowerMeter,
}

impl DeviceType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Oscilloscope => "oscilloscope",
            Self::PowerSupply => "power_supply",
            Self::Multimeter => "multimeter",
            Self::WaveformGenerator => "waveform_generator",
            Self::DcLoad => "dc_load",
            Self::SpectrumAnalyzer => "spectrum_analyzer",
            Self::Vna => "vna",
            Self::PowerMeter => "power_meter",
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Channels and accuracy
// =============================================================================

/// One instrument channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(deny_unknown_fields)]
pub struct ChannelSpec {
    /// 1-based front-panel index. Unique within a profile.
    pub index: u32,

    /// Role label ("analog", "output", "input", …).
    #[serde(default)]
    pub role: String,

    /// Free-form capability tags ("bwl", "50ohm", …).
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Accuracy-table entry: σ = |reading| · percent_reading + offset_value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(deny_unknown_fields)]
pub struct AccuracySpec {
    /// Fraction of reading (0.0005 = 0.05 %).
    #[validate(minimum = 0.0)]
    pub percent_reading: f64,

    /// Constant offset term, in `unit`.
    #[validate(minimum = 0.0)]
    pub offset_value: f64,

    /// Unit both the reading and the offset are expressed in.
    pub unit: String,
}

impl AccuracySpec {
    /// Standard uncertainty for a reading in this mode/range.
    pub fn sigma(&self, reading: f64) -> f64 {
        reading.abs() * self.percent_reading + self.offset_value
    }
}

// =============================================================================
// Safety schema
// =============================================================================

/// Closed interval bound for one quantity. Either side may be open.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(deny_unknown_fields)]
pub struct Bound {
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub min: Option<f64>,
}

impl Bound {
    /// Tightest combination of two bounds.
    pub fn intersect(&self, other: &Bound) -> Bound {
        fn min_opt(a: Option<f64>, b: Option<f64>) -> Option<f64> {
            match (a, b) {
                (Some(x), Some(y)) => Some(x.min(y)),
                (x, None) => x,
                (None, y) => y,
            }
        }
        fn max_opt(a: Option<f64>, b: Option<f64>) -> Option<f64> {
            match (a, b) {
                (Some(x), Some(y)) => Some(x.max(y)),
                (x, None) => x,
                (None, y) => y,
            }
        }
        Bound {
            max: min_opt(self.max, other.max),
            min: max_opt(self.min, other.min),
        }
    }
}

/// Per-channel bound skeleton. Quantity names are the lowercase forms of
/// [`lab_core::Quantity`] ("voltage", "current", "power", "frequency").
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(deny_unknown_fields)]
pub struct SafetySchema {
    #[serde(default)]
    pub channels: BTreeMap<u32, BTreeMap<String, Bound>>,
}

// =============================================================================
// Simulation rules
// =============================================================================

/// A scalar simulator state value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum SimValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl SimValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SimValue::Int(i) => Some(*i as f64),
            SimValue::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl std::fmt::Display for SimValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SimValue::Bool(b) => write!(f, "{}", if *b { 1 } else { 0 }),
            SimValue::Int(i) => write!(f, "{}", i),
            SimValue::Float(v) => write!(f, "{}", v),
            SimValue::Text(s) => f.write_str(s),
        }
    }
}

/// Mutating action of a simulation rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SimAction {
    /// Evaluate `value` and assign it to `target`.
    Set,
}

/// Which state snapshot a combined respond+update rule reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EvalOrder {
    /// Response evaluated against the pre-update state.
    Pre,
    /// Response evaluated after the update has landed (default).
    #[default]
    Post,
}

/// One SCPI dispatch rule. Rules are tried in declared order; the first whose
/// pattern full-matches the command (case-insensitively) wins.
///
/// `response` is a literal unless prefixed with `expr:`, in which case the
/// remainder is evaluated in the sandboxed expression context. `value` is
/// always an expression. Capture groups are available as `g1…gN`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(deny_unknown_fields)]
pub struct SimRule {
    /// Exact command or regex pattern (full match, case-insensitive).
    #[validate(custom(validate_pattern))]
    pub command: String,

    /// Literal response, or `expr:<expression>`.
    #[serde(default)]
    #[validate(custom(validate_optional_expression))]
    pub response: Option<String>,

    #[serde(default)]
    pub action: Option<SimAction>,

    /// State key assigned by a `set` action.
    #[serde(default)]
    pub target: Option<String>,

    /// Value expression for a `set` action.
    #[serde(default)]
    pub value: Option<String>,
}

/// Error-queue emulation rule: after a command matching `scpi`, the condition
/// is evaluated against state and capture groups; when true, the entry is
/// pushed onto the emulated error queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(deny_unknown_fields)]
pub struct SimErrorRule {
    #[validate(custom(validate_pattern))]
    pub scpi: String,

    #[validate(custom(validate_expression))]
    pub condition: String,

    pub code: i32,
    pub message: String,
}

/// Complete simulation definition of a profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(deny_unknown_fields)]
pub struct SimulationConfig {
    /// Initial state, deep-copied per simulator instance.
    #[serde(default)]
    pub state: BTreeMap<String, SimValue>,

    /// Ordered dispatch rules; first match wins.
    #[serde(default)]
    #[validate]
    pub scpi: Vec<SimRule>,

    /// Error-queue emulation rules.
    #[serde(default)]
    #[validate]
    pub errors: Vec<SimErrorRule>,

    #[serde(default)]
    pub response_eval_order: EvalOrder,
}

// =============================================================================
// Waveform/readout declarations
// =============================================================================

/// Waveform transfer format a scope profile declares. The driver refuses to
/// parse a readout whose on-wire format differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum WaveformFormat {
    /// Comma-separated ASCII values.
    #[default]
    Ascii,
    /// IEEE-488.2 definite-length block of u8 samples.
    Byte,
    /// IEEE-488.2 block of u16 little-endian samples.
    Word,
}

/// Endianness for arbitrary-waveform uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

/// Per-device-type readout declarations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(deny_unknown_fields)]
pub struct ReadoutConfig {
    #[serde(default)]
    pub waveform_format: WaveformFormat,

    #[serde(default)]
    pub arb_endianness: Endianness,
}

// =============================================================================
// ProfileSpec
// =============================================================================

/// Parsed instrument profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(deny_unknown_fields)]
pub struct ProfileSpec {
    /// Vendor model identifier ("DSOX1204G").
    #[validate(min_length = 1)]
    pub model_id: String,

    pub device_type: DeviceType,

    #[serde(default)]
    pub manufacturer: Option<String>,

    /// Override for the `*IDN?` identity string in simulation.
    #[serde(default)]
    pub identification: Option<String>,

    #[serde(default)]
    pub channels: Vec<ChannelSpec>,

    /// Mode/range key → accuracy entry ("voltage_dc:10", …).
    #[serde(default)]
    pub accuracy_table: BTreeMap<String, AccuracySpec>,

    /// Hard limits declared by the profile. Benches may only tighten these.
    #[serde(default)]
    pub safety_schema: SafetySchema,

    /// Operation-name → SCPI template overrides (`${placeholder}` syntax).
    #[serde(default)]
    pub scpi: BTreeMap<String, String>,

    /// Queryable settings enumerated for instrument-state snapshots
    /// (configuration signatures). Each entry is a SCPI query.
    #[serde(default)]
    pub settings: Vec<String>,

    #[serde(default)]
    pub readout: ReadoutConfig,

    #[serde(default)]
    #[validate]
    pub simulation: SimulationConfig,
}

impl ProfileSpec {
    pub fn channel(&self, index: u32) -> Option<&ChannelSpec> {
        self.channels.iter().find(|c| c.index == index)
    }

    pub fn accuracy(&self, mode_key: &str) -> Option<&AccuracySpec> {
        self.accuracy_table.get(mode_key)
    }

    pub fn sim_rules(&self) -> &[SimRule] {
        &self.simulation.scpi
    }

    /// SCPI template override for a named operation, if the profile declares
    /// one.
    pub fn command_template(&self, operation: &str) -> Option<&str> {
        self.scpi.get(operation).map(String::as_str)
    }

    /// Identity string used by simulators when no rule overrides `*IDN?`.
    pub fn sim_identity(&self) -> String {
        self.identification.clone().unwrap_or_else(|| {
            format!(
                "Simulated,{},{}-SIM,1.0",
                self.manufacturer.as_deref().unwrap_or("LabKit"),
                self.model_id
            )
        })
    }

    /// Stable SHA-256 fingerprint of the profile content, recorded in
    /// measurement provenance.
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        // canonical JSON keeps map keys sorted
        let canonical =
            serde_json::to_vec(self).expect("profile serialization cannot fail");
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_type_serializes_snake_case() {
        let json = serde_json::to_string(&DeviceType::PowerSupply).unwrap();
        assert_eq!(json, "\"power_supply\"");
        let parsed: DeviceType = serde_json::from_str("\"oscilloscope\"").unwrap();
        assert_eq!(parsed, DeviceType::Oscilloscope);
    }

    #[test]
    fn accuracy_sigma_combines_gain_and_offset() {
        let acc = AccuracySpec {
            percent_reading: 0.001,
            offset_value: 0.005,
            unit: "V".into(),
        };
        assert!((acc.sigma(5.0) - 0.010).abs() < 1e-12);
        assert!((acc.sigma(-5.0) - 0.010).abs() < 1e-12);
    }

    #[test]
    fn bound_intersection_only_tightens() {
        let profile = Bound {
            max: Some(6.0),
            min: Some(0.0),
        };
        let bench = Bound {
            max: Some(5.0),
            min: None,
        };
        let merged = profile.intersect(&bench);
        assert_eq!(merged.max, Some(5.0));
        assert_eq!(merged.min, Some(0.0));

        // a looser bench bound does not widen the profile's
        let loose = Bound {
            max: Some(10.0),
            min: Some(-1.0),
        };
        let merged = profile.intersect(&loose);
        assert_eq!(merged.max, Some(6.0));
        assert_eq!(merged.min, Some(0.0));
    }

    #[test]
    fn sim_value_display_matches_scpi_conventions() {
        assert_eq!(SimValue::Bool(true).to_string(), "1");
        assert_eq!(SimValue::Int(42).to_string(), "42");
        assert_eq!(SimValue::Float(0.5).to_string(), "0.5");
        assert_eq!(SimValue::Text("CH1".into()).to_string(), "CH1");
    }

    #[test]
    fn fingerprint_is_stable_and_content_sensitive() {
        let yaml = r#"
model_id: X100
device_type: multimeter
"#;
        let a: ProfileSpec = serde_yaml::from_str(yaml).unwrap();
        let b: ProfileSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());

        let mut c = a.clone();
        c.model_id = "X200".into();
        assert_ne!(a.fingerprint(), c.fingerprint());
    }
}
