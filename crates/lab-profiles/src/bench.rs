//! Bench descriptor schema.
//!
//! A bench file names a set of instruments, how to reach each one (or that it
//! is simulated), and the safety limits the bench tightens on top of each
//! profile's hard bounds.
//!
//! ```yaml
//! bench_name: psu_bringup
//! simulate: true
//! backend_defaults: { type: visa, timeout_ms: 5000 }
//! instruments:
//!   psu:
//!     profile: keysight/EDU36311A
//!     safety_limits:
//!       channels:
//!         1: { voltage: { max: 6.0 }, current: { max: 1.0 } }
//! ```

use crate::schema::Bound;
use lab_core::ConfigError;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

// =============================================================================
// Backend selection
// =============================================================================

/// Transport family an instrument entry selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendType {
    /// VISA-style hardware transport (requires an address).
    #[default]
    Visa,
    /// Deterministic simulator driven by the profile's rules.
    Sim,
    /// Hardware (or sim) wrapped in a session recorder.
    Record,
    /// Strict replay of a recorded session document.
    Replay,
}

/// Backend settings, at bench scope (`backend_defaults`) or per instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendSettings {
    #[serde(rename = "type", default)]
    pub backend_type: BackendType,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    5_000
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            backend_type: BackendType::Visa,
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Per-instrument backend override: only the fields present replace the
/// bench defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendOverride {
    #[serde(rename = "type", default)]
    pub backend_type: Option<BackendType>,

    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

// =============================================================================
// Safety limits
// =============================================================================

/// Bench-declared limits, merged (tightening only) onto the profile's safety
/// schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SafetyLimits {
    #[serde(default)]
    pub channels: BTreeMap<u32, BTreeMap<String, Bound>>,
}

// =============================================================================
// Instrument entries
// =============================================================================

/// One instrument in a bench.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstrumentEntry {
    /// Catalog key (`keysight/EDU36311A`) or path to a profile file.
    pub profile: String,

    /// VISA resource string. Absent implies simulation.
    #[serde(default)]
    pub address: Option<String>,

    /// Per-instrument override of the global `simulate` flag.
    #[serde(default)]
    pub simulate: Option<bool>,

    #[serde(default)]
    pub backend: Option<BackendOverride>,

    #[serde(default)]
    pub safety_limits: Option<SafetyLimits>,
}

/// Alias → entry map that preserves declaration order (construction order,
/// and therefore reverse shutdown order) and rejects duplicate aliases.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstrumentMap(pub Vec<(String, InstrumentEntry)>);

impl Serialize for InstrumentMap {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (alias, entry) in &self.0 {
            map.serialize_entry(alias, entry)?;
        }
        map.end()
    }
}

impl InstrumentMap {
    pub fn get(&self, alias: &str) -> Option<&InstrumentEntry> {
        self.0
            .iter()
            .find(|(name, _)| name == alias)
            .map(|(_, entry)| entry)
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &InstrumentEntry)> {
        self.0.iter().map(|(name, entry)| (name.as_str(), entry))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for InstrumentMap {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct MapVisitor;

        impl<'de> Visitor<'de> for MapVisitor {
            type Value = InstrumentMap;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a mapping of instrument aliases to entries")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries: Vec<(String, InstrumentEntry)> = Vec::new();
                while let Some((alias, entry)) =
                    access.next_entry::<String, InstrumentEntry>()?
                {
                    if !is_valid_alias(&alias) {
                        return Err(serde::de::Error::custom(format!(
                            "invalid instrument alias '{}': aliases must be identifiers",
                            alias
                        )));
                    }
                    if entries.iter().any(|(existing, _)| *existing == alias) {
                        return Err(serde::de::Error::custom(format!(
                            "duplicate instrument alias '{}'",
                            alias
                        )));
                    }
                    entries.push((alias, entry));
                }
                Ok(InstrumentMap(entries))
            }
        }

        deserializer.deserialize_map(MapVisitor)
    }
}

fn is_valid_alias(alias: &str) -> bool {
    let mut chars = alias.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// =============================================================================
// Experiment metadata and automation hooks
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentMeta {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub operator: Option<String>,
    #[serde(default)]
    pub database_path: Option<String>,
}

/// One automation step: a raw SCPI write against a named instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HookStep {
    pub alias: String,
    pub write: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Automation {
    #[serde(default)]
    pub pre_run: Vec<HookStep>,
    #[serde(default)]
    pub post_run: Vec<HookStep>,
}

// =============================================================================
// BenchDescriptor
// =============================================================================

/// Parsed bench YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BenchDescriptor {
    pub bench_name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Global simulate flag; per-entry `simulate` overrides it, and the
    /// `LABKIT_FORCE_SIMULATE` environment override beats both.
    #[serde(default)]
    pub simulate: bool,

    #[serde(default)]
    pub backend_defaults: BackendSettings,

    pub instruments: InstrumentMap,

    #[serde(default)]
    pub experiment: Option<ExperimentMeta>,

    #[serde(default)]
    pub automation: Option<Automation>,
}

impl BenchDescriptor {
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let descriptor: BenchDescriptor =
            serde_yaml::from_str(text).map_err(|e| ConfigError::Parse {
                path: "<inline>".to_string(),
                reason: e.to_string(),
            })?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let descriptor: BenchDescriptor =
            serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.instruments.is_empty() {
            return Err(ConfigError::Invalid {
                message: format!("bench '{}' declares no instruments", self.bench_name),
            });
        }
        if let Some(automation) = &self.automation {
            for step in automation.pre_run.iter().chain(&automation.post_run) {
                if self.instruments.get(&step.alias).is_none() {
                    return Err(ConfigError::UnknownAlias {
                        alias: step.alias.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Effective backend settings for one entry (entry override on top of
    /// bench defaults).
    pub fn effective_backend(&self, entry: &InstrumentEntry) -> BackendSettings {
        let mut settings = self.backend_defaults.clone();
        if let Some(override_) = &entry.backend {
            if let Some(backend_type) = override_.backend_type {
                settings.backend_type = backend_type;
            }
            if let Some(timeout_ms) = override_.timeout_ms {
                settings.timeout_ms = timeout_ms;
            }
        }
        settings
    }

    /// Copy of this bench with every instrument forced into simulation
    /// (the `bench sim` CLI command).
    pub fn to_simulated(&self) -> BenchDescriptor {
        let mut copy = self.clone();
        copy.simulate = true;
        copy.backend_defaults.backend_type = BackendType::Sim;
        for (_, entry) in copy.instruments.0.iter_mut() {
            entry.simulate = Some(true);
            entry.address = None;
            if let Some(backend) = entry.backend.as_mut() {
                backend.backend_type = Some(BackendType::Sim);
            }
        }
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BENCH: &str = r#"
bench_name: bringup
simulate: true
backend_defaults: { type: visa, timeout_ms: 4000 }
instruments:
  psu:
    profile: keysight/EDU36311A
    safety_limits:
      channels:
        1: { voltage: { max: 6.0 } }
  dmm:
    profile: keysight/EDU34450A
    backend: { timeout_ms: 8000 }
"#;

    #[test]
    fn bench_parses_and_preserves_declaration_order() {
        let bench = BenchDescriptor::from_yaml_str(BENCH).unwrap();
        assert_eq!(bench.bench_name, "bringup");
        let aliases: Vec<&str> = bench.instruments.aliases().collect();
        assert_eq!(aliases, vec!["psu", "dmm"]);
    }

    #[test]
    fn duplicate_alias_is_rejected() {
        let yaml = r#"
bench_name: dup
instruments:
  psu: { profile: a }
  psu: { profile: b }
"#;
        assert!(BenchDescriptor::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn invalid_alias_is_rejected() {
        let yaml = r#"
bench_name: bad
instruments:
  "2psu": { profile: a }
"#;
        assert!(BenchDescriptor::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn backend_override_merges_onto_defaults() {
        let bench = BenchDescriptor::from_yaml_str(BENCH).unwrap();
        let dmm = bench.instruments.get("dmm").unwrap();
        let effective = bench.effective_backend(dmm);
        assert_eq!(effective.backend_type, BackendType::Visa);
        assert_eq!(effective.timeout_ms, 8000);

        let psu = bench.instruments.get("psu").unwrap();
        assert_eq!(bench.effective_backend(psu).timeout_ms, 4000);
    }

    #[test]
    fn simulated_copy_strips_addresses() {
        let yaml = r#"
bench_name: hw
instruments:
  psu:
    profile: keysight/EDU36311A
    address: "TCPIP0::10.0.0.5::5025::SOCKET"
"#;
        let bench = BenchDescriptor::from_yaml_str(yaml).unwrap();
        let sim = bench.to_simulated();
        assert!(sim.simulate);
        let entry = sim.instruments.get("psu").unwrap();
        assert_eq!(entry.address, None);
        assert_eq!(entry.simulate, Some(true));
    }

    #[test]
    fn automation_hooks_must_reference_known_aliases() {
        let yaml = r#"
bench_name: hooked
instruments:
  psu: { profile: keysight/EDU36311A }
automation:
  pre_run:
    - { alias: nope, write: "*RST" }
"#;
        let err = BenchDescriptor::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownAlias { .. }));
    }
}
