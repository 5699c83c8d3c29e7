//! Profile loading and catalog resolution.
//!
//! Profiles are referenced either by a namespaced catalog key
//! (`keysight/DSOX1204G`) resolved against the built-in catalog, or by a
//! filesystem path. A user override directory may shadow or extend built-in
//! profiles; overrides are deep-merged on top of the shipped profile so a
//! local tweak to one simulation rule does not fork the whole file.
//!
//! Two simulation rule shapes exist in the wild. The current shape is an
//! ordered rule list; the older backend used a plain `command -> response`
//! mapping. The loader detects the legacy shape and migrates it to exact-match
//! literal rules before typed parsing, so old profiles keep working and are
//! never silently misread.

use crate::schema::ProfileSpec;
use crate::validation::validate_profile;
use lab_core::ProfileError;
use serde_valid::Validate;
use std::path::{Path, PathBuf};

/// Built-in profile catalog, embedded at compile time.
static BUILTIN_PROFILES: &[(&str, &str)] = &[
    (
        "keysight/DSOX1204G",
        include_str!("../profiles/keysight/DSOX1204G.yaml"),
    ),
    (
        "keysight/EDU36311A",
        include_str!("../profiles/keysight/EDU36311A.yaml"),
    ),
    (
        "keysight/EDU34450A",
        include_str!("../profiles/keysight/EDU34450A.yaml"),
    ),
    (
        "keysight/EDU33212A",
        include_str!("../profiles/keysight/EDU33212A.yaml"),
    ),
    (
        "keysight/EL34243A",
        include_str!("../profiles/keysight/EL34243A.yaml"),
    ),
    (
        "keysight/N9320B",
        include_str!("../profiles/keysight/N9320B.yaml"),
    ),
    (
        "keysight/E5061B",
        include_str!("../profiles/keysight/E5061B.yaml"),
    ),
    (
        "keysight/U2000A",
        include_str!("../profiles/keysight/U2000A.yaml"),
    ),
];

/// Resolves profile references against the built-in catalog, an optional
/// override directory, and the filesystem.
#[derive(Debug, Clone, Default)]
pub struct ProfileCatalog {
    override_dir: Option<PathBuf>,
}

impl ProfileCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shadow built-in profiles with files under `dir` (same relative layout:
    /// `<dir>/keysight/DSOX1204G.yaml`). Override files are deep-merged onto
    /// the built-in content.
    pub fn with_override_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.override_dir = Some(dir.into());
        self
    }

    /// Path a user override for `key` would live at, if an override directory
    /// is configured.
    pub fn override_path(&self, key: &str) -> Option<PathBuf> {
        self.override_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.yaml", key)))
    }

    /// All built-in catalog keys, in catalog order.
    pub fn builtin_keys() -> Vec<&'static str> {
        BUILTIN_PROFILES.iter().map(|(k, _)| *k).collect()
    }

    /// Raw built-in YAML for `key`, if shipped.
    pub fn builtin_source(key: &str) -> Option<&'static str> {
        BUILTIN_PROFILES
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, src)| *src)
    }

    /// Load and validate the profile referenced by `reference`: a catalog key
    /// when one matches, otherwise a filesystem path.
    pub fn load(&self, reference: &str) -> Result<ProfileSpec, ProfileError> {
        if let Some(builtin) = Self::builtin_source(reference) {
            let mut doc = parse_yaml(reference, builtin)?;
            if let Some(override_path) = self.override_path(reference) {
                if override_path.exists() {
                    let text = std::fs::read_to_string(&override_path)?;
                    let user = parse_yaml(reference, &text)?;
                    tracing::info!(
                        profile = reference,
                        path = %override_path.display(),
                        "merging user override into built-in profile"
                    );
                    doc = deep_merge(doc, user);
                }
            }
            return finish(reference, doc);
        }

        let path = Path::new(reference);
        if path.exists() {
            let text = std::fs::read_to_string(path)?;
            let doc = parse_yaml(reference, &text)?;
            return finish(reference, doc);
        }

        Err(ProfileError::UnknownProfile {
            key: reference.to_string(),
        })
    }

    /// Parse a profile from in-memory YAML (used by tests and the recorder).
    pub fn load_str(name: &str, yaml: &str) -> Result<ProfileSpec, ProfileError> {
        finish(name, parse_yaml(name, yaml)?)
    }
}

fn parse_yaml(name: &str, text: &str) -> Result<serde_yaml::Value, ProfileError> {
    serde_yaml::from_str(text).map_err(|e| ProfileError::Parse {
        profile: name.to_string(),
        reason: e.to_string(),
    })
}

fn finish(name: &str, mut doc: serde_yaml::Value) -> Result<ProfileSpec, ProfileError> {
    migrate_legacy_rules(name, &mut doc)?;
    let spec: ProfileSpec =
        serde_yaml::from_value(doc).map_err(|e| ProfileError::Parse {
            profile: name.to_string(),
            reason: e.to_string(),
        })?;
    spec.validate().map_err(|e| ProfileError::Invalid {
        profile: name.to_string(),
        message: e.to_string(),
    })?;
    validate_profile(&spec, name)?;
    Ok(spec)
}

/// Rewrite a legacy `simulation.scpi` mapping into the ordered rule list.
/// Mapping entries become exact-match literal responses in declaration order.
fn migrate_legacy_rules(name: &str, doc: &mut serde_yaml::Value) -> Result<(), ProfileError> {
    let Some(scpi) = doc
        .get_mut("simulation")
        .and_then(|sim| sim.get_mut("scpi"))
    else {
        return Ok(());
    };

    match scpi {
        serde_yaml::Value::Sequence(_) => Ok(()),
        serde_yaml::Value::Mapping(map) => {
            tracing::warn!(
                profile = name,
                rules = map.len(),
                "migrating legacy command->response simulation mapping to ordered rules"
            );
            let mut rules = Vec::with_capacity(map.len());
            for (command, response) in map.iter() {
                let (Some(command), Some(response)) =
                    (command.as_str(), response.as_str())
                else {
                    return Err(ProfileError::Invalid {
                        profile: name.to_string(),
                        message: "legacy simulation mapping entries must be string -> string"
                            .to_string(),
                    });
                };
                let mut rule = serde_yaml::Mapping::new();
                rule.insert(
                    serde_yaml::Value::from("command"),
                    serde_yaml::Value::from(regex::escape(command)),
                );
                rule.insert(
                    serde_yaml::Value::from("response"),
                    serde_yaml::Value::from(response),
                );
                rules.push(serde_yaml::Value::Mapping(rule));
            }
            *scpi = serde_yaml::Value::Sequence(rules);
            Ok(())
        }
        _ => Err(ProfileError::Invalid {
            profile: name.to_string(),
            message: "simulation.scpi must be a rule list (or a legacy mapping)".to_string(),
        }),
    }
}

/// Recursively merge `overlay` into `base`. Mappings merge key-wise; any
/// other overlay value replaces the base value wholesale.
fn deep_merge(base: serde_yaml::Value, overlay: serde_yaml::Value) -> serde_yaml::Value {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(mut base_map), serde_yaml::Value::Mapping(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value,
                };
                base_map.insert(key, merged);
            }
            serde_yaml::Value::Mapping(base_map)
        }
        (_, overlay) => overlay,
    }
}

/// Unified diff-style listing of the keys an override changes, for
/// `sim-profile diff`.
pub fn override_diff(base: &serde_yaml::Value, overlay: &serde_yaml::Value) -> Vec<String> {
    let mut changes = Vec::new();
    diff_into("", base, overlay, &mut changes);
    changes
}

fn diff_into(
    prefix: &str,
    base: &serde_yaml::Value,
    overlay: &serde_yaml::Value,
    out: &mut Vec<String>,
) {
    match overlay {
        serde_yaml::Value::Mapping(map) => {
            for (key, overlay_value) in map {
                let key_str = key.as_str().unwrap_or("?");
                let path = if prefix.is_empty() {
                    key_str.to_string()
                } else {
                    format!("{}.{}", prefix, key_str)
                };
                let base_value = match base {
                    serde_yaml::Value::Mapping(base_map) => base_map.get(key),
                    _ => None,
                };
                match base_value {
                    Some(base_value) => diff_into(&path, base_value, overlay_value, out),
                    None => out.push(format!("+ {}", path)),
                }
            }
        }
        _ => {
            if base != overlay {
                out.push(format!("~ {}", prefix));
            }
        }
    }
}

/// Convenience: resolve a reference with the default catalog (no overrides).
pub fn load_profile(reference: &str) -> Result<ProfileSpec, ProfileError> {
    ProfileCatalog::new().load(reference)
}

#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub key: String,
    pub model_id: String,
    pub device_type: String,
}

/// Parse every built-in profile (used by `bench ls` and the test suite to
/// keep the shipped catalog valid).
pub fn builtin_catalog() -> Result<Vec<CatalogEntry>, ProfileError> {
    let mut entries = Vec::new();
    for (key, _) in BUILTIN_PROFILES {
        let spec = load_profile(key)?;
        entries.push(CatalogEntry {
            key: key.to_string(),
            model_id: spec.model_id.clone(),
            device_type: spec.device_type.to_string(),
        });
    }
    Ok(entries)
}

/// Deep-merge two parsed YAML documents (exposed for the sim-profile CLI).
pub fn merge_documents(
    base: serde_yaml::Value,
    overlay: serde_yaml::Value,
) -> serde_yaml::Value {
    deep_merge(base, overlay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::DeviceType;

    #[test]
    fn every_builtin_profile_parses_and_validates() {
        let entries = builtin_catalog().unwrap();
        assert_eq!(entries.len(), BUILTIN_PROFILES.len());
        assert!(entries.iter().any(|e| e.key == "keysight/DSOX1204G"));
    }

    #[test]
    fn unknown_reference_is_a_typed_error() {
        let err = load_profile("keysight/NOPE9000").unwrap_err();
        assert!(matches!(err, ProfileError::UnknownProfile { .. }));
    }

    #[test]
    fn catalog_key_resolves_to_the_right_device_type() {
        let scope = load_profile("keysight/DSOX1204G").unwrap();
        assert_eq!(scope.device_type, DeviceType::Oscilloscope);
        let psu = load_profile("keysight/EDU36311A").unwrap();
        assert_eq!(psu.device_type, DeviceType::PowerSupply);
    }

    #[test]
    fn legacy_mapping_rules_are_migrated_in_order() {
        let yaml = r#"
model_id: OLD1
device_type: multimeter
simulation:
  state: {}
  scpi:
    "*IDN?": "Old,Model,1,0"
    ":MEAS:VOLT:DC?": "1.25"
"#;
        let spec = ProfileCatalog::load_str("legacy", yaml).unwrap();
        assert_eq!(spec.simulation.scpi.len(), 2);
        // exact commands are regex-escaped so `?` and `*` match literally
        assert_eq!(spec.simulation.scpi[0].command, regex::escape("*IDN?"));
        assert_eq!(
            spec.simulation.scpi[0].response.as_deref(),
            Some("Old,Model,1,0")
        );
    }

    #[test]
    fn mixed_legacy_scalar_shape_is_rejected() {
        let yaml = r#"
model_id: BAD1
device_type: multimeter
simulation:
  scpi: "not a rule set"
"#;
        let err = ProfileCatalog::load_str("bad", yaml).unwrap_err();
        assert!(matches!(err, ProfileError::Invalid { .. }));
    }

    #[test]
    fn deep_merge_overrides_scalars_and_keeps_siblings() {
        let base: serde_yaml::Value =
            serde_yaml::from_str("a: {x: 1, y: 2}\nb: 3").unwrap();
        let overlay: serde_yaml::Value = serde_yaml::from_str("a: {y: 9}").unwrap();
        let merged = deep_merge(base, overlay);
        assert_eq!(merged["a"]["x"], serde_yaml::Value::from(1));
        assert_eq!(merged["a"]["y"], serde_yaml::Value::from(9));
        assert_eq!(merged["b"], serde_yaml::Value::from(3));
    }

    #[test]
    fn override_diff_reports_changed_and_added_keys() {
        let base: serde_yaml::Value =
            serde_yaml::from_str("a: {x: 1}\nb: 2").unwrap();
        let overlay: serde_yaml::Value =
            serde_yaml::from_str("a: {x: 5, z: 1}").unwrap();
        let diff = override_diff(&base, &overlay);
        assert!(diff.contains(&"~ a.x".to_string()));
        assert!(diff.contains(&"+ a.z".to_string()));
    }
}
