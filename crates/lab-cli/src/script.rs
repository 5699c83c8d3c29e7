//! Script files for `replay record` and `replay run`.
//!
//! A script is an ordered YAML list of raw SCPI steps against bench aliases:
//!
//! ```yaml
//! - { alias: scope, write: ":CHAN1:SCAL 0.5" }
//! - { alias: scope, query: ":CHAN1:SCAL?" }
//! ```

use lab_core::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One raw SCPI step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptStep {
    pub alias: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

impl ScriptStep {
    pub fn validate(&self, index: usize) -> Result<(), ConfigError> {
        match (&self.write, &self.query) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            _ => Err(ConfigError::Invalid {
                message: format!(
                    "script step {}: exactly one of 'write' or 'query' is required",
                    index
                ),
            }),
        }
    }
}

/// Ordered script.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Script(pub Vec<ScriptStep>);

impl Script {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text, &path.display().to_string())
    }

    pub fn from_yaml_str(text: &str, origin: &str) -> Result<Self, ConfigError> {
        let script: Script = serde_yaml::from_str(text).map_err(|e| ConfigError::Parse {
            path: origin.to_string(),
            reason: e.to_string(),
        })?;
        for (i, step) in script.0.iter().enumerate() {
            step.validate(i)?;
        }
        Ok(script)
    }

    pub fn steps(&self) -> &[ScriptStep] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripts_parse_and_validate() {
        let script = Script::from_yaml_str(
            r#"
- { alias: psu, write: ":SOUR1:VOLT 2.5" }
- { alias: psu, query: ":SOUR1:VOLT?" }
"#,
            "<test>",
        )
        .unwrap();
        assert_eq!(script.steps().len(), 2);
        assert_eq!(script.steps()[0].write.as_deref(), Some(":SOUR1:VOLT 2.5"));
    }

    #[test]
    fn steps_with_both_or_neither_verb_are_rejected() {
        assert!(Script::from_yaml_str("- { alias: psu }", "<test>").is_err());
        assert!(Script::from_yaml_str(
            "- { alias: psu, write: a, query: b }",
            "<test>"
        )
        .is_err());
    }
}
