//! Custom validation for profiles and bench descriptors.
//!
//! Field-level validators plug into `serde_valid` (`#[validate(custom(...))]`)
//! and compile every regex pattern and expression at load time, so a profile
//! that parses is a profile whose rules will dispatch. Cross-field invariants
//! (unique channel indices, safety references, …) live in
//! [`validate_profile`].

use crate::schema::ProfileSpec;
use lab_core::ProfileError;
use serde_valid::validation::Error as ValidationError;

/// Quantity names a safety schema may reference.
pub const KNOWN_QUANTITIES: &[&str] = &["voltage", "current", "power", "frequency"];

/// Validate that a string compiles as a (case-insensitive, full-match)
/// dispatch pattern.
pub fn validate_pattern(pattern: &String) -> Result<(), ValidationError> {
    match regex::RegexBuilder::new(pattern).case_insensitive(true).build() {
        Ok(_) => Ok(()),
        Err(e) => Err(ValidationError::Custom(format!(
            "invalid pattern '{}': {}",
            pattern, e
        ))),
    }
}

/// Validate an `evalexpr` expression without evaluating it.
pub fn validate_expression(expr: &String) -> Result<(), ValidationError> {
    match evalexpr::build_operator_tree(expr) {
        Ok(_) => Ok(()),
        Err(e) => Err(ValidationError::Custom(format!(
            "invalid expression '{}': {}",
            expr, e
        ))),
    }
}

/// Validate a response field: literals pass as-is, `expr:`-prefixed strings
/// must parse as expressions.
pub fn validate_optional_expression(response: &Option<String>) -> Result<(), ValidationError> {
    if let Some(text) = response {
        if let Some(expr) = text.strip_prefix("expr:") {
            return validate_expression(&expr.to_string());
        }
    }
    Ok(())
}

/// Cross-field profile invariants, checked after parsing:
///
/// - channel indices are unique;
/// - the safety schema only references existing channels and known quantities;
/// - `set` rules carry both `target` and `value`;
/// - every rule either responds or acts (dead rules are rejected).
pub fn validate_profile(spec: &ProfileSpec, profile_name: &str) -> Result<(), ProfileError> {
    let name = || profile_name.to_string();

    let mut seen = std::collections::BTreeSet::new();
    for channel in &spec.channels {
        if !seen.insert(channel.index) {
            return Err(ProfileError::DuplicateChannel {
                profile: name(),
                index: channel.index,
            });
        }
    }

    for (&index, quantities) in &spec.safety_schema.channels {
        if spec.channel(index).is_none() {
            return Err(ProfileError::UnknownSafetyChannel {
                profile: name(),
                index,
            });
        }
        for quantity in quantities.keys() {
            if !KNOWN_QUANTITIES.contains(&quantity.as_str()) {
                return Err(ProfileError::Invalid {
                    profile: name(),
                    message: format!(
                        "safety schema channel {} references unknown quantity '{}'",
                        index, quantity
                    ),
                });
            }
        }
        for (quantity, bound) in quantities {
            if let (Some(min), Some(max)) = (bound.min, bound.max) {
                if min > max {
                    return Err(ProfileError::Invalid {
                        profile: name(),
                        message: format!(
                            "safety schema channel {} {}: min {} exceeds max {}",
                            index, quantity, min, max
                        ),
                    });
                }
            }
        }
    }

    for rule in &spec.simulation.scpi {
        if let Err(e) = regex::RegexBuilder::new(&rule.command)
            .case_insensitive(true)
            .build()
        {
            return Err(ProfileError::BadPattern {
                profile: name(),
                pattern: rule.command.clone(),
                reason: e.to_string(),
            });
        }
        let is_set = rule.action.is_some();
        if is_set && (rule.target.is_none() || rule.value.is_none()) {
            return Err(ProfileError::Invalid {
                profile: name(),
                message: format!(
                    "rule '{}': set action requires both 'target' and 'value'",
                    rule.command
                ),
            });
        }
        if !is_set && rule.response.is_none() {
            return Err(ProfileError::Invalid {
                profile: name(),
                message: format!(
                    "rule '{}' neither responds nor updates state",
                    rule.command
                ),
            });
        }
        if let Some(value) = &rule.value {
            if let Err(e) = evalexpr::build_operator_tree(value) {
                return Err(ProfileError::BadExpression {
                    profile: name(),
                    expr: value.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    for rule in &spec.simulation.errors {
        if let Err(e) = regex::RegexBuilder::new(&rule.scpi)
            .case_insensitive(true)
            .build()
        {
            return Err(ProfileError::BadPattern {
                profile: name(),
                pattern: rule.scpi.clone(),
                reason: e.to_string(),
            });
        }
        if let Err(e) = evalexpr::build_operator_tree(&rule.condition) {
            return Err(ProfileError::BadExpression {
                profile: name(),
                expr: rule.condition.clone(),
                reason: e.to_string(),
            });
        }
    }

    Ok(())
}
