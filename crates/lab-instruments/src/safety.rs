//! Safety overlay.
//!
//! Every operation that takes a physical quantity is checked against the
//! merged limits before any bytes reach the wire. The overlay is the
//! intersection of the profile's hard schema and the bench's declared limits:
//! a bench can only tighten, never widen, a profile bound.

use lab_core::{ConfigError, Quantity, SafetyLimitError};
use lab_profiles::{Bound, SafetyLimits, SafetySchema};
use std::collections::BTreeMap;

fn parse_quantity(name: &str) -> Option<Quantity> {
    match name {
        "voltage" => Some(Quantity::Voltage),
        "current" => Some(Quantity::Current),
        "power" => Some(Quantity::Power),
        "frequency" => Some(Quantity::Frequency),
        _ => None,
    }
}

/// Merged per-instrument limits.
#[derive(Debug, Clone, Default)]
pub struct SafetyOverlay {
    alias: String,
    limits: BTreeMap<(u32, Quantity), Bound>,
}

impl SafetyOverlay {
    /// Merge bench limits onto the profile schema. Fails with
    /// [`ConfigError::LimitWidened`] when the bench tries to loosen a profile
    /// bound.
    pub fn build(
        bench_name: &str,
        alias: &str,
        schema: &SafetySchema,
        bench_limits: Option<&SafetyLimits>,
    ) -> Result<Self, ConfigError> {
        let mut limits: BTreeMap<(u32, Quantity), Bound> = BTreeMap::new();

        for (&channel, quantities) in &schema.channels {
            for (name, bound) in quantities {
                if let Some(quantity) = parse_quantity(name) {
                    limits.insert((channel, quantity), *bound);
                }
            }
        }

        if let Some(bench) = bench_limits {
            for (&channel, quantities) in &bench.channels {
                for (name, bench_bound) in quantities {
                    let Some(quantity) = parse_quantity(name) else {
                        return Err(ConfigError::Invalid {
                            message: format!(
                                "bench '{}' instrument '{}': unknown quantity '{}'",
                                bench_name, alias, name
                            ),
                        });
                    };
                    let key = (channel, quantity);
                    if let Some(profile_bound) = limits.get(&key) {
                        if let (Some(requested), Some(hard)) =
                            (bench_bound.max, profile_bound.max)
                        {
                            if requested > hard {
                                return Err(ConfigError::LimitWidened {
                                    bench: bench_name.to_string(),
                                    alias: alias.to_string(),
                                    channel,
                                    quantity: quantity.to_string(),
                                    requested,
                                    profile_bound: hard,
                                });
                            }
                        }
                        if let (Some(requested), Some(hard)) =
                            (bench_bound.min, profile_bound.min)
                        {
                            if requested < hard {
                                return Err(ConfigError::LimitWidened {
                                    bench: bench_name.to_string(),
                                    alias: alias.to_string(),
                                    channel,
                                    quantity: quantity.to_string(),
                                    requested,
                                    profile_bound: hard,
                                });
                            }
                        }
                        let merged = profile_bound.intersect(bench_bound);
                        limits.insert(key, merged);
                    } else {
                        limits.insert(key, *bench_bound);
                    }
                }
            }
        }

        Ok(Self {
            alias: alias.to_string(),
            limits,
        })
    }

    /// Overlay with no limits (direct driver construction without a bench).
    pub fn unrestricted(alias: &str) -> Self {
        Self {
            alias: alias.to_string(),
            limits: BTreeMap::new(),
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Reject `value` if it falls outside the merged bound for
    /// `(channel, quantity)`. Quantities without a bound pass.
    pub fn check(
        &self,
        channel: u32,
        quantity: Quantity,
        value: f64,
    ) -> Result<(), SafetyLimitError> {
        let Some(bound) = self.limits.get(&(channel, quantity)) else {
            return Ok(());
        };
        if let Some(max) = bound.max {
            if value > max {
                return Err(SafetyLimitError {
                    alias: self.alias.clone(),
                    channel,
                    quantity,
                    value,
                    bound: max,
                });
            }
        }
        if let Some(min) = bound.min {
            if value < min {
                return Err(SafetyLimitError {
                    alias: self.alias.clone(),
                    channel,
                    quantity,
                    value,
                    bound: min,
                });
            }
        }
        Ok(())
    }

    /// The effective bound for a channel/quantity, if any.
    pub fn bound(&self, channel: u32, quantity: Quantity) -> Option<&Bound> {
        self.limits.get(&(channel, quantity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(yaml: &str) -> SafetySchema {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn bench_limits(yaml: &str) -> SafetyLimits {
        serde_yaml::from_str(yaml).unwrap()
    }

    const PROFILE_SCHEMA: &str = r#"
channels:
  1:
    voltage: { max: 30.0, min: 0.0 }
    current: { max: 5.0, min: 0.0 }
"#;

    #[test]
    fn bench_limits_tighten_the_profile_schema() {
        let overlay = SafetyOverlay::build(
            "bench",
            "psu",
            &schema(PROFILE_SCHEMA),
            Some(&bench_limits("channels: { 1: { voltage: { max: 6.0 } } }")),
        )
        .unwrap();

        assert!(overlay.check(1, Quantity::Voltage, 5.0).is_ok());
        let err = overlay.check(1, Quantity::Voltage, 7.0).unwrap_err();
        assert_eq!(err.bound, 6.0);
        assert_eq!(err.value, 7.0);
        assert_eq!(err.channel, 1);
        assert_eq!(err.alias, "psu");
    }

    #[test]
    fn widening_a_profile_bound_is_rejected() {
        let err = SafetyOverlay::build(
            "bench",
            "psu",
            &schema(PROFILE_SCHEMA),
            Some(&bench_limits("channels: { 1: { voltage: { max: 60.0 } } }")),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::LimitWidened { .. }));
    }

    #[test]
    fn minimum_bounds_are_enforced() {
        let overlay =
            SafetyOverlay::build("bench", "psu", &schema(PROFILE_SCHEMA), None).unwrap();
        let err = overlay.check(1, Quantity::Voltage, -0.5).unwrap_err();
        assert_eq!(err.bound, 0.0);
    }

    #[test]
    fn unbounded_quantities_pass() {
        let overlay =
            SafetyOverlay::build("bench", "psu", &schema(PROFILE_SCHEMA), None).unwrap();
        assert!(overlay.check(2, Quantity::Voltage, 1000.0).is_ok());
        assert!(overlay.check(1, Quantity::Frequency, 1.0e9).is_ok());
    }

    #[test]
    fn bench_only_limits_apply_where_profile_is_silent() {
        let overlay = SafetyOverlay::build(
            "bench",
            "awg",
            &SafetySchema::default(),
            Some(&bench_limits("channels: { 1: { voltage: { max: 2.0 } } }")),
        )
        .unwrap();
        assert!(overlay.check(1, Quantity::Voltage, 3.0).is_err());
    }
}
