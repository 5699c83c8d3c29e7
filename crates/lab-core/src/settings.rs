//! Runtime settings.
//!
//! Settings are resolved once, when a bench is opened, from three layers:
//! built-in defaults, an optional settings file, and `LABKIT_*` environment
//! variables (highest precedence). `LABKIT_FORCE_SIMULATE=1` forces every
//! instrument into simulation regardless of what the bench descriptor says.

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::Path;

/// Environment prefix for overrides (`LABKIT_FORCE_SIMULATE`,
/// `LABKIT_QUERY_TIMEOUT_MS`, …).
pub const ENV_PREFIX: &str = "LABKIT";

/// Resolved runtime settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Force every instrument into simulation, overriding the bench
    /// descriptor. Driven by `LABKIT_FORCE_SIMULATE`.
    pub force_simulate: bool,
    /// Per-query transport timeout in milliseconds.
    pub query_timeout_ms: u64,
    /// Per-connect transport timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Grace period granted to background tasks after cancellation, in
    /// milliseconds.
    pub task_grace_ms: u64,
    /// Treat un-consumed trailing replay entries as fatal.
    pub replay_strict_trailing: bool,
    /// Fail simulated queries that match no rule instead of returning "".
    pub sim_strict: bool,
    /// Append-only audit log path.
    pub audit_log_path: String,
    /// Actor recorded in provenance and audit entries.
    pub actor: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            force_simulate: false,
            query_timeout_ms: 5_000,
            connect_timeout_ms: 10_000,
            task_grace_ms: 2_000,
            replay_strict_trailing: false,
            sim_strict: false,
            audit_log_path: "labkit-audit.log".to_string(),
            actor: whoami(),
        }
    }
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "labkit".to_string())
}

impl Settings {
    /// Defaults + environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None::<&Path>)
    }

    /// Defaults + optional settings file + environment overrides.
    pub fn load_from(file: Option<impl AsRef<Path>>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(
                config::File::from(path.as_ref()).required(false),
            );
        }
        let resolved = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX))
            .build()?;

        let mut settings = Settings::default();
        if let Ok(v) = resolved.get_bool("force_simulate") {
            settings.force_simulate = v;
        }
        if let Ok(v) = resolved.get_int("query_timeout_ms") {
            settings.query_timeout_ms = v.max(1) as u64;
        }
        if let Ok(v) = resolved.get_int("connect_timeout_ms") {
            settings.connect_timeout_ms = v.max(1) as u64;
        }
        if let Ok(v) = resolved.get_int("task_grace_ms") {
            settings.task_grace_ms = v.max(0) as u64;
        }
        if let Ok(v) = resolved.get_bool("replay_strict_trailing") {
            settings.replay_strict_trailing = v;
        }
        if let Ok(v) = resolved.get_bool("sim_strict") {
            settings.sim_strict = v;
        }
        if let Ok(v) = resolved.get_string("audit_log_path") {
            settings.audit_log_path = v;
        }
        if let Ok(v) = resolved.get_string("actor") {
            settings.actor = v;
        }
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_timeouts() {
        let s = Settings::default();
        assert_eq!(s.query_timeout_ms, 5_000);
        assert_eq!(s.connect_timeout_ms, 10_000);
        assert_eq!(s.task_grace_ms, 2_000);
        assert!(!s.force_simulate);
        assert!(!s.sim_strict);
    }
}
