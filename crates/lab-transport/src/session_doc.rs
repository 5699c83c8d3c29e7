//! Session documents for record/replay.
//!
//! One document per bench, keyed by instrument alias. Invariants: log order
//! is chronological, `query` entries always carry a response, `write` entries
//! never do. [`SessionDocument::validate`] enforces them on load so a replay
//! never starts from a corrupt recording.

use lab_core::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Kind of a recorded transport call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Write,
    Query,
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryKind::Write => f.write_str("write"),
            EntryKind::Query => f.write_str("query"),
        }
    }
}

/// One recorded transport call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(rename = "type")]
    pub kind: EntryKind,

    pub command: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,

    /// Seconds since the session's monotonic origin.
    pub timestamp: f64,
}

impl LogEntry {
    pub fn write(command: impl Into<String>, timestamp: f64) -> Self {
        Self {
            kind: EntryKind::Write,
            command: command.into(),
            response: None,
            timestamp,
        }
    }

    pub fn query(
        command: impl Into<String>,
        response: impl Into<String>,
        timestamp: f64,
    ) -> Self {
        Self {
            kind: EntryKind::Query,
            command: command.into(),
            response: Some(response.into()),
            timestamp,
        }
    }

    /// Compact display used in replay mismatch messages.
    pub fn describe(&self) -> String {
        format!("{} '{}'", self.kind, self.command)
    }
}

/// Recorded traffic of one instrument.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSession {
    /// Profile reference the instrument was built from.
    pub profile: String,

    #[serde(default)]
    pub log: Vec<LogEntry>,
}

/// One bench's recorded session, keyed by alias.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionDocument(pub BTreeMap<String, InstrumentSession>);

impl SessionDocument {
    pub fn instrument(&self, alias: &str) -> Option<&InstrumentSession> {
        self.0.get(alias)
    }

    pub fn insert(&mut self, alias: impl Into<String>, session: InstrumentSession) {
        self.0.insert(alias.into(), session);
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let doc: SessionDocument =
            serde_yaml::from_str(text).map_err(|e| ConfigError::Parse {
                path: "<inline>".to_string(),
                reason: e.to_string(),
            })?;
        doc.validate()?;
        Ok(doc)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let doc: SessionDocument =
            serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        doc.validate()?;
        Ok(doc)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let text = serde_yaml::to_string(self).map_err(|e| ConfigError::Invalid {
            message: format!("failed to serialize session document: {}", e),
        })?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Enforce the session-document invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (alias, session) in &self.0 {
            let mut last_ts = f64::NEG_INFINITY;
            for (i, entry) in session.log.iter().enumerate() {
                match entry.kind {
                    EntryKind::Query if entry.response.is_none() => {
                        return Err(ConfigError::Invalid {
                            message: format!(
                                "session '{}' entry {}: query without response",
                                alias, i
                            ),
                        });
                    }
                    EntryKind::Write if entry.response.is_some() => {
                        return Err(ConfigError::Invalid {
                            message: format!(
                                "session '{}' entry {}: write carries a response",
                                alias, i
                            ),
                        });
                    }
                    _ => {}
                }
                if entry.timestamp < last_ts {
                    return Err(ConfigError::Invalid {
                        message: format!(
                            "session '{}' entry {}: timestamps run backwards",
                            alias, i
                        ),
                    });
                }
                last_ts = entry.timestamp;
            }
        }
        Ok(())
    }
}
