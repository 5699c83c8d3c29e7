//! Strict-sequence replay transport.
//!
//! Plays back one instrument's recorded log. Every call must match the next
//! entry byte-for-byte (type and command); queries return the recorded
//! response. Divergence fails with [`ReplayError::Mismatch`] at the current
//! cursor, running past the end fails with [`ReplayError::Exhausted`], and no
//! side effect escapes after the point of divergence.

use crate::session_doc::{EntryKind, InstrumentSession, LogEntry};
use crate::{is_error_query, is_no_error, Transport, TransportResult};
use async_trait::async_trait;
use lab_core::{ReplayError, TransportError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Replays a recorded instrument session.
pub struct ReplayTransport {
    log: Vec<LogEntry>,
    cursor: Mutex<usize>,
    /// Trailing un-consumed entries at close: warn by default, fail when
    /// strict.
    strict_trailing: bool,
    identity: Option<String>,
    closed: AtomicBool,
    timeout: Mutex<Duration>,
}

impl ReplayTransport {
    pub fn new(session: InstrumentSession, strict_trailing: bool) -> Self {
        // the recorded *IDN? answer doubles as the identity hint
        let identity = session.log.iter().find_map(|entry| {
            (entry.kind == EntryKind::Query
                && entry.command.trim().eq_ignore_ascii_case("*IDN?"))
            .then(|| entry.response.clone())
            .flatten()
        });
        Self {
            log: session.log,
            cursor: Mutex::new(0),
            strict_trailing,
            identity,
            closed: AtomicBool::new(false),
            timeout: Mutex::new(Duration::from_secs(5)),
        }
    }

    /// Entries consumed so far.
    pub fn cursor(&self) -> usize {
        *self.cursor.lock()
    }

    /// Entries not yet consumed.
    pub fn remaining(&self) -> usize {
        self.log.len().saturating_sub(self.cursor())
    }

    fn next_entry(
        &self,
        expected_kind: EntryKind,
        command: &str,
    ) -> Result<LogEntry, ReplayError> {
        let mut cursor = self.cursor.lock();
        let Some(entry) = self.log.get(*cursor) else {
            return Err(ReplayError::Exhausted {
                cursor: *cursor,
                command: command.to_string(),
            });
        };
        let received = command.trim();
        if entry.kind != expected_kind || entry.command != received {
            return Err(ReplayError::Mismatch {
                cursor: *cursor,
                expected: entry.describe(),
                actual: format!("{} '{}'", expected_kind, received),
            });
        }
        *cursor += 1;
        Ok(entry.clone())
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::closed("replay session is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for ReplayTransport {
    async fn connect(&self) -> TransportResult<()> {
        self.check_open()?;
        Ok(())
    }

    async fn write(&self, command: &str) -> TransportResult<()> {
        self.check_open()?;
        self.next_entry(EntryKind::Write, command)?;
        Ok(())
    }

    async fn query(&self, command: &str) -> TransportResult<String> {
        self.check_open()?;
        let entry = self.next_entry(EntryKind::Query, command)?;
        Ok(entry.response.unwrap_or_default())
    }

    /// Drain recorded error queries in place, without advancing past
    /// unrelated commands.
    async fn clear_errors(&self) -> TransportResult<Vec<String>> {
        self.check_open()?;
        let mut drained = Vec::new();
        loop {
            let mut cursor = self.cursor.lock();
            let Some(entry) = self.log.get(*cursor) else {
                break;
            };
            if entry.kind != EntryKind::Query || !is_error_query(&entry.command) {
                break;
            }
            let response = entry.response.clone().unwrap_or_default();
            *cursor += 1;
            drop(cursor);
            if is_no_error(&response) {
                return Ok(drained);
            }
            drained.push(response);
        }
        Ok(drained)
    }

    async fn close(&self) -> TransportResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let remaining = self.remaining();
        if remaining > 0 {
            if self.strict_trailing {
                return Err(ReplayError::TrailingEntries { remaining }.into());
            }
            tracing::warn!(
                remaining,
                "replay session closed with un-consumed log entries"
            );
        }
        Ok(())
    }

    async fn set_timeout(&self, timeout: Duration) -> TransportResult<()> {
        *self.timeout.lock() = timeout;
        Ok(())
    }

    async fn timeout(&self) -> Duration {
        *self.timeout.lock()
    }

    fn identity_hint(&self) -> Option<String> {
        self.identity.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lab_core::LabError;

    fn session(entries: Vec<LogEntry>) -> InstrumentSession {
        InstrumentSession {
            profile: "keysight/EDU36311A".into(),
            log: entries,
        }
    }

    fn basic_session() -> InstrumentSession {
        session(vec![
            LogEntry::query("*IDN?", "Keysight,EDU36311A,X,1.0", 0.001),
            LogEntry::write(":SOUR1:VOLT 2.5", 0.002),
            LogEntry::query(":SOUR1:VOLT?", "2.5", 0.003),
        ])
    }

    #[tokio::test]
    async fn identical_script_replays_to_the_end() {
        let replay = ReplayTransport::new(basic_session(), false);
        replay.connect().await.unwrap();

        assert_eq!(replay.query("*IDN?").await.unwrap(), "Keysight,EDU36311A,X,1.0");
        replay.write(":SOUR1:VOLT 2.5").await.unwrap();
        assert_eq!(replay.query(":SOUR1:VOLT?").await.unwrap(), "2.5");
        assert_eq!(replay.remaining(), 0);
        replay.close().await.unwrap();
    }

    #[tokio::test]
    async fn divergent_command_fails_at_the_right_cursor() {
        let replay = ReplayTransport::new(basic_session(), false);
        replay.connect().await.unwrap();
        replay.query("*IDN?").await.unwrap();

        let err = replay.write(":SOUR1:VOLT 3.0").await.unwrap_err();
        match err {
            LabError::Replay(ReplayError::Mismatch {
                cursor,
                expected,
                actual,
            }) => {
                assert_eq!(cursor, 1);
                assert!(expected.contains(":SOUR1:VOLT 2.5"));
                assert!(actual.contains(":SOUR1:VOLT 3.0"));
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
        // the failed call consumed nothing
        assert_eq!(replay.cursor(), 1);
    }

    #[tokio::test]
    async fn kind_mismatch_is_a_mismatch_too() {
        let replay = ReplayTransport::new(basic_session(), false);
        replay.connect().await.unwrap();
        // recorded entry is a query; issuing a write with the same text fails
        let err = replay.write("*IDN?").await.unwrap_err();
        assert!(matches!(
            err,
            LabError::Replay(ReplayError::Mismatch { cursor: 0, .. })
        ));
    }

    #[tokio::test]
    async fn exhausted_log_is_a_typed_error() {
        let replay = ReplayTransport::new(session(vec![]), false);
        replay.connect().await.unwrap();
        let err = replay.query("*IDN?").await.unwrap_err();
        assert!(matches!(
            err,
            LabError::Replay(ReplayError::Exhausted { cursor: 0, .. })
        ));
    }

    #[tokio::test]
    async fn clear_errors_consumes_only_error_queries() {
        let replay = ReplayTransport::new(
            session(vec![
                LogEntry::query(":SYST:ERR?", "-222,\"Data out of range\"", 0.001),
                LogEntry::query(":SYST:ERR?", "+0,\"No error\"", 0.002),
                LogEntry::write(":SOUR1:VOLT 1.0", 0.003),
            ]),
            false,
        );
        replay.connect().await.unwrap();

        let drained = replay.clear_errors().await.unwrap();
        assert_eq!(drained, vec!["-222,\"Data out of range\"".to_string()]);
        // the unrelated write is still pending
        assert_eq!(replay.remaining(), 1);
        replay.write(":SOUR1:VOLT 1.0").await.unwrap();
    }

    #[tokio::test]
    async fn trailing_entries_warn_by_default_and_fail_in_strict_mode() {
        let lenient = ReplayTransport::new(basic_session(), false);
        lenient.connect().await.unwrap();
        lenient.query("*IDN?").await.unwrap();
        lenient.close().await.unwrap();

        let strict = ReplayTransport::new(basic_session(), true);
        strict.connect().await.unwrap();
        strict.query("*IDN?").await.unwrap();
        let err = strict.close().await.unwrap_err();
        assert!(matches!(
            err,
            LabError::Replay(ReplayError::TrailingEntries { remaining: 2 })
        ));
    }

    #[tokio::test]
    async fn identity_hint_comes_from_the_recorded_idn() {
        let replay = ReplayTransport::new(basic_session(), false);
        assert_eq!(
            replay.identity_hint().as_deref(),
            Some("Keysight,EDU36311A,X,1.0")
        );
    }
}
