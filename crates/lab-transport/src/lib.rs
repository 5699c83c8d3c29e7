//! Transport layer.
//!
//! A [`Transport`] is a connected byte-level session with one instrument:
//! write a SCPI command, query a response, read a binary block, drain the
//! error queue, close. Four variants satisfy the same contract:
//!
//! - [`VisaTransport`] - real hardware behind a VISA-style resource address
//!   (TCP socket or serial port).
//! - [`SimTransport`] - deterministic simulator driven by a profile's rules.
//! - [`RecordingTransport`] - wraps any other transport and logs every call
//!   into a session document.
//! - [`ReplayTransport`] - strict-sequence playback of a recorded session.
//!
//! One call is outstanding per session at any time; callers observe strict
//! FIFO per instrument. Hardware and simulator failures are
//! [`lab_core::TransportError`]; replay divergence is
//! [`lab_core::ReplayError`]. Both arrive through [`lab_core::LabError`] so
//! the replayer can keep its typed mismatch context.

pub mod record;
pub mod replay;
pub mod session_doc;
pub mod sim;
pub mod visa;

use async_trait::async_trait;
use lab_core::{LabError, TransportError};
use std::time::Duration;

pub use record::{RecordingTransport, SessionLogHandle};
pub use replay::ReplayTransport;
pub use session_doc::{EntryKind, InstrumentSession, LogEntry, SessionDocument};
pub use sim::{SimEngine, SimTransport};
pub use visa::{ResourceAddress, VisaTransport};

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, LabError>;

/// The SCPI "no error" sentinel prefix returned by `:SYSTem:ERRor?`.
pub const NO_ERROR_PREFIXES: &[&str] = &["+0,", "0,"];

/// Query used to drain the instrument error queue.
pub const ERROR_QUERY: &str = ":SYST:ERR?";

/// Upper bound on error-queue drain iterations, so a misbehaving instrument
/// cannot wedge `clear_errors` forever.
const MAX_ERROR_DRAIN: usize = 64;

/// Returns true when an error-queue response is the "no error" sentinel.
pub fn is_no_error(response: &str) -> bool {
    let trimmed = response.trim();
    NO_ERROR_PREFIXES
        .iter()
        .any(|prefix| trimmed.starts_with(prefix))
        || trimmed.is_empty()
}

/// Returns true when a command is an error-queue query.
pub fn is_error_query(command: &str) -> bool {
    let upper = command.trim().to_ascii_uppercase();
    upper.ends_with("SYST:ERR?") || upper.ends_with("SYSTEM:ERROR?")
}

/// Byte-level session with one instrument.
///
/// `connect` must precede any I/O; `close` is idempotent. Implementations
/// serialize calls internally - callers may share the transport behind an
/// `Arc` and still observe per-instrument FIFO ordering.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the underlying resource. Must be called before any I/O.
    async fn connect(&self) -> TransportResult<()>;

    /// Fire-and-forget SCPI write. Returns once the transport has accepted
    /// the bytes; instrument-side errors surface via [`Self::clear_errors`].
    async fn write(&self, command: &str) -> TransportResult<()>;

    /// Write + read one response line, stripped of line terminators.
    async fn query(&self, command: &str) -> TransportResult<String>;

    /// Write + read a raw response: either an IEEE-488.2 definite-length
    /// block (`#<d><len><bytes>`) or a plain line, returned undecoded.
    async fn query_raw(&self, command: &str) -> TransportResult<Vec<u8>> {
        Ok(self.query(command).await?.into_bytes())
    }

    /// Drain the instrument's error queue until the "no error" sentinel.
    /// Returns the drained error strings (sentinel excluded).
    async fn clear_errors(&self) -> TransportResult<Vec<String>> {
        let mut drained = Vec::new();
        for _ in 0..MAX_ERROR_DRAIN {
            let response = self.query(ERROR_QUERY).await?;
            if is_no_error(&response) {
                return Ok(drained);
            }
            drained.push(response);
        }
        Err(TransportError::protocol(format!(
            "error queue did not drain after {} reads",
            MAX_ERROR_DRAIN
        ))
        .into())
    }

    /// Release all transport resources. Idempotent: the second call is a
    /// no-op and never fails.
    async fn close(&self) -> TransportResult<()>;

    /// Per-call I/O timeout.
    async fn set_timeout(&self, timeout: Duration) -> TransportResult<()>;

    async fn timeout(&self) -> Duration;

    /// Identity tag known without asking the device (simulators and replays);
    /// hardware returns `None` until `*IDN?` is asked.
    fn identity_hint(&self) -> Option<String> {
        None
    }
}
