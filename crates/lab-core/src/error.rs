//! Error taxonomy for the labkit runtime.
//!
//! Each layer has its own typed error (`TransportError`, `ProfileError`,
//! `SafetyLimitError`, …) so tests can assert on structured fields instead of
//! message strings. [`LabError`] consolidates them for callers that cross
//! layers, with `#[from]` conversions so the `?` operator composes naturally.
//!
//! Three broad categories:
//!
//! 1. **Configuration errors** (`Config`, `Profile`) - caught at load or
//!    validation time, before any instrument I/O.
//! 2. **Wire and device errors** (`Transport`, `Instrument`, `Replay`) -
//!    raised while talking to hardware, a simulator, or a recorded session.
//! 3. **Runtime errors** (`Safety`, `Session`, `Compliance`) - policy and
//!    orchestration failures; safety violations are rejected before any bytes
//!    reach the wire.

use thiserror::Error;

// =============================================================================
// Transport errors
// =============================================================================

/// Category of a wire-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The instrument did not answer within the session timeout.
    Timeout,
    /// The underlying socket/serial port failed.
    Io,
    /// The session was already closed when the call was made.
    Closed,
    /// The bytes on the wire did not match the expected framing.
    Protocol,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Io => "io",
            TransportErrorKind::Closed => "closed",
            TransportErrorKind::Protocol => "protocol",
        };
        write!(f, "{}", label)
    }
}

/// Wire-level failure. Every transport method fails with this type and
/// nothing else.
#[derive(Error, Debug, Clone)]
#[error("transport {kind} error: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Io, message)
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Closed, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Protocol, message)
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                Self::timeout(e.to_string())
            }
            _ => Self::io(e.to_string()),
        }
    }
}

// =============================================================================
// Profile and bench configuration errors
// =============================================================================

/// An instrument profile is internally inconsistent or cannot be loaded.
#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("profile '{profile}': missing required field '{field}'")]
    MissingField { profile: String, field: String },

    #[error("profile '{profile}': unknown device type '{device_type}'")]
    UnknownDeviceType {
        profile: String,
        device_type: String,
    },

    #[error("profile '{profile}': duplicate channel index {index}")]
    DuplicateChannel { profile: String, index: u32 },

    #[error("profile '{profile}': duplicate accuracy key '{key}'")]
    DuplicateAccuracyKey { profile: String, key: String },

    #[error("profile '{profile}': safety schema references unknown channel {index}")]
    UnknownSafetyChannel { profile: String, index: u32 },

    #[error("profile '{profile}': simulation pattern '{pattern}' does not compile: {reason}")]
    BadPattern {
        profile: String,
        pattern: String,
        reason: String,
    },

    #[error("profile '{profile}': expression '{expr}' does not parse: {reason}")]
    BadExpression {
        profile: String,
        expr: String,
        reason: String,
    },

    #[error("no profile registered under key '{key}'")]
    UnknownProfile { key: String },

    #[error("profile '{profile}': {message}")]
    Invalid { profile: String, message: String },

    #[error("failed to parse profile '{profile}': {reason}")]
    Parse { profile: String, reason: String },

    #[error("failed to read profile: {0}")]
    Io(#[from] std::io::Error),
}

/// A bench descriptor or runtime settings file is malformed.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("bench '{bench}': duplicate instrument alias '{alias}'")]
    DuplicateAlias { bench: String, alias: String },

    #[error("no instrument registered under alias '{alias}'")]
    UnknownAlias { alias: String },

    #[error("instrument '{alias}' is a {actual}, not a {requested}")]
    WrongDeviceType {
        alias: String,
        requested: String,
        actual: String,
    },

    #[error(
        "bench '{bench}': safety limit for {alias} channel {channel} {quantity} \
         widens the profile bound ({requested} beyond {profile_bound})"
    )]
    LimitWidened {
        bench: String,
        alias: String,
        channel: u32,
        quantity: String,
        requested: f64,
        profile_bound: f64,
    },

    #[error("failed to parse bench descriptor '{path}': {reason}")]
    Parse { path: String, reason: String },

    #[error("bench descriptor: {message}")]
    Invalid { message: String },

    #[error("settings error: {0}")]
    Settings(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// =============================================================================
// Device-reported and safety errors
// =============================================================================

/// The instrument reported an error through its error queue
/// (`:SYSTem:ERRor?`).
#[derive(Error, Debug, Clone, PartialEq)]
#[error("instrument error {code}: {text}")]
pub struct InstrumentError {
    pub code: i32,
    pub text: String,
}

impl InstrumentError {
    pub fn new(code: i32, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }
}

/// Physical quantity a safety limit applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantity {
    Voltage,
    Current,
    Power,
    Frequency,
}

impl std::fmt::Display for Quantity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Quantity::Voltage => "voltage",
            Quantity::Current => "current",
            Quantity::Power => "power",
            Quantity::Frequency => "frequency",
        };
        write!(f, "{}", label)
    }
}

/// A requested setting violates the merged safety limits. Raised before any
/// write or query reaches the transport.
#[derive(Error, Debug, Clone, PartialEq)]
#[error(
    "safety limit violated on '{alias}' channel {channel}: {quantity} = {value} exceeds bound {bound}"
)]
pub struct SafetyLimitError {
    pub alias: String,
    pub channel: u32,
    pub quantity: Quantity,
    pub value: f64,
    pub bound: f64,
}

// =============================================================================
// Replay errors
// =============================================================================

/// Strict-sequence replay invariants were violated.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReplayError {
    #[error(
        "replay mismatch at log entry {cursor}: expected {expected}, got {actual}"
    )]
    Mismatch {
        cursor: usize,
        expected: String,
        actual: String,
    },

    #[error("replay log exhausted after {cursor} entries, but '{command}' was issued")]
    Exhausted { cursor: usize, command: String },

    #[error("replay finished with {remaining} un-consumed log entries")]
    TrailingEntries { remaining: usize },
}

// =============================================================================
// Session errors
// =============================================================================

/// Measurement-session orchestration failures.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("background task '{name}' did not stop within the {grace_s}s grace period")]
    TaskAbandoned { name: String, grace_s: f64 },

    #[error(
        "acquisition key '{key}' is produced by both '{first}' and '{second}'"
    )]
    AcquisitionKeyConflict {
        key: String,
        first: String,
        second: String,
    },

    #[error("session was cancelled")]
    Cancelled,

    #[error("parameter '{0}' is already defined")]
    DuplicateParameter(String),

    #[error("acquisition '{0}' is already registered")]
    DuplicateAcquisition(String),

    #[error("background task '{0}' is already registered")]
    DuplicateTask(String),

    #[error("sweep requires at least one parameter")]
    NoParameters,

    #[error("session requires at least one acquisition")]
    NoAcquisitions,

    #[error("acquisition '{name}' failed: {source}")]
    AcquisitionFailed {
        name: String,
        #[source]
        source: Box<LabError>,
    },

    #[error("store operation failed: {0}")]
    Store(String),
}

// =============================================================================
// Compliance errors
// =============================================================================

/// Hashing, signing, or audit failures.
#[derive(Error, Debug)]
pub enum ComplianceError {
    #[error("envelope signature is invalid")]
    SignatureInvalid,

    #[error("signing key '{0}' is not available")]
    KeyUnavailable(String),

    #[error("failed to append audit record: {0}")]
    AuditWriteFailed(String),

    #[error("canonical encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

// =============================================================================
// Consolidated error
// =============================================================================

/// Convenience alias for results using the consolidated error type.
pub type LabResult<T> = std::result::Result<T, LabError>;

/// Top-level error for the labkit runtime.
#[derive(Error, Debug)]
pub enum LabError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Profile(#[from] ProfileError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Instrument(#[from] InstrumentError),

    #[error(transparent)]
    Safety(#[from] SafetyLimitError),

    #[error(transparent)]
    Replay(#[from] ReplayError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Compliance(#[from] ComplianceError),

    /// Closing a bench encountered one or more per-instrument failures.
    /// Each close is best-effort; the composite is reported once.
    #[error("bench shutdown finished with {} error(s)", .0.len())]
    ShutdownFailed(Vec<LabError>),
}

impl LabError {
    /// Process exit code mandated for CLI paths: 0 ok, 1 validation/IO,
    /// 2 replay mismatch, 3 safety violation.
    pub fn exit_code(&self) -> i32 {
        match self {
            LabError::Replay(_) => 2,
            LabError::Safety(_) => 3,
            LabError::ShutdownFailed(errors) => errors
                .iter()
                .map(LabError::exit_code)
                .max()
                .unwrap_or(1),
            _ => 1,
        }
    }
}
