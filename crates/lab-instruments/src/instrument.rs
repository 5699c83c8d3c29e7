//! Common instrument skeleton shared by every device-type driver.
//!
//! [`InstrumentCore`] owns the transport, the profile, the safety overlay,
//! and the bookkeeping every driver needs: identity, the post-write error
//! sweep, and the command trace that feeds measurement provenance.

use crate::safety::SafetyOverlay;
use crate::scpi;
use lab_core::{
    InstrumentError, LabError, Measured, MeasurementResult, MeasurementValue,
    MonotonicClock, Provenance, Quantity,
};
use lab_profiles::ProfileSpec;
use lab_transport::Transport;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Post-write error sweep strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorSweep {
    /// Never ask the instrument for its error queue.
    #[default]
    Off,
    /// Drain the queue after every write and query.
    PerCall,
    /// Drain the queue every [`BATCH_SWEEP_INTERVAL`] operations.
    Batched,
    /// Drain once, when the instrument closes.
    OnClose,
}

/// Operation count between sweeps in [`ErrorSweep::Batched`] mode.
pub const BATCH_SWEEP_INTERVAL: usize = 16;

/// Shared driver internals.
pub struct InstrumentCore {
    profile: ProfileSpec,
    profile_hash: String,
    transport: Box<dyn Transport>,
    alias: String,
    safety: SafetyOverlay,
    sweep: ErrorSweep,
    suppress_idn: bool,
    actor: String,
    idn: Mutex<Option<String>>,
    trace: Mutex<Vec<String>>,
    ops_since_sweep: AtomicUsize,
    clock: MonotonicClock,
}

impl std::fmt::Debug for InstrumentCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentCore")
            .field("profile", &self.profile)
            .field("profile_hash", &self.profile_hash)
            .field("alias", &self.alias)
            .field("safety", &self.safety)
            .field("sweep", &self.sweep)
            .field("suppress_idn", &self.suppress_idn)
            .field("actor", &self.actor)
            .field("idn", &self.idn)
            .field("trace", &self.trace)
            .field("ops_since_sweep", &self.ops_since_sweep)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl InstrumentCore {
    pub fn new(
        profile: ProfileSpec,
        transport: Box<dyn Transport>,
        alias: impl Into<String>,
        safety: SafetyOverlay,
    ) -> Self {
        let profile_hash = profile.fingerprint();
        Self {
            profile,
            profile_hash,
            transport,
            alias: alias.into(),
            safety,
            sweep: ErrorSweep::Off,
            suppress_idn: false,
            actor: "labkit".to_string(),
            idn: Mutex::new(None),
            trace: Mutex::new(Vec::new()),
            ops_since_sweep: AtomicUsize::new(0),
            clock: MonotonicClock::new(),
        }
    }

    pub fn with_error_sweep(mut self, sweep: ErrorSweep) -> Self {
        self.sweep = sweep;
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    /// Skip the `*IDN?` query on connect (some bring-up profiles have no
    /// identity rule).
    pub fn with_idn_suppressed(mut self) -> Self {
        self.suppress_idn = true;
        self
    }

    pub fn profile(&self) -> &ProfileSpec {
        &self.profile
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn safety(&self) -> &SafetyOverlay {
        &self.safety
    }

    pub fn clock(&self) -> &MonotonicClock {
        &self.clock
    }

    /// Identity string recorded at connect.
    pub fn idn(&self) -> Option<String> {
        self.idn.lock().clone()
    }

    /// Connect the transport, establish identity, and drain any stale
    /// errors.
    pub async fn connect(&self) -> Result<(), LabError> {
        self.transport.connect().await?;
        if !self.suppress_idn {
            let idn = self.transport.query("*IDN?").await?;
            self.trace.lock().push("*IDN?".to_string());
            tracing::info!(alias = %self.alias, idn = %idn, "instrument connected");
            *self.idn.lock() = Some(idn);
        } else if let Some(hint) = self.transport.identity_hint() {
            *self.idn.lock() = Some(hint);
        }
        if self.sweep != ErrorSweep::Off {
            let stale = self.transport.clear_errors().await?;
            if !stale.is_empty() {
                tracing::warn!(
                    alias = %self.alias,
                    count = stale.len(),
                    "stale instrument errors drained at connect"
                );
            }
        }
        Ok(())
    }

    /// Resolve the SCPI template for `operation`: profile override first,
    /// then the driver's built-in default.
    pub fn template<'a>(&'a self, operation: &str, default: &'a str) -> &'a str {
        self.profile.command_template(operation).unwrap_or(default)
    }

    /// Validate a physical-quantity setting against the safety overlay.
    /// Called before the SCPI string is even formatted.
    pub fn check_limit(
        &self,
        channel: u32,
        quantity: Quantity,
        value: f64,
    ) -> Result<(), LabError> {
        self.safety.check(channel, quantity, value)?;
        Ok(())
    }

    /// Format and write one command.
    pub async fn write_op(
        &self,
        operation: &str,
        default_template: &str,
        args: &[(&str, String)],
    ) -> Result<(), LabError> {
        let command = scpi::render(operation, self.template(operation, default_template), args)?;
        self.transport.write(&command).await?;
        self.trace.lock().push(command);
        self.after_op().await
    }

    /// Format one command and query its response.
    pub async fn query_op(
        &self,
        operation: &str,
        default_template: &str,
        args: &[(&str, String)],
    ) -> Result<String, LabError> {
        let command = scpi::render(operation, self.template(operation, default_template), args)?;
        let response = self.transport.query(&command).await?;
        self.trace.lock().push(command);
        self.after_op().await?;
        Ok(response)
    }

    /// Format one command and read its raw (block-aware) response.
    pub async fn query_raw_op(
        &self,
        operation: &str,
        default_template: &str,
        args: &[(&str, String)],
    ) -> Result<Vec<u8>, LabError> {
        let command = scpi::render(operation, self.template(operation, default_template), args)?;
        let response = self.transport.query_raw(&command).await?;
        self.trace.lock().push(command);
        self.after_op().await?;
        Ok(response)
    }

    /// Raw write of an already-formatted command (automation hooks).
    pub async fn write_raw_command(&self, command: &str) -> Result<(), LabError> {
        self.transport.write(command).await?;
        self.trace.lock().push(command.to_string());
        self.after_op().await
    }

    async fn after_op(&self) -> Result<(), LabError> {
        match self.sweep {
            ErrorSweep::Off | ErrorSweep::OnClose => Ok(()),
            ErrorSweep::PerCall => self.sweep_now().await,
            ErrorSweep::Batched => {
                let count = self.ops_since_sweep.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= BATCH_SWEEP_INTERVAL {
                    self.ops_since_sweep.store(0, Ordering::SeqCst);
                    self.sweep_now().await
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Drain the error queue now; a non-empty queue surfaces the first entry
    /// as [`InstrumentError`].
    pub async fn sweep_now(&self) -> Result<(), LabError> {
        let drained = self.transport.clear_errors().await?;
        if let Some(first) = drained.first() {
            let error = scpi::parse_error_entry(first);
            tracing::warn!(alias = %self.alias, %error, "instrument reported an error");
            return Err(error.into());
        }
        Ok(())
    }

    /// Explicitly drain the queue without failing (used by `OnClose`).
    pub async fn drain_errors(&self) -> Result<Vec<InstrumentError>, LabError> {
        let drained = self.transport.clear_errors().await?;
        Ok(drained.iter().map(|e| scpi::parse_error_entry(e)).collect())
    }

    /// SHA-256 over the sorted commands executed since the last take,
    /// clearing the trace.
    pub fn take_trace_fingerprint(&self) -> String {
        let mut commands = std::mem::take(&mut *self.trace.lock());
        commands.sort();
        let mut hasher = Sha256::new();
        for command in &commands {
            hasher.update(command.as_bytes());
            hasher.update([0u8]);
        }
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Commands traced since the last fingerprint (inspection only).
    pub fn trace_len(&self) -> usize {
        self.trace.lock().len()
    }

    /// Wrap a value in a [`MeasurementResult`] with full provenance.
    pub fn result(&self, value: MeasurementValue, units: &str) -> MeasurementResult {
        MeasurementResult {
            value,
            units: units.to_string(),
            timestamp: self.clock.now(),
            provenance: Provenance {
                actor: self.actor.clone(),
                instrument_idn: self
                    .idn
                    .lock()
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
                profile_hash: self.profile_hash.clone(),
                trace_fingerprint: self.take_trace_fingerprint(),
            },
            envelope: None,
        }
    }

    /// Scalar result with σ looked up from the accuracy table.
    pub fn scalar_result(
        &self,
        reading: f64,
        accuracy_key: &str,
        units: &str,
    ) -> MeasurementResult {
        let measured = match self.profile.accuracy(accuracy_key) {
            Some(spec) => Measured::with_sigma(reading, spec.sigma(reading)),
            None => Measured::exact(reading),
        };
        self.result(MeasurementValue::Scalar(measured), units)
    }

    /// Snapshot of the profile-enumerated queryable settings, for
    /// configuration signatures.
    pub async fn settings_snapshot(&self) -> Result<Vec<(String, String)>, LabError> {
        let mut snapshot = Vec::with_capacity(self.profile.settings.len());
        for query in &self.profile.settings {
            let response = self.transport.query(query).await?;
            self.trace.lock().push(query.clone());
            snapshot.push((query.clone(), response));
        }
        Ok(snapshot)
    }

    /// Close the transport. With `OnClose` sweeping, drains and logs the
    /// queue first; close itself is best-effort and idempotent.
    pub async fn close(&self) -> Result<(), LabError> {
        if self.sweep == ErrorSweep::OnClose {
            match self.drain_errors().await {
                Ok(errors) => {
                    for error in errors {
                        tracing::warn!(alias = %self.alias, %error, "error drained at close");
                    }
                }
                Err(e) => {
                    tracing::debug!(alias = %self.alias, error = %e, "error drain at close failed")
                }
            }
        }
        self.transport.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lab_transport::SimTransport;

    fn core_for(profile_key: &str, sweep: ErrorSweep) -> InstrumentCore {
        let profile = lab_profiles::load_profile(profile_key).unwrap();
        let transport = SimTransport::from_profile(&profile, false, Some(5)).unwrap();
        InstrumentCore::new(
            profile,
            Box::new(transport),
            "dut",
            SafetyOverlay::unrestricted("dut"),
        )
        .with_error_sweep(sweep)
    }

    #[tokio::test]
    async fn connect_records_identity() {
        let core = core_for("keysight/EDU36311A", ErrorSweep::Off);
        core.connect().await.unwrap();
        assert!(core.idn().unwrap().contains("EDU36311A"));
    }

    #[tokio::test]
    async fn per_call_sweep_surfaces_instrument_errors() {
        let core = core_for("keysight/EDU36311A", ErrorSweep::PerCall);
        core.connect().await.unwrap();

        // in-range write passes
        core.write_op(
            "set_voltage",
            ":SOUR${ch}:VOLT ${voltage}",
            &[("ch", "2".into()), ("voltage", "5.0".into())],
        )
        .await
        .unwrap();

        // the profile's error rule fires above 30 V
        let err = core
            .write_op(
                "set_voltage",
                ":SOUR${ch}:VOLT ${voltage}",
                &[("ch", "2".into()), ("voltage", "99.0".into())],
            )
            .await
            .unwrap_err();
        match err {
            LabError::Instrument(e) => {
                assert_eq!(e.code, -222);
                assert!(e.text.contains("out of range"));
            }
            other => panic!("expected instrument error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn off_sweep_leaves_errors_queued() {
        let core = core_for("keysight/EDU36311A", ErrorSweep::Off);
        core.connect().await.unwrap();
        core.write_op(
            "set_voltage",
            ":SOUR${ch}:VOLT ${voltage}",
            &[("ch", "2".into()), ("voltage", "99.0".into())],
        )
        .await
        .unwrap();
        let drained = core.drain_errors().await.unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].code, -222);
    }

    #[tokio::test]
    async fn trace_fingerprint_is_order_insensitive_and_clears() {
        let a = core_for("keysight/EDU34450A", ErrorSweep::Off);
        a.connect().await.unwrap();
        a.query_op("m", ":MEAS:VOLT:DC?", &[]).await.unwrap();
        a.query_op("n", ":SENS:VOLT:DC:NPLC?", &[]).await.unwrap();
        let fp_a = a.take_trace_fingerprint();

        let b = core_for("keysight/EDU34450A", ErrorSweep::Off);
        b.connect().await.unwrap();
        b.query_op("n", ":SENS:VOLT:DC:NPLC?", &[]).await.unwrap();
        b.query_op("m", ":MEAS:VOLT:DC?", &[]).await.unwrap();
        let fp_b = b.take_trace_fingerprint();

        // sorted traces: command order does not change the fingerprint
        assert_eq!(fp_a, fp_b);
        // taking the fingerprint cleared the trace
        assert_eq!(a.trace_len(), 0);
    }

    #[tokio::test]
    async fn scalar_results_carry_accuracy_sigma() {
        let core = core_for("keysight/EDU34450A", ErrorSweep::Off);
        core.connect().await.unwrap();
        let result = core.scalar_result(5.0, "voltage_dc", "V");
        let measured = result.scalar().unwrap();
        assert_eq!(measured.value, 5.0);
        let sigma = measured.sigma.unwrap();
        assert!((sigma - (5.0 * 0.00015 + 0.0005)).abs() < 1e-12);
        assert_eq!(result.units, "V");
        assert!(result.provenance.instrument_idn.contains("EDU34450A"));
    }
}
