//! Compliance envelope: deterministic hashing and signing of measurement
//! artifacts, plus the append-only audit trail.
//!
//! Signing covers the canonical unsigned view of a result (kind, values,
//! units, timestamps, provenance, trace fingerprint) - mutate any of them
//! and verification fails. The audit log records who signed what, and its
//! failures never mask the measurement they accompany.

pub mod audit;
pub mod canonical;
pub mod envelope;

pub use audit::{global_audit, AuditLog, AuditRecord};
pub use envelope::{
    attach_envelope, sign_result, sign_state, verify_result, verify_state, KeyedSigner,
    Signer, SIGNING_KEY_LEN,
};

use lab_core::{LabError, MeasurementResult};

/// Sign a result, attach the envelope, and record the action in an audit
/// log. An audit failure is logged and reported through the return value's
/// side channel (`tracing`), never by dropping the signed result.
pub fn sign_and_audit(
    result: MeasurementResult,
    signer: &dyn Signer,
    audit: &AuditLog,
) -> Result<MeasurementResult, LabError> {
    let actor = result.provenance.actor.clone();
    let signed = attach_envelope(result, signer)?;
    if let Some(envelope) = &signed.envelope {
        if let Err(e) = audit.append(&actor, "sign_result", &envelope.sha) {
            tracing::error!(error = %e, "audit append failed; measurement result preserved");
        }
    }
    Ok(signed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lab_core::{Measured, MeasurementValue, MonotonicClock, Provenance};

    #[test]
    fn sign_and_audit_attaches_and_records() {
        let path = std::env::temp_dir().join(format!(
            "labkit-audit-roundtrip-{}.log",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        let audit = AuditLog::new(&path);
        let signer = KeyedSigner::from_passphrase("k");

        let result = MeasurementResult {
            value: MeasurementValue::Scalar(Measured::exact(1.0)),
            units: "V".into(),
            timestamp: MonotonicClock::new().now(),
            provenance: Provenance {
                actor: "op".into(),
                instrument_idn: "idn".into(),
                profile_hash: "h".into(),
                trace_fingerprint: "t".into(),
            },
            envelope: None,
        };

        let signed = sign_and_audit(result, &signer, &audit).unwrap();
        let envelope = signed.envelope.clone().unwrap();
        assert!(verify_result(&signed, &envelope, &signer));

        let records = AuditLog::read_records(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, "sign_result");
        assert_eq!(records[0].envelope_sha, envelope.sha);
        let _ = std::fs::remove_file(&path);
    }
}
