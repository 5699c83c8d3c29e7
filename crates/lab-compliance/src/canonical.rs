//! Canonical byte encoding for signed artifacts.
//!
//! Exactly one byte sequence exists for any given measurement result or
//! instrument-state snapshot: a domain-separation tag, then JSON with sorted
//! object keys (the default map representation here is ordered) and shortest
//! round-trip number formatting, UTF-8 encoded. The envelope field itself is
//! excluded - signatures cover the unsigned view.

use lab_core::{ComplianceError, MeasurementResult};
use sha2::{Digest, Sha256};

/// Domain tag for measurement results.
pub const RESULT_DOMAIN: &str = "labkit:result:v1";

/// Domain tag for instrument-state snapshots.
pub const STATE_DOMAIN: &str = "labkit:state:v1";

pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex(&hasher.finalize())
}

pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

fn tagged(domain: &str, body: &serde_json::Value) -> Result<Vec<u8>, ComplianceError> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(domain.as_bytes());
    bytes.push(0);
    bytes.extend_from_slice(&serde_json::to_vec(body)?);
    Ok(bytes)
}

/// Canonical bytes of a measurement result's unsigned view.
pub fn result_bytes(result: &MeasurementResult) -> Result<Vec<u8>, ComplianceError> {
    let mut unsigned = result.clone();
    unsigned.envelope = None;
    let body = serde_json::to_value(&unsigned)?;
    tagged(RESULT_DOMAIN, &body)
}

/// Canonical bytes of an instrument-state snapshot: the enumerated
/// queryable settings of a profile plus the instrument identity.
pub fn state_bytes(
    instrument_idn: &str,
    profile_hash: &str,
    settings: &[(String, String)],
) -> Result<Vec<u8>, ComplianceError> {
    let mut sorted = settings.to_vec();
    sorted.sort();
    let body = serde_json::json!({
        "instrument_idn": instrument_idn,
        "profile_hash": profile_hash,
        "settings": sorted,
    });
    tagged(STATE_DOMAIN, &body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lab_core::{
        Envelope, Measured, MeasurementValue, MonotonicClock, Provenance,
    };

    fn sample_result() -> MeasurementResult {
        MeasurementResult {
            value: MeasurementValue::Scalar(Measured::with_sigma(4.999, 0.002)),
            units: "V".into(),
            timestamp: MonotonicClock::new().now(),
            provenance: Provenance {
                actor: "op".into(),
                instrument_idn: "Keysight,EDU34450A,X,1".into(),
                profile_hash: "abc".into(),
                trace_fingerprint: "def".into(),
            },
            envelope: None,
        }
    }

    #[test]
    fn canonical_bytes_are_stable() {
        let result = sample_result();
        assert_eq!(result_bytes(&result).unwrap(), result_bytes(&result).unwrap());
    }

    #[test]
    fn canonical_bytes_exclude_the_envelope() {
        let mut result = sample_result();
        let unsigned = result_bytes(&result).unwrap();
        result.envelope = Some(Envelope {
            alg: "x".into(),
            key_id: "y".into(),
            sha: "z".into(),
            sig: "w".into(),
            ts: chrono::Utc::now(),
        });
        assert_eq!(result_bytes(&result).unwrap(), unsigned);
    }

    #[test]
    fn any_field_mutation_changes_the_bytes() {
        let base = sample_result();
        let base_bytes = result_bytes(&base).unwrap();

        let mut mutated = base.clone();
        mutated.value = MeasurementValue::Scalar(Measured::with_sigma(5.000, 0.002));
        assert_ne!(result_bytes(&mutated).unwrap(), base_bytes);

        let mut mutated = base.clone();
        mutated.units = "mV".into();
        assert_ne!(result_bytes(&mutated).unwrap(), base_bytes);

        let mut mutated = base;
        mutated.provenance.trace_fingerprint = "other".into();
        assert_ne!(result_bytes(&mutated).unwrap(), base_bytes);
    }

    #[test]
    fn state_bytes_sort_the_settings() {
        let a = state_bytes(
            "idn",
            "hash",
            &[("b?".into(), "2".into()), ("a?".into(), "1".into())],
        )
        .unwrap();
        let b = state_bytes(
            "idn",
            "hash",
            &[("a?".into(), "1".into()), ("b?".into(), "2".into())],
        )
        .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn domains_separate_result_and_state_hashes() {
        assert_ne!(
            sha256_hex(RESULT_DOMAIN.as_bytes()),
            sha256_hex(STATE_DOMAIN.as_bytes())
        );
    }
}
