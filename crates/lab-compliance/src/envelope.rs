//! Envelope creation and verification.
//!
//! An envelope binds a measurement result (or an instrument-state snapshot)
//! to the key that signed it: canonical bytes → SHA-256 → detached signature
//! tuple `{alg, key_id, sha, sig, ts}`. Signing is trait-abstracted; the
//! default signer computes a keyed SHA-256 over a domain-tagged preimage,
//! with the verification path recomputing the same.

use crate::canonical;
use lab_core::{ComplianceError, Envelope, MeasurementResult};
use sha2::{Digest, Sha256};

/// Length of a signing key in bytes.
pub const SIGNING_KEY_LEN: usize = 32;

/// Detached signer.
pub trait Signer: Send + Sync {
    /// Algorithm identifier recorded in envelopes.
    fn algorithm(&self) -> &'static str;

    /// Fingerprint of the signing key.
    fn key_id(&self) -> String;

    fn sign(&self, digest: &[u8]) -> Vec<u8>;

    fn verify(&self, digest: &[u8], signature: &[u8]) -> bool;
}

/// Keyed-SHA-256 signer. Symmetric: whoever holds the key can both sign and
/// verify.
pub struct KeyedSigner {
    key: [u8; SIGNING_KEY_LEN],
    key_id: String,
}

impl KeyedSigner {
    pub fn from_key(key: [u8; SIGNING_KEY_LEN]) -> Self {
        let fingerprint = canonical::sha256_hex(&key);
        Self {
            key,
            key_id: fingerprint[..16].to_string(),
        }
    }

    /// Derive a key from a passphrase (tests, single-operator setups).
    pub fn from_passphrase(passphrase: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"labkit-key-derive:");
        hasher.update(passphrase.as_bytes());
        Self::from_key(hasher.finalize().into())
    }

    fn mac(&self, digest: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(b"labkit-sign:");
        hasher.update(self.key);
        hasher.update(digest);
        hasher.finalize().to_vec()
    }
}

impl Signer for KeyedSigner {
    fn algorithm(&self) -> &'static str {
        "keyed-sha256"
    }

    fn key_id(&self) -> String {
        self.key_id.clone()
    }

    fn sign(&self, digest: &[u8]) -> Vec<u8> {
        self.mac(digest)
    }

    fn verify(&self, digest: &[u8], signature: &[u8]) -> bool {
        // constant-time-ish comparison over the fixed-length mac
        let expected = self.mac(digest);
        expected.len() == signature.len()
            && expected
                .iter()
                .zip(signature)
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }
}

fn envelope_over(
    bytes: &[u8],
    signer: &dyn Signer,
) -> Result<Envelope, ComplianceError> {
    let digest = canonical::sha256(bytes);
    let signature = signer.sign(&digest);
    Ok(Envelope {
        alg: signer.algorithm().to_string(),
        key_id: signer.key_id(),
        sha: canonical::hex(&digest),
        sig: canonical::hex(&signature),
        ts: chrono::Utc::now(),
    })
}

fn verify_over(bytes: &[u8], envelope: &Envelope, signer: &dyn Signer) -> bool {
    let digest = canonical::sha256(bytes);
    if canonical::hex(&digest) != envelope.sha {
        return false;
    }
    if envelope.key_id != signer.key_id() || envelope.alg != signer.algorithm() {
        return false;
    }
    let Some(signature) = decode_hex(&envelope.sig) else {
        return false;
    };
    signer.verify(&digest, &signature)
}

fn decode_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
        .collect()
}

/// Sign a measurement result, returning the detached envelope.
pub fn sign_result(
    result: &MeasurementResult,
    signer: &dyn Signer,
) -> Result<Envelope, ComplianceError> {
    let bytes = canonical::result_bytes(result)?;
    envelope_over(&bytes, signer)
}

/// Sign a result and attach the envelope in one step.
pub fn attach_envelope(
    mut result: MeasurementResult,
    signer: &dyn Signer,
) -> Result<MeasurementResult, ComplianceError> {
    let envelope = sign_result(&result, signer)?;
    result.envelope = Some(envelope);
    Ok(result)
}

/// Verify a result against its envelope. Any mutation of the signed fields
/// makes this return `false`.
pub fn verify_result(
    result: &MeasurementResult,
    envelope: &Envelope,
    signer: &dyn Signer,
) -> bool {
    match canonical::result_bytes(result) {
        Ok(bytes) => verify_over(&bytes, envelope, signer),
        Err(_) => false,
    }
}

/// Sign an instrument-state snapshot (enumerated queryable settings).
pub fn sign_state(
    instrument_idn: &str,
    profile_hash: &str,
    settings: &[(String, String)],
    signer: &dyn Signer,
) -> Result<Envelope, ComplianceError> {
    let bytes = canonical::state_bytes(instrument_idn, profile_hash, settings)?;
    envelope_over(&bytes, signer)
}

pub fn verify_state(
    instrument_idn: &str,
    profile_hash: &str,
    settings: &[(String, String)],
    envelope: &Envelope,
    signer: &dyn Signer,
) -> bool {
    match canonical::state_bytes(instrument_idn, profile_hash, settings) {
        Ok(bytes) => verify_over(&bytes, envelope, signer),
        Err(_) => false,
    }
}
