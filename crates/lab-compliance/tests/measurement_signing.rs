//! Envelope round-trip over real (simulated) measurements.

use lab_compliance::{sign_result, verify_result, KeyedSigner};
use lab_core::{Measured, MeasurementValue};
use lab_instruments::{instrument::InstrumentCore, Multimeter, SafetyOverlay};
use lab_transport::SimTransport;

async fn dmm_reading() -> lab_core::MeasurementResult {
    let profile = lab_profiles::load_profile("keysight/EDU34450A").unwrap();
    let transport = SimTransport::from_profile(&profile, false, Some(6)).unwrap();
    let dmm = Multimeter::new(InstrumentCore::new(
        profile,
        Box::new(transport),
        "dmm",
        SafetyOverlay::unrestricted("dmm"),
    ));
    dmm.connect().await.unwrap();
    let reading = dmm.measure_voltage_dc().await.unwrap();
    dmm.close().await.unwrap();
    reading
}

#[tokio::test]
async fn s6_corrupting_a_signed_reading_fails_verification() {
    let signer = KeyedSigner::from_passphrase("compliance-test");
    let result = dmm_reading().await;
    assert_eq!(result.scalar().unwrap().value, 4.999);

    let envelope = sign_result(&result, &signer).unwrap();
    assert!(verify_result(&result, &envelope, &signer));

    // nudge 4.999 V to 5.000 V
    let mut corrupted = result.clone();
    let sigma = result.scalar().unwrap().sigma;
    corrupted.value = MeasurementValue::Scalar(Measured {
        value: 5.000,
        sigma,
    });
    assert!(!verify_result(&corrupted, &envelope, &signer));
}

#[tokio::test]
async fn provenance_binds_the_command_trace() {
    let signer = KeyedSigner::from_passphrase("compliance-test");
    let result = dmm_reading().await;
    let envelope = sign_result(&result, &signer).unwrap();

    // rewriting history (a different command trace) invalidates the envelope
    let mut rewritten = result.clone();
    rewritten.provenance.trace_fingerprint = "0".repeat(64);
    assert!(!verify_result(&rewritten, &envelope, &signer));
}
