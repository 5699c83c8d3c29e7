//! Arbitrary/function waveform generator driver.

use crate::instrument::InstrumentCore;
use crate::scpi;
use lab_core::{LabError, ProfileError, Quantity};

#[derive(Debug)]
pub struct WaveformGenerator {
    core: InstrumentCore,
}

impl WaveformGenerator {
    pub fn new(core: InstrumentCore) -> Self {
        Self { core }
    }

    pub fn core(&self) -> &InstrumentCore {
        &self.core
    }

    pub async fn connect(&self) -> Result<(), LabError> {
        self.core.connect().await
    }

    pub async fn close(&self) -> Result<(), LabError> {
        self.core.close().await
    }

    pub fn channel(&self, index: u32) -> Result<AwgChannelFacade<'_>, LabError> {
        if self.core.profile().channel(index).is_none() {
            return Err(ProfileError::Invalid {
                profile: self.core.profile().model_id.clone(),
                message: format!("waveform generator has no channel {}", index),
            }
            .into());
        }
        Ok(AwgChannelFacade { awg: self, index })
    }
}

#[derive(Debug)]
pub struct AwgChannelFacade<'a> {
    awg: &'a WaveformGenerator,
    index: u32,
}

impl AwgChannelFacade<'_> {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Configure a sine output. Frequency and amplitude clear the safety
    /// overlay first.
    pub async fn setup_sine(
        &self,
        frequency: f64,
        amplitude: f64,
        offset: f64,
    ) -> Result<&Self, LabError> {
        self.awg
            .core
            .check_limit(self.index, Quantity::Frequency, frequency)?;
        self.awg
            .core
            .check_limit(self.index, Quantity::Voltage, amplitude.abs() + offset.abs())?;
        let ch = self.index.to_string();
        self.awg
            .core
            .write_op(
                "set_function",
                ":SOUR${ch}:FUNC SIN",
                &[("ch", ch.clone())],
            )
            .await?;
        self.awg
            .core
            .write_op(
                "set_frequency",
                ":SOUR${ch}:FREQ ${freq}",
                &[("ch", ch.clone()), ("freq", scpi::fmt_f64(frequency))],
            )
            .await?;
        self.awg
            .core
            .write_op(
                "set_amplitude",
                ":SOUR${ch}:VOLT ${amplitude}",
                &[("ch", ch.clone()), ("amplitude", scpi::fmt_f64(amplitude))],
            )
            .await?;
        self.awg
            .core
            .write_op(
                "set_offset",
                ":SOUR${ch}:VOLT:OFFS ${offset}",
                &[("ch", ch), ("offset", scpi::fmt_f64(offset))],
            )
            .await?;
        Ok(self)
    }

    /// Upload normalized samples (-1.0..=1.0) as a named arbitrary waveform.
    /// The transfer uses the comma-separated ASCII form; the profile's
    /// declared endianness governs [`Self::upload_arb_words`].
    pub async fn upload_arb(&self, name: &str, samples: &[f64]) -> Result<&Self, LabError> {
        if samples.is_empty() {
            return Err(ProfileError::Invalid {
                profile: self.awg.core.profile().model_id.clone(),
                message: "arbitrary waveform needs at least one sample".to_string(),
            }
            .into());
        }
        let csv: Vec<String> = samples
            .iter()
            .map(|&s| scpi::fmt_f64(s.clamp(-1.0, 1.0)))
            .collect();
        self.awg
            .core
            .write_op(
                "arb_upload",
                ":SOUR${ch}:DATA:ARB ${name},${points}",
                &[
                    ("ch", self.index.to_string()),
                    ("name", name.to_string()),
                    ("points", csv.join(",")),
                ],
            )
            .await?;
        Ok(self)
    }

    /// Encode samples as i16 words in the profile-declared endianness.
    /// Exposed for drivers of instruments that require the DAC-word form.
    pub fn encode_arb_words(&self, samples: &[f64]) -> Vec<u8> {
        scpi::encode_arb_i16(samples, self.awg.core.profile().readout.arb_endianness)
    }

    pub async fn select_arb(&self, name: &str) -> Result<&Self, LabError> {
        self.awg
            .core
            .write_op(
                "arb_select",
                ":SOUR${ch}:FUNC:ARB ${name}",
                &[("ch", self.index.to_string()), ("name", name.to_string())],
            )
            .await?;
        Ok(self)
    }

    pub async fn enable(&self) -> Result<&Self, LabError> {
        self.output(true).await
    }

    pub async fn disable(&self) -> Result<&Self, LabError> {
        self.output(false).await
    }

    async fn output(&self, on: bool) -> Result<&Self, LabError> {
        self.awg
            .core
            .write_op(
                "output_state",
                ":OUTP${ch} ${state}",
                &[
                    ("ch", self.index.to_string()),
                    ("state", if on { "ON" } else { "OFF" }.to_string()),
                ],
            )
            .await?;
        Ok(self)
    }
}
