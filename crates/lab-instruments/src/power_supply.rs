//! DC power supply driver.

use crate::instrument::InstrumentCore;
use crate::scpi;
use lab_core::{LabError, MeasurementResult, ProfileError, Quantity};
use std::time::Duration;

/// Steps used by [`PsuChannelFacade::slew`] when ramping to a new setpoint.
const SLEW_STEPS: u32 = 10;

/// Power supply driver bound to one transport session.
#[derive(Debug)]
pub struct PowerSupply {
    core: InstrumentCore,
}

impl PowerSupply {
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

    pub fn channel(&self, index: u32) -> Result<PsuChannelFacade<'_>, LabError> {
        if self.core.profile().channel(index).is_none() {
            return Err(ProfileError::Invalid {
                profile: self.core.profile().model_id.clone(),
                message: format!("power supply has no channel {}", index),
            }
            .into());
        }
        Ok(PsuChannelFacade { psu: self, index })
    }
}

/// Per-output facade.
pub struct PsuChannelFacade<'a> {
    psu: &'a PowerSupply,
    index: u32,
}

impl std::fmt::Debug for PsuChannelFacade<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PsuChannelFacade")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

impl PsuChannelFacade<'_> {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Program voltage and current limit. Both values clear the safety
    /// overlay before any SCPI is formatted.
    pub async fn set(&self, voltage: f64, current_limit: f64) -> Result<&Self, LabError> {
        self.psu
            .core
            .check_limit(self.index, Quantity::Voltage, voltage)?;
        self.psu
            .core
            .check_limit(self.index, Quantity::Current, current_limit)?;
        let ch = self.index.to_string();
        self.psu
            .core
            .write_op(
                "set_voltage",
                ":SOUR${ch}:VOLT ${voltage}",
                &[("ch", ch.clone()), ("voltage", scpi::fmt_f64(voltage))],
            )
            .await?;
        self.psu
            .core
            .write_op(
                "set_current",
                ":SOUR${ch}:CURR ${current}",
                &[("ch", ch), ("current", scpi::fmt_f64(current_limit))],
            )
            .await?;
        Ok(self)
    }

    /// Program only the voltage setpoint.
    pub async fn set_voltage(&self, voltage: f64) -> Result<&Self, LabError> {
        self.psu
            .core
            .check_limit(self.index, Quantity::Voltage, voltage)?;
        self.psu
            .core
            .write_op(
                "set_voltage",
                ":SOUR${ch}:VOLT ${voltage}",
                &[
                    ("ch", self.index.to_string()),
                    ("voltage", scpi::fmt_f64(voltage)),
                ],
            )
            .await?;
        Ok(self)
    }

    pub async fn on(&self) -> Result<&Self, LabError> {
        self.output(true).await
    }

    pub async fn off(&self) -> Result<&Self, LabError> {
        self.output(false).await
    }

    async fn output(&self, on: bool) -> Result<&Self, LabError> {
        self.psu
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

    pub async fn measure_voltage(&self) -> Result<MeasurementResult, LabError> {
        let response = self
            .psu
            .core
            .query_op(
                "measure_voltage",
                ":MEAS:VOLT? CH${ch}",
                &[("ch", self.index.to_string())],
            )
            .await?;
        let reading = scpi::parse_f64(&response)?;
        Ok(self.psu.core.scalar_result(reading, "voltage_meas", "V"))
    }

    pub async fn measure_current(&self) -> Result<MeasurementResult, LabError> {
        let response = self
            .psu
            .core
            .query_op(
                "measure_current",
                ":MEAS:CURR? CH${ch}",
                &[("ch", self.index.to_string())],
            )
            .await?;
        let reading = scpi::parse_f64(&response)?;
        Ok(self.psu.core.scalar_result(reading, "current_meas", "A"))
    }

    /// Ramp the voltage setpoint to `target` over `duration`, in
    /// [`SLEW_STEPS`] equal steps. Every intermediate setpoint passes the
    /// safety overlay.
    pub async fn slew(&self, target: f64, duration: Duration) -> Result<&Self, LabError> {
        self.psu
            .core
            .check_limit(self.index, Quantity::Voltage, target)?;

        let start_text = self
            .psu
            .core
            .query_op(
                "query_voltage",
                ":SOUR${ch}:VOLT?",
                &[("ch", self.index.to_string())],
            )
            .await?;
        let start = scpi::parse_f64(&start_text)?;
        let step_pause = duration / SLEW_STEPS;

        for step in 1..=SLEW_STEPS {
            let fraction = step as f64 / SLEW_STEPS as f64;
            let setpoint = start + (target - start) * fraction;
            self.set_voltage(setpoint).await?;
            tokio::time::sleep(step_pause).await;
        }
        Ok(self)
    }
}
