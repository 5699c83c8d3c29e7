//! Electronic DC load driver.

use crate::instrument::InstrumentCore;
use crate::scpi;
use lab_core::{LabError, MeasurementResult, ProfileError, Quantity};

/// Load regulation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    ConstantCurrent,
    ConstantVoltage,
    ConstantResistance,
    ConstantPower,
}

impl std::fmt::Display for LoadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadMode::ConstantCurrent => f.write_str("CURR"),
            LoadMode::ConstantVoltage => f.write_str("VOLT"),
            LoadMode::ConstantResistance => f.write_str("RES"),
            LoadMode::ConstantPower => f.write_str("POW"),
        }
    }
}

#[derive(Debug)]
pub struct DcLoad {
    core: InstrumentCore,
}

impl DcLoad {
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

    pub fn channel(&self, index: u32) -> Result<LoadChannelFacade<'_>, LabError> {
        if self.core.profile().channel(index).is_none() {
            return Err(ProfileError::Invalid {
                profile: self.core.profile().model_id.clone(),
                message: format!("load has no channel {}", index),
            }
            .into());
        }
        Ok(LoadChannelFacade { load: self, index })
    }
}

#[derive(Debug)]
pub struct LoadChannelFacade<'a> {
    load: &'a DcLoad,
    index: u32,
}

impl LoadChannelFacade<'_> {
    pub async fn set_mode(&self, mode: LoadMode) -> Result<&Self, LabError> {
        self.load
            .core
            .write_op(
                "load_mode",
                ":SOUR${ch}:FUNC ${mode}",
                &[("ch", self.index.to_string()), ("mode", mode.to_string())],
            )
            .await?;
        Ok(self)
    }

    pub async fn set_current(&self, amps: f64) -> Result<&Self, LabError> {
        self.load
            .core
            .check_limit(self.index, Quantity::Current, amps)?;
        self.load
            .core
            .write_op(
                "load_current",
                ":SOUR${ch}:CURR ${current}",
                &[
                    ("ch", self.index.to_string()),
                    ("current", scpi::fmt_f64(amps)),
                ],
            )
            .await?;
        Ok(self)
    }

    pub async fn enable_input(&self) -> Result<&Self, LabError> {
        self.input(true).await
    }

    pub async fn disable_input(&self) -> Result<&Self, LabError> {
        self.input(false).await
    }

    async fn input(&self, on: bool) -> Result<&Self, LabError> {
        self.load
            .core
            .write_op(
                "input_state",
                ":SOUR${ch}:INP ${state}",
                &[
                    ("ch", self.index.to_string()),
                    ("state", if on { "ON" } else { "OFF" }.to_string()),
                ],
            )
            .await?;
        Ok(self)
    }

    pub async fn measure_current(&self) -> Result<MeasurementResult, LabError> {
        let response = self
            .load
            .core
            .query_op(
                "measure_current",
                ":MEAS:CURR? CH${ch}",
                &[("ch", self.index.to_string())],
            )
            .await?;
        let reading = scpi::parse_f64(&response)?;
        Ok(self.load.core.scalar_result(reading, "current_meas", "A"))
    }

    pub async fn measure_voltage(&self) -> Result<MeasurementResult, LabError> {
        let response = self
            .load
            .core
            .query_op(
                "measure_voltage",
                ":MEAS:VOLT? CH${ch}",
                &[("ch", self.index.to_string())],
            )
            .await?;
        let reading = scpi::parse_f64(&response)?;
        Ok(self.load.core.scalar_result(reading, "voltage_meas", "V"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::SafetyOverlay;
    use lab_transport::SimTransport;

    async fn sim_load() -> DcLoad {
        let profile = lab_profiles::load_profile("keysight/EL34243A").unwrap();
        let safety =
            SafetyOverlay::build("test", "load", &profile.safety_schema, None).unwrap();
        let transport = SimTransport::from_profile(&profile, false, Some(13)).unwrap();
        let load = DcLoad::new(InstrumentCore::new(
            profile,
            Box::new(transport),
            "load",
            safety,
        ));
        load.connect().await.unwrap();
        load
    }

    #[tokio::test]
    async fn cc_mode_sinks_the_programmed_current() {
        let load = sim_load().await;
        let channel = load.channel(1).unwrap();
        channel
            .set_mode(LoadMode::ConstantCurrent)
            .await
            .unwrap()
            .set_current(1.5)
            .await
            .unwrap()
            .enable_input()
            .await
            .unwrap();
        let current = channel.measure_current().await.unwrap();
        assert_eq!(current.scalar().unwrap().value, 1.5);
    }

    #[tokio::test]
    async fn over_current_is_a_safety_rejection() {
        let load = sim_load().await;
        let err = load.channel(1).unwrap().set_current(50.0).await.unwrap_err();
        assert!(matches!(err, LabError::Safety(_)));
    }

    #[tokio::test]
    async fn disabled_input_measures_zero() {
        let load = sim_load().await;
        let channel = load.channel(2).unwrap();
        channel.set_current(2.0).await.unwrap();
        let current = channel.measure_current().await.unwrap();
        assert_eq!(current.scalar().unwrap().value, 0.0);
    }
}
