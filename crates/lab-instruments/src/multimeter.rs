//! Digital multimeter driver.

use crate::instrument::InstrumentCore;
use crate::scpi;
use lab_core::{LabError, MeasurementResult};

/// Integration time in power-line cycles.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IntegrationTime {
    Fast,
    Normal,
    Slow,
    Nplc(f64),
}

impl IntegrationTime {
    pub fn nplc(&self) -> f64 {
        match self {
            IntegrationTime::Fast => 0.02,
            IntegrationTime::Normal => 1.0,
            IntegrationTime::Slow => 10.0,
            IntegrationTime::Nplc(n) => *n,
        }
    }
}

#[derive(Debug)]
pub struct Multimeter {
    core: InstrumentCore,
}

impl Multimeter {
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

    pub async fn measure_voltage_dc(&self) -> Result<MeasurementResult, LabError> {
        let response = self
            .core
            .query_op("measure_voltage_dc", ":MEAS:VOLT:DC?", &[])
            .await?;
        let reading = scpi::parse_f64(&response)?;
        Ok(self.core.scalar_result(reading, "voltage_dc", "V"))
    }

    pub async fn measure_voltage_ac(&self) -> Result<MeasurementResult, LabError> {
        let response = self
            .core
            .query_op("measure_voltage_ac", ":MEAS:VOLT:AC?", &[])
            .await?;
        let reading = scpi::parse_f64(&response)?;
        Ok(self.core.scalar_result(reading, "voltage_ac", "V"))
    }

    pub async fn measure_current_dc(&self) -> Result<MeasurementResult, LabError> {
        let response = self
            .core
            .query_op("measure_current_dc", ":MEAS:CURR:DC?", &[])
            .await?;
        let reading = scpi::parse_f64(&response)?;
        Ok(self.core.scalar_result(reading, "current_dc", "A"))
    }

    pub async fn set_integration_time(&self, time: IntegrationTime) -> Result<(), LabError> {
        self.core
            .write_op(
                "set_nplc",
                ":SENS:VOLT:DC:NPLC ${nplc}",
                &[("nplc", scpi::fmt_f64(time.nplc()))],
            )
            .await
    }

    pub async fn integration_time(&self) -> Result<f64, LabError> {
        let response = self
            .core
            .query_op("query_nplc", ":SENS:VOLT:DC:NPLC?", &[])
            .await?;
        scpi::parse_f64(&response)
    }
}
