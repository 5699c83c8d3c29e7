//! RF power meter driver.

use crate::instrument::InstrumentCore;
use crate::scpi;
use lab_core::{LabError, MeasurementResult};

#[derive(Debug)]
pub struct PowerMeter {
    core: InstrumentCore,
}

impl PowerMeter {
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

    pub async fn read_power(&self) -> Result<MeasurementResult, LabError> {
        let response = self.core.query_op("read_power", "READ?", &[]).await?;
        let reading = scpi::parse_f64(&response)?;
        Ok(self.core.scalar_result(reading, "power_avg", "dBm"))
    }

    /// Frequency-dependent calibration correction.
    pub async fn set_frequency(&self, hz: f64) -> Result<(), LabError> {
        self.core
            .write_op(
                "set_frequency",
                ":SENS:FREQ ${freq}",
                &[("freq", scpi::fmt_f64(hz))],
            )
            .await
    }

    pub async fn zero(&self) -> Result<(), LabError> {
        self.core.write_op("zero", "CAL:ZERO:AUTO ONCE", &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::SafetyOverlay;
    use lab_transport::SimTransport;

    async fn sim_meter() -> PowerMeter {
        let profile = lab_profiles::load_profile("keysight/U2000A").unwrap();
        let transport = SimTransport::from_profile(&profile, false, Some(29)).unwrap();
        let meter = PowerMeter::new(InstrumentCore::new(
            profile,
            Box::new(transport),
            "pm",
            SafetyOverlay::unrestricted("pm"),
        ));
        meter.connect().await.unwrap();
        meter
    }

    #[tokio::test]
    async fn power_reading_has_units_and_sigma() {
        let meter = sim_meter().await;
        meter.set_frequency(2.4e9).await.unwrap();
        meter.zero().await.unwrap();
        let power = meter.read_power().await.unwrap();
        assert_eq!(power.scalar().unwrap().value, -10.0);
        assert_eq!(power.units, "dBm");
        assert!(power.scalar().unwrap().sigma.is_some());
    }
}
