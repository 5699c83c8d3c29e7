//! Vector network analyzer driver.

use crate::instrument::InstrumentCore;
use crate::scpi;
use lab_core::{Cell, Column, DataFrame, LabError, MeasurementResult, MeasurementValue, TransportError};

#[derive(Debug)]
pub struct Vna {
    core: InstrumentCore,
}

impl Vna {
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

    pub async fn setup_sweep(
        &self,
        start_hz: f64,
        stop_hz: f64,
        points: u32,
    ) -> Result<(), LabError> {
        if stop_hz <= start_hz {
            return Err(TransportError::protocol(format!(
                "sweep stop {} must exceed start {}",
                stop_hz, start_hz
            ))
            .into());
        }
        self.core
            .write_op(
                "sweep_start",
                ":SENS:FREQ:STAR ${freq}",
                &[("freq", scpi::fmt_f64(start_hz))],
            )
            .await?;
        self.core
            .write_op(
                "sweep_stop",
                ":SENS:FREQ:STOP ${freq}",
                &[("freq", scpi::fmt_f64(stop_hz))],
            )
            .await?;
        self.core
            .write_op(
                "sweep_points",
                ":SENS:SWE:POIN ${points}",
                &[("points", points.to_string())],
            )
            .await
    }

    /// Select the measured S-parameter ("S11", "S21", …).
    pub async fn select_s_parameter(&self, sparam: &str) -> Result<(), LabError> {
        self.core
            .write_op(
                "sparam_define",
                ":CALC:PAR:DEF ${sparam}",
                &[("sparam", sparam.to_string())],
            )
            .await
    }

    /// Read the formatted trace as a frequency/magnitude frame.
    pub async fn read_trace(&self) -> Result<MeasurementResult, LabError> {
        let start = scpi::parse_f64(
            &self
                .core
                .query_op("query_start", ":SENS:FREQ:STAR?", &[])
                .await?,
        )?;
        let stop = scpi::parse_f64(
            &self
                .core
                .query_op("query_stop", ":SENS:FREQ:STOP?", &[])
                .await?,
        )?;
        let data_text = self
            .core
            .query_op("read_trace", ":CALC:DATA:FDAT?", &[])
            .await?;
        let magnitudes = scpi::parse_csv_f64(&data_text)?;

        let n = magnitudes.len();
        let frequencies: Vec<f64> = (0..n)
            .map(|i| {
                if n > 1 {
                    start + (stop - start) * i as f64 / (n as f64 - 1.0)
                } else {
                    start
                }
            })
            .collect();

        let frame = DataFrame::from_columns(vec![
            Column {
                name: "frequency".to_string(),
                unit: Some("Hz".to_string()),
                cells: frequencies.into_iter().map(Cell::Float).collect(),
            },
            Column {
                name: "magnitude".to_string(),
                unit: Some("dB".to_string()),
                cells: magnitudes.into_iter().map(Cell::Float).collect(),
            },
        ]);
        Ok(self.core.result(MeasurementValue::Tabular(frame), "dB"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::SafetyOverlay;
    use lab_transport::SimTransport;

    async fn sim_vna() -> Vna {
        let profile = lab_profiles::load_profile("keysight/E5061B").unwrap();
        let transport = SimTransport::from_profile(&profile, false, Some(23)).unwrap();
        let vna = Vna::new(InstrumentCore::new(
            profile,
            Box::new(transport),
            "vna",
            SafetyOverlay::unrestricted("vna"),
        ));
        vna.connect().await.unwrap();
        vna
    }

    #[tokio::test]
    async fn sweep_setup_validates_the_window() {
        let vna = sim_vna().await;
        vna.setup_sweep(1.0e6, 1.0e9, 11).await.unwrap();
        assert!(vna.setup_sweep(1.0e9, 1.0e6, 11).await.is_err());
    }

    #[tokio::test]
    async fn trace_interpolates_the_frequency_axis() {
        let vna = sim_vna().await;
        vna.setup_sweep(1.0e6, 1.1e6, 11).await.unwrap();
        vna.select_s_parameter("S21").await.unwrap();
        let result = vna.read_trace().await.unwrap();
        let MeasurementValue::Tabular(frame) = &result.value else {
            panic!("expected tabular frame");
        };
        assert_eq!(frame.len(), 11);
        let freq = frame.column("frequency").unwrap().f64_values();
        assert_eq!(freq[0], 1.0e6);
        assert!((freq[10] - 1.1e6).abs() < 1e-6);
    }
}
