//! Spectrum analyzer driver.

use crate::instrument::InstrumentCore;
use crate::scpi;
use lab_core::{Cell, Column, DataFrame, LabError, MeasurementResult, MeasurementValue};

#[derive(Debug)]
pub struct SpectrumAnalyzer {
    core: InstrumentCore,
}

impl SpectrumAnalyzer {
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

    pub async fn set_center_frequency(&self, hz: f64) -> Result<(), LabError> {
        self.core
            .write_op(
                "freq_center",
                ":FREQ:CENT ${freq}",
                &[("freq", scpi::fmt_f64(hz))],
            )
            .await
    }

    pub async fn set_span(&self, hz: f64) -> Result<(), LabError> {
        self.core
            .write_op("freq_span", ":FREQ:SPAN ${freq}", &[("freq", scpi::fmt_f64(hz))])
            .await
    }

    pub async fn set_resolution_bandwidth(&self, hz: f64) -> Result<(), LabError> {
        self.core
            .write_op("rbw", ":BAND ${rbw}", &[("rbw", scpi::fmt_f64(hz))])
            .await
    }

    /// Move marker 1 to the peak and read back `(frequency_hz, amplitude_dbm)`.
    pub async fn marker_peak(&self) -> Result<(f64, f64), LabError> {
        self.core
            .write_op("marker_peak", ":CALC:MARK1:MAX", &[])
            .await?;
        let freq = self
            .core
            .query_op("marker_x", ":CALC:MARK1:X?", &[])
            .await?;
        let ampl = self
            .core
            .query_op("marker_y", ":CALC:MARK1:Y?", &[])
            .await?;
        Ok((scpi::parse_f64(&freq)?, scpi::parse_f64(&ampl)?))
    }

    /// Read the current trace as a tabular frame with a derived frequency
    /// axis (`center - span/2 .. center + span/2`).
    pub async fn read_trace(&self) -> Result<MeasurementResult, LabError> {
        let center = scpi::parse_f64(
            &self.core.query_op("query_center", ":FREQ:CENT?", &[]).await?,
        )?;
        let span = scpi::parse_f64(
            &self.core.query_op("query_span", ":FREQ:SPAN?", &[]).await?,
        )?;
        let trace_text = self
            .core
            .query_op("read_trace", ":TRAC? TRACE1", &[])
            .await?;
        let amplitudes = scpi::parse_csv_f64(&trace_text)?;

        let n = amplitudes.len();
        let frequencies: Vec<f64> = (0..n)
            .map(|i| {
                if n > 1 {
                    center - span / 2.0 + span * i as f64 / (n as f64 - 1.0)
                } else {
                    center
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
                name: "amplitude".to_string(),
                unit: Some("dBm".to_string()),
                cells: amplitudes.into_iter().map(Cell::Float).collect(),
            },
        ]);
        Ok(self.core.result(MeasurementValue::Tabular(frame), "dBm"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::SafetyOverlay;
    use lab_transport::SimTransport;

    async fn sim_sa() -> SpectrumAnalyzer {
        let profile = lab_profiles::load_profile("keysight/N9320B").unwrap();
        let transport = SimTransport::from_profile(&profile, false, Some(19)).unwrap();
        let sa = SpectrumAnalyzer::new(InstrumentCore::new(
            profile,
            Box::new(transport),
            "sa",
            SafetyOverlay::unrestricted("sa"),
        ));
        sa.connect().await.unwrap();
        sa
    }

    #[tokio::test]
    async fn marker_peak_reports_center_frequency() {
        let sa = sim_sa().await;
        sa.set_center_frequency(2.4e9).await.unwrap();
        let (freq, ampl) = sa.marker_peak().await.unwrap();
        assert_eq!(freq, 2.4e9);
        assert_eq!(ampl, -10.5);
    }

    #[tokio::test]
    async fn trace_frame_spans_the_configured_window() {
        let sa = sim_sa().await;
        sa.set_center_frequency(1.0e9).await.unwrap();
        sa.set_span(2.0e8).await.unwrap();
        let result = sa.read_trace().await.unwrap();
        let MeasurementValue::Tabular(frame) = &result.value else {
            panic!("expected tabular frame");
        };
        assert_eq!(frame.len(), 11);
        let freq = frame.column("frequency").unwrap().f64_values();
        assert_eq!(freq[0], 0.9e9);
        assert_eq!(freq[10], 1.1e9);
        assert_eq!(
            frame.column("amplitude").unwrap().unit.as_deref(),
            Some("dBm")
        );
    }
}
