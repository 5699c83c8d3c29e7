//! Oscilloscope driver.
//!
//! Selector facades (`channel(i)`, `trigger()`, `acquisition()`) execute
//! eagerly and return themselves, so configuration reads as one chain:
//!
//! ```rust,ignore
//! scope.channel(1)?.setup(0.5, 0.0, Coupling::Dc).await?.enable().await?;
//! scope.trigger().setup_edge(TriggerSource::Channel(1), 0.25, Slope::Positive).await?;
//! let frame = scope.read_channels(&[1]).await?;
//! ```

use crate::instrument::InstrumentCore;
use crate::scpi::{self, WaveformPreamble};
use lab_core::{
    Cell, Column, DataFrame, LabError, MeasurementResult, MeasurementValue, ProfileError,
    Quantity, TransportError,
};
use lab_profiles::WaveformFormat;

/// Channel input coupling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coupling {
    Ac,
    Dc,
}

impl std::fmt::Display for Coupling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Coupling::Ac => f.write_str("AC"),
            Coupling::Dc => f.write_str("DC"),
        }
    }
}

/// Edge trigger source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Channel(u32),
    External,
    Line,
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerSource::Channel(i) => write!(f, "CHAN{}", i),
            TriggerSource::External => f.write_str("EXT"),
            TriggerSource::Line => f.write_str("LINE"),
        }
    }
}

/// Edge trigger slope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slope {
    Positive,
    Negative,
    Either,
}

impl std::fmt::Display for Slope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Slope::Positive => f.write_str("POS"),
            Slope::Negative => f.write_str("NEG"),
            Slope::Either => f.write_str("EITH"),
        }
    }
}

/// Acquisition type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionType {
    Normal,
    Average,
    HighResolution,
    PeakDetect,
}

impl std::fmt::Display for AcquisitionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AcquisitionType::Normal => f.write_str("NORM"),
            AcquisitionType::Average => f.write_str("AVER"),
            AcquisitionType::HighResolution => f.write_str("HRES"),
            AcquisitionType::PeakDetect => f.write_str("PEAK"),
        }
    }
}

/// Acquisition mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionMode {
    RealTime,
    Segmented,
}

impl std::fmt::Display for AcquisitionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AcquisitionMode::RealTime => f.write_str("RTIM"),
            AcquisitionMode::Segmented => f.write_str("SEGM"),
        }
    }
}

fn format_keyword(format: WaveformFormat) -> &'static str {
    match format {
        WaveformFormat::Ascii => "ASC",
        WaveformFormat::Byte => "BYTE",
        WaveformFormat::Word => "WORD",
    }
}

/// Oscilloscope driver bound to one transport session.
#[derive(Debug)]
pub struct Oscilloscope {
    core: InstrumentCore,
}

impl Oscilloscope {
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

    /// Channel selector. Fails before any I/O if the profile does not
    /// declare the channel.
    pub fn channel(&self, index: u32) -> Result<ChannelFacade<'_>, LabError> {
        if self.core.profile().channel(index).is_none() {
            return Err(ProfileError::Invalid {
                profile: self.core.profile().model_id.clone(),
                message: format!("oscilloscope has no channel {}", index),
            }
            .into());
        }
        Ok(ChannelFacade { scope: self, index })
    }

    pub fn trigger(&self) -> TriggerFacade<'_> {
        TriggerFacade { scope: self }
    }

    pub fn acquisition(&self) -> AcquisitionFacade<'_> {
        AcquisitionFacade { scope: self }
    }

    pub async fn set_timebase(&self, scale_s: f64) -> Result<(), LabError> {
        self.core
            .write_op(
                "timebase_scale",
                ":TIM:SCAL ${scale}",
                &[("scale", scpi::fmt_f64(scale_s))],
            )
            .await
    }

    /// Read one or more channels as a waveform frame: a shared time column
    /// plus one voltage column per channel, reconstructed from the preamble.
    pub async fn read_channels(&self, indices: &[u32]) -> Result<MeasurementResult, LabError> {
        let declared = self.core.profile().readout.waveform_format;
        let mut frame_columns: Vec<Column> = Vec::with_capacity(indices.len() + 1);
        let mut time_column: Option<Vec<f64>> = None;
        let mut points_expected: Option<usize> = None;

        for &index in indices {
            if self.core.profile().channel(index).is_none() {
                return Err(ProfileError::Invalid {
                    profile: self.core.profile().model_id.clone(),
                    message: format!("oscilloscope has no channel {}", index),
                }
                .into());
            }

            self.core
                .write_op(
                    "waveform_source",
                    ":WAV:SOUR CHAN${ch}",
                    &[("ch", index.to_string())],
                )
                .await?;
            self.core
                .write_op(
                    "waveform_format",
                    ":WAV:FORM ${format}",
                    &[("format", format_keyword(declared).to_string())],
                )
                .await?;

            let preamble_text = self
                .core
                .query_op("waveform_preamble", ":WAV:PRE?", &[])
                .await?;
            let preamble = WaveformPreamble::parse(&preamble_text)?;
            if preamble.declared_format() != Some(declared) {
                return Err(TransportError::protocol(format!(
                    "waveform format mismatch: instrument reports code {}, profile declares {:?}",
                    preamble.format, declared
                ))
                .into());
            }

            let volts = match declared {
                WaveformFormat::Ascii => {
                    let data = self
                        .core
                        .query_op("waveform_data", ":WAV:DATA?", &[])
                        .await?;
                    scpi::parse_csv_f64(&data)?
                }
                WaveformFormat::Byte | WaveformFormat::Word => {
                    let payload = self
                        .core
                        .query_raw_op("waveform_data", ":WAV:DATA?", &[])
                        .await?;
                    scpi::decode_samples(&payload, declared, &preamble)?
                }
            };

            if volts.len() != preamble.points {
                return Err(TransportError::protocol(format!(
                    "channel {}: preamble declares {} points, payload has {}",
                    index,
                    preamble.points,
                    volts.len()
                ))
                .into());
            }
            if let Some(expected) = points_expected {
                if preamble.points != expected {
                    return Err(TransportError::protocol(format!(
                        "channel {}: record length {} differs from first channel's {}",
                        index, preamble.points, expected
                    ))
                    .into());
                }
            } else {
                points_expected = Some(preamble.points);
                time_column =
                    Some((0..preamble.points).map(|i| preamble.time_at(i)).collect());
            }

            frame_columns.push(Column {
                name: format!("ch{}", index),
                unit: Some("V".to_string()),
                cells: volts.into_iter().map(Cell::Float).collect(),
            });
        }

        let mut columns = Vec::with_capacity(frame_columns.len() + 1);
        if let Some(time) = time_column {
            columns.push(Column {
                name: "time".to_string(),
                unit: Some("s".to_string()),
                cells: time.into_iter().map(Cell::Float).collect(),
            });
        }
        columns.extend(frame_columns);

        let frame = DataFrame::from_columns(columns);
        Ok(self.core.result(MeasurementValue::Waveform(frame), "V"))
    }
}

/// Per-channel configuration facade.
#[derive(Debug)]
pub struct ChannelFacade<'a> {
    scope: &'a Oscilloscope,
    index: u32,
}

impl ChannelFacade<'_> {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Vertical scale, offset, and coupling in one call.
    pub async fn setup(
        &self,
        scale: f64,
        offset: f64,
        coupling: Coupling,
    ) -> Result<&Self, LabError> {
        self.scope
            .core
            .check_limit(self.index, Quantity::Voltage, offset)?;
        let ch = self.index.to_string();
        self.scope
            .core
            .write_op(
                "channel_scale",
                ":CHAN${ch}:SCAL ${scale}",
                &[("ch", ch.clone()), ("scale", scpi::fmt_f64(scale))],
            )
            .await?;
        self.scope
            .core
            .write_op(
                "channel_offset",
                ":CHAN${ch}:OFFS ${offset}",
                &[("ch", ch.clone()), ("offset", scpi::fmt_f64(offset))],
            )
            .await?;
        self.scope
            .core
            .write_op(
                "channel_coupling",
                ":CHAN${ch}:COUP ${coupling}",
                &[("ch", ch), ("coupling", coupling.to_string())],
            )
            .await?;
        Ok(self)
    }

    pub async fn enable(&self) -> Result<&Self, LabError> {
        self.display(true).await
    }

    pub async fn disable(&self) -> Result<&Self, LabError> {
        self.display(false).await
    }

    async fn display(&self, on: bool) -> Result<&Self, LabError> {
        self.scope
            .core
            .write_op(
                "channel_display",
                ":CHAN${ch}:DISP ${state}",
                &[
                    ("ch", self.index.to_string()),
                    ("state", if on { "ON" } else { "OFF" }.to_string()),
                ],
            )
            .await?;
        Ok(self)
    }

    pub async fn probe_attenuation(&self, factor: f64) -> Result<&Self, LabError> {
        self.scope
            .core
            .write_op(
                "channel_probe",
                ":CHAN${ch}:PROB ${factor}",
                &[
                    ("ch", self.index.to_string()),
                    ("factor", scpi::fmt_f64(factor)),
                ],
            )
            .await?;
        Ok(self)
    }
}

/// Trigger configuration facade.
pub struct TriggerFacade<'a> {
    scope: &'a Oscilloscope,
}

impl std::fmt::Debug for TriggerFacade<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerFacade").finish_non_exhaustive()
    }
}

impl TriggerFacade<'_> {
    /// Configure an edge trigger.
    pub async fn setup_edge(
        &self,
        source: TriggerSource,
        level: f64,
        slope: Slope,
    ) -> Result<&Self, LabError> {
        if let TriggerSource::Channel(index) = source {
            if self.scope.core.profile().channel(index).is_none() {
                return Err(ProfileError::Invalid {
                    profile: self.scope.core.profile().model_id.clone(),
                    message: format!("trigger source channel {} does not exist", index),
                }
                .into());
            }
            self.scope
                .core
                .check_limit(index, Quantity::Voltage, level)?;
        }
        self.scope
            .core
            .write_op(
                "trigger_edge_source",
                ":TRIG:EDGE:SOUR ${source}",
                &[("source", source.to_string())],
            )
            .await?;
        self.scope
            .core
            .write_op(
                "trigger_edge_level",
                ":TRIG:EDGE:LEV ${level}",
                &[("level", scpi::fmt_f64(level))],
            )
            .await?;
        self.scope
            .core
            .write_op(
                "trigger_edge_slope",
                ":TRIG:EDGE:SLOP ${slope}",
                &[("slope", slope.to_string())],
            )
            .await?;
        Ok(self)
    }

    /// Arm for a single acquisition.
    pub async fn single(&self) -> Result<&Self, LabError> {
        self.scope.core.write_op("trigger_single", ":SING", &[]).await?;
        Ok(self)
    }

    pub async fn run(&self) -> Result<&Self, LabError> {
        self.scope.core.write_op("trigger_run", ":RUN", &[]).await?;
        Ok(self)
    }

    pub async fn stop(&self) -> Result<&Self, LabError> {
        self.scope.core.write_op("trigger_stop", ":STOP", &[]).await?;
        Ok(self)
    }
}

/// Acquisition configuration facade.
#[derive(Debug)]
pub struct AcquisitionFacade<'a> {
    scope: &'a Oscilloscope,
}

impl AcquisitionFacade<'_> {
    pub async fn set_type(&self, acq_type: AcquisitionType) -> Result<&Self, LabError> {
        self.scope
            .core
            .write_op(
                "acquire_type",
                ":ACQ:TYPE ${type}",
                &[("type", acq_type.to_string())],
            )
            .await?;
        Ok(self)
    }

    pub async fn set_mode(&self, mode: AcquisitionMode) -> Result<&Self, LabError> {
        self.scope
            .core
            .write_op(
                "acquire_mode",
                ":ACQ:MODE ${mode}",
                &[("mode", mode.to_string())],
            )
            .await?;
        Ok(self)
    }
}
