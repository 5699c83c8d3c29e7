//! SCPI command templating and response grammar.
//!
//! Operations format their commands from profile-declared templates (or the
//! driver's built-in default) with `${placeholder}` substitution, and parse
//! responses as scalars, CSV lists, or decoded waveform samples.

use lab_core::{LabError, ProfileError, TransportError};
use lab_profiles::{Endianness, WaveformFormat};

/// Render a `${placeholder}` template. Every placeholder must be supplied;
/// unresolved placeholders are a profile error, caught before any I/O.
pub fn render(
    operation: &str,
    template: &str,
    args: &[(&str, String)],
) -> Result<String, LabError> {
    let mut out = template.to_string();
    for (name, value) in args {
        out = out.replace(&format!("${{{}}}", name), value);
    }
    if out.contains("${") {
        return Err(ProfileError::Invalid {
            profile: operation.to_string(),
            message: format!("template '{}' has unresolved placeholders: '{}'", template, out),
        }
        .into());
    }
    Ok(out)
}

/// Canonical SCPI rendering of a float (shortest round-trip form).
pub fn fmt_f64(value: f64) -> String {
    format!("{}", value)
}

pub fn parse_f64(response: &str) -> Result<f64, LabError> {
    response.trim().parse::<f64>().map_err(|_| {
        TransportError::protocol(format!("expected a number, got '{}'", response.trim())).into()
    })
}

pub fn parse_i64(response: &str) -> Result<i64, LabError> {
    let trimmed = response.trim();
    // instruments commonly answer integers in float notation ("+1.0E+01")
    if let Ok(i) = trimmed.parse::<i64>() {
        return Ok(i);
    }
    trimmed
        .parse::<f64>()
        .map(|f| f as i64)
        .map_err(|_| {
            TransportError::protocol(format!("expected an integer, got '{}'", trimmed)).into()
        })
}

pub fn parse_bool(response: &str) -> Result<bool, LabError> {
    match response.trim() {
        "1" | "ON" | "on" => Ok(true),
        "0" | "OFF" | "off" => Ok(false),
        other => Err(TransportError::protocol(format!(
            "expected a boolean, got '{}'",
            other
        ))
        .into()),
    }
}

pub fn parse_csv_f64(response: &str) -> Result<Vec<f64>, LabError> {
    response
        .trim()
        .split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| {
            part.trim().parse::<f64>().map_err(|_| {
                TransportError::protocol(format!("bad CSV element '{}'", part.trim())).into()
            })
        })
        .collect()
}

/// Parsed `:WAVeform:PREamble?` response.
///
/// Field order: format, type, points, count, xincrement, xorigin, xreference,
/// yincrement, yorigin, yreference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaveformPreamble {
    pub format: i64,
    pub acquisition_type: i64,
    pub points: usize,
    pub count: i64,
    pub x_increment: f64,
    pub x_origin: f64,
    pub x_reference: f64,
    pub y_increment: f64,
    pub y_origin: f64,
    pub y_reference: f64,
}

/// Preamble format codes.
pub const PREAMBLE_FORMAT_BYTE: i64 = 0;
pub const PREAMBLE_FORMAT_WORD: i64 = 1;
pub const PREAMBLE_FORMAT_ASCII: i64 = 4;

impl WaveformPreamble {
    pub fn parse(response: &str) -> Result<Self, LabError> {
        let fields = parse_csv_f64(response)?;
        if fields.len() != 10 {
            return Err(TransportError::protocol(format!(
                "preamble has {} fields, expected 10",
                fields.len()
            ))
            .into());
        }
        Ok(Self {
            format: fields[0] as i64,
            acquisition_type: fields[1] as i64,
            points: fields[2] as usize,
            count: fields[3] as i64,
            x_increment: fields[4],
            x_origin: fields[5],
            x_reference: fields[6],
            y_increment: fields[7],
            y_origin: fields[8],
            y_reference: fields[9],
        })
    }

    /// The declared transfer format this preamble corresponds to.
    pub fn declared_format(&self) -> Option<WaveformFormat> {
        match self.format {
            PREAMBLE_FORMAT_BYTE => Some(WaveformFormat::Byte),
            PREAMBLE_FORMAT_WORD => Some(WaveformFormat::Word),
            PREAMBLE_FORMAT_ASCII => Some(WaveformFormat::Ascii),
            _ => None,
        }
    }

    /// Time axis value for sample `i`.
    pub fn time_at(&self, i: usize) -> f64 {
        self.x_origin + (i as f64 - self.x_reference) * self.x_increment
    }

    /// Voltage for a raw sample level.
    pub fn volts_at(&self, level: f64) -> f64 {
        (level - self.y_reference) * self.y_increment + self.y_origin
    }
}

/// Decode a waveform payload to volts according to the transfer format.
pub fn decode_samples(
    payload: &[u8],
    format: WaveformFormat,
    preamble: &WaveformPreamble,
) -> Result<Vec<f64>, LabError> {
    match format {
        WaveformFormat::Ascii => {
            let text = std::str::from_utf8(payload).map_err(|_| {
                LabError::from(TransportError::protocol(
                    "ASCII waveform payload is not valid UTF-8",
                ))
            })?;
            parse_csv_f64(text)
        }
        WaveformFormat::Byte => Ok(payload
            .iter()
            .map(|&b| preamble.volts_at(b as f64))
            .collect()),
        WaveformFormat::Word => {
            if payload.len() % 2 != 0 {
                return Err(TransportError::protocol(
                    "WORD waveform payload has odd length",
                )
                .into());
            }
            Ok(payload
                .chunks_exact(2)
                .map(|pair| {
                    let level = u16::from_le_bytes([pair[0], pair[1]]) as f64;
                    preamble.volts_at(level)
                })
                .collect())
        }
    }
}

/// Encode normalized samples (-1.0..=1.0) as i16 words for an arbitrary
/// waveform upload.
pub fn encode_arb_i16(samples: &[f64], endianness: Endianness) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let clamped = sample.clamp(-1.0, 1.0);
        let word = (clamped * i16::MAX as f64) as i16;
        let bytes = match endianness {
            Endianness::Little => word.to_le_bytes(),
            Endianness::Big => word.to_be_bytes(),
        };
        out.extend_from_slice(&bytes);
    }
    out
}

/// Parse one instrument error-queue entry (`-222,"Data out of range"`).
pub fn parse_error_entry(entry: &str) -> lab_core::InstrumentError {
    let trimmed = entry.trim();
    let (code, text) = match trimmed.split_once(',') {
        Some((code, text)) => (
            code.trim().parse::<i32>().unwrap_or(-1),
            text.trim().trim_matches('"').to_string(),
        ),
        None => (-1, trimmed.to_string()),
    };
    lab_core::InstrumentError::new(code, text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_all_placeholders() {
        let cmd = render(
            "set_voltage",
            ":SOUR${ch}:VOLT ${voltage}",
            &[("ch", "1".into()), ("voltage", "5.5".into())],
        )
        .unwrap();
        assert_eq!(cmd, ":SOUR1:VOLT 5.5");
    }

    #[test]
    fn render_rejects_unresolved_placeholders() {
        let err = render("set_voltage", ":SOUR${ch}:VOLT ${voltage}", &[("ch", "1".into())]);
        assert!(err.is_err());
    }

    #[test]
    fn preamble_parses_and_derives_axes() {
        let preamble =
            WaveformPreamble::parse("4,0,16,1,1.0E-6,0.0,0,1.0E-2,0.0,128").unwrap();
        assert_eq!(preamble.points, 16);
        assert_eq!(preamble.declared_format(), Some(WaveformFormat::Ascii));
        assert!((preamble.time_at(1) - 1.0e-6).abs() < 1e-18);
        // byte level 128 sits at y_origin
        assert!((preamble.volts_at(128.0) - 0.0).abs() < 1e-12);
    }

    #[test]
    fn byte_samples_decode_through_the_preamble() {
        let preamble =
            WaveformPreamble::parse("0,0,4,1,1.0E-6,0.0,0,1.0E-2,0.0,128").unwrap();
        let volts = decode_samples(&[128, 138, 118, 128], WaveformFormat::Byte, &preamble)
            .unwrap();
        assert!((volts[0] - 0.0).abs() < 1e-12);
        assert!((volts[1] - 0.1).abs() < 1e-12);
        assert!((volts[2] + 0.1).abs() < 1e-12);
    }

    #[test]
    fn word_samples_respect_little_endian_pairs() {
        let preamble =
            WaveformPreamble::parse("1,0,2,1,1.0E-6,0.0,0,1.0E-3,0.0,0", ).unwrap();
        // levels 100 and 200
        let payload = [100u8, 0, 200, 0];
        let volts = decode_samples(&payload, WaveformFormat::Word, &preamble).unwrap();
        assert!((volts[0] - 0.1).abs() < 1e-12);
        assert!((volts[1] - 0.2).abs() < 1e-12);
    }

    #[test]
    fn arb_encoding_clamps_and_orders_bytes() {
        let little = encode_arb_i16(&[1.0, -1.0], Endianness::Little);
        assert_eq!(little.len(), 4);
        assert_eq!(
            i16::from_le_bytes([little[0], little[1]]),
            i16::MAX
        );
        let big = encode_arb_i16(&[1.0], Endianness::Big);
        assert_eq!(i16::from_be_bytes([big[0], big[1]]), i16::MAX);
        // out-of-range inputs clamp instead of wrapping
        let clamped = encode_arb_i16(&[7.5], Endianness::Little);
        assert_eq!(i16::from_le_bytes([clamped[0], clamped[1]]), i16::MAX);
    }

    #[test]
    fn error_entries_parse_code_and_text() {
        let err = parse_error_entry("-222,\"Data out of range\"");
        assert_eq!(err.code, -222);
        assert_eq!(err.text, "Data out of range");
    }

    #[test]
    fn integers_in_float_notation_parse() {
        assert_eq!(parse_i64("+1.6E+01").unwrap(), 16);
        assert_eq!(parse_i64("11").unwrap(), 11);
        assert!(parse_i64("eleven").is_err());
    }
}
