use std::path::Path;

use polars::prelude::*;

use crate::errors::ParserError;
use crate::model::{EISpectrum, RunMetadata};

use super::common::{find_column, parse_required_f64, SourceFile};
use super::maccor::MaccorParser;

const SWEEP_MARKER: &str = "Frequency Sweep";

pub(crate) fn is_sweep_marker(line: &str) -> bool {
    line.trim_start().starts_with(SWEEP_MARKER)
}

/// Reads the first `Frequency Sweep:` block found in `lines`: a marker line,
/// a tab separated column header, then numeric rows up to a blank line.
pub(crate) fn parse_eis_lines(
    parser: &'static str,
    lines: &[&str],
    metadata: &RunMetadata,
) -> Result<Option<EISpectrum>, ParserError> {
    let Some(marker) = lines.iter().position(|line| is_sweep_marker(line)) else {
        return Ok(None);
    };
    let header_index = marker + 1;
    let Some(header_line) = lines.get(header_index) else {
        return Err(ParserError::InvalidHeader {
            parser,
            row_index: header_index,
            message: "frequency sweep block has no column header".to_string(),
        });
    };

    let headers: Vec<String> = header_line
        .split('\t')
        .map(|h| h.trim().to_ascii_lowercase())
        .collect();
    let frequency = headers
        .iter()
        .position(|h| h.starts_with("freq"))
        .ok_or_else(|| ParserError::InvalidHeader {
            parser,
            row_index: header_index,
            message: "missing frequency column".to_string(),
        })?;
    let imaginary = find_column(&headers, &["zim(ohm)", "z''(ohm)", "z_imag", "imag"])
        .or_else(|| headers.iter().position(|h| h.starts_with("zim") || h.starts_with("z''")))
        .ok_or_else(|| ParserError::InvalidHeader {
            parser,
            row_index: header_index,
            message: "missing imaginary impedance column".to_string(),
        })?;
    let real = find_column(&headers, &["zre(ohm)", "z'(ohm)", "z_real", "real"])
        .or_else(|| {
            headers
                .iter()
                .enumerate()
                .position(|(idx, h)| idx != imaginary && (h.starts_with("zre") || h.starts_with("z'")))
        })
        .ok_or_else(|| ParserError::InvalidHeader {
            parser,
            row_index: header_index,
            message: "missing real impedance column".to_string(),
        })?;

    let mut freq_values = Vec::new();
    let mut real_values = Vec::new();
    let mut imag_values = Vec::new();
    for (offset, line) in lines[header_index + 1..].iter().enumerate() {
        if line.trim().is_empty() || is_sweep_marker(line) {
            break;
        }
        let line_index = header_index + 1 + offset;
        let fields: Vec<&str> = line.split('\t').collect();
        let get = |idx: usize| fields.get(idx).copied().unwrap_or_default();
        freq_values.push(parse_required_f64(parser, get(frequency), line_index, "frequency")?);
        real_values.push(parse_required_f64(parser, get(real), line_index, "z_real")?);
        imag_values.push(parse_required_f64(parser, get(imaginary), line_index, "z_imag")?);
    }

    if freq_values.is_empty() {
        return Err(ParserError::EmptyData { parser });
    }

    let df = DataFrame::new(vec![
        Series::new("frequency".into(), freq_values).into(),
        Series::new("z_real".into(), real_values).into(),
        Series::new("z_imag".into(), imag_values).into(),
    ])
    .map_err(ParserError::polars(parser))?;

    Ok(Some(EISpectrum::new(df, metadata.clone())))
}

impl EISpectrum {
    /// Parses a standalone Maccor impedance export.
    pub fn from_maccor_file(path: impl AsRef<Path>) -> Result<Self, ParserError> {
        const NAME: &str = "MACCOR_EIS";
        let source = SourceFile::read(path)?;
        let text = source.text();
        let lines: Vec<&str> = text.lines().collect();

        let first = lines.first().copied().unwrap_or_default();
        let metadata = match MaccorParser::parse_header_line(first.trim_start_matches('\u{feff}')) {
            Ok(header) => MaccorParser::build_metadata(&source, &header),
            Err(_) => super::common::base_metadata(&source),
        };

        parse_eis_lines(NAME, &lines, &metadata)?.ok_or_else(|| ParserError::FormatMismatch {
            parser: NAME,
            reason: "no frequency sweep block found".to_string(),
        })
    }
}
