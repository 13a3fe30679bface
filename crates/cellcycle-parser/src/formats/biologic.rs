use csv::ReaderBuilder;
use serde_json::Value;

use crate::errors::ParserError;
use crate::model::{FormatKind, RawCyclerRun};
use crate::registry::CyclerParser;

use super::common::{
    base_metadata, field, find_column, finish_run, parse_optional_f64, parse_required_f64,
    parse_required_i64, require_column, CycleAccumulator, Direction, ParseOptions, RawColumns,
    SourceFile,
};

const SIGNATURE: &str = "EC-Lab ASCII FILE";
const MILLI: f64 = 1000.0;

/// EC-Lab `.mpt` text exports.
pub struct BiologicParser;

impl BiologicParser {
    const NAME: &'static str = "BIOLOGIC";

    pub fn has_signature(first_line: &str) -> bool {
        first_line.trim_start().starts_with(SIGNATURE)
    }

    /// `Nb header lines : N` counts every line up to and including the column
    /// header.
    fn header_line_count(lines: &[&str]) -> Result<usize, ParserError> {
        let line = lines
            .iter()
            .take(8)
            .find(|line| line.trim_start().starts_with("Nb header lines"))
            .ok_or_else(|| ParserError::InvalidHeader {
                parser: Self::NAME,
                row_index: 1,
                message: "missing 'Nb header lines' declaration".to_string(),
            })?;
        let count = line
            .split(':')
            .nth(1)
            .map(str::trim)
            .and_then(|raw| raw.parse::<usize>().ok())
            .ok_or_else(|| ParserError::InvalidHeader {
                parser: Self::NAME,
                row_index: 1,
                message: format!("unreadable header line count '{}'", line.trim()),
            })?;
        if count == 0 || count > lines.len() {
            return Err(ParserError::InvalidHeader {
                parser: Self::NAME,
                row_index: 1,
                message: format!("header line count {count} exceeds file length"),
            });
        }
        Ok(count)
    }
}

impl CyclerParser for BiologicParser {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn kind(&self) -> FormatKind {
        FormatKind::Biologic
    }

    fn parse(&self, source: &SourceFile, _options: &ParseOptions) -> Result<RawCyclerRun, ParserError> {
        let p = Self::NAME;
        if !Self::has_signature(&source.first_line()) {
            return Err(ParserError::FormatMismatch {
                parser: p,
                reason: format!("first line is not '{SIGNATURE}'"),
            });
        }

        let text = source.text();
        let lines: Vec<&str> = text.lines().collect();
        let header_count = Self::header_line_count(&lines)?;
        let header_index = header_count - 1;
        let headers: Vec<String> = lines[header_index]
            .split('\t')
            .map(|h| h.trim().to_string())
            .collect();

        let time = require_column(p, &headers, &["time/s"], header_index)?;
        let voltage = require_column(p, &headers, &["Ewe/V", "Ecell/V", "<Ewe>/V"], header_index)?;
        let current = require_column(p, &headers, &["I/mA", "<I>/mA"], header_index)?;
        let cycle = require_column(p, &headers, &["cycle number"], header_index)?;
        let q_charge = require_column(p, &headers, &["Q charge/mA.h"], header_index)?;
        let q_discharge = require_column(p, &headers, &["Q discharge/mA.h"], header_index)?;
        let step = find_column(&headers, &["Ns"]);
        let half_cycle = find_column(&headers, &["half cycle"]);
        let e_charge = find_column(&headers, &["Energy charge/W.h"]);
        let e_discharge = find_column(&headers, &["Energy discharge/W.h"]);
        let temperature = find_column(&headers, &["Temperature/°C", "Temperature/C"]);

        let body = lines[header_count..].join("\n");
        let mut reader = ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .flexible(true)
            .from_reader(body.as_bytes());

        let mut columns = RawColumns::new(lines.len().saturating_sub(header_count));
        let mut capacity = CycleAccumulator::default();
        let mut energy = CycleAccumulator::default();

        for (offset, record) in reader.records().enumerate() {
            let line_index = header_count + offset;
            let record = record.map_err(ParserError::csv(p))?;
            if record.iter().all(|value| value.trim().is_empty()) {
                continue;
            }

            let cycle_index =
                parse_required_i64(p, field(&record, cycle), line_index, "cycle number")? as i32;
            let step_index = match step.or(half_cycle) {
                Some(idx) => parse_required_i64(p, field(&record, idx), line_index, "Ns")? as i32,
                None => 0,
            };
            let segment = match half_cycle {
                Some(idx) => parse_required_i64(p, field(&record, idx), line_index, "half cycle")?,
                None => i64::from(step_index),
            };

            let amps = parse_required_f64(p, field(&record, current), line_index, "I/mA")? / MILLI;
            let direction = Direction::from_current(amps);
            let q_value = match direction {
                Direction::Discharge => field(&record, q_discharge),
                _ => field(&record, q_charge),
            };
            let q_value = parse_required_f64(p, q_value, line_index, "Q/mA.h")? / MILLI;
            let e_column = match direction {
                Direction::Discharge => e_discharge,
                _ => e_charge,
            };
            let e_value = match e_column {
                Some(idx) => parse_optional_f64(p, field(&record, idx), line_index, "Energy/W.h")?
                    .unwrap_or(0.0),
                None => 0.0,
            };

            let (charge_capacity, discharge_capacity) =
                capacity.push_step_relative(cycle_index, segment, direction, q_value);
            let (charge_energy, discharge_energy) =
                energy.push_step_relative(cycle_index, segment, direction, e_value);

            columns.data_point.push(columns.data_point.len() as i64);
            columns.cycle_index.push(cycle_index);
            columns.step_index.push(step_index);
            columns
                .test_time
                .push(parse_required_f64(p, field(&record, time), line_index, "time/s")?);
            columns
                .voltage
                .push(parse_required_f64(p, field(&record, voltage), line_index, "Ewe/V")?);
            columns.current.push(amps);
            columns.charge_capacity.push(charge_capacity);
            columns.discharge_capacity.push(discharge_capacity);
            columns.charge_energy.push(charge_energy);
            columns.discharge_energy.push(discharge_energy);

            if let Some(idx) = temperature {
                let value = parse_optional_f64(p, field(&record, idx), line_index, "Temperature")?;
                columns.temperature_mut().push(value);
            }
        }

        let mut metadata = base_metadata(source);
        metadata.insert("barcode", Value::Null);
        metadata.insert("protocol", Value::Null);
        metadata.insert("channel_id", Value::Null);

        Ok(finish_run(p, columns, metadata)?.with_format(FormatKind::Biologic))
    }
}
