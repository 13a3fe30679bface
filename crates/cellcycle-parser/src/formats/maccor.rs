use csv::{ReaderBuilder, StringRecord};
use serde_json::Value;

use crate::errors::ParserError;
use crate::model::{FormatKind, RawCyclerRun, RunMetadata};
use crate::registry::CyclerParser;

use super::common::{
    base_metadata, field, find_column, finish_run, parse_optional_f64, parse_required_f64,
    parse_required_i64, require_column, to_iso_datetime, CycleAccumulator, Direction,
    ParseOptions, RawColumns, SourceFile,
};
use super::maccor_eis::{is_sweep_marker, parse_eis_lines};

pub struct MaccorParser;

struct MaccorLayout {
    record: usize,
    cycle: usize,
    step: usize,
    test_time: usize,
    amp_hr: usize,
    watt_hr: usize,
    amps: usize,
    volts: usize,
    state: Option<usize>,
    dpt_time: Option<usize>,
    dcir: Option<usize>,
    temperature: Option<usize>,
}

impl MaccorParser {
    const NAME: &'static str = "MACCOR";

    /// `.070` style extensions carry the channel number.
    pub fn channel_from_extension(ext: &str) -> Option<i64> {
        if !ext.is_empty() && ext.len() <= 3 && ext.chars().all(|c| c.is_ascii_digit()) {
            ext.parse().ok()
        } else {
            None
        }
    }

    /// First line: `Today's Date<TAB>value<TAB>Date of Test:<TAB>value...`.
    pub(crate) fn parse_header_line(line: &str) -> Result<Vec<(String, String)>, ParserError> {
        if !line.trim_start().starts_with("Today's Date") {
            return Err(ParserError::FormatMismatch {
                parser: Self::NAME,
                reason: "first line does not start with \"Today's Date\"".to_string(),
            });
        }
        let tokens: Vec<&str> = line.split('\t').map(str::trim).collect();
        let mut pairs = Vec::new();
        let mut idx = 0;
        while idx < tokens.len() {
            let key = tokens[idx];
            if key.is_empty() {
                idx += 1;
                continue;
            }
            let value = tokens.get(idx + 1).copied().unwrap_or_default();
            pairs.push((key.trim_end_matches(':').to_string(), value.to_string()));
            idx += 2;
        }
        Ok(pairs)
    }

    fn layout(headers: &[String]) -> Result<MaccorLayout, ParserError> {
        let p = Self::NAME;
        Ok(MaccorLayout {
            record: require_column(p, headers, &["Rec#"], 1)?,
            cycle: require_column(p, headers, &["Cyc#"], 1)?,
            step: require_column(p, headers, &["Step"], 1)?,
            test_time: require_column(p, headers, &["Test (Sec)", "TestTime"], 1)?,
            amp_hr: require_column(p, headers, &["Amp-hr", "Capacity"], 1)?,
            watt_hr: require_column(p, headers, &["Watt-hr", "Energy"], 1)?,
            amps: require_column(p, headers, &["Amps", "Current"], 1)?,
            volts: require_column(p, headers, &["Volts", "Voltage"], 1)?,
            state: find_column(headers, &["State", "MD"]),
            dpt_time: find_column(headers, &["DPt Time", "DPT Time"]),
            dcir: find_column(headers, &["DCIR/Ohms", "DCIR"]),
            temperature: find_column(headers, &["Temp 1", "Temp1"]),
        })
    }

    fn direction(state: &str) -> Direction {
        match state.trim().chars().next() {
            Some('C') | Some('c') => Direction::Charge,
            Some('D') | Some('d') => Direction::Discharge,
            _ => Direction::Idle,
        }
    }

    pub(crate) fn build_metadata(
        source: &SourceFile,
        header: &[(String, String)],
    ) -> RunMetadata {
        let mut metadata = base_metadata(source);
        let lookup = |key: &str| {
            header
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        metadata.insert_opt("barcode", lookup("Comment/Barcode"));
        metadata.insert_opt("protocol", lookup("Procedure"));
        let start = lookup("Date of Test").map(|raw| to_iso_datetime(&raw).unwrap_or(raw));
        metadata.insert_opt("start_datetime", start);
        let channel = source
            .extension()
            .and_then(|ext| Self::channel_from_extension(&ext));
        metadata.insert("channel_id", channel.map(Value::from).unwrap_or(Value::Null));
        metadata
    }

    fn parse_rows(layout: &MaccorLayout, lines: &[&str]) -> Result<RawColumns, ParserError> {
        let body = lines.join("\n");
        let mut reader = ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .flexible(true)
            .from_reader(body.as_bytes());

        let mut columns = RawColumns::new(lines.len());
        let mut capacity = CycleAccumulator::default();
        let mut energy = CycleAccumulator::default();
        let p = Self::NAME;

        for (offset, record) in reader.records().enumerate() {
            // two header lines precede the body
            let line_index = offset + 2;
            let record: StringRecord = record.map_err(ParserError::csv(p))?;

            let cycle = parse_required_i64(p, field(&record, layout.cycle), line_index, "Cyc#")? as i32;
            let step = parse_required_i64(p, field(&record, layout.step), line_index, "Step")?;
            let direction = layout
                .state
                .map(|idx| Self::direction(field(&record, idx)))
                .unwrap_or(Direction::Idle);

            let amps = parse_required_f64(p, field(&record, layout.amps), line_index, "Amps")?;
            let current = match direction {
                Direction::Discharge => -amps.abs(),
                Direction::Charge => amps.abs(),
                Direction::Idle => amps,
            };
            let direction = if layout.state.is_some() {
                direction
            } else {
                Direction::from_current(current)
            };

            let amp_hr = parse_required_f64(p, field(&record, layout.amp_hr), line_index, "Amp-hr")?;
            let watt_hr =
                parse_required_f64(p, field(&record, layout.watt_hr), line_index, "Watt-hr")?;
            let (charge_capacity, discharge_capacity) =
                capacity.push_step_relative(cycle, step, direction, amp_hr);
            let (charge_energy, discharge_energy) =
                energy.push_step_relative(cycle, step, direction, watt_hr);

            columns.data_point.push(parse_required_i64(
                p,
                field(&record, layout.record),
                line_index,
                "Rec#",
            )?);
            columns.cycle_index.push(cycle);
            columns.step_index.push(step as i32);
            columns.test_time.push(parse_required_f64(
                p,
                field(&record, layout.test_time),
                line_index,
                "Test (Sec)",
            )?);
            columns.voltage.push(parse_required_f64(
                p,
                field(&record, layout.volts),
                line_index,
                "Volts",
            )?);
            columns.current.push(current);
            columns.charge_capacity.push(charge_capacity);
            columns.discharge_capacity.push(discharge_capacity);
            columns.charge_energy.push(charge_energy);
            columns.discharge_energy.push(discharge_energy);

            if let Some(idx) = layout.temperature {
                let value = parse_optional_f64(p, field(&record, idx), line_index, "Temp 1")?;
                columns.temperature_mut().push(value);
            }
            if let Some(idx) = layout.dcir {
                let value = parse_optional_f64(p, field(&record, idx), line_index, "DCIR/Ohms")?;
                columns.internal_resistance_mut().push(value);
            }
            if let Some(idx) = layout.dpt_time {
                columns
                    .date_time_mut()
                    .push(to_iso_datetime(field(&record, idx)));
            }
        }

        Ok(columns)
    }
}

impl CyclerParser for MaccorParser {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn kind(&self) -> FormatKind {
        FormatKind::Maccor
    }

    fn parse(&self, source: &SourceFile, options: &ParseOptions) -> Result<RawCyclerRun, ParserError> {
        let text = source.text();
        let lines: Vec<&str> = text.lines().collect();
        let first = lines.first().copied().unwrap_or_default();
        let header = Self::parse_header_line(first.trim_start_matches('\u{feff}'))?;

        let column_line = lines.get(1).ok_or_else(|| ParserError::InvalidHeader {
            parser: Self::NAME,
            row_index: 1,
            message: "missing column header line".to_string(),
        })?;
        let headers: Vec<String> = column_line.split('\t').map(|h| h.trim().to_string()).collect();
        let layout = Self::layout(&headers)?;

        let body_end = lines
            .iter()
            .enumerate()
            .skip(2)
            .find(|(_, line)| line.trim().is_empty() || is_sweep_marker(line))
            .map(|(idx, _)| idx)
            .unwrap_or(lines.len());
        let columns = Self::parse_rows(&layout, &lines[2..body_end])?;

        let metadata = Self::build_metadata(source, &header);

        let eis = if options.include_eis {
            parse_eis_lines(Self::NAME, &lines[body_end..], &metadata)?
        } else {
            None
        };

        Ok(finish_run(Self::NAME, columns, metadata)?
            .with_format(FormatKind::Maccor)
            .with_eis(eis))
    }
}
