use chrono::NaiveDateTime;
use csv::{ReaderBuilder, StringRecord};

use crate::errors::ParserError;
use crate::model::{FormatKind, RawCyclerRun};
use crate::registry::CyclerParser;

use super::common::{
    base_metadata, field, find_column, finish_run, parse_naive, parse_optional_f64,
    parse_required_f64, parse_required_i64, require_column, to_iso_datetime, CycleAccumulator,
    Direction, ParseOptions, RawColumns, SourceFile,
};

const MILLI: f64 = 1000.0;

/// BTS exports: cycle, step, and record rows nested by leading empty fields,
/// each level with its own header row.
pub struct NewareParser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowLevel {
    Cycle,
    Step,
    Record,
}

struct RecordLayout {
    record_id: usize,
    time: usize,
    voltage: usize,
    current: usize,
    capacity: usize,
    energy: usize,
    realtime: Option<usize>,
    temperature: Option<usize>,
    contact_resistance: Option<usize>,
}

impl NewareParser {
    const NAME: &'static str = "NEWARE";

    pub fn has_signature(first_line: &str) -> bool {
        first_line
            .trim_start_matches('\u{feff}')
            .trim_start()
            .starts_with("Cycle ID")
    }

    fn level(record: &StringRecord) -> Option<RowLevel> {
        match record.iter().position(|value| !value.trim().is_empty())? {
            0 => Some(RowLevel::Cycle),
            1 => Some(RowLevel::Step),
            _ => Some(RowLevel::Record),
        }
    }

    /// `h:min:s.ms` step clock to seconds.
    fn parse_clock(value: &str, line_index: usize) -> Result<f64, ParserError> {
        let invalid = || ParserError::DataRow {
            parser: Self::NAME,
            line_index,
            message: format!("invalid step time '{}'", value.trim()),
        };
        let mut seconds = 0.0;
        for part in value.trim().split(':') {
            let parsed: f64 = part.trim().parse().map_err(|_| invalid())?;
            seconds = seconds * 60.0 + parsed;
        }
        Ok(seconds)
    }

    fn direction(step_name: &str) -> Direction {
        let lower = step_name.to_ascii_lowercase();
        if lower.contains("dchg") {
            Direction::Discharge
        } else if lower.contains("chg") {
            Direction::Charge
        } else {
            Direction::Idle
        }
    }

    fn record_layout(headers: &[String]) -> Result<RecordLayout, ParserError> {
        let p = Self::NAME;
        Ok(RecordLayout {
            record_id: require_column(p, headers, &["Record ID"], 2)?,
            time: require_column(p, headers, &["Time(h:min:s.ms)"], 2)?,
            voltage: require_column(p, headers, &["Voltage(V)"], 2)?,
            current: require_column(p, headers, &["Current(mA)"], 2)?,
            capacity: require_column(p, headers, &["Capacity(mAh)"], 2)?,
            energy: require_column(p, headers, &["Energy(mWh)"], 2)?,
            realtime: find_column(headers, &["Realtime"]),
            temperature: find_column(headers, &["Temperature(C)", "Temperature(℃)"]),
            contact_resistance: find_column(headers, &["Contact resistance(mΩ)"]),
        })
    }
}

impl CyclerParser for NewareParser {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn kind(&self) -> FormatKind {
        FormatKind::Neware
    }

    fn parse(&self, source: &SourceFile, _options: &ParseOptions) -> Result<RawCyclerRun, ParserError> {
        let p = Self::NAME;
        if !Self::has_signature(&source.first_line()) {
            return Err(ParserError::FormatMismatch {
                parser: p,
                reason: "first header does not start with 'Cycle ID'".to_string(),
            });
        }

        let text = source.text();
        let mut reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(text.trim_start_matches('\u{feff}').as_bytes());
        let mut records = reader.records();

        let mut header_rows: Vec<Vec<String>> = Vec::with_capacity(3);
        for row_index in 0..3 {
            let record = records
                .next()
                .ok_or_else(|| ParserError::InvalidHeader {
                    parser: p,
                    row_index,
                    message: "expected three nested header rows".to_string(),
                })?
                .map_err(ParserError::csv(p))?;
            header_rows.push(record.iter().map(|h| h.trim().to_string()).collect());
        }
        let step_id = require_column(p, &header_rows[1], &["Step ID"], 1)?;
        let step_name = require_column(p, &header_rows[1], &["Step Name"], 1)?;
        let layout = Self::record_layout(&header_rows[2])?;

        let mut columns = RawColumns::new(1024);
        let mut capacity = CycleAccumulator::default();
        let mut energy = CycleAccumulator::default();

        let mut cycle: Option<i32> = None;
        let mut step: Option<(i32, Direction)> = None;
        let mut first_realtime: Option<NaiveDateTime> = None;
        let mut step_base: Option<f64> = None;
        let mut last_time = 0.0;

        for (offset, record) in records.enumerate() {
            let line_index = offset + 3;
            let record = record.map_err(ParserError::csv(p))?;
            match Self::level(&record) {
                None => continue,
                Some(RowLevel::Cycle) => {
                    cycle = Some(parse_required_i64(p, field(&record, 0), line_index, "Cycle ID")? as i32);
                }
                Some(RowLevel::Step) => {
                    let id = parse_required_i64(p, field(&record, step_id), line_index, "Step ID")?;
                    step = Some((id as i32, Self::direction(field(&record, step_name))));
                    step_base = None;
                }
                Some(RowLevel::Record) => {
                    let (Some(cycle_index), Some((step_index, direction))) = (cycle, step) else {
                        return Err(ParserError::DataRow {
                            parser: p,
                            line_index,
                            message: "record row before its cycle and step rows".to_string(),
                        });
                    };

                    let step_time = Self::parse_clock(field(&record, layout.time), line_index)?;
                    let realtime = layout
                        .realtime
                        .and_then(|idx| parse_naive(field(&record, idx)));
                    let base = *step_base.get_or_insert_with(|| {
                        match (realtime, first_realtime) {
                            (Some(now), Some(first)) => {
                                (now - first).num_milliseconds() as f64 / 1000.0 - step_time
                            }
                            (Some(_), None) => -step_time,
                            _ => last_time,
                        }
                    });
                    if first_realtime.is_none() {
                        first_realtime = realtime;
                    }
                    let test_time = (base + step_time).max(last_time);
                    last_time = test_time;

                    let raw_current =
                        parse_required_f64(p, field(&record, layout.current), line_index, "Current(mA)")?
                            / MILLI;
                    let current = match direction {
                        Direction::Discharge => -raw_current.abs(),
                        Direction::Charge => raw_current.abs(),
                        Direction::Idle => raw_current,
                    };
                    let cap = parse_required_f64(
                        p,
                        field(&record, layout.capacity),
                        line_index,
                        "Capacity(mAh)",
                    )? / MILLI;
                    let eng = parse_required_f64(
                        p,
                        field(&record, layout.energy),
                        line_index,
                        "Energy(mWh)",
                    )? / MILLI;
                    let segment = i64::from(step_index);
                    let (charge_capacity, discharge_capacity) =
                        capacity.push_step_relative(cycle_index, segment, direction, cap);
                    let (charge_energy, discharge_energy) =
                        energy.push_step_relative(cycle_index, segment, direction, eng);

                    columns.data_point.push(parse_required_i64(
                        p,
                        field(&record, layout.record_id),
                        line_index,
                        "Record ID",
                    )?);
                    columns.cycle_index.push(cycle_index);
                    columns.step_index.push(step_index);
                    columns.test_time.push(test_time);
                    columns.voltage.push(parse_required_f64(
                        p,
                        field(&record, layout.voltage),
                        line_index,
                        "Voltage(V)",
                    )?);
                    columns.current.push(current);
                    columns.charge_capacity.push(charge_capacity);
                    columns.discharge_capacity.push(discharge_capacity);
                    columns.charge_energy.push(charge_energy);
                    columns.discharge_energy.push(discharge_energy);

                    if let Some(idx) = layout.temperature {
                        let value =
                            parse_optional_f64(p, field(&record, idx), line_index, "Temperature(C)")?;
                        columns.temperature_mut().push(value);
                    }
                    if let Some(idx) = layout.contact_resistance {
                        let value = parse_optional_f64(
                            p,
                            field(&record, idx),
                            line_index,
                            "Contact resistance(mΩ)",
                        )?
                        .map(|milliohm| milliohm / MILLI);
                        columns.internal_resistance_mut().push(value);
                    }
                    if let Some(idx) = layout.realtime {
                        columns
                            .date_time_mut()
                            .push(to_iso_datetime(field(&record, idx)));
                    }
                }
            }
        }

        let metadata = base_metadata(source);
        Ok(finish_run(p, columns, metadata)?.with_format(FormatKind::Neware))
    }
}
