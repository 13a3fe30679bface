use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use polars::prelude::*;

use crate::errors::ParserError;
use crate::model::{RawCyclerRun, RunMetadata};

use super::schema::validate_raw_frame;

/// A cycler file loaded into memory once and handed to each candidate parser.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
}

impl SourceFile {
    pub fn read(path: impl AsRef<Path>) -> Result<Self, ParserError> {
        let path = path.as_ref().to_path_buf();
        let bytes = fs::read(&path).map_err(|source| ParserError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(Self { path, bytes })
    }

    pub fn from_bytes(path: impl Into<PathBuf>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            bytes: bytes.into(),
        }
    }

    /// Vendor exports are not always valid UTF-8 (degree signs, ohm signs).
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn extension(&self) -> Option<String> {
        self.path
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
    }

    pub fn first_line(&self) -> String {
        let end = self
            .bytes
            .iter()
            .position(|b| *b == b'\n')
            .unwrap_or(self.bytes.len())
            .min(4096);
        String::from_utf8_lossy(&self.bytes[..end])
            .trim_start_matches('\u{feff}')
            .trim_end()
            .to_string()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOptions {
    /// Parse an embedded impedance block when the format carries one.
    pub include_eis: bool,
}

/// Column buffers for the canonical raw table. Optional columns are only
/// materialized once an adapter writes to them.
#[derive(Debug, Clone, Default)]
pub struct RawColumns {
    pub data_point: Vec<i64>,
    pub cycle_index: Vec<i32>,
    pub step_index: Vec<i32>,
    pub test_time: Vec<f64>,
    pub voltage: Vec<f64>,
    pub current: Vec<f64>,
    pub charge_capacity: Vec<f64>,
    pub discharge_capacity: Vec<f64>,
    pub charge_energy: Vec<f64>,
    pub discharge_energy: Vec<f64>,
    pub temperature: Option<Vec<Option<f64>>>,
    pub internal_resistance: Option<Vec<Option<f64>>>,
    pub date_time_iso: Option<Vec<Option<String>>>,
}

impl RawColumns {
    pub fn new(capacity: usize) -> Self {
        Self {
            data_point: Vec::with_capacity(capacity),
            cycle_index: Vec::with_capacity(capacity),
            step_index: Vec::with_capacity(capacity),
            test_time: Vec::with_capacity(capacity),
            voltage: Vec::with_capacity(capacity),
            current: Vec::with_capacity(capacity),
            charge_capacity: Vec::with_capacity(capacity),
            discharge_capacity: Vec::with_capacity(capacity),
            charge_energy: Vec::with_capacity(capacity),
            discharge_energy: Vec::with_capacity(capacity),
            temperature: None,
            internal_resistance: None,
            date_time_iso: None,
        }
    }

    /// Builds and validates the canonical raw table.
    pub fn into_dataframe(self) -> Result<DataFrame, ParserError> {
        build_raw_dataframe("raw", self)
    }

    pub fn len(&self) -> usize {
        self.data_point.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data_point.is_empty()
    }

    pub fn temperature_mut(&mut self) -> &mut Vec<Option<f64>> {
        let capacity = self.data_point.capacity();
        self.temperature
            .get_or_insert_with(|| Vec::with_capacity(capacity))
    }

    pub fn internal_resistance_mut(&mut self) -> &mut Vec<Option<f64>> {
        let capacity = self.data_point.capacity();
        self.internal_resistance
            .get_or_insert_with(|| Vec::with_capacity(capacity))
    }

    pub fn date_time_mut(&mut self) -> &mut Vec<Option<String>> {
        let capacity = self.data_point.capacity();
        self.date_time_iso
            .get_or_insert_with(|| Vec::with_capacity(capacity))
    }
}

pub(crate) fn build_raw_dataframe(
    parser: &'static str,
    columns: RawColumns,
) -> Result<DataFrame, ParserError> {
    let expected = columns.len();
    if expected == 0 {
        return Err(ParserError::EmptyData { parser });
    }

    let lengths = [
        ("cycle_index", columns.cycle_index.len()),
        ("step_index", columns.step_index.len()),
        ("test_time", columns.test_time.len()),
        ("voltage", columns.voltage.len()),
        ("current", columns.current.len()),
        ("charge_capacity", columns.charge_capacity.len()),
        ("discharge_capacity", columns.discharge_capacity.len()),
        ("charge_energy", columns.charge_energy.len()),
        ("discharge_energy", columns.discharge_energy.len()),
        (
            "temperature",
            columns.temperature.as_ref().map_or(expected, Vec::len),
        ),
        (
            "internal_resistance",
            columns.internal_resistance.as_ref().map_or(expected, Vec::len),
        ),
        (
            "date_time_iso",
            columns.date_time_iso.as_ref().map_or(expected, Vec::len),
        ),
    ];
    for (name, len) in lengths {
        if len != expected {
            return Err(ParserError::Validation {
                parser,
                message: format!("column '{name}' had {len} rows but data_point had {expected}"),
            });
        }
    }

    let mut cols: Vec<Column> = vec![
        Series::new("data_point".into(), columns.data_point).into(),
        Series::new("cycle_index".into(), columns.cycle_index).into(),
        Series::new("step_index".into(), columns.step_index).into(),
        Series::new("test_time".into(), columns.test_time).into(),
        Series::new("voltage".into(), columns.voltage).into(),
        Series::new("current".into(), columns.current).into(),
        Series::new("charge_capacity".into(), columns.charge_capacity).into(),
        Series::new("discharge_capacity".into(), columns.discharge_capacity).into(),
        Series::new("charge_energy".into(), columns.charge_energy).into(),
        Series::new("discharge_energy".into(), columns.discharge_energy).into(),
    ];

    if let Some(values) = columns.temperature {
        cols.push(Series::new("temperature".into(), values).into());
    }
    if let Some(values) = columns.internal_resistance {
        cols.push(Series::new("internal_resistance".into(), values).into());
    }
    if let Some(values) = columns.date_time_iso {
        cols.push(Series::new("date_time_iso".into(), values).into());
    }

    let df = DataFrame::new(cols).map_err(|err| ParserError::Validation {
        parser,
        message: format!("failed to build raw dataframe: {err}"),
    })?;
    validate_raw_frame(parser, df)
}

pub(crate) fn finish_run(
    parser: &'static str,
    columns: RawColumns,
    metadata: RunMetadata,
) -> Result<RawCyclerRun, ParserError> {
    let df = build_raw_dataframe(parser, columns)?;
    RawCyclerRun::new(df, metadata)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Charge,
    Discharge,
    Idle,
}

impl Direction {
    pub(crate) fn from_current(current: f64) -> Self {
        if current > 0.0 {
            Direction::Charge
        } else if current < 0.0 {
            Direction::Discharge
        } else {
            Direction::Idle
        }
    }
}

/// Turns step-relative (or run-cumulative) vendor counters into charge and
/// discharge totals that only grow within a cycle and restart at zero on every
/// new cycle.
#[derive(Debug, Clone, Default)]
pub(crate) struct CycleAccumulator {
    cycle: Option<i32>,
    segment: Option<(i64, Direction)>,
    last: f64,
    primed: bool,
    charge: f64,
    discharge: f64,
}

impl CycleAccumulator {
    fn roll_cycle(&mut self, cycle: i32) {
        if self.cycle != Some(cycle) {
            self.cycle = Some(cycle);
            self.segment = None;
            self.charge = 0.0;
            self.discharge = 0.0;
        }
    }

    fn add(&mut self, direction: Direction, increment: f64) {
        match direction {
            Direction::Charge => self.charge += increment,
            Direction::Discharge => self.discharge += increment,
            Direction::Idle => {}
        }
    }

    /// `value` restarts at zero whenever `segment` or the direction changes.
    /// Idle rows leave the running segment untouched. A value smaller than
    /// the previous one is treated as an unannounced reset.
    pub(crate) fn push_step_relative(
        &mut self,
        cycle: i32,
        segment: i64,
        direction: Direction,
        value: f64,
    ) -> (f64, f64) {
        self.roll_cycle(cycle);
        if direction == Direction::Idle {
            return (self.charge, self.discharge);
        }
        let key = (segment, direction);
        if self.segment != Some(key) {
            self.segment = Some(key);
            self.last = 0.0;
        }
        let value = if value.is_finite() { value.abs() } else { self.last };
        let increment = if value >= self.last { value - self.last } else { value };
        self.last = value;
        self.add(direction, increment);
        (self.charge, self.discharge)
    }

    /// `value` is a signed counter running over the whole test; positive
    /// deltas count as charge and negative deltas as discharge. The first
    /// sample of the run only sets the baseline.
    pub(crate) fn push_signed_counter(&mut self, cycle: i32, value: f64) -> (f64, f64) {
        self.roll_cycle(cycle);
        if !value.is_finite() {
            return (self.charge, self.discharge);
        }
        if !self.primed {
            self.primed = true;
            self.last = value;
            return (self.charge, self.discharge);
        }
        let delta = value - self.last;
        self.last = value;
        if delta > 0.0 {
            self.add(Direction::Charge, delta);
        } else {
            self.add(Direction::Discharge, -delta);
        }
        (self.charge, self.discharge)
    }
}

pub(crate) fn parse_required_i64(
    parser: &'static str,
    value: &str,
    line_index: usize,
    column: &str,
) -> Result<i64, ParserError> {
    let trimmed = value.trim();
    if let Ok(parsed) = trimmed.parse::<i64>() {
        return Ok(parsed);
    }
    // some exports write integral columns as floats ("3.000000E+000")
    match normalize_decimal(trimmed).parse::<f64>() {
        Ok(parsed) if parsed.is_finite() && parsed.fract() == 0.0 => Ok(parsed as i64),
        _ => Err(ParserError::DataRow {
            parser,
            line_index,
            message: format!("failed to parse column '{column}' as integer: '{trimmed}'"),
        }),
    }
}

pub(crate) fn parse_required_f64(
    parser: &'static str,
    value: &str,
    line_index: usize,
    column: &str,
) -> Result<f64, ParserError> {
    parse_optional_f64(parser, value, line_index, column)?.ok_or_else(|| ParserError::DataRow {
        parser,
        line_index,
        message: format!("column '{column}' is empty"),
    })
}

pub(crate) fn parse_optional_f64(
    parser: &'static str,
    value: &str,
    line_index: usize,
    column: &str,
) -> Result<Option<f64>, ParserError> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan") {
        return Ok(None);
    }

    normalize_decimal(trimmed)
        .parse::<f64>()
        .map(Some)
        .map_err(|err| ParserError::DataRow {
            parser,
            line_index,
            message: format!("failed to parse column '{column}' as float: {err}"),
        })
}

/// Accepts a decimal comma when no decimal point is present.
fn normalize_decimal(value: &str) -> Cow<'_, str> {
    if value.contains(',') && !value.contains('.') {
        Cow::Owned(value.replace(',', "."))
    } else {
        Cow::Borrowed(value)
    }
}

const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Converts the date formats vendors emit into `YYYY-MM-DDTHH:MM:SS`.
/// Bare numbers are read as Unix epoch seconds.
pub(crate) fn to_iso_datetime(value: &str) -> Option<String> {
    static FORMATS: &[&str] = &[
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%m/%d/%Y %H:%M:%S%.f",
        "%m/%d/%Y %H:%M:%S",
        "%m/%d/%Y %I:%M:%S %p",
        "%m/%d/%Y %H:%M",
    ];
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(epoch) = trimmed.parse::<f64>() {
        return epoch_seconds_to_iso(epoch);
    }
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
        .or_else(|| {
            ["%m/%d/%Y", "%Y-%m-%d"]
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
        .map(|dt| dt.format(ISO_FORMAT).to_string())
}

pub(crate) fn epoch_seconds_to_iso(epoch: f64) -> Option<String> {
    if !epoch.is_finite() {
        return None;
    }
    let secs = epoch.floor() as i64;
    let nanos = ((epoch - epoch.floor()) * 1e9) as u32;
    DateTime::<Utc>::from_timestamp(secs, nanos).map(|dt| dt.format(ISO_FORMAT).to_string())
}

pub(crate) fn parse_naive(value: &str) -> Option<NaiveDateTime> {
    to_iso_datetime(value).and_then(|iso| NaiveDateTime::parse_from_str(&iso, ISO_FORMAT).ok())
}

/// Ingestion timestamp recorded under `_today_datetime`.
pub(crate) fn today_datetime() -> String {
    Utc::now().format(ISO_FORMAT).to_string()
}

pub(crate) fn base_metadata(source: &SourceFile) -> RunMetadata {
    let mut metadata = RunMetadata::new();
    metadata.insert("_today_datetime", today_datetime());
    metadata.insert("filename", source.path.to_string_lossy().into_owned());
    metadata
}

/// Finds the first header matching any alias, ignoring case and surrounding
/// whitespace.
pub(crate) fn find_column(headers: &[String], aliases: &[&str]) -> Option<usize> {
    headers.iter().position(|header| {
        let header = header.trim();
        aliases
            .iter()
            .any(|alias| header.eq_ignore_ascii_case(alias))
    })
}

pub(crate) fn require_column(
    parser: &'static str,
    headers: &[String],
    aliases: &[&str],
    row_index: usize,
) -> Result<usize, ParserError> {
    find_column(headers, aliases).ok_or_else(|| ParserError::InvalidHeader {
        parser,
        row_index,
        message: format!("missing column {}", aliases.join(" | ")),
    })
}

pub(crate) fn field<'a>(record: &'a csv::StringRecord, index: usize) -> &'a str {
    record.get(index).unwrap_or_default()
}
