use std::collections::BTreeSet;
use std::ops::Range;

use polars::prelude::*;

use crate::error::{Result, StructureError};

/// Numeric columns that follow a datapoint through interpolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Measure {
    Voltage,
    TestTime,
    Current,
    ChargeCapacity,
    DischargeCapacity,
    ChargeEnergy,
    DischargeEnergy,
    Temperature,
    InternalResistance,
}

impl Measure {
    pub const ALL: [Measure; 9] = [
        Measure::Voltage,
        Measure::TestTime,
        Measure::Current,
        Measure::ChargeCapacity,
        Measure::DischargeCapacity,
        Measure::ChargeEnergy,
        Measure::DischargeEnergy,
        Measure::Temperature,
        Measure::InternalResistance,
    ];

    pub fn column_name(&self) -> &'static str {
        match self {
            Measure::Voltage => "voltage",
            Measure::TestTime => "test_time",
            Measure::Current => "current",
            Measure::ChargeCapacity => "charge_capacity",
            Measure::DischargeCapacity => "discharge_capacity",
            Measure::ChargeEnergy => "charge_energy",
            Measure::DischargeEnergy => "discharge_energy",
            Measure::Temperature => "temperature",
            Measure::InternalResistance => "internal_resistance",
        }
    }
}

/// Contiguous rows of one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleRange {
    pub cycle_index: i32,
    pub rows: Range<usize>,
}

/// Contiguous rows sharing a step index inside one cycle. `counter` numbers
/// the segments of a cycle from zero, so a repeated step index gets a new
/// counter value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepSegment {
    pub cycle_index: i32,
    pub step_index: i32,
    pub counter: u32,
    pub rows: Range<usize>,
}

/// Column-major copy of a raw cycler table. Nulls in measured columns become
/// NaN; the optional columns stay absent when the source lacks them.
#[derive(Debug, Clone)]
pub struct CyclerTable {
    pub cycle_index: Vec<i32>,
    pub step_index: Vec<i32>,
    pub test_time: Vec<f64>,
    pub voltage: Vec<f64>,
    pub current: Vec<f64>,
    pub charge_capacity: Vec<f64>,
    pub discharge_capacity: Vec<f64>,
    pub charge_energy: Vec<f64>,
    pub discharge_energy: Vec<f64>,
    pub temperature: Option<Vec<f64>>,
    pub internal_resistance: Option<Vec<f64>>,
    pub date_time_iso: Option<Vec<Option<String>>>,
}

fn float_column(df: &DataFrame, name: &str) -> Result<Vec<f64>> {
    let column = df
        .column(name)
        .map_err(|_| StructureError::MissingColumn(name.to_string()))?
        .cast(&DataType::Float64)?;
    let values = column.f64()?;
    Ok(values
        .into_iter()
        .map(|value| value.unwrap_or(f64::NAN))
        .collect())
}

fn optional_float_column(df: &DataFrame, name: &str) -> Result<Option<Vec<f64>>> {
    if df.column(name).is_err() {
        return Ok(None);
    }
    float_column(df, name).map(Some)
}

fn int_column(df: &DataFrame, name: &str) -> Result<Vec<i32>> {
    let column = df
        .column(name)
        .map_err(|_| StructureError::MissingColumn(name.to_string()))?
        .cast(&DataType::Int32)?;
    let values = column.i32()?;
    values
        .into_iter()
        .enumerate()
        .map(|(idx, value)| {
            value.ok_or_else(|| {
                StructureError::Validation(format!("column '{name}' is null at row {idx}"))
            })
        })
        .collect()
}

impl CyclerTable {
    pub fn from_frame(df: &DataFrame) -> Result<Self> {
        let date_time_iso = match df.column("date_time_iso") {
            Ok(column) => {
                let column = column.cast(&DataType::String)?;
                Some(
                    column
                        .str()?
                        .into_iter()
                        .map(|value| value.map(str::to_string))
                        .collect(),
                )
            }
            Err(_) => None,
        };

        Ok(Self {
            cycle_index: int_column(df, "cycle_index")?,
            step_index: int_column(df, "step_index")?,
            test_time: float_column(df, "test_time")?,
            voltage: float_column(df, "voltage")?,
            current: float_column(df, "current")?,
            charge_capacity: float_column(df, "charge_capacity")?,
            discharge_capacity: float_column(df, "discharge_capacity")?,
            charge_energy: float_column(df, "charge_energy")?,
            discharge_energy: float_column(df, "discharge_energy")?,
            temperature: optional_float_column(df, "temperature")?,
            internal_resistance: optional_float_column(df, "internal_resistance")?,
            date_time_iso,
        })
    }

    pub fn len(&self) -> usize {
        self.cycle_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cycle_index.is_empty()
    }

    pub fn measure(&self, measure: Measure) -> Option<&[f64]> {
        match measure {
            Measure::Voltage => Some(&self.voltage),
            Measure::TestTime => Some(&self.test_time),
            Measure::Current => Some(&self.current),
            Measure::ChargeCapacity => Some(&self.charge_capacity),
            Measure::DischargeCapacity => Some(&self.discharge_capacity),
            Measure::ChargeEnergy => Some(&self.charge_energy),
            Measure::DischargeEnergy => Some(&self.discharge_energy),
            Measure::Temperature => self.temperature.as_deref(),
            Measure::InternalResistance => self.internal_resistance.as_deref(),
        }
    }

    /// Relies on `cycle_index` being non-decreasing, which raw runs guarantee.
    pub fn cycles(&self) -> Vec<CycleRange> {
        let mut ranges = Vec::new();
        let mut start = 0;
        for idx in 1..=self.len() {
            if idx == self.len() || self.cycle_index[idx] != self.cycle_index[start] {
                ranges.push(CycleRange {
                    cycle_index: self.cycle_index[start],
                    rows: start..idx,
                });
                start = idx;
            }
        }
        ranges
    }

    pub fn step_segments(&self, cycle: &CycleRange) -> Vec<StepSegment> {
        let mut segments = Vec::new();
        let rows = cycle.rows.clone();
        if rows.is_empty() {
            return segments;
        }
        let mut start = rows.start;
        let mut counter = 0;
        for idx in rows.start + 1..=rows.end {
            if idx == rows.end || self.step_index[idx] != self.step_index[start] {
                segments.push(StepSegment {
                    cycle_index: cycle.cycle_index,
                    step_index: self.step_index[start],
                    counter,
                    rows: start..idx,
                });
                counter += 1;
                start = idx;
            }
        }
        segments
    }

    pub fn step_set(&self, cycle: &CycleRange) -> BTreeSet<i32> {
        self.step_index[cycle.rows.clone()].iter().copied().collect()
    }

    pub fn last_cycle_index(&self) -> Option<i32> {
        self.cycle_index.last().copied()
    }
}
