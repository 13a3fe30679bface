use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::cycler_table::{CycleRange, CyclerTable, StepSegment};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Charge,
    Discharge,
    WaveformCharge,
    WaveformDischarge,
    Rest,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Charge => "charge",
            StepType::Discharge => "discharge",
            StepType::WaveformCharge => "waveform_charge",
            StepType::WaveformDischarge => "waveform_discharge",
            StepType::Rest => "rest",
        }
    }

    pub fn is_charge(&self) -> bool {
        matches!(self, StepType::Charge | StepType::WaveformCharge)
    }

    pub fn is_discharge(&self) -> bool {
        matches!(self, StepType::Discharge | StepType::WaveformDischarge)
    }

    pub fn is_waveform(&self) -> bool {
        matches!(self, StepType::WaveformCharge | StepType::WaveformDischarge)
    }

    /// Integer code stored in diagnostic tables: 0 charge, 1 discharge, 2 rest.
    pub fn diagnostic_code(&self) -> i32 {
        if self.is_charge() {
            0
        } else if self.is_discharge() {
            1
        } else {
            2
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierSettings {
    /// Steps whose peak |current| stays below this (A) are rests.
    pub rest_current_threshold: f64,
    /// Samples below this fraction of the peak |current| do not count as a sign.
    pub noise_fraction: f64,
    /// More sign changes than this make a step a waveform.
    pub sign_change_tolerance: usize,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            rest_current_threshold: 1e-3,
            noise_fraction: 0.01,
            sign_change_tolerance: 2,
        }
    }
}

fn peak_current(current: &[f64]) -> f64 {
    current
        .iter()
        .filter(|value| value.is_finite())
        .fold(0.0_f64, |acc, value| acc.max(value.abs()))
}

pub fn count_sign_changes(current: &[f64], settings: &ClassifierSettings) -> usize {
    let floor = peak_current(current) * settings.noise_fraction;
    let mut changes = 0;
    let mut previous: Option<bool> = None;
    for value in current.iter().filter(|v| v.is_finite() && v.abs() > floor) {
        let positive = *value > 0.0;
        if let Some(prev) = previous {
            if prev != positive {
                changes += 1;
            }
        }
        previous = Some(positive);
    }
    changes
}

/// Labels one step from its current trace.
pub fn classify_step(current: &[f64], settings: &ClassifierSettings) -> StepType {
    let peak = peak_current(current);
    if peak < settings.rest_current_threshold {
        return StepType::Rest;
    }

    let floor = peak * settings.noise_fraction;
    let total: f64 = current.iter().filter(|v| v.is_finite()).sum();
    let positive = if total != 0.0 {
        total > 0.0
    } else {
        current
            .iter()
            .find(|v| v.is_finite() && v.abs() > floor)
            .map(|v| *v > 0.0)
            .unwrap_or(true)
    };

    let waveform = count_sign_changes(current, settings) > settings.sign_change_tolerance;
    match (waveform, positive) {
        (true, true) => StepType::WaveformCharge,
        (true, false) => StepType::WaveformDischarge,
        (false, true) => StepType::Charge,
        (false, false) => StepType::Discharge,
    }
}

pub fn is_waveform_discharge(current: &[f64], settings: &ClassifierSettings) -> bool {
    classify_step(current, settings) == StepType::WaveformDischarge
}

pub fn is_waveform_charge(current: &[f64], settings: &ClassifierSettings) -> bool {
    classify_step(current, settings) == StepType::WaveformCharge
}

/// One contiguous step segment of a cycle with its label.
#[derive(Debug, Clone, PartialEq)]
pub struct StepGroup {
    pub cycle_index: i32,
    pub step_index: i32,
    pub step_index_counter: u32,
    pub rows: Range<usize>,
    pub step_type: StepType,
}

impl StepGroup {
    fn from_segment(segment: StepSegment, step_type: StepType) -> Self {
        Self {
            cycle_index: segment.cycle_index,
            step_index: segment.step_index,
            step_index_counter: segment.counter,
            rows: segment.rows,
            step_type,
        }
    }
}

/// Labels every step segment of one cycle, in row order.
pub fn classify_cycle_steps(
    table: &CyclerTable,
    cycle: &CycleRange,
    settings: &ClassifierSettings,
) -> Vec<StepGroup> {
    table
        .step_segments(cycle)
        .into_iter()
        .map(|segment| {
            let step_type = classify_step(&table.current[segment.rows.clone()], settings);
            StepGroup::from_segment(segment, step_type)
        })
        .collect()
}

/// Labels every step segment of every cycle.
pub fn classify_steps(table: &CyclerTable, settings: &ClassifierSettings) -> Vec<StepGroup> {
    table
        .cycles()
        .iter()
        .flat_map(|cycle| classify_cycle_steps(table, cycle, settings))
        .collect()
}

/// Step groups keyed by cycle, each list in row order.
pub fn group_steps_by_cycle(steps: &[StepGroup]) -> BTreeMap<i32, Vec<&StepGroup>> {
    let mut grouped: BTreeMap<i32, Vec<&StepGroup>> = BTreeMap::new();
    for step in steps {
        grouped.entry(step.cycle_index).or_default().push(step);
    }
    grouped
}
