use std::cmp::Ordering;

use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::StructuringConfig;
use crate::cycler_table::{CyclerTable, Measure};
use crate::error::{Result, StructureError};
use crate::step_classifier::{group_steps_by_cycle, StepGroup, StepType};
use crate::structuring::{StructuringParameters, HPPC};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    Voltage,
    TestTime,
    ChargeCapacity,
    DischargeCapacity,
}

impl Axis {
    pub fn measure(&self) -> Measure {
        match self {
            Axis::Voltage => Measure::Voltage,
            Axis::TestTime => Measure::TestTime,
            Axis::ChargeCapacity => Measure::ChargeCapacity,
            Axis::DischargeCapacity => Measure::DischargeCapacity,
        }
    }
}

/// What to do with groups that have fewer distinct axis values than the floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum InterpolationPolicy {
    Strict,
    FallbackCoarser { resolution: usize },
}

/// A group that was resampled below the requested resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterpolationFallback {
    pub cycle_index: i32,
    pub step_type: String,
    pub distinct_points: usize,
    pub requested: usize,
    pub produced: usize,
}

#[derive(Debug, Clone)]
struct Cluster {
    axis: f64,
    values: Vec<f64>,
}

/// Rows of one group sorted along an axis, with ties merged by their mean.
#[derive(Debug, Clone)]
pub struct AxisSamples {
    axis: Axis,
    measures: Vec<Measure>,
    clusters: Vec<Cluster>,
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        f64::NAN
    } else {
        sum / count as f64
    }
}

impl AxisSamples {
    /// Axis values within `tie_tolerance` of a cluster's first value join it.
    pub fn from_rows(table: &CyclerTable, rows: &[usize], axis: Axis, tie_tolerance: f64) -> Self {
        let measures: Vec<Measure> = Measure::ALL
            .into_iter()
            .filter(|m| table.measure(*m).is_some())
            .collect();
        let columns: Vec<&[f64]> = measures
            .iter()
            .filter_map(|m| table.measure(*m))
            .collect();
        let axis_values = table.measure(axis.measure()).unwrap_or(&[]);

        let mut ordered: Vec<usize> = rows
            .iter()
            .copied()
            .filter(|row| axis_values.get(*row).is_some_and(|v| v.is_finite()))
            .collect();
        ordered.sort_by(|a, b| {
            axis_values[*a]
                .partial_cmp(&axis_values[*b])
                .unwrap_or(Ordering::Equal)
        });

        let mut clusters = Vec::new();
        let mut idx = 0;
        while idx < ordered.len() {
            let anchor = axis_values[ordered[idx]];
            let end = ordered[idx..]
                .iter()
                .position(|row| axis_values[*row] - anchor > tie_tolerance)
                .map(|offset| idx + offset)
                .unwrap_or(ordered.len());
            let members = &ordered[idx..end];
            clusters.push(Cluster {
                axis: mean(members.iter().map(|row| axis_values[*row])),
                values: columns
                    .iter()
                    .map(|column| mean(members.iter().map(|row| column[*row])))
                    .collect(),
            });
            idx = end;
        }

        Self {
            axis,
            measures,
            clusters,
        }
    }

    pub fn distinct_points(&self) -> usize {
        self.clusters.len()
    }

    pub fn observed_range(&self) -> Option<[f64; 2]> {
        Some([self.clusters.first()?.axis, self.clusters.last()?.axis])
    }

    fn value_at(&self, measure_idx: usize, x: f64) -> Option<f64> {
        let first = self.clusters.first()?;
        let last = self.clusters.last()?;
        let eps = 1e-9 * (last.axis - first.axis).abs().max(1.0);
        if x < first.axis - eps || x > last.axis + eps {
            return None;
        }
        let hi = self.clusters.partition_point(|c| c.axis < x);
        let value = if hi == 0 {
            first.values[measure_idx]
        } else if hi == self.clusters.len() {
            last.values[measure_idx]
        } else if self.clusters[hi].axis == x {
            self.clusters[hi].values[measure_idx]
        } else {
            let (left, right) = (&self.clusters[hi - 1], &self.clusters[hi]);
            let t = (x - left.axis) / (right.axis - left.axis);
            left.values[measure_idx] + t * (right.values[measure_idx] - left.values[measure_idx])
        };
        value.is_finite().then_some(value)
    }

    /// Linear interpolation onto `grid`; grid points outside the observed
    /// range are null except in the axis column itself.
    pub fn resample(&self, grid: &[f64]) -> Resampled {
        let columns = self
            .measures
            .iter()
            .enumerate()
            .map(|(idx, measure)| {
                if *measure == self.axis.measure() {
                    grid.iter().map(|x| Some(*x)).collect()
                } else {
                    grid.iter().map(|x| self.value_at(idx, *x)).collect()
                }
            })
            .collect();
        Resampled {
            measures: self.measures.clone(),
            columns,
            len: grid.len(),
        }
    }

    /// The merged rows themselves, without resampling.
    pub fn carry_through(&self) -> Resampled {
        let columns = (0..self.measures.len())
            .map(|idx| {
                self.clusters
                    .iter()
                    .map(|c| Some(c.values[idx]).filter(|v| v.is_finite()))
                    .collect()
            })
            .collect();
        Resampled {
            measures: self.measures.clone(),
            columns,
            len: self.clusters.len(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Resampled {
    measures: Vec<Measure>,
    columns: Vec<Vec<Option<f64>>>,
    len: usize,
}

impl Resampled {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn column(&self, measure: Measure) -> Option<&[Option<f64>]> {
        let idx = self.measures.iter().position(|m| *m == measure)?;
        Some(&self.columns[idx])
    }
}

pub fn linspace(lo: f64, hi: f64, points: usize) -> Vec<f64> {
    match points {
        0 => Vec::new(),
        1 => vec![lo],
        n => (0..n)
            .map(|i| {
                if i == n - 1 {
                    hi
                } else {
                    lo + (hi - lo) * i as f64 / (n - 1) as f64
                }
            })
            .collect(),
    }
}

/// Central differences, one-sided at the ends; null where the axis is flat.
pub fn gradient(values: &[Option<f64>], axis: &[Option<f64>]) -> Vec<Option<f64>> {
    let n = values.len();
    (0..n)
        .map(|i| {
            if n < 2 {
                return None;
            }
            let (a, b) = match i {
                0 => (0, 1),
                i if i == n - 1 => (n - 2, n - 1),
                i => (i - 1, i + 1),
            };
            let dq = values[b]? - values[a]?;
            let dv = axis[b]? - axis[a]?;
            if dv == 0.0 {
                return None;
            }
            let slope = dq / dv;
            slope.is_finite().then_some(slope)
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
enum Grid {
    /// Evenly spaced points over a fixed range, or the observed one.
    Span { range: Option<[f64; 2]>, points: usize },
    /// One point per second over the observed range, at most `cap` points.
    Seconds { cap: usize },
}

impl Grid {
    fn points(&self, range: [f64; 2]) -> Vec<f64> {
        match *self {
            Grid::Span { range: fixed, points } => {
                let [lo, hi] = fixed.unwrap_or(range);
                linspace(lo, hi, points)
            }
            Grid::Seconds { cap } => {
                let [lo, hi] = range;
                let span = (hi - lo).floor().max(0.0);
                if span < cap as f64 {
                    (0..=span as usize).map(|i| lo + i as f64).collect()
                } else {
                    linspace(lo, hi, cap)
                }
            }
        }
    }

    fn coarse(&self, range: [f64; 2], points: usize) -> Vec<f64> {
        match *self {
            Grid::Span { range: fixed, .. } => {
                let [lo, hi] = fixed.unwrap_or(range);
                linspace(lo, hi, points)
            }
            Grid::Seconds { .. } => linspace(range[0], range[1], points),
        }
    }
}

struct GroupRequest<'a> {
    cycle_index: i32,
    label: &'a str,
    axis: Axis,
    tie_tolerance: f64,
    grid: Grid,
}

struct Resampler<'a> {
    table: &'a CyclerTable,
    policy: InterpolationPolicy,
    min_points: usize,
    fallbacks: Vec<InterpolationFallback>,
}

impl<'a> Resampler<'a> {
    fn new(table: &'a CyclerTable, config: &StructuringConfig) -> Self {
        Self {
            table,
            policy: config.policy,
            min_points: config.min_interpolation_points.max(1),
            fallbacks: Vec::new(),
        }
    }

    fn run(&mut self, rows: &[usize], request: GroupRequest<'_>) -> Result<Option<Resampled>> {
        let samples =
            AxisSamples::from_rows(self.table, rows, request.axis, request.tie_tolerance);
        let Some(observed) = samples.observed_range() else {
            return Ok(None);
        };
        let grid = request.grid.points(observed);
        let distinct = samples.distinct_points();
        if distinct >= self.min_points {
            return Ok(Some(samples.resample(&grid)));
        }

        match self.policy {
            InterpolationPolicy::Strict => Err(StructureError::InsufficientInterpolationLength {
                cycle_index: request.cycle_index,
                step_type: request.label.to_string(),
                points: distinct,
                minimum: self.min_points,
            }),
            InterpolationPolicy::FallbackCoarser { resolution } => {
                let resampled = if distinct >= 2 {
                    let points = resolution.min(grid.len()).max(2);
                    samples.resample(&request.grid.coarse(observed, points))
                } else {
                    samples.carry_through()
                };
                warn!(
                    cycle_index = request.cycle_index,
                    step_type = request.label,
                    distinct_points = distinct,
                    requested = grid.len(),
                    produced = resampled.len(),
                    "too few points for interpolation, using coarser grid"
                );
                self.fallbacks.push(InterpolationFallback {
                    cycle_index: request.cycle_index,
                    step_type: request.label.to_string(),
                    distinct_points: distinct,
                    requested: grid.len(),
                    produced: resampled.len(),
                });
                Ok(Some(resampled))
            }
        }
    }
}

enum RowLabels<'a> {
    Regular(StepType),
    Diagnostic {
        step_type: i32,
        step_index: i32,
        step_index_counter: i32,
        cycle_type: &'a str,
    },
}

#[derive(Default)]
struct InterpolatedFrame {
    measures: [Vec<Option<f64>>; 9],
    charge_dqdv: Vec<Option<f64>>,
    discharge_dqdv: Vec<Option<f64>>,
    cycle_index: Vec<i32>,
    step_type: Vec<String>,
    step_code: Vec<i32>,
    step_index: Vec<i32>,
    step_index_counter: Vec<i32>,
    cycle_type: Vec<String>,
}

impl InterpolatedFrame {
    fn push(&mut self, resampled: &Resampled, cycle_index: i32, dqdv: Option<bool>, labels: RowLabels<'_>) {
        let n = resampled.len();
        for measure in Measure::ALL {
            let column = &mut self.measures[measure as usize];
            match resampled.column(measure) {
                Some(values) => column.extend_from_slice(values),
                None => column.extend(std::iter::repeat(None).take(n)),
            }
        }

        let slope = match (
            resampled.column(Measure::Voltage),
            dqdv,
        ) {
            (Some(voltage), Some(is_charge)) => {
                let capacity = if is_charge {
                    Measure::ChargeCapacity
                } else {
                    Measure::DischargeCapacity
                };
                resampled
                    .column(capacity)
                    .map(|q| gradient(q, voltage))
                    .unwrap_or_else(|| vec![None; n])
            }
            _ => vec![None; n],
        };
        let empty = vec![None; n];
        match dqdv {
            Some(true) => {
                self.charge_dqdv.extend(slope);
                self.discharge_dqdv.extend(empty);
            }
            Some(false) => {
                self.discharge_dqdv.extend(slope);
                self.charge_dqdv.extend(empty);
            }
            None => {
                self.charge_dqdv.extend(empty.iter().copied());
                self.discharge_dqdv.extend(empty);
            }
        }

        self.cycle_index.extend(std::iter::repeat(cycle_index).take(n));
        match labels {
            RowLabels::Regular(step_type) => {
                self.step_type
                    .extend(std::iter::repeat(step_type.as_str().to_string()).take(n));
            }
            RowLabels::Diagnostic {
                step_type,
                step_index,
                step_index_counter,
                cycle_type,
            } => {
                self.step_code.extend(std::iter::repeat(step_type).take(n));
                self.step_index.extend(std::iter::repeat(step_index).take(n));
                self.step_index_counter
                    .extend(std::iter::repeat(step_index_counter).take(n));
                self.cycle_type
                    .extend(std::iter::repeat(cycle_type.to_string()).take(n));
            }
        }
    }

    fn measure_columns(&mut self) -> Vec<Column> {
        let mut columns = Vec::with_capacity(Measure::ALL.len() + 2);
        for measure in Measure::ALL {
            let values = std::mem::take(&mut self.measures[measure as usize]);
            columns.push(Series::new(measure.column_name().into(), values).into());
        }
        columns.push(
            Series::new("charge_dQdV".into(), std::mem::take(&mut self.charge_dqdv)).into(),
        );
        columns.push(
            Series::new("discharge_dQdV".into(), std::mem::take(&mut self.discharge_dqdv)).into(),
        );
        columns
    }

    fn into_regular_frame(mut self) -> Result<DataFrame> {
        let mut columns = self.measure_columns();
        columns.push(Series::new("cycle_index".into(), self.cycle_index).into());
        columns.push(Series::new("step_type".into(), self.step_type).into());
        Ok(DataFrame::new(columns)?)
    }

    fn into_diagnostic_frame(mut self) -> Result<DataFrame> {
        let mut columns = self.measure_columns();
        columns.push(Series::new("cycle_index".into(), self.cycle_index).into());
        columns.push(Series::new("step_type".into(), self.step_code).into());
        columns.push(Series::new("step_index".into(), self.step_index).into());
        columns.push(
            Series::new("step_index_counter".into(), self.step_index_counter).into(),
        );
        columns.push(Series::new("cycle_type".into(), self.cycle_type).into());
        Ok(DataFrame::new(columns)?)
    }
}

/// Interpolated frame plus every group that needed a coarser grid.
#[derive(Debug, Clone)]
pub struct InterpolationOutput {
    pub frame: DataFrame,
    pub fallbacks: Vec<InterpolationFallback>,
}

fn rows_of<'s>(steps: impl Iterator<Item = &'s StepGroup>) -> Vec<usize> {
    steps.flat_map(|step| step.rows.clone()).collect()
}

fn observed_range(values: &[f64], rows: &[usize]) -> Option<[f64; 2]> {
    let finite = rows.iter().map(|row| values[*row]).filter(|v| v.is_finite());
    let (lo, hi) = finite.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    (lo <= hi).then_some([lo, hi])
}

fn tie_tolerance(axis: Axis, config: &StructuringConfig) -> f64 {
    match axis {
        Axis::Voltage => config.v_resolution,
        _ => 0.0,
    }
}

/// Resamples every regular cycle per step type: discharge and charge on
/// their configured axes, waveform steps on `test_time`.
pub fn interpolate_cycles(
    table: &CyclerTable,
    steps: &[StepGroup],
    params: &StructuringParameters,
    config: &StructuringConfig,
) -> Result<InterpolationOutput> {
    let grouped = group_steps_by_cycle(steps);
    let regular: Vec<(&i32, &Vec<&StepGroup>)> = grouped
        .iter()
        .filter(|(cycle, _)| !params.is_diagnostic(**cycle))
        .collect();

    let class_rows = |class: StepType| -> Vec<usize> {
        regular
            .iter()
            .flat_map(|(_, steps)| steps.iter().filter(|s| s.step_type == class))
            .flat_map(|step| step.rows.clone())
            .collect()
    };
    let charge_range = observed_range(&table.charge_capacity, &class_rows(StepType::Charge));
    let discharge_range =
        observed_range(&table.discharge_capacity, &class_rows(StepType::Discharge));
    let axis_range = |axis: Axis| match axis {
        Axis::Voltage => Some(params.v_range),
        Axis::TestTime => None,
        Axis::ChargeCapacity => charge_range,
        Axis::DischargeCapacity => discharge_range,
    };

    let mut resampler = Resampler::new(table, config);
    let mut frame = InterpolatedFrame::default();
    for (cycle_index, cycle_steps) in regular {
        for class in [
            StepType::Discharge,
            StepType::Charge,
            StepType::WaveformDischarge,
            StepType::WaveformCharge,
        ] {
            let rows = rows_of(cycle_steps.iter().copied().filter(|s| s.step_type == class));
            if rows.is_empty() {
                continue;
            }
            let axis = match class {
                StepType::Discharge => config.discharge_axis,
                StepType::Charge => config.charge_axis,
                _ => Axis::TestTime,
            };
            let request = GroupRequest {
                cycle_index: *cycle_index,
                label: class.as_str(),
                axis,
                tie_tolerance: tie_tolerance(axis, config),
                grid: Grid::Span {
                    range: axis_range(axis),
                    points: params.resolution,
                },
            };
            if let Some(resampled) = resampler.run(&rows, request)? {
                let dqdv = (!class.is_waveform()).then_some(class.is_charge());
                frame.push(&resampled, *cycle_index, dqdv, RowLabels::Regular(class));
            }
        }
    }

    debug!(rows = frame.cycle_index.len(), "regular cycles interpolated");
    Ok(InterpolationOutput {
        frame: frame.into_regular_frame()?,
        fallbacks: resampler.fallbacks,
    })
}

/// Resamples diagnostic cycles: HPPC per step segment on `test_time`,
/// reset and RPT cycles per charge/discharge on voltage.
pub fn interpolate_diagnostic_cycles(
    table: &CyclerTable,
    steps: &[StepGroup],
    params: &StructuringParameters,
    config: &StructuringConfig,
) -> Result<InterpolationOutput> {
    let mut resampler = Resampler::new(table, config);
    let mut frame = InterpolatedFrame::default();
    let Some(diagnostic) = params.diagnostic_available.as_ref() else {
        return Ok(InterpolationOutput {
            frame: frame.into_diagnostic_frame()?,
            fallbacks: Vec::new(),
        });
    };

    let grouped = group_steps_by_cycle(steps);
    for (cycle_index, cycle_type) in diagnostic.diagnostic_cycles() {
        let Some(cycle_steps) = grouped.get(&cycle_index) else {
            continue;
        };

        if cycle_type == HPPC {
            for step in cycle_steps {
                let request = GroupRequest {
                    cycle_index,
                    label: step.step_type.as_str(),
                    axis: Axis::TestTime,
                    tie_tolerance: 0.0,
                    grid: Grid::Seconds {
                        cap: params.diagnostic_resolution,
                    },
                };
                let rows: Vec<usize> = step.rows.clone().collect();
                if let Some(resampled) = resampler.run(&rows, request)? {
                    let labels = RowLabels::Diagnostic {
                        step_type: step.step_type.diagnostic_code(),
                        step_index: step.step_index,
                        step_index_counter: step.step_index_counter as i32,
                        cycle_type,
                    };
                    frame.push(&resampled, cycle_index, None, labels);
                }
            }
            continue;
        }

        for is_charge in [true, false] {
            let members: Vec<&&StepGroup> = cycle_steps
                .iter()
                .filter(|s| {
                    if is_charge {
                        s.step_type.is_charge()
                    } else {
                        s.step_type.is_discharge()
                    }
                })
                .collect();
            let Some(first) = members.first() else {
                continue;
            };
            let step_type = if is_charge {
                StepType::Charge
            } else {
                StepType::Discharge
            };
            let request = GroupRequest {
                cycle_index,
                label: step_type.as_str(),
                axis: Axis::Voltage,
                tie_tolerance: config.v_resolution,
                grid: Grid::Span {
                    range: Some(params.diagnostic_window()),
                    points: params.diagnostic_resolution,
                },
            };
            let rows = rows_of(members.iter().map(|step| **step));
            if let Some(resampled) = resampler.run(&rows, request)? {
                let labels = RowLabels::Diagnostic {
                    step_type: step_type.diagnostic_code(),
                    step_index: first.step_index,
                    step_index_counter: first.step_index_counter as i32,
                    cycle_type,
                };
                frame.push(&resampled, cycle_index, Some(is_charge), labels);
            }
        }
    }

    debug!(rows = frame.cycle_index.len(), "diagnostic cycles interpolated");
    Ok(InterpolationOutput {
        frame: frame.into_diagnostic_frame()?,
        fallbacks: resampler.fallbacks,
    })
}
