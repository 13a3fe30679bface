use std::collections::BTreeMap;
use std::ops::Range;

use polars::prelude::*;
use tracing::debug;

use crate::config::StructuringConfig;
use crate::cycler_table::{CycleRange, CyclerTable};
use crate::error::Result;
use crate::paused::cycle_paused;
use crate::step_classifier::{group_steps_by_cycle, StepGroup, StepType};
use crate::structuring::StructuringParameters;

/// Aggregates of one cycle, shared by the regular and diagnostic summaries.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleSummary {
    pub cycle_index: i32,
    pub discharge_capacity: f64,
    pub charge_capacity: f64,
    pub discharge_energy: f64,
    pub charge_energy: f64,
    pub dc_internal_resistance: Option<f64>,
    pub temperature_maximum: Option<f64>,
    pub temperature_average: Option<f64>,
    pub temperature_minimum: Option<f64>,
    pub date_time_iso: Option<String>,
    pub energy_efficiency: Option<f64>,
    pub coulombic_efficiency: Option<f64>,
    pub charge_duration: Option<f64>,
    pub time_temperature_integrated: Option<f64>,
    pub paused: i32,
}

fn finite(values: &[f64], rows: Range<usize>) -> impl Iterator<Item = f64> + '_ {
    rows.map(move |row| values[row]).filter(|v| v.is_finite())
}

fn span(values: &[f64], rows: Range<usize>) -> Option<f64> {
    let (lo, hi) = finite(values, rows).fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    (lo <= hi).then_some(hi - lo)
}

fn max_of(values: &[f64], rows: Range<usize>) -> Option<f64> {
    finite(values, rows).reduce(f64::max)
}

/// Sum of per-step gains over steps of one class, or the cycle maximum
/// when the cycle has no such step.
fn class_total(
    values: &[f64],
    cycle: &CycleRange,
    steps: &[&StepGroup],
    class: fn(&StepType) -> bool,
) -> f64 {
    let matching: Vec<&&StepGroup> = steps.iter().filter(|s| class(&s.step_type)).collect();
    if matching.is_empty() {
        return max_of(values, cycle.rows.clone()).unwrap_or(0.0);
    }
    matching
        .iter()
        .filter_map(|step| span(values, step.rows.clone()))
        .sum()
}

pub fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    })
}

fn ratio(numerator: f64, denominator: f64) -> Option<f64> {
    (denominator > 0.0)
        .then(|| numerator / denominator)
        .filter(|v| v.is_finite())
}

/// Trapezoid integral of temperature over `test_time`, in °C·h.
pub fn time_temperature_integrated(test_time: &[f64], temperature: &[f64]) -> Option<f64> {
    let mut total = 0.0;
    let mut any = false;
    for idx in 1..test_time.len().min(temperature.len()) {
        let (t0, t1) = (test_time[idx - 1], test_time[idx]);
        let (y0, y1) = (temperature[idx - 1], temperature[idx]);
        if [t0, t1, y0, y1].iter().all(|v| v.is_finite()) {
            total += (t1 - t0) * (y0 + y1) / 2.0;
            any = true;
        }
    }
    any.then_some(total / 3600.0)
}

pub fn summarize_cycle(
    table: &CyclerTable,
    cycle: &CycleRange,
    steps: &[&StepGroup],
    params: &StructuringParameters,
    config: &StructuringConfig,
) -> CycleSummary {
    let rows = cycle.rows.clone();
    let charge_capacity = class_total(&table.charge_capacity, cycle, steps, StepType::is_charge);
    let discharge_capacity =
        class_total(&table.discharge_capacity, cycle, steps, StepType::is_discharge);
    let charge_energy = class_total(&table.charge_energy, cycle, steps, StepType::is_charge);
    let discharge_energy =
        class_total(&table.discharge_energy, cycle, steps, StepType::is_discharge);

    let dc_internal_resistance = table.internal_resistance.as_deref().and_then(|ir| {
        let mut positive: Vec<f64> = finite(ir, rows.clone()).filter(|v| *v > 0.0).collect();
        median(&mut positive)
    });

    let temperature = table.temperature.as_deref();
    let temps: Vec<f64> = temperature
        .map(|t| finite(t, rows.clone()).collect())
        .unwrap_or_default();
    let temperature_maximum = temps.iter().copied().reduce(f64::max);
    let temperature_minimum = temps.iter().copied().reduce(f64::min);
    let temperature_average =
        (!temps.is_empty()).then(|| temps.iter().sum::<f64>() / temps.len() as f64);
    let time_temperature = temperature.and_then(|t| {
        time_temperature_integrated(&table.test_time[rows.clone()], &t[rows.clone()])
    });

    let date_time_iso = table
        .date_time_iso
        .as_ref()
        .and_then(|dates| dates[rows.clone()].iter().flatten().next().cloned());

    let target = params.nominal_capacity * params.full_fast_charge;
    let start_time = table.test_time[rows.start];
    let charge_duration = rows
        .clone()
        .find(|row| table.charge_capacity[*row] >= target)
        .map(|row| table.test_time[row] - start_time)
        .filter(|v| v.is_finite());

    CycleSummary {
        cycle_index: cycle.cycle_index,
        discharge_capacity,
        charge_capacity,
        discharge_energy,
        charge_energy,
        dc_internal_resistance,
        temperature_maximum,
        temperature_average,
        temperature_minimum,
        date_time_iso,
        energy_efficiency: ratio(discharge_energy, charge_energy),
        coulombic_efficiency: ratio(discharge_capacity, charge_capacity),
        charge_duration,
        time_temperature_integrated: time_temperature,
        paused: cycle_paused(table, cycle, config.paused_threshold),
    }
}

fn cumulative(values: impl Iterator<Item = f64>) -> Vec<f64> {
    values
        .scan(0.0, |total, v| {
            *total += v;
            Some(*total)
        })
        .collect()
}

fn common_columns(rows: &[CycleSummary]) -> Vec<Column> {
    let f64_col = |name: &str, pick: fn(&CycleSummary) -> f64| -> Column {
        Series::new(name.into(), rows.iter().map(pick).collect::<Vec<f64>>()).into()
    };
    let opt_col = |name: &str, pick: fn(&CycleSummary) -> Option<f64>| -> Column {
        Series::new(name.into(), rows.iter().map(pick).collect::<Vec<Option<f64>>>()).into()
    };
    vec![
        Series::new(
            "cycle_index".into(),
            rows.iter().map(|r| r.cycle_index).collect::<Vec<i32>>(),
        )
        .into(),
        f64_col("discharge_capacity", |r| r.discharge_capacity),
        f64_col("charge_capacity", |r| r.charge_capacity),
        f64_col("discharge_energy", |r| r.discharge_energy),
        f64_col("charge_energy", |r| r.charge_energy),
        opt_col("dc_internal_resistance", |r| r.dc_internal_resistance),
        opt_col("temperature_maximum", |r| r.temperature_maximum),
        opt_col("temperature_average", |r| r.temperature_average),
        opt_col("temperature_minimum", |r| r.temperature_minimum),
        Series::new(
            "date_time_iso".into(),
            rows.iter()
                .map(|r| r.date_time_iso.clone())
                .collect::<Vec<Option<String>>>(),
        )
        .into(),
        opt_col("energy_efficiency", |r| r.energy_efficiency),
    ]
}

/// One row per complete regular cycle. The run's last cycle is left out
/// because it is usually cut off mid-way.
pub fn regular_summary(
    table: &CyclerTable,
    steps: &[StepGroup],
    params: &StructuringParameters,
    config: &StructuringConfig,
) -> Result<DataFrame> {
    let grouped = group_steps_by_cycle(steps);
    let last = table.last_cycle_index();
    let rows: Vec<CycleSummary> = table
        .cycles()
        .iter()
        .filter(|cycle| Some(cycle.cycle_index) != last && !params.is_diagnostic(cycle.cycle_index))
        .map(|cycle| {
            let cycle_steps = grouped.get(&cycle.cycle_index).map(Vec::as_slice).unwrap_or(&[]);
            summarize_cycle(table, cycle, cycle_steps, params, config)
        })
        .collect();
    debug!(cycles = rows.len(), "regular summary built");

    let mut columns = common_columns(&rows);
    columns.push(
        Series::new(
            "charge_throughput".into(),
            cumulative(rows.iter().map(|r| r.charge_capacity)),
        )
        .into(),
    );
    columns.push(
        Series::new(
            "energy_throughput".into(),
            cumulative(rows.iter().map(|r| r.charge_energy)),
        )
        .into(),
    );
    columns.push(
        Series::new(
            "charge_duration".into(),
            rows.iter().map(|r| r.charge_duration).collect::<Vec<_>>(),
        )
        .into(),
    );
    columns.push(
        Series::new(
            "time_temperature_integrated".into(),
            rows.iter()
                .map(|r| r.time_temperature_integrated)
                .collect::<Vec<_>>(),
        )
        .into(),
    );
    columns.push(
        Series::new(
            "paused".into(),
            rows.iter().map(|r| r.paused).collect::<Vec<i32>>(),
        )
        .into(),
    );
    Ok(DataFrame::new(columns)?)
}

/// One row per diagnostic cycle present in the run, tagged with its phase.
pub fn diagnostic_summary(
    table: &CyclerTable,
    steps: &[StepGroup],
    params: &StructuringParameters,
    config: &StructuringConfig,
) -> Result<DataFrame> {
    let grouped = group_steps_by_cycle(steps);
    let cycles: BTreeMap<i32, CycleRange> = table
        .cycles()
        .into_iter()
        .map(|cycle| (cycle.cycle_index, cycle))
        .collect();

    let mut rows = Vec::new();
    let mut cycle_types = Vec::new();
    if let Some(diagnostic) = params.diagnostic_available.as_ref() {
        for (cycle_index, cycle_type) in diagnostic.diagnostic_cycles() {
            let Some(cycle) = cycles.get(&cycle_index) else {
                continue;
            };
            let cycle_steps = grouped.get(&cycle_index).map(Vec::as_slice).unwrap_or(&[]);
            rows.push(summarize_cycle(table, cycle, cycle_steps, params, config));
            cycle_types.push(cycle_type.to_string());
        }
    }
    debug!(cycles = rows.len(), "diagnostic summary built");

    let mut columns = common_columns(&rows);
    columns.push(
        Series::new(
            "coulombic_efficiency".into(),
            rows.iter().map(|r| r.coulombic_efficiency).collect::<Vec<_>>(),
        )
        .into(),
    );
    columns.push(
        Series::new(
            "charge_duration".into(),
            rows.iter().map(|r| r.charge_duration).collect::<Vec<_>>(),
        )
        .into(),
    );
    columns.push(
        Series::new(
            "time_temperature_integrated".into(),
            rows.iter()
                .map(|r| r.time_temperature_integrated)
                .collect::<Vec<_>>(),
        )
        .into(),
    );
    columns.push(
        Series::new(
            "paused".into(),
            rows.iter().map(|r| r.paused).collect::<Vec<i32>>(),
        )
        .into(),
    );
    columns.push(Series::new("cycle_type".into(), cycle_types).into());
    Ok(DataFrame::new(columns)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_handles_even_and_odd_lengths() {
        assert_eq!(median(&mut [3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&mut [4.0, 1.0, 2.0, 3.0]), Some(2.5));
        assert_eq!(median(&mut []), None);
    }

    #[test]
    fn temperature_integral_is_in_degree_hours() {
        let time = [0.0, 1800.0, 3600.0];
        let temp = [25.0, 25.0, 25.0];
        let integral = time_temperature_integrated(&time, &temp).expect("finite samples");
        assert!((integral - 25.0).abs() < 1e-12);
        assert_eq!(time_temperature_integrated(&[0.0], &[25.0]), None);
    }
}
