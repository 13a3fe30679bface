mod common;

use std::collections::BTreeMap;

use cellcycle_core::cycler_table::CyclerTable;
use cellcycle_core::interpolation::{linspace, AxisSamples};
use cellcycle_core::{
    Axis, InterpolationPolicy, Measure, NoParameterLookup, ProcessedCyclerRun, StructureError,
    StructuringConfig, STRUCTURE_DTYPES,
};
use common::{f64_values, i32_values, str_values, CyclerBuilder};
use proptest::prelude::*;

fn process(run: &cellcycle_core::RawCyclerRun, config: &StructuringConfig) -> ProcessedCyclerRun {
    ProcessedCyclerRun::from_raw_cycler_run(run, &NoParameterLookup, config, &STRUCTURE_DTYPES)
        .expect("structuring should succeed")
}

#[test]
fn every_group_has_resolution_rows() {
    let run = common::regular_run(6);
    let processed = process(&run, &StructuringConfig::default());
    let frame = processed.cycles_interpolated();

    let mut groups: BTreeMap<(i32, String), usize> = BTreeMap::new();
    for (cycle, step_type) in i32_values(frame, "cycle_index")
        .into_iter()
        .zip(str_values(frame, "step_type"))
    {
        *groups.entry((cycle, step_type)).or_default() += 1;
    }

    assert_eq!(groups.len(), 12);
    assert!(groups.values().all(|rows| *rows == 1000));
    assert_eq!(frame.height(), 12 * 1000);
    assert!(processed.fallbacks().is_empty());
}

#[test]
fn discharge_voltage_stays_inside_v_range() {
    let run = common::regular_run(3);
    let processed = process(&run, &StructuringConfig::default());
    let frame = processed.cycles_interpolated();
    let [lo, hi] = processed.structuring().v_range;

    let step_types = str_values(frame, "step_type");
    let voltage = f64_values(frame, "voltage");
    let discharge: Vec<f64> = step_types
        .iter()
        .zip(&voltage)
        .filter(|(step_type, _)| step_type.as_str() == "discharge")
        .map(|(_, v)| v.expect("voltage is the grid"))
        .collect();

    assert_eq!(discharge.len(), 3 * 1000);
    assert!(discharge.iter().all(|v| *v >= lo - 1e-6 && *v <= hi + 1e-6));
    assert!((discharge[0] - lo).abs() < 1e-6);
    assert!((discharge[999] - hi).abs() < 1e-6);
}

#[test]
fn fine_voltage_grid_recovers_linear_capacity() {
    let config = StructuringConfig {
        resolution: 10_000,
        charge_axis: Axis::Voltage,
        ..StructuringConfig::default()
    };
    let run = common::regular_run(2);
    let processed = process(&run, &config);
    let frame = processed.cycles_interpolated();

    let step_types = str_values(frame, "step_type");
    let cycles = i32_values(frame, "cycle_index");
    let voltage = f64_values(frame, "voltage");
    let capacity = f64_values(frame, "charge_capacity");

    let mut checked = 0;
    for idx in 0..frame.height() {
        if cycles[idx] != 0 || step_types[idx] != "charge" || idx % 500 != 0 {
            continue;
        }
        let v = voltage[idx].unwrap();
        let expected = common::regular_charge_capacity(v);
        let actual = capacity[idx].expect("grid inside observed range");
        assert!(
            (actual - expected).abs() <= 0.01 * expected,
            "capacity {actual} at {v} V, expected {expected}"
        );
        checked += 1;
    }
    assert!(checked >= 10);
}

#[test]
fn dqdv_is_positive_on_linear_discharge() {
    let run = common::regular_run(2);
    let processed = process(&run, &StructuringConfig::default());
    let frame = processed.cycles_interpolated();

    let step_types = str_values(frame, "step_type");
    let discharge_dqdv = f64_values(frame, "discharge_dQdV");
    let charge_dqdv = f64_values(frame, "charge_dQdV");
    for idx in 0..frame.height() {
        if step_types[idx] == "discharge" {
            // capacity grows as voltage falls
            let slope = discharge_dqdv[idx].expect("slope on the grid");
            assert!(slope < 0.0);
            assert!(charge_dqdv[idx].is_none());
        }
    }
}

fn run_with_short_discharge() -> cellcycle_core::RawCyclerRun {
    let mut builder = CyclerBuilder::new();
    builder.regular_cycle(0);
    builder.rest(1, 1, 3.0, 5);
    builder.charge(1, 2, 1.0, 2.7, 3.6, 60);
    builder.discharge(1, 4, 1.0, 3.6, 2.7, 3);
    builder.regular_cycle(2);
    builder.build(common::REGULAR_FILE)
}

#[test]
fn short_groups_fall_back_to_coarser_grid() {
    let processed = process(&run_with_short_discharge(), &StructuringConfig::default());

    let fallback = processed
        .fallbacks()
        .iter()
        .find(|f| f.cycle_index == 1 && f.step_type == "discharge")
        .expect("fallback recorded");
    assert_eq!(fallback.distinct_points, 3);
    assert_eq!(fallback.requested, 1000);
    assert_eq!(fallback.produced, 100);

    let frame = processed.cycles_interpolated();
    let rows = i32_values(frame, "cycle_index")
        .into_iter()
        .zip(str_values(frame, "step_type"))
        .filter(|(cycle, step_type)| *cycle == 1 && step_type == "discharge")
        .count();
    assert_eq!(rows, 100);
}

#[test]
fn strict_policy_rejects_short_groups() {
    let config = StructuringConfig {
        policy: InterpolationPolicy::Strict,
        ..StructuringConfig::default()
    };
    let result = ProcessedCyclerRun::from_raw_cycler_run(
        &run_with_short_discharge(),
        &NoParameterLookup,
        &config,
        &STRUCTURE_DTYPES,
    );
    match result {
        Err(StructureError::InsufficientInterpolationLength {
            cycle_index,
            points,
            minimum,
            ..
        }) => {
            assert_eq!(cycle_index, 1);
            assert_eq!(points, 3);
            assert_eq!(minimum, 5);
        }
        other => panic!("expected InsufficientInterpolationLength, got {other:?}"),
    }
}

fn table_from(axis: &[f64], capacity: &[f64]) -> CyclerTable {
    let n = axis.len();
    CyclerTable {
        cycle_index: vec![0; n],
        step_index: vec![1; n],
        test_time: (0..n).map(|i| i as f64).collect(),
        voltage: axis.to_vec(),
        current: vec![-1.0; n],
        charge_capacity: vec![0.0; n],
        discharge_capacity: capacity.to_vec(),
        charge_energy: vec![0.0; n],
        discharge_energy: vec![0.0; n],
        temperature: None,
        internal_resistance: None,
        date_time_iso: None,
    }
}

proptest! {
    #[test]
    fn resampled_values_stay_within_observed_bounds(
        samples in prop::collection::vec((2.0f64..4.5, 0.0f64..5.0), 2..40),
        lo in 1.5f64..3.0,
        width in 0.5f64..3.0,
    ) {
        let axis: Vec<f64> = samples.iter().map(|(v, _)| *v).collect();
        let capacity: Vec<f64> = samples.iter().map(|(_, q)| *q).collect();
        let table = table_from(&axis, &capacity);
        let rows: Vec<usize> = (0..axis.len()).collect();

        let grouped = AxisSamples::from_rows(&table, &rows, Axis::Voltage, 0.0005);
        let [min_v, max_v] = grouped.observed_range().unwrap();
        let grid = linspace(lo, lo + width, 50);
        let resampled = grouped.resample(&grid);
        prop_assert_eq!(resampled.len(), grid.len());

        let q_lo = capacity.iter().copied().fold(f64::INFINITY, f64::min);
        let q_hi = capacity.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let values = resampled.column(Measure::DischargeCapacity).unwrap();
        for (x, value) in grid.iter().zip(values) {
            if *x < min_v - 1e-6 || *x > max_v + 1e-6 {
                prop_assert!(value.is_none());
            } else if let Some(q) = value {
                prop_assert!(*q >= q_lo - 1e-9 && *q <= q_hi + 1e-9);
            }
        }
    }
}
