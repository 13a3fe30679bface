mod common;

use cellcycle_core::{
    NoParameterLookup, ProcessedCyclerRun, StructuringConfig, ToProcessedCyclerRun,
    STRUCTURE_DTYPES,
};
use common::CyclerBuilder;
use polars::prelude::*;

/// Discharge capacity drops by three samples' worth every cycle.
fn fading_run(cycles: i32) -> ProcessedCyclerRun {
    let mut builder = CyclerBuilder::new();
    for cycle in 0..cycles {
        let points = 60 - 3 * cycle as usize;
        builder.rest(cycle, 1, 3.0, 5);
        builder.charge(cycle, 2, 1.0, 2.7, 3.6, 60);
        builder.rest(cycle, 3, 3.6, 5);
        builder.discharge(cycle, 4, 1.0, 3.6, 2.7, points);
    }
    ProcessedCyclerRun::from_raw_cycler_run(
        &builder.build(common::REGULAR_FILE),
        &NoParameterLookup,
        &StructuringConfig::default(),
        &STRUCTURE_DTYPES,
    )
    .expect("structuring should succeed")
}

fn single_i32(df: &DataFrame, name: &str) -> Option<i32> {
    df.column(name).unwrap().i32().unwrap().get(0)
}

#[test]
fn metadata_is_carried_from_raw_run() {
    let run = fading_run(3);
    assert_eq!(run.metadata().barcode.as_deref(), Some("SYN000001"));
    assert_eq!(run.metadata().protocol.as_deref(), Some("synthetic.000"));
    assert_eq!(run.metadata().channel_id, Some(10));
    assert_eq!(run.schema_version(), STRUCTURE_DTYPES.version);
}

#[test]
fn cycle_life_is_first_cycle_below_threshold() {
    let run = fading_run(12);
    // 59 → 56 → 53 → 50 → 47 samples: 47/59 is the first below 80 %
    assert_eq!(run.get_cycle_life(3, 0.8).unwrap(), Some(4));
    assert_eq!(run.get_cycle_life(3, 0.1).unwrap(), None);
}

#[test]
fn set_capacities_are_reported_per_fraction() {
    let run = fading_run(12);
    let frame = run.cycles_to_reach_set_capacities(0.98, 0.78, 0.03).unwrap();

    assert_eq!(frame.height(), 1);
    let names: Vec<String> = frame
        .get_column_names()
        .iter()
        .map(|name| name.to_string())
        .collect();
    assert_eq!(
        names,
        vec![
            "capacity_0.98",
            "capacity_0.95",
            "capacity_0.92",
            "capacity_0.89",
            "capacity_0.86",
            "capacity_0.83",
            "capacity_0.8",
        ]
    );
    assert_eq!(single_i32(&frame, "capacity_0.98"), Some(1));
    assert_eq!(single_i32(&frame, "capacity_0.8"), Some(4));
}

#[test]
fn capacities_at_set_cycles_follow_the_interval() {
    let run = fading_run(12);
    let frame = run.capacities_at_set_cycles(0, 20, 5).unwrap();

    let at = |name: &str| frame.column(name).unwrap().f64().unwrap().get(0);
    let full = common::regular_charge_capacity(common::HIGH_VOLTAGE);
    assert!((at("capacity_at_0").unwrap() - full).abs() < 1e-9);
    assert!((at("capacity_at_5").unwrap() - full * 44.0 / 59.0).abs() < 1e-9);
    assert_eq!(at("capacity_at_10").map(|c| c > 0.0), Some(true));
    assert_eq!(at("capacity_at_15"), None);
    assert_eq!(frame.width(), 4);
}

#[test]
fn raw_run_converts_itself() {
    let raw = common::regular_run(4);
    let run = raw
        .to_processed_cycler_run(&NoParameterLookup, &StructuringConfig::default(), &STRUCTURE_DTYPES)
        .unwrap();
    let direct = ProcessedCyclerRun::from_raw_cycler_run(
        &raw,
        &NoParameterLookup,
        &StructuringConfig::default(),
        &STRUCTURE_DTYPES,
    )
    .unwrap();

    assert_eq!(run.metadata(), direct.metadata());
    assert!(run.summary().equals_missing(direct.summary()));
}
