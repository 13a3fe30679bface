mod common;

use cellcycle_core::cycler_table::CyclerTable;
use cellcycle_core::step_classifier::{
    classify_cycle_steps, classify_steps, count_sign_changes, is_waveform_charge,
    is_waveform_discharge,
};
use cellcycle_core::{classify_step, ClassifierSettings, StepType};
use common::CyclerBuilder;
use proptest::prelude::*;

#[test]
fn regular_cycle_steps_are_labelled_in_order() {
    let run = common::regular_run(2);
    let table = CyclerTable::from_frame(run.data()).unwrap();
    let cycles = table.cycles();
    let steps = classify_cycle_steps(&table, &cycles[1], &ClassifierSettings::default());

    let labels: Vec<(i32, StepType)> = steps.iter().map(|s| (s.step_index, s.step_type)).collect();
    assert_eq!(
        labels,
        vec![
            (1, StepType::Rest),
            (2, StepType::Charge),
            (3, StepType::Rest),
            (4, StepType::Discharge),
        ]
    );
    assert!(steps.iter().all(|s| s.cycle_index == 1));
    assert_eq!(
        steps.iter().map(|s| s.step_index_counter).collect::<Vec<_>>(),
        vec![0, 1, 2, 3]
    );
}

#[test]
fn repeated_step_index_gets_new_counter() {
    let mut builder = CyclerBuilder::new();
    builder.charge(0, 2, 1.0, 3.0, 3.5, 10);
    builder.rest(0, 3, 3.5, 5);
    builder.charge(0, 2, 1.0, 3.5, 3.6, 10);
    let run = builder.build(common::REGULAR_FILE);
    let table = CyclerTable::from_frame(run.data()).unwrap();

    let steps = classify_steps(&table, &ClassifierSettings::default());
    assert_eq!(steps.len(), 3);
    assert_eq!(steps[0].step_index, steps[2].step_index);
    assert_eq!(steps[2].step_index_counter, 2);
    assert_eq!(steps[2].rows, 15..25);
}

#[test]
fn pulse_trains_are_waveforms() {
    let mut builder = CyclerBuilder::new();
    builder.pulses(0, 1, 2.0, 20);
    builder.pulses(0, 2, -2.0, 20);
    let run = builder.build(common::REGULAR_FILE);
    let table = CyclerTable::from_frame(run.data()).unwrap();

    let steps = classify_steps(&table, &ClassifierSettings::default());
    assert_eq!(steps[0].step_type, StepType::WaveformCharge);
    assert_eq!(steps[1].step_type, StepType::WaveformDischarge);

    let settings = ClassifierSettings::default();
    assert!(is_waveform_charge(&table.current[steps[0].rows.clone()], &settings));
    assert!(is_waveform_discharge(&table.current[steps[1].rows.clone()], &settings));
}

#[test]
fn noise_below_floor_does_not_flip_sign() {
    let settings = ClassifierSettings::default();
    let current = [2.0, 2.0, -0.001, 2.0, 0.001, 2.0, -0.0005, 2.0];
    assert_eq!(count_sign_changes(&current, &settings), 0);
    assert_eq!(classify_step(&current, &settings), StepType::Charge);
}

proptest! {
    #[test]
    fn labels_agree_with_sign_changes(current in prop::collection::vec(-5.0f64..5.0, 1..60)) {
        let settings = ClassifierSettings::default();
        let label = classify_step(&current, &settings);
        let peak = current.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));

        if peak < settings.rest_current_threshold {
            prop_assert_eq!(label, StepType::Rest);
        } else {
            let waveform = count_sign_changes(&current, &settings) > settings.sign_change_tolerance;
            prop_assert_eq!(label.is_waveform(), waveform);
            prop_assert!(label.is_charge() != label.is_discharge());
        }
    }

    #[test]
    fn constant_sign_is_never_a_waveform(
        magnitudes in prop::collection::vec(0.01f64..5.0, 1..60),
        negative in any::<bool>(),
    ) {
        let sign = if negative { -1.0 } else { 1.0 };
        let current: Vec<f64> = magnitudes.iter().map(|m| m * sign).collect();
        let label = classify_step(&current, &ClassifierSettings::default());
        let expected = if negative { StepType::Discharge } else { StepType::Charge };
        prop_assert_eq!(label, expected);
    }
}
