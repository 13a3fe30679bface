#![allow(dead_code)]

use cellcycle_core::{
    DiagnosticTemplate, ProtocolParameters, RawCyclerRun, RunMetadata, StaticParameterLookup,
};
use polars::prelude::*;

pub const SAMPLE_SECONDS: f64 = 10.0;
pub const PULSE_SECONDS: f64 = 1.0;

/// Regular cycles charge 2.7 V → 3.6 V over this many points at 1 A.
pub const CHARGE_POINTS: usize = 60;
pub const LOW_VOLTAGE: f64 = 2.7;
pub const HIGH_VOLTAGE: f64 = 3.6;

pub const DIAGNOSTIC_PROJECT: &str = "PreDiag";
pub const DIAGNOSTIC_SEQ: u32 = 109;
pub const DIAGNOSTIC_FILE: &str = "PreDiag_000109_synthetic.010";
pub const REGULAR_FILE: &str = "Synthetic_000001_regular.010";

/// Charge capacity (Ah) a regular cycle accumulates between two voltages.
pub fn regular_charge_capacity(voltage: f64) -> f64 {
    let total = SAMPLE_SECONDS * (CHARGE_POINTS - 1) as f64 / 3600.0;
    total * (voltage - LOW_VOLTAGE) / (HIGH_VOLTAGE - LOW_VOLTAGE)
}

/// Accumulates synthetic datapoints. Capacity and energy counters grow
/// within a cycle and restart at every new cycle index.
#[derive(Debug, Default)]
pub struct CyclerBuilder {
    cycle_index: Vec<i32>,
    step_index: Vec<i32>,
    test_time: Vec<f64>,
    voltage: Vec<f64>,
    current: Vec<f64>,
    charge_capacity: Vec<f64>,
    discharge_capacity: Vec<f64>,
    charge_energy: Vec<f64>,
    discharge_energy: Vec<f64>,
    temperature: Vec<f64>,
    internal_resistance: Vec<f64>,
    time: f64,
    cycle: i32,
    totals: [f64; 4],
}

fn ramp(from: f64, to: f64, points: usize) -> Vec<f64> {
    if points < 2 {
        return vec![from; points];
    }
    (0..points)
        .map(|i| from + (to - from) * i as f64 / (points - 1) as f64)
        .collect()
}

impl CyclerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn segment(&mut self, cycle: i32, step: i32, currents: &[f64], voltages: &[f64], dt: f64) {
        if cycle != self.cycle {
            self.cycle = cycle;
            self.totals = [0.0; 4];
        }
        for (i, (current, voltage)) in currents.iter().zip(voltages).enumerate() {
            if !self.test_time.is_empty() {
                self.time += dt;
            }
            if i > 0 {
                let dq = current.abs() * dt / 3600.0;
                if *current > 0.0 {
                    self.totals[0] += dq;
                    self.totals[2] += dq * voltage;
                } else if *current < 0.0 {
                    self.totals[1] += dq;
                    self.totals[3] += dq * voltage;
                }
            }
            self.cycle_index.push(cycle);
            self.step_index.push(step);
            self.test_time.push(self.time);
            self.voltage.push(*voltage);
            self.current.push(*current);
            self.charge_capacity.push(self.totals[0]);
            self.discharge_capacity.push(self.totals[1]);
            self.charge_energy.push(self.totals[2]);
            self.discharge_energy.push(self.totals[3]);
            self.temperature.push(25.0 + 0.5 * current.abs());
            self.internal_resistance
                .push(if *current == 0.0 { 0.0 } else { 0.02 });
        }
    }

    pub fn rest(&mut self, cycle: i32, step: i32, voltage: f64, points: usize) {
        self.segment(cycle, step, &vec![0.0; points], &vec![voltage; points], SAMPLE_SECONDS);
    }

    pub fn charge(&mut self, cycle: i32, step: i32, amps: f64, from: f64, to: f64, points: usize) {
        self.segment(cycle, step, &vec![amps; points], &ramp(from, to, points), SAMPLE_SECONDS);
    }

    pub fn discharge(&mut self, cycle: i32, step: i32, amps: f64, from: f64, to: f64, points: usize) {
        self.segment(cycle, step, &vec![-amps; points], &ramp(from, to, points), SAMPLE_SECONDS);
    }

    /// Alternating current that flips sign every sample; net sign follows `amps`.
    pub fn pulses(&mut self, cycle: i32, step: i32, amps: f64, points: usize) {
        let currents: Vec<f64> = (0..points)
            .map(|i| if i % 2 == 0 { amps } else { -0.5 * amps })
            .collect();
        let voltages: Vec<f64> = currents.iter().map(|c| 3.4 + 0.01 * c).collect();
        self.segment(cycle, step, &currents, &voltages, PULSE_SECONDS);
    }

    /// Clock jump with no datapoints, as when a channel is paused.
    pub fn pause(&mut self, seconds: f64) {
        self.time += seconds;
    }

    /// rest, charge 2.7 → 3.6 V, rest, discharge 3.6 → 2.7 V, all at 1 A.
    pub fn regular_cycle(&mut self, cycle: i32) {
        self.rest(cycle, 1, 3.0, 5);
        self.charge(cycle, 2, 1.0, LOW_VOLTAGE, HIGH_VOLTAGE, CHARGE_POINTS);
        self.rest(cycle, 3, HIGH_VOLTAGE, 5);
        self.discharge(cycle, 4, 1.0, HIGH_VOLTAGE, LOW_VOLTAGE, CHARGE_POINTS);
    }

    /// One cycle of an HPPC+RPT block; `phase` 0 is reset, 1 hppc, 2..=4 the RPTs.
    pub fn diagnostic_cycle(&mut self, cycle: i32, phase: usize) {
        match phase {
            0 => {
                self.rest(cycle, 11, 3.0, 5);
                self.charge(cycle, 12, 0.2, 2.6, 4.1, 40);
                self.discharge(cycle, 13, 0.2, 4.1, 2.6, 40);
            }
            1 => {
                let dt = PULSE_SECONDS;
                self.segment(cycle, 21, &[0.0; 5], &[3.6; 5], dt);
                self.segment(cycle, 22, &[-2.0; 10], &ramp(3.6, 3.4, 10), dt);
                self.segment(cycle, 23, &[0.0; 5], &[3.45; 5], dt);
                self.segment(cycle, 24, &[1.0; 10], &ramp(3.45, 3.55, 10), dt);
            }
            n => {
                let step = 11 + 10 * n as i32;
                let amps = [0.2, 1.0, 2.0][(n - 2).min(2)];
                self.charge(cycle, step, amps, 2.6, 4.1, 40);
                self.discharge(cycle, step + 1, amps, 4.1, 2.6, 40);
            }
        }
    }

    pub fn diagnostic_block(&mut self, first_cycle: i32) {
        for phase in 0..5 {
            self.diagnostic_cycle(first_cycle + phase as i32, phase);
        }
    }

    pub fn frame(&self) -> DataFrame {
        let n = self.cycle_index.len();
        DataFrame::new(vec![
            Series::new("data_point".into(), (1..=n as i64).collect::<Vec<i64>>()).into(),
            Series::new("cycle_index".into(), self.cycle_index.clone()).into(),
            Series::new("step_index".into(), self.step_index.clone()).into(),
            Series::new("test_time".into(), self.test_time.clone()).into(),
            Series::new("voltage".into(), self.voltage.clone()).into(),
            Series::new("current".into(), self.current.clone()).into(),
            Series::new("charge_capacity".into(), self.charge_capacity.clone()).into(),
            Series::new("discharge_capacity".into(), self.discharge_capacity.clone()).into(),
            Series::new("charge_energy".into(), self.charge_energy.clone()).into(),
            Series::new("discharge_energy".into(), self.discharge_energy.clone()).into(),
            Series::new("temperature".into(), self.temperature.clone()).into(),
            Series::new("internal_resistance".into(), self.internal_resistance.clone()).into(),
        ])
        .expect("synthetic frame")
    }

    pub fn build(&self, filename: &str) -> RawCyclerRun {
        let mut metadata = RunMetadata::new();
        metadata.insert("filename", filename);
        metadata.insert("barcode", "SYN000001");
        metadata.insert("protocol", "synthetic.000");
        metadata.insert("channel_id", 10);
        RawCyclerRun::new(self.frame(), metadata).expect("valid synthetic run")
    }
}

/// `cycles` regular cycles numbered from zero.
pub fn regular_run(cycles: i32) -> RawCyclerRun {
    let mut builder = CyclerBuilder::new();
    for cycle in 0..cycles {
        builder.regular_cycle(cycle);
    }
    builder.build(REGULAR_FILE)
}

/// Cycles `0..=last`, with a five-cycle diagnostic block at every start.
pub fn diagnostic_run(starts: &[i32], last: i32) -> RawCyclerRun {
    let mut builder = CyclerBuilder::new();
    for cycle in 0..=last {
        match starts.iter().find(|s| cycle >= **s && cycle < **s + 5) {
            Some(start) => builder.diagnostic_cycle(cycle, (cycle - start) as usize),
            None => builder.regular_cycle(cycle),
        }
    }
    builder.build(DIAGNOSTIC_FILE)
}

pub fn diagnostic_protocol(start_cycle: i32, interval: i32) -> ProtocolParameters {
    ProtocolParameters::new(DIAGNOSTIC_PROJECT, DIAGNOSTIC_SEQ)
        .with_field("diagnostic_type", "HPPC+RPT")
        .with_field("diagnostic_parameter_set", "Tesla21700")
        .with_field("cell_type", "Tesla_Model3_21700")
        .with_field("capacity_nominal", "4.84")
        .with_field("diagnostic_start_cycle", start_cycle.to_string())
        .with_field("diagnostic_interval", interval.to_string())
}

pub fn diagnostic_lookup(start_cycle: i32, interval: i32) -> StaticParameterLookup {
    StaticParameterLookup::new()
        .with_protocol(diagnostic_protocol(start_cycle, interval))
        .with_template(
            DIAGNOSTIC_PROJECT,
            DiagnosticTemplate::new("Tesla21700")
                .with_field("diagnostic_discharge_cutoff_voltage", "2.7")
                .with_field("diagnostic_charge_cutoff_voltage", "4.0"),
        )
}

pub fn i32_values(df: &DataFrame, name: &str) -> Vec<i32> {
    df.column(name)
        .unwrap()
        .i32()
        .unwrap()
        .into_iter()
        .map(|v| v.expect("non-null"))
        .collect()
}

pub fn f64_values(df: &DataFrame, name: &str) -> Vec<Option<f64>> {
    df.column(name)
        .unwrap()
        .cast(&DataType::Float64)
        .unwrap()
        .f64()
        .unwrap()
        .into_iter()
        .collect()
}

pub fn str_values(df: &DataFrame, name: &str) -> Vec<String> {
    df.column(name)
        .unwrap()
        .str()
        .unwrap()
        .into_iter()
        .map(|v| v.unwrap_or_default().to_string())
        .collect()
}
