use crate::cycler_table::{CycleRange, CyclerTable};

pub const DEFAULT_PAUSED_THRESHOLD: f64 = 3600.0;

/// Largest gap between consecutive `test_time` samples in a row range.
pub fn max_time_gap(test_time: &[f64]) -> f64 {
    test_time
        .windows(2)
        .map(|pair| pair[1] - pair[0])
        .filter(|gap| gap.is_finite())
        .fold(0.0, f64::max)
}

/// The largest gap in seconds when it exceeds `threshold`, otherwise 0.
pub fn paused_seconds(test_time: &[f64], threshold: f64) -> i32 {
    let gap = max_time_gap(test_time);
    if gap > threshold {
        gap.round() as i32
    } else {
        0
    }
}

pub fn cycle_paused(table: &CyclerTable, cycle: &CycleRange, threshold: f64) -> i32 {
    paused_seconds(&table.test_time[cycle.rows.clone()], threshold)
}
