use std::path::Path;

use cellcycle_parser::{RawCyclerRun, RunMetadata};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::StructuringConfig;
use crate::cycler_table::CyclerTable;
use crate::error::Result;
use crate::interpolation::{interpolate_cycles, interpolate_diagnostic_cycles, InterpolationFallback};
use crate::parameters_lookup::ParameterLookup;
use crate::schema::{
    StructureSchema, CYCLES_INTERPOLATED, DIAGNOSTIC_INTERPOLATED, DIAGNOSTIC_SUMMARY, SUMMARY,
};
use crate::step_classifier::classify_steps;
use crate::structuring::{resolve_structuring_parameters, StructuringParameters};
use crate::summary::{diagnostic_summary, regular_summary};

/// Run identity copied from the raw metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProcessedMetadata {
    pub barcode: Option<String>,
    pub protocol: Option<String>,
    pub channel_id: Option<i64>,
}

impl From<&RunMetadata> for ProcessedMetadata {
    fn from(metadata: &RunMetadata) -> Self {
        Self {
            barcode: metadata.barcode().map(str::to_string),
            protocol: metadata.protocol().map(str::to_string),
            channel_id: metadata.channel_id(),
        }
    }
}

/// The four processed tables of a run.
#[derive(Debug, Clone)]
pub struct ProcessedTables {
    pub summary: DataFrame,
    pub diagnostic_summary: DataFrame,
    pub cycles_interpolated: DataFrame,
    pub diagnostic_interpolated: DataFrame,
}

impl ProcessedTables {
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &DataFrame)> {
        [
            (SUMMARY, &self.summary),
            (DIAGNOSTIC_SUMMARY, &self.diagnostic_summary),
            (CYCLES_INTERPOLATED, &self.cycles_interpolated),
            (DIAGNOSTIC_INTERPOLATED, &self.diagnostic_interpolated),
        ]
        .into_iter()
    }
}

/// Structuring entry point on the raw run itself.
pub trait ToProcessedCyclerRun {
    fn to_processed_cycler_run(
        &self,
        lookup: &dyn ParameterLookup,
        config: &StructuringConfig,
        schema: &StructureSchema,
    ) -> Result<ProcessedCyclerRun>;
}

impl ToProcessedCyclerRun for RawCyclerRun {
    fn to_processed_cycler_run(
        &self,
        lookup: &dyn ParameterLookup,
        config: &StructuringConfig,
        schema: &StructureSchema,
    ) -> Result<ProcessedCyclerRun> {
        ProcessedCyclerRun::from_raw_cycler_run(self, lookup, config, schema)
    }
}

#[derive(Debug, Clone)]
pub struct ProcessedCyclerRun {
    metadata: ProcessedMetadata,
    tables: ProcessedTables,
    structuring: StructuringParameters,
    fallbacks: Vec<InterpolationFallback>,
    schema_version: u32,
}

impl ProcessedCyclerRun {
    /// Runs the full structuring pipeline over a raw run.
    pub fn from_raw_cycler_run(
        raw: &RawCyclerRun,
        lookup: &dyn ParameterLookup,
        config: &StructuringConfig,
        schema: &StructureSchema,
    ) -> Result<Self> {
        let table = CyclerTable::from_frame(raw.data())?;
        let structuring = resolve_structuring_parameters(raw.metadata(), &table, lookup, config)?;
        info!(
            v_range = ?structuring.v_range,
            nominal_capacity = structuring.nominal_capacity,
            diagnostics = structuring.diagnostic_available.is_some(),
            "structuring parameters resolved"
        );

        let steps = classify_steps(&table, &config.classifier);
        info!(steps = steps.len(), "steps classified");

        let regular = interpolate_cycles(&table, &steps, &structuring, config)?;
        let diagnostic = interpolate_diagnostic_cycles(&table, &steps, &structuring, config)?;
        info!(
            rows = regular.frame.height(),
            diagnostic_rows = diagnostic.frame.height(),
            "cycles interpolated"
        );

        let summary = regular_summary(&table, &steps, &structuring, config)?;
        let diag_summary = diagnostic_summary(&table, &steps, &structuring, config)?;
        info!(
            cycles = summary.height(),
            diagnostic_cycles = diag_summary.height(),
            "summaries built"
        );

        let tables = ProcessedTables {
            summary: schema.conform(SUMMARY, summary)?,
            diagnostic_summary: schema.conform(DIAGNOSTIC_SUMMARY, diag_summary)?,
            cycles_interpolated: schema.conform(CYCLES_INTERPOLATED, regular.frame)?,
            diagnostic_interpolated: schema.conform(DIAGNOSTIC_INTERPOLATED, diagnostic.frame)?,
        };
        let mut fallbacks = regular.fallbacks;
        fallbacks.extend(diagnostic.fallbacks);

        Ok(Self {
            metadata: ProcessedMetadata::from(raw.metadata()),
            tables,
            structuring,
            fallbacks,
            schema_version: schema.version,
        })
    }

    /// Parses a cycler file of any supported format and structures it.
    pub fn auto_load(
        path: impl AsRef<Path>,
        lookup: &dyn ParameterLookup,
        config: &StructuringConfig,
        schema: &StructureSchema,
    ) -> Result<Self> {
        let raw = RawCyclerRun::from_file(path)?;
        Self::from_raw_cycler_run(&raw, lookup, config, schema)
    }

    /// Rebuilds a run from stored tables, rejecting any that break the schema.
    pub fn from_parts(
        metadata: ProcessedMetadata,
        tables: ProcessedTables,
        structuring: StructuringParameters,
        fallbacks: Vec<InterpolationFallback>,
        schema: &StructureSchema,
    ) -> Result<Self> {
        for (name, frame) in tables.iter() {
            schema.validate(name, frame)?;
        }
        Ok(Self {
            metadata,
            tables,
            structuring,
            fallbacks,
            schema_version: schema.version,
        })
    }

    pub fn metadata(&self) -> &ProcessedMetadata {
        &self.metadata
    }

    pub fn tables(&self) -> &ProcessedTables {
        &self.tables
    }

    pub fn summary(&self) -> &DataFrame {
        &self.tables.summary
    }

    pub fn diagnostic_summary(&self) -> &DataFrame {
        &self.tables.diagnostic_summary
    }

    pub fn cycles_interpolated(&self) -> &DataFrame {
        &self.tables.cycles_interpolated
    }

    pub fn diagnostic_interpolated(&self) -> &DataFrame {
        &self.tables.diagnostic_interpolated
    }

    pub fn structuring(&self) -> &StructuringParameters {
        &self.structuring
    }

    pub fn fallbacks(&self) -> &[InterpolationFallback] {
        &self.fallbacks
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    fn capacity_fade(&self) -> Result<Vec<(i32, f64)>> {
        let summary = &self.tables.summary;
        let cycles = summary.column("cycle_index")?.i32()?;
        let capacity = summary.column("discharge_capacity")?.f64()?;
        Ok(cycles
            .into_iter()
            .zip(capacity)
            .filter_map(|(cycle, cap)| Some((cycle?, cap?)))
            .collect())
    }

    /// First cycle whose discharge capacity falls below `threshold` times the
    /// best of the first `n_cycles_cutoff` cycles.
    pub fn get_cycle_life(&self, n_cycles_cutoff: usize, threshold: f64) -> Result<Option<i32>> {
        let fade = self.capacity_fade()?;
        let reference = fade
            .iter()
            .take(n_cycles_cutoff)
            .map(|(_, cap)| *cap)
            .fold(f64::NEG_INFINITY, f64::max);
        if !reference.is_finite() {
            return Ok(None);
        }
        Ok(fade
            .iter()
            .find(|(_, cap)| *cap < threshold * reference)
            .map(|(cycle, _)| *cycle))
    }

    /// One-row frame: for each fraction of the maximum capacity from
    /// `thresh_max_cap` down to (excluding) `thresh_min_cap`, the first cycle
    /// below it.
    pub fn cycles_to_reach_set_capacities(
        &self,
        thresh_max_cap: f64,
        thresh_min_cap: f64,
        interval_cap: f64,
    ) -> Result<DataFrame> {
        let fade = self.capacity_fade()?;
        let max_cap = fade
            .iter()
            .map(|(_, cap)| *cap)
            .fold(f64::NEG_INFINITY, f64::max);

        let mut columns: Vec<Column> = Vec::new();
        let mut step = 0;
        loop {
            let fraction = thresh_max_cap - step as f64 * interval_cap;
            if interval_cap <= 0.0 || fraction <= thresh_min_cap + 1e-9 {
                break;
            }
            let label = (fraction * 1e6).round() / 1e6;
            let cycle = fade
                .iter()
                .find(|(_, cap)| *cap < fraction * max_cap)
                .map(|(cycle, _)| *cycle);
            columns.push(Series::new(format!("capacity_{label}").into(), [cycle]).into());
            step += 1;
        }
        Ok(DataFrame::new(columns)?)
    }

    /// One-row frame of discharge capacity at cycles `cycle_min`,
    /// `cycle_min + cycle_interval`, … below `cycle_max`.
    pub fn capacities_at_set_cycles(
        &self,
        cycle_min: i32,
        cycle_max: i32,
        cycle_interval: usize,
    ) -> Result<DataFrame> {
        let fade = self.capacity_fade()?;
        let columns: Vec<Column> = (cycle_min..cycle_max)
            .step_by(cycle_interval.max(1))
            .map(|target| {
                let capacity = fade
                    .iter()
                    .find(|(cycle, _)| *cycle == target)
                    .map(|(_, cap)| *cap);
                Series::new(format!("capacity_at_{target}").into(), [capacity]).into()
            })
            .collect();
        Ok(DataFrame::new(columns)?)
    }
}
