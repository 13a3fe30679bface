use std::collections::BTreeSet;
use std::io::Cursor;

use polars::prelude::*;

use crate::errors::ParserError;
use crate::model::{FormatKind, RawCyclerRun};
use crate::registry::CyclerParser;

use super::common::{
    base_metadata, epoch_seconds_to_iso, finish_run, CycleAccumulator, ParseOptions, RawColumns,
    SourceFile,
};

const PARQUET_MAGIC: &[u8] = b"PAR1";
const SECONDS_PER_HOUR: f64 = 3600.0;

/// Reads the `time_series_data` table of an Indigo run exported to Parquet.
pub struct IndigoParser;

impl IndigoParser {
    const NAME: &'static str = "INDIGO";

    pub fn is_parquet(bytes: &[u8]) -> bool {
        bytes.starts_with(PARQUET_MAGIC)
    }

    fn float_values(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>, ParserError> {
        let column = df
            .column(name)
            .map_err(|_| ParserError::InvalidHeader {
                parser: Self::NAME,
                row_index: 0,
                message: format!("missing column '{name}'"),
            })?
            .cast(&DataType::Float64)
            .map_err(ParserError::polars(Self::NAME))?;
        let values = column.f64().map_err(ParserError::polars(Self::NAME))?;
        Ok(values.into_iter().collect())
    }

    fn optional_float_values(
        df: &DataFrame,
        name: &str,
    ) -> Result<Option<Vec<Option<f64>>>, ParserError> {
        if df.column(name).is_err() {
            return Ok(None);
        }
        Self::float_values(df, name).map(Some)
    }

    fn cell_id(df: &DataFrame) -> Result<String, ParserError> {
        let column = df
            .column("cell_id")
            .map_err(|_| ParserError::InvalidHeader {
                parser: Self::NAME,
                row_index: 0,
                message: "missing column 'cell_id'".to_string(),
            })?
            .cast(&DataType::String)
            .map_err(ParserError::polars(Self::NAME))?;
        let ids: BTreeSet<String> = column
            .str()
            .map_err(ParserError::polars(Self::NAME))?
            .into_iter()
            .flatten()
            .map(str::to_string)
            .collect();
        let mut ids = ids.into_iter();
        match (ids.next(), ids.next()) {
            (Some(id), None) => Ok(id),
            (None, _) => Err(ParserError::EmptyData { parser: Self::NAME }),
            (Some(first), Some(second)) => Err(ParserError::Validation {
                parser: Self::NAME,
                message: format!("multiple cell ids in one file ({first}, {second}, ...)"),
            }),
        }
    }
}

impl CyclerParser for IndigoParser {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn kind(&self) -> FormatKind {
        FormatKind::Indigo
    }

    fn parse(&self, source: &SourceFile, _options: &ParseOptions) -> Result<RawCyclerRun, ParserError> {
        if matches!(source.extension().as_deref(), Some("h5") | Some("hdf5")) {
            return Err(ParserError::FormatMismatch {
                parser: Self::NAME,
                reason: "HDF5 containers are not read directly; export time_series_data to parquet"
                    .to_string(),
            });
        }
        if !Self::is_parquet(&source.bytes) {
            return Err(ParserError::FormatMismatch {
                parser: Self::NAME,
                reason: "not a parquet file".to_string(),
            });
        }

        let df = ParquetReader::new(Cursor::new(source.bytes.clone()))
            .finish()
            .map_err(ParserError::polars(Self::NAME))?;
        if df.column("cell_coulomb_count_c").is_err() {
            return Err(ParserError::FormatMismatch {
                parser: Self::NAME,
                reason: "parquet file lacks cell_coulomb_count_c".to_string(),
            });
        }

        let cell_id = Self::cell_id(&df)?;
        let cycle_count = Self::float_values(&df, "cycle_count")?;
        let half_cycle = Self::float_values(&df, "half_cycle_count")?;
        let time_s = Self::float_values(&df, "time_s")?;
        let voltage = Self::float_values(&df, "cell_voltage_v")?;
        let current = Self::float_values(&df, "cell_current_a")?;
        let coulombs = Self::float_values(&df, "cell_coulomb_count_c")?;
        let joules = Self::float_values(&df, "cell_energy_j")?;
        let temperature = Self::optional_float_values(&df, "cell_temperature_c")?;
        let system_time_us = Self::optional_float_values(&df, "system_time_us")?;

        let mut columns = RawColumns::new(df.height());
        let mut capacity = CycleAccumulator::default();
        let mut energy = CycleAccumulator::default();

        for idx in 0..df.height() {
            let missing = |name: &str| ParserError::DataRow {
                parser: Self::NAME,
                line_index: idx,
                message: format!("column '{name}' is null"),
            };
            let cycle = cycle_count[idx].ok_or_else(|| missing("cycle_count"))? as i32;
            let step = half_cycle[idx].ok_or_else(|| missing("half_cycle_count"))? as i32;

            let coulomb = coulombs[idx].unwrap_or(f64::NAN) / SECONDS_PER_HOUR;
            let joule = joules[idx].unwrap_or(f64::NAN) / SECONDS_PER_HOUR;
            let (charge_capacity, discharge_capacity) = capacity.push_signed_counter(cycle, coulomb);
            let (charge_energy, discharge_energy) = energy.push_signed_counter(cycle, joule);

            columns.data_point.push(idx as i64);
            columns.cycle_index.push(cycle);
            columns.step_index.push(step);
            columns
                .test_time
                .push(time_s[idx].ok_or_else(|| missing("time_s"))?);
            columns
                .voltage
                .push(voltage[idx].ok_or_else(|| missing("cell_voltage_v"))?);
            columns
                .current
                .push(current[idx].ok_or_else(|| missing("cell_current_a"))?);
            columns.charge_capacity.push(charge_capacity);
            columns.discharge_capacity.push(discharge_capacity);
            columns.charge_energy.push(charge_energy);
            columns.discharge_energy.push(discharge_energy);

            if let Some(values) = &temperature {
                columns.temperature_mut().push(values[idx]);
            }
            if let Some(values) = &system_time_us {
                let iso = values[idx].and_then(|us| epoch_seconds_to_iso(us / 1e6));
                columns.date_time_mut().push(iso);
            }
        }

        let mut metadata = base_metadata(source);
        metadata.insert("indigo_cell_id", cell_id);
        let start = system_time_us
            .as_ref()
            .and_then(|values| values.iter().flatten().next().copied())
            .and_then(|us| epoch_seconds_to_iso(us / 1e6));
        metadata.insert_opt("start_datetime", start);

        Ok(finish_run(Self::NAME, columns, metadata)?.with_format(FormatKind::Indigo))
    }
}
