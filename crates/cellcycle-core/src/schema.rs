use std::fmt;

use cellcycle_parser::{RawDtype, RAW_COLUMNS};
use once_cell::sync::Lazy;
use polars::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StructureError};

pub const RAW_DATA: &str = "raw_data";
pub const SUMMARY: &str = "summary";
pub const DIAGNOSTIC_SUMMARY: &str = "diagnostic_summary";
pub const CYCLES_INTERPOLATED: &str = "cycles_interpolated";
pub const DIAGNOSTIC_INTERPOLATED: &str = "diagnostic_interpolated";

/// Table contract shared by every producer and both serializers.
pub static STRUCTURE_DTYPES: Lazy<StructureSchema> = Lazy::new(StructureSchema::v1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Int32,
    Int64,
    Float32,
    Float64,
    String,
}

/// Binary archives store each group in its own parquet file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtypeGroup {
    Float,
    Int,
    String,
}

impl DtypeGroup {
    pub const ALL: [DtypeGroup; 3] = [DtypeGroup::Float, DtypeGroup::Int, DtypeGroup::String];

    pub fn as_str(&self) -> &'static str {
        match self {
            DtypeGroup::Float => "float",
            DtypeGroup::Int => "int",
            DtypeGroup::String => "string",
        }
    }
}

impl ColumnType {
    pub fn to_polars(self) -> DataType {
        match self {
            ColumnType::Int32 => DataType::Int32,
            ColumnType::Int64 => DataType::Int64,
            ColumnType::Float32 => DataType::Float32,
            ColumnType::Float64 => DataType::Float64,
            ColumnType::String => DataType::String,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Int32 => "int32",
            ColumnType::Int64 => "int64",
            ColumnType::Float32 => "float32",
            ColumnType::Float64 => "float64",
            ColumnType::String => "string",
        }
    }

    pub fn group(&self) -> DtypeGroup {
        match self {
            ColumnType::Int32 | ColumnType::Int64 => DtypeGroup::Int,
            ColumnType::Float32 | ColumnType::Float64 => DtypeGroup::Float,
            ColumnType::String => DtypeGroup::String,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<RawDtype> for ColumnType {
    fn from(dtype: RawDtype) -> Self {
        match dtype {
            RawDtype::Int32 => ColumnType::Int32,
            RawDtype::Int64 => ColumnType::Int64,
            RawDtype::Float64 => ColumnType::Float64,
            RawDtype::String => ColumnType::String,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub dtype: ColumnType,
    /// Optional columns may be absent; present ones must still match `dtype`.
    pub required: bool,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, dtype: ColumnType) -> Self {
        Self {
            name: name.into(),
            dtype,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, dtype: ColumnType) -> Self {
        Self {
            name: name.into(),
            dtype,
            required: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
}

fn columns(specs: &[(&str, ColumnType)]) -> Vec<ColumnSpec> {
    specs
        .iter()
        .map(|(name, dtype)| ColumnSpec::new(*name, *dtype))
        .collect()
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnSpec>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|spec| spec.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|spec| spec.name.as_str())
    }

    /// Zero-row frame with every required column.
    pub fn empty_frame(&self) -> Result<DataFrame> {
        let columns: Vec<Column> = self
            .columns
            .iter()
            .filter(|spec| spec.required)
            .map(|spec| Column::new_empty(spec.name.as_str().into(), &spec.dtype.to_polars()))
            .collect();
        Ok(DataFrame::new(columns)?)
    }

    fn reject_unknown(&self, df: &DataFrame) -> Result<()> {
        if let Some(extra) = df
            .get_column_names()
            .into_iter()
            .find(|name| self.column(name.as_str()).is_none())
        {
            return Err(StructureError::schema(
                &self.name,
                format!("unexpected column '{extra}'"),
            ));
        }
        Ok(())
    }

    /// Orders and casts a producer's frame into the declared layout. Columns
    /// that cannot be cast without loss of values are an error.
    pub fn conform(&self, df: DataFrame) -> Result<DataFrame> {
        self.reject_unknown(&df)?;
        let mut out = Vec::with_capacity(self.columns.len());
        for spec in &self.columns {
            let column = match df.column(&spec.name) {
                Ok(column) => column,
                Err(_) if !spec.required => continue,
                Err(_) => {
                    return Err(StructureError::schema(
                        &self.name,
                        format!("missing column '{}'", spec.name),
                    ))
                }
            };
            let target = spec.dtype.to_polars();
            let cast = if column.dtype() == &target {
                column.clone()
            } else {
                column.strict_cast(&target).map_err(|err| {
                    StructureError::schema(
                        &self.name,
                        format!("column '{}' cannot be cast to {}: {err}", spec.name, spec.dtype),
                    )
                })?
            };
            out.push(cast);
        }
        Ok(DataFrame::new(out)?)
    }

    /// Checks a consumer's frame without coercing anything.
    pub fn validate(&self, df: &DataFrame) -> Result<()> {
        self.reject_unknown(df)?;
        let mut expected_order = Vec::new();
        for spec in &self.columns {
            match df.column(&spec.name) {
                Ok(column) => {
                    let target = spec.dtype.to_polars();
                    if column.dtype() != &target {
                        return Err(StructureError::schema(
                            &self.name,
                            format!(
                                "column '{}' has dtype {}, expected {}",
                                spec.name,
                                column.dtype(),
                                spec.dtype
                            ),
                        ));
                    }
                    expected_order.push(spec.name.as_str());
                }
                Err(_) if spec.required => {
                    return Err(StructureError::schema(
                        &self.name,
                        format!("missing column '{}'", spec.name),
                    ))
                }
                Err(_) => {}
            }
        }
        let actual: Vec<&str> = df.get_column_names().iter().map(|n| n.as_str()).collect();
        if actual != expected_order {
            return Err(StructureError::schema(
                &self.name,
                format!("column order {actual:?} differs from {expected_order:?}"),
            ));
        }
        Ok(())
    }
}

/// Versioned set of table schemas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructureSchema {
    pub version: u32,
    pub tables: Vec<TableSchema>,
}

impl StructureSchema {
    pub fn v1() -> Self {
        use ColumnType::{Float32 as F32, Float64 as F64, Int32 as I32, String as Str};

        let raw_data = TableSchema::new(
            RAW_DATA,
            RAW_COLUMNS
                .iter()
                .map(|column| ColumnSpec {
                    name: column.name.to_string(),
                    dtype: column.dtype.into(),
                    required: column.required,
                })
                .collect(),
        );

        let summary = TableSchema::new(
            SUMMARY,
            columns(&[
                ("cycle_index", I32),
                ("discharge_capacity", F64),
                ("charge_capacity", F64),
                ("discharge_energy", F64),
                ("charge_energy", F64),
                ("dc_internal_resistance", F32),
                ("temperature_maximum", F32),
                ("temperature_average", F32),
                ("temperature_minimum", F32),
                ("date_time_iso", Str),
                ("energy_efficiency", F32),
                ("charge_throughput", F32),
                ("energy_throughput", F32),
                ("charge_duration", F32),
                ("time_temperature_integrated", F64),
                ("paused", I32),
            ]),
        );

        let diagnostic_summary = TableSchema::new(
            DIAGNOSTIC_SUMMARY,
            columns(&[
                ("cycle_index", I32),
                ("discharge_capacity", F64),
                ("charge_capacity", F64),
                ("discharge_energy", F64),
                ("charge_energy", F64),
                ("dc_internal_resistance", F32),
                ("temperature_maximum", F32),
                ("temperature_average", F32),
                ("temperature_minimum", F32),
                ("date_time_iso", Str),
                ("energy_efficiency", F32),
                ("coulombic_efficiency", F32),
                ("charge_duration", F32),
                ("time_temperature_integrated", F64),
                ("paused", I32),
                ("cycle_type", Str),
            ]),
        );

        let measures: [(&str, ColumnType); 11] = [
            ("voltage", F32),
            ("test_time", F64),
            ("current", F32),
            ("charge_capacity", F32),
            ("discharge_capacity", F32),
            ("charge_energy", F32),
            ("discharge_energy", F32),
            ("temperature", F32),
            ("internal_resistance", F32),
            ("charge_dQdV", F32),
            ("discharge_dQdV", F32),
        ];

        let mut cycles_interpolated = columns(&measures);
        cycles_interpolated.extend(columns(&[("cycle_index", I32), ("step_type", Str)]));

        let mut diagnostic_interpolated = columns(&measures);
        diagnostic_interpolated.extend(columns(&[
            ("cycle_index", I32),
            ("step_type", I32),
            ("step_index", I32),
            ("step_index_counter", I32),
            ("cycle_type", Str),
        ]));

        Self {
            version: 1,
            tables: vec![
                raw_data,
                summary,
                diagnostic_summary,
                TableSchema::new(CYCLES_INTERPOLATED, cycles_interpolated),
                TableSchema::new(DIAGNOSTIC_INTERPOLATED, diagnostic_interpolated),
            ],
        }
    }

    pub fn table(&self, name: &str) -> Result<&TableSchema> {
        self.tables
            .iter()
            .find(|table| table.name == name)
            .ok_or_else(|| StructureError::schema(name, "table is not declared"))
    }

    pub fn conform(&self, name: &str, df: DataFrame) -> Result<DataFrame> {
        self.table(name)?.conform(df)
    }

    pub fn validate(&self, name: &str, df: &DataFrame) -> Result<()> {
        self.table(name)?.validate(df)
    }
}

impl Default for StructureSchema {
    fn default() -> Self {
        STRUCTURE_DTYPES.clone()
    }
}
