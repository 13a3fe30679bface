use polars::prelude::*;

use crate::errors::ParserError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawDtype {
    Int32,
    Int64,
    Float64,
    String,
}

impl RawDtype {
    pub fn to_polars(self) -> DataType {
        match self {
            RawDtype::Int32 => DataType::Int32,
            RawDtype::Int64 => DataType::Int64,
            RawDtype::Float64 => DataType::Float64,
            RawDtype::String => DataType::String,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RawColumn {
    pub name: &'static str,
    pub dtype: RawDtype,
    pub required: bool,
}

const fn required(name: &'static str, dtype: RawDtype) -> RawColumn {
    RawColumn {
        name,
        dtype,
        required: true,
    }
}

const fn optional(name: &'static str, dtype: RawDtype) -> RawColumn {
    RawColumn {
        name,
        dtype,
        required: false,
    }
}

/// Canonical per-datapoint layout every format adapter produces, in order.
pub const RAW_COLUMNS: [RawColumn; 13] = [
    required("data_point", RawDtype::Int64),
    required("cycle_index", RawDtype::Int32),
    required("step_index", RawDtype::Int32),
    required("test_time", RawDtype::Float64),
    required("voltage", RawDtype::Float64),
    required("current", RawDtype::Float64),
    required("charge_capacity", RawDtype::Float64),
    required("discharge_capacity", RawDtype::Float64),
    required("charge_energy", RawDtype::Float64),
    required("discharge_energy", RawDtype::Float64),
    optional("temperature", RawDtype::Float64),
    optional("internal_resistance", RawDtype::Float64),
    optional("date_time_iso", RawDtype::String),
];

pub fn required_raw_columns() -> impl Iterator<Item = &'static str> {
    RAW_COLUMNS
        .iter()
        .filter(|column| column.required)
        .map(|column| column.name)
}

/// Orders, casts, and checks a raw table: canonical columns only, no null
/// identifiers, `data_point` strictly increasing, `cycle_index` non-decreasing.
pub(crate) fn validate_raw_frame(
    parser: &'static str,
    df: DataFrame,
) -> Result<DataFrame, ParserError> {
    if df.height() == 0 {
        return Err(ParserError::EmptyData { parser });
    }

    let mut columns: Vec<Column> = Vec::with_capacity(RAW_COLUMNS.len());
    for spec in RAW_COLUMNS.iter() {
        let column = match df.column(spec.name) {
            Ok(column) => column,
            Err(_) if !spec.required => continue,
            Err(_) => {
                return Err(ParserError::Validation {
                    parser,
                    message: format!("missing required column '{}'", spec.name),
                })
            }
        };
        let target = spec.dtype.to_polars();
        let cast = if column.dtype() == &target {
            column.clone()
        } else {
            column
                .strict_cast(&target)
                .map_err(|err| ParserError::Validation {
                    parser,
                    message: format!("column '{}' cannot be cast to {target}: {err}", spec.name),
                })?
        };
        columns.push(cast);
    }

    let df = DataFrame::new(columns).map_err(ParserError::polars(parser))?;

    for name in ["data_point", "cycle_index", "step_index"] {
        let nulls = df.column(name).map_err(ParserError::polars(parser))?.null_count();
        if nulls > 0 {
            return Err(ParserError::Validation {
                parser,
                message: format!("column '{name}' contains {nulls} null values"),
            });
        }
    }

    let data_point = df
        .column("data_point")
        .and_then(|c| c.i64())
        .map_err(ParserError::polars(parser))?;
    let mut previous: Option<i64> = None;
    for (idx, value) in data_point.into_iter().enumerate() {
        let Some(value) = value else { continue };
        if let Some(prev) = previous {
            if value <= prev {
                return Err(ParserError::Validation {
                    parser,
                    message: format!(
                        "data_point must be strictly increasing (row {idx}: {value} after {prev})"
                    ),
                });
            }
        }
        previous = Some(value);
    }

    let cycle_index = df
        .column("cycle_index")
        .and_then(|c| c.i32())
        .map_err(ParserError::polars(parser))?;
    let mut previous: Option<i32> = None;
    for (idx, value) in cycle_index.into_iter().enumerate() {
        let Some(value) = value else { continue };
        if let Some(prev) = previous {
            if value < prev {
                return Err(ParserError::Validation {
                    parser,
                    message: format!(
                        "cycle_index must be non-decreasing (row {idx}: {value} after {prev})"
                    ),
                });
            }
        }
        previous = Some(value);
    }

    Ok(df)
}
