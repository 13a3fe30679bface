use std::fs;
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, StringRecord};
use serde_json::Value;
use tracing::debug;

use crate::errors::ParserError;
use crate::model::{FormatKind, RawCyclerRun, RunMetadata};
use crate::registry::CyclerParser;

use super::common::{
    base_metadata, field, finish_run, parse_optional_f64, parse_required_f64, parse_required_i64,
    to_iso_datetime, ParseOptions, RawColumns, SourceFile,
};

pub struct ArbinParser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArbinColumn {
    DataPoint,
    TestTime,
    DateTime,
    StepIndex,
    CycleIndex,
    Current,
    Voltage,
    ChargeCapacity,
    DischargeCapacity,
    ChargeEnergy,
    DischargeEnergy,
    InternalResistance,
    Temperature,
    Ignored,
}

impl ArbinParser {
    const NAME: &'static str = "ARBIN";

    fn classify_column(column: &str) -> ArbinColumn {
        let lower = column.trim().to_ascii_lowercase();
        match lower.as_str() {
            "data_point" => ArbinColumn::DataPoint,
            "test_time(s)" | "test_time" => ArbinColumn::TestTime,
            "date_time" | "datetime" => ArbinColumn::DateTime,
            "step_index" => ArbinColumn::StepIndex,
            "cycle_index" => ArbinColumn::CycleIndex,
            "current(a)" | "current" => ArbinColumn::Current,
            "voltage(v)" | "voltage" => ArbinColumn::Voltage,
            "charge_capacity(ah)" | "charge_capacity" => ArbinColumn::ChargeCapacity,
            "discharge_capacity(ah)" | "discharge_capacity" => ArbinColumn::DischargeCapacity,
            "charge_energy(wh)" | "charge_energy" => ArbinColumn::ChargeEnergy,
            "discharge_energy(wh)" | "discharge_energy" => ArbinColumn::DischargeEnergy,
            "internal_resistance(ohm)" | "internal_resistance" => ArbinColumn::InternalResistance,
            s if s.starts_with("temperature (c)") || s.starts_with("aux_temperature") => {
                ArbinColumn::Temperature
            }
            _ => ArbinColumn::Ignored,
        }
    }

    fn locate(roles: &[ArbinColumn], wanted: ArbinColumn) -> Option<usize> {
        roles.iter().position(|role| *role == wanted)
    }

    fn required(roles: &[ArbinColumn], wanted: ArbinColumn) -> Result<usize, ParserError> {
        Self::locate(roles, wanted).ok_or_else(|| ParserError::InvalidHeader {
            parser: Self::NAME,
            row_index: 0,
            message: format!("missing column for {wanted:?}"),
        })
    }

    /// `<stem>_Metadata.csv` next to the data file.
    pub fn metadata_path(path: &Path) -> Option<PathBuf> {
        let stem = path.file_stem()?.to_string_lossy().into_owned();
        Some(path.with_file_name(format!("{stem}_Metadata.csv")))
    }

    fn read_metadata(path: &Path, metadata: &mut RunMetadata) -> Result<(), ParserError> {
        let Some(meta_path) = Self::metadata_path(path) else {
            return Ok(());
        };
        let Ok(content) = fs::read_to_string(&meta_path) else {
            debug!(path = %meta_path.display(), "no arbin metadata file");
            return Ok(());
        };

        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(content.as_bytes());
        let headers = reader.headers().map_err(ParserError::csv(Self::NAME))?.clone();
        let Some(row) = reader.records().next() else {
            return Ok(());
        };
        let row = row.map_err(ParserError::csv(Self::NAME))?;

        for (key, value) in headers.iter().zip(row.iter()) {
            let key = key.trim();
            let value = value.trim();
            let renamed = match key {
                "iv_ch_id" => "channel_id",
                "first_start_datetime" => "start_datetime",
                "schedule_file_name" => "protocol",
                "item_id" => "barcode",
                "test_id" | "device_id" => key,
                _ => continue,
            };
            let json = if value.is_empty() {
                Value::Null
            } else if renamed == "start_datetime" {
                to_iso_datetime(value)
                    .map(Value::String)
                    .unwrap_or_else(|| Value::String(value.to_string()))
            } else if let Ok(int) = value.parse::<i64>() {
                Value::from(int)
            } else {
                Value::String(value.to_string())
            };
            metadata.insert(renamed, json);
        }
        Ok(())
    }

    fn parse_rows(
        roles: &[ArbinColumn],
        records: impl Iterator<Item = Result<StringRecord, csv::Error>>,
    ) -> Result<RawColumns, ParserError> {
        use ArbinColumn::*;

        let data_point = Self::required(roles, DataPoint)?;
        let test_time = Self::required(roles, TestTime)?;
        let step_index = Self::required(roles, StepIndex)?;
        let cycle_index = Self::required(roles, CycleIndex)?;
        let current = Self::required(roles, Current)?;
        let voltage = Self::required(roles, Voltage)?;
        let charge_capacity = Self::required(roles, ChargeCapacity)?;
        let discharge_capacity = Self::required(roles, DischargeCapacity)?;
        let charge_energy = Self::locate(roles, ChargeEnergy);
        let discharge_energy = Self::locate(roles, DischargeEnergy);
        let internal_resistance = Self::locate(roles, InternalResistance);
        let temperature = Self::locate(roles, Temperature);
        let date_time = Self::locate(roles, DateTime);

        let mut columns = RawColumns::new(1024);
        for (offset, record) in records.enumerate() {
            let line_index = offset + 1;
            let record = record.map_err(ParserError::csv(Self::NAME))?;
            if record.iter().all(|value| value.trim().is_empty()) {
                continue;
            }
            let p = Self::NAME;

            columns.data_point.push(parse_required_i64(
                p,
                field(&record, data_point),
                line_index,
                "Data_Point",
            )?);
            columns.cycle_index.push(parse_required_i64(
                p,
                field(&record, cycle_index),
                line_index,
                "Cycle_Index",
            )? as i32);
            columns.step_index.push(parse_required_i64(
                p,
                field(&record, step_index),
                line_index,
                "Step_Index",
            )? as i32);
            columns.test_time.push(parse_required_f64(
                p,
                field(&record, test_time),
                line_index,
                "Test_Time(s)",
            )?);
            columns.current.push(parse_required_f64(
                p,
                field(&record, current),
                line_index,
                "Current(A)",
            )?);
            columns.voltage.push(parse_required_f64(
                p,
                field(&record, voltage),
                line_index,
                "Voltage(V)",
            )?);
            columns.charge_capacity.push(parse_required_f64(
                p,
                field(&record, charge_capacity),
                line_index,
                "Charge_Capacity(Ah)",
            )?);
            columns.discharge_capacity.push(parse_required_f64(
                p,
                field(&record, discharge_capacity),
                line_index,
                "Discharge_Capacity(Ah)",
            )?);

            let charge_energy_value = match charge_energy {
                Some(idx) => {
                    parse_optional_f64(p, field(&record, idx), line_index, "Charge_Energy(Wh)")?
                }
                None => None,
            };
            columns.charge_energy.push(charge_energy_value.unwrap_or(0.0));
            let discharge_energy_value = match discharge_energy {
                Some(idx) => parse_optional_f64(
                    p,
                    field(&record, idx),
                    line_index,
                    "Discharge_Energy(Wh)",
                )?,
                None => None,
            };
            columns
                .discharge_energy
                .push(discharge_energy_value.unwrap_or(0.0));

            if let Some(idx) = internal_resistance {
                let value =
                    parse_optional_f64(p, field(&record, idx), line_index, "Internal_Resistance")?;
                columns.internal_resistance_mut().push(value);
            }
            if let Some(idx) = temperature {
                let value = parse_optional_f64(p, field(&record, idx), line_index, "Temperature")?;
                columns.temperature_mut().push(value);
            }
            if let Some(idx) = date_time {
                columns
                    .date_time_mut()
                    .push(to_iso_datetime(field(&record, idx)));
            }
        }

        Ok(columns)
    }
}

impl CyclerParser for ArbinParser {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn kind(&self) -> FormatKind {
        FormatKind::Arbin
    }

    fn parse(&self, source: &SourceFile, _options: &ParseOptions) -> Result<RawCyclerRun, ParserError> {
        let text = source.text();
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(text.as_bytes());

        let headers = reader
            .headers()
            .map_err(|err| ParserError::FormatMismatch {
                parser: Self::NAME,
                reason: format!("unreadable header: {err}"),
            })?
            .clone();
        let roles: Vec<ArbinColumn> = headers.iter().map(Self::classify_column).collect();
        if Self::locate(&roles, ArbinColumn::DataPoint).is_none()
            || Self::locate(&roles, ArbinColumn::CycleIndex).is_none()
        {
            return Err(ParserError::FormatMismatch {
                parser: Self::NAME,
                reason: "header lacks Data_Point and Cycle_Index".to_string(),
            });
        }

        let columns = Self::parse_rows(&roles, reader.records())?;

        let mut metadata = base_metadata(source);
        Self::read_metadata(&source.path, &mut metadata)?;

        Ok(finish_run(Self::NAME, columns, metadata)?.with_format(FormatKind::Arbin))
    }
}
