use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::Path;

use cellcycle_parser::{FormatKind, RawCyclerRun, RunMetadata};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use ::zip::{write::FileOptions, CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{Result, StructureError};
use crate::interpolation::InterpolationFallback;
use crate::processed::{ProcessedCyclerRun, ProcessedMetadata, ProcessedTables};
use crate::schema::{
    ColumnType, DtypeGroup, StructureSchema, TableSchema, CYCLES_INTERPOLATED,
    DIAGNOSTIC_INTERPOLATED, DIAGNOSTIC_SUMMARY, RAW_DATA, SUMMARY,
};
use crate::structuring::StructuringParameters;

const MANIFEST: &str = "manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Raw,
    Processed,
}

/// Scalar part of a stored run, shared by the JSON document and the
/// binary manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunHeader {
    pub kind: DocumentKind,
    pub schema_version: u32,
    pub metadata: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<FormatKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structuring: Option<StructuringParameters>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallbacks: Vec<InterpolationFallback>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDocument {
    pub name: String,
    pub dtype: ColumnType,
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDocument {
    pub columns: Vec<ColumnDocument>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDocument {
    #[serde(flatten)]
    pub header: RunHeader,
    pub tables: BTreeMap<String, TableDocument>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TableManifest {
    rows: usize,
    columns: Vec<String>,
    groups: BTreeMap<DtypeGroup, Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BinaryManifest {
    #[serde(flatten)]
    header: RunHeader,
    tables: BTreeMap<String, TableManifest>,
}

/// A run that can be written as a JSON document or a binary archive.
pub trait StructuredRun: Sized {
    const KIND: DocumentKind;

    fn header(&self, schema: &StructureSchema) -> Result<RunHeader>;

    fn frames(&self) -> Vec<(&'static str, &DataFrame)>;

    fn from_loaded(
        header: RunHeader,
        tables: BTreeMap<String, DataFrame>,
        schema: &StructureSchema,
    ) -> Result<Self>;
}

impl StructuredRun for ProcessedCyclerRun {
    const KIND: DocumentKind = DocumentKind::Processed;

    fn header(&self, schema: &StructureSchema) -> Result<RunHeader> {
        Ok(RunHeader {
            kind: Self::KIND,
            schema_version: schema.version,
            metadata: serde_json::to_value(self.metadata())?,
            format: None,
            structuring: Some(self.structuring().clone()),
            fallbacks: self.fallbacks().to_vec(),
        })
    }

    fn frames(&self) -> Vec<(&'static str, &DataFrame)> {
        self.tables().iter().collect()
    }

    fn from_loaded(
        header: RunHeader,
        mut tables: BTreeMap<String, DataFrame>,
        schema: &StructureSchema,
    ) -> Result<Self> {
        let metadata: ProcessedMetadata = serde_json::from_value(header.metadata)?;
        let structuring = header
            .structuring
            .ok_or_else(|| StructureError::schema("document", "missing structuring parameters"))?;
        let mut take = |name: &str| {
            tables
                .remove(name)
                .ok_or_else(|| StructureError::schema(name, "table is missing"))
        };
        let tables = ProcessedTables {
            summary: take(SUMMARY)?,
            diagnostic_summary: take(DIAGNOSTIC_SUMMARY)?,
            cycles_interpolated: take(CYCLES_INTERPOLATED)?,
            diagnostic_interpolated: take(DIAGNOSTIC_INTERPOLATED)?,
        };
        ProcessedCyclerRun::from_parts(metadata, tables, structuring, header.fallbacks, schema)
    }
}

impl StructuredRun for RawCyclerRun {
    const KIND: DocumentKind = DocumentKind::Raw;

    fn header(&self, schema: &StructureSchema) -> Result<RunHeader> {
        Ok(RunHeader {
            kind: Self::KIND,
            schema_version: schema.version,
            metadata: serde_json::to_value(self.metadata())?,
            format: self.format(),
            structuring: None,
            fallbacks: Vec::new(),
        })
    }

    fn frames(&self) -> Vec<(&'static str, &DataFrame)> {
        vec![(RAW_DATA, self.data())]
    }

    fn from_loaded(
        header: RunHeader,
        mut tables: BTreeMap<String, DataFrame>,
        schema: &StructureSchema,
    ) -> Result<Self> {
        let metadata: RunMetadata = serde_json::from_value(header.metadata)?;
        let data = tables
            .remove(RAW_DATA)
            .ok_or_else(|| StructureError::schema(RAW_DATA, "table is missing"))?;
        schema.validate(RAW_DATA, &data)?;
        let run = RawCyclerRun::new(data, metadata)?;
        Ok(match header.format {
            Some(format) => run.with_format(format),
            None => run,
        })
    }
}

fn check_header<T: StructuredRun>(header: &RunHeader, schema: &StructureSchema) -> Result<()> {
    if header.kind != T::KIND {
        return Err(StructureError::schema(
            "document",
            format!("expected a {:?} run, found {:?}", T::KIND, header.kind),
        ));
    }
    if header.schema_version != schema.version {
        return Err(StructureError::schema(
            "document",
            format!(
                "schema version {} does not match {}",
                header.schema_version, schema.version
            ),
        ));
    }
    Ok(())
}

/// Finite floats are JSON numbers; NaN and infinities are stored as strings.
fn float_value(value: Option<f64>) -> Value {
    match value {
        None => Value::Null,
        Some(v) if v.is_nan() => Value::from("NaN"),
        Some(v) if v.is_infinite() && v > 0.0 => Value::from("Infinity"),
        Some(v) if v.is_infinite() => Value::from("-Infinity"),
        Some(v) => Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null),
    }
}

fn float_from_value(value: &Value) -> Option<f64> {
    match value {
        Value::String(text) => match text.as_str() {
            "NaN" => Some(f64::NAN),
            "Infinity" => Some(f64::INFINITY),
            "-Infinity" => Some(f64::NEG_INFINITY),
            _ => None,
        },
        other => other.as_f64(),
    }
}

fn column_values(column: &Column, dtype: ColumnType) -> Result<Vec<Value>> {
    Ok(match dtype {
        ColumnType::Float32 => column
            .f32()?
            .into_iter()
            .map(|v| float_value(v.map(f64::from)))
            .collect(),
        ColumnType::Float64 => column.f64()?.into_iter().map(float_value).collect(),
        ColumnType::Int32 => column
            .i32()?
            .into_iter()
            .map(|v| v.map(Value::from).unwrap_or(Value::Null))
            .collect(),
        ColumnType::Int64 => column
            .i64()?
            .into_iter()
            .map(|v| v.map(Value::from).unwrap_or(Value::Null))
            .collect(),
        ColumnType::String => column
            .str()?
            .into_iter()
            .map(|v| v.map(Value::from).unwrap_or(Value::Null))
            .collect(),
    })
}

fn parse_values<T>(
    table: &str,
    name: &str,
    values: &[Value],
    convert: impl Fn(&Value) -> Option<T>,
) -> Result<Vec<Option<T>>> {
    values
        .iter()
        .enumerate()
        .map(|(idx, value)| match value {
            Value::Null => Ok(None),
            other => convert(other).map(Some).ok_or_else(|| {
                StructureError::schema(table, format!("column '{name}' row {idx}: unexpected {other}"))
            }),
        })
        .collect()
}

fn column_from_document(table: &TableSchema, doc: &ColumnDocument) -> Result<Column> {
    let spec = table.column(&doc.name).ok_or_else(|| {
        StructureError::schema(&table.name, format!("unexpected column '{}'", doc.name))
    })?;
    if spec.dtype != doc.dtype {
        return Err(StructureError::schema(
            &table.name,
            format!(
                "column '{}' stored as {}, expected {}",
                doc.name, doc.dtype, spec.dtype
            ),
        ));
    }

    let (t, name, values) = (table.name.as_str(), doc.name.as_str(), doc.values.as_slice());
    let series = match doc.dtype {
        ColumnType::Float32 => Series::new(
            name.into(),
            parse_values(t, name, values, |v| float_from_value(v).map(|f| f as f32))?,
        ),
        ColumnType::Float64 => Series::new(name.into(), parse_values(t, name, values, float_from_value)?),
        ColumnType::Int32 => Series::new(
            name.into(),
            parse_values(t, name, values, |v| {
                v.as_i64().and_then(|i| i32::try_from(i).ok())
            })?,
        ),
        ColumnType::Int64 => Series::new(name.into(), parse_values(t, name, values, Value::as_i64)?),
        ColumnType::String => Series::new(
            name.into(),
            parse_values(t, name, values, |v| v.as_str().map(str::to_string))?,
        ),
    };
    Ok(series.into())
}

pub fn to_document<T: StructuredRun>(run: &T, schema: &StructureSchema) -> Result<RunDocument> {
    let mut tables = BTreeMap::new();
    for (name, frame) in run.frames() {
        let table = schema.table(name)?;
        table.validate(frame)?;
        let mut columns = Vec::with_capacity(frame.width());
        for column in frame.get_columns() {
            let spec = table
                .column(column.name().as_str())
                .ok_or_else(|| StructureError::schema(name, "undeclared column"))?;
            columns.push(ColumnDocument {
                name: spec.name.clone(),
                dtype: spec.dtype,
                values: column_values(column, spec.dtype)?,
            });
        }
        tables.insert(name.to_string(), TableDocument { columns });
    }
    Ok(RunDocument {
        header: run.header(schema)?,
        tables,
    })
}

pub fn from_document<T: StructuredRun>(doc: RunDocument, schema: &StructureSchema) -> Result<T> {
    check_header::<T>(&doc.header, schema)?;
    let mut tables = BTreeMap::new();
    for (name, table_doc) in &doc.tables {
        let table = schema.table(name)?;
        let columns = table_doc
            .columns
            .iter()
            .map(|column| column_from_document(table, column))
            .collect::<Result<Vec<_>>>()?;
        let frame = DataFrame::new(columns).map_err(|err| {
            StructureError::schema(name.as_str(), format!("columns do not form a table: {err}"))
        })?;
        table.validate(&frame)?;
        tables.insert(name.clone(), frame);
    }
    T::from_loaded(doc.header, tables, schema)
}

pub fn to_json_string<T: StructuredRun>(run: &T, schema: &StructureSchema) -> Result<String> {
    Ok(serde_json::to_string(&to_document(run, schema)?)?)
}

pub fn from_json_str<T: StructuredRun>(text: &str, schema: &StructureSchema) -> Result<T> {
    let doc: RunDocument = serde_json::from_str(text)?;
    from_document(doc, schema)
}

pub fn write_json<T: StructuredRun>(
    run: &T,
    path: impl AsRef<Path>,
    schema: &StructureSchema,
) -> Result<()> {
    fs::write(path, to_json_string(run, schema)?)?;
    Ok(())
}

pub fn read_json<T: StructuredRun>(path: impl AsRef<Path>, schema: &StructureSchema) -> Result<T> {
    let text = fs::read_to_string(path)?;
    from_json_str(&text, schema)
}

fn parquet_bytes(frame: &DataFrame) -> Result<Vec<u8>> {
    let mut clone = frame.clone();
    let mut buffer = Vec::new();
    ParquetWriter::new(&mut buffer).finish(&mut clone)?;
    Ok(buffer)
}

fn archive_path(table: &str, group: DtypeGroup) -> String {
    format!("{table}.{}.parquet", group.as_str())
}

/// Zip archive: `manifest.json` plus one parquet file per table and dtype group.
pub fn to_binary<T: StructuredRun>(run: &T, schema: &StructureSchema) -> Result<Vec<u8>> {
    let mut files: Vec<(String, Vec<u8>)> = Vec::new();
    let mut tables = BTreeMap::new();
    for (name, frame) in run.frames() {
        let table = schema.table(name)?;
        table.validate(frame)?;
        let mut groups = BTreeMap::new();
        for group in DtypeGroup::ALL {
            let members: Vec<String> = frame
                .get_column_names()
                .iter()
                .map(|column| column.as_str())
                .filter(|column| {
                    table
                        .column(column)
                        .is_some_and(|spec| spec.dtype.group() == group)
                })
                .map(str::to_string)
                .collect();
            if members.is_empty() {
                continue;
            }
            let subset = frame.select(members.iter().map(String::as_str))?;
            files.push((archive_path(name, group), parquet_bytes(&subset)?));
            groups.insert(group, members);
        }
        tables.insert(
            name.to_string(),
            TableManifest {
                rows: frame.height(),
                columns: frame
                    .get_column_names()
                    .iter()
                    .map(|column| column.to_string())
                    .collect(),
                groups,
            },
        );
    }

    let manifest = BinaryManifest {
        header: run.header(schema)?,
        tables,
    };
    let manifest_bytes = serde_json::to_vec(&manifest)?;

    let cursor = Cursor::new(Vec::new());
    let mut zip = ZipWriter::new(cursor);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    zip.start_file(MANIFEST, options)?;
    zip.write_all(&manifest_bytes)?;
    for (path, bytes) in files {
        zip.start_file(path, options)?;
        zip.write_all(&bytes)?;
    }

    let cursor = zip.finish()?;
    Ok(cursor.into_inner())
}

fn read_entry(archive: &mut ZipArchive<Cursor<&[u8]>>, path: &str) -> Result<Vec<u8>> {
    let mut file = archive
        .by_name(path)
        .map_err(|_| StructureError::schema("archive", format!("missing entry '{path}'")))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(bytes)
}

pub fn from_binary<T: StructuredRun>(bytes: &[u8], schema: &StructureSchema) -> Result<T> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    let manifest: BinaryManifest = serde_json::from_slice(&read_entry(&mut archive, MANIFEST)?)?;
    check_header::<T>(&manifest.header, schema)?;

    let mut tables = BTreeMap::new();
    for (name, entry) in &manifest.tables {
        let table = schema.table(name)?;
        let mut by_name: HashMap<String, Column> = HashMap::new();
        for group in entry.groups.keys() {
            let data = read_entry(&mut archive, &archive_path(name, *group))?;
            let frame = ParquetReader::new(Cursor::new(data)).finish()?;
            for column in frame.get_columns() {
                by_name.insert(column.name().to_string(), column.clone());
            }
        }
        let columns = entry
            .columns
            .iter()
            .map(|column| {
                by_name.remove(column).ok_or_else(|| {
                    StructureError::schema(name.as_str(), format!("column '{column}' not stored"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let frame = DataFrame::new(columns)?;
        if frame.height() != entry.rows {
            return Err(StructureError::schema(
                name.as_str(),
                format!("expected {} rows, found {}", entry.rows, frame.height()),
            ));
        }
        table.validate(&frame)?;
        tables.insert(name.clone(), frame);
    }
    T::from_loaded(manifest.header, tables, schema)
}

pub fn write_binary<T: StructuredRun>(
    run: &T,
    path: impl AsRef<Path>,
    schema: &StructureSchema,
) -> Result<()> {
    fs::write(path, to_binary(run, schema)?)?;
    Ok(())
}

pub fn read_binary<T: StructuredRun>(path: impl AsRef<Path>, schema: &StructureSchema) -> Result<T> {
    let bytes = fs::read(path)?;
    from_binary(&bytes, schema)
}
