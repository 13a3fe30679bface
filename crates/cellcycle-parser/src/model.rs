use std::collections::BTreeMap;
use std::fmt;

use polars::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ParserError;
use crate::formats::schema::validate_raw_frame;

/// Run-level metadata reported by the instrument. Key sets differ per vendor,
/// so values are kept as loosely typed JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunMetadata(BTreeMap<String, Value>);

impl RunMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn insert_opt(&mut self, key: impl Into<String>, value: Option<impl Into<Value>>) {
        let value = value.map(Into::into).unwrap_or(Value::Null);
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn barcode(&self) -> Option<&str> {
        self.get_str("barcode")
    }

    pub fn protocol(&self) -> Option<&str> {
        self.get_str("protocol")
    }

    pub fn filename(&self) -> Option<&str> {
        self.get_str("filename")
    }

    /// Channel ids arrive either as integers or as numeric strings.
    pub fn channel_id(&self) -> Option<i64> {
        match self.0.get("channel_id")? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl FromIterator<(String, Value)> for RunMetadata {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatKind {
    Arbin,
    Maccor,
    Indigo,
    Biologic,
    Neware,
}

impl FormatKind {
    pub const ALL: [FormatKind; 5] = [
        FormatKind::Arbin,
        FormatKind::Maccor,
        FormatKind::Indigo,
        FormatKind::Biologic,
        FormatKind::Neware,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FormatKind::Arbin => "arbin",
            FormatKind::Maccor => "maccor",
            FormatKind::Indigo => "indigo",
            FormatKind::Biologic => "biologic",
            FormatKind::Neware => "neware",
        }
    }
}

impl fmt::Display for FormatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for FormatKind {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.trim().to_ascii_lowercase().as_str() {
            "arbin" => Ok(FormatKind::Arbin),
            "maccor" => Ok(FormatKind::Maccor),
            "indigo" => Ok(FormatKind::Indigo),
            "biologic" => Ok(FormatKind::Biologic),
            "neware" => Ok(FormatKind::Neware),
            other => Err(format!("unknown cycler format '{other}'")),
        }
    }
}

/// Electrochemical impedance spectrum: `frequency`, `z_real`, `z_imag`.
#[derive(Debug, Clone)]
pub struct EISpectrum {
    data: DataFrame,
    metadata: RunMetadata,
}

impl EISpectrum {
    pub fn new(data: DataFrame, metadata: RunMetadata) -> Self {
        Self { data, metadata }
    }

    pub fn data(&self) -> &DataFrame {
        &self.data
    }

    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    pub fn len(&self) -> usize {
        self.data.height()
    }

    pub fn is_empty(&self) -> bool {
        self.data.height() == 0
    }
}

/// One cycler run as read from disk: a per-datapoint table in canonical
/// columns plus vendor metadata. Never mutated once built.
#[derive(Debug, Clone)]
pub struct RawCyclerRun {
    data: DataFrame,
    metadata: RunMetadata,
    format: Option<FormatKind>,
    eis: Option<EISpectrum>,
}

impl RawCyclerRun {
    /// Validates the table against the canonical raw layout.
    pub fn new(data: DataFrame, metadata: RunMetadata) -> Result<Self, ParserError> {
        let data = validate_raw_frame("raw", data)?;
        Ok(Self {
            data,
            metadata,
            format: None,
            eis: None,
        })
    }

    pub fn with_format(mut self, format: FormatKind) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_eis(mut self, eis: Option<EISpectrum>) -> Self {
        self.eis = eis;
        self
    }

    pub fn data(&self) -> &DataFrame {
        &self.data
    }

    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    pub fn format(&self) -> Option<FormatKind> {
        self.format
    }

    pub fn eis(&self) -> Option<&EISpectrum> {
        self.eis.as_ref()
    }

    pub fn height(&self) -> usize {
        self.data.height()
    }

    pub fn into_parts(self) -> (DataFrame, RunMetadata) {
        (self.data, self.metadata)
    }
}
