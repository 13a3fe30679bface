use cellcycle_parser::ParserError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StructureError {
    #[error("Cycler file could not be parsed: {0}")]
    Parser(#[from] ParserError),

    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Polars operation failed: {0}")]
    Polars(#[from] polars::error::PolarsError),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("ZIP operation failed: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Configuration error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid structuring config: {0}")]
    InvalidConfig(String),

    #[error("Invalid glob pattern: {0}")]
    Glob(#[from] glob::PatternError),

    #[error("Required column '{0}' is missing")]
    MissingColumn(String),

    #[error("No structuring parameters for project '{project}' sequence {seq_num}")]
    MissingParameterLookup { project: String, seq_num: u32 },

    #[error(
        "Cycle {cycle_index} {step_type} has {points} distinct points, {minimum} required for interpolation"
    )]
    InsufficientInterpolationLength {
        cycle_index: i32,
        step_type: String,
        points: usize,
        minimum: usize,
    },

    #[error("Table '{table}' does not match schema: {message}")]
    SchemaMismatch { table: String, message: String },

    #[error("Validation failed: {0}")]
    Validation(String),
}

impl StructureError {
    pub(crate) fn schema(table: impl Into<String>, message: impl Into<String>) -> Self {
        StructureError::SchemaMismatch {
            table: table.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StructureError>;
