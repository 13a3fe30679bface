pub mod batch;
pub mod config;
pub mod cycler_table;
pub mod error;
pub mod interpolation;
pub mod parameters_lookup;
pub mod paused;
pub mod processed;
pub mod schema;
pub mod serialization;
pub mod step_classifier;
pub mod structuring;
pub mod summary;

pub use batch::{
    process_file_list, process_file_list_from_json, BatchOutcome, FileListRequest,
    FileListResponse, StatusRecord,
};
pub use config::{ProcessingContext, StructuringConfig, PROCESSING_DIR_ENV};
pub use cycler_table::{CyclerTable, Measure};
pub use error::{Result, StructureError};
pub use interpolation::{Axis, InterpolationFallback, InterpolationPolicy};
pub use parameters_lookup::{
    CsvParameterLookup, DiagnosticTemplate, NoParameterLookup, ParameterLookup,
    ProtocolParameters, StaticParameterLookup,
};
pub use processed::{
    ProcessedCyclerRun, ProcessedMetadata, ProcessedTables, ToProcessedCyclerRun,
};
pub use schema::{ColumnSpec, ColumnType, StructureSchema, TableSchema, STRUCTURE_DTYPES};
pub use serialization::{
    from_binary, from_json_str, read_binary, read_json, to_binary, to_json_string, write_binary,
    write_json, StructuredRun,
};
pub use step_classifier::{classify_step, ClassifierSettings, StepGroup, StepType};
pub use structuring::{
    determine_structuring_parameters, DiagnosticAvailable, StructuringParameters,
};

pub use cellcycle_parser::{FormatKind, RawCyclerRun, RunMetadata};
