pub mod errors;
pub mod formats;
pub mod model;
mod registry;

pub use errors::{ParserAttempt, ParserError};
pub use formats::schema::{required_raw_columns, RawColumn, RawDtype, RAW_COLUMNS};
pub use formats::{ParseOptions, RawColumns, SourceFile};
pub use model::{EISpectrum, FormatKind, RawCyclerRun, RunMetadata};
pub use registry::{
    parse_cycler_file, parse_cycler_file_with_options, parse_source, parse_with_parsers,
    CyclerParser,
};

#[cfg(test)]
mod tests;
