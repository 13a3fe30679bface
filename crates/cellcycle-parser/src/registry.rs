use std::path::Path;

use tracing::debug;

use crate::errors::{ParserAttempt, ParserError};
use crate::formats::{
    ArbinParser, BiologicParser, IndigoParser, MaccorParser, NewareParser, ParseOptions,
    SourceFile,
};
use crate::model::{FormatKind, RawCyclerRun};

pub trait CyclerParser {
    fn name(&self) -> &'static str;
    fn kind(&self) -> FormatKind;
    fn parse(&self, source: &SourceFile, options: &ParseOptions)
        -> Result<RawCyclerRun, ParserError>;
}

static ARBIN: ArbinParser = ArbinParser;
static MACCOR: MaccorParser = MaccorParser;
static INDIGO: IndigoParser = IndigoParser;
static BIOLOGIC: BiologicParser = BiologicParser;
static NEWARE: NewareParser = NewareParser;

impl FormatKind {
    pub fn parser(&self) -> &'static dyn CyclerParser {
        match self {
            FormatKind::Arbin => &ARBIN,
            FormatKind::Maccor => &MACCOR,
            FormatKind::Indigo => &INDIGO,
            FormatKind::Biologic => &BIOLOGIC,
            FormatKind::Neware => &NEWARE,
        }
    }

    /// Picks a format from the file extension and its first line.
    pub fn detect(path: &Path, head: &[u8]) -> Option<FormatKind> {
        let ext = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        let first_line = String::from_utf8_lossy(head);
        let first_line = first_line.lines().next().unwrap_or_default();

        if IndigoParser::is_parquet(head) || matches!(ext.as_str(), "h5" | "hdf5") {
            return Some(FormatKind::Indigo);
        }
        if ext == "mpt" || BiologicParser::has_signature(first_line) {
            return Some(FormatKind::Biologic);
        }
        if first_line.trim_start().starts_with("Today's Date")
            || MaccorParser::channel_from_extension(&ext).is_some()
        {
            return Some(FormatKind::Maccor);
        }
        if NewareParser::has_signature(first_line) {
            return Some(FormatKind::Neware);
        }
        if first_line.contains("Data_Point") && first_line.contains("Cycle_Index") {
            return Some(FormatKind::Arbin);
        }
        None
    }
}

pub fn parse_cycler_file(path: impl AsRef<Path>) -> Result<RawCyclerRun, ParserError> {
    parse_cycler_file_with_options(path, &ParseOptions::default())
}

pub fn parse_cycler_file_with_options(
    path: impl AsRef<Path>,
    options: &ParseOptions,
) -> Result<RawCyclerRun, ParserError> {
    let source = SourceFile::read(path)?;
    parse_source(&source, options)
}

/// Tries the detected format first and then every other adapter. Only
/// `FormatMismatch` moves on to the next candidate; any other error belongs
/// to a parser that claimed the file.
pub fn parse_source(source: &SourceFile, options: &ParseOptions) -> Result<RawCyclerRun, ParserError> {
    let detected = FormatKind::detect(&source.path, &source.bytes);
    let mut order: Vec<FormatKind> = detected.into_iter().collect();
    order.extend(FormatKind::ALL.iter().copied().filter(|kind| Some(*kind) != detected));
    let parsers: Vec<&dyn CyclerParser> = order.iter().map(|kind| kind.parser()).collect();

    parse_with_parsers(source, options, &parsers)
}

pub fn parse_with_parsers(
    source: &SourceFile,
    options: &ParseOptions,
    parsers: &[&dyn CyclerParser],
) -> Result<RawCyclerRun, ParserError> {
    let mut attempts = Vec::new();

    for parser in parsers {
        match parser.parse(source, options) {
            Ok(parsed) => {
                debug!(parser = parser.name(), rows = parsed.height(), "parsed cycler file");
                return Ok(parsed);
            }
            Err(ParserError::FormatMismatch { reason, .. }) => {
                attempts.push(ParserAttempt::new(parser.name(), reason));
            }
            Err(err) => return Err(err),
        }
    }

    Err(ParserError::UnrecognizedFormat {
        path: source.path.clone(),
        attempts,
    })
}

impl RawCyclerRun {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ParserError> {
        parse_cycler_file(path)
    }

    pub fn from_file_with_options(
        path: impl AsRef<Path>,
        options: &ParseOptions,
    ) -> Result<Self, ParserError> {
        parse_cycler_file_with_options(path, options)
    }
}
