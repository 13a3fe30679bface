use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::ProcessingContext;
use crate::error::Result;
use crate::processed::ProcessedCyclerRun;
use crate::schema::STRUCTURE_DTYPES;
use crate::serialization::write_json;

pub const STRUCTURING_ACTION: &str = "structuring";

/// Files to structure. `validity` entries other than `"valid"` are skipped;
/// a missing entry counts as valid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileListRequest {
    #[serde(default)]
    pub file_list: Vec<String>,
    #[serde(default)]
    pub run_list: Vec<i64>,
    #[serde(default)]
    pub validity: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileListResponse {
    pub file_list: Vec<String>,
    pub run_list: Vec<i64>,
    pub invalid_file_list: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub filename: String,
    pub size: u64,
    pub run_id: Option<i64>,
    pub action: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    #[serde(flatten)]
    pub response: FileListResponse,
    pub statuses: Vec<StatusRecord>,
}

impl FileListRequest {
    /// `input` is either a JSON document or the path of a file holding one.
    pub fn from_input(input: &str) -> Result<Self> {
        let path = Path::new(input.trim());
        if path.is_file() {
            let text = fs::read_to_string(path)?;
            return Ok(serde_json::from_str(&text)?);
        }
        Ok(serde_json::from_str(input)?)
    }

    fn is_valid(&self, idx: usize) -> bool {
        self.validity
            .get(idx)
            .map(|v| v.trim().eq_ignore_ascii_case("valid"))
            .unwrap_or(true)
    }
}

pub fn structure_output_path(ctx: &ProcessingContext, input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "run".to_string());
    ctx.output_dir().join(format!("{stem}_structure.json"))
}

/// Structures one file and writes its JSON document, returning the output path.
pub fn structure_file(path: &Path, ctx: &ProcessingContext) -> Result<PathBuf> {
    let lookup = ctx.parameter_lookup();
    let run = ProcessedCyclerRun::auto_load(path, &lookup, &ctx.config, &STRUCTURE_DTYPES)?;
    fs::create_dir_all(ctx.output_dir())?;
    let output = structure_output_path(ctx, path);
    write_json(&run, &output, &STRUCTURE_DTYPES)?;
    Ok(output)
}

fn append_statuses(ctx: &ProcessingContext, statuses: &[StatusRecord]) -> Result<()> {
    let path = ctx.results_path();
    let mut records: Vec<StatusRecord> = match fs::read_to_string(&path) {
        Ok(text) if !text.trim().is_empty() => serde_json::from_str(&text)?,
        _ => Vec::new(),
    };
    records.extend_from_slice(statuses);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, serde_json::to_string_pretty(&records)?)?;
    Ok(())
}

/// Structures every valid entry. A file that fails is reported in
/// `invalid_file_list` and does not stop the batch.
pub fn process_file_list(request: &FileListRequest, ctx: &ProcessingContext) -> Result<BatchOutcome> {
    let mut response = FileListResponse::default();
    let mut statuses = Vec::with_capacity(request.file_list.len());

    for (idx, filename) in request.file_list.iter().enumerate() {
        let path = Path::new(filename);
        let run_id = request.run_list.get(idx).copied();
        let size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);

        let status = if !request.is_valid(idx) {
            info!(file = %filename, "skipping invalid file");
            response.invalid_file_list.push(filename.clone());
            "invalid"
        } else {
            match structure_file(path, ctx) {
                Ok(output) => {
                    info!(file = %filename, output = %output.display(), "structured");
                    response.file_list.push(output.to_string_lossy().into_owned());
                    if let Some(run_id) = run_id {
                        response.run_list.push(run_id);
                    }
                    "success"
                }
                Err(err) => {
                    warn!(file = %filename, error = %err, "structuring failed");
                    response.invalid_file_list.push(filename.clone());
                    "failed"
                }
            }
        };

        statuses.push(StatusRecord {
            filename: filename.clone(),
            size,
            run_id,
            action: STRUCTURING_ACTION.to_string(),
            status: status.to_string(),
        });
    }

    append_statuses(ctx, &statuses)?;
    Ok(BatchOutcome { response, statuses })
}

pub fn process_file_list_from_json(input: &str, ctx: &ProcessingContext) -> Result<BatchOutcome> {
    let request = FileListRequest::from_input(input)?;
    process_file_list(&request, ctx)
}
