use std::fs;
use std::path::PathBuf;

use cellcycle_core::batch::structure_output_path;
use cellcycle_core::{
    process_file_list, process_file_list_from_json, read_json, FileListRequest,
    ProcessedCyclerRun, ProcessingContext, StatusRecord, StructuringConfig, STRUCTURE_DTYPES,
};

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../cellcycle-parser/tests/data")
        .join(name)
}

fn maccor_fixture() -> String {
    fixture("xTESLADIAG_000019_CH70.070")
        .to_string_lossy()
        .into_owned()
}

#[test]
fn valid_files_are_structured_and_failures_isolated() {
    let root = tempfile::tempdir().unwrap();
    let ctx = ProcessingContext::new(root.path(), StructuringConfig::default());
    let missing = root.path().join("nothing_here.070").to_string_lossy().into_owned();
    let unknown = fixture("unknown_format.txt").to_string_lossy().into_owned();

    let request = FileListRequest {
        file_list: vec![maccor_fixture(), missing.clone(), unknown.clone(), maccor_fixture()],
        run_list: vec![1, 2, 3, 4],
        validity: vec![
            "valid".to_string(),
            "valid".to_string(),
            "valid".to_string(),
            "invalid".to_string(),
        ],
    };
    let outcome = process_file_list(&request, &ctx).unwrap();

    let expected_output = structure_output_path(&ctx, &fixture("xTESLADIAG_000019_CH70.070"));
    assert_eq!(
        outcome.response.file_list,
        vec![expected_output.to_string_lossy().into_owned()]
    );
    assert_eq!(outcome.response.run_list, vec![1]);
    assert_eq!(
        outcome.response.invalid_file_list,
        vec![missing, unknown, maccor_fixture()]
    );

    let statuses: Vec<&str> = outcome.statuses.iter().map(|s| s.status.as_str()).collect();
    assert_eq!(statuses, vec!["success", "failed", "failed", "invalid"]);
    assert!(outcome.statuses.iter().all(|s| s.action == "structuring"));

    let structured: ProcessedCyclerRun = read_json(&expected_output, &STRUCTURE_DTYPES).unwrap();
    assert_eq!(structured.metadata().barcode.as_deref(), Some("EL151000429559"));
    assert_eq!(structured.metadata().channel_id, Some(70));
    assert!(structured.structuring().diagnostic_available.is_none());
}

#[test]
fn results_accumulate_across_batches() {
    let root = tempfile::tempdir().unwrap();
    let ctx = ProcessingContext::new(root.path(), StructuringConfig::default());
    let input = serde_json::json!({
        "file_list": [maccor_fixture()],
        "run_list": [7],
        "validity": ["valid"],
    })
    .to_string();

    process_file_list_from_json(&input, &ctx).unwrap();
    process_file_list_from_json(&input, &ctx).unwrap();

    let records: Vec<StatusRecord> =
        serde_json::from_str(&fs::read_to_string(ctx.results_path()).unwrap()).unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.run_id == Some(7) && r.status == "success"));
    assert!(records[0].size > 0);
}

#[test]
fn request_may_be_read_from_a_file() {
    let root = tempfile::tempdir().unwrap();
    let ctx = ProcessingContext::new(root.path(), StructuringConfig::default());
    let request_path = root.path().join("request.json");
    fs::write(
        &request_path,
        serde_json::json!({ "file_list": [maccor_fixture()] }).to_string(),
    )
    .unwrap();

    let outcome =
        process_file_list_from_json(&request_path.to_string_lossy(), &ctx).unwrap();
    assert_eq!(outcome.response.file_list.len(), 1);
    assert!(outcome.response.run_list.is_empty());
    assert!(outcome.response.invalid_file_list.is_empty());
}

#[test]
fn malformed_request_is_an_error() {
    let root = tempfile::tempdir().unwrap();
    let ctx = ProcessingContext::new(root.path(), StructuringConfig::default());
    assert!(process_file_list_from_json("{ not json", &ctx).is_err());
}
