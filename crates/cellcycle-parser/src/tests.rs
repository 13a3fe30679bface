use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;

use polars::prelude::*;

use crate::errors::ParserError;
use crate::formats::schema::required_raw_columns;
use crate::formats::{ArbinParser, MaccorParser, ParseOptions, RawColumns, SourceFile};
use crate::model::{EISpectrum, FormatKind, RawCyclerRun, RunMetadata};
use crate::registry::CyclerParser;
use crate::{parse_cycler_file, parse_cycler_file_with_options, parse_with_parsers};

fn fixture(path: &str) -> PathBuf {
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    base.join("tests/data").join(path)
}

fn keys(metadata: &RunMetadata) -> BTreeSet<&str> {
    metadata.keys().collect()
}

fn f64_values(run: &RawCyclerRun, name: &str) -> Vec<f64> {
    run.data()
        .column(name)
        .unwrap()
        .f64()
        .unwrap()
        .into_iter()
        .map(|v| v.unwrap())
        .collect()
}

fn assert_capacity_monotonic_within_cycles(run: &RawCyclerRun) {
    let cycles: Vec<i32> = run
        .data()
        .column("cycle_index")
        .unwrap()
        .i32()
        .unwrap()
        .into_iter()
        .map(|v| v.unwrap())
        .collect();
    for name in ["charge_capacity", "discharge_capacity"] {
        let values = f64_values(run, name);
        for idx in 1..values.len() {
            if cycles[idx] == cycles[idx - 1] {
                assert!(
                    values[idx] >= values[idx - 1],
                    "{name} decreased within cycle {} at row {idx}",
                    cycles[idx]
                );
            }
        }
    }
}

#[test]
fn parses_arbin_file_with_metadata_sidecar() {
    let run = parse_cycler_file(fixture("2017-12-04_4_65C-69per_6C_CH29.csv"))
        .expect("arbin parse failed");

    assert_eq!(run.format(), Some(FormatKind::Arbin));
    assert_eq!(run.height(), 24);
    let names: Vec<String> = run
        .data()
        .get_column_names()
        .into_iter()
        .map(|name| name.to_string())
        .collect();
    let required: Vec<&str> = required_raw_columns().collect();
    assert_eq!(&names[..required.len()], required.as_slice());
    assert!(names.iter().any(|name| name == "temperature"));
    assert!(names.iter().any(|name| name == "date_time_iso"));

    let metadata = run.metadata();
    assert_eq!(metadata.channel_id(), Some(29));
    assert_eq!(metadata.barcode(), Some("EL150800460478"));
    assert_eq!(
        metadata.protocol(),
        Some("2017-12-04_tests\\20170630-4_65C_69per_6C.sdu")
    );
    assert_eq!(
        metadata.get_str("start_datetime"),
        Some("2017-12-04T14:00:00")
    );
    assert!(metadata.contains_key("_today_datetime"));

    let discharge = f64_values(&run, "discharge_capacity");
    assert!((discharge[11] - 0.095).abs() < 1e-9);
    assert_capacity_monotonic_within_cycles(&run);
}

#[test]
fn arbin_without_sidecar_still_parses() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("lonely_arbin.csv");
    fs::copy(fixture("2017-12-04_4_65C-69per_6C_CH29.csv"), &target).unwrap();

    let run = parse_cycler_file(&target).expect("arbin parse failed");
    assert_eq!(run.metadata().channel_id(), None);
    assert_eq!(
        keys(run.metadata()),
        BTreeSet::from(["_today_datetime", "filename"])
    );
}

#[test]
fn parses_maccor_file_and_derives_channel_from_extension() {
    let run = parse_cycler_file(fixture("xTESLADIAG_000019_CH70.070")).expect("maccor parse failed");

    assert_eq!(run.format(), Some(FormatKind::Maccor));
    assert_eq!(
        keys(run.metadata()),
        BTreeSet::from([
            "_today_datetime",
            "barcode",
            "channel_id",
            "filename",
            "protocol",
            "start_datetime",
        ])
    );
    assert_eq!(run.metadata().channel_id(), Some(70));
    assert_eq!(run.metadata().barcode(), Some("EL151000429559"));
    assert_eq!(
        run.metadata().get_str("start_datetime"),
        Some("2019-03-28T00:00:00")
    );
    assert!(run.eis().is_none());

    let current = f64_values(&run, "current");
    assert!(current.iter().any(|value| *value < 0.0));
    let charge = f64_values(&run, "charge_capacity");
    let discharge = f64_values(&run, "discharge_capacity");
    // cycle 0 ends after four charge and four discharge records
    assert!((charge[8] - 0.4).abs() < 1e-9);
    assert!((discharge[8] - 0.38).abs() < 1e-9);
    // the next cycle restarts at zero
    assert_eq!(charge[9], 0.0);
    assert_capacity_monotonic_within_cycles(&run);
}

#[test]
fn maccor_embedded_eis_is_parsed_on_request() {
    let options = ParseOptions { include_eis: true };
    let run = parse_cycler_file_with_options(fixture("xTESLADIAG_000019_CH70.070"), &options)
        .expect("maccor parse failed");
    let eis = run.eis().expect("missing impedance block");
    assert_eq!(eis.len(), 4);
    let freq = eis.data().column("frequency").unwrap().f64().unwrap();
    assert_eq!(freq.get(0), Some(1000.0));
    // the sweep does not leak into the cycling table
    assert_eq!(run.height(), 27);
}

#[test]
fn reads_standalone_maccor_eis_file() {
    let eis = EISpectrum::from_maccor_file(fixture("eis_sweep.071")).expect("eis parse failed");
    assert_eq!(eis.len(), 3);
    let z_imag = eis.data().column("z_imag").unwrap().f64().unwrap();
    assert_eq!(z_imag.get(2), Some(-0.0025));
    assert_eq!(eis.metadata().channel_id(), Some(71));
}

#[test]
fn parses_biologic_mpt() {
    let run = parse_cycler_file(fixture("biologic_test_file_short.mpt")).expect("biologic parse failed");

    assert_eq!(run.format(), Some(FormatKind::Biologic));
    assert_eq!(
        keys(run.metadata()),
        BTreeSet::from(["_today_datetime", "barcode", "channel_id", "filename", "protocol"])
    );
    assert_eq!(run.height(), 16);

    let current = f64_values(&run, "current");
    assert!((current[0] - 1.0).abs() < 1e-12);
    let charge = f64_values(&run, "charge_capacity");
    let discharge = f64_values(&run, "discharge_capacity");
    assert!((charge[3] - 0.006).abs() < 1e-9);
    assert!((discharge[7] - 0.0056).abs() < 1e-9);
    assert_capacity_monotonic_within_cycles(&run);
}

#[test]
fn parses_neware_nested_csv() {
    let run = parse_cycler_file(fixture("neware_test.csv")).expect("neware parse failed");

    assert_eq!(run.format(), Some(FormatKind::Neware));
    assert_eq!(run.height(), 20);

    let cycles: BTreeSet<i32> = run
        .data()
        .column("cycle_index")
        .unwrap()
        .i32()
        .unwrap()
        .into_iter()
        .flatten()
        .collect();
    assert_eq!(cycles, BTreeSet::from([1, 2]));

    let time = f64_values(&run, "test_time");
    assert!(time.windows(2).all(|pair| pair[1] >= pair[0]));
    assert_eq!(time[1], 60.0);

    let current = f64_values(&run, "current");
    assert!((current[0] - 1.0).abs() < 1e-12);
    assert!((current[6] + 1.0).abs() < 1e-12);

    let resistance = f64_values(&run, "internal_resistance");
    assert!((resistance[0] - 0.0125).abs() < 1e-12);
    assert_capacity_monotonic_within_cycles(&run);
}

#[test]
fn parses_indigo_parquet_export() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("indigo_cell.parquet");

    let mut df = df!(
        "cell_id" => &["cellA", "cellA", "cellA", "cellA", "cellA"],
        "cycle_count" => &[0i64, 0, 0, 1, 1],
        "half_cycle_count" => &[0i64, 0, 1, 2, 2],
        "time_s" => &[0.0f64, 10.0, 20.0, 30.0, 40.0],
        "system_time_us" => &[1_600_000_000_000_000i64, 1_600_000_010_000_000, 1_600_000_020_000_000, 1_600_000_030_000_000, 1_600_000_040_000_000],
        "cell_voltage_v" => &[3.5f64, 3.7, 3.6, 3.8, 3.7],
        "cell_current_a" => &[1.0f64, 1.0, -1.0, 1.0, -1.0],
        "cell_coulomb_count_c" => &[0.0f64, 36.0, 18.0, 54.0, 36.0],
        "cell_energy_j" => &[0.0f64, 360.0, 180.0, 540.0, 360.0],
        "cell_temperature_c" => &[25.0f64, 25.5, 26.0, 26.5, 27.0],
    )
    .unwrap();
    let mut file = fs::File::create(&path).unwrap();
    ParquetWriter::new(&mut file).finish(&mut df).unwrap();

    let run = parse_cycler_file(&path).expect("indigo parse failed");
    assert_eq!(run.format(), Some(FormatKind::Indigo));
    assert_eq!(
        keys(run.metadata()),
        BTreeSet::from(["_today_datetime", "filename", "indigo_cell_id", "start_datetime"])
    );
    assert_eq!(run.metadata().get_str("indigo_cell_id"), Some("cellA"));

    let charge = f64_values(&run, "charge_capacity");
    let discharge = f64_values(&run, "discharge_capacity");
    assert!((charge[1] - 0.01).abs() < 1e-12);
    assert!((discharge[2] - 0.005).abs() < 1e-12);
    assert!((charge[3] - 0.01).abs() < 1e-12);
    assert_capacity_monotonic_within_cycles(&run);
}

#[test]
fn unknown_file_reports_every_attempt() {
    let err = parse_cycler_file(fixture("unknown_format.txt")).unwrap_err();
    match err {
        ParserError::UnrecognizedFormat { attempts, .. } => {
            assert_eq!(attempts.len(), FormatKind::ALL.len());
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn detect_uses_extension_and_signature() {
    assert_eq!(
        FormatKind::detect(&PathBuf::from("run.070"), b"Today's Date\t"),
        Some(FormatKind::Maccor)
    );
    assert_eq!(
        FormatKind::detect(&PathBuf::from("run.csv"), b"Cycle ID,Cap_Chg(mAh)"),
        Some(FormatKind::Neware)
    );
    assert_eq!(
        FormatKind::detect(&PathBuf::from("run.csv"), b"Data_Point,Test_Time(s),Cycle_Index"),
        Some(FormatKind::Arbin)
    );
    assert_eq!(
        FormatKind::detect(&PathBuf::from("run.mpt"), b"EC-Lab ASCII FILE"),
        Some(FormatKind::Biologic)
    );
    assert_eq!(FormatKind::detect(&PathBuf::from("notes.txt"), b"hello"), None);
}

#[test]
fn claimed_file_errors_are_not_swallowed() {
    let content = "Today's Date\t04/15/2019\nRec#\tCyc#\tStep\tTest (Sec)\tAmp-hr\tWatt-hr\tAmps\tVolts\tState\n1\tx\t1\t0\t0\t0\t0\t3.4\tR\n";
    let source = SourceFile::from_bytes("bad.001", content.as_bytes().to_vec());
    let parsers: [&dyn CyclerParser; 2] = [&ArbinParser, &MaccorParser];
    let err = parse_with_parsers(&source, &ParseOptions::default(), &parsers).unwrap_err();
    assert!(matches!(err, ParserError::DataRow { parser: "MACCOR", .. }));
}

#[test]
fn raw_run_rejects_decreasing_cycle_index() {
    let mut columns = RawColumns::new(3);
    for (idx, cycle) in [1, 2, 1].into_iter().enumerate() {
        columns.data_point.push(idx as i64);
        columns.cycle_index.push(cycle);
        columns.step_index.push(1);
        columns.test_time.push(idx as f64);
        columns.voltage.push(3.5);
        columns.current.push(0.0);
        columns.charge_capacity.push(0.0);
        columns.discharge_capacity.push(0.0);
        columns.charge_energy.push(0.0);
        columns.discharge_energy.push(0.0);
    }
    let err = columns.into_dataframe().unwrap_err();
    assert!(matches!(err, ParserError::Validation { .. }));
}

#[test]
fn raw_run_rejects_missing_required_columns() {
    let df = df!("data_point" => &[1i64, 2], "cycle_index" => &[0i32, 0]).unwrap();
    let err = RawCyclerRun::new(df, RunMetadata::new()).unwrap_err();
    assert!(matches!(err, ParserError::Validation { .. }));
}
