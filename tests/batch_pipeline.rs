use ffp_batch::config::RunConfig;
use ffp_batch::pipeline::{output_paths, run_batches};
use ffp_core::engine::{ParallelEngine, ProcessLauncher};
use ffp_core::quantize::SENTINEL;
use ffp_core::record::{BatchKey, MeteorologicalRecord};
use ffp_core::store::{DataType, VolumeStore, METADATA_FILE};
use ndarray::Axis;
use std::ffi::OsString;
use std::fs;
use std::path::Path;
use std::process::Command;
use tempfile::tempdir;

const BIN: &str = env!("CARGO_BIN_EXE_ffp-batch");

const HEADER: &str =
    "datetime,USTAR,TOWER_HEIGHT,DISPLACEMENT_HEIGHT,ROUGHNESS_LENGTH,WS,WD,MO_LENGTH,V_SIGMA,PBLH";

/// Ten half-hourly rows in May 2021
///
/// Row 3 has a blank wind speed, which the roughness length stands in for. Row 6 has a
/// negative wind speed and row 8 a blank friction velocity; both are rejected by the model.
fn csv_rows() -> String {
    let mut text = String::from(HEADER);
    text.push('\n');
    for i in 0..10 {
        let ustar = if i == 8 { String::new() } else { "0.4".to_string() };
        let ws = match i {
            3 => String::new(),
            6 => "-1".to_string(),
            _ => format!("{}", 2.5 + 0.1 * i as f64),
        };
        let wd = 180 + 10 * i;
        text.push_str(&format!(
            "2021-05-01 {:02}:{:02}:00,{ustar},12.0,2.0,0.1,{ws},{wd},-50.0,0.6,1000\n",
            i / 2,
            30 * (i % 2)
        ));
    }
    text
}

const REJECTED: [usize; 2] = [6, 8];

fn write_config(dir: &Path) -> std::path::PathBuf {
    fs::write(dir.join("cdata.csv"), csv_rows()).unwrap();
    let path = dir.join("run.toml");
    fs::write(
        &path,
        r#"
[input]
path = "cdata.csv"

[domain]
xmin = -60
xmax = 60
ymin = -60
ymax = 60
dx = 3
dy = 3

[output]
directory = "results"

[workers]
count = 3
"#,
    )
    .unwrap();
    path
}

fn records() -> Vec<MeteorologicalRecord> {
    ffp_batch::ingest::read_records(csv_rows().as_bytes()).unwrap()
}

#[test]
fn rejected_timestamps_are_missing_slices_in_both_volumes() {
    let dir = tempdir().unwrap();
    let config = RunConfig::from_file(&write_config(dir.path())).unwrap();
    let engine = ParallelEngine::new(
        ProcessLauncher::new(BIN, vec![OsString::from("worker")]),
        config.workers.count,
    );

    let summary = run_batches(records(), &config, &engine).unwrap();

    assert!(summary.is_success(), "{:?}", summary.failed);
    let outcome = &summary.completed[0];
    assert_eq!(outcome.key, BatchKey::new(2021, 5));
    assert_eq!(outcome.engine.computed, 8);
    assert_eq!(outcome.engine.missing, 2);
    assert_eq!(outcome.engine.crashed, 0);

    let (lossless_path, lossy_path) = output_paths(&config.output.directory, outcome.key);
    let lossless = VolumeStore::open(&lossless_path).unwrap().load().unwrap();
    assert_eq!(lossless.footprint.dim(), (10, 41, 41));
    assert_eq!(lossless.volume.x.first(), Some(&-60));
    let ws = lossless.volume.covariate("WS").unwrap();
    assert!(ws[3].is_nan());
    assert_eq!(ws[6], -1.0);
    assert!(lossless.volume.covariate("USTAR").unwrap()[8].is_nan());
    for (t, slice) in lossless.footprint.axis_iter(Axis(0)).enumerate() {
        if REJECTED.contains(&t) {
            assert!(slice.iter().all(|v| v.is_nan()), "slice {t}");
        } else {
            assert!(slice.iter().all(|v| v.is_finite() && *v >= 0.0), "slice {t}");
            assert!(slice.iter().any(|v| *v > 0.0), "slice {t}");
        }
    }

    let lossy_store = VolumeStore::open(&lossy_path).unwrap();
    assert_eq!(lossy_store.metadata().footprint.dtype, DataType::Uint16);
    for t in REJECTED {
        assert!(lossy_store
            .read_encoded_chunk(t)
            .unwrap()
            .iter()
            .all(|&e| e == SENTINEL));
    }

    let params = outcome.quantization;
    let lossy = lossy_store.load().unwrap();
    assert!(lossy.volume.covariate("WS").unwrap()[3].is_nan());
    for (a, b) in lossless.footprint.iter().zip(lossy.footprint.iter()) {
        if a.is_nan() {
            assert!(b.is_nan());
        } else {
            assert!(f64::from((a - b).abs()) <= params.scale_factor);
        }
    }
}

#[test]
fn cli_run_writes_both_volumes() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path());

    let status = Command::new(BIN)
        .args([OsString::from("run"), OsString::from("--config"), config.into()])
        .status()
        .unwrap();

    assert!(status.success());
    let results = dir.path().join("results");
    assert!(results.join("2021-05_ffp").join(METADATA_FILE).is_file());
    assert!(results.join("2021-05_ffp_lossy").join(METADATA_FILE).is_file());
    assert!(!results.join("2021-05_ffp.staging").exists());
}

#[test]
fn cli_rejects_broken_config() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("run.toml");
    fs::write(&config, "[input]\npath = \"cdata.csv\"\n").unwrap();

    let status = Command::new(BIN)
        .args([OsString::from("run"), OsString::from("--config"), config.into()])
        .status()
        .unwrap();
    assert!(!status.success());
}

#[test]
fn worker_answers_on_stdout() {
    use std::io::Write;
    use std::process::Stdio;

    let mut child = Command::new(BIN)
        .arg("worker")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    // closing stdin right away ends the worker cleanly
    child.stdin.take().unwrap().flush().unwrap();
    let output = child.wait_with_output().unwrap();

    assert!(output.status.success());
    assert!(output.stdout.is_empty());
}
