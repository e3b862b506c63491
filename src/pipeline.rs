//! The batch driver
//!
//! Records are split into calendar months and every month goes through the same steps:
//!
//! 1. allocate an empty volume store `{output}/{YYYY-MM}_ffp`,
//! 2. fill every chunk on the worker pool and wait for all of them,
//! 3. rewrite the store losslessly and write `{output}/{YYYY-MM}_ffp_lossy` next to it.
//!
//! A month that fails is logged and skipped; the remaining months still run.

use crate::config::RunConfig;
use crate::ingest::read_records_from_path;
use crate::progress::BatchProgress;
use ffp_core::compression::CompressionPipeline;
use ffp_core::engine::{EngineReport, ParallelEngine, ProcessLauncher, WorkerLauncher};
use ffp_core::errors::{FfpError, FfpResult};
use ffp_core::executor::ModelFlags;
use ffp_core::protocol::ChunkTask;
use ffp_core::quantize::QuantizationParams;
use ffp_core::record::{partition_by_month, BatchKey, MeteorologicalRecord, MonthlyBatch};
use ffp_core::store::{ChunkEncoding, VolumeStore};
use ffp_core::volume::FootprintVolume;
use log::{error, info};
use std::fs;
use std::path::{Path, PathBuf};

/// Paths of the lossless and the lossy volume of a batch
pub fn output_paths(directory: &Path, key: BatchKey) -> (PathBuf, PathBuf) {
    let stem = key.file_stem();
    (
        directory.join(format!("{stem}_ffp")),
        directory.join(format!("{stem}_ffp_lossy")),
    )
}

/// A batch that was written successfully
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub key: BatchKey,
    pub lossless: PathBuf,
    pub lossy: PathBuf,
    pub engine: EngineReport,
    pub quantization: QuantizationParams,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub completed: Vec<BatchOutcome>,
    pub failed: Vec<(BatchKey, FfpError)>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Compute and compress one monthly batch
pub fn process_batch<L: WorkerLauncher>(
    batch: &MonthlyBatch,
    config: &RunConfig,
    engine: &ParallelEngine<L>,
) -> FfpResult<BatchOutcome> {
    let volume = FootprintVolume::build(batch.key, &batch.records, &config.domain)?;
    let (intermediate, lossy) = output_paths(&config.output.directory, batch.key);

    let store = VolumeStore::create(&intermediate, &volume, ChunkEncoding::Raw)?;
    let tasks = ChunkTask::for_batch(
        &batch.records,
        &config.domain,
        &ModelFlags::default(),
        store.path(),
    );

    let progress = BatchProgress::new(&batch.key.to_string(), tasks.len());
    let report = match engine.execute(&store, &tasks, &progress) {
        Ok(report) => {
            progress.finish();
            report
        }
        Err(err) => {
            progress.abandon();
            return Err(err);
        }
    };

    info!("Compressing {}", batch.key);
    let compressed =
        CompressionPipeline::new(config.compression.level).compress(store.path(), &lossy)?;

    Ok(BatchOutcome {
        key: batch.key,
        lossless: compressed.lossless,
        lossy: compressed.lossy,
        engine: report,
        quantization: compressed.quantization,
    })
}

/// Process every month of `records` in calendar order
pub fn run_batches<L: WorkerLauncher>(
    records: Vec<MeteorologicalRecord>,
    config: &RunConfig,
    engine: &ParallelEngine<L>,
) -> FfpResult<RunSummary> {
    let directory = &config.output.directory;
    fs::create_dir_all(directory).map_err(|e| FfpError::io(directory, e))?;

    let mut summary = RunSummary::default();
    for batch in partition_by_month(records) {
        info!("Processing {} ({} records)", batch.key, batch.len());
        match process_batch(&batch, config, engine) {
            Ok(outcome) => summary.completed.push(outcome),
            Err(err) => {
                error!("Batch {} failed: {}", batch.key, err);
                summary.failed.push((batch.key, err));
            }
        }
    }

    info!(
        "{} batches written, {} failed",
        summary.completed.len(),
        summary.failed.len()
    );
    Ok(summary)
}

/// Run a configuration end to end with worker processes of the current executable
pub fn run(config: &RunConfig) -> FfpResult<RunSummary> {
    let records = read_records_from_path(&config.input.path)?;
    let engine = ParallelEngine::new(ProcessLauncher::current_exe()?, config.workers.count);
    run_batches(records, config, &engine)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompressionConfig, InputConfig, OutputConfig, WorkerConfig};
    use chrono::{Duration, NaiveDate};
    use ffp_core::engine::{ChunkWorker, WorkerFault};
    use ffp_core::grid::GridSpec;
    use ffp_core::protocol::{ChunkReport, TaskHandler};
    use ffp_core::store::METADATA_FILE;
    use ffp_model::FfpClimatology;
    use tempfile::tempdir;

    struct InProcess(TaskHandler<FfpClimatology>);

    impl ChunkWorker for InProcess {
        fn run(&mut self, task: &ChunkTask) -> Result<ChunkReport, WorkerFault> {
            Ok(self.0.handle(task))
        }

        fn shutdown(self: Box<Self>) {}
    }

    struct InProcessLauncher;

    impl WorkerLauncher for InProcessLauncher {
        fn launch(&self, _slot: usize) -> FfpResult<Box<dyn ChunkWorker>> {
            Ok(Box::new(InProcess(TaskHandler::new(FfpClimatology::default()))))
        }
    }

    fn record(year: i32, month: u32, step: i64) -> MeteorologicalRecord {
        let start = NaiveDate::from_ymd_opt(year, month, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        MeteorologicalRecord {
            timestamp: start + Duration::minutes(30 * step),
            ustar: 0.4,
            tower_height: 12.0,
            displacement_height: 2.0,
            roughness_length: 0.1,
            wind_speed: 3.0,
            wind_direction: 225.0,
            mo_length: -50.0,
            v_sigma: 0.6,
            pblh: 1000.0,
        }
    }

    fn config(output: &Path) -> RunConfig {
        RunConfig {
            input: InputConfig {
                path: PathBuf::from("unused.csv"),
            },
            domain: GridSpec::new(-40, 40, -40, 40, 4, 4).unwrap(),
            output: OutputConfig {
                directory: output.to_path_buf(),
            },
            workers: WorkerConfig { count: 2 },
            compression: CompressionConfig::default(),
        }
    }

    #[test]
    fn output_names() {
        let (lossless, lossy) = output_paths(Path::new("results"), BatchKey::new(2019, 3));
        assert_eq!(lossless, PathBuf::from("results/2019-03_ffp"));
        assert_eq!(lossy, PathBuf::from("results/2019-03_ffp_lossy"));
    }

    #[test]
    fn each_month_gets_its_own_volumes() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("results");
        let mut records: Vec<_> = (0..3).map(|i| record(2020, 2, i)).collect();
        records.extend((0..2).map(|i| record(2020, 1, i)));
        let engine = ParallelEngine::new(InProcessLauncher, 2);

        let summary = run_batches(records, &config(&output), &engine).unwrap();

        assert!(summary.is_success());
        let keys: Vec<_> = summary.completed.iter().map(|b| b.key).collect();
        assert_eq!(keys, vec![BatchKey::new(2020, 1), BatchKey::new(2020, 2)]);

        let february = VolumeStore::open(output.join("2020-02_ffp"))
            .unwrap()
            .load()
            .unwrap();
        assert_eq!(february.footprint.dim(), (3, 21, 21));
        assert!(february.footprint.iter().all(|v| v.is_finite() && *v >= 0.0));
        assert!(output.join("2020-01_ffp_lossy").join(METADATA_FILE).is_file());
    }

    #[test]
    fn rejected_records_become_missing_slices() {
        let dir = tempdir().unwrap();
        let mut records: Vec<_> = (0..4).map(|i| record(2021, 6, i)).collect();
        records[2].ustar = 0.05;
        let engine = ParallelEngine::new(InProcessLauncher, 2);

        let summary = run_batches(records, &config(dir.path()), &engine).unwrap();

        let outcome = &summary.completed[0];
        assert_eq!(outcome.engine.computed, 3);
        assert_eq!(outcome.engine.missing, 1);
        let loaded = VolumeStore::open(&outcome.lossless).unwrap().load().unwrap();
        let slice = loaded.footprint.index_axis(ndarray::Axis(0), 2);
        assert!(slice.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn blank_measurements_are_carried_as_missing_covariates() {
        let dir = tempdir().unwrap();
        let mut records: Vec<_> = (0..3).map(|i| record(2021, 5, i)).collect();
        records[1].wind_speed = f64::NAN;
        records[2].ustar = f64::NAN;
        let engine = ParallelEngine::new(InProcessLauncher, 2);

        let summary = run_batches(records, &config(dir.path()), &engine).unwrap();

        assert!(summary.is_success(), "{:?}", summary.failed);
        let outcome = &summary.completed[0];
        assert_eq!(outcome.engine.computed, 2);
        assert_eq!(outcome.engine.missing, 1);
        let loaded = VolumeStore::open(&outcome.lossy).unwrap().load().unwrap();
        assert!(loaded.volume.covariate("WS").unwrap()[1].is_nan());
        assert!(loaded.volume.covariate("USTAR").unwrap()[2].is_nan());
        let slice = loaded.footprint.index_axis(ndarray::Axis(0), 2);
        assert!(slice.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn failing_batch_does_not_stop_the_run() {
        let dir = tempdir().unwrap();
        let output = dir.path().to_path_buf();
        // a plain file where the January store should go
        fs::write(output.join("2020-01_ffp"), b"not a store").unwrap();
        let records = vec![record(2020, 1, 0), record(2020, 2, 0)];
        let engine = ParallelEngine::new(InProcessLauncher, 1);

        let summary = run_batches(records, &config(&output), &engine).unwrap();

        assert!(!summary.is_success());
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, BatchKey::new(2020, 1));
        assert_eq!(summary.completed[0].key, BatchKey::new(2020, 2));
    }
}
