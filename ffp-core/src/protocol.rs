//! Messages exchanged between the engine and its worker processes
//!
//! The protocol is newline-delimited JSON: the engine writes one [`ChunkTask`] per line to a
//! worker's stdin and reads one [`ChunkReport`] per line from its stdout. Workers write the
//! computed chunk straight into the volume store, so footprint values never cross the pipe.

use crate::errors::{FfpError, FfpResult};
use crate::executor::{ChunkOutcome, FootprintExecutor, FootprintModel, ModelFlags};
use crate::grid::GridSpec;
use crate::record::MeteorologicalRecord;
use crate::store::VolumeStore;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

/// Compute and store the footprint of one time index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkTask {
    pub time_index: usize,
    pub record: MeteorologicalRecord,
    pub grid: GridSpec,
    pub flags: ModelFlags,
    /// Store the chunk is written to
    pub store: PathBuf,
}

impl ChunkTask {
    /// One task per record, in time order
    pub fn for_batch(
        records: &[MeteorologicalRecord],
        grid: &GridSpec,
        flags: &ModelFlags,
        store: &Path,
    ) -> Vec<ChunkTask> {
        records
            .iter()
            .enumerate()
            .map(|(time_index, record)| ChunkTask {
                time_index,
                record: record.clone(),
                grid: *grid,
                flags: *flags,
                store: store.to_path_buf(),
            })
            .collect()
    }
}

/// What happened to a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChunkReport {
    /// A footprint was computed and written
    Computed { time_index: usize },
    /// The model rejected the record; a missing chunk was written
    Missing { time_index: usize, reason: String },
    /// The chunk could not be produced or stored
    Failed { time_index: usize, message: String },
}

impl ChunkReport {
    pub fn time_index(&self) -> usize {
        match self {
            ChunkReport::Computed { time_index }
            | ChunkReport::Missing { time_index, .. }
            | ChunkReport::Failed { time_index, .. } => *time_index,
        }
    }
}

/// Worker-side handling of [`ChunkTask`]s
pub struct TaskHandler<M> {
    executor: FootprintExecutor<M>,
    store: Option<VolumeStore>,
}

impl<M: FootprintModel> TaskHandler<M> {
    pub fn new(model: M) -> Self {
        Self {
            executor: FootprintExecutor::new(model),
            store: None,
        }
    }

    /// The store a task targets, reusing the last one opened
    fn store_for(&mut self, path: &Path) -> FfpResult<&VolumeStore> {
        let reuse = matches!(&self.store, Some(store) if store.path() == path);
        if !reuse {
            self.store = Some(VolumeStore::open(path)?);
        }
        self.store
            .as_ref()
            .ok_or_else(|| FfpError::Error(format!("store {} is not open", path.display())))
    }

    fn try_handle(&mut self, task: &ChunkTask) -> FfpResult<ChunkReport> {
        let outcome = self
            .executor
            .compute(&task.record, &task.grid, &task.flags)?;
        let store = self.store_for(&task.store)?;
        store.write_chunk(task.time_index, outcome.field().view())?;

        Ok(match outcome {
            ChunkOutcome::Computed(_) => ChunkReport::Computed {
                time_index: task.time_index,
            },
            ChunkOutcome::Missing { reason, .. } => ChunkReport::Missing {
                time_index: task.time_index,
                reason: reason.to_string(),
            },
        })
    }

    /// Compute, store and report a single task
    pub fn handle(&mut self, task: &ChunkTask) -> ChunkReport {
        match self.try_handle(task) {
            Ok(report) => report,
            Err(err) => {
                warn!("Chunk {} failed: {}", task.time_index, err);
                ChunkReport::Failed {
                    time_index: task.time_index,
                    message: err.to_string(),
                }
            }
        }
    }

    /// Serve tasks from `input` until it is closed, answering each on `output`
    pub fn serve(&mut self, input: impl BufRead, mut output: impl Write) -> FfpResult<()> {
        for line in input.lines() {
            let line = line.map_err(|e| FfpError::io("<worker input>", e))?;
            if line.trim().is_empty() {
                continue;
            }
            let task: ChunkTask = serde_json::from_str(&line)
                .map_err(|e| FfpError::Error(format!("malformed task: {e}")))?;
            debug!("Worker received chunk {}", task.time_index);

            let report = self.handle(&task);
            let mut reply = serde_json::to_string(&report)
                .map_err(|e| FfpError::Error(format!("unserialisable report: {e}")))?;
            reply.push('\n');
            output
                .write_all(reply.as_bytes())
                .and_then(|_| output.flush())
                .map_err(|e| FfpError::io("<worker output>", e))?;
        }
        Ok(())
    }
}
