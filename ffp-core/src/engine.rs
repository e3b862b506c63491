//! Parallel execution of a batch's chunk tasks on a pool of worker processes
//!
//! Every time index of a batch is an independent [`ChunkTask`]. The engine keeps a fixed
//! number of pool slots; each slot owns one worker process and feeds it tasks one at a time
//! until none are left. Workers are separate OS processes because footprint models may rely
//! on numerical code that is neither reentrant nor thread safe, and so that a crash only takes
//! down the chunk being computed.
//!
//! Workers write their chunks directly into the [`VolumeStore`], so the engine itself never
//! holds footprint values. [`ParallelEngine::execute`] returns only once every slot has
//! finished and every chunk of the store exists on disk.

use crate::errors::{FfpError, FfpResult};
use crate::executor::missing_field;
use crate::protocol::{ChunkReport, ChunkTask};
use crate::store::VolumeStore;
use log::{debug, error, info, warn};
use std::ffi::OsString;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;

/// Consecutive crashes of fresh workers tolerated on one pool slot
pub const MAX_CONSECUTIVE_CRASHES: usize = 3;

/// A worker that lost its task: it exited, closed its pipes or answered nonsense
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerFault {
    Exited(String),
    Protocol(String),
}

impl std::fmt::Display for WorkerFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerFault::Exited(msg) => write!(f, "worker exited: {}", msg),
            WorkerFault::Protocol(msg) => write!(f, "worker protocol error: {}", msg),
        }
    }
}

/// A live worker serving one task at a time
pub trait ChunkWorker: Send {
    fn run(&mut self, task: &ChunkTask) -> Result<ChunkReport, WorkerFault>;

    /// Let the worker finish gracefully
    fn shutdown(self: Box<Self>);
}

/// Starts workers for the pool slots
pub trait WorkerLauncher: Sync {
    fn launch(&self, slot: usize) -> FfpResult<Box<dyn ChunkWorker>>;
}

/// Observer of batch progress
pub trait ProgressObserver: Sync {
    fn chunk_finished(&self, completed: usize, total: usize);
}

/// Ignores progress
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn chunk_finished(&self, _completed: usize, _total: usize) {}
}

/// Launches workers as child processes speaking the line protocol on stdin/stdout
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Re-run the current executable with the `worker` subcommand
    pub fn current_exe() -> FfpResult<Self> {
        let program = std::env::current_exe().map_err(|e| FfpError::io("<current exe>", e))?;
        Ok(Self::new(program, vec![OsString::from("worker")]))
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, slot: usize) -> FfpResult<Box<dyn ChunkWorker>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                FfpError::WorkerPool(format!(
                    "failed to spawn worker {}: {e}",
                    self.program.display()
                ))
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        match (stdin, stdout) {
            (Some(stdin), Some(stdout)) => {
                debug!("Started worker {} for slot {}", child.id(), slot);
                Ok(Box::new(ProcessWorker {
                    child,
                    stdin: Some(stdin),
                    stdout: BufReader::new(stdout),
                    reaped: false,
                }))
            }
            _ => {
                // Unreachable with piped stdio, but never leave the child running
                let _ = child.kill();
                let _ = child.wait();
                Err(FfpError::WorkerPool(
                    "worker started without stdio pipes".to_string(),
                ))
            }
        }
    }
}

struct ProcessWorker {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    reaped: bool,
}

impl ProcessWorker {
    fn exit_status(&mut self) -> String {
        match self.child.wait() {
            Ok(status) => {
                self.reaped = true;
                status.to_string()
            }
            Err(e) => format!("unknown status ({e})"),
        }
    }
}

impl ChunkWorker for ProcessWorker {
    fn run(&mut self, task: &ChunkTask) -> Result<ChunkReport, WorkerFault> {
        let mut line =
            serde_json::to_string(task).map_err(|e| WorkerFault::Protocol(e.to_string()))?;
        line.push('\n');

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| WorkerFault::Exited("stdin already closed".to_string()))?;
        if let Err(e) = stdin.write_all(line.as_bytes()).and_then(|_| stdin.flush()) {
            return Err(WorkerFault::Exited(format!("cannot send task: {e}")));
        }

        let mut reply = String::new();
        match self.stdout.read_line(&mut reply) {
            Ok(0) => {
                let status = self.exit_status();
                Err(WorkerFault::Exited(format!(
                    "{status} while computing chunk {}",
                    task.time_index
                )))
            }
            Ok(_) => {
                let report: ChunkReport = serde_json::from_str(&reply)
                    .map_err(|e| WorkerFault::Protocol(format!("unreadable reply: {e}")))?;
                if report.time_index() != task.time_index {
                    return Err(WorkerFault::Protocol(format!(
                        "reply for chunk {} while computing chunk {}",
                        report.time_index(),
                        task.time_index
                    )));
                }
                Ok(report)
            }
            Err(e) => Err(WorkerFault::Exited(format!("cannot read reply: {e}"))),
        }
    }

    fn shutdown(mut self: Box<Self>) {
        // Closing stdin ends the worker's task loop
        drop(self.stdin.take());
        let status = self.exit_status();
        debug!("Worker {} finished: {}", self.child.id(), status);
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        if !self.reaped {
            drop(self.stdin.take());
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Counts of how a batch's chunks were produced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineReport {
    pub total: usize,
    /// Chunks holding a footprint
    pub computed: usize,
    /// Chunks the model rejected
    pub missing: usize,
    /// Chunks lost to a crashed worker, stored as missing
    pub crashed: usize,
}

#[derive(Default)]
struct PoolState {
    next: AtomicUsize,
    completed: AtomicUsize,
    computed: AtomicUsize,
    missing: AtomicUsize,
    crashed: AtomicUsize,
    abort: AtomicBool,
    failure: Mutex<Option<FfpError>>,
}

impl PoolState {
    fn fail(&self, err: FfpError) {
        self.abort.store(true, Ordering::SeqCst);
        let mut failure = self.failure.lock().unwrap_or_else(|e| e.into_inner());
        // Keep the first failure; later ones are usually consequences of it
        if failure.is_none() {
            *failure = Some(err);
        } else {
            debug!("Suppressed follow-up failure: {}", err);
        }
    }
}

/// Fans chunk tasks out over a fixed-size pool of workers
pub struct ParallelEngine<L> {
    launcher: L,
    workers: usize,
}

impl<L: WorkerLauncher> ParallelEngine<L> {
    pub fn new(launcher: L, workers: usize) -> Self {
        Self {
            launcher,
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run every task and block until all chunks of `store` are on disk
    ///
    /// Tasks may run in any order. A model failure for a chunk is not an error; a chunk the
    /// worker could not store is, and stops the dispatch of further tasks.
    pub fn execute(
        &self,
        store: &VolumeStore,
        tasks: &[ChunkTask],
        progress: &dyn ProgressObserver,
    ) -> FfpResult<EngineReport> {
        let total = tasks.len();
        let state = PoolState::default();
        let slots = self.workers.min(total);
        info!(
            "Dispatching {} chunks of {} to {} workers",
            total,
            store.path().display(),
            slots
        );

        thread::scope(|scope| {
            for slot in 0..slots {
                let state = &state;
                scope.spawn(move || {
                    if let Err(err) = self.run_slot(slot, store, tasks, state, progress) {
                        error!("Worker slot {} aborted: {}", slot, err);
                        state.fail(err);
                    }
                });
            }
        });

        let failure = state
            .failure
            .into_inner()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(err) = failure {
            return Err(err);
        }

        store.ensure_complete()?;

        let report = EngineReport {
            total,
            computed: state.computed.into_inner(),
            missing: state.missing.into_inner(),
            crashed: state.crashed.into_inner(),
        };
        info!(
            "All {} chunks stored: {} computed, {} missing, {} lost to worker crashes",
            report.total, report.computed, report.missing, report.crashed
        );
        Ok(report)
    }

    fn run_slot(
        &self,
        slot: usize,
        store: &VolumeStore,
        tasks: &[ChunkTask],
        state: &PoolState,
        progress: &dyn ProgressObserver,
    ) -> FfpResult<()> {
        let mut worker = self.launcher.launch(slot)?;
        let mut consecutive_crashes = 0;

        while !state.abort.load(Ordering::SeqCst) {
            let index = state.next.fetch_add(1, Ordering::SeqCst);
            let Some(task) = tasks.get(index) else {
                break;
            };

            match worker.run(task) {
                Ok(ChunkReport::Computed { .. }) => {
                    consecutive_crashes = 0;
                    state.computed.fetch_add(1, Ordering::SeqCst);
                }
                Ok(ChunkReport::Missing { time_index, reason }) => {
                    consecutive_crashes = 0;
                    debug!("Chunk {} has no footprint: {}", time_index, reason);
                    state.missing.fetch_add(1, Ordering::SeqCst);
                }
                Ok(ChunkReport::Failed {
                    time_index,
                    message,
                }) => {
                    worker.shutdown();
                    return Err(FfpError::ChunkFailed {
                        index: time_index,
                        message,
                    });
                }
                Err(fault) => {
                    consecutive_crashes += 1;
                    warn!(
                        "Chunk {} lost on slot {}: {}; storing it as missing",
                        task.time_index, slot, fault
                    );
                    store.write_chunk(task.time_index, missing_field(&task.grid).view())?;
                    state.crashed.fetch_add(1, Ordering::SeqCst);

                    if consecutive_crashes >= MAX_CONSECUTIVE_CRASHES {
                        return Err(FfpError::WorkerPool(format!(
                            "{consecutive_crashes} consecutive worker crashes on slot {slot}, last: {fault}"
                        )));
                    }
                    // The old worker is killed when dropped
                    worker = self.launcher.launch(slot)?;
                }
            }

            let completed = state.completed.fetch_add(1, Ordering::SeqCst) + 1;
            progress.chunk_finished(completed, tasks.len());
        }

        worker.shutdown();
        Ok(())
    }
}
