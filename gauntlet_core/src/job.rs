use crate::config::{Target, Timings, ToolSettings};
use crate::logging::LogSinks;
use crate::process::{ProcessError, ToolProcess, WaitOutcome, describe_exit};
use crate::sync::{self, SyncError};
use crate::variant::{FuzzerKind, ToolInvocation, companion_invocation, tracer_invocation};
use serde::Serialize;
use slog::{Logger, debug, error, info, warn};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

/// A job always keeps room for the primary tool plus one companion process.
pub const MIN_JOB_CORES: usize = 2;

/// Lifecycle of a job.
///
/// `Ready -> Fuzzing -> CoverageTracing -> SyncingResults -> Finished`, with
/// `Failed` and `ExitRequested` reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum JobState {
    Ready = 0,
    Fuzzing = 1,
    CoverageTracing = 2,
    SyncingResults = 3,
    Finished = 4,
    Failed = 5,
    ExitRequested = 6,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Finished | JobState::Failed | JobState::ExitRequested
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Ready => "READY",
            JobState::Fuzzing => "FUZZING",
            JobState::CoverageTracing => "COVERAGE_TRACING",
            JobState::SyncingResults => "SYNCING_RESULTS",
            JobState::Finished => "FINISHED",
            JobState::Failed => "FAILED",
            JobState::ExitRequested => "EXIT_REQUESTED",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => JobState::Ready,
            1 => JobState::Fuzzing,
            2 => JobState::CoverageTracing,
            3 => JobState::SyncingResults,
            4 => JobState::Finished,
            5 => JobState::Failed,
            _ => JobState::ExitRequested,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum JobError {
    #[error("A job needs at least {min} cores, got {0}", min = MIN_JOB_CORES)]
    InsufficientCores(usize),
    #[error("Job {name} cannot be started from state {state}")]
    NotReady { name: String, state: JobState },
    #[error("Exit requested")]
    Interrupted,
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("Tracer exited with {0}")]
    TracerFailed(String),
    #[error("Failed to spawn worker thread: {0}")]
    Thread(std::io::Error),
    #[error("Worker panicked: {0}")]
    Panicked(String),
}

/// The handle the campaign scheduler drives jobs through.
///
/// The scheduler only reads `state()` and signals; everything a job does
/// with its processes stays behind this interface.
pub trait CampaignJob: Send {
    fn name(&self) -> &str;
    fn cores(&self) -> usize;
    fn state(&self) -> JobState;
    /// Leaves `Ready` before returning; the work itself runs elsewhere.
    fn start(&mut self) -> Result<(), JobError>;
    /// Cooperative and idempotent.
    fn request_exit(&self);
    /// Blocks until execution, including teardown, is over. No-op if the
    /// job never started.
    fn join(&mut self);
}

/// What a job shares with its campaign: how to invoke the driver, the
/// polling cadence, where results go and where to log.
#[derive(Clone)]
pub struct JobContext {
    pub tool: ToolSettings,
    pub timings: Timings,
    pub results_dir: PathBuf,
    pub sinks: LogSinks,
}

/// The immutable description of one job.
#[derive(Debug, Clone)]
pub struct JobDef {
    pub target: Target,
    pub run_id: u32,
    pub timeout_s: u64,
    pub fuzzer: FuzzerKind,
    pub cores: usize,
}

impl JobDef {
    /// Suffix the driver appends to the target's workdir. Unique per
    /// (fuzzer, timeout, run id).
    pub fn suffix(&self) -> String {
        format!("{}-{}s-{}", self.fuzzer.tag(), self.timeout_s, self.run_id)
    }

    pub fn workdir(&self) -> PathBuf {
        let mut workdir = self.target.workdir().as_os_str().to_owned();
        workdir.push("-");
        workdir.push(self.suffix());
        PathBuf::from(workdir)
    }

    pub fn name(&self) -> String {
        self.workdir()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.suffix())
    }

    /// Full argv for one driver invocation.
    pub fn tool_command(&self, tool: &ToolSettings, invocation: &ToolInvocation) -> Vec<String> {
        let mut command = tool.command_prefix.clone();
        command.push(tool.binary.to_string_lossy().into_owned());
        command.push(self.target.config().to_string_lossy().into_owned());
        command.extend([
            "--suffix".to_string(),
            self.suffix(),
            invocation.mode.as_arg().to_string(),
            "-t".to_string(),
            format!("{}s", self.timeout_s),
            "-j".to_string(),
            invocation.jobs.to_string(),
        ]);
        command.extend(invocation.extra_args.iter().cloned());
        command
    }
}

struct JobShared {
    state: AtomicU8,
    exit_requested: AtomicBool,
    finished_at: OnceLock<Instant>,
}

impl JobShared {
    fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: JobState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::SeqCst)
    }

    /// Stores a terminal state. The first call fixes the end time.
    fn finish(&self, state: JobState) {
        let _ = self.finished_at.set(Instant::now());
        self.set_state(state);
    }
}

/// One fuzzer run against one target, executed on its own thread.
pub struct FuzzingJob {
    def: Arc<JobDef>,
    name: String,
    ctx: Arc<JobContext>,
    shared: Arc<JobShared>,
    log: Logger,
    started_at: Option<Instant>,
    worker: Option<JoinHandle<()>>,
}

impl FuzzingJob {
    pub fn new(
        target: Target,
        run_id: u32,
        timeout_s: u64,
        cores: usize,
        fuzzer: FuzzerKind,
        ctx: Arc<JobContext>,
    ) -> Result<Self, JobError> {
        if cores < MIN_JOB_CORES {
            return Err(JobError::InsufficientCores(cores));
        }
        let def = JobDef {
            target,
            run_id,
            timeout_s,
            fuzzer,
            cores,
        };
        let name = def.name();
        let log = ctx.sinks.for_job(&name);
        Ok(Self {
            def: Arc::new(def),
            name,
            ctx,
            shared: Arc::new(JobShared {
                state: AtomicU8::new(JobState::Ready as u8),
                exit_requested: AtomicBool::new(false),
                finished_at: OnceLock::new(),
            }),
            log,
            started_at: None,
            worker: None,
        })
    }

    pub fn def(&self) -> &JobDef {
        &self.def
    }

    pub fn fuzzer(&self) -> FuzzerKind {
        self.def.fuzzer
    }

    pub fn target(&self) -> &Target {
        &self.def.target
    }

    pub fn run_id(&self) -> u32 {
        self.def.run_id
    }

    pub fn workdir(&self) -> PathBuf {
        self.def.workdir()
    }

    pub fn exit_requested(&self) -> bool {
        self.shared.exit_requested()
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<Instant> {
        self.shared.finished_at.get().copied()
    }

    /// How long the job ran, or has been running so far.
    pub fn elapsed(&self) -> Option<Duration> {
        let started = self.started_at?;
        let end = self.finished_at().unwrap_or_else(Instant::now);
        Some(end.saturating_duration_since(started))
    }
}

impl CampaignJob for FuzzingJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn cores(&self) -> usize {
        self.def.cores
    }

    fn state(&self) -> JobState {
        self.shared.state()
    }

    fn start(&mut self) -> Result<(), JobError> {
        let state = self.state();
        if state != JobState::Ready {
            return Err(JobError::NotReady {
                name: self.name.clone(),
                state,
            });
        }
        info!(self.log, "Starting fuzzing job"; "cores" => self.def.cores);
        self.shared.set_state(JobState::Fuzzing);
        self.started_at = Some(Instant::now());

        let worker = Worker {
            def: Arc::clone(&self.def),
            name: self.name.clone(),
            ctx: Arc::clone(&self.ctx),
            shared: Arc::clone(&self.shared),
            log: self.log.clone(),
            processes: Vec::new(),
        };
        let spawned = std::thread::Builder::new()
            .name(format!("job-{}", self.def.suffix()))
            .spawn(move || worker.run());
        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                error!(self.log, "Failed to spawn worker thread"; "error" => %e);
                self.shared.finish(JobState::Failed);
                Err(JobError::Thread(e))
            }
        }
    }

    fn request_exit(&self) {
        info!(self.log, "Got exit request");
        self.shared.exit_requested.store(true, Ordering::SeqCst);
    }

    fn join(&mut self) {
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                error!(self.log, "Worker thread ended abnormally");
                self.shared.finish(JobState::Failed);
            }
        }
    }
}

impl fmt::Display for FuzzingJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FuzzingJob(fuzzer={}, target={}, run_id={})",
            self.def.fuzzer,
            self.def.target.name(),
            self.def.run_id
        )
    }
}

/// State owned by a job's thread. The processes never leave it.
struct Worker {
    def: Arc<JobDef>,
    name: String,
    ctx: Arc<JobContext>,
    shared: Arc<JobShared>,
    log: Logger,
    processes: Vec<ToolProcess>,
}

impl Worker {
    fn run(mut self) {
        let outcome = match catch_unwind(AssertUnwindSafe(|| self.execute())) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic type".to_string()
                };
                Err(JobError::Panicked(msg))
            }
        };

        let final_state = match outcome {
            Ok(()) if !self.shared.exit_requested() => {
                info!(self.log, "Job finished");
                JobState::Finished
            }
            Ok(()) => {
                info!(self.log, "Exit requested after the job completed");
                self.terminate();
                JobState::ExitRequested
            }
            Err(JobError::Interrupted) => {
                warn!(self.log, "Interrupted while executing worker, produced data is lost");
                self.terminate();
                JobState::ExitRequested
            }
            Err(e) => {
                warn!(self.log, "Error while executing worker"; "error" => %e);
                self.terminate();
                if self.shared.exit_requested() {
                    JobState::ExitRequested
                } else {
                    JobState::Failed
                }
            }
        };
        self.shared.finish(final_state);
    }

    fn execute(&mut self) -> Result<(), JobError> {
        let workdir = self.def.workdir();
        info!(self.log, "Purging workdir"; "workdir" => %workdir.display());
        sync::purge_dir(&workdir)?;

        let plan = self.def.fuzzer.launch_plan(self.def.cores);
        for invocation in &plan.invocations {
            self.launch(invocation)?;
        }
        if plan.settle_after_launch {
            self.sleep_observing_exit(self.ctx.timings.launch_settle())?;
        }
        self.sleep_observing_exit(self.ctx.timings.startup_grace())?;

        if plan.companion_cores > 0 {
            self.launch(&companion_invocation(plan.companion_cores))?;
        }

        self.supervise_fuzzers()?;
        self.run_tracing()?;
        self.sync_results(&workdir)?;
        Ok(())
    }

    fn launch(&mut self, invocation: &ToolInvocation) -> Result<usize, JobError> {
        let command = self.def.tool_command(&self.ctx.tool, invocation);
        let log_path = self
            .ctx
            .sinks
            .process_log_path(&self.name, invocation.role);
        info!(self.log, "Launching process";
            "role" => invocation.role,
            "command" => command.join(" "));
        let process = ToolProcess::spawn(invocation.role, command, &log_path)?;
        debug!(self.log, "Process started"; "role" => invocation.role, "pid" => process.pid());
        self.processes.push(process);
        Ok(self.processes.len() - 1)
    }

    fn check_exit(&self) -> Result<(), JobError> {
        if self.shared.exit_requested() {
            self.shared.set_state(JobState::ExitRequested);
            return Err(JobError::Interrupted);
        }
        Ok(())
    }

    fn sleep_observing_exit(&self, duration: Duration) -> Result<(), JobError> {
        let deadline = Instant::now() + duration;
        loop {
            self.check_exit()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep(self.ctx.timings.job_poll().min(deadline - now));
        }
    }

    fn supervise_fuzzers(&mut self) -> Result<(), JobError> {
        loop {
            std::thread::sleep(self.ctx.timings.job_poll());
            self.check_exit()?;
            let mut all_exited = true;
            for process in self.processes.iter_mut() {
                if !process.has_exited()? {
                    all_exited = false;
                }
            }
            if all_exited {
                break;
            }
        }
        for process in &self.processes {
            if let Some(status) = process.exit_status() {
                if !status.success() {
                    warn!(self.log, "Fuzzing process exited unsuccessfully";
                        "role" => process.role(),
                        "status" => describe_exit(&status));
                }
            }
        }
        Ok(())
    }

    fn run_tracing(&mut self) -> Result<(), JobError> {
        info!(self.log, "Starting tracing");
        self.shared.set_state(JobState::CoverageTracing);
        let idx = self.launch(&tracer_invocation(self.def.cores))?;

        let status = loop {
            self.check_exit()?;
            if let Some(status) = self.processes[idx].poll()? {
                break status;
            }
            std::thread::sleep(self.ctx.timings.job_poll());
        };
        if !status.success() {
            return Err(JobError::TracerFailed(describe_exit(&status)));
        }
        info!(self.log, "Tracing finished");
        Ok(())
    }

    fn sync_results(&self, workdir: &Path) -> Result<(), JobError> {
        self.shared.set_state(JobState::SyncingResults);
        let results = &self.ctx.results_dir;
        info!(self.log, "Syncing traces";
            "src" => %workdir.display(),
            "dst" => %results.display());
        let stats = sync::sync_traces(workdir, results)?;
        if stats.files == 0 {
            warn!(self.log, "No traces found to sync");
        }
        info!(self.log, "Syncing finished"; "files" => stats.files, "bytes" => stats.bytes);
        Ok(())
    }

    /// Signals every launched process once, then waits for each with the
    /// termination timeout. A process that outlives the wait is reported and
    /// left alone.
    fn terminate(&mut self) {
        info!(self.log, "Terminating worker"; "processes" => self.processes.len());
        let kill_command = &self.ctx.tool.kill_command;
        for process in self.processes.iter_mut() {
            if let Err(e) = process.terminate(kill_command) {
                warn!(self.log, "Failed to signal process";
                    "role" => process.role(),
                    "error" => %e);
            }
        }
        let timeout = self.ctx.timings.termination_timeout();
        for process in self.processes.iter_mut() {
            match process.wait_timeout(timeout) {
                Ok(WaitOutcome::Exited(status)) => {
                    debug!(self.log, "Process exited";
                        "role" => process.role(),
                        "status" => describe_exit(&status));
                }
                Ok(WaitOutcome::TimedOut) => {
                    error!(self.log, "Process still running after termination timeout";
                        "role" => process.role(),
                        "pid" => process.pid(),
                        "timeout_s" => timeout.as_secs());
                }
                Err(e) => {
                    warn!(self.log, "Failed to wait for process";
                        "role" => process.role(),
                        "error" => %e);
                }
            }
        }
    }
}
