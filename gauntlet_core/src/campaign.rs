use crate::config::CampaignConfig;
use crate::job::{CampaignJob, FuzzingJob, JobContext, JobError, JobState};
use crate::logging::LogSinks;
use slog::{Logger, error, info, warn};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

const SHUTDOWN_CHECK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum CampaignError {
    #[error("cores per job ({per_job}) must be between 2 and the total budget ({total})")]
    Budget { per_job: usize, total: usize },
    #[error("Two jobs would share the working directory {0:?}")]
    DuplicateJob(String),
    #[error("Failed to create job: {0}")]
    Job(#[from] JobError),
}

/// The core budget the scheduler arbitrates. Purely bookkeeping: actual
/// host load is never inspected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreBudget {
    pub total: usize,
    pub per_job: usize,
}

impl CoreBudget {
    pub fn new(total: usize, per_job: usize) -> Result<Self, CampaignError> {
        if per_job < crate::job::MIN_JOB_CORES || per_job > total {
            return Err(CampaignError::Budget { per_job, total });
        }
        Ok(Self { total, per_job })
    }
}

/// Cloneable flag asking a running campaign loop to return.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every job was started and has reached FINISHED or FAILED.
    Completed,
    /// Shutdown was requested; running jobs are still running.
    Interrupted,
}

/// Expands targets x fuzzers x run ids into jobs and runs them under a
/// global core budget.
///
/// Only the thread driving the control loop touches the queues and the
/// allocation counter. Jobs are observed through `state()` at polling
/// cadence, never notified.
pub struct EvaluationCampaign<J: CampaignJob = FuzzingJob> {
    budget: CoreBudget,
    poll_interval: Duration,
    allocated_cores: usize,
    pending: VecDeque<J>,
    running: Vec<J>,
    completed: Vec<J>,
    shutdown: ShutdownHandle,
    log: Logger,
}

impl EvaluationCampaign<FuzzingJob> {
    pub fn new(config: &CampaignConfig, sinks: &LogSinks) -> Result<Self, CampaignError> {
        let log = sinks.main();
        let budget = CoreBudget::new(config.cores_total, config.cores_per_target)?;
        let ctx = Arc::new(JobContext {
            tool: config.tool.clone(),
            timings: config.timings.clone(),
            results_dir: config.results_path.clone(),
            sinks: sinks.clone(),
        });
        let jobs = Self::generate_jobs(config, ctx, &log)?;
        info!(log, "Campaign expanded";
            "jobs" => jobs.len(),
            "cores_total" => budget.total,
            "cores_per_job" => budget.per_job);
        Ok(Self::with_jobs(
            budget,
            config.timings.scheduler_poll(),
            jobs,
            log,
        ))
    }

    /// One job per run id, fuzzer and target, in that nesting order.
    /// Pairs a fuzzer cannot handle are skipped with a warning.
    pub fn generate_jobs(
        config: &CampaignConfig,
        ctx: Arc<JobContext>,
        log: &Logger,
    ) -> Result<Vec<FuzzingJob>, CampaignError> {
        let mut jobs = Vec::with_capacity(config.planned_job_count());
        let mut workdirs = HashSet::new();
        for run_id in config.first_run_id..=config.last_run_id {
            for fuzzer in &config.fuzzers {
                for target in &config.targets {
                    if !fuzzer.supports_target(target.name()) {
                        warn!(log, "Skipping unsupported target";
                            "fuzzer" => fuzzer.tag(),
                            "target" => target.name(),
                            "run_id" => run_id);
                        continue;
                    }
                    let job = FuzzingJob::new(
                        target.clone(),
                        run_id,
                        config.timeout_s,
                        config.cores_per_target,
                        *fuzzer,
                        Arc::clone(&ctx),
                    )?;
                    if !workdirs.insert(job.workdir()) {
                        return Err(CampaignError::DuplicateJob(
                            job.workdir().display().to_string(),
                        ));
                    }
                    jobs.push(job);
                }
            }
        }
        Ok(jobs)
    }
}

impl<J: CampaignJob> EvaluationCampaign<J> {
    pub fn with_jobs(
        budget: CoreBudget,
        poll_interval: Duration,
        jobs: impl IntoIterator<Item = J>,
        log: Logger,
    ) -> Self {
        Self {
            budget,
            poll_interval,
            allocated_cores: 0,
            pending: jobs.into_iter().collect(),
            running: Vec::new(),
            completed: Vec::new(),
            shutdown: ShutdownHandle::default(),
            log,
        }
    }

    pub fn budget(&self) -> CoreBudget {
        self.budget
    }

    pub fn allocated_cores(&self) -> usize {
        self.allocated_cores
    }

    pub fn pending(&self) -> impl Iterator<Item = &J> {
        self.pending.iter()
    }

    pub fn running(&self) -> &[J] {
        &self.running
    }

    pub fn completed(&self) -> &[J] {
        &self.completed
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Moves every running job that reached FINISHED or FAILED to the
    /// completed list and returns its cores. Jobs in EXIT_REQUESTED are left
    /// for `stop_and_join`.
    pub fn check_running_jobs(&mut self) -> usize {
        let mut reaped = 0;
        let mut idx = 0;
        while idx < self.running.len() {
            let state = self.running[idx].state();
            if !matches!(state, JobState::Finished | JobState::Failed) {
                idx += 1;
                continue;
            }
            let mut job = self.running.remove(idx);
            job.join();
            info!(self.log, "Job terminated"; "name" => job.name(), "state" => state.as_str());
            self.release(&job);
            self.completed.push(job);
            reaped += 1;
        }
        reaped
    }

    /// Starts pending jobs in FIFO order for as long as the budget allows.
    pub fn start_next_jobs(&mut self) -> usize {
        let mut admitted = 0;
        while !self.pending.is_empty()
            && self.allocated_cores + self.budget.per_job <= self.budget.total
        {
            let Some(mut job) = self.pending.pop_front() else {
                break;
            };
            if let Err(e) = job.start() {
                // The job is left in a terminal state and reaped on the next pass.
                error!(self.log, "Failed to start job"; "name" => job.name(), "error" => %e);
            }
            debug_assert_ne!(job.state(), JobState::Ready);
            self.running.push(job);
            self.allocated_cores += self.budget.per_job;
            admitted += 1;
            info!(self.log, "Allocated cores";
                "allocated" => self.allocated_cores,
                "total" => self.budget.total);
        }
        admitted
    }

    pub fn check_if_finished(&self) -> bool {
        self.pending.is_empty() && self.running.is_empty()
    }

    /// One pass of the control loop. Returns whether the campaign is done.
    pub fn tick(&mut self) -> bool {
        self.check_running_jobs();
        self.start_next_jobs();
        self.check_if_finished()
    }

    /// Drives the control loop until every job completed or shutdown was
    /// requested through a [`ShutdownHandle`].
    pub fn run(&mut self) -> RunOutcome {
        info!(self.log, "Starting campaign"; "pending" => self.pending.len());
        loop {
            if self.shutdown.is_requested() {
                info!(self.log, "Shutdown requested, leaving control loop");
                return RunOutcome::Interrupted;
            }
            if self.tick() {
                info!(self.log, "All jobs finished");
                return RunOutcome::Completed;
            }
            self.sleep_poll_interval();
        }
    }

    /// Asks every running job to exit, then joins them one by one. On
    /// return no running job is left and the allocation is back to zero.
    pub fn stop_and_join(&mut self) {
        info!(self.log, "Stopping running jobs"; "running" => self.running.len());
        for job in &self.running {
            job.request_exit();
        }
        let running = std::mem::take(&mut self.running);
        for mut job in running {
            job.join();
            info!(self.log, "Job stopped"; "name" => job.name(), "state" => job.state().as_str());
            self.release(&job);
            self.completed.push(job);
        }
    }

    /// Completed jobs per final state.
    pub fn state_counts(&self) -> BTreeMap<JobState, usize> {
        let mut counts = BTreeMap::new();
        for job in &self.completed {
            *counts.entry(job.state()).or_insert(0) += 1;
        }
        counts
    }

    fn release(&mut self, job: &J) {
        debug_assert!(self.allocated_cores >= self.budget.per_job);
        self.allocated_cores = self.allocated_cores.saturating_sub(self.budget.per_job);
        info!(self.log, "Released cores";
            "name" => job.name(),
            "allocated" => self.allocated_cores);
    }

    fn sleep_poll_interval(&self) {
        let deadline = Instant::now() + self.poll_interval;
        loop {
            let now = Instant::now();
            if now >= deadline || self.shutdown.is_requested() {
                return;
            }
            std::thread::sleep(SHUTDOWN_CHECK_INTERVAL.min(deadline - now));
        }
    }
}
