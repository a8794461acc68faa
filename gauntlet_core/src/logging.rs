use crate::sync::{SyncError, ensure_dir, purge_dir};
use slog::{Drain, Logger, o};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

type FileDrain = slog::IgnoreResult<slog_term::FullFormat<slog_term::PlainSyncDecorator<File>>>;

fn file_drain(path: &Path) -> io::Result<FileDrain> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let decorator = slog_term::PlainSyncDecorator::new(file);
    Ok(slog_term::FullFormat::new(decorator).build().ignore_res())
}

/// Process-wide and per-job log sinks rooted in one log directory.
///
/// Everything goes to stderr and `main.log`; each job additionally gets
/// `<job>-scheduler.log`. Records carry a `job` key naming their origin.
#[derive(Clone)]
pub struct LogSinks {
    root: Logger,
    log_dir: PathBuf,
    job_files: bool,
}

impl LogSinks {
    /// Wipes and recreates `log_dir`, then opens `main.log` inside it.
    pub fn init(log_dir: &Path) -> Result<Self, SyncError> {
        purge_dir(log_dir)?;
        ensure_dir(log_dir)?;

        let main_log = log_dir.join("main.log");
        let file = file_drain(&main_log).map_err(|source| SyncError::Io {
            path: main_log,
            source,
        })?;
        let term = slog_term::FullFormat::new(slog_term::PlainSyncDecorator::new(io::stderr()))
            .build()
            .ignore_res();

        let root = Logger::root(slog::Duplicate::new(term, file).ignore_res(), o!());
        Ok(Self {
            root,
            log_dir: log_dir.to_path_buf(),
            job_files: true,
        })
    }

    /// Sinks that drop every record. Process output still goes to files
    /// under `log_dir`.
    pub fn discard(log_dir: &Path) -> Self {
        Self {
            root: Logger::root(slog::Discard, o!()),
            log_dir: log_dir.to_path_buf(),
            job_files: false,
        }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn main(&self) -> Logger {
        self.root.new(o!("job" => "Main"))
    }

    /// Logger for one job. Falls back to the shared sinks alone if the
    /// job's own file cannot be opened.
    pub fn for_job(&self, job_name: &str) -> Logger {
        if !self.job_files {
            return self.root.new(o!("job" => job_name.to_string()));
        }
        let path = self.log_dir.join(format!("{job_name}-scheduler.log"));
        match file_drain(&path) {
            Ok(file) => Logger::root(
                slog::Duplicate::new(self.root.clone(), file).ignore_res(),
                o!("job" => job_name.to_string()),
            ),
            Err(e) => {
                let log = self.root.new(o!("job" => job_name.to_string()));
                slog::warn!(log, "Cannot open job log"; "path" => ?path, "error" => %e);
                log
            }
        }
    }

    /// Path for the captured output of one of a job's processes.
    pub fn process_log_path(&self, job_name: &str, role: &str) -> PathBuf {
        self.log_dir.join(format!("{job_name}-{role}.log"))
    }
}
