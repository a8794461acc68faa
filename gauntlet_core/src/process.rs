use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Empty command line")]
    EmptyCommand,
    #[error("Failed to open process log {path:?}: {source}")]
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to spawn command {command:?}: {source}")]
    Spawn {
        command: Vec<String>,
        source: std::io::Error,
    },
    #[error("Error waiting for process {pid}: {source}")]
    Wait { pid: u32, source: std::io::Error },
    #[error("Failed to signal process {pid}: {reason}")]
    Signal { pid: u32, reason: String },
}

/// Outcome of waiting on a signalled process with an upper bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited(ExitStatus),
    TimedOut,
}

/// An external process with stdin closed and both output streams sent to
/// a log file.
#[derive(Debug)]
pub struct ToolProcess {
    role: String,
    child: Child,
    exit_status: Option<ExitStatus>,
}

impl ToolProcess {
    pub fn spawn(
        role: impl Into<String>,
        command: Vec<String>,
        log_path: &Path,
    ) -> Result<Self, ProcessError> {
        let (program, args) = command.split_first().ok_or(ProcessError::EmptyCommand)?;

        let log_file = File::create(log_path).map_err(|source| ProcessError::LogFile {
            path: log_path.to_path_buf(),
            source,
        })?;
        let stderr = log_file
            .try_clone()
            .map_err(|source| ProcessError::LogFile {
                path: log_path.to_path_buf(),
                source,
            })?;

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                command: command.clone(),
                source,
            })?;

        Ok(Self {
            role: role.into(),
            child,
            exit_status: None,
        })
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Non-blocking check. Returns the exit status once the process is gone.
    pub fn poll(&mut self) -> Result<Option<ExitStatus>, ProcessError> {
        if self.exit_status.is_some() {
            return Ok(self.exit_status);
        }
        let pid = self.pid();
        let status = self
            .child
            .try_wait()
            .map_err(|source| ProcessError::Wait { pid, source })?;
        self.exit_status = status;
        Ok(status)
    }

    pub fn has_exited(&mut self) -> Result<bool, ProcessError> {
        Ok(self.poll()?.is_some())
    }

    /// Sends one termination signal.
    ///
    /// With a non-empty `kill_command` the pid is appended to it and the
    /// command is run to completion, which lets processes started through a
    /// privilege wrapper be signalled through the same wrapper. Otherwise the
    /// child is killed directly.
    pub fn terminate(&mut self, kill_command: &[String]) -> Result<(), ProcessError> {
        if self.poll()?.is_some() {
            return Ok(());
        }
        let pid = self.pid();
        match kill_command.split_first() {
            None => self.child.kill().map_err(|e| ProcessError::Signal {
                pid,
                reason: e.to_string(),
            }),
            Some((program, args)) => {
                let status = Command::new(program)
                    .args(args)
                    .arg(pid.to_string())
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .map_err(|e| ProcessError::Signal {
                        pid,
                        reason: e.to_string(),
                    })?;
                if status.success() || self.poll()?.is_some() {
                    Ok(())
                } else {
                    Err(ProcessError::Signal {
                        pid,
                        reason: format!("{kill_command:?} exited with {status}"),
                    })
                }
            }
        }
    }

    /// Waits at most `timeout` for the process to exit. Never signals.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<WaitOutcome, ProcessError> {
        let start_time = Instant::now();
        loop {
            if let Some(status) = self.poll()? {
                return Ok(WaitOutcome::Exited(status));
            }
            if start_time.elapsed() >= timeout {
                return Ok(WaitOutcome::TimedOut);
            }
            std::thread::sleep(WAIT_POLL_INTERVAL.min(timeout));
        }
    }
}

/// Describes an exit status for logs: `code 3`, `signal 9`, or `success`.
pub fn describe_exit(status: &ExitStatus) -> String {
    if status.success() {
        return "success".to_string();
    }
    if let Some(code) = status.code() {
        return format!("code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("signal {signal}");
        }
    }
    "abnormal exit".to_string()
}
