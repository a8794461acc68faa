use serde::{Deserialize, Serialize};
use std::fmt;

/// Targets the SymCC integration cannot build or run.
pub const SYMCC_UNSUPPORTED_TARGETS: &[&str] = &["7zip_7zip", "7zip-enc_7zip-dec", "sign_vfychain"];

/// The fuzzing-tool variants a campaign can evaluate.
///
/// The serialized names are the ones used in campaign files and in the
/// working-directory suffix of every job, so they must stay stable.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FuzzerKind {
    #[serde(rename = "Fuzztruction")]
    Fuzztruction,
    #[serde(rename = "Fuzztruction-No-AFL")]
    FuzztructionNoAfl,
    #[serde(rename = "AFL++")]
    AflPlusPlus,
    #[serde(rename = "WEIZZ")]
    Weizz,
    #[serde(rename = "SYMCC")]
    Symcc,
}

/// Sub-command of the fuzzing driver a process is started with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolMode {
    Fuzz,
    Aflpp,
    Tracer,
}

impl ToolMode {
    pub fn as_arg(&self) -> &'static str {
        match self {
            ToolMode::Fuzz => "fuzz",
            ToolMode::Aflpp => "aflpp",
            ToolMode::Tracer => "tracer",
        }
    }
}

/// One external process a job has to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    /// Short label used for the process log file, e.g. `ftworker`.
    pub role: &'static str,
    pub mode: ToolMode,
    /// Value passed to `-j`.
    pub jobs: usize,
    /// Arguments appended after `-j <jobs>`.
    pub extra_args: Vec<String>,
}

/// What a variant launches for a given core budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub invocations: Vec<ToolInvocation>,
    /// Cores left for the generic AFL++ companion process. Zero means none.
    pub companion_cores: usize,
    /// Whether the variant's own processes need extra settle time after
    /// launch, before the shared startup grace begins.
    pub settle_after_launch: bool,
}

impl FuzzerKind {
    pub const ALL: [FuzzerKind; 5] = [
        FuzzerKind::Fuzztruction,
        FuzzerKind::FuzztructionNoAfl,
        FuzzerKind::AflPlusPlus,
        FuzzerKind::Weizz,
        FuzzerKind::Symcc,
    ];

    /// Name used in campaign files and working-directory suffixes.
    pub fn tag(&self) -> &'static str {
        match self {
            FuzzerKind::Fuzztruction => "Fuzztruction",
            FuzzerKind::FuzztructionNoAfl => "Fuzztruction-No-AFL",
            FuzzerKind::AflPlusPlus => "AFL++",
            FuzzerKind::Weizz => "WEIZZ",
            FuzzerKind::Symcc => "SYMCC",
        }
    }

    pub fn supports_target(&self, target_name: &str) -> bool {
        match self {
            FuzzerKind::Symcc => !SYMCC_UNSUPPORTED_TARGETS.contains(&target_name),
            _ => true,
        }
    }

    /// Splits `cores` between the variant's own processes and the companion.
    ///
    /// Halving rounds the primary share down; the companion (or the AFL++
    /// side of a combined process) gets the remainder.
    pub fn launch_plan(&self, cores: usize) -> LaunchPlan {
        match self {
            FuzzerKind::Fuzztruction => {
                let ft_cores = cores / 2;
                LaunchPlan {
                    invocations: vec![ToolInvocation {
                        role: "ftworker",
                        mode: ToolMode::Fuzz,
                        jobs: ft_cores,
                        extra_args: Vec::new(),
                    }],
                    companion_cores: cores - ft_cores,
                    settle_after_launch: false,
                }
            }
            FuzzerKind::FuzztructionNoAfl => LaunchPlan {
                invocations: vec![ToolInvocation {
                    role: "ftworker",
                    mode: ToolMode::Fuzz,
                    jobs: cores,
                    extra_args: Vec::new(),
                }],
                companion_cores: 0,
                settle_after_launch: false,
            },
            FuzzerKind::AflPlusPlus => LaunchPlan {
                invocations: Vec::new(),
                companion_cores: cores,
                settle_after_launch: false,
            },
            FuzzerKind::Weizz => LaunchPlan {
                invocations: vec![ToolInvocation {
                    role: "weizz",
                    mode: ToolMode::Aflpp,
                    jobs: 0,
                    extra_args: vec!["--weizz-jobs".to_string(), cores.to_string()],
                }],
                companion_cores: 0,
                settle_after_launch: true,
            },
            FuzzerKind::Symcc => {
                let symcc_jobs = cores / 2;
                LaunchPlan {
                    invocations: vec![ToolInvocation {
                        role: "symcc",
                        mode: ToolMode::Aflpp,
                        jobs: cores - symcc_jobs,
                        extra_args: vec!["--symcc-jobs".to_string(), symcc_jobs.to_string()],
                    }],
                    companion_cores: 0,
                    settle_after_launch: true,
                }
            }
        }
    }
}

impl fmt::Display for FuzzerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// The AFL++ process started with whatever cores a variant left over.
pub fn companion_invocation(cores: usize) -> ToolInvocation {
    ToolInvocation {
        role: "aflworker",
        mode: ToolMode::Aflpp,
        jobs: cores,
        extra_args: Vec::new(),
    }
}

/// Coverage replay over all of a job's cores.
pub fn tracer_invocation(cores: usize) -> ToolInvocation {
    ToolInvocation {
        role: "tracing",
        mode: ToolMode::Tracer,
        jobs: cores,
        extra_args: Vec::new(),
    }
}
