pub mod campaign;
pub mod config;
pub mod job;
pub mod logging;
pub mod process;
pub mod summary;
pub mod sync;
pub mod variant;

pub use campaign::{CampaignError, CoreBudget, EvaluationCampaign, RunOutcome, ShutdownHandle};
pub use config::{CampaignConfig, ConfigError, Target, Timings, ToolSettings, parse_timeout_as_seconds};
pub use job::{CampaignJob, FuzzingJob, JobContext, JobError, JobState};
pub use logging::LogSinks;
pub use process::{ProcessError, ToolProcess, WaitOutcome};
pub use summary::{CampaignSummary, JobSummary};
pub use sync::{SyncError, SyncStats, sync_traces};
pub use variant::{FuzzerKind, LaunchPlan, ToolInvocation};
