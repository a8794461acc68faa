use crate::variant::FuzzerKind;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating a campaign description.
///
/// All of these are fatal: they are reported before any job is started.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse campaign description: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid timeout {0:?}, expected <int><s|m|h|d> such as 60s or 4h")]
    InvalidTimeout(String),
    #[error("Unknown timeout suffix {suffix:?} in {timeout:?}, expected one of s, m, h, d")]
    UnknownTimeoutSuffix { timeout: String, suffix: char },
    #[error("Negative first/last run ids are not allowed (got {first}..={last})")]
    NegativeRunId { first: i64, last: i64 },
    #[error("first-run-id must be <= last-run-id (got {first} > {last})")]
    RunIdRange { first: i64, last: i64 },
    #[error("{field} must be >= 2 (got {value})")]
    CoreBudget { field: &'static str, value: i64 },
    #[error("cores-per-target ({per_target}) exceeds cores-total ({total}), no job could ever start")]
    CoresPerTargetExceedsTotal { per_target: usize, total: usize },
    #[error("Target {target:?} config {path:?}: {reason}")]
    TargetConfig {
        target: String,
        path: PathBuf,
        reason: String,
    },
    #[error("timings.{0} must be greater than zero")]
    InvalidTiming(&'static str),
    #[error("Failed to resolve path {path:?}: {source}")]
    ResolvePath {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetEntry {
    pub config: PathBuf,
}

/// How the external fuzzing driver is invoked and signalled.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ToolSettings {
    #[serde(default = "default_tool_binary")]
    pub binary: PathBuf,
    /// Prepended to every driver command, usually a privilege wrapper.
    #[serde(default = "default_command_prefix")]
    pub command_prefix: Vec<String>,
    /// Command used to signal a running process; its pid is appended.
    /// When empty the process is killed directly.
    #[serde(default = "default_kill_command")]
    pub kill_command: Vec<String>,
}

fn default_tool_binary() -> PathBuf {
    PathBuf::from("~/fuzztruction/target/debug/fuzztruction")
}

fn default_command_prefix() -> Vec<String> {
    vec!["/usr/bin/sudo".to_string()]
}

fn default_kill_command() -> Vec<String> {
    vec!["/usr/bin/sudo".to_string(), "kill".to_string()]
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            binary: default_tool_binary(),
            command_prefix: default_command_prefix(),
            kill_command: default_kill_command(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct Timings {
    #[serde(default = "default_scheduler_poll_ms")]
    pub scheduler_poll_ms: u64,
    #[serde(default = "default_job_poll_ms")]
    pub job_poll_ms: u64,
    /// Time given to freshly spawned fuzzers before the companion starts.
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,
    /// Extra wait after launching WEIZZ or SYMCC, before the startup grace.
    #[serde(default = "default_launch_settle_ms")]
    pub launch_settle_ms: u64,
    /// Upper bound on waiting for a signalled process to exit.
    #[serde(default = "default_termination_timeout_s")]
    pub termination_timeout_s: u64,
}

fn default_scheduler_poll_ms() -> u64 {
    3000
}
fn default_job_poll_ms() -> u64 {
    1000
}
fn default_startup_grace_ms() -> u64 {
    10_000
}
fn default_launch_settle_ms() -> u64 {
    5000
}
fn default_termination_timeout_s() -> u64 {
    60
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            scheduler_poll_ms: default_scheduler_poll_ms(),
            job_poll_ms: default_job_poll_ms(),
            startup_grace_ms: default_startup_grace_ms(),
            launch_settle_ms: default_launch_settle_ms(),
            termination_timeout_s: default_termination_timeout_s(),
        }
    }
}

impl Timings {
    pub fn scheduler_poll(&self) -> Duration {
        Duration::from_millis(self.scheduler_poll_ms)
    }
    pub fn job_poll(&self) -> Duration {
        Duration::from_millis(self.job_poll_ms)
    }
    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }
    pub fn launch_settle(&self) -> Duration {
        Duration::from_millis(self.launch_settle_ms)
    }
    pub fn termination_timeout(&self) -> Duration {
        Duration::from_secs(self.termination_timeout_s)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler_poll_ms == 0 {
            return Err(ConfigError::InvalidTiming("scheduler-poll-ms"));
        }
        if self.job_poll_ms == 0 {
            return Err(ConfigError::InvalidTiming("job-poll-ms"));
        }
        if self.termination_timeout_s == 0 {
            return Err(ConfigError::InvalidTiming("termination-timeout-s"));
        }
        Ok(())
    }
}

/// The campaign file exactly as written on disk.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CampaignFile {
    pub timeout: String,
    pub first_run_id: i64,
    pub last_run_id: i64,
    pub fuzzers: Vec<FuzzerKind>,
    pub cores_total: i64,
    pub cores_per_target: i64,
    pub results_path: PathBuf,
    #[serde(default)]
    pub targets: BTreeMap<String, TargetEntry>,
    #[serde(default)]
    pub tool: ToolSettings,
    #[serde(default)]
    pub timings: Timings,
}

/// The subset of the external tool's per-target YAML config we rely on.
#[derive(Deserialize, Debug)]
struct TargetToolConfig {
    #[serde(rename = "work-directory")]
    work_directory: PathBuf,
}

/// An evaluation subject. The working directory is read from the target's
/// own config once, at load time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    name: String,
    config: PathBuf,
    workdir: PathBuf,
}

impl Target {
    pub fn new(name: impl Into<String>, config: PathBuf, workdir: PathBuf) -> Self {
        Self {
            name: name.into(),
            config,
            workdir,
        }
    }

    pub fn load(name: &str, config: &Path) -> Result<Self, ConfigError> {
        let config = resolve_path(config)?;
        let target_error = |reason: String| ConfigError::TargetConfig {
            target: name.to_string(),
            path: config.clone(),
            reason,
        };
        let content = std::fs::read_to_string(&config).map_err(|e| target_error(e.to_string()))?;
        let parsed: TargetToolConfig =
            serde_yaml::from_str(&content).map_err(|e| target_error(e.to_string()))?;
        let workdir = expand_home(&parsed.work_directory);
        Ok(Self::new(name, config, workdir))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &Path {
        &self.config
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }
}

/// A resolved and validated campaign description.
#[derive(Debug, Clone)]
pub struct CampaignConfig {
    pub timeout_s: u64,
    pub first_run_id: u32,
    pub last_run_id: u32,
    pub fuzzers: Vec<FuzzerKind>,
    pub cores_total: usize,
    pub cores_per_target: usize,
    pub results_path: PathBuf,
    pub targets: Vec<Target>,
    pub tool: ToolSettings,
    pub timings: Timings,
}

impl CampaignConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: CampaignFile = toml::from_str(content)?;
        Self::from_campaign_file(file)
    }

    pub fn from_campaign_file(file: CampaignFile) -> Result<Self, ConfigError> {
        let timeout_s = parse_timeout_as_seconds(&file.timeout)?;

        let (first, last) = (file.first_run_id, file.last_run_id);
        if first < 0 || last < 0 {
            return Err(ConfigError::NegativeRunId { first, last });
        }
        if last < first {
            return Err(ConfigError::RunIdRange { first, last });
        }
        let first_run_id =
            u32::try_from(first).map_err(|_| ConfigError::RunIdRange { first, last })?;
        let last_run_id =
            u32::try_from(last).map_err(|_| ConfigError::RunIdRange { first, last })?;

        let cores_total = validate_cores("cores-total", file.cores_total)?;
        let cores_per_target = validate_cores("cores-per-target", file.cores_per_target)?;
        if cores_per_target > cores_total {
            return Err(ConfigError::CoresPerTargetExceedsTotal {
                per_target: cores_per_target,
                total: cores_total,
            });
        }

        file.timings.validate()?;

        let results_path = resolve_path(&file.results_path)?;
        let targets = file
            .targets
            .iter()
            .map(|(name, entry)| Target::load(name, &entry.config))
            .collect::<Result<Vec<_>, _>>()?;

        let tool = ToolSettings {
            binary: resolve_path(&file.tool.binary)?,
            ..file.tool
        };

        Ok(Self {
            timeout_s,
            first_run_id,
            last_run_id,
            fuzzers: file.fuzzers,
            cores_total,
            cores_per_target,
            results_path,
            targets,
            tool,
            timings: file.timings,
        })
    }

    /// Number of (run id, fuzzer, target) combinations before unsupported
    /// pairs are filtered out.
    pub fn planned_job_count(&self) -> usize {
        let runs = (self.last_run_id - self.first_run_id) as usize + 1;
        runs * self.fuzzers.len() * self.targets.len()
    }
}

fn validate_cores(field: &'static str, value: i64) -> Result<usize, ConfigError> {
    if value < 2 {
        return Err(ConfigError::CoreBudget { field, value });
    }
    usize::try_from(value).map_err(|_| ConfigError::CoreBudget { field, value })
}

/// Parses a timeout such as `60s`, `12m`, `4h` or `1d` into seconds.
pub fn parse_timeout_as_seconds(timeout: &str) -> Result<u64, ConfigError> {
    let trimmed = timeout.trim();
    let invalid = || ConfigError::InvalidTimeout(timeout.to_string());

    let (split_at, suffix) = trimmed.char_indices().last().ok_or_else(invalid)?;
    let digits = &trimmed[..split_at];
    if digits.is_empty() || digits.starts_with('0') || !digits.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(invalid());
    }
    let value: u64 = digits.parse().map_err(|_| invalid())?;

    let factor = match suffix {
        's' => 1,
        'm' => 60,
        'h' => 3600,
        'd' => 3600 * 24,
        other => {
            return Err(ConfigError::UnknownTimeoutSuffix {
                timeout: timeout.to_string(),
                suffix: other,
            });
        }
    };
    value.checked_mul(factor).ok_or_else(invalid)
}

/// Replaces a leading `~` with `$HOME`.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Expands `~` and anchors relative paths at the current directory.
/// The path does not have to exist.
pub fn resolve_path(path: &Path) -> Result<PathBuf, ConfigError> {
    let expanded = expand_home(path);
    if expanded.is_absolute() {
        return Ok(expanded);
    }
    let cwd = std::env::current_dir().map_err(|source| ConfigError::ResolvePath {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(cwd.join(expanded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_target_config(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(format!("{name}.yml"));
        let workdir = dir.path().join(format!("work-{name}"));
        fs::write(
            &path,
            format!(
                "work-directory: {}\ninput-directory: /seeds\n",
                workdir.display()
            ),
        )
        .expect("write target config");
        path
    }

    fn campaign_toml(dir: &TempDir, extra: &str) -> String {
        let png = write_target_config(dir, "pngtopng");
        let zip = write_target_config(dir, "7zip_7zip");
        format!(
            r#"
timeout = "12m"
first-run-id = 0
last-run-id = 2
fuzzers = ["Fuzztruction", "SYMCC"]
cores-total = 8
cores-per-target = 4
results-path = "{results}"
{extra}

[targets.pngtopng]
config = "{png}"

[targets."7zip_7zip"]
config = "{zip}"
"#,
            results = dir.path().join("results").display(),
            png = png.display(),
            zip = zip.display(),
        )
    }

    #[test]
    fn timeout_suffixes_convert_to_seconds() {
        assert_eq!(parse_timeout_as_seconds("60s").unwrap(), 60);
        assert_eq!(parse_timeout_as_seconds("12m").unwrap(), 720);
        assert_eq!(parse_timeout_as_seconds("4h").unwrap(), 14_400);
        assert_eq!(parse_timeout_as_seconds("1d").unwrap(), 86_400);
    }

    #[test]
    fn timeout_with_unknown_suffix_is_rejected_with_the_suffix_named() {
        match parse_timeout_as_seconds("10w") {
            Err(ConfigError::UnknownTimeoutSuffix { suffix, .. }) => assert_eq!(suffix, 'w'),
            other => panic!("Expected UnknownTimeoutSuffix, got {other:?}"),
        }
        let msg = parse_timeout_as_seconds("10w").unwrap_err().to_string();
        assert!(msg.contains("'w'"), "Unexpected message: {msg}");
    }

    #[test]
    fn malformed_timeouts_are_rejected() {
        for bad in ["", "s", "0s", "012m", "-5s", "1.5h", "h4", "99999999999999999999d"] {
            assert!(
                matches!(
                    parse_timeout_as_seconds(bad),
                    Err(ConfigError::InvalidTimeout(_))
                ),
                "{bad:?} should be an invalid timeout"
            );
        }
    }

    #[test]
    fn full_campaign_file_is_resolved() {
        let dir = TempDir::new().unwrap();
        let config = CampaignConfig::from_toml_str(&campaign_toml(&dir, "")).unwrap();

        assert_eq!(config.timeout_s, 720);
        assert_eq!((config.first_run_id, config.last_run_id), (0, 2));
        assert_eq!(
            config.fuzzers,
            vec![FuzzerKind::Fuzztruction, FuzzerKind::Symcc]
        );
        assert_eq!(config.cores_total, 8);
        assert_eq!(config.cores_per_target, 4);
        assert_eq!(config.targets.len(), 2);
        // Sorted by name.
        assert_eq!(config.targets[0].name(), "7zip_7zip");
        assert_eq!(config.targets[1].name(), "pngtopng");
        assert_eq!(
            config.targets[1].workdir(),
            dir.path().join("work-pngtopng").as_path()
        );
        assert_eq!(config.tool.command_prefix, vec!["/usr/bin/sudo"]);
        assert_eq!(config.timings, Timings::default());
        assert_eq!(config.planned_job_count(), 3 * 2 * 2);
    }

    #[test]
    fn tool_and_timing_sections_override_defaults() {
        let dir = TempDir::new().unwrap();
        let extra = r#"
[tool]
binary = "/opt/driver"
command-prefix = []
kill-command = []

[timings]
scheduler-poll-ms = 10
job-poll-ms = 20
startup-grace-ms = 0
launch-settle-ms = 250
"#;
        let config = CampaignConfig::from_toml_str(&campaign_toml(&dir, extra)).unwrap();
        assert_eq!(config.tool.binary, PathBuf::from("/opt/driver"));
        assert!(config.tool.command_prefix.is_empty());
        assert!(config.tool.kill_command.is_empty());
        assert_eq!(config.timings.scheduler_poll(), Duration::from_millis(10));
        assert_eq!(config.timings.job_poll(), Duration::from_millis(20));
        assert_eq!(config.timings.startup_grace(), Duration::ZERO);
        assert_eq!(config.timings.launch_settle(), Duration::from_millis(250));
        assert_eq!(config.timings.termination_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn example_campaign_file_uses_the_current_keys() {
        let file: CampaignFile =
            toml::from_str(include_str!("../../campaign.example.toml")).unwrap();
        assert_eq!(parse_timeout_as_seconds(&file.timeout).unwrap(), 86_400);
        assert_eq!((file.first_run_id, file.last_run_id), (0, 4));
        assert_eq!(file.fuzzers, FuzzerKind::ALL.to_vec());
        assert_eq!(file.targets.len(), 2);
        assert_eq!(file.tool, ToolSettings::default());
        assert_eq!(file.timings, Timings::default());
    }

    #[test]
    fn unknown_fuzzer_name_fails_to_parse() {
        let dir = TempDir::new().unwrap();
        let toml = campaign_toml(&dir, "").replace("\"SYMCC\"", "\"LibFuzzer\"");
        match CampaignConfig::from_toml_str(&toml) {
            Err(ConfigError::Parse(e)) => assert!(e.to_string().contains("LibFuzzer")),
            other => panic!("Expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn core_budget_and_run_range_are_validated() {
        let dir = TempDir::new().unwrap();
        let base = campaign_toml(&dir, "");

        let too_few = base.replace("cores-total = 8", "cores-total = 1");
        assert!(matches!(
            CampaignConfig::from_toml_str(&too_few),
            Err(ConfigError::CoreBudget {
                field: "cores-total",
                value: 1
            })
        ));

        let per_target = base.replace("cores-per-target = 4", "cores-per-target = 1");
        assert!(matches!(
            CampaignConfig::from_toml_str(&per_target),
            Err(ConfigError::CoreBudget {
                field: "cores-per-target",
                ..
            })
        ));

        let oversized = base.replace("cores-per-target = 4", "cores-per-target = 10");
        assert!(matches!(
            CampaignConfig::from_toml_str(&oversized),
            Err(ConfigError::CoresPerTargetExceedsTotal { .. })
        ));

        let reversed = base.replace("first-run-id = 0", "first-run-id = 3");
        assert!(matches!(
            CampaignConfig::from_toml_str(&reversed),
            Err(ConfigError::RunIdRange { first: 3, last: 2 })
        ));

        let negative = base.replace("first-run-id = 0", "first-run-id = -1");
        assert!(matches!(
            CampaignConfig::from_toml_str(&negative),
            Err(ConfigError::NegativeRunId { .. })
        ));
    }

    #[test]
    fn unreadable_target_config_fails_fast() {
        let dir = TempDir::new().unwrap();
        let toml = campaign_toml(&dir, "");
        fs::remove_file(dir.path().join("pngtopng.yml")).unwrap();
        match CampaignConfig::from_toml_str(&toml) {
            Err(ConfigError::TargetConfig { target, .. }) => assert_eq!(target, "pngtopng"),
            other => panic!("Expected TargetConfig error, got {other:?}"),
        }
    }

    #[test]
    fn target_config_without_work_directory_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.yml");
        fs::write(&path, "input-directory: /seeds\n").unwrap();
        assert!(matches!(
            Target::load("broken", &path),
            Err(ConfigError::TargetConfig { .. })
        ));
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let dir = TempDir::new().unwrap();
        let toml = campaign_toml(&dir, "\n[timings]\njob-poll-ms = 0\n");
        assert!(matches!(
            CampaignConfig::from_toml_str(&toml),
            Err(ConfigError::InvalidTiming("job-poll-ms"))
        ));
    }

    #[test]
    fn relative_paths_are_anchored_at_the_current_directory() {
        let resolved = resolve_path(Path::new("results/run")).unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("results/run"));
    }
}
