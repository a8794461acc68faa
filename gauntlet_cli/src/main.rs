mod env_check;

use gauntlet_core::campaign::{EvaluationCampaign, RunOutcome};
use gauntlet_core::config::CampaignConfig;
use gauntlet_core::logging::LogSinks;
use gauntlet_core::summary::CampaignSummary;

use anyhow::Context;
use clap::Parser;
use slog::{error, info, warn};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Runs a fuzzer evaluation campaign", long_about = None)]
struct Cli {
    #[clap(short, long, value_parser, default_value = "campaign.toml")]
    config_file: PathBuf,
    /// Recreated on every run.
    #[clap(short, long, value_parser, default_value = "logs")]
    log_dir: PathBuf,
    /// Answer yes to every environment check prompt.
    #[clap(short, long)]
    yes: bool,
    /// Skip both the host checks and the kernel tuning.
    #[clap(long)]
    skip_env_check: bool,
    /// Leave core_pattern, suid_dumpable and the scaling governor untouched.
    #[clap(long)]
    no_tune_host: bool,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let sinks = LogSinks::init(&cli.log_dir)
        .with_context(|| format!("Failed to set up log directory {:?}", cli.log_dir))?;
    let log = sinks.main();

    if cli.skip_env_check {
        warn!(log, "Skipping environment check");
    } else {
        env_check::check_env(&log, cli.yes)?;
        if cli.no_tune_host {
            warn!(log, "Leaving kernel settings untouched, AFL++ may refuse to start");
        } else {
            env_check::tune_host(&log)?;
        }
    }

    info!(log, "Loading configuration"; "path" => %cli.config_file.display());
    let config = match CampaignConfig::load_from_file(&cli.config_file) {
        Ok(config) => config,
        Err(e) => {
            error!(log, "Invalid configuration: {}", e);
            return Err(e).with_context(|| format!("Failed to load {:?}", cli.config_file));
        }
    };
    info!(log, "Configuration loaded";
        "timeout_s" => config.timeout_s,
        "runs" => format!("{}..={}", config.first_run_id, config.last_run_id),
        "targets" => config.targets.len(),
        "cores_total" => config.cores_total,
        "cores_per_target" => config.cores_per_target,
        "planned_jobs" => config.planned_job_count());

    let mut campaign: EvaluationCampaign =
        EvaluationCampaign::new(&config, &sinks).context("Failed to set up campaign")?;

    let shutdown = campaign.shutdown_handle();
    ctrlc::set_handler(move || shutdown.request()).context("Failed to install Ctrl-C handler")?;

    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| campaign.run()));
    let result = match outcome {
        Ok(RunOutcome::Completed) => Ok(()),
        Ok(RunOutcome::Interrupted) => {
            info!(log, "Got interrupt, stopping all jobs");
            campaign.stop_and_join();
            Ok(())
        }
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            error!(log, "Unexpected error in control loop: {}", msg);
            campaign.stop_and_join();
            Err(anyhow::anyhow!("Campaign control loop panicked: {}", msg))
        }
    };

    let summary = CampaignSummary::from_campaign(&campaign);
    let summary_path = sinks.log_dir().join("summary.json");
    summary.write_json(&summary_path)?;
    for (state, count) in &summary.counts {
        info!(log, "Jobs in final state"; "state" => state.as_str(), "count" => *count);
    }
    if !summary.not_started.is_empty() {
        warn!(log, "Some jobs never started"; "count" => summary.not_started.len());
    }
    if summary.failed() > 0 {
        warn!(log, "Some jobs failed, see their scheduler logs"; "failed" => summary.failed());
    }
    if summary.all_finished() {
        info!(log, "Every job finished successfully");
    } else {
        warn!(log, "Campaign incomplete"; "completed" => summary.completed.len());
    }
    info!(log, "Summary written"; "path" => %summary_path.display());
    info!(log, "Exiting");

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_point_at_campaign_file_and_logs() {
        let cli = Cli::parse_from(["gauntlet"]);
        assert_eq!(cli.config_file, PathBuf::from("campaign.toml"));
        assert_eq!(cli.log_dir, PathBuf::from("logs"));
        assert!(!cli.yes && !cli.skip_env_check);
        assert!(!cli.no_tune_host, "host tuning must be on by default");
    }

    #[test]
    fn flags_are_parsed() {
        let cli = Cli::parse_from(["gauntlet", "-c", "eval.toml", "--yes", "--no-tune-host"]);
        assert_eq!(cli.config_file, PathBuf::from("eval.toml"));
        assert!(cli.yes);
        assert!(cli.no_tune_host);
    }

    #[test]
    fn panic_payloads_are_rendered() {
        let err = std::panic::catch_unwind(|| panic!("boom {}", 1)).unwrap_err();
        assert_eq!(panic_message(err.as_ref()), "boom 1");
    }
}
