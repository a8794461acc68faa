use crate::campaign::EvaluationCampaign;
use crate::job::{CampaignJob, FuzzingJob, JobState};
use crate::variant::FuzzerKind;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct JobSummary {
    pub name: String,
    pub fuzzer: FuzzerKind,
    pub target: String,
    pub run_id: u32,
    pub state: JobState,
    pub elapsed_s: Option<f64>,
}

impl JobSummary {
    pub fn from_job(job: &FuzzingJob) -> Self {
        Self {
            name: job.name().to_string(),
            fuzzer: job.fuzzer(),
            target: job.target().name().to_string(),
            run_id: job.run_id(),
            state: job.state(),
            elapsed_s: job.elapsed().map(|d| d.as_secs_f64()),
        }
    }
}

/// What the campaign leaves for whoever judges its success: the final state
/// of every completed job, plus the jobs that never started.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct CampaignSummary {
    pub completed: Vec<JobSummary>,
    pub not_started: Vec<String>,
    pub counts: BTreeMap<JobState, usize>,
}

impl CampaignSummary {
    pub fn from_campaign(campaign: &EvaluationCampaign<FuzzingJob>) -> Self {
        Self {
            completed: campaign.completed().iter().map(JobSummary::from_job).collect(),
            not_started: campaign.pending().map(|j| j.name().to_string()).collect(),
            counts: campaign.state_counts(),
        }
    }

    pub fn failed(&self) -> usize {
        self.counts.get(&JobState::Failed).copied().unwrap_or(0)
    }

    pub fn all_finished(&self) -> bool {
        self.not_started.is_empty()
            && self.completed.iter().all(|j| j.state == JobState::Finished)
    }

    pub fn write_json(&self, path: &Path) -> Result<(), anyhow::Error> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| anyhow::anyhow!("Failed to serialize campaign summary: {}", e))?;
        std::fs::write(path, json)
            .map_err(|e| anyhow::anyhow!("Failed to write summary to {:?}: {}", path, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(states: &[JobState], not_started: &[&str]) -> CampaignSummary {
        let completed: Vec<JobSummary> = states
            .iter()
            .enumerate()
            .map(|(i, state)| JobSummary {
                name: format!("pngtopng-AFL++-60s-{i}"),
                fuzzer: FuzzerKind::AflPlusPlus,
                target: "pngtopng".to_string(),
                run_id: i as u32,
                state: *state,
                elapsed_s: Some(60.5),
            })
            .collect();
        let mut counts = BTreeMap::new();
        for s in states {
            *counts.entry(*s).or_insert(0) += 1;
        }
        CampaignSummary {
            completed,
            not_started: not_started.iter().map(|s| s.to_string()).collect(),
            counts,
        }
    }

    #[test]
    fn json_uses_external_names_for_states_and_fuzzers() {
        let s = summary(&[JobState::Finished, JobState::Failed], &[]);
        let value = serde_json::to_value(&s).unwrap();
        assert_eq!(value["completed"][0]["state"], "FINISHED");
        assert_eq!(value["completed"][1]["fuzzer"], "AFL++");
        assert_eq!(value["counts"]["FAILED"], 1);
    }

    #[test]
    fn success_requires_every_job_finished_and_started() {
        assert!(summary(&[JobState::Finished, JobState::Finished], &[]).all_finished());
        let with_failure = summary(&[JobState::Finished, JobState::Failed], &[]);
        assert!(!with_failure.all_finished());
        assert_eq!(with_failure.failed(), 1);
        assert!(!summary(&[JobState::Finished], &["later-job"]).all_finished());
    }

    #[test]
    fn summary_is_written_to_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("summary.json");
        summary(&[JobState::ExitRequested], &[]).write_json(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("EXIT_REQUESTED"));
    }
}
