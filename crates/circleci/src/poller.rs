use std::{path::PathBuf, sync::Arc, time::Duration};

use power_check_core::config::{ArtifactTarget, CircleCiConfig};

use crate::{
    ApiError, BuildSystem,
    models::{Artifact, Job},
    retry::{Attempt, PollBudget, Stop},
};

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("no CircleCI pipeline recorded yet for commit {0}")]
    PipelineNotFound(String),
    #[error("pipeline {0} has no workflows yet")]
    NoWorkflows(String),
    #[error("CircleCI {0} job not created yet")]
    JobNotCreated(String),
    #[error("{job} job status: {status}")]
    JobPending { job: String, status: String },
    #[error("artifact {0} not found")]
    ArtifactMissing(String),
}

/// Firmware files downloaded for a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImages {
    pub job_number: u64,
    pub firmware: PathBuf,
    pub bootloader: PathBuf,
}

/// Terminal result of a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Both artifacts were downloaded.
    Success(FirmwareImages),
    /// The build job reported `failed` or `canceled`.
    JobFailedCanceled { status: String },
    /// The retry budget ran out.
    TimedOut { elapsed: Duration, last_error: String },
}

enum JobState {
    Succeeded(u64),
    FailedCanceled(String),
}

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub job_name: String,
    pub initial_backoff: Duration,
    pub max_retry_time: Duration,
    /// Stop on HTTP 401 instead of retrying it like any other error.
    pub fail_fast_on_unauthorized: bool,
    pub firmware: ArtifactTarget,
    pub bootloader: ArtifactTarget,
}

impl From<&CircleCiConfig> for PollSettings {
    fn from(config: &CircleCiConfig) -> Self {
        Self {
            job_name: config.job_name.clone(),
            initial_backoff: config.initial_backoff(),
            max_retry_time: config.max_retry_time(),
            fail_fast_on_unauthorized: config.fail_fast_on_unauthorized,
            firmware: config.firmware.clone(),
            bootloader: config.bootloader.clone(),
        }
    }
}

/// Follows a commit through pipeline → workflow → job → artifacts and
/// downloads the firmware images the job produced.
#[derive(Clone)]
pub struct PipelinePoller {
    api: Arc<dyn BuildSystem>,
    settings: PollSettings,
}

impl PipelinePoller {
    pub fn new(api: Arc<dyn BuildSystem>, settings: PollSettings) -> Self { Self { api, settings } }

    pub fn settings(&self) -> &PollSettings { &self.settings }

    /// Poll until the firmware for `sha` is downloaded, the build job fails, or
    /// the retry budget runs out. Errors are returned only for failures that
    /// retrying cannot fix.
    pub async fn fetch_firmware(&self, sha: &str) -> Result<PollOutcome, PollError> {
        let mut budget =
            PollBudget::new(self.settings.initial_backoff, self.settings.max_retry_time);
        match self.poll(sha, &mut budget).await {
            Ok(outcome) => Ok(outcome),
            Err(Stop::Exhausted(last)) => {
                tracing::warn!(
                    "Error: max timeout reached for commit {} after {}s",
                    sha,
                    budget.elapsed().as_secs()
                );
                Ok(PollOutcome::TimedOut { elapsed: budget.elapsed(), last_error: last.to_string() })
            }
            Err(Stop::Fatal(e)) => Err(e),
        }
    }

    fn classify<T>(&self, e: ApiError) -> Attempt<T, PollError> {
        match e {
            ApiError::Unauthorized { .. } if self.settings.fail_fast_on_unauthorized => {
                Attempt::Fatal(e.into())
            }
            ApiError::Unauthorized { .. } => {
                tracing::error!("{}", e);
                Attempt::Retryable(e.into())
            }
            ApiError::Status { .. } | ApiError::Transport { .. } => Attempt::Retryable(e.into()),
            ApiError::Io { .. } => Attempt::Fatal(e.into()),
        }
    }

    async fn poll(&self, sha: &str, budget: &mut PollBudget) -> Result<PollOutcome, Stop<PollError>> {
        let this = self;
        let job_name = self.settings.job_name.as_str();

        let pipeline_id = budget
            .retry("pipeline lookup", move || async move {
                match this.api.list_pipelines().await {
                    Ok(pipelines) => match pipelines.into_iter().find(|p| p.revision() == Some(sha)) {
                        Some(pipeline) => Attempt::Ok(pipeline.id),
                        None => Attempt::Retryable(PollError::PipelineNotFound(sha.to_string())),
                    },
                    Err(e) => this.classify(e),
                }
            })
            .await?;
        tracing::debug!("Pipeline {} found for commit {}", pipeline_id, sha);

        let pipeline = pipeline_id.as_str();
        let workflow_id = budget
            .retry("workflow lookup", move || async move {
                match this.api.list_workflows(pipeline).await {
                    Ok(workflows) => match workflows.into_iter().next() {
                        Some(workflow) => Attempt::Ok(workflow.id),
                        None => Attempt::Retryable(PollError::NoWorkflows(pipeline.to_string())),
                    },
                    Err(e) => this.classify(e),
                }
            })
            .await?;

        let workflow = workflow_id.as_str();
        let job_state = budget
            .retry("job lookup", move || async move {
                match this.api.list_jobs(workflow).await {
                    Ok(jobs) => classify_job(jobs.iter().find(|j| j.name == job_name), job_name),
                    Err(e) => this.classify(e),
                }
            })
            .await?;
        let job_number = match job_state {
            JobState::Succeeded(job_number) => job_number,
            JobState::FailedCanceled(status) => {
                tracing::info!("CircleCI job {} for commit {}", status, sha);
                return Ok(PollOutcome::JobFailedCanceled { status });
            }
        };
        tracing::info!("CircleCI {} job {} found for commit {}", job_name, job_number, sha);

        let firmware_path = self.settings.firmware.path.as_str();
        let bootloader_path = self.settings.bootloader.path.as_str();
        let (firmware, bootloader) = budget
            .retry("artifact lookup", move || async move {
                match this.api.list_artifacts(job_number).await {
                    Ok(artifacts) => select_artifacts(&artifacts, firmware_path, bootloader_path),
                    Err(e) => this.classify(e),
                }
            })
            .await?;

        for (artifact, target) in
            [(&firmware, &self.settings.firmware), (&bootloader, &self.settings.bootloader)]
        {
            tracing::debug!("Downloading {} to {}", artifact.url, target.destination.display());
            let url = artifact.url.as_str();
            let destination = target.destination.as_path();
            let bytes = budget
                .retry("artifact download", move || async move {
                    match this.api.download(url, destination).await {
                        Ok(bytes) => Attempt::Ok(bytes),
                        Err(e) => this.classify(e),
                    }
                })
                .await?;
            tracing::info!("Downloaded {} ({} bytes)", artifact.path, bytes);
        }

        Ok(PollOutcome::Success(FirmwareImages {
            job_number,
            firmware: self.settings.firmware.destination.clone(),
            bootloader: self.settings.bootloader.destination.clone(),
        }))
    }
}

fn classify_job(job: Option<&Job>, job_name: &str) -> Attempt<JobState, PollError> {
    let Some(job) = job else {
        return Attempt::Retryable(PollError::JobNotCreated(job_name.to_string()));
    };
    match job.status.as_deref() {
        // Definitive: a newer commit canceled the build or it broke. Not retried.
        Some(status @ ("failed" | "canceled")) => Attempt::Ok(JobState::FailedCanceled(status.to_string())),
        None | Some("") => Attempt::Retryable(PollError::JobNotCreated(job_name.to_string())),
        Some("success") => match job.job_number {
            Some(job_number) => Attempt::Ok(JobState::Succeeded(job_number)),
            None => Attempt::Retryable(PollError::JobNotCreated(job_name.to_string())),
        },
        Some(status) => Attempt::Retryable(PollError::JobPending {
            job: job_name.to_string(),
            status: status.to_string(),
        }),
    }
}

fn select_artifacts(
    artifacts: &[Artifact],
    firmware_path: &str,
    bootloader_path: &str,
) -> Attempt<(Artifact, Artifact), PollError> {
    let find = |path: &str| artifacts.iter().find(|a| a.path == path).cloned();
    match (find(firmware_path), find(bootloader_path)) {
        (Some(firmware), Some(bootloader)) => Attempt::Ok((firmware, bootloader)),
        (None, _) => Attempt::Retryable(PollError::ArtifactMissing(firmware_path.to_string())),
        (_, None) => Attempt::Retryable(PollError::ArtifactMissing(bootloader_path.to_string())),
    }
}
