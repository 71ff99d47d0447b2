use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use octocrab::{
    Octocrab,
    models::CheckRunId,
    params::checks::{CheckRunConclusion, CheckRunOutput, CheckRunStatus},
};
use power_check_core::models::{CheckStatus, Conclusion};

/// Attempts made to deliver the terminal update of a check run.
const COMPLETE_ATTEMPTS: u32 = 4;
const COMPLETE_INITIAL_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutput {
    pub title: String,
    pub summary: String,
    pub text: Option<String>,
}

/// A check run update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckUpdate {
    pub status: CheckStatus,
    pub conclusion: Option<Conclusion>,
    pub output: Option<CheckOutput>,
}

/// Remote check run API.
#[async_trait]
pub trait CheckApi: Send + Sync {
    /// Create a check run on `head_sha` and return its ID.
    async fn create(&self, repo: &str, name: &str, head_sha: &str) -> Result<u64>;

    async fn update(&self, repo: &str, run_id: u64, update: &CheckUpdate) -> Result<()>;
}

/// [`CheckApi`] backed by an installation-scoped octocrab client.
#[derive(Clone)]
pub struct GitHubChecks {
    pub client: Octocrab,
}

fn split_repo(repo: &str) -> Result<(&str, &str)> {
    repo.split_once('/')
        .filter(|(owner, name)| !owner.is_empty() && !name.is_empty())
        .with_context(|| format!("Repository {repo:?} is not of the form owner/name"))
}

fn status_param(status: CheckStatus) -> CheckRunStatus {
    match status {
        CheckStatus::Queued => CheckRunStatus::Queued,
        CheckStatus::InProgress => CheckRunStatus::InProgress,
        CheckStatus::Completed => CheckRunStatus::Completed,
    }
}

fn conclusion_param(conclusion: Conclusion) -> CheckRunConclusion {
    match conclusion {
        Conclusion::Success => CheckRunConclusion::Success,
        Conclusion::Failure => CheckRunConclusion::Failure,
        Conclusion::Cancelled => CheckRunConclusion::Cancelled,
        Conclusion::TimedOut => CheckRunConclusion::TimedOut,
        Conclusion::Neutral => CheckRunConclusion::Neutral,
        Conclusion::ActionRequired => CheckRunConclusion::ActionRequired,
        Conclusion::Stale => CheckRunConclusion::Stale,
        Conclusion::Skipped => CheckRunConclusion::Skipped,
    }
}

fn output_param(output: &CheckOutput) -> CheckRunOutput {
    CheckRunOutput {
        title: output.title.clone(),
        summary: output.summary.clone(),
        text: output.text.clone(),
        annotations: Vec::new(),
        images: Vec::new(),
    }
}

#[async_trait]
impl CheckApi for GitHubChecks {
    async fn create(&self, repo: &str, name: &str, head_sha: &str) -> Result<u64> {
        let (owner, repo_name) = split_repo(repo)?;
        let run = self
            .client
            .checks(owner, repo_name)
            .create_check_run(name, head_sha)
            .status(CheckRunStatus::Queued)
            .send()
            .await
            .with_context(|| format!("Failed to create check run for {repo}@{head_sha}"))?;
        Ok(run.id.0)
    }

    async fn update(&self, repo: &str, run_id: u64, update: &CheckUpdate) -> Result<()> {
        let (owner, name) = split_repo(repo)?;
        let checks = self.client.checks(owner, name);
        let mut request =
            checks.update_check_run(CheckRunId(run_id)).status(status_param(update.status));
        if let Some(conclusion) = update.conclusion {
            request = request.conclusion(conclusion_param(conclusion));
        }
        if let Some(output) = &update.output {
            request = request.output(output_param(output));
        }
        request
            .send()
            .await
            .with_context(|| format!("Failed to update check run {run_id} in {repo}"))?;
        Ok(())
    }
}

/// Local view of a remote check run.
///
/// Status only moves forward. [`CheckRun::complete`] consumes the handle, so a
/// completed check run cannot be updated again.
pub struct CheckRun {
    api: Arc<dyn CheckApi>,
    repo: String,
    id: u64,
    status: CheckStatus,
}

impl CheckRun {
    /// Create a new queued check run.
    pub async fn open(
        api: Arc<dyn CheckApi>,
        repo: &str,
        head_sha: &str,
        name: &str,
    ) -> Result<Self> {
        let id = api.create(repo, name, head_sha).await?;
        tracing::info!("Created check run {} for {}@{}", id, repo, head_sha);
        Ok(Self { api, repo: repo.to_string(), id, status: CheckStatus::Queued })
    }

    /// Take over a check run that GitHub already created.
    pub fn attach(api: Arc<dyn CheckApi>, repo: &str, id: u64) -> Self {
        Self { api, repo: repo.to_string(), id, status: CheckStatus::Queued }
    }

    pub fn id(&self) -> u64 { self.id }

    pub fn repo(&self) -> &str { &self.repo }

    pub fn status(&self) -> CheckStatus { self.status }

    pub async fn set_running(&mut self) -> Result<()> {
        if self.status >= CheckStatus::InProgress {
            return Ok(());
        }
        let update = CheckUpdate { status: CheckStatus::InProgress, conclusion: None, output: None };
        self.api.update(&self.repo, self.id, &update).await?;
        self.status = CheckStatus::InProgress;
        Ok(())
    }

    /// Post the terminal conclusion. The update is retried with backoff, since
    /// a check run left in progress is never cleaned up by GitHub.
    ///
    /// Consumes the handle, so a check run is completed at most once:
    ///
    /// ```compile_fail
    /// # use power_check_github::checks::{CheckRun, Completion};
    /// # async fn finish(run: CheckRun) -> anyhow::Result<()> {
    /// run.complete(Completion::job_failed_canceled()).await?;
    /// run.complete(Completion::job_failed_canceled()).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn complete(self, completion: Completion) -> Result<()> {
        tracing::info!(
            "Completing check run {} in {}: {} ({})",
            self.id,
            self.repo,
            completion.conclusion,
            completion.output.title
        );
        let update = CheckUpdate {
            status: CheckStatus::Completed,
            conclusion: Some(completion.conclusion),
            output: Some(completion.output),
        };
        let mut backoff = COMPLETE_INITIAL_BACKOFF;
        let mut attempt = 1;
        loop {
            match self.api.update(&self.repo, self.id, &update).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < COMPLETE_ATTEMPTS => {
                    tracing::warn!(
                        "Completing check run {} failed (attempt {}/{}), retrying in {:?}: {:#}",
                        self.id,
                        attempt,
                        COMPLETE_ATTEMPTS,
                        backoff,
                        err
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(err) => {
                    return Err(err.context(format!(
                        "Check run {} left incomplete after {} attempts",
                        self.id, COMPLETE_ATTEMPTS
                    )));
                }
            }
        }
    }
}

/// Links to the uploaded measurement files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasurementLinks {
    pub recording: String,
    pub screenshot: String,
    pub chart: String,
}

/// Terminal conclusion and output of a check run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub conclusion: Conclusion,
    pub output: CheckOutput,
}

impl Completion {
    pub fn new(conclusion: Conclusion, title: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            conclusion,
            output: CheckOutput { title: title.into(), summary: summary.into(), text: None },
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.output.text = Some(text.into());
        self
    }

    pub fn timed_out(ceiling: Duration) -> Self {
        Self::new(
            Conclusion::TimedOut,
            "Timed out. Did CircleCI build successfully?",
            format!(
                "Firmware download did not finish after {}s. Did CircleCI build successfully?",
                ceiling.as_secs()
            ),
        )
    }

    pub fn job_failed_canceled() -> Self {
        Self::new(
            Conclusion::Cancelled,
            "No firmware to measure",
            "CircleCI job failed/canceled. No firmware to measure.",
        )
    }

    pub fn download_failed(err: &anyhow::Error) -> Self {
        Self::new(Conclusion::Failure, "Firmware download failed", format!("{err:#}"))
    }

    pub fn step_failed(
        title: impl Into<String>,
        summary: impl Into<String>,
        diagnostics: Option<String>,
    ) -> Self {
        let completion = Self::new(Conclusion::Cancelled, title, summary);
        match diagnostics {
            Some(text) => completion.with_text(text),
            None => completion,
        }
    }

    /// Result of a finished measurement: success at or below the threshold.
    pub fn measured(
        device: &str,
        mean_current: f64,
        threshold: f64,
        links: &MeasurementLinks,
        raw_output: impl Into<String>,
    ) -> Self {
        let conclusion =
            if mean_current > threshold { Conclusion::Failure } else { Conclusion::Success };
        Self::new(conclusion, format!("{mean_current} A mean"), measurement_summary(device, links))
            .with_text(raw_output)
    }

    /// The service stopped before the run could finish.
    pub fn shutting_down() -> Self {
        Self::new(
            Conclusion::Cancelled,
            "Service shutting down",
            "The power check service stopped before this measurement finished. Re-run the check \
             to measure again.",
        )
    }

    pub fn internal_error(err: &anyhow::Error) -> Self {
        Self::new(Conclusion::Failure, "Internal error", format!("{err:#}"))
    }
}

pub fn measurement_summary(device: &str, links: &MeasurementLinks) -> String {
    format!(
        "{device} programmed and measured successfully. </p><a href=\"{}\">Download JLS file to \
         see in Joulescope GUI (deleted after 7 days)</a></p><img src=\"{}\"></p><img src=\"{}\">",
        links.recording, links.screenshot, links.chart
    )
}
