use std::path::Path;

use anyhow::{Context, Result};
use power_check_bench::{OutputFiles, StepFailure, StepResult, history_line};
use power_check_circleci::poller::PollOutcome;
use power_check_github::checks::{CheckRun, Completion, MeasurementLinks};
use time::OffsetDateTime;

use crate::{Cancellation, JobContext, RunPermit};

/// A measurement run for one commit.
pub struct MeasurementJob {
    pub check_run: CheckRun,
    pub head_sha: String,
    /// Keeps the commit marked in flight until the run is done.
    pub permit: RunPermit,
}

/// Unwrap a passed bench step or finish the run with its failure.
macro_rules! step {
    ($step:expr) => {
        match $step.await? {
            StepResult::Passed(value) => value,
            StepResult::Failed(failure) => return Ok(step_failed(failure)),
        }
    };
}

fn step_failed(failure: StepFailure) -> Completion {
    tracing::warn!("Bench step failed: {}", failure.title);
    Completion::step_failed(failure.title, failure.summary, failure.diagnostics)
}

/// Process a measurement run. Always completes the check run exactly once,
/// as cancelled if `cancel` fires first.
pub async fn process_measurement_job(
    job: MeasurementJob,
    ctx: JobContext,
    mut cancel: Cancellation,
) {
    let MeasurementJob { mut check_run, head_sha, permit } = job;
    tracing::info!(
        "Processing measurement job: repo={} run={} sha={}",
        check_run.repo(),
        check_run.id(),
        head_sha
    );

    let completion = tokio::select! {
        result = run_measurement(&mut check_run, &head_sha, &ctx) => match result {
            Ok(completion) => completion,
            Err(e) => {
                tracing::error!("Measurement of {} failed: {:?}", head_sha, e);
                Completion::internal_error(&e)
            }
        },
        _ = cancel.cancelled() => {
            tracing::warn!("Measurement of {} interrupted by shutdown", head_sha);
            Completion::shutting_down()
        }
    };
    let id = check_run.id();
    if let Err(e) = check_run.complete(completion).await {
        tracing::error!("Failed to complete check run {}: {:?}", id, e);
    }
    drop(permit);
}

/// Complete a run that never started because the service is stopping.
pub async fn abandon_measurement_job(job: MeasurementJob) {
    let MeasurementJob { check_run, head_sha, permit } = job;
    tracing::info!("Cancelling queued measurement of {} (check run {})", head_sha, check_run.id());
    permit.revoke();
    let id = check_run.id();
    if let Err(e) = check_run.complete(Completion::shutting_down()).await {
        tracing::error!("Failed to complete check run {}: {:?}", id, e);
    }
}

async fn run_measurement(
    check_run: &mut CheckRun,
    head_sha: &str,
    ctx: &JobContext,
) -> Result<Completion> {
    check_run.set_running().await?;

    let images = match ctx.poller.fetch_firmware(head_sha).await {
        Ok(PollOutcome::Success(images)) => images,
        Ok(PollOutcome::JobFailedCanceled { status }) => {
            tracing::info!("Build job for {} {}, nothing to measure", head_sha, status);
            return Ok(Completion::job_failed_canceled());
        }
        Ok(PollOutcome::TimedOut { elapsed, last_error }) => {
            tracing::warn!(
                "Gave up on firmware for {} after {}s: {}",
                head_sha,
                elapsed.as_secs(),
                last_error
            );
            return Ok(Completion::timed_out(ctx.poller.settings().max_retry_time));
        }
        Err(e) => return Ok(Completion::download_failed(&anyhow::Error::from(e))),
    };

    let _bench = ctx.bench_lock.lock().await;
    let bench = ctx.bench.as_ref();
    let config = &ctx.config.measurement;

    step!(bench.flash_firmware(&images.firmware, &images.bootloader));
    bench.prepare().await.context("Failed to prepare bench")?;
    let measurement = step!(bench.measure());

    let now = OffsetDateTime::now_utc();
    let outputs = OutputFiles::at(bench.workspace(), now)?;
    step!(bench.capture_screenshot(&measurement.recording, &outputs.screenshot));
    let csv_line = history_line(now, head_sha, measurement.mean_current)?;
    tracing::debug!("New history line: {}", csv_line);
    step!(bench.render_chart(&csv_line, &outputs.chart));

    let mut failed_uploads = Vec::new();
    let links = MeasurementLinks {
        recording: publish(ctx, &measurement.recording, &mut failed_uploads).await,
        screenshot: publish(ctx, &outputs.screenshot, &mut failed_uploads).await,
        chart: publish(ctx, &outputs.chart, &mut failed_uploads).await,
    };
    let mut text = measurement.output;
    for failure in failed_uploads {
        text.push_str(&format!("\n{failure}"));
    }

    Ok(Completion::measured(
        &config.device_name,
        measurement.mean_current,
        config.current_threshold_amps,
        &links,
        text,
    ))
}

/// Upload a measurement file. A failed upload does not void the measurement:
/// its link is left empty and the error is appended to the check output.
async fn publish(ctx: &JobContext, path: &Path, failures: &mut Vec<String>) -> String {
    match ctx.store.upload(path).await {
        Ok(url) => url,
        Err(e) => {
            tracing::warn!("Failed to upload {}: {:?}", path.display(), e);
            failures.push(format!("Upload of {} failed: {:#}", path.display(), e));
            String::new()
        }
    }
}
