//! Bench driven by external programs: the flash tool, the power analyzer
//! trigger script, the recording viewer, a screen capture tool and the chart
//! script. Their text output is interpreted here and nowhere else.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::OnceLock,
    time::{Duration, SystemTime},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use power_check_core::{
    config::{CommandConfig, MeasurementConfig},
    util::substitute,
};
use regex::Regex;
use tokio::process::Command;

use crate::{Bench, Measurement, StepFailure, StepResult};

const RECORDING_EXTENSION: &str = "jls";
const IMAGE_EXTENSION: &str = "png";

pub struct ShellBench {
    config: MeasurementConfig,
}

#[derive(Debug)]
struct CommandOutput {
    success: bool,
    /// stdout followed by stderr.
    text: String,
}

impl ShellBench {
    pub fn new(config: MeasurementConfig) -> Self { Self { config } }

    fn args(command: &CommandConfig, values: &[(&str, &str)]) -> Vec<String> {
        command.args.iter().map(|arg| substitute(arg, values)).collect()
    }

    fn command(&self, command: &CommandConfig, values: &[(&str, &str)]) -> Command {
        let mut cmd = Command::new(&command.program);
        cmd.args(Self::args(command, values)).current_dir(&self.config.workspace);
        cmd
    }

    async fn run(&self, command: &CommandConfig, values: &[(&str, &str)]) -> Result<CommandOutput> {
        tracing::debug!("Running {} {:?}", command.program, Self::args(command, values));
        let output = self
            .command(command, values)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to run {}", command.program))?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        tracing::debug!("{} exited with {}: {}", command.program, output.status, text.trim_end());
        Ok(CommandOutput { success: output.status.success(), text })
    }

    async fn stop_viewer(&self) {
        let Some(stop) = &self.config.viewer_stop else { return };
        // The viewer is usually not running; its stop command then fails.
        if let Err(e) = self.run(stop, &[]).await {
            tracing::debug!("Failed to stop viewer: {:#}", e);
        }
    }

    fn workspace_str(&self) -> String { self.config.workspace.display().to_string() }
}

#[async_trait]
impl Bench for ShellBench {
    fn workspace(&self) -> &Path { &self.config.workspace }

    async fn flash_firmware(&self, firmware: &Path, bootloader: &Path) -> Result<StepResult<()>> {
        let firmware = firmware.display().to_string();
        let bootloader = bootloader.display().to_string();
        let output = self
            .run(&self.config.flash, &[
                ("firmware", firmware.as_str()),
                ("bootloader", bootloader.as_str()),
            ])
            .await?;
        Ok(parse_flash_output(&output.text))
    }

    async fn prepare(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.workspace).await.with_context(|| {
            format!("Failed to create bench workspace {}", self.config.workspace.display())
        })?;
        self.stop_viewer().await;
        let workspace = self.workspace_str();
        for command in &self.config.prepare {
            let output = self.run(command, &[("workspace", workspace.as_str())]).await?;
            if !output.success {
                tracing::warn!("{} failed: {}", command.program, output.text.trim_end());
            }
        }
        let removed =
            remove_files(&self.config.workspace, &[RECORDING_EXTENSION, IMAGE_EXTENSION]).await?;
        tracing::debug!("Removed {} old recordings and images", removed);
        Ok(())
    }

    async fn measure(&self) -> Result<StepResult<Measurement>> {
        let duration = self.config.duration_secs.to_string();
        let workspace = self.workspace_str();
        let output = self
            .run(&self.config.measure, &[
                ("duration", duration.as_str()),
                ("workspace", workspace.as_str()),
            ])
            .await?;
        let mean_current = match parse_measurement_output(&output.text, output.success) {
            StepResult::Passed(mean) => mean,
            StepResult::Failed(failure) => return Ok(StepResult::Failed(failure)),
        };
        let Some(recording) = newest_file(&self.config.workspace, RECORDING_EXTENSION).await? else {
            return Ok(StepResult::Failed(
                StepFailure::new(
                    "No recording",
                    "The measurement finished but left no recording file. Details below",
                )
                .with_diagnostics(output.text),
            ));
        };
        tracing::info!("Measured {} A mean, recording {}", mean_current, recording.display());
        Ok(StepResult::Passed(Measurement { mean_current, recording, output: output.text }))
    }

    async fn capture_screenshot(&self, recording: &Path, output: &Path) -> Result<StepResult<()>> {
        let recording = recording.display().to_string();
        let output_path = output.display().to_string();
        let mut viewer = self
            .command(&self.config.viewer, &[("recording", recording.as_str())])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start {}", self.config.viewer.program))?;
        // Give the viewer time to open and plot the whole recording.
        tokio::time::sleep(Duration::from_secs(self.config.viewer_settle_secs)).await;
        let result = self
            .run(&self.config.screenshot, &[
                ("output", output_path.as_str()),
                ("recording", recording.as_str()),
            ])
            .await;
        self.stop_viewer().await;
        if let Err(e) = viewer.kill().await {
            tracing::debug!("Viewer already exited: {}", e);
        }
        let result = result?;
        Ok(expect_file(output, result, "Screenshot failed", "Could not capture the recording viewer"))
    }

    async fn render_chart(&self, csv_line: &str, output: &Path) -> Result<StepResult<()>> {
        let output_path = output.display().to_string();
        let result = self
            .run(&self.config.chart, &[("output", output_path.as_str()), ("csv_line", csv_line)])
            .await?;
        Ok(expect_file(output, result, "Chart failed", "Could not render the measurement history"))
    }
}

fn expect_file(path: &Path, output: CommandOutput, title: &str, summary: &str) -> StepResult<()> {
    if output.success && path.is_file() {
        return StepResult::Passed(());
    }
    StepResult::Failed(
        StepFailure::new(title, format!("{summary}. Details below")).with_diagnostics(output.text),
    )
}

pub fn parse_flash_output(output: &str) -> StepResult<()> {
    if output.contains("cannot open gdb interface") {
        return StepResult::Failed(StepFailure::new(
            "cannot open gdb interface. A cable is disconnected or the power is off",
            "cannot open gdb interface. A cable is disconnected or the power is off. Did the \
             RESET pin inverter light on fire?",
        ));
    }
    if !output.contains("done.") {
        return StepResult::Failed(
            StepFailure::new("unknown error", "Unknown error. Details below").with_diagnostics(output),
        );
    }
    StepResult::Passed(())
}

/// Mean current reported by the measurement script, in amps.
pub fn parse_measurement_output(output: &str, success: bool) -> StepResult<f64> {
    let failure = || {
        StepFailure::new(
            "Joulescope error",
            "Joulescope error. Details below. Is Joulescope connected and no application other \
             than this script using it? Close Joulescope GUI.",
        )
        .with_diagnostics(output)
    };
    if !success || output.to_lowercase().contains("error") {
        return StepResult::Failed(failure());
    }
    match current_mean(output) {
        Some(mean) => StepResult::Passed(mean),
        None => StepResult::Failed(failure()),
    }
}

fn current_mean(output: &str) -> Option<f64> {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = REGEX.get_or_init(|| {
        Regex::new(r"current_mean\(A\)\W*?([-+]?(?:\d+\.?\d*|\.\d+)(?:[eE][-+]?\d+)?)").unwrap()
    });
    regex.captures(output)?.get(1)?.as_str().parse().ok()
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension().is_some_and(|e| e.eq_ignore_ascii_case(extension))
}

async fn remove_files(dir: &Path, extensions: &[&str]) -> Result<usize> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read {}", dir.display()))?;
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_file()
            && extensions.iter().any(|ext| has_extension(&path, ext))
        {
            tokio::fs::remove_file(&path)
                .await
                .with_context(|| format!("Failed to remove {}", path.display()))?;
            removed += 1;
        }
    }
    Ok(removed)
}

async fn newest_file(dir: &Path, extension: &str) -> Result<Option<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read {}", dir.display()))?;
    let mut newest: Option<(SystemTime, PathBuf)> = None;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !has_extension(&path, extension) {
            continue;
        }
        let modified = entry.metadata().await?.modified()?;
        if newest.as_ref().is_none_or(|(time, _)| modified >= *time) {
            newest = Some((modified, path));
        }
    }
    Ok(newest.map(|(_, path)| path))
}
