pub mod shell;
pub mod storage;

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use power_check_core::util::short_sha;
use time::{OffsetDateTime, format_description::FormatItem, macros::format_description};

const STAMP_FORMAT: &[FormatItem<'static>] =
    format_description!("[year][month][day]_[hour][minute][second]");
const CSV_DATE_FORMAT: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");

/// A bench step that ran but did not produce a usable result. Reported on the
/// check run as a `cancelled` conclusion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub title: String,
    pub summary: String,
    /// Raw tool output, shown below the summary.
    pub diagnostics: Option<String>,
}

impl StepFailure {
    pub fn new(title: impl Into<String>, summary: impl Into<String>) -> Self {
        Self { title: title.into(), summary: summary.into(), diagnostics: None }
    }

    pub fn with_diagnostics(mut self, diagnostics: impl Into<String>) -> Self {
        self.diagnostics = Some(diagnostics.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult<T> {
    Passed(T),
    Failed(StepFailure),
}

impl<T> StepResult<T> {
    pub fn is_passed(&self) -> bool { matches!(self, StepResult::Passed(_)) }
}

/// Result of a timed power measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    /// Mean current over the measurement window, in amps.
    pub mean_current: f64,
    /// Recording file written by the power analyzer.
    pub recording: PathBuf,
    /// Raw measurement tool output.
    pub output: String,
}

/// The physical test bench. Calls must not overlap; callers hold the bench
/// lock for the whole sequence.
///
/// `Err` is reserved for failures of the bench host itself (a command that
/// cannot be spawned, an unreadable workspace). Anything the bench reports
/// about the device is a [`StepResult::Failed`].
#[async_trait]
pub trait Bench: Send + Sync {
    /// Directory the bench writes its output files to.
    fn workspace(&self) -> &Path;

    async fn flash_firmware(&self, firmware: &Path, bootloader: &Path) -> Result<StepResult<()>>;

    /// Stop any recording viewer and remove old recordings and images.
    async fn prepare(&self) -> Result<()>;

    async fn measure(&self) -> Result<StepResult<Measurement>>;

    async fn capture_screenshot(&self, recording: &Path, output: &Path) -> Result<StepResult<()>>;

    /// Append `csv_line` to the measurement history and render it to `output`.
    async fn render_chart(&self, csv_line: &str, output: &Path) -> Result<StepResult<()>>;
}

/// Publishes a file and returns its public URL.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn upload(&self, path: &Path) -> Result<String>;
}

/// Output files of one measurement, named after the time it finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFiles {
    pub screenshot: PathBuf,
    pub chart: PathBuf,
}

impl OutputFiles {
    pub fn at(dir: &Path, when: OffsetDateTime) -> Result<Self> {
        let stamp = when.to_offset(time::UtcOffset::UTC).format(STAMP_FORMAT)?;
        Ok(Self {
            screenshot: dir.join(format!("{stamp}.png")),
            chart: dir.join(format!("{stamp}_first_few_s.png")),
        })
    }
}

/// Measurement history line: `YYYY-MM-DD,<short sha>,<mean>`.
pub fn history_line(when: OffsetDateTime, head_sha: &str, mean_current: f64) -> Result<String> {
    let date = when.to_offset(time::UtcOffset::UTC).format(CSV_DATE_FORMAT)?;
    Ok(format!("{},{},{}", date, short_sha(head_sha), mean_current))
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn test_output_files() {
        let files = OutputFiles::at(Path::new("/bench"), datetime!(2021-03-04 05:06:07 UTC)).unwrap();
        assert_eq!(files.screenshot, PathBuf::from("/bench/20210304_050607.png"));
        assert_eq!(files.chart, PathBuf::from("/bench/20210304_050607_first_few_s.png"));

        let files = OutputFiles::at(Path::new("/bench"), datetime!(2021-03-04 01:00:00 +02:00)).unwrap();
        assert_eq!(files.screenshot, PathBuf::from("/bench/20210303_230000.png"));
    }

    #[test]
    fn test_history_line() {
        let line = history_line(
            datetime!(2021-03-04 05:06:07 UTC),
            "3b15e384af8dcac939a4f5dbd55227d4d0107372",
            0.0031,
        )
        .unwrap();
        assert_eq!(line, "2021-03-04,3b15e384,0.0031");
    }
}
