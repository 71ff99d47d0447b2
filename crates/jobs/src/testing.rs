//! Fakes for the external collaborators of a measurement run.

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use power_check_bench::{
    ArtifactStore, Bench, Measurement, StepResult,
    shell::{parse_flash_output, parse_measurement_output},
};
use power_check_circleci::{
    ApiError, BuildSystem,
    models::{Artifact, Job, Pipeline, PipelineVcs, Workflow},
    poller::{PipelinePoller, PollSettings},
};
use power_check_core::config::Config;
use power_check_github::{
    AuthError, Authenticator,
    checks::{CheckApi, CheckRun, CheckUpdate},
};
use tokio::sync::mpsc;

use crate::{DedupGuard, Dispatcher, JobContext, JobQueue, MeasurementJob};

pub const SHA: &str = "abc1234";
pub const RUN_ID: u64 = 4242;
pub const APP_ID: u64 = 1234;
pub const REPO_NAME: &str = "dialog_14683_scratch";
pub const REPO: &str = "acme/dialog_14683_scratch";

const CONFIG: &str = r#"
server:
  port: 3000
github:
  repository: dialog_14683_scratch
  app:
    id: 1234
    webhook_secret: secret
    private_key: unused
circleci:
  token: circle
  project_slug: gh/acme/dialog_14683_scratch
  firmware:
    path: ~/builds/freertos_retarget.bin
    destination: /fw/freertos_retarget.bin
  bootloader:
    path: ~/builds/ble_suota_loader.bin
    destination: /fw/ble_suota_loader.bin
measurement:
  workspace: /bench
  flash: { program: flash.bat }
  measure: { program: python }
  viewer: { program: viewer.exe }
  screenshot: { program: screenCapture.bat }
  chart: { program: python }
storage:
  kind: http
  upload_url: https://bucket.example.com/
  public_url: https://public.example.com/
"#;

pub fn config() -> Config { serde_yaml::from_str(CONFIG).unwrap() }

#[derive(Default)]
pub struct RecordingChecks {
    created: Mutex<Vec<(String, String, String)>>,
    updates: Mutex<Vec<(u64, CheckUpdate)>>,
}

impl RecordingChecks {
    pub fn created(&self) -> Vec<(String, String, String)> { self.created.lock().unwrap().clone() }

    pub fn updates_for(&self, run_id: u64) -> Vec<CheckUpdate> {
        let updates = self.updates.lock().unwrap();
        updates.iter().filter(|(id, _)| *id == run_id).map(|(_, u)| u.clone()).collect()
    }
}

#[async_trait]
impl CheckApi for RecordingChecks {
    async fn create(&self, repo: &str, name: &str, head_sha: &str) -> Result<u64> {
        let mut created = self.created.lock().unwrap();
        created.push((repo.to_string(), name.to_string(), head_sha.to_string()));
        Ok(1000 + created.len() as u64)
    }

    async fn update(&self, _repo: &str, run_id: u64, update: &CheckUpdate) -> Result<()> {
        self.updates.lock().unwrap().push((run_id, update.clone()));
        Ok(())
    }
}

pub struct FakeAuth {
    checks: Arc<RecordingChecks>,
    failing: AtomicBool,
    installations: Mutex<Vec<Option<u64>>>,
}

impl FakeAuth {
    pub fn fail(&self) { self.failing.store(true, Ordering::SeqCst) }

    pub fn installations(&self) -> Vec<Option<u64>> { self.installations.lock().unwrap().clone() }
}

#[async_trait]
impl Authenticator for FakeAuth {
    async fn authenticate(
        &self,
        installation_id: Option<u64>,
    ) -> Result<Arc<dyn CheckApi>, AuthError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AuthError::NoInstallation);
        }
        self.installations.lock().unwrap().push(installation_id);
        Ok(self.checks.clone())
    }
}

/// Build system whose `pack_images` job always reports `job_status`.
struct FakeCircleCi {
    job_status: String,
}

#[async_trait]
impl BuildSystem for FakeCircleCi {
    async fn list_pipelines(&self) -> Result<Vec<Pipeline>, ApiError> {
        Ok(vec![Pipeline {
            id: "pipeline-1".to_string(),
            number: Some(1),
            vcs: Some(PipelineVcs { revision: SHA.to_string(), branch: None }),
        }])
    }

    async fn list_workflows(&self, _pipeline_id: &str) -> Result<Vec<Workflow>, ApiError> {
        Ok(vec![Workflow { id: "wf-1".to_string(), name: "main".to_string(), status: None }])
    }

    async fn list_jobs(&self, _workflow_id: &str) -> Result<Vec<Job>, ApiError> {
        Ok(vec![Job {
            name: "pack_images".to_string(),
            job_number: Some(7),
            status: Some(self.job_status.clone()),
        }])
    }

    async fn list_artifacts(&self, _job_number: u64) -> Result<Vec<Artifact>, ApiError> {
        Ok(["~/builds/freertos_retarget.bin", "~/builds/ble_suota_loader.bin"]
            .into_iter()
            .map(|path| Artifact {
                path: path.to_string(),
                url: format!("https://artifacts/{path}"),
                node_index: 0,
            })
            .collect())
    }

    async fn download(&self, _url: &str, _destination: &Path) -> Result<u64, ApiError> { Ok(0) }
}

pub struct FakeBench {
    workspace: PathBuf,
    mean_current: f64,
    calls: Mutex<Vec<&'static str>>,
    failing: Mutex<Option<&'static str>>,
    broken: AtomicBool,
    history: Mutex<Option<String>>,
}

impl FakeBench {
    pub fn calls(&self) -> Vec<&'static str> { self.calls.lock().unwrap().clone() }

    pub fn history(&self) -> Option<String> { self.history.lock().unwrap().clone() }

    pub fn fail_step(&self, step: &'static str) { *self.failing.lock().unwrap() = Some(step) }

    /// Make the next step fail to run at all.
    pub fn break_host(&self) { self.broken.store(true, Ordering::SeqCst) }

    fn call(&self, step: &'static str) -> Result<bool> {
        self.calls.lock().unwrap().push(step);
        if self.broken.load(Ordering::SeqCst) {
            bail!("failed to spawn {step}");
        }
        Ok(*self.failing.lock().unwrap() == Some(step))
    }
}

#[async_trait]
impl Bench for FakeBench {
    fn workspace(&self) -> &Path { &self.workspace }

    async fn flash_firmware(&self, _firmware: &Path, _bootloader: &Path) -> Result<StepResult<()>> {
        let output = if self.call("flash")? { "cannot open gdb interface" } else { "done." };
        Ok(parse_flash_output(output))
    }

    async fn prepare(&self) -> Result<()> {
        self.call("prepare")?;
        Ok(())
    }

    async fn measure(&self) -> Result<StepResult<Measurement>> {
        if self.call("measure")? {
            let StepResult::Failed(failure) =
                parse_measurement_output("RuntimeError: no device", true)
            else {
                unreachable!();
            };
            return Ok(StepResult::Failed(failure));
        }
        Ok(StepResult::Passed(Measurement {
            mean_current: self.mean_current,
            recording: self.workspace.join("recording.jls"),
            output: format!("{{'current_mean(A)': {}}}", self.mean_current),
        }))
    }

    async fn capture_screenshot(&self, _recording: &Path, _output: &Path) -> Result<StepResult<()>> {
        self.call("screenshot")?;
        Ok(StepResult::Passed(()))
    }

    async fn render_chart(&self, csv_line: &str, _output: &Path) -> Result<StepResult<()>> {
        self.call("chart")?;
        *self.history.lock().unwrap() = Some(csv_line.to_string());
        Ok(StepResult::Passed(()))
    }
}

#[derive(Default)]
pub struct FakeStore {
    rejected_suffix: Mutex<Option<String>>,
    uploads: Mutex<Vec<String>>,
}

impl FakeStore {
    pub fn reject(&self, suffix: &str) { *self.rejected_suffix.lock().unwrap() = Some(suffix.to_string()) }

    pub fn uploads(&self) -> Vec<String> { self.uploads.lock().unwrap().clone() }
}

#[async_trait]
impl ArtifactStore for FakeStore {
    async fn upload(&self, path: &Path) -> Result<String> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("no file name"))?;
        if let Some(suffix) = self.rejected_suffix.lock().unwrap().as_deref()
            && name.ends_with(suffix)
        {
            bail!("403 Forbidden");
        }
        let url = format!("https://public.example.com/{name}");
        self.uploads.lock().unwrap().push(url.clone());
        Ok(url)
    }
}

pub struct Fixture {
    pub config: Arc<Config>,
    pub checks: Arc<RecordingChecks>,
    pub auth: Arc<FakeAuth>,
    pub bench: Arc<FakeBench>,
    pub store: Arc<FakeStore>,
    pub guard: DedupGuard,
    job_status: String,
}

impl Fixture {
    pub fn new(mean_current: f64) -> Self {
        let checks = Arc::new(RecordingChecks::default());
        Self {
            config: Arc::new(config()),
            auth: Arc::new(FakeAuth {
                checks: checks.clone(),
                failing: AtomicBool::new(false),
                installations: Mutex::default(),
            }),
            checks,
            bench: Arc::new(FakeBench {
                workspace: PathBuf::from("/bench"),
                mean_current,
                calls: Mutex::default(),
                failing: Mutex::default(),
                broken: AtomicBool::new(false),
                history: Mutex::default(),
            }),
            store: Arc::new(FakeStore::default()),
            guard: DedupGuard::new(),
            job_status: "success".to_string(),
        }
    }

    pub fn with_job_status(mut self, status: &str) -> Self {
        self.job_status = status.to_string();
        self
    }

    pub fn context(&self) -> JobContext {
        let build_system = Arc::new(FakeCircleCi { job_status: self.job_status.clone() });
        JobContext {
            config: self.config.clone(),
            poller: PipelinePoller::new(build_system, PollSettings::from(&self.config.circleci)),
            bench: self.bench.clone(),
            store: self.store.clone(),
            bench_lock: Arc::default(),
        }
    }

    pub fn dispatcher(&self) -> (Dispatcher, mpsc::UnboundedReceiver<MeasurementJob>) {
        let (queue, rx) = JobQueue::new();
        let dispatcher =
            Dispatcher::new(self.config.clone(), self.auth.clone(), self.guard.clone(), queue);
        (dispatcher, rx)
    }

    /// A run for `sha` on the platform-created check run [`RUN_ID`].
    pub fn job(&self, sha: &str) -> MeasurementJob { self.job_for(sha, RUN_ID) }

    pub fn job_for(&self, sha: &str, run_id: u64) -> MeasurementJob {
        MeasurementJob {
            check_run: CheckRun::attach(self.checks.clone(), REPO, run_id),
            head_sha: sha.to_string(),
            permit: self.guard.check_and_set(sha).unwrap(),
        }
    }
}
