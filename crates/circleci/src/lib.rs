pub mod models;
pub mod poller;
pub mod retry;

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use anyhow::Context;
use async_trait::async_trait;
use power_check_core::config::CircleCiConfig;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;

use crate::models::{Artifact, ErrorMessage, Job, Page, Pipeline, Workflow};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP 401 from {url}. Check the CircleCI API token")]
    Unauthorized { url: String },
    #[error("HTTP {status} from {url}: {message}")]
    Status { url: String, status: u16, message: String },
    #[error("request to {url} failed: {source}")]
    Transport { url: String, source: reqwest::Error },
    #[error("failed to write {}: {source}", path.display())]
    Io { path: PathBuf, source: std::io::Error },
}

/// Query surface of the external build system. Each list call returns the
/// first page only.
#[async_trait]
pub trait BuildSystem: Send + Sync {
    async fn list_pipelines(&self) -> Result<Vec<Pipeline>, ApiError>;

    async fn list_workflows(&self, pipeline_id: &str) -> Result<Vec<Workflow>, ApiError>;

    async fn list_jobs(&self, workflow_id: &str) -> Result<Vec<Job>, ApiError>;

    async fn list_artifacts(&self, job_number: u64) -> Result<Vec<Artifact>, ApiError>;

    /// Stream `url` to `destination`, replacing any existing file. Returns the
    /// number of bytes written.
    async fn download(&self, url: &str, destination: &Path) -> Result<u64, ApiError>;
}

/// CircleCI v2 REST client authenticated with a personal API token.
#[derive(Clone)]
pub struct CircleCi {
    client: Client,
    api_url: String,
    token: String,
    project_slug: String,
}

impl CircleCi {
    pub fn new(config: &CircleCiConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("power-check/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create CircleCI client")?;
        Ok(Self {
            client,
            api_url: config.api_url.as_str().trim_end_matches('/').to_string(),
            token: config.token.clone(),
            project_slug: config.project_slug.clone(),
        })
    }

    async fn send(&self, url: &str) -> Result<reqwest::Response, ApiError> {
        let response = self
            .client
            .get(url)
            .header("Circle-Token", &self.token)
            .send()
            .await
            .map_err(|source| ApiError::Transport { url: url.to_string(), source })?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(ApiError::Unauthorized { url: url.to_string() });
        }
        if !status.is_success() {
            let message =
                response.json::<ErrorMessage>().await.map(|m| m.message).unwrap_or_default();
            return Err(ApiError::Status { url: url.to_string(), status: status.as_u16(), message });
        }
        Ok(response)
    }

    async fn get_items<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, ApiError> {
        let url = format!("{}/{}", self.api_url, path);
        let page: Page<T> = self
            .send(&url)
            .await?
            .json()
            .await
            .map_err(|source| ApiError::Transport { url: url.clone(), source })?;
        Ok(page.items)
    }
}

#[async_trait]
impl BuildSystem for CircleCi {
    async fn list_pipelines(&self) -> Result<Vec<Pipeline>, ApiError> {
        self.get_items(&format!("project/{}/pipeline", self.project_slug)).await
    }

    async fn list_workflows(&self, pipeline_id: &str) -> Result<Vec<Workflow>, ApiError> {
        self.get_items(&format!("pipeline/{pipeline_id}/workflow")).await
    }

    async fn list_jobs(&self, workflow_id: &str) -> Result<Vec<Job>, ApiError> {
        self.get_items(&format!("workflow/{workflow_id}/job")).await
    }

    async fn list_artifacts(&self, job_number: u64) -> Result<Vec<Artifact>, ApiError> {
        self.get_items(&format!("project/{}/{}/artifacts", self.project_slug, job_number)).await
    }

    async fn download(&self, url: &str, destination: &Path) -> Result<u64, ApiError> {
        let mut response = self.send(url).await?;
        let io = |source| ApiError::Io { path: destination.to_path_buf(), source };
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io)?;
        }
        let partial = partial_path(destination);
        let mut file = tokio::fs::File::create(&partial).await.map_err(io)?;
        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|source| ApiError::Transport { url: url.to_string(), source })?
        {
            file.write_all(&chunk).await.map_err(io)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(io)?;
        drop(file);
        tokio::fs::rename(&partial, destination).await.map_err(io)?;
        Ok(written)
    }
}

/// Sibling path a download is streamed to before it replaces `destination`.
pub fn partial_path(destination: &Path) -> PathBuf {
    let mut name = OsString::from(destination.as_os_str());
    name.push(".download");
    PathBuf::from(name)
}
