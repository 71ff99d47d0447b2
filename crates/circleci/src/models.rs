//! CircleCI v2 API response types. Only the fields the poller reads.

use serde::Deserialize;

/// One page of a paginated list response.
#[derive(Debug, Clone, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pipeline {
    pub id: String,
    #[serde(default)]
    pub number: Option<u64>,
    #[serde(default)]
    pub vcs: Option<PipelineVcs>,
}

impl Pipeline {
    pub fn revision(&self) -> Option<&str> { self.vcs.as_ref().map(|v| v.revision.as_str()) }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineVcs {
    pub revision: String,
    #[serde(default)]
    pub branch: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    pub name: String,
    /// Absent until the job has been scheduled.
    #[serde(default)]
    pub job_number: Option<u64>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Artifact {
    pub path: String,
    pub url: String,
    #[serde(default)]
    pub node_index: u32,
}

/// Error body CircleCI returns with non-2xx responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorMessage {
    pub message: String,
}
