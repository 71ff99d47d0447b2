use octocrab::models::{
    Repository,
    webhook_events::{
        WebhookEvent, WebhookEventPayload, WebhookEventType,
        payload::{
            CheckRunWebhookEventAction, CheckSuiteWebhookEventAction, PullRequestWebhookEventAction,
        },
    },
};
use serde::Serialize;

/// Where an event is routed by the dispatcher.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Route {
    /// Run the full firmware download and power measurement.
    Measure,
    /// Register a new queued check run without measuring.
    CreateCheck,
    Ignore,
}

/// The check run fields of a `check_run` delivery.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CheckRunRef {
    pub id: u64,
    /// The GitHub App that owns the check run.
    pub app_id: Option<u64>,
}

/// A verified, parsed webhook delivery.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    /// Value of the `X-GitHub-Event` header.
    pub name: String,
    pub event: WebhookEvent,
}

impl InboundEvent {
    pub fn parse(name: &str, body: &[u8]) -> serde_json::Result<Self> {
        let event = WebhookEvent::try_from_header_and_body(name, body)?;
        Ok(Self { name: name.to_string(), event })
    }

    pub fn kind(&self) -> &WebhookEventType { &self.event.kind }

    pub fn is_check_run(&self) -> bool { self.event.kind == WebhookEventType::CheckRun }

    /// The `action` of the delivery, as sent by GitHub.
    pub fn action(&self) -> Option<String> {
        match &self.event.specific {
            WebhookEventPayload::CheckRun(payload) => action_name(&payload.action),
            WebhookEventPayload::CheckSuite(payload) => action_name(&payload.action),
            WebhookEventPayload::PullRequest(payload) => action_name(&payload.action),
            _ => None,
        }
    }

    pub fn repository(&self) -> Option<&Repository> { self.event.repository.as_ref() }

    /// `owner/name` of the repository the event came from.
    pub fn repository_full_name(&self) -> Option<String> {
        let repository = self.repository()?;
        repository.full_name.clone().or_else(|| {
            let owner = repository.owner.as_ref()?;
            Some(format!("{}/{}", owner.login, repository.name))
        })
    }

    pub fn installation_id(&self) -> Option<u64> {
        self.event.installation.as_ref().map(|installation| installation.id().0)
    }

    pub fn check_run(&self) -> Option<CheckRunRef> {
        let WebhookEventPayload::CheckRun(payload) = &self.event.specific else {
            return None;
        };
        let check_run = &payload.check_run;
        Some(CheckRunRef {
            id: check_run.get("id")?.as_u64()?,
            app_id: check_run.get("app").and_then(|app| app.get("id")).and_then(|id| id.as_u64()),
        })
    }

    /// The commit the event refers to. The location differs between check run,
    /// check suite and pull request payloads.
    pub fn head_sha(&self) -> Option<&str> {
        match &self.event.specific {
            WebhookEventPayload::CheckRun(payload) => payload.check_run.get("head_sha")?.as_str(),
            WebhookEventPayload::CheckSuite(payload) => {
                payload.check_suite.get("head_sha")?.as_str()
            }
            WebhookEventPayload::PullRequest(payload) => Some(&payload.pull_request.head.sha),
            _ => None,
        }
    }

    pub fn route(&self) -> Route {
        match &self.event.specific {
            WebhookEventPayload::CheckRun(payload) => match payload.action {
                CheckRunWebhookEventAction::Created => Route::Measure,
                CheckRunWebhookEventAction::Rerequested => Route::CreateCheck,
                _ => Route::Ignore,
            },
            WebhookEventPayload::CheckSuite(payload) => match payload.action {
                CheckSuiteWebhookEventAction::Requested
                | CheckSuiteWebhookEventAction::Rerequested => Route::CreateCheck,
                _ => Route::Ignore,
            },
            WebhookEventPayload::PullRequest(payload) => match payload.action {
                PullRequestWebhookEventAction::Opened
                | PullRequestWebhookEventAction::Synchronize => Route::CreateCheck,
                _ => Route::Ignore,
            },
            _ => Route::Ignore,
        }
    }
}

fn action_name(action: &impl Serialize) -> Option<String> {
    match serde_json::to_value(action).ok()? {
        serde_json::Value::String(name) => Some(name),
        _ => None,
    }
}

/// Webhook bodies shaped like GitHub's, for tests.
#[cfg(any(test, feature = "test-payloads"))]
pub mod payloads {
    use serde_json::{Value, json};

    pub fn repository(name: &str, full_name: &str) -> Value {
        json!({
            "id": 1296269,
            "name": name,
            "full_name": full_name,
            "url": format!("https://api.github.com/repos/{full_name}"),
        })
    }

    pub fn installation(id: u64) -> Value { json!({"id": id, "node_id": "MDIzOkludGVncmF0aW9uSW5zdGFsbGF0aW9uMQ=="}) }

    pub fn check_run(action: &str, repository: Value, id: u64, head_sha: &str, app_id: u64) -> Value {
        json!({
            "action": action,
            "repository": repository,
            "check_run": {"id": id, "head_sha": head_sha, "status": "queued", "app": {"id": app_id}},
        })
    }

    pub fn check_suite(action: &str, repository: Value, head_sha: &str) -> Value {
        json!({
            "action": action,
            "repository": repository,
            "check_suite": {"id": 5, "head_sha": head_sha, "status": "queued"},
        })
    }

    pub fn pull_request(action: &str, repository: Value, head_sha: &str) -> Value {
        json!({
            "action": action,
            "number": 3,
            "repository": repository,
            "pull_request": {
                "url": "https://api.github.com/repos/acme/firmware/pulls/3",
                "id": 3,
                "number": 3,
                "head": {"ref": "feature", "sha": head_sha},
                "base": {"ref": "main", "sha": "0000000"},
            },
        })
    }
}
