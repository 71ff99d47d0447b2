use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use power_check_core::AppError;
use power_check_github::webhook::GitHubEvent;
use power_check_jobs::{DispatchError, Dispatched};

use crate::AppState;

/// Webhook handler. Measurement runs are queued; the response does not wait
/// for them.
pub async fn event_handler(
    State(state): State<AppState>,
    GitHubEvent { event }: GitHubEvent,
) -> Result<Response, AppError> {
    match event.repository_full_name() {
        Some(repository) => tracing::info!(
            "Received webhook event {} ({}) from repository {}",
            event.name,
            event.action().as_deref().unwrap_or("-"),
            repository
        ),
        None => tracing::info!("Received webhook event {} from unknown source", event.name),
    }

    match state.dispatcher.dispatch(&event).await {
        Ok(Dispatched::Ignored(reason)) => {
            tracing::debug!("Ignored {} event: {}", event.name, reason);
            Ok((StatusCode::OK, reason).into_response())
        }
        Ok(Dispatched::Duplicate) => Ok((StatusCode::OK, "Already measuring").into_response()),
        Ok(Dispatched::CheckCreated(id)) => {
            Ok((StatusCode::OK, format!("Created check run {id}")).into_response())
        }
        Ok(Dispatched::Enqueued(id)) => {
            Ok((StatusCode::OK, format!("Queued check run {id}")).into_response())
        }
        Err(DispatchError::Auth(e)) => {
            tracing::error!("GitHub app authentication failed: {}", e);
            Err(AppError::Status(StatusCode::UNAUTHORIZED))
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use axum::{
        Router,
        body::{Body, to_bytes},
        http::Request,
    };
    use hmac::{Hmac, Mac};
    use power_check_core::config::Config;
    use power_check_github::{
        AuthError, Authenticator,
        checks::{CheckApi, CheckUpdate},
        events::payloads,
    };
    use power_check_jobs::{DedupGuard, Dispatcher, JobQueue, MeasurementJob};
    use serde_json::json;
    use sha2::Sha256;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    use super::*;
    use crate::handlers::build_router;

    const SECRET: &str = "webhook secret";
    const CONFIG: &str = r#"
server:
  port: 3000
github:
  repository: dialog_14683_scratch
  app:
    id: 1234
    webhook_secret: webhook secret
    private_key: unused
circleci:
  token: circle
  project_slug: gh/acme/dialog_14683_scratch
  firmware: { path: ~/builds/app.bin, destination: /fw/app.bin }
  bootloader: { path: ~/builds/loader.bin, destination: /fw/loader.bin }
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

    #[derive(Default)]
    struct RecordingChecks {
        created: Mutex<Vec<String>>,
        updates: Mutex<Vec<CheckUpdate>>,
    }

    #[async_trait]
    impl CheckApi for RecordingChecks {
        async fn create(&self, _repo: &str, _name: &str, head_sha: &str) -> anyhow::Result<u64> {
            self.created.lock().unwrap().push(head_sha.to_string());
            Ok(7)
        }

        async fn update(&self, _repo: &str, _id: u64, update: &CheckUpdate) -> anyhow::Result<()> {
            self.updates.lock().unwrap().push(update.clone());
            Ok(())
        }
    }

    struct FakeAuth {
        checks: Arc<RecordingChecks>,
        succeed: bool,
    }

    #[async_trait]
    impl Authenticator for FakeAuth {
        async fn authenticate(
            &self,
            _installation_id: Option<u64>,
        ) -> Result<Arc<dyn CheckApi>, AuthError> {
            if !self.succeed {
                return Err(AuthError::NoInstallation);
            }
            Ok(self.checks.clone())
        }
    }

    struct TestApp {
        router: Router,
        checks: Arc<RecordingChecks>,
        jobs: mpsc::UnboundedReceiver<MeasurementJob>,
    }

    fn test_app(auth_succeeds: bool) -> TestApp {
        let config: Arc<Config> = Arc::new(serde_yaml::from_str(CONFIG).unwrap());
        let checks = Arc::new(RecordingChecks::default());
        let auth = Arc::new(FakeAuth { checks: checks.clone(), succeed: auth_succeeds });
        let (queue, jobs) = JobQueue::new();
        let dispatcher = Dispatcher::new(config.clone(), auth, DedupGuard::new(), queue);
        let state = AppState { config, dispatcher: Arc::new(dispatcher) };
        TestApp { router: build_router().with_state(state), checks, jobs }
    }

    fn sign(body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn delivery(event: &str, body: &serde_json::Value, signature: Option<String>) -> Request<Body> {
        let body = serde_json::to_vec(body).unwrap();
        let signature = signature.unwrap_or_else(|| sign(&body));
        Request::post("/event_handler")
            .header("Content-Type", "application/json")
            .header("X-GitHub-Event", event)
            .header("X-Hub-Signature-256", signature)
            .body(Body::from(body))
            .unwrap()
    }

    fn repo() -> serde_json::Value {
        payloads::repository("dialog_14683_scratch", "acme/dialog_14683_scratch")
    }

    fn check_run_created(sha: &str) -> serde_json::Value {
        let mut body = payloads::check_run("created", repo(), 4242, sha, 1234);
        body["installation"] = payloads::installation(77);
        body
    }

    async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, String) {
        let response = app.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_index() {
        let app = test_app(true);
        let request = Request::get("/").body(Body::empty()).unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Power check webhook server is running");
    }

    #[tokio::test]
    async fn test_measurement_queued() {
        let mut app = test_app(true);
        let (status, body) =
            send(&app, delivery("check_run", &check_run_created("abc1234"), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Queued check run 4242");
        let job = app.jobs.try_recv().unwrap();
        assert_eq!(job.head_sha, "abc1234");

        let (status, body) =
            send(&app, delivery("check_run", &check_run_created("abc1234"), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Already measuring");
        assert!(app.jobs.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_bad_signature_rejected() {
        let mut app = test_app(true);
        let body = check_run_created("abc1234");
        let forged = format!("sha256={}", "00".repeat(32));
        let (status, _) = send(&app, delivery("check_run", &body, Some(forged))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let unsigned = Request::post("/event_handler")
            .header("X-GitHub-Event", "check_run")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        let (status, _) = send(&app, unsigned).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        assert!(app.jobs.try_recv().is_err());
        assert!(app.checks.updates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_event_header() {
        let app = test_app(true);
        let body = serde_json::to_vec(&check_run_created("abc1234")).unwrap();
        let request = Request::post("/event_handler")
            .header("X-Hub-Signature-256", sign(&body))
            .body(Body::from(body))
            .unwrap();
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_malformed_body() {
        let app = test_app(true);
        let body = b"{not json".to_vec();
        let request = Request::post("/event_handler")
            .header("X-GitHub-Event", "check_run")
            .header("X-Hub-Signature-256", sign(&body))
            .body(Body::from(body))
            .unwrap();
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_app_auth_failure_is_unauthorized() {
        let mut app = test_app(false);
        let (status, body) =
            send(&app, delivery("check_run", &check_run_created("abc1234"), None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, "Unauthorized");
        assert!(app.jobs.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_check_suite_creates_check() {
        let app = test_app(true);
        let body = payloads::check_suite("requested", repo(), "def5678");
        let (status, body) = send(&app, delivery("check_suite", &body, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Created check run 7");
        assert_eq!(*app.checks.created.lock().unwrap(), vec!["def5678".to_string()]);
    }

    #[tokio::test]
    async fn test_other_events_acknowledged() {
        let app = test_app(true);
        let ping = delivery("ping", &json!({"zen": "Design for failure."}), None);
        let (status, body) = send(&app, ping).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "unhandled event");

        let mut other = check_run_created("abc1234");
        other["repository"] = payloads::repository("other", "acme/other");
        let (status, body) = send(&app, delivery("check_run", &other, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "other repository");
    }
}
