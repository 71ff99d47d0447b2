use std::sync::Arc;

use power_check_core::config::Config;
use power_check_github::{
    AuthError, Authenticator,
    checks::CheckRun,
    events::{InboundEvent, Route},
};

use crate::{DedupGuard, JobQueue, MeasurementJob};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("failed to create check run: {0:#}")]
    CreateCheck(anyhow::Error),
    #[error("measurement queue is closed")]
    QueueClosed,
}

/// What the dispatcher did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    Ignored(&'static str),
    /// A run for this commit is already in flight or just started.
    Duplicate,
    CheckCreated(u64),
    Enqueued(u64),
}

/// Routes verified events to check run creation or the measurement queue.
pub struct Dispatcher {
    config: Arc<Config>,
    auth: Arc<dyn Authenticator>,
    guard: DedupGuard,
    queue: JobQueue,
}

impl Dispatcher {
    pub fn new(
        config: Arc<Config>,
        auth: Arc<dyn Authenticator>,
        guard: DedupGuard,
        queue: JobQueue,
    ) -> Self {
        Self { config, auth, guard, queue }
    }

    pub fn guard(&self) -> &DedupGuard { &self.guard }

    pub async fn dispatch(&self, event: &InboundEvent) -> Result<Dispatched, DispatchError> {
        let route = event.route();
        if route == Route::Ignore {
            return Ok(Dispatched::Ignored("unhandled event"));
        }
        let (Some(repository), Some(full_name)) = (event.repository(), event.repository_full_name())
        else {
            return Ok(Dispatched::Ignored("no repository"));
        };
        if repository.name != self.config.github.repository {
            tracing::info!("Ignoring {} event for {}", event.name, full_name);
            return Ok(Dispatched::Ignored("other repository"));
        }
        let Some(head_sha) = event.head_sha() else {
            return Ok(Dispatched::Ignored("no head commit"));
        };
        if event.is_check_run() {
            let app_id = event.check_run().and_then(|run| run.app_id);
            if app_id != Some(self.config.github.app.id) {
                tracing::debug!("Ignoring check run owned by app {:?}", app_id);
                return Ok(Dispatched::Ignored("check run of another app"));
            }
        }

        let api = self.auth.authenticate(event.installation_id()).await?;
        match (route, event.check_run()) {
            (Route::Measure, Some(check_run)) => {
                let Some(permit) = self.guard.check_and_set(head_sha) else {
                    tracing::info!("Measurement of {} already started, skipping", head_sha);
                    return Ok(Dispatched::Duplicate);
                };
                let job = MeasurementJob {
                    check_run: CheckRun::attach(api, &full_name, check_run.id),
                    head_sha: head_sha.to_string(),
                    permit,
                };
                if let Err(job) = self.queue.push(job) {
                    job.permit.revoke();
                    return Err(DispatchError::QueueClosed);
                }
                tracing::info!("Queued measurement of {} (check run {})", head_sha, check_run.id);
                Ok(Dispatched::Enqueued(check_run.id))
            }
            (Route::CreateCheck, _) => {
                let name = self.config.measurement.check_name();
                let run = CheckRun::open(api, &full_name, head_sha, &name)
                    .await
                    .map_err(DispatchError::CreateCheck)?;
                Ok(Dispatched::CheckCreated(run.id()))
            }
            _ => Ok(Dispatched::Ignored("unhandled event")),
        }
    }
}
