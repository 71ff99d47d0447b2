pub mod checks;
pub mod events;
pub mod webhook;

use std::sync::Arc;

use async_trait::async_trait;
use octocrab::{Octocrab, models::InstallationId};
use power_check_core::config::GitHubAppConfig;

use crate::checks::{CheckApi, GitHubChecks};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("no installation ID configured or present in the event")]
    NoInstallation,
    #[error("failed to create installation client: {0}")]
    Client(octocrab::Error),
    #[error("failed to obtain token for installation {installation_id}: {source}")]
    Exchange { installation_id: u64, source: octocrab::Error },
}

/// Produces an authenticated check run API for an installation.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// `installation_id` is the ID from the event payload, if any. A configured
    /// installation ID takes precedence.
    async fn authenticate(
        &self,
        installation_id: Option<u64>,
    ) -> Result<Arc<dyn CheckApi>, AuthError>;
}

/// Authenticates as a GitHub App with its RSA private key.
pub struct GitHubApp {
    app_client: Octocrab,
    installation_id: Option<u64>,
}

impl GitHubApp {
    pub fn new(config: &GitHubAppConfig) -> anyhow::Result<Self> {
        let key = jsonwebtoken::EncodingKey::from_rsa_pem(config.private_key_pem().as_bytes())?;
        let app_client = Octocrab::builder().app(config.id.into(), key).build()?;
        Ok(Self { app_client, installation_id: config.installation_id })
    }

    pub fn installation_id(&self, from_event: Option<u64>) -> Result<u64, AuthError> {
        self.installation_id.or(from_event).ok_or(AuthError::NoInstallation)
    }
}

#[async_trait]
impl Authenticator for GitHubApp {
    /// Mints an installation token up front so a bad key or installation is
    /// rejected before any check run is touched. The returned client renews
    /// the token by itself when it nears expiry.
    async fn authenticate(
        &self,
        installation_id: Option<u64>,
    ) -> Result<Arc<dyn CheckApi>, AuthError> {
        let installation_id = self.installation_id(installation_id)?;
        let (client, _token) = self
            .app_client
            .installation_and_token(InstallationId(installation_id))
            .await
            .map_err(|source| match source {
                octocrab::Error::Installation { .. } => AuthError::Client(source),
                source => AuthError::Exchange { installation_id, source },
            })?;
        tracing::debug!("Authenticated as installation {}", installation_id);
        Ok(Arc::new(GitHubChecks { client }))
    }
}
