use std::{fmt::Display, sync::Arc};

use axum::{
    body::Bytes,
    extract::{FromRef, FromRequest, Request},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use hmac::{Hmac, Mac};
use power_check_core::config::Config;
use sha1::Sha1;
use sha2::Sha256;

use crate::events::InboundEvent;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header missing")]
    Missing,
    #[error("signature header malformed")]
    Malformed,
    #[error("unsupported signature algorithm {0}")]
    UnsupportedAlgorithm(String),
    #[error("signature mismatch")]
    Mismatch,
}

/// Check a `<algorithm>=<hexdigest>` signature header against the HMAC of
/// `body` keyed with `secret`. The digest comparison is constant-time.
pub fn verify_signature(
    secret: &[u8],
    body: &[u8],
    header: Option<&str>,
) -> Result<(), SignatureError> {
    let header = header.ok_or(SignatureError::Missing)?;
    let (algorithm, digest) = header.split_once('=').ok_or(SignatureError::Malformed)?;
    let digest = hex::decode(digest).map_err(|_| SignatureError::Malformed)?;
    let result = match algorithm {
        "sha256" => {
            let mut mac = Hmac::<Sha256>::new_from_slice(secret)
                .map_err(|_| SignatureError::Malformed)?;
            mac.update(body);
            mac.verify_slice(&digest)
        }
        "sha1" => {
            let mut mac =
                Hmac::<Sha1>::new_from_slice(secret).map_err(|_| SignatureError::Malformed)?;
            mac.update(body);
            mac.verify_slice(&digest)
        }
        other => return Err(SignatureError::UnsupportedAlgorithm(other.to_string())),
    };
    result.map_err(|_| SignatureError::Mismatch)
}

/// The signature header to check: `X-Hub-Signature-256` when present, else the
/// legacy SHA-1 `X-Hub-Signature`.
pub fn signature_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("X-Hub-Signature-256")
        .or_else(|| headers.get("X-Hub-Signature"))
        .and_then(|v| v.to_str().ok())
}

/// Verify and extract GitHub Event Payload.
#[derive(Clone)]
#[must_use]
pub struct GitHubEvent {
    pub event: InboundEvent,
}

impl<S> FromRequest<S> for GitHubEvent
where
    Arc<Config>: FromRef<S>,
    S: Send + Sync + Clone,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        fn err(status: StatusCode, m: impl Display) -> Response {
            tracing::error!("{m}");
            (status, m.to_string()).into_response()
        }
        let name = req
            .headers()
            .get("X-GitHub-Event")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| err(StatusCode::BAD_REQUEST, "X-GitHub-Event header missing"))?
            .to_string();
        let signature = signature_header(req.headers()).map(str::to_string);
        let config = <Arc<Config>>::from_ref(state);
        let body = Bytes::from_request(req, state)
            .await
            .map_err(|_| err(StatusCode::BAD_REQUEST, "error reading body"))?;
        verify_signature(config.github.app.webhook_secret.as_bytes(), &body, signature.as_deref())
            .map_err(|e| err(StatusCode::UNAUTHORIZED, e))?;
        let event = InboundEvent::parse(&name, &body)
            .map_err(|e| err(StatusCode::BAD_REQUEST, format!("error parsing body: {e}")))?;
        tracing::debug!("---- received event {}", name);
        if let Some(action) = event.action() {
            tracing::debug!("----    action: {}", action);
        }
        Ok(GitHubEvent { event })
    }
}
