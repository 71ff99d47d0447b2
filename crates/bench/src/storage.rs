use std::{path::Path, sync::Arc};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use object_store::{
    Attribute, AttributeValue, Attributes, ObjectStore, PutOptions, PutPayload,
    aws::AmazonS3Builder, path::Path as ObjectPath,
};
use power_check_core::config::{HttpStorageConfig, S3StorageConfig, StorageConfig};
use reqwest::{Client, header};
use url::Url;

use crate::ArtifactStore;

/// Build the store selected by the configuration.
pub fn from_config(config: &StorageConfig) -> Result<Arc<dyn ArtifactStore>> {
    Ok(match config {
        StorageConfig::Http(config) => Arc::new(HttpArtifactStore::new(config)?),
        StorageConfig::S3(config) => Arc::new(ObjectArtifactStore::s3(config)?),
    })
}

/// Uploads measurement files with HTTP `PUT` to an object store bucket
/// (S3 presigned prefix, GCS, or any WebDAV-style endpoint).
#[derive(Clone)]
pub struct HttpArtifactStore {
    client: Client,
    upload_url: Url,
    public_url: Url,
    token: Option<String>,
}

impl HttpArtifactStore {
    pub fn new(config: &HttpStorageConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("power-check/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create storage client")?;
        Ok(Self {
            client,
            upload_url: with_trailing_slash(config.upload_url.clone()),
            public_url: with_trailing_slash(config.public_url.clone()),
            token: config.token.clone(),
        })
    }
}

/// `Url::join` replaces the last path segment unless the base ends in `/`.
fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

fn file_name(path: &Path) -> Result<&str> {
    path.file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("Invalid upload file name {}", path.display()))
}

fn content_type(path: &Path) -> mime::Mime {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("png") => mime::IMAGE_PNG,
        Some(ext) if ext.eq_ignore_ascii_case("csv") => mime::TEXT_CSV,
        _ => mime::APPLICATION_OCTET_STREAM,
    }
}

#[async_trait]
impl ArtifactStore for HttpArtifactStore {
    async fn upload(&self, path: &Path) -> Result<String> {
        let name = file_name(path)?;
        let body = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let size = body.len();
        let target = self.upload_url.join(name)?;
        let mut request = self
            .client
            .put(target.clone())
            .header(header::CONTENT_TYPE, content_type(path).as_ref())
            .body(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response =
            request.send().await.with_context(|| format!("Failed to upload {name} to {target}"))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Upload of {} to {} failed with {}: {}", name, target, status, text);
        }
        let url = self.public_url.join(name)?;
        tracing::info!("Uploaded {} ({} bytes) to {}", name, size, url);
        Ok(url.to_string())
    }
}

/// Uploads measurement files to an [`ObjectStore`] bucket under a key prefix.
pub struct ObjectArtifactStore {
    store: Arc<dyn ObjectStore>,
    prefix: ObjectPath,
    public_url: Url,
}

impl ObjectArtifactStore {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: Option<&str>, public_url: Url) -> Self {
        Self {
            store,
            prefix: prefix.map(ObjectPath::from).unwrap_or_default(),
            public_url: with_trailing_slash(public_url),
        }
    }

    pub fn s3(config: &S3StorageConfig) -> Result<Self> {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.with_endpoint(endpoint);
        }
        if let Some(key_id) = &config.access_key_id {
            builder = builder.with_access_key_id(key_id);
        }
        if let Some(secret) = &config.secret_access_key {
            builder = builder.with_secret_access_key(secret);
        }
        let store = builder
            .build()
            .with_context(|| format!("Failed to create S3 client for bucket {}", config.bucket))?;
        let public_url = config.public_url().context("Invalid S3 public URL")?;
        Ok(Self::new(Arc::new(store), config.prefix.as_deref(), public_url))
    }

    fn location(&self, name: &str) -> ObjectPath { self.prefix.child(name) }
}

#[async_trait]
impl ArtifactStore for ObjectArtifactStore {
    async fn upload(&self, path: &Path) -> Result<String> {
        let name = file_name(path)?;
        let body = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let size = body.len();
        let location = self.location(name);
        let mut attributes = Attributes::new();
        let mime = content_type(path).to_string();
        attributes.insert(Attribute::ContentType, AttributeValue::from(mime));
        self.store
            .put_opts(&location, PutPayload::from(body), PutOptions::from(attributes))
            .await
            .with_context(|| format!("Failed to upload {name} to {location}"))?;
        let url = self.public_url.join(location.as_ref())?;
        tracing::info!("Uploaded {} ({} bytes) to {}", name, size, url);
        Ok(url.to_string())
    }
}
