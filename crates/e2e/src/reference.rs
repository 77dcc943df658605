//! Reference image stores
//!
//! A missing reference is an expected state (new example, new version) and
//! is reported as `Ok(None)`. Only transport or I/O failures are errors.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, info};

use gallery_common::Example;

use crate::config::ReferenceConfig;
use crate::error::{E2eError, E2eResult};

/// Source of known-good images
#[async_trait]
pub trait ReferenceStore: Send + Sync {
    /// Location of the example's reference image, for messages
    fn reference_url(&self, example: &Example) -> String;

    /// Fetch the reference image bytes, `None` if there is none
    async fn fetch(&self, example: &Example) -> E2eResult<Option<Vec<u8>>>;
}

/// Reference images served over HTTP(S), keyed by `<version>/<relpath>.png`
pub struct HttpReferenceStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpReferenceStore {
    pub fn new(base_url: impl Into<String>) -> E2eResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ReferenceStore for HttpReferenceStore {
    fn reference_url(&self, example: &Example) -> String {
        format!("{}/{}", self.base_url, example.artifacts.reference_key)
    }

    async fn fetch(&self, example: &Example) -> E2eResult<Option<Vec<u8>>> {
        let url = self.reference_url(example);
        debug!("Fetching reference image {}", url);

        let response = self.client.get(&url).send().await?;
        match response.status() {
            // Object stores answer 403 for keys that do not exist
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN => Ok(None),
            status if status.is_success() => Ok(Some(response.bytes().await?.to_vec())),
            status => Err(E2eError::Reference(format!("GET {} returned {}", url, status))),
        }
    }
}

/// Reference images in a local directory tree
pub struct DirReferenceStore {
    root: PathBuf,
}

impl DirReferenceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, example: &Example) -> PathBuf {
        self.root.join(&example.artifacts.reference_key)
    }
}

#[async_trait]
impl ReferenceStore for DirReferenceStore {
    fn reference_url(&self, example: &Example) -> String {
        self.path_for(example).display().to_string()
    }

    async fn fetch(&self, example: &Example) -> E2eResult<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(example)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Build the store named by the configuration, if any
pub fn store_from_config(config: &ReferenceConfig) -> E2eResult<Option<Box<dyn ReferenceStore>>> {
    let Some(source) = config.source.as_deref() else {
        return Ok(None);
    };

    if source.starts_with("http://") || source.starts_with("https://") {
        info!("Using reference images from {}", source);
        Ok(Some(Box::new(HttpReferenceStore::new(source)?)))
    } else {
        info!("Using reference images from directory {}", source);
        Ok(Some(Box::new(DirReferenceStore::new(source))))
    }
}

/// Write fetched reference bytes to the local reference path, creating
/// parent directories as needed. Safe to call repeatedly.
pub async fn persist_reference(path: &Path, bytes: &[u8]) -> E2eResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await?;
    Ok(())
}
