use crate::operations::{run_blocking, with_timeout};
use crate::{content_type_for, CatalogError, CatalogStore, ImageStore, Result};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct ReadImageOperation {
    catalog_store: Arc<CatalogStore>,
    image_store: Arc<ImageStore>,
    timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadImageOperationRequest {
    ItemId(i64),
    FileName(String),
}

impl ReadImageOperationRequest {
    /// Numeric keys address items; anything else is a stored file name.
    pub fn parse(key: &str) -> Self {
        match key.parse::<i64>() {
            Ok(id) => Self::ItemId(id),
            Err(_) => Self::FileName(key.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReadImageOperationResult {
    pub path: PathBuf,
    pub content_type: &'static str,
    pub body: Bytes,
    pub is_default: bool,
}

#[derive(Debug, Clone)]
pub enum ReadImageOperationOutcome {
    Found(ReadImageOperationResult),
    /// Neither the requested image nor the sentinel exists.
    Missing,
}

impl ReadImageOperation {
    pub fn new(
        catalog_store: Arc<CatalogStore>,
        image_store: Arc<ImageStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            catalog_store,
            image_store,
            timeout,
        }
    }

    /// Path of the image to serve. Unknown items and missing files resolve
    /// to the sentinel image instead of failing.
    pub async fn resolve_path(&self, request: &ReadImageOperationRequest) -> Result<PathBuf> {
        let file_name = match request {
            ReadImageOperationRequest::ItemId(id) => {
                let store = self.catalog_store.clone();
                let id = *id;
                let name = run_blocking(self.timeout, move || store.get_image_name(id)).await?;
                if name.is_none() {
                    tracing::warn!("No item with id {}, serving default image", id);
                }
                name
            }
            ReadImageOperationRequest::FileName(name) => Some(name.clone()),
        };

        Ok(self.image_store.resolve_or_default(file_name.as_deref()))
    }

    pub async fn run(
        &self,
        request: ReadImageOperationRequest,
    ) -> Result<ReadImageOperationOutcome> {
        let path = self.resolve_path(&request).await?;
        let is_default = path == self.image_store.default_image_path();

        let body = match with_timeout(self.timeout, read_file(&path)).await {
            Ok(body) => body,
            Err(CatalogError::Read(message)) if is_default => {
                tracing::warn!("Default image unavailable: {}", message);
                return Ok(ReadImageOperationOutcome::Missing);
            }
            Err(error) => return Err(error),
        };

        Ok(ReadImageOperationOutcome::Found(ReadImageOperationResult {
            content_type: content_type_for(&path),
            path,
            body,
            is_default,
        }))
    }
}

async fn read_file(path: &Path) -> Result<Bytes> {
    tokio::fs::read(path)
        .await
        .map(Bytes::from)
        .map_err(|error| CatalogError::Read(format!("{:?}: {}", path, error)))
}
