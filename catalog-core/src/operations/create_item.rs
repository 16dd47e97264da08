use crate::operations::{run_blocking_write, with_timeout};
use crate::storage::catalog_store::required_field;
use crate::{CatalogStore, ImageStore, Result};
use bytes::Bytes;
use futures_util::future::{self, Ready};
use futures_util::stream::{self, Once, Stream};
use std::convert::Infallible;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

/// An upload already held in memory, shaped as a one-chunk stream.
pub type BufferedImage = Once<Ready<std::result::Result<Bytes, Infallible>>>;

#[derive(Clone)]
pub struct CreateItemOperation {
    image_store: Arc<ImageStore>,
    catalog_store: Arc<CatalogStore>,
    timeout: Duration,
}

pub struct ImageUpload<S> {
    pub file_name: String,
    pub stream: S,
}

impl ImageUpload<BufferedImage> {
    pub fn from_bytes(file_name: impl Into<String>, body: Bytes) -> Self {
        Self {
            file_name: file_name.into(),
            stream: stream::once(future::ready(Ok(body))),
        }
    }
}

pub struct CreateItemOperationRequest<S> {
    pub name: String,
    pub category: String,
    pub image: Option<ImageUpload<S>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateItemOperationResult {
    pub id: i64,
    pub category_id: i64,
    pub image_name: String,
    pub image_reused: bool,
}

impl CreateItemOperation {
    pub fn new(
        image_store: Arc<ImageStore>,
        catalog_store: Arc<CatalogStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            image_store,
            catalog_store,
            timeout,
        }
    }

    /// Store the image (if any), then resolve the category and insert the
    /// item. Validation runs first so a rejected request writes nothing.
    pub async fn run<S, E>(
        &self,
        request: CreateItemOperationRequest<S>,
    ) -> Result<CreateItemOperationResult>
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: Display,
    {
        let CreateItemOperationRequest {
            name,
            category,
            image,
        } = request;

        let name = required_field("name", &name)?.to_string();
        let category = required_field("category", &category)?.to_string();

        let (image_name, image_reused) = match image {
            Some(upload) => {
                let stored = with_timeout(
                    self.timeout,
                    self.image_store.store(upload.stream, &upload.file_name),
                )
                .await?;
                (stored.file_name, stored.reused)
            }
            None => (self.image_store.default_image_name().to_string(), false),
        };

        let catalog_store = self.catalog_store.clone();
        let insert_name = name.clone();
        let insert_image = image_name.clone();
        let created = run_blocking_write(self.timeout, move |gate| {
            catalog_store.create_item_gated(&insert_name, &category, &insert_image, gate)
        })
        .await?;

        tracing::info!(
            "Created item id={} name={} category_id={} image={} reused={}",
            created.id,
            name,
            created.category_id,
            image_name,
            image_reused
        );

        Ok(CreateItemOperationResult {
            id: created.id,
            category_id: created.category_id,
            image_name,
            image_reused,
        })
    }
}
