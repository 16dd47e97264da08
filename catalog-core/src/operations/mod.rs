pub mod create_item;
pub mod read_image;
pub mod read_items;

pub use create_item::{
    BufferedImage, CreateItemOperation, CreateItemOperationRequest, CreateItemOperationResult,
    ImageUpload,
};
pub use read_image::{
    ReadImageOperation, ReadImageOperationOutcome, ReadImageOperationRequest,
    ReadImageOperationResult,
};
pub use read_items::{ReadItemOperationOutcome, ReadItemsOperation};

use crate::{CatalogError, CommitGate, Result};
use std::future::Future;
use std::time::Duration;

/// Run blocking store work off the async workers, bounded by `timeout`.
pub(crate) async fn run_blocking<T, F>(timeout: Duration, task: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(task)).await {
        Ok(joined) => joined?,
        Err(_) => Err(CatalogError::Timeout(timeout)),
    }
}

/// Like [`run_blocking`] for work that commits a transaction through a
/// [`CommitGate`]. On timeout the gate is cancelled so the abandoned task
/// rolls back instead of committing behind the caller. If the commit had
/// already started, its outcome is awaited and reported instead.
pub(crate) async fn run_blocking_write<T, F>(timeout: Duration, task: F) -> Result<T>
where
    F: FnOnce(&CommitGate) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let gate = CommitGate::new();
    let task_gate = gate.clone();
    let mut handle = tokio::task::spawn_blocking(move || task(&task_gate));

    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(joined) => joined?,
        Err(_) if gate.cancel() => Err(CatalogError::Timeout(timeout)),
        Err(_) => handle.await?,
    }
}

pub(crate) async fn with_timeout<T, F>(timeout: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(timeout, future)
        .await
        .unwrap_or(Err(CatalogError::Timeout(timeout)))
}
