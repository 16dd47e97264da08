//! Catalog Core - items, categories and content-addressed images
//!
//! - SHA256 content-addressed image files with write-once deduplication
//! - SQLite item/category store behind an r2d2 connection pool
//! - Atomic find-or-create for category names
//! - JSON wire codec for item collections

pub mod codec;
pub mod error;
pub mod operations;
pub mod storage;

pub use codec::{decode, encode, ItemCollection};
pub use error::{CatalogError, Result};
pub use operations::{
    BufferedImage, CreateItemOperation, CreateItemOperationRequest, CreateItemOperationResult,
    ImageUpload, ReadImageOperation, ReadImageOperationOutcome, ReadImageOperationRequest,
    ReadImageOperationResult, ReadItemOperationOutcome, ReadItemsOperation,
};
pub use storage::{
    compute_hash, content_type_for, file_extension, CatalogStore, CatalogStoreOptions, CommitGate,
    CreatedItem, ImageStore, ItemRecord, StoreImageResult,
};
