//! Storage modules for the catalog
//!
//! Content-addressed image files and the relational item/category store.

pub mod catalog_store;
pub mod image_store;

pub use catalog_store::{CatalogStore, CatalogStoreOptions, CommitGate, CreatedItem, ItemRecord};
pub use image_store::{compute_hash, content_type_for, file_extension, ImageStore, StoreImageResult};
