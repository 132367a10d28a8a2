//! # Image Vault
//!
//! This crate stores uploaded images in an object-storage bucket and records
//! their metadata in a relational table, keeping the two in step without a
//! shared transaction. The primary functionality is exposed through the
//! [`ImageController`](app::ImageController), which runs create, list, replace
//! and delete against any [`BlobStore`](storage::BlobStore) and a
//! [`Database`](database::Database).
//!
//! ## Features
//!
//! - **Ordered writes**: every mutating operation touches the bucket and the
//!   table in a fixed order, so partial failures leave orphaned blobs rather
//!   than records pointing at nothing.
//! - **Pluggable buckets**: a local directory or a Google Cloud Storage bucket.
//! - **Pluggable databases**: SQLite (default) or MySQL, chosen by feature flag.
//! - **Audit**: a read-only report of blobs and records that disagree.
//! - **JSON or XML**: responses rendered by [`format`] according to `Accept`.
//!
//! ## Usage
//!
//! ```no_run
//! use imgvault::prelude::*;
//! use std::path::PathBuf;
//!
//! async fn store_cat(bytes: Vec<u8>) -> Result<(), AppError> {
//!     let storage = LocalBucket::new(PathBuf::from("./blobs"), "http://localhost:5000/blobs");
//!     let db = Database::connect("sqlite://images.db", 5).await?;
//!     let images = ImageController::new(storage, db);
//!
//!     let uploaded = images
//!         .upload(Some(ImageUpload::new("cat.png", Some("image/png"), bytes)))
//!         .await?;
//!     println!("stored {} at {}", uploaded.id, uploaded.access_url);
//!
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod config;
pub mod database;
mod dialect;
pub mod format;
pub mod storage;

pub mod prelude {
    pub use crate::app::{
        AppError, AuditReport, ImageController, ImageUpload, Replaced, ReplaceOrder, Uploaded,
    };
    pub use crate::config::{Config, ConfigError, StorageConfig};
    pub use crate::database::{Database, DatabaseError, ImageRecord};
    pub use crate::format::{Formatted, ResponseFormat};
    pub use crate::storage::{BlobStore, Bucket, GcsBucket, LocalBucket, StorageError};
}
