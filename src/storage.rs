//! Blob storage for image content.
//!
//! A bucket maps an opaque key (the uploaded filename) to bytes plus a content
//! type, and hands back a stable public URL for every object it writes.
//! Two backends exist: a directory on local disk and a Google Cloud Storage
//! bucket. [`Bucket`] picks one at runtime from configuration.

mod gcs;
mod local;

pub use gcs::GcsBucket;
pub use local::LocalBucket;

use crate::config::StorageConfig;
use bytes::Bytes;
use std::future::Future;
use thiserror::Error;

/// Async object storage contract used by the controller.
///
/// Futures are required to be `Send` so handlers can run on a multi-threaded
/// runtime regardless of which backend sits behind them.
pub trait BlobStore: Send + Sync {
    /// Writes `content` under `key`, overwriting any previous object, makes it
    /// publicly readable and returns its public URL.
    fn put(
        &self,
        key: &str,
        content: Bytes,
        content_type: &str,
    ) -> impl Future<Output = Result<String, StorageError>> + Send;

    /// Removes the object at `key`.
    ///
    /// Returns [`StorageError::NotFound`] when nothing is stored there.
    fn delete(&self, key: &str) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Lists every key currently held by the bucket.
    fn list_keys(&self) -> impl Future<Output = Result<Vec<String>, StorageError>> + Send;

    /// The address an object stored under `key` is served from.
    fn public_url(&self, key: &str) -> String;
}

/// The configured bucket backend.
#[derive(Debug)]
pub enum Bucket {
    Local(LocalBucket),
    Gcs(GcsBucket),
}

impl Bucket {
    /// Builds the backend described by `config`.
    pub fn from_config(config: &StorageConfig) -> Result<Self, StorageError> {
        match config {
            StorageConfig::Local {
                root,
                public_base_url,
            } => Ok(Bucket::Local(LocalBucket::new(
                root.clone(),
                public_base_url.clone(),
            ))),
            StorageConfig::Gcs {
                bucket,
                credentials_file,
                emulator_host,
            } => Ok(Bucket::Gcs(GcsBucket::new(
                bucket.clone(),
                credentials_file.clone(),
                emulator_host.clone(),
            )?)),
        }
    }
}

impl BlobStore for Bucket {
    async fn put(
        &self,
        key: &str,
        content: Bytes,
        content_type: &str,
    ) -> Result<String, StorageError> {
        match self {
            Bucket::Local(bucket) => bucket.put(key, content, content_type).await,
            Bucket::Gcs(bucket) => bucket.put(key, content, content_type).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match self {
            Bucket::Local(bucket) => bucket.delete(key).await,
            Bucket::Gcs(bucket) => bucket.delete(key).await,
        }
    }

    async fn list_keys(&self) -> Result<Vec<String>, StorageError> {
        match self {
            Bucket::Local(bucket) => bucket.list_keys().await,
            Bucket::Gcs(bucket) => bucket.list_keys().await,
        }
    }

    fn public_url(&self, key: &str) -> String {
        match self {
            Bucket::Local(bucket) => bucket.public_url(key),
            Bucket::Gcs(bucket) => bucket.public_url(key),
        }
    }
}

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Nothing is stored under the key.
    #[error("blob not found: {key}")]
    NotFound { key: String },

    /// The key cannot name an object in this backend.
    #[error("invalid blob key: {key:?}")]
    InvalidKey { key: String },

    /// Filesystem error in the local backend.
    #[error("filesystem error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    /// The remote backend could not be reached or returned an unreadable body.
    #[error("request for {key} failed: {source}")]
    Http {
        key: String,
        #[source]
        source: reqwest::Error,
    },

    /// The remote backend answered with a non-success status.
    #[error("backend rejected {key} with status {status}: {message}")]
    Rejected {
        key: String,
        status: u16,
        message: String,
    },

    /// No usable credentials for the remote backend.
    #[error("credentials error: {0}")]
    Credentials(String),
}

impl StorageError {
    /// True when the error only says the object was already absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}
