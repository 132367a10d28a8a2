//! # Image Resource Controller
//!
//! The controller keeps two stores that share no transaction in step: the
//! blob bucket holding image bytes and the `images` table describing them.
//! Each operation is a short saga, a fixed sequence of remote calls whose
//! order is chosen so that a failure part-way through leaves, at worst, an
//! orphaned blob (invisible to clients) rather than a record pointing at a
//! missing blob (which would break every later read of that record).
//!
//! ## Plans
//!
//! | Operation | Steps |
//! |---|---|
//! | create | [`Step::UploadBlob`], [`Step::InsertRecord`] |
//! | replace, delete-first | [`Step::DeleteBlob`], [`Step::UploadBlob`], [`Step::UpdateRecord`] |
//! | replace, upload-first | [`Step::UploadBlob`], [`Step::UpdateRecord`], [`Step::DeleteBlob`] |
//! | delete | [`Step::DeleteBlob`], [`Step::DeleteRecord`] |
//!
//! Delete-first replace is the base behaviour: a failed upload after the old
//! blob is gone leaves a dangling reference until repaired. Upload-first
//! closes that window at the cost of briefly storing both blobs.
//!
//! Backend errors are not retried or translated here; they propagate to the
//! caller after the saga logs which inconsistency, if any, they left behind.
//! [`ImageController::audit`] finds such leftovers after the fact.

use crate::{
    database::{Database, DatabaseError, ImageRecord, NewImage},
    storage::{BlobStore, StorageError},
};
use bytes::Bytes;
use serde::Serialize;
use std::{
    collections::{HashMap, HashSet},
    fmt::Display,
    future::Future,
    str::FromStr,
    sync::{Arc, Mutex, PoisonError},
};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::{error, info, warn};

/// Content type recorded when the client sends none and sniffing fails.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// One remote call inside an image saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    UploadBlob,
    InsertRecord,
    DeleteBlob,
    UpdateRecord,
    DeleteRecord,
}

pub const CREATE_PLAN: &[Step] = &[Step::UploadBlob, Step::InsertRecord];

pub const DELETE_PLAN: &[Step] = &[Step::DeleteBlob, Step::DeleteRecord];

/// Order in which a replace touches the two stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplaceOrder {
    /// Delete the old blob, upload the new one, then update the record.
    #[default]
    DeleteFirst,
    /// Upload the new blob, update the record, then delete the old blob.
    UploadFirst,
}

impl ReplaceOrder {
    pub fn plan(self) -> &'static [Step] {
        match self {
            ReplaceOrder::DeleteFirst => &[Step::DeleteBlob, Step::UploadBlob, Step::UpdateRecord],
            ReplaceOrder::UploadFirst => &[Step::UploadBlob, Step::UpdateRecord, Step::DeleteBlob],
        }
    }
}

impl Display for ReplaceOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplaceOrder::DeleteFirst => write!(f, "delete-first"),
            ReplaceOrder::UploadFirst => write!(f, "upload-first"),
        }
    }
}

impl FromStr for ReplaceOrder {
    type Err = ParseReplaceOrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "delete-first" => Ok(ReplaceOrder::DeleteFirst),
            "upload-first" => Ok(ReplaceOrder::UploadFirst),
            other => Err(ParseReplaceOrderError(other.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("unknown replace order {0:?}, expected `delete-first` or `upload-first`")]
pub struct ParseReplaceOrderError(String);

/// What a half-finished saga leaves behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inconsistency {
    /// A blob no record refers to.
    OrphanedBlob,
    /// A record whose blob is gone.
    DanglingReference,
}

/// Classifies the state left when `failed` errors after `completed` succeeded.
///
/// `None` means both stores still agree with each other.
pub fn inconsistency_after(completed: &[Step], failed: Step) -> Option<Inconsistency> {
    let done = |step| completed.contains(&step);
    let record_written = done(Step::InsertRecord) || done(Step::UpdateRecord);

    if done(Step::DeleteBlob) && !done(Step::UpdateRecord) && !done(Step::DeleteRecord) {
        return Some(Inconsistency::DanglingReference);
    }
    if done(Step::UploadBlob) && !record_written {
        return Some(Inconsistency::OrphanedBlob);
    }
    if done(Step::UpdateRecord) && failed == Step::DeleteBlob {
        return Some(Inconsistency::OrphanedBlob);
    }

    None
}

/// Runs the steps of one plan in order and reports what a failure leaves behind.
#[derive(Debug)]
pub struct Saga {
    operation: &'static str,
    plan: &'static [Step],
    completed: Vec<Step>,
}

impl Saga {
    pub fn new(operation: &'static str, plan: &'static [Step]) -> Self {
        Saga {
            operation,
            plan,
            completed: Vec::with_capacity(plan.len()),
        }
    }

    /// Steps that have succeeded (or were skipped) so far.
    pub fn completed(&self) -> &[Step] {
        &self.completed
    }

    /// Awaits `call` as `step`. `subject` names the blob key or record id it acts on.
    pub async fn run<T, E, F>(&mut self, step: Step, subject: &str, call: F) -> Result<T, AppError>
    where
        F: Future<Output = Result<T, E>>,
        AppError: From<E>,
    {
        self.expect_next(step);

        match call.await {
            Ok(value) => {
                self.completed.push(step);
                Ok(value)
            }
            Err(e) => {
                let err = AppError::from(e);
                self.report(step, subject, &err);
                Err(err)
            }
        }
    }

    /// Marks `step` as done without a remote call.
    pub fn skip(&mut self, step: Step) {
        self.expect_next(step);
        self.completed.push(step);
    }

    fn expect_next(&self, step: Step) {
        debug_assert_eq!(
            self.plan.get(self.completed.len()),
            Some(&step),
            "{} saga ran {:?} out of plan order",
            self.operation,
            step
        );
    }

    fn report(&self, step: Step, subject: &str, err: &AppError) {
        let operation = self.operation;
        match inconsistency_after(&self.completed, step) {
            Some(Inconsistency::OrphanedBlob) => error!(
                operation, ?step, subject, error = %err,
                "saga step failed, leaving an orphaned blob"
            ),
            Some(Inconsistency::DanglingReference) => error!(
                operation, ?step, subject, error = %err,
                "saga step failed, leaving a record that points at a missing blob"
            ),
            None => warn!(
                operation, ?step, subject, error = %err,
                "saga step failed, stores remain consistent"
            ),
        }
    }
}

/// An uploaded file as received from a client.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageUpload {
    /// Client-supplied name, used verbatim as the blob key.
    pub filename: String,
    pub content_type: String,
    pub bytes: Bytes,
}

impl ImageUpload {
    /// Creates an upload, sniffing the content type from the bytes when the
    /// client did not send one.
    pub fn new(
        filename: impl Into<String>,
        content_type: Option<&str>,
        bytes: impl Into<Bytes>,
    ) -> Self {
        let bytes = bytes.into();
        let content_type = content_type
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| sniff_content_type(&bytes));

        ImageUpload {
            filename: filename.into(),
            content_type,
            bytes,
        }
    }

    pub fn filesize(&self) -> i64 {
        self.bytes.len() as i64
    }

    fn to_record(&self, access_url: &str) -> NewImage {
        NewImage {
            filename: self.filename.clone(),
            filesize_bytes: self.filesize(),
            mime_type: self.content_type.clone(),
            access_url: access_url.to_string(),
        }
    }
}

/// Guesses a MIME type from magic bytes.
pub fn sniff_content_type(bytes: &[u8]) -> String {
    infer::get(bytes)
        .map(|kind| kind.mime_type().to_string())
        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string())
}

/// Outcome of a successful create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Uploaded {
    pub id: i64,
    pub filename: String,
    pub access_url: String,
}

/// Outcome of a successful replace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Replaced {
    pub id: i64,
    pub new_url: String,
}

/// Blobs and records that disagree with each other.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    /// Keys in the bucket that no record names.
    pub orphaned_blobs: Vec<String>,
    /// Records whose blob is missing from the bucket.
    pub dangling_records: Vec<ImageRecord>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.orphaned_blobs.is_empty() && self.dangling_records.is_empty()
    }
}

/// Per-record mutual exclusion for replace and delete.
///
/// Without it, two writers on the same id race: both read the same previous
/// filename and the last update to commit wins.
#[derive(Debug, Default)]
pub struct RecordLocks {
    locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl RecordLocks {
    /// Waits until no other holder has `id`, then holds it until the guard drops.
    pub async fn acquire(&self, id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Entries only the map still refers to are neither held nor awaited.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(id).or_default().clone()
        };

        lock.lock_owned().await
    }
}

/// Orchestrates the blob store and the database for image requests.
///
/// Both backends are injected so the controller can run against fakes.
#[derive(Debug)]
pub struct ImageController<B> {
    storage: B,
    db: Database,
    replace_order: ReplaceOrder,
    locks: Option<RecordLocks>,
}

impl<B: BlobStore> ImageController<B> {
    pub fn new(storage: B, db: Database) -> Self {
        ImageController {
            storage,
            db,
            replace_order: ReplaceOrder::default(),
            locks: None,
        }
    }

    pub fn with_replace_order(mut self, order: ReplaceOrder) -> Self {
        self.replace_order = order;
        self
    }

    /// Serializes replace and delete per record id.
    pub fn with_record_locks(mut self) -> Self {
        self.locks = Some(RecordLocks::default());
        self
    }

    pub fn storage(&self) -> &B {
        &self.storage
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Stores a new image: blob first, then the record pointing at it.
    ///
    /// # Errors
    /// - `AppError::MissingFile` if `upload` is `None`; nothing is written.
    /// - Storage or database errors from the backends. An insert failure
    ///   leaves the freshly uploaded blob orphaned.
    pub async fn upload(&self, upload: Option<ImageUpload>) -> Result<Uploaded, AppError> {
        let upload = upload.ok_or(AppError::MissingFile)?;
        let mut saga = Saga::new("create", CREATE_PLAN);

        let access_url = saga
            .run(Step::UploadBlob, &upload.filename, self.put(&upload))
            .await?;
        let id = saga
            .run(
                Step::InsertRecord,
                &upload.filename,
                self.db.insert_image(&upload.to_record(&access_url)),
            )
            .await?;

        info!(id, filename = %upload.filename, "image uploaded");

        Ok(Uploaded {
            id,
            filename: upload.filename,
            access_url,
        })
    }

    /// Returns every record. No pagination.
    pub async fn list(&self) -> Result<Vec<ImageRecord>, AppError> {
        Ok(self.db.list_images().await?)
    }

    /// Swaps the blob behind record `id` and rewrites the record to match.
    ///
    /// The record is looked up before the upload is validated, so an unknown
    /// id is reported even when the file is missing too.
    pub async fn replace(&self, id: i64, upload: Option<ImageUpload>) -> Result<Replaced, AppError> {
        let _guard = self.lock(id).await;

        let current = self
            .db
            .find_image(id)
            .await?
            .ok_or(AppError::NotFound { id })?;
        let upload = upload.ok_or(AppError::MissingFile)?;

        let mut saga = Saga::new("replace", self.replace_order.plan());
        let record_subject = id.to_string();

        let new_url = match self.replace_order {
            ReplaceOrder::DeleteFirst => {
                saga.run(
                    Step::DeleteBlob,
                    &current.filename,
                    self.delete_previous_blob(&current.filename),
                )
                .await?;
                let url = saga
                    .run(Step::UploadBlob, &upload.filename, self.put(&upload))
                    .await?;
                saga.run(
                    Step::UpdateRecord,
                    &record_subject,
                    self.db.update_image(id, &upload.to_record(&url)),
                )
                .await?;
                url
            }
            ReplaceOrder::UploadFirst => {
                let url = saga
                    .run(Step::UploadBlob, &upload.filename, self.put(&upload))
                    .await?;
                saga.run(
                    Step::UpdateRecord,
                    &record_subject,
                    self.db.update_image(id, &upload.to_record(&url)),
                )
                .await?;
                // Same key: the upload already overwrote the old content.
                if current.filename == upload.filename {
                    saga.skip(Step::DeleteBlob);
                } else {
                    saga.run(
                        Step::DeleteBlob,
                        &current.filename,
                        self.delete_previous_blob(&current.filename),
                    )
                    .await?;
                }
                url
            }
        };

        info!(id, order = %self.replace_order, filename = %upload.filename, "image replaced");

        Ok(Replaced { id, new_url })
    }

    /// Removes the blob behind record `id`, then the record itself.
    ///
    /// If the blob cannot be deleted the record is left in place. Returns the
    /// record as it was before deletion.
    pub async fn delete(&self, id: i64) -> Result<ImageRecord, AppError> {
        let _guard = self.lock(id).await;

        let record = self
            .db
            .find_image(id)
            .await?
            .ok_or(AppError::NotFound { id })?;

        let mut saga = Saga::new("delete", DELETE_PLAN);
        saga.run(
            Step::DeleteBlob,
            &record.filename,
            self.delete_previous_blob(&record.filename),
        )
        .await?;
        saga.run(Step::DeleteRecord, &id.to_string(), self.db.delete_image(id))
            .await?;

        info!(id, filename = %record.filename, "image deleted");

        Ok(record)
    }

    /// Compares bucket keys with record filenames.
    ///
    /// Read-only. Keys are listed before records, so a create that is between
    /// its two steps shows up as an orphan.
    pub async fn audit(&self) -> Result<AuditReport, AppError> {
        let keys: HashSet<String> = self.storage.list_keys().await?.into_iter().collect();
        let records = self.db.list_images().await?;

        let referenced: HashSet<&str> = records.iter().map(|r| r.filename.as_str()).collect();

        let mut orphaned_blobs: Vec<String> = keys
            .iter()
            .filter(|key| !referenced.contains(key.as_str()))
            .cloned()
            .collect();
        orphaned_blobs.sort();

        let dangling_records = records
            .iter()
            .filter(|record| !keys.contains(&record.filename))
            .cloned()
            .collect();

        Ok(AuditReport {
            orphaned_blobs,
            dangling_records,
        })
    }

    async fn put(&self, upload: &ImageUpload) -> Result<String, StorageError> {
        self.storage
            .put(&upload.filename, upload.bytes.clone(), &upload.content_type)
            .await
    }

    /// Deletes the blob a record currently names.
    ///
    /// The stored filename is authoritative, so an already-missing blob counts
    /// as deleted.
    async fn delete_previous_blob(&self, key: &str) -> Result<(), StorageError> {
        match self.storage.delete(key).await {
            Err(e) if e.is_not_found() => {
                warn!(key, "previous blob was already missing");
                Ok(())
            }
            other => other,
        }
    }

    async fn lock(&self, id: i64) -> Option<OwnedMutexGuard<()>> {
        match &self.locks {
            Some(locks) => Some(locks.acquire(id).await),
            None => None,
        }
    }
}

/// Error types within the application, encapsulating storage, database, and request errors.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("no file part in request")]
    MissingFile,

    #[error("image not found: {id}")]
    NotFound { id: i64 },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("database error: {0}")]
    Database(#[from] DatabaseError),
}
