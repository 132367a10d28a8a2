use crate::dialect::{CurrentDialect, CurrentRow, Dialect};
pub use crate::dialect::Db;
use serde::Serialize;
pub use sqlx::Pool;
use sqlx::{FromRow, Row, migrate::MigrateDatabase, pool::PoolOptions};
use thiserror::Error;

pub async fn run_migration(pool: &sqlx::Pool<Db>) -> Result<(), sqlx::Error> {
    CurrentDialect::migration(pool).await
}

/// One row of the `images` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageRecord {
    pub id: i64,
    /// Also the key of the backing blob.
    pub filename: String,
    pub filesize_bytes: i64,
    pub mime_type: String,
    /// Public address of the backing blob.
    pub access_url: String,
}

/// The writable columns of an image record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewImage {
    pub filename: String,
    pub filesize_bytes: i64,
    pub mime_type: String,
    pub access_url: String,
}

impl FromRow<'_, CurrentRow> for ImageRecord {
    fn from_row(row: &CurrentRow) -> Result<Self, sqlx::Error> {
        Ok(ImageRecord {
            id: row.try_get("id")?,
            filename: row.try_get("filename")?,
            filesize_bytes: row.try_get("filesize_bytes")?,
            mime_type: row.try_get("mime_type")?,
            access_url: row.try_get("access_url")?,
        })
    }
}

/// A database abstraction for the image metadata table.
///
/// Every method checks a connection out of the pool for its own use only and
/// hands it back before returning, whatever the outcome: reads use a plain
/// pooled connection, writes a transaction that is committed before the
/// method returns and rolled back if it is dropped early.
#[derive(Debug, Clone)]
pub struct Database {
    pool: Pool<Db>,
}

impl Database {
    /// Connects to `url`, creating the database when it does not exist yet,
    /// and runs the migrations.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, DatabaseError> {
        let exists = Db::database_exists(url)
            .await
            .map_err(|e| DatabaseError::Connection { source: e })?;
        if !exists {
            tracing::info!("creating database");
            Db::create_database(url)
                .await
                .map_err(|e| DatabaseError::Connection { source: e })?;
        }

        let pool = PoolOptions::<Db>::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| DatabaseError::Connection { source: e })?;

        Self::with_migration(pool).await
    }

    /// A private in-memory database, mostly useful for tests.
    ///
    /// The pool holds exactly one connection that never expires, because every
    /// SQLite connection to `:memory:` opens a separate database.
    #[cfg(feature = "sqlite")]
    pub async fn in_memory() -> Result<Self, DatabaseError> {
        let pool = PoolOptions::<Db>::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| DatabaseError::Connection { source: e })?;

        Self::with_migration(pool).await
    }

    pub async fn with_migration(pool: sqlx::Pool<Db>) -> Result<Self, DatabaseError> {
        run_migration(&pool)
            .await
            .map_err(|e| DatabaseError::QueryFailed {
                operation: DbOperation::Migrate,
                sql: "CREATE TABLE IF NOT EXISTS images".to_string(),
                source: e,
            })?;

        Ok(Self { pool })
    }

    /// Inserts a record and returns its generated id.
    pub async fn insert_image(&self, image: &NewImage) -> Result<i64, DatabaseError> {
        let stmt = CurrentDialect::insert_image_statement();
        let mut tx = self.begin().await?;

        let result = sqlx::query(&stmt)
            .bind(&image.filename)
            .bind(image.filesize_bytes)
            .bind(&image.mime_type)
            .bind(&image.access_url)
            .execute(&mut *tx)
            .await
            .map_err(|e| DatabaseError::QueryFailed {
                operation: DbOperation::InsertImage {
                    filename: image.filename.clone(),
                },
                sql: stmt.clone(),
                source: e,
            })?;
        let id = CurrentDialect::last_insert_id(&result);

        commit(tx).await?;

        Ok(id)
    }

    /// Returns every record, ordered by id.
    pub async fn list_images(&self) -> Result<Vec<ImageRecord>, DatabaseError> {
        let stmt = CurrentDialect::select_images_statement();
        let mut conn = self.acquire().await?;

        sqlx::query_as::<_, ImageRecord>(&stmt)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| DatabaseError::QueryFailed {
                operation: DbOperation::SelectImages,
                sql: stmt.clone(),
                source: e,
            })
    }

    pub async fn find_image(&self, id: i64) -> Result<Option<ImageRecord>, DatabaseError> {
        let stmt = CurrentDialect::select_image_statement();
        let mut conn = self.acquire().await?;

        sqlx::query_as::<_, ImageRecord>(&stmt)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| DatabaseError::QueryFailed {
                operation: DbOperation::SelectImage { id },
                sql: stmt.clone(),
                source: e,
            })
    }

    /// Overwrites the writable columns of record `id`.
    ///
    /// Updating an id that no longer exists is not an error.
    pub async fn update_image(&self, id: i64, image: &NewImage) -> Result<(), DatabaseError> {
        let stmt = CurrentDialect::update_image_statement();
        let mut tx = self.begin().await?;

        sqlx::query(&stmt)
            .bind(&image.filename)
            .bind(image.filesize_bytes)
            .bind(&image.mime_type)
            .bind(&image.access_url)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| DatabaseError::QueryFailed {
                operation: DbOperation::UpdateImage { id },
                sql: stmt.clone(),
                source: e,
            })?;

        commit(tx).await
    }

    pub async fn delete_image(&self, id: i64) -> Result<(), DatabaseError> {
        let stmt = CurrentDialect::delete_image_statement();
        let mut tx = self.begin().await?;

        sqlx::query(&stmt)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| DatabaseError::QueryFailed {
                operation: DbOperation::DeleteImage { id },
                sql: stmt.clone(),
                source: e,
            })?;

        commit(tx).await
    }

    async fn acquire(&self) -> Result<sqlx::pool::PoolConnection<Db>, DatabaseError> {
        self.pool
            .acquire()
            .await
            .map_err(|e| DatabaseError::Connection { source: e })
    }

    async fn begin(&self) -> Result<sqlx::Transaction<'static, Db>, DatabaseError> {
        self.pool
            .begin()
            .await
            .map_err(|e| DatabaseError::Connection { source: e })
    }
}

async fn commit(tx: sqlx::Transaction<'static, Db>) -> Result<(), DatabaseError> {
    tx.commit()
        .await
        .map_err(|e| DatabaseError::TransactionFailed { source: e })
}

/// Represents errors that can occur during database operations.
///
/// Each variant includes contextual information to assist with debugging and error handling.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// The database could not be reached or no pooled connection was available.
    #[error("Failed to connect to database")]
    Connection {
        #[source]
        source: sqlx::Error,
    },

    /// A general SQL query failure, with full context including operation and SQL.
    #[error("Query failed during {operation:?}: sql={sql}")]
    QueryFailed {
        operation: DbOperation,
        sql: String,
        #[source]
        source: sqlx::Error,
    },

    /// A failure to commit a transaction.
    #[error("Failed to operate transaction")]
    TransactionFailed {
        #[source]
        source: sqlx::Error,
    },
}

impl DatabaseError {
    /// True when the database itself is out of reach, as opposed to a statement
    /// being rejected.
    pub fn is_unavailable(&self) -> bool {
        let is_unreachable = |e: &sqlx::Error| {
            matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
            )
        };

        match self {
            DatabaseError::Connection { .. } => true,
            DatabaseError::QueryFailed { source, .. } => is_unreachable(source),
            DatabaseError::TransactionFailed { source } => is_unreachable(source),
        }
    }
}

/// Enum representing the kind of database operation being performed,
/// used for attaching context to [`DatabaseError::QueryFailed`].
#[derive(Debug)]
pub enum DbOperation {
    /// CREATE TABLE images
    Migrate,
    /// INSERT INTO images
    InsertImage { filename: String },
    /// SELECT ... FROM images
    SelectImages,
    /// SELECT ... FROM images WHERE id = ...
    SelectImage { id: i64 },
    /// UPDATE images SET ... WHERE id = ...
    UpdateImage { id: i64 },
    /// DELETE FROM images WHERE id = ...
    DeleteImage { id: i64 },
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use crate::database::{Database, DatabaseError, NewImage, Pool, run_migration};

    fn new_image(filename: &str, size: i64) -> NewImage {
        NewImage {
            filename: filename.to_string(),
            filesize_bytes: size,
            mime_type: "image/png".to_string(),
            access_url: format!("http://localhost:5000/blobs/{filename}"),
        }
    }

    /// Migrations can run any number of times against the same pool.
    #[tokio::test]
    async fn test_migration_idempotency() {
        let db = Database::in_memory().await.unwrap();

        run_migration(&db.pool).await.unwrap();
        run_migration(&db.pool).await.unwrap();
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let db = Database::in_memory().await.unwrap();

        let first = db.insert_image(&new_image("cat.png", 1024)).await.unwrap();
        let second = db.insert_image(&new_image("dog.png", 2048)).await.unwrap();
        assert_ne!(first, second);

        let record = db.find_image(first).await.unwrap().unwrap();
        assert_eq!(first, record.id);
        assert_eq!("cat.png", record.filename);
        assert_eq!(1024, record.filesize_bytes);
        assert_eq!("image/png", record.mime_type);
        assert_eq!("http://localhost:5000/blobs/cat.png", record.access_url);

        assert_eq!(None, db.find_image(second + 100).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_is_ordered_by_id() {
        let db = Database::in_memory().await.unwrap();
        assert!(db.list_images().await.unwrap().is_empty());

        for name in ["c.png", "a.png", "b.png"] {
            db.insert_image(&new_image(name, 1)).await.unwrap();
        }

        let names: Vec<String> = db
            .list_images()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.filename)
            .collect();
        assert_eq!(vec!["c.png", "a.png", "b.png"], names);
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let db = Database::in_memory().await.unwrap();
        let id = db.insert_image(&new_image("old.png", 10)).await.unwrap();

        let replacement = NewImage {
            mime_type: "image/jpeg".to_string(),
            ..new_image("new.jpg", 20)
        };
        db.update_image(id, &replacement).await.unwrap();

        let record = db.find_image(id).await.unwrap().unwrap();
        assert_eq!("new.jpg", record.filename);
        assert_eq!(20, record.filesize_bytes);
        assert_eq!("image/jpeg", record.mime_type);

        db.delete_image(id).await.unwrap();
        assert_eq!(None, db.find_image(id).await.unwrap());
        assert!(db.list_images().await.unwrap().is_empty());

        // Deleting or updating a missing row is not an error.
        db.delete_image(id).await.unwrap();
        db.update_image(id, &replacement).await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_pool_is_unavailable() {
        let pool: Pool<crate::database::Db> = Pool::connect_lazy("sqlite::memory:").unwrap();
        pool.close().await;
        let db = Database { pool };

        let err = db.list_images().await.unwrap_err();
        assert!(matches!(err, DatabaseError::Connection { .. }));
        assert!(err.is_unavailable());
    }
}
