//! # SQL Dialect Module
//!
//! The `Dialect` trait keeps the SQL text for the `images` table out of the
//! database adapter, so the adapter reads the same for every backend. The
//! dialect is picked at compile time by feature flag: `sqlite` (default) or
//! `mysql` for MySQL/MariaDB. When both are enabled, SQLite wins.

#[cfg(feature = "sqlite")]
mod sqlite;

#[cfg(all(feature = "mysql", not(feature = "sqlite")))]
mod mysql;

#[cfg(not(any(feature = "sqlite", feature = "mysql")))]
compile_error!("enable either the `sqlite` or the `mysql` feature");

/// The current SQL dialect used at compile time, determined by feature flags.
#[cfg(feature = "sqlite")]
pub type CurrentDialect = sqlite::SqliteDialect;

#[cfg(feature = "sqlite")]
pub type Db = sqlx::Sqlite;

#[cfg(feature = "sqlite")]
pub type CurrentRow = sqlx::sqlite::SqliteRow;

#[cfg(all(feature = "mysql", not(feature = "sqlite")))]
pub type CurrentDialect = mysql::MySqlDialect;

#[cfg(all(feature = "mysql", not(feature = "sqlite")))]
pub type Db = sqlx::MySql;

#[cfg(all(feature = "mysql", not(feature = "sqlite")))]
pub type CurrentRow = sqlx::mysql::MySqlRow;

/// Result of executing a statement on the current backend.
pub type CurrentQueryResult = <Db as sqlx::Database>::QueryResult;

/// Columns of an image record, in select order.
const IMAGE_COLUMNS: &str = "id, filename, filesize_bytes, mime_type, access_url";

/// A trait for SQL dialects to support database-specific query generation.
pub trait Dialect {
    /// Returns the SQL placeholder syntax for the given parameter index.
    ///
    /// Both supported backends use `?`; the index is kept so statements stay
    /// portable to numbered-placeholder backends.
    fn placeholder(idx: usize) -> String;

    /// Reads the generated id out of an `INSERT` result.
    fn last_insert_id(result: &CurrentQueryResult) -> i64;

    fn insert_image_statement() -> String {
        format!(
            "INSERT INTO images (filename, filesize_bytes, mime_type, access_url) VALUES ({}, {}, {}, {})",
            Self::placeholder(1),
            Self::placeholder(2),
            Self::placeholder(3),
            Self::placeholder(4),
        )
    }

    fn select_images_statement() -> String {
        format!("SELECT {IMAGE_COLUMNS} FROM images ORDER BY id")
    }

    fn select_image_statement() -> String {
        format!(
            "SELECT {IMAGE_COLUMNS} FROM images WHERE id = {}",
            Self::placeholder(1)
        )
    }

    /// Replaces every mutable column of one record.
    fn update_image_statement() -> String {
        format!(
            "UPDATE images SET filename = {}, filesize_bytes = {}, mime_type = {}, access_url = {} WHERE id = {}",
            Self::placeholder(1),
            Self::placeholder(2),
            Self::placeholder(3),
            Self::placeholder(4),
            Self::placeholder(5),
        )
    }

    fn delete_image_statement() -> String {
        format!("DELETE FROM images WHERE id = {}", Self::placeholder(1))
    }

    /// Creates the schema. Must be idempotent.
    async fn migration(pool: &sqlx::Pool<Db>) -> Result<(), sqlx::Error>;
}
