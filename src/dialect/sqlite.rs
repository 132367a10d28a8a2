use super::{CurrentQueryResult, Db, Dialect};

/// SQLite dialect implementation of the `Dialect` trait.
pub struct SqliteDialect;

impl Dialect for SqliteDialect {
    fn placeholder(_idx: usize) -> String {
        "?".to_string()
    }

    fn last_insert_id(result: &CurrentQueryResult) -> i64 {
        result.last_insert_rowid()
    }

    async fn migration(pool: &sqlx::Pool<Db>) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS images (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                filename TEXT NOT NULL,
                filesize_bytes INTEGER NOT NULL,
                mime_type TEXT NOT NULL,
                access_url TEXT NOT NULL
            );"#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }
}
