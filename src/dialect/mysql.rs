use super::{CurrentQueryResult, Db, Dialect};

/// MySQL / MariaDB dialect implementation of the `Dialect` trait.
pub struct MySqlDialect;

impl Dialect for MySqlDialect {
    fn placeholder(_idx: usize) -> String {
        "?".to_string()
    }

    fn last_insert_id(result: &CurrentQueryResult) -> i64 {
        result.last_insert_id() as i64
    }

    async fn migration(pool: &sqlx::Pool<Db>) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS images (
                id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
                filename VARCHAR(1024) NOT NULL,
                filesize_bytes BIGINT NOT NULL,
                mime_type VARCHAR(255) NOT NULL,
                access_url TEXT NOT NULL
            )"#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }
}
