//! VFS record repository implementation.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};

use sncloud_core::{
    defaults::NOTEBOOK_EXTENSION, now_millis, Error, NewNotebookFile, NotebookFile,
    NotebookFileRepository, Result,
};

const FILE_COLUMNS: &str = "id, user_id, directory_id, file_name, is_folder, storage_key, size, \
                            md5, is_active, create_time, update_time";

/// PostgreSQL implementation of NotebookFileRepository.
pub struct PgNotebookFileRepository {
    pool: Pool<Postgres>,
}

impl PgNotebookFileRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_row(row: sqlx::postgres::PgRow) -> NotebookFile {
        NotebookFile {
            id: row.get("id"),
            user_id: row.get("user_id"),
            directory_id: row.get("directory_id"),
            file_name: row.get("file_name"),
            is_folder: row.get("is_folder"),
            storage_key: row.get("storage_key"),
            size: row.get("size"),
            md5: row.get("md5"),
            is_active: row.get("is_active"),
            create_time: row.get("create_time"),
            update_time: row.get("update_time"),
        }
    }
}

#[async_trait]
impl NotebookFileRepository for PgNotebookFileRepository {
    async fn get(&self, file_id: i64) -> Result<Option<NotebookFile>> {
        let row = sqlx::query(&format!("SELECT {FILE_COLUMNS} FROM user_file WHERE id = $1"))
            .bind(file_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(row.map(Self::parse_row))
    }

    async fn insert(&self, req: NewNotebookFile) -> Result<NotebookFile> {
        let now = now_millis();
        let row = sqlx::query(&format!(
            "INSERT INTO user_file (user_id, directory_id, file_name, is_folder, storage_key, size, md5, is_active, create_time, update_time)
             VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE, $8, $8)
             RETURNING {FILE_COLUMNS}"
        ))
        .bind(req.user_id)
        .bind(req.directory_id)
        .bind(&req.file_name)
        .bind(req.is_folder)
        .bind(&req.storage_key)
        .bind(req.size)
        .bind(&req.md5)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(Self::parse_row(row))
    }

    async fn list_for_user(&self, user_id: i64) -> Result<Vec<NotebookFile>> {
        let rows = sqlx::query(&format!(
            "SELECT {FILE_COLUMNS} FROM user_file
             WHERE user_id = $1 AND is_active
             ORDER BY id"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(Self::parse_row).collect())
    }

    async fn list_active_notebook_ids(&self) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM user_file
             WHERE is_active AND NOT is_folder AND lower(file_name) LIKE '%' || $1
             ORDER BY id",
        )
        .bind(NOTEBOOK_EXTENSION)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(ids)
    }

    async fn update_content(
        &self,
        file_id: i64,
        storage_key: &str,
        size: i64,
        md5: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE user_file
             SET storage_key = $2, size = $3, md5 = $4, update_time = $5
             WHERE id = $1",
        )
        .bind(file_id)
        .bind(storage_key)
        .bind(size)
        .bind(md5)
        .bind(now_millis())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::FileNotFound(file_id));
        }
        Ok(())
    }
}
