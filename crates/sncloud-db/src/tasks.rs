//! Task ledger repository implementation.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};

use sncloud_core::{now_millis, Error, Result, SystemTask, TaskKey, TaskRepository, TaskStatus};

/// PostgreSQL implementation of TaskRepository.
pub struct PgTaskRepository {
    pool: Pool<Postgres>,
}

impl PgTaskRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_row(row: sqlx::postgres::PgRow) -> Result<SystemTask> {
        let key: String = row.get("key");
        let status: String = row.get("status");
        Ok(SystemTask {
            file_id: row.get("file_id"),
            task_type: row.get("task_type"),
            key: TaskKey::from(key.as_str()),
            status: status.parse()?,
            last_error: row.get("last_error"),
            update_time: row.get("update_time"),
        })
    }
}

#[async_trait]
impl TaskRepository for PgTaskRepository {
    async fn get(
        &self,
        file_id: i64,
        task_type: &str,
        key: &TaskKey,
    ) -> Result<Option<SystemTask>> {
        let row = sqlx::query(
            "SELECT file_id, task_type, key, status, last_error, update_time
             FROM system_task WHERE file_id = $1 AND task_type = $2 AND key = $3",
        )
        .bind(file_id)
        .bind(task_type)
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_row).transpose()
    }

    async fn upsert_status(
        &self,
        file_id: i64,
        task_type: &str,
        key: &TaskKey,
        status: TaskStatus,
        last_error: Option<&str>,
    ) -> Result<()> {
        if status == TaskStatus::Pending {
            // Pending is the absence of a row.
            self.delete(file_id, &[task_type], key).await?;
            return Ok(());
        }

        sqlx::query(
            "INSERT INTO system_task (file_id, task_type, key, status, last_error, update_time)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (file_id, task_type, key)
             DO UPDATE SET status = EXCLUDED.status,
                           last_error = EXCLUDED.last_error,
                           update_time = EXCLUDED.update_time",
        )
        .bind(file_id)
        .bind(task_type)
        .bind(key.as_str())
        .bind(status.as_str())
        .bind(last_error)
        .bind(now_millis())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn delete(&self, file_id: i64, task_types: &[&str], key: &TaskKey) -> Result<u64> {
        let types: Vec<String> = task_types.iter().map(|t| t.to_string()).collect();
        let result = sqlx::query(
            "DELETE FROM system_task WHERE file_id = $1 AND key = $2 AND task_type = ANY($3)",
        )
        .bind(file_id)
        .bind(key.as_str())
        .bind(&types)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }

    async fn list_file_ids_with_status(&self, status: TaskStatus) -> Result<Vec<i64>> {
        sqlx::query_scalar::<_, i64>(
            "SELECT DISTINCT file_id FROM system_task WHERE status = $1 ORDER BY file_id",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)
    }

    async fn list_for_file(&self, file_id: i64) -> Result<Vec<SystemTask>> {
        let rows = sqlx::query(
            "SELECT file_id, task_type, key, status, last_error, update_time
             FROM system_task WHERE file_id = $1 ORDER BY task_type, key",
        )
        .bind(file_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter().map(Self::parse_row).collect()
    }

    async fn delete_for_file(&self, file_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM system_task WHERE file_id = $1")
            .bind(file_id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }
}
