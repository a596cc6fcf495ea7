//! Page content repository implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use tracing::debug;

use sncloud_core::{
    now_millis, Error, PageContent, PageContentRepository, PageSyncReport, Result, TaskCompletion,
    TaskKey, TaskStatus,
};

/// PostgreSQL implementation of PageContentRepository.
pub struct PgPageContentRepository {
    pool: Pool<Postgres>,
}

impl PgPageContentRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PageContentRepository for PgPageContentRepository {
    async fn get(&self, file_id: i64, page_index: i32) -> Result<Option<PageContent>> {
        let row = sqlx::query(
            "SELECT file_id, page_index, content_hash, text_content, embedding
             FROM page_content WHERE file_id = $1 AND page_index = $2",
        )
        .bind(file_id)
        .bind(page_index)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(|row| PageContent {
            file_id: row.get("file_id"),
            page_index: row.get("page_index"),
            content_hash: row.get("content_hash"),
            text_content: row.get("text_content"),
            embedding: row.get("embedding"),
        }))
    }

    async fn list_page_indices(&self, file_id: i64) -> Result<Vec<i32>> {
        sqlx::query_scalar::<_, i32>(
            "SELECT page_index FROM page_content WHERE file_id = $1 ORDER BY page_index",
        )
        .bind(file_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)
    }

    async fn sync_page_hashes(
        &self,
        file_id: i64,
        hashes: &[String],
        invalidate_task_types: &[&str],
        completion: TaskCompletion,
    ) -> Result<PageSyncReport> {
        let now = now_millis();
        let invalidate: Vec<String> = invalidate_task_types.iter().map(|t| t.to_string()).collect();
        let mut report = PageSyncReport {
            total_pages: hashes.len(),
            ..Default::default()
        };

        // Dropping `tx` on any early return rolls the whole sync back.
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let existing: HashMap<i32, String> = sqlx::query(
            "SELECT page_index, content_hash FROM page_content WHERE file_id = $1 FOR UPDATE",
        )
        .bind(file_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?
        .into_iter()
        .map(|row| (row.get("page_index"), row.get("content_hash")))
        .collect();

        let mut stale_keys: Vec<String> = Vec::new();
        for (index, hash) in hashes.iter().enumerate() {
            let page_index = index as i32;
            match existing.get(&page_index) {
                None => {
                    sqlx::query(
                        "INSERT INTO page_content (file_id, page_index, content_hash, create_time, update_time)
                         VALUES ($1, $2, $3, $4, $4)",
                    )
                    .bind(file_id)
                    .bind(page_index)
                    .bind(hash)
                    .bind(now)
                    .execute(&mut *tx)
                    .await
                    .map_err(Error::Database)?;
                    // A page index reused after shrinkage must not inherit old results.
                    stale_keys.push(TaskKey::page(page_index).as_str().to_string());
                    report.added += 1;
                }
                Some(stored) if stored == hash => report.unchanged += 1,
                Some(_) => {
                    sqlx::query(
                        "UPDATE page_content
                         SET content_hash = $3, text_content = NULL, embedding = NULL, update_time = $4
                         WHERE file_id = $1 AND page_index = $2",
                    )
                    .bind(file_id)
                    .bind(page_index)
                    .bind(hash)
                    .bind(now)
                    .execute(&mut *tx)
                    .await
                    .map_err(Error::Database)?;
                    stale_keys.push(TaskKey::page(page_index).as_str().to_string());

                    debug!(
                        subsystem = "db",
                        component = "page_content",
                        file_id,
                        page_index,
                        "Page hash changed, derived data invalidated"
                    );
                    report.changed += 1;
                }
            }
        }

        let removed = sqlx::query("DELETE FROM page_content WHERE file_id = $1 AND page_index >= $2")
            .bind(file_id)
            .bind(hashes.len() as i32)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        report.removed = removed.rows_affected() as usize;

        let page_keys: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT key FROM system_task WHERE file_id = $1 AND task_type = ANY($2)",
        )
        .bind(file_id)
        .bind(&invalidate)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;
        let total = hashes.len() as i32;
        stale_keys.extend(page_keys.into_iter().filter(|key| {
            TaskKey::from(key.as_str())
                .page_index()
                .is_some_and(|index| index >= total)
        }));

        if !stale_keys.is_empty() {
            sqlx::query(
                "DELETE FROM system_task
                 WHERE file_id = $1 AND task_type = ANY($2) AND key = ANY($3)",
            )
            .bind(file_id)
            .bind(&invalidate)
            .bind(&stale_keys)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        sqlx::query(
            "INSERT INTO system_task (file_id, task_type, key, status, last_error, update_time)
             VALUES ($1, $2, $3, $4, NULL, $5)
             ON CONFLICT (file_id, task_type, key)
             DO UPDATE SET status = EXCLUDED.status, last_error = NULL, update_time = EXCLUDED.update_time",
        )
        .bind(file_id)
        .bind(&completion.task_type)
        .bind(completion.key.as_str())
        .bind(TaskStatus::Completed.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(report)
    }

    async fn set_text_content(
        &self,
        file_id: i64,
        page_index: i32,
        text: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE page_content SET text_content = $3, update_time = $4
             WHERE file_id = $1 AND page_index = $2",
        )
        .bind(file_id)
        .bind(page_index)
        .bind(text)
        .bind(now_millis())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn set_embedding(
        &self,
        file_id: i64,
        page_index: i32,
        embedding: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE page_content SET embedding = $3, update_time = $4
             WHERE file_id = $1 AND page_index = $2",
        )
        .bind(file_id)
        .bind(page_index)
        .bind(embedding)
        .bind(now_millis())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_for_file(&self, file_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM page_content WHERE file_id = $1")
            .bind(file_id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }
}
