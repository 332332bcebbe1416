use super::schema::Database;
use super::types::{DatabaseError, Tag, Task, STATUS_ACTIVE};

impl Database {
    // ========================================================================
    // Task Operations
    // ========================================================================

    /// Insert or replace a task definition (seeding and tests).
    pub async fn upsert_task(&self, task: &Task) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO tasks (id, name, cron_exp, feed_refs, tag_refs, status, notification_url)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                cron_exp = excluded.cron_exp,
                feed_refs = excluded.feed_refs,
                tag_refs = excluded.tag_refs,
                status = excluded.status,
                notification_url = excluded.notification_url
        "#,
        )
        .bind(&task.id)
        .bind(&task.name)
        .bind(&task.cron_exp)
        .bind(&task.feed_refs)
        .bind(&task.tag_refs)
        .bind(task.status)
        .bind(&task.notification_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Get active tasks, optionally restricted to a single id.
    pub async fn get_active_tasks(&self, task_id: Option<&str>) -> Result<Vec<Task>, DatabaseError> {
        let tasks = sqlx::query_as::<_, Task>(
            r#"
            SELECT id, name, cron_exp, feed_refs, tag_refs, status, notification_url
            FROM tasks
            WHERE status = ? AND (? IS NULL OR id = ?)
            ORDER BY rowid
        "#,
        )
        .bind(STATUS_ACTIVE)
        .bind(task_id)
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(tasks)
    }

    /// Get one task by id regardless of status.
    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>, DatabaseError> {
        let task = sqlx::query_as::<_, Task>(
            r#"
            SELECT id, name, cron_exp, feed_refs, tag_refs, status, notification_url
            FROM tasks
            WHERE id = ?
        "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(task)
    }

    // ========================================================================
    // Tag Operations
    // ========================================================================

    /// Insert or replace a tag definition (seeding and tests).
    pub async fn upsert_tag(&self, tag: &Tag) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO tags (id, name, feed_refs)
            VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                feed_refs = excluded.feed_refs
        "#,
        )
        .bind(&tag.id)
        .bind(&tag.name)
        .bind(&tag.feed_refs)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Get a tag by id.
    pub async fn get_tag(&self, tag_id: &str) -> Result<Option<Tag>, DatabaseError> {
        let tag = sqlx::query_as::<_, Tag>("SELECT id, name, feed_refs FROM tags WHERE id = ?")
            .bind(tag_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(tag)
    }
}
