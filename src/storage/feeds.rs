use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{now_timestamp, DatabaseError, Feed};

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Insert or update a feed definition.
    ///
    /// Feeds are owned by the management layer; this exists for seeding and
    /// tests. Existing sync timestamps are preserved on update.
    pub async fn upsert_feed(&self, feed: &Feed) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO feeds (id, name, source_key, status)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                source_key = excluded.source_key,
                status = excluded.status
        "#,
        )
        .bind(&feed.id)
        .bind(&feed.name)
        .bind(&feed.source_key)
        .bind(feed.status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Get every known feed in creation order.
    pub async fn get_all_feeds(&self) -> Result<Vec<Feed>, DatabaseError> {
        let feeds = sqlx::query_as::<_, Feed>(
            r#"
            SELECT id, name, source_key, status, update_time, sync_time
            FROM feeds
            ORDER BY created_at, rowid
        "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(feeds)
    }

    /// Get feeds by id, returned in the order of `ids`.
    ///
    /// Unknown ids are silently absent from the result; duplicate ids yield
    /// the feed once.
    pub async fn get_feeds_by_ids(&self, ids: &[String]) -> Result<Vec<Feed>, DatabaseError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
            "SELECT id, name, source_key, status, update_time, sync_time FROM feeds WHERE id IN (",
        );
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        let rows: Vec<Feed> = builder.build_query_as().fetch_all(&self.pool).await?;

        let mut ordered = Vec::with_capacity(rows.len());
        for id in ids {
            if ordered.iter().any(|f: &Feed| &f.id == id) {
                continue;
            }
            if let Some(feed) = rows.iter().find(|f| &f.id == id) {
                ordered.push(feed.clone());
            }
        }
        Ok(ordered)
    }

    /// Get a single feed by id.
    pub async fn get_feed(&self, feed_id: &str) -> Result<Option<Feed>, DatabaseError> {
        let feed = sqlx::query_as::<_, Feed>(
            "SELECT id, name, source_key, status, update_time, sync_time FROM feeds WHERE id = ?",
        )
        .bind(feed_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(feed)
    }

    /// Record that a crawl of this feed finished.
    ///
    /// `sync_time` always moves forward; `update_time` only when the crawl
    /// ingested at least one new article.
    pub async fn mark_feed_synced(&self, feed_id: &str, ingested: bool) -> Result<(), DatabaseError> {
        let now = now_timestamp();
        sqlx::query(
            r#"
            UPDATE feeds SET
                sync_time = ?,
                update_time = CASE WHEN ? THEN ? ELSE update_time END
            WHERE id = ?
        "#,
        )
        .bind(&now)
        .bind(ingested)
        .bind(&now)
        .bind(feed_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
