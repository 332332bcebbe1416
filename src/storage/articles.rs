use super::schema::Database;
use super::types::{
    is_unique_violation, Article, ArticleStats, DatabaseError, InsertOutcome, STATUS_ACTIVE,
};

// ============================================================================
// Query Limit Constants
// ============================================================================

/// Maximum number of articles to return from any single query (OOM protection)
const MAX_ARTICLES: i64 = 2000;

impl Database {
    // ========================================================================
    // Article Mutations
    // ========================================================================

    /// Insert a fully normalized article.
    ///
    /// A primary-key conflict is the benign "already exists" path and is
    /// reported as [`InsertOutcome::AlreadyExists`], never as an error. Two
    /// crawls delivering the same article concurrently is expected.
    pub async fn insert_article(&self, article: &Article) -> Result<InsertOutcome, DatabaseError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO articles
                (id, feed_id, title, url, content, publish_time, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        )
        .bind(&article.id)
        .bind(&article.feed_id)
        .bind(&article.title)
        .bind(&article.url)
        .bind(&article.content)
        .bind(article.publish_time)
        .bind(article.status)
        .bind(&article.created_at)
        .bind(&article.updated_at)
        .execute(&mut *tx)
        .await;

        match result {
            Ok(_) => {
                tx.commit().await?;
                Ok(InsertOutcome::Inserted)
            }
            Err(e) if is_unique_violation(&e) => {
                tracing::debug!(article_id = %article.id, "Article already exists (constraint)");
                Ok(InsertOutcome::AlreadyExists)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete an article by id, returns whether a row was removed.
    ///
    /// Briefs are keyed by article id without a cascade, so an existing
    /// brief survives the deletion.
    pub async fn delete_article(&self, article_id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM articles WHERE id = ?")
            .bind(article_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ========================================================================
    // Article Queries
    // ========================================================================

    /// True if an article with this id, or with this source url, is stored.
    pub async fn article_exists(
        &self,
        article_id: &str,
        url: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM articles WHERE id = ? OR (? IS NOT NULL AND url = ?) LIMIT 1",
        )
        .bind(article_id)
        .bind(url)
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Get a single article by its composite id.
    pub async fn get_article(&self, article_id: &str) -> Result<Option<Article>, DatabaseError> {
        let article = sqlx::query_as::<_, Article>(
            r#"
            SELECT id, feed_id, title, url, content, publish_time, status, created_at, updated_at
            FROM articles
            WHERE id = ?
        "#,
        )
        .bind(article_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(article)
    }

    /// Get articles for a feed, newest first.
    /// Hard cap at MAX_ARTICLES (2000) to prevent OOM.
    pub async fn get_articles_for_feed(
        &self,
        feed_id: &str,
        limit: Option<i64>,
    ) -> Result<Vec<Article>, DatabaseError> {
        let limit = limit.unwrap_or(500).min(MAX_ARTICLES);
        let articles = sqlx::query_as::<_, Article>(
            r#"
            SELECT id, feed_id, title, url, content, publish_time, status, created_at, updated_at
            FROM articles
            WHERE feed_id = ?
            ORDER BY publish_time DESC, created_at DESC
            LIMIT ?
        "#,
        )
        .bind(feed_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(articles)
    }

    /// Ids of active, content-bearing articles that have no brief yet,
    /// oldest first.
    pub async fn articles_without_brief(&self, limit: i64) -> Result<Vec<String>, DatabaseError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT a.id
            FROM articles a
            LEFT JOIN briefs b ON b.article_key = a.id
            WHERE b.id IS NULL
              AND a.status = ?
              AND a.content IS NOT NULL
              AND TRIM(a.content) != ''
            ORDER BY a.created_at, a.rowid
            LIMIT ?
        "#,
        )
        .bind(STATUS_ACTIVE)
        .bind(limit.clamp(0, MAX_ARTICLES))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Aggregate counts across all articles and feeds.
    pub async fn article_stats(&self) -> Result<ArticleStats, DatabaseError> {
        let (total, without_content, inactive): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COUNT(CASE WHEN content IS NULL THEN 1 END),
                COUNT(CASE WHEN status != ? THEN 1 END)
            FROM articles
        "#,
        )
        .bind(STATUS_ACTIVE)
        .fetch_one(&self.pool)
        .await?;

        let (feeds,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM feeds")
            .fetch_one(&self.pool)
            .await?;

        Ok(ArticleStats {
            total,
            with_content: total - without_content,
            without_content,
            inactive,
            feeds,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{now_timestamp, Article, Database, InsertOutcome, STATUS_ACTIVE};

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn test_article(id: &str, content: Option<&str>) -> Article {
        let now = now_timestamp();
        Article {
            id: id.to_string(),
            feed_id: "feed".to_string(),
            title: format!("Title {}", id),
            url: Some(format!("https://example.com/{}", id)),
            content: content.map(str::to_string),
            publish_time: Some(1704067200),
            status: STATUS_ACTIVE,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_insert_article_conflict_is_benign() {
        let db = test_db().await;
        let article = test_article("feed-1", Some("body"));

        assert_eq!(
            db.insert_article(&article).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            db.insert_article(&article).await.unwrap(),
            InsertOutcome::AlreadyExists
        );

        let stored = db.get_articles_for_feed("feed", None).await.unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn test_article_exists_matches_id_or_url() {
        let db = test_db().await;
        db.insert_article(&test_article("feed-1", None)).await.unwrap();

        assert!(db.article_exists("feed-1", None).await.unwrap());
        assert!(db
            .article_exists("other", Some("https://example.com/feed-1"))
            .await
            .unwrap());
        assert!(!db.article_exists("other", None).await.unwrap());
        assert!(!db
            .article_exists("other", Some("https://example.com/nope"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_articles_without_brief_requires_content() {
        let db = test_db().await;
        db.insert_article(&test_article("feed-1", Some("body")))
            .await
            .unwrap();
        db.insert_article(&test_article("feed-2", None)).await.unwrap();
        db.insert_article(&test_article("feed-3", Some("   ")))
            .await
            .unwrap();

        let ids = db.articles_without_brief(10).await.unwrap();
        assert_eq!(ids, vec!["feed-1".to_string()]);
    }

    #[tokio::test]
    async fn test_article_stats() {
        let db = test_db().await;
        db.insert_article(&test_article("feed-1", Some("body")))
            .await
            .unwrap();
        db.insert_article(&test_article("feed-2", None)).await.unwrap();

        let stats = db.article_stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.with_content, 1);
        assert_eq!(stats.without_content, 1);
        assert_eq!(stats.inactive, 0);
        assert_eq!(stats.feeds, 0);
    }
}
