use super::schema::Database;
use super::types::{is_unique_violation, Brief, BriefRow, DatabaseError, InsertOutcome};

impl Database {
    // ========================================================================
    // Brief Operations
    // ========================================================================

    /// Get the brief for an article, if one exists.
    pub async fn get_brief_by_article(
        &self,
        article_key: &str,
    ) -> Result<Option<Brief>, DatabaseError> {
        let row = sqlx::query_as::<_, BriefRow>(
            r#"
            SELECT id, article_key, model, summary, highlights, version, language, tags,
                   confidence, generated_at, created_at, updated_at
            FROM briefs
            WHERE article_key = ?
        "#,
        )
        .bind(article_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(BriefRow::into_brief).transpose()
    }

    /// Insert a brief. A conflict on `article_key` (another writer won the
    /// race) is reported as [`InsertOutcome::AlreadyExists`].
    pub async fn insert_brief(&self, brief: &Brief) -> Result<InsertOutcome, DatabaseError> {
        let highlights = serde_json::to_string(&brief.highlights).map_err(|source| {
            DatabaseError::Decode {
                column: "briefs.highlights",
                source,
            }
        })?;
        let tags = serde_json::to_string(&brief.tags).map_err(|source| DatabaseError::Decode {
            column: "briefs.tags",
            source,
        })?;

        let result = sqlx::query(
            r#"
            INSERT INTO briefs
                (id, article_key, model, summary, highlights, version, language, tags,
                 confidence, generated_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        )
        .bind(&brief.id)
        .bind(&brief.article_key)
        .bind(&brief.model)
        .bind(&brief.summary)
        .bind(highlights)
        .bind(&brief.version)
        .bind(&brief.language)
        .bind(tags)
        .bind(brief.confidence)
        .bind(&brief.generated_at)
        .bind(&brief.created_at)
        .bind(&brief.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(e) if is_unique_violation(&e) => Ok(InsertOutcome::AlreadyExists),
            Err(e) => Err(e.into()),
        }
    }

    /// Total number of stored briefs.
    pub async fn count_briefs(&self) -> Result<i64, DatabaseError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM briefs")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{now_timestamp, Brief, Database, Highlight, InsertOutcome};
    use pretty_assertions::assert_eq;

    fn test_brief(id: &str, article_key: &str) -> Brief {
        let now = now_timestamp();
        Brief {
            id: id.to_string(),
            article_key: article_key.to_string(),
            model: "test-model".to_string(),
            summary: "A summary".to_string(),
            highlights: vec![Highlight {
                title: "Point".to_string(),
                detail: "Why it matters".to_string(),
            }],
            version: "3.0".to_string(),
            language: "en".to_string(),
            tags: vec!["rust".to_string()],
            confidence: Some(0.9),
            generated_at: now.clone(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_brief_roundtrip_keeps_json_columns() {
        let db = Database::open(":memory:").await.unwrap();
        let brief = test_brief("b1", "feed-a1");
        db.insert_brief(&brief).await.unwrap();

        let stored = db.get_brief_by_article("feed-a1").await.unwrap().unwrap();
        assert_eq!(stored, brief);
    }

    #[tokio::test]
    async fn test_second_brief_for_same_article_is_rejected() {
        let db = Database::open(":memory:").await.unwrap();
        assert_eq!(
            db.insert_brief(&test_brief("b1", "feed-a1")).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            db.insert_brief(&test_brief("b2", "feed-a1")).await.unwrap(),
            InsertOutcome::AlreadyExists
        );
        assert_eq!(db.count_briefs().await.unwrap(), 1);

        let stored = db.get_brief_by_article("feed-a1").await.unwrap().unwrap();
        assert_eq!(stored.id, "b1");
    }

    #[tokio::test]
    async fn test_missing_brief_is_none() {
        let db = Database::open(":memory:").await.unwrap();
        assert!(db.get_brief_by_article("nope").await.unwrap().is_none());
    }
}
