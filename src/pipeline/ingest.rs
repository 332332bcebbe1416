//! Article ingestion and deduplication.

use crate::feed::ParsedArticle;
use crate::storage::{now_timestamp, Article, Database, InsertOutcome, STATUS_ACTIVE};

/// Namespace prefix some sources put in front of their ids.
const NAMESPACE_PREFIX: &str = "MP_WXS_";

/// Outcome of ingesting one listing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Stored as a new article
    Ingested,
    /// Already present (pre-check hit or unique conflict)
    Duplicate,
    /// Persistence failed for another reason
    Failed,
}

/// Stable article key: `{feed_id}-{source_id}` with the namespace prefix
/// removed, so re-crawling the same entry always maps to the same row.
pub fn composite_id(feed_id: &str, source_id: &str) -> String {
    format!("{}-{}", feed_id, source_id).replace(NAMESPACE_PREFIX, "")
}

/// Build the row for a listing entry: composite id, active status and
/// fixed-format timestamps.
pub fn normalize(feed_id: &str, entry: &ParsedArticle) -> Article {
    let now = now_timestamp();
    Article {
        id: composite_id(feed_id, &entry.source_id),
        feed_id: feed_id.to_string(),
        title: entry.title.clone(),
        url: entry.url.clone(),
        content: entry.content.clone(),
        publish_time: entry.published,
        status: STATUS_ACTIVE,
        created_at: now.clone(),
        updated_at: now,
    }
}

#[derive(Clone)]
pub struct Ingestor {
    db: Database,
}

impl Ingestor {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Store one entry. Returns true only if a new row was written.
    ///
    /// False covers both duplicates and persistence failures; use
    /// [`Ingestor::ingest_article`] to tell them apart.
    pub async fn ingest(&self, feed_id: &str, entry: &ParsedArticle, check_exists: bool) -> bool {
        self.ingest_article(feed_id, entry, check_exists).await.0 == IngestOutcome::Ingested
    }

    /// Store one entry and report what happened, along with the row built
    /// for it.
    pub async fn ingest_article(
        &self,
        feed_id: &str,
        entry: &ParsedArticle,
        check_exists: bool,
    ) -> (IngestOutcome, Article) {
        let article = normalize(feed_id, entry);

        if check_exists {
            match self
                .db
                .article_exists(&article.id, article.url.as_deref())
                .await
            {
                Ok(true) => {
                    tracing::debug!(article_id = %article.id, "Article already exists");
                    return (IngestOutcome::Duplicate, article);
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(article_id = %article.id, error = %e, "Failed to check article");
                    return (IngestOutcome::Failed, article);
                }
            }
        }

        let outcome = match self.db.insert_article(&article).await {
            Ok(InsertOutcome::Inserted) => {
                tracing::debug!(article_id = %article.id, title = %article.title, "Stored article");
                IngestOutcome::Ingested
            }
            Ok(InsertOutcome::AlreadyExists) => {
                tracing::warn!(article_id = %article.id, "Article already exists");
                IngestOutcome::Duplicate
            }
            Err(e) => {
                tracing::error!(article_id = %article.id, error = %e, "Failed to add article");
                IngestOutcome::Failed
            }
        };
        (outcome, article)
    }
}
