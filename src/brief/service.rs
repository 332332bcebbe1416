use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use uuid::Uuid;

use super::generator::{BriefGenerator, BriefInput};
use super::BriefError;
use crate::storage::{now_timestamp, Brief, Database, InsertOutcome};

/// Counts from a batch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total: usize,
}

/// How a single generation ended.
enum Generation {
    Created(Brief),
    Existing(Brief),
    Ineligible,
}

impl Generation {
    fn into_brief(self) -> Option<Brief> {
        match self {
            Generation::Created(b) | Generation::Existing(b) => Some(b),
            Generation::Ineligible => None,
        }
    }
}

/// Generates and stores briefs, at most one per article.
///
/// Reading article state, calling the service and writing the result are
/// three separate steps; no connection is held across the network call.
#[derive(Clone)]
pub struct BriefService {
    db: Database,
    generator: BriefGenerator,
    enabled: bool,
}

impl BriefService {
    pub fn new(db: Database, generator: BriefGenerator, enabled: bool) -> Self {
        Self {
            db,
            generator,
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Brief for one article, generating it if needed.
    ///
    /// Returns `Ok(None)` when enrichment is disabled, the article is
    /// unknown, or it has no content. An existing brief (including one a
    /// concurrent call stored first) is returned unchanged.
    pub async fn generate_for_article(&self, article_key: &str) -> Result<Option<Brief>, BriefError> {
        Ok(self.generate(article_key).await?.into_brief())
    }

    async fn generate(&self, article_key: &str) -> Result<Generation, BriefError> {
        if !self.enabled {
            tracing::debug!(article_id = %article_key, "Brief generation disabled");
            return Ok(Generation::Ineligible);
        }

        if let Some(existing) = self.db.get_brief_by_article(article_key).await? {
            tracing::debug!(article_id = %article_key, "Brief already exists, skipping");
            return Ok(Generation::Existing(existing));
        }

        let Some(article) = self.db.get_article(article_key).await? else {
            tracing::warn!(article_id = %article_key, "Article not found, no brief");
            return Ok(Generation::Ineligible);
        };
        if !article.has_content() {
            tracing::debug!(article_id = %article_key, "Article has no content, no brief");
            return Ok(Generation::Ineligible);
        }

        let author = match self.db.get_feed(&article.feed_id).await? {
            Some(feed) => feed.name,
            None => "Unknown".to_string(),
        };
        let input = BriefInput {
            title: article.title,
            author,
            publish_time: article.publish_time,
            content: article.content.unwrap_or_default(),
        };

        let generated = self.generator.generate(&input).await?;

        // Another caller may have stored a brief while we were waiting.
        if let Some(existing) = self.db.get_brief_by_article(article_key).await? {
            tracing::info!(article_id = %article_key, "Brief created concurrently, discarding ours");
            return Ok(Generation::Existing(existing));
        }

        let now = now_timestamp();
        let brief = Brief {
            id: Uuid::new_v4().to_string(),
            article_key: article_key.to_string(),
            model: generated.model,
            summary: generated.summary,
            highlights: generated.highlights,
            version: generated.version,
            language: generated.language,
            tags: generated.tags,
            confidence: generated.confidence,
            generated_at: generated.generated_at,
            created_at: now.clone(),
            updated_at: now,
        };

        match self.db.insert_brief(&brief).await? {
            InsertOutcome::Inserted => {
                tracing::info!(article_id = %article_key, brief_id = %brief.id, "Brief saved");
                Ok(Generation::Created(brief))
            }
            InsertOutcome::AlreadyExists => {
                tracing::info!(article_id = %article_key, "Brief created concurrently, discarding ours");
                match self.db.get_brief_by_article(article_key).await? {
                    Some(existing) => Ok(Generation::Existing(existing)),
                    None => Ok(Generation::Ineligible),
                }
            }
        }
    }

    /// Generate briefs for many articles, at most `max_concurrent` at a time.
    ///
    /// One article failing never aborts the others.
    pub async fn generate_many(&self, article_keys: &[String], max_concurrent: usize) -> BatchResult {
        let total = article_keys.len();
        if !self.enabled {
            tracing::debug!("Brief generation disabled, skipping batch");
            return BatchResult::default();
        }

        tracing::info!(total = total, max_concurrent = max_concurrent, "Starting brief batch");
        let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));

        let runs = article_keys.iter().map(|key| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = semaphore.acquire().await;
                match self.generate(key).await {
                    Ok(outcome) => Ok(outcome),
                    Err(e) => {
                        tracing::error!(article_id = %key, error = %e, "Brief generation failed");
                        Err(e)
                    }
                }
            }
        });

        let mut result = BatchResult {
            total,
            ..BatchResult::default()
        };
        for outcome in futures::future::join_all(runs).await {
            match outcome {
                Ok(Generation::Created(_)) => result.success += 1,
                Ok(Generation::Existing(_)) | Ok(Generation::Ineligible) => result.skipped += 1,
                Err(_) => result.failed += 1,
            }
        }

        tracing::info!(
            success = result.success,
            failed = result.failed,
            skipped = result.skipped,
            total = result.total,
            "Brief batch complete"
        );
        result
    }

    /// Generate briefs for up to `batch_size` of the oldest eligible
    /// articles that have none yet.
    pub async fn generate_pending(
        &self,
        batch_size: u32,
        max_concurrent: usize,
    ) -> Result<BatchResult, BriefError> {
        if !self.enabled {
            return Ok(BatchResult::default());
        }
        let keys = self.db.articles_without_brief(i64::from(batch_size)).await?;
        if keys.is_empty() {
            tracing::info!("No articles waiting for a brief");
            return Ok(BatchResult::default());
        }
        Ok(self.generate_many(&keys, max_concurrent).await)
    }
}
