//! Paginated crawl of one feed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::feed::parser::ParsedArticle;
use crate::feed::source::ListingSource;
use crate::pipeline::IngestOutcome;

/// Receives the entries of a crawl as they are found, then the summary.
#[async_trait]
pub trait GatherSink: Send {
    /// Handle one entry. The outcome is tallied and never stops pagination.
    async fn on_article(&mut self, article: &ParsedArticle) -> IngestOutcome;

    /// Called exactly once per crawl, including after a feed-level failure.
    async fn on_complete(&mut self, summary: &GatherSummary);
}

/// Result of one crawl.
#[derive(Debug, Clone, Default)]
pub struct GatherSummary {
    pub feed_key: String,
    pub pages_fetched: u32,
    pub ingested: usize,
    pub duplicates: usize,
    pub failed: usize,
    /// Every entry found, in listing order
    pub articles: Vec<ParsedArticle>,
    /// Feed-level failure that ended the crawl early
    pub error: Option<String>,
}

impl GatherSummary {
    pub fn found(&self) -> usize {
        self.articles.len()
    }
}

/// Pulls listing pages from a source and feeds entries to a sink.
///
/// The orchestrator keeps per-crawl state, so one instance runs one crawl at
/// a time (`gather` takes `&mut self`).
pub struct CrawlOrchestrator {
    source: Arc<dyn ListingSource>,
    interval: Duration,
    state: GatherSummary,
}

impl CrawlOrchestrator {
    pub fn new(source: Arc<dyn ListingSource>, interval: Duration) -> Self {
        Self {
            source,
            interval,
            state: GatherSummary::default(),
        }
    }

    /// Crawl up to `max_pages` pages starting at `start_page`.
    ///
    /// Stops early on an empty page, `has_more == false`, or a fetch error.
    /// A fetch error abandons the remaining pages but keeps whatever was
    /// ingested; it is recorded in the summary and never returned.
    pub async fn gather(
        &mut self,
        feed_key: &str,
        max_pages: u32,
        start_page: u32,
        sink: &mut dyn GatherSink,
    ) -> GatherSummary {
        self.state = GatherSummary {
            feed_key: feed_key.to_string(),
            ..GatherSummary::default()
        };

        for offset in 0..max_pages {
            let page = start_page.saturating_add(offset);
            if offset > 0 && !self.interval.is_zero() {
                tracing::trace!(feed = %feed_key, delay_ms = self.interval.as_millis() as u64, "Waiting before next page");
                tokio::time::sleep(self.interval).await;
            }

            let listing = match self.source.fetch_page(feed_key, page).await {
                Ok(listing) => listing,
                Err(e) => {
                    tracing::error!(feed = %feed_key, page = page, error = %e, "Listing fetch failed");
                    self.state.error = Some(e.to_string());
                    break;
                }
            };
            self.state.pages_fetched += 1;

            if listing.articles.is_empty() {
                tracing::debug!(feed = %feed_key, page = page, "Empty page, end of listing");
                break;
            }

            for article in listing.articles {
                match sink.on_article(&article).await {
                    IngestOutcome::Ingested => self.state.ingested += 1,
                    IngestOutcome::Duplicate => self.state.duplicates += 1,
                    IngestOutcome::Failed => self.state.failed += 1,
                }
                self.state.articles.push(article);
            }

            if !listing.has_more {
                break;
            }
        }

        tracing::info!(
            feed = %feed_key,
            pages = self.state.pages_fetched,
            found = self.state.found(),
            ingested = self.state.ingested,
            duplicates = self.state.duplicates,
            failed = self.state.failed,
            "Crawl complete"
        );

        sink.on_complete(&self.state).await;
        self.state.clone()
    }
}
