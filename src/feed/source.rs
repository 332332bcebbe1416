use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::feed::parser::{parse_feed, ParsedArticle};
use crate::util::{read_limited_bytes, validate_url, BodyError};

const MAX_RETRIES: u32 = 3;
const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Placeholder substituted with the page index in a feed's source key.
pub const PAGE_PLACEHOLDER: &str = "{page}";

/// Errors that can occur while fetching one listing page.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Credentials for the source were rejected or have expired
    #[error("Source rejected credentials: status {0}")]
    Unauthorized(u16),
    /// Request exceeded the 30-second timeout
    #[error("Request timed out")]
    Timeout,
    /// Source key is not a usable URL
    #[error("Invalid source key: {0}")]
    InvalidKey(String),
    /// Listing could not be parsed as RSS, Atom or JSON Feed
    #[error("Parse error: {0}")]
    Parse(String),
    /// Server returned 429 Too Many Requests after max retries
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

impl From<BodyError> for FetchError {
    fn from(err: BodyError) -> Self {
        match err {
            BodyError::Network(e) => FetchError::Network(e),
            BodyError::TooLarge(_) => FetchError::ResponseTooLarge,
            BodyError::Incomplete { expected, received } => {
                FetchError::IncompleteResponse { expected, received }
            }
        }
    }
}

/// One page of a feed listing.
#[derive(Debug, Clone, Default)]
pub struct ListingPage {
    pub articles: Vec<ParsedArticle>,
    /// False once the source knows there is nothing past this page.
    pub has_more: bool,
}

/// Where the crawl orchestrator pulls listing pages from.
#[async_trait]
pub trait ListingSource: Send + Sync {
    /// Fetch page `page` of the listing identified by `feed_key`.
    async fn fetch_page(&self, feed_key: &str, page: u32) -> Result<ListingPage, FetchError>;
}

// ============================================================================
// HTTP listing source
// ============================================================================

/// Listing source backed by plain HTTP feed URLs.
///
/// A source key containing `{page}` is paginated: each page index is
/// substituted into the URL. Any other key is a single-page listing, so only
/// `start_page` is fetched and later pages report end of data.
#[derive(Clone)]
pub struct HttpListingSource {
    client: reqwest::Client,
    allow_private_hosts: bool,
    backoff_base: Duration,
}

impl HttpListingSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            allow_private_hosts: false,
            backoff_base: Duration::from_secs(1),
        }
    }

    /// Accept feed URLs on loopback and private networks.
    pub fn allow_private_hosts(mut self, allow: bool) -> Self {
        self.allow_private_hosts = allow;
        self
    }

    /// Base unit for retry backoff (doubles per retry: 2x, 4x, 8x).
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut retry_count = 0;

        loop {
            let response = tokio::time::timeout(REQUEST_TIMEOUT, self.client.get(url).send())
                .await
                .map_err(|_| FetchError::Timeout)?
                .map_err(FetchError::Network)?;

            let status = response.status();

            if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
            {
                return Err(FetchError::Unauthorized(status.as_u16()));
            }

            if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                if retry_count >= MAX_RETRIES {
                    return Err(if status.is_server_error() {
                        FetchError::HttpStatus(status.as_u16())
                    } else {
                        FetchError::RateLimited(MAX_RETRIES)
                    });
                }

                let delay = self.backoff_base * 2u32.pow(retry_count + 1); // 2x, 4x, 8x
                tracing::warn!(
                    url = %url,
                    status = %status,
                    retry = retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Listing request failed, backing off"
                );
                tokio::time::sleep(delay).await;
                retry_count += 1;
                continue;
            }

            // 4xx other than auth and rate limiting fail immediately
            if !status.is_success() {
                return Err(FetchError::HttpStatus(status.as_u16()));
            }

            match read_limited_bytes(response, MAX_FEED_SIZE).await {
                Ok(bytes) => return Ok(bytes),
                Err(BodyError::Incomplete { expected, received }) if retry_count < MAX_RETRIES => {
                    let delay = self.backoff_base * 2u32.pow(retry_count + 1);
                    tracing::debug!(
                        url = %url,
                        expected = expected,
                        received = received,
                        attempt = retry_count + 1,
                        "Retrying incomplete download"
                    );
                    tokio::time::sleep(delay).await;
                    retry_count += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[async_trait]
impl ListingSource for HttpListingSource {
    async fn fetch_page(&self, feed_key: &str, page: u32) -> Result<ListingPage, FetchError> {
        let paginated = feed_key.contains(PAGE_PLACEHOLDER);
        let url = if paginated {
            feed_key.replace(PAGE_PLACEHOLDER, &page.to_string())
        } else {
            feed_key.to_string()
        };

        let url = validate_url(&url, self.allow_private_hosts)
            .map_err(|e| FetchError::InvalidKey(e.to_string()))?;

        let bytes = self.fetch_bytes(url.as_str()).await?;
        let articles = parse_feed(&bytes).map_err(|e| FetchError::Parse(e.to_string()))?;

        tracing::debug!(
            url = %url,
            page = page,
            entries = articles.len(),
            "Fetched listing page"
        );

        let has_more = paginated && !articles.is_empty();
        Ok(ListingPage { articles, has_more })
    }
}
