use feed_rs::parser;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// One entry of a listing page, before it is bound to a feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedArticle {
    /// Id assigned by the source; a content hash when the source has none.
    pub source_id: String,
    pub title: String,
    pub url: Option<String>,
    /// Publish time as a unix timestamp.
    pub published: Option<i64>,
    pub content: Option<String>,
}

/// Parse an RSS, Atom or JSON Feed document into listing entries.
pub fn parse_feed(bytes: &[u8]) -> Result<Vec<ParsedArticle>, feed_rs::parser::ParseFeedError> {
    let feed = parser::parse(bytes)?;

    let articles = feed
        .entries
        .into_iter()
        .map(|entry| {
            let url = entry.links.first().map(|l| l.href.clone());
            let published = entry.published.or(entry.updated).map(|dt| dt.timestamp());
            // Full body first; briefs need as much text as the feed carries.
            let content = entry
                .content
                .and_then(|c| c.body)
                .or_else(|| entry.summary.map(|s| s.content))
                .filter(|c| !c.trim().is_empty());
            let title = entry
                .title
                .map(|t| t.content)
                .unwrap_or_else(|| "Untitled".to_string());

            let existing_id = if entry.id.is_empty() {
                None
            } else {
                Some(entry.id.as_str())
            };
            let source_id = generate_source_id(existing_id, url.as_deref(), &title, published);

            ParsedArticle {
                source_id,
                title,
                url,
                published,
                content,
            }
        })
        .collect();

    Ok(articles)
}

fn generate_source_id(
    existing: Option<&str>,
    url: Option<&str>,
    title: &str,
    published: Option<i64>,
) -> String {
    if let Some(id) = existing {
        let trimmed = id.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let input = format!(
        "{}|{}|{}",
        url.unwrap_or(""),
        title,
        published.map(|p| p.to_string()).unwrap_or_default()
    );
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}
