//! Feed collection: listing sources, paginated crawling and task resolution.
//!
//! - [`parser`] - RSS/Atom/JSON Feed parsing using the `feed-rs` crate
//! - [`source`] - the [`ListingSource`] seam and its HTTP implementation
//! - [`gather`] - the paginated crawl orchestrator
//! - [`resolver`] - expands a task's feed and tag references into feeds

mod gather;
mod parser;
mod resolver;
mod source;

pub use gather::{CrawlOrchestrator, GatherSink, GatherSummary};
pub use parser::{parse_feed, ParsedArticle};
pub use resolver::{parse_refs, FeedResolver};
pub use source::{FetchError, HttpListingSource, ListingPage, ListingSource, PAGE_PLACEHOLDER};
