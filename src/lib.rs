//! feedbrief: scheduled feed collection with AI briefs.
//!
//! Tasks name feeds (directly or through tags) and a cron expression. When a
//! task fires its feeds are crawled one at a time on a serial work queue,
//! new articles are stored exactly once, and articles with content can be
//! summarized into briefs by a chat-completions service.

pub mod brief;
pub mod config;
pub mod feed;
pub mod notify;
pub mod pipeline;
pub mod queue;
pub mod scheduler;
pub mod storage;
pub mod util;
