//! Run summaries posted to a task's notification URL.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::feed::ParsedArticle;
use crate::storage::{Feed, Task};
use crate::util::validate_url;

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Invalid notification URL: {0}")]
    InvalidUrl(String),

    #[error("Notification timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Notification endpoint returned status {0}")]
    HttpStatus(u16),
}

#[derive(Debug, Serialize)]
struct Ref<'a> {
    id: &'a str,
    name: &'a str,
}

/// Body of a notification POST.
#[derive(Debug, Serialize)]
struct RunSummary<'a> {
    task: Ref<'a>,
    feed: Ref<'a>,
    articles: &'a [ParsedArticle],
    count: usize,
}

/// Posts one JSON summary per finished crawl. Delivery is best effort:
/// one attempt, no retry.
#[derive(Clone)]
pub struct Notifier {
    client: reqwest::Client,
    allow_private_hosts: bool,
    timeout: Duration,
}

impl Notifier {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            allow_private_hosts: false,
            timeout: NOTIFY_TIMEOUT,
        }
    }

    pub fn allow_private_hosts(mut self, allow: bool) -> Self {
        self.allow_private_hosts = allow;
        self
    }

    /// Post the summary of `feed`'s crawl to the task's notification URL.
    /// Does nothing when the task has none.
    pub async fn notify(
        &self,
        task: &Task,
        feed: &Feed,
        articles: &[ParsedArticle],
    ) -> Result<(), NotifyError> {
        let Some(target) = task
            .notification_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
        else {
            return Ok(());
        };

        let url = validate_url(target, self.allow_private_hosts)
            .map_err(|e| NotifyError::InvalidUrl(e.to_string()))?;

        let body = RunSummary {
            task: Ref {
                id: &task.id,
                name: &task.name,
            },
            feed: Ref {
                id: &feed.id,
                name: &feed.name,
            },
            articles,
            count: articles.len(),
        };

        let response = tokio::time::timeout(self.timeout, self.client.post(url).json(&body).send())
            .await
            .map_err(|_| NotifyError::Timeout)??;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::HttpStatus(status.as_u16()));
        }

        tracing::info!(task_id = %task.id, feed_id = %feed.id, count = articles.len(), "Notification sent");
        Ok(())
    }
}
