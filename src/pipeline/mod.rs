//! The collection pipeline.
//!
//! A [`Pipeline`] owns a crawl queue, an enrichment queue and one scheduler
//! and wires them together: a task's cron job resolves its feeds, each feed
//! becomes one crawl unit on the crawl queue, crawled entries are ingested,
//! and new articles with content are queued for a brief on the enrichment
//! queue. A slow or rate-limited brief never holds up the next crawl.

mod ingest;

pub use ingest::{composite_id, normalize, IngestOutcome, Ingestor};

use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::FutureExt;

use crate::brief::{BatchResult, BriefError, BriefGenerator, BriefService};
use crate::config::Config;
use crate::feed::{
    CrawlOrchestrator, FeedResolver, GatherSink, GatherSummary, HttpListingSource, ListingSource,
    ParsedArticle,
};
use crate::notify::Notifier;
use crate::queue::{QueueInfo, WorkQueue};
use crate::scheduler::Scheduler;
use crate::storage::{Database, Feed, Task, STATUS_ACTIVE};

/// Tag on scheduler jobs that collect a task's feeds.
pub const CRAWL_JOB_TAG: &str = "crawl";
/// Id and tag of the periodic brief batch job.
pub const BRIEF_BATCH_JOB: &str = "brief-batch";

struct Inner {
    db: Database,
    config: Config,
    queue: WorkQueue,
    enrichment: WorkQueue,
    scheduler: Scheduler,
    resolver: FeedResolver,
    ingestor: Ingestor,
    source: Arc<dyn ListingSource>,
    briefs: BriefService,
    notifier: Notifier,
}

/// Explicitly constructed pipeline context. Cheap to clone; clones share the
/// same queue and scheduler.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl Pipeline {
    /// Build a pipeline from its collaborators. Must be called inside a
    /// tokio runtime (the work queues spawn their workers here).
    pub fn new(
        db: Database,
        config: Config,
        source: Arc<dyn ListingSource>,
        briefs: BriefService,
        notifier: Notifier,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                resolver: FeedResolver::new(db.clone()),
                ingestor: Ingestor::new(db.clone()),
                queue: WorkQueue::new(),
                enrichment: WorkQueue::new(),
                scheduler: Scheduler::new(),
                db,
                config,
                source,
                briefs,
                notifier,
            }),
        }
    }

    /// Build a pipeline with the HTTP listing source, the configured brief
    /// service and a webhook notifier sharing one client.
    pub fn from_config(db: Database, config: Config) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("feedbrief/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        let allow_private = config.crawl.allow_private_hosts;
        let source = HttpListingSource::new(client.clone()).allow_private_hosts(allow_private);
        let generator = BriefGenerator::new(client.clone(), &config.ai);
        let briefs = BriefService::new(db.clone(), generator, config.ai.enabled);
        let notifier = Notifier::new(client).allow_private_hosts(allow_private);

        Ok(Self::new(db, config, Arc::new(source), briefs, notifier))
    }

    pub fn db(&self) -> &Database {
        &self.inner.db
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// The serial crawl queue.
    pub fn queue(&self) -> &WorkQueue {
        &self.inner.queue
    }

    /// Brief units, on-fetch and batch, run here.
    pub fn enrichment_queue(&self) -> &WorkQueue {
        &self.inner.enrichment
    }

    pub fn queue_info(&self) -> QueueInfo {
        self.inner.queue.get_queue_info()
    }

    /// Wait until queued crawls and the brief units they produced are done.
    pub async fn wait_idle(&self) {
        self.inner.queue.wait_idle().await;
        self.inner.enrichment.wait_idle().await;
    }

    pub fn briefs(&self) -> &BriefService {
        &self.inner.briefs
    }

    /// Register every active task and start the scheduler driver.
    pub async fn start(&self) -> anyhow::Result<usize> {
        self.start_jobs(None).await
    }

    /// Register a cron job for each active task (or just `task_id`) and
    /// start the driver unless scheduling is disabled.
    ///
    /// Tasks without a cron expression, or with one that does not parse, are
    /// logged and skipped. Returns the number of task jobs registered.
    pub async fn start_jobs(&self, task_id: Option<&str>) -> anyhow::Result<usize> {
        let tasks = self
            .inner
            .db
            .get_active_tasks(task_id)
            .await
            .context("Failed to load tasks")?;
        if tasks.is_empty() {
            tracing::info!(task_id = task_id.unwrap_or("-"), "No active tasks to schedule");
        }

        let mut registered = 0;
        for task in &tasks {
            let Some(expr) = task
                .cron_exp
                .as_deref()
                .map(str::trim)
                .filter(|e| !e.is_empty())
            else {
                tracing::error!(task_id = %task.id, "Task has no cron expression, skipping");
                continue;
            };

            let weak = Arc::downgrade(&self.inner);
            let id = task.id.clone();
            let job = move || {
                let weak = weak.clone();
                let id = id.clone();
                async move { fire_task(weak, id).await }.boxed()
            };

            match self
                .inner
                .scheduler
                .add_cron_job(job, expr, Some(&task.id), Some(CRAWL_JOB_TAG))
                .await
            {
                Ok(job_id) => {
                    tracing::info!(job_id = %job_id, task = %task.name, cron = %expr, "Scheduled task");
                    registered += 1;
                }
                Err(e) => tracing::error!(task_id = %task.id, error = %e, "Skipping task"),
            }
        }

        if task_id.is_none() {
            self.register_brief_batch().await;
        }

        if self.inner.config.scheduler.enabled {
            self.inner.scheduler.start().await;
        } else {
            tracing::info!("Scheduler disabled by configuration");
        }
        Ok(registered)
    }

    /// Drop every job and pending unit, then register jobs again from the
    /// current task rows.
    pub async fn reload_jobs(&self) -> anyhow::Result<usize> {
        tracing::info!("Reloading jobs");
        self.inner.scheduler.clear_all_jobs().await;
        self.inner.queue.clear_queue();
        self.inner.enrichment.clear_queue();
        self.start_jobs(None).await
    }

    /// Enqueue crawl units for each active task (or just `task_id`) now.
    ///
    /// A test run clears the crawl queue once up front and enqueues only the
    /// first feed of each task. Returns the tasks that were run.
    pub async fn run_task(&self, task_id: Option<&str>, is_test: bool) -> anyhow::Result<Vec<Task>> {
        let tasks = self
            .inner
            .db
            .get_active_tasks(task_id)
            .await
            .context("Failed to load tasks")?;
        if tasks.is_empty() {
            tracing::warn!(task_id = task_id.unwrap_or("-"), "No active task to run");
        }
        if is_test {
            self.inner.queue.clear_queue();
        }

        for task in &tasks {
            tracing::info!(task_id = %task.id, task = %task.name, "Queueing task run");
            let feeds = self.inner.resolver.get_feeds(Some(task)).await;
            enqueue_feeds(&self.inner, task, feeds, is_test);
        }
        Ok(tasks)
    }

    /// Queue one brief batch unit. Returns false if the queue is shut down.
    pub fn enqueue_brief_batch(&self) -> bool {
        let briefs = self.inner.briefs.clone();
        let batch_size = self.inner.config.ai.batch_size;
        let max_concurrent = self.inner.config.ai.max_concurrent;
        self.inner.enrichment.add_task(BRIEF_BATCH_JOB, async move {
            briefs.generate_pending(batch_size, max_concurrent).await?;
            Ok(())
        })
    }

    /// Run one brief batch of up to `limit` articles right away, outside
    /// the queue.
    pub async fn generate_briefs(&self, limit: u32) -> Result<BatchResult, BriefError> {
        self.inner
            .briefs
            .generate_pending(limit, self.inner.config.ai.max_concurrent)
            .await
    }

    /// Stop the scheduler driver and both queue workers.
    pub async fn shutdown(&self) {
        self.inner.scheduler.stop().await;
        self.inner.queue.shutdown();
        self.inner.enrichment.shutdown();
    }

    async fn register_brief_batch(&self) {
        let ai = &self.inner.config.ai;
        if !(ai.enabled && ai.auto_generate) {
            return;
        }

        let expr = ai.batch_cron();
        let weak = Arc::downgrade(&self.inner);
        let job = move || {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    Pipeline { inner }.enqueue_brief_batch();
                }
                Ok(())
            }
            .boxed()
        };

        match self
            .inner
            .scheduler
            .add_cron_job(job, &expr, Some(BRIEF_BATCH_JOB), Some(BRIEF_BATCH_JOB))
            .await
        {
            Ok(_) => tracing::info!(cron = %expr, batch_size = ai.batch_size, "Scheduled brief batch"),
            Err(e) => tracing::error!(cron = %expr, error = %e, "Failed to schedule brief batch"),
        }
    }
}

/// Scheduler callback for one task. The task row is re-read and its feeds
/// re-resolved on every firing.
async fn fire_task(inner: Weak<Inner>, task_id: String) -> anyhow::Result<()> {
    let Some(inner) = inner.upgrade() else {
        return Ok(());
    };

    let task = match inner.db.get_task(&task_id).await? {
        Some(task) if task.status == STATUS_ACTIVE => task,
        Some(_) => {
            tracing::info!(task_id = %task_id, "Task is inactive, not running");
            return Ok(());
        }
        None => {
            tracing::warn!(task_id = %task_id, "Task no longer exists, not running");
            return Ok(());
        }
    };

    let feeds = inner.resolver.get_feeds(Some(&task)).await;
    enqueue_feeds(&inner, &task, feeds, false);
    Ok(())
}

fn enqueue_feeds(inner: &Arc<Inner>, task: &Task, feeds: Vec<Feed>, is_test: bool) -> usize {
    let mut queued = 0;
    for feed in feeds {
        let label = format!("crawl:{}:{}", task.id, feed.id);
        let name = feed.name.clone();
        if inner
            .queue
            .add_task(label, crawl_feed(Arc::clone(inner), task.clone(), feed))
        {
            queued += 1;
            tracing::info!(task_id = %task.id, feed = %name, test = is_test, "Feed queued");
        }
        if is_test {
            break;
        }
    }

    let info = inner.queue.get_queue_info();
    tracing::info!(
        task_id = %task.id,
        queued = queued,
        pending = info.pending,
        running = info.running,
        "Task feeds queued"
    );
    queued
}

/// Crawl unit for one feed of one task.
async fn crawl_feed(inner: Arc<Inner>, task: Task, feed: Feed) -> anyhow::Result<()> {
    let crawl_cfg = &inner.config.crawl;
    let mut crawl = CrawlOrchestrator::new(
        Arc::clone(&inner.source),
        Duration::from_secs(crawl_cfg.interval),
    );
    let mut sink = FeedSink {
        inner: &inner,
        task: &task,
        feed: &feed,
    };

    let summary = crawl
        .gather(&feed.source_key, crawl_cfg.max_page, crawl_cfg.start_page, &mut sink)
        .await;

    tracing::info!(
        task_id = %task.id,
        feed_id = %feed.id,
        ingested = summary.ingested,
        found = summary.found(),
        "Task feed done"
    );

    match summary.error {
        Some(error) => Err(anyhow::anyhow!("crawl of feed {} failed: {}", feed.id, error)),
        None => Ok(()),
    }
}

/// Ingests crawled entries for one feed and finishes the run.
struct FeedSink<'a> {
    inner: &'a Arc<Inner>,
    task: &'a Task,
    feed: &'a Feed,
}

impl FeedSink<'_> {
    fn enrich_on_fetch(&self) -> bool {
        let ai = &self.inner.config.ai;
        ai.enabled && ai.auto_generate_on_fetch && self.inner.briefs.is_enabled()
    }
}

#[async_trait]
impl<'a> GatherSink for FeedSink<'a> {
    async fn on_article(&mut self, entry: &ParsedArticle) -> IngestOutcome {
        let (outcome, article) = self
            .inner
            .ingestor
            .ingest_article(&self.feed.id, entry, true)
            .await;

        if outcome == IngestOutcome::Ingested && article.has_content() && self.enrich_on_fetch() {
            let briefs = self.inner.briefs.clone();
            let article_id = article.id;
            self.inner
                .enrichment
                .add_task(format!("brief:{}", article_id), async move {
                    briefs.generate_for_article(&article_id).await?;
                    Ok(())
                });
        }
        outcome
    }

    async fn on_complete(&mut self, summary: &GatherSummary) {
        if let Err(e) = self
            .inner
            .db
            .mark_feed_synced(&self.feed.id, summary.ingested > 0)
            .await
        {
            tracing::error!(feed_id = %self.feed.id, error = %e, "Failed to update feed sync time");
        }

        if let Err(e) = self
            .inner
            .notifier
            .notify(self.task, self.feed, &summary.articles)
            .await
        {
            tracing::warn!(task_id = %self.task.id, feed_id = %self.feed.id, error = %e, "Notification failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{FetchError, ListingPage};
    use crate::storage::Tag;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves the same entries on page 0 for every key.
    struct FixedSource {
        ids: Vec<&'static str>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ListingSource for FixedSource {
        async fn fetch_page(&self, _feed_key: &str, page: u32) -> Result<ListingPage, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if page > 0 {
                return Ok(ListingPage::default());
            }
            Ok(ListingPage {
                articles: self
                    .ids
                    .iter()
                    .map(|id| ParsedArticle {
                        source_id: id.to_string(),
                        title: id.to_string(),
                        url: None,
                        published: None,
                        content: Some(format!("body of {id}")),
                    })
                    .collect(),
                has_more: false,
            })
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.crawl.interval = 0;
        config.scheduler.enabled = false;
        config
    }

    async fn pipeline(config: Config, source: Arc<FixedSource>) -> Pipeline {
        let db = Database::open(":memory:").await.unwrap();
        let client = reqwest::Client::new();
        let generator = BriefGenerator::new(client.clone(), &config.ai);
        let briefs = BriefService::new(db.clone(), generator, config.ai.enabled);
        Pipeline::new(db, config, source, briefs, Notifier::new(client))
    }

    fn feed(id: &str) -> Feed {
        Feed {
            id: id.to_string(),
            name: format!("Feed {id}"),
            source_key: format!("https://example.com/{id}.xml"),
            status: STATUS_ACTIVE,
            update_time: None,
            sync_time: None,
        }
    }

    fn task(id: &str, cron: Option<&str>, feeds: &str) -> Task {
        Task {
            id: id.to_string(),
            name: format!("Task {id}"),
            cron_exp: cron.map(str::to_string),
            feed_refs: Some(feeds.to_string()),
            tag_refs: None,
            status: STATUS_ACTIVE,
            notification_url: None,
        }
    }

    #[tokio::test]
    async fn test_start_jobs_skips_missing_and_bad_cron() {
        let source = Arc::new(FixedSource {
            ids: vec![],
            calls: AtomicUsize::new(0),
        });
        let p = pipeline(test_config(), source).await;
        p.db().upsert_task(&task("t1", Some("*/5 * * * *"), "f1")).await.unwrap();
        p.db().upsert_task(&task("t2", None, "f1")).await.unwrap();
        p.db().upsert_task(&task("t3", Some("not a cron"), "f1")).await.unwrap();

        let registered = p.start_jobs(None).await.unwrap();

        assert_eq!(registered, 1);
        assert_eq!(p.scheduler().job_ids().await, vec!["t1".to_string()]);
        assert!(!p.scheduler().is_running());
    }

    #[tokio::test]
    async fn test_reload_replaces_jobs() {
        let source = Arc::new(FixedSource {
            ids: vec![],
            calls: AtomicUsize::new(0),
        });
        let p = pipeline(test_config(), source).await;
        p.db().upsert_task(&task("t1", Some("*/5 * * * *"), "f1")).await.unwrap();
        p.start_jobs(None).await.unwrap();

        let mut inactive = task("t1", Some("*/5 * * * *"), "f1");
        inactive.status = 0;
        p.db().upsert_task(&inactive).await.unwrap();
        p.db().upsert_task(&task("t2", Some("0 * * * *"), "f1")).await.unwrap();

        assert_eq!(p.reload_jobs().await.unwrap(), 1);
        assert_eq!(p.scheduler().job_ids().await, vec!["t2".to_string()]);
    }

    #[tokio::test]
    async fn test_brief_batch_job_registered_when_enabled() {
        let source = Arc::new(FixedSource {
            ids: vec![],
            calls: AtomicUsize::new(0),
        });
        let mut config = test_config();
        config.ai.enabled = true;
        config.ai.auto_generate = true;
        config.ai.generate_interval = 30;
        let p = pipeline(config, source).await;

        p.start().await.unwrap();

        let jobs = p.scheduler().jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, BRIEF_BATCH_JOB);
        assert_eq!(jobs[0].expr, "*/30 * * * *");
    }

    #[tokio::test]
    async fn test_run_task_ingests_and_syncs_feed() {
        let source = Arc::new(FixedSource {
            ids: vec!["a1", "a2"],
            calls: AtomicUsize::new(0),
        });
        let p = pipeline(test_config(), source.clone()).await;
        p.db().upsert_feed(&feed("f1")).await.unwrap();
        p.db().upsert_task(&task("t1", None, "f1")).await.unwrap();

        let tasks = p.run_task(Some("t1"), false).await.unwrap();
        p.wait_idle().await;

        assert_eq!(tasks.len(), 1);
        assert!(p.db().get_article("f1-a1").await.unwrap().is_some());
        assert!(p.db().get_article("f1-a2").await.unwrap().is_some());
        let synced = p.db().get_feed("f1").await.unwrap().unwrap();
        assert!(synced.sync_time.is_some());
        assert!(synced.update_time.is_some());
        // enrichment is off, so no brief units were queued
        assert_eq!(p.db().count_briefs().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_test_run_takes_first_feed_only() {
        let source = Arc::new(FixedSource {
            ids: vec!["a1"],
            calls: AtomicUsize::new(0),
        });
        let p = pipeline(test_config(), source.clone()).await;
        p.db().upsert_feed(&feed("f1")).await.unwrap();
        p.db().upsert_feed(&feed("f2")).await.unwrap();
        p.db().upsert_task(&task("t1", None, "f1,f2")).await.unwrap();

        p.run_task(Some("t1"), true).await.unwrap();
        p.wait_idle().await;

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(p.db().get_article("f1-a1").await.unwrap().is_some());
        assert!(p.db().get_article("f2-a1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_test_run_of_all_tasks_keeps_each_first_feed() {
        let source = Arc::new(FixedSource {
            ids: vec!["a1"],
            calls: AtomicUsize::new(0),
        });
        let p = pipeline(test_config(), source.clone()).await;
        p.db().upsert_feed(&feed("f1")).await.unwrap();
        p.db().upsert_feed(&feed("f2")).await.unwrap();
        p.db().upsert_task(&task("t1", None, "f1")).await.unwrap();
        p.db().upsert_task(&task("t2", None, "f2")).await.unwrap();

        let tasks = p.run_task(None, true).await.unwrap();
        p.wait_idle().await;

        assert_eq!(tasks.len(), 2);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert!(p.db().get_article("f1-a1").await.unwrap().is_some());
        assert!(p.db().get_article("f2-a1").await.unwrap().is_some());
        assert_eq!(p.queue_info().discarded, 0);
    }

    #[tokio::test]
    async fn test_scheduled_firing_rereads_task() {
        let source = Arc::new(FixedSource {
            ids: vec!["a1"],
            calls: AtomicUsize::new(0),
        });
        let p = pipeline(test_config(), source.clone()).await;
        p.db().upsert_feed(&feed("f1")).await.unwrap();
        p.db().upsert_feed(&feed("f2")).await.unwrap();
        p.db()
            .upsert_tag(&Tag {
                id: "g".to_string(),
                name: "Group".to_string(),
                feed_refs: Some(r#"["f2"]"#.to_string()),
            })
            .await
            .unwrap();
        p.db().upsert_task(&task("t1", Some("* * * * *"), "f1")).await.unwrap();
        p.start_jobs(None).await.unwrap();

        // Edit the task after registration; the next firing must see it.
        let mut edited = task("t1", Some("* * * * *"), "");
        edited.tag_refs = Some("g".to_string());
        p.db().upsert_task(&edited).await.unwrap();

        fire_task(Arc::downgrade(&p.inner), "t1".to_string()).await.unwrap();
        p.wait_idle().await;

        assert!(p.db().get_article("f2-a1").await.unwrap().is_some());
        assert!(p.db().get_article("f1-a1").await.unwrap().is_none());
    }
}
