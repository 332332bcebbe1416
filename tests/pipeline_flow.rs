//! Integration tests for the scheduled flow: task resolution, the serial work
//! queue, and a full scheduler → crawl → ingest → brief run against mocked
//! HTTP services.
//!
//! Each test creates its own in-memory SQLite database for isolation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use secrecy::SecretString;
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use feedbrief::brief::{BriefGenerator, BriefService};
use feedbrief::config::Config;
use feedbrief::feed::{FeedResolver, HttpListingSource};
use feedbrief::notify::Notifier;
use feedbrief::pipeline::Pipeline;
use feedbrief::queue::WorkQueue;
use feedbrief::storage::{Database, Feed, Tag, Task, STATUS_ACTIVE};

async fn test_db() -> Database {
    Database::open(":memory:").await.unwrap()
}

fn test_feed(id: &str, source_key: &str) -> Feed {
    Feed {
        id: id.to_string(),
        name: format!("Feed {}", id),
        source_key: source_key.to_string(),
        status: STATUS_ACTIVE,
        update_time: None,
        sync_time: None,
    }
}

fn test_task(id: &str, feed_refs: Option<&str>, tag_refs: Option<&str>) -> Task {
    Task {
        id: id.to_string(),
        name: format!("Task {}", id),
        cron_exp: Some("*/5 * * * *".to_string()),
        feed_refs: feed_refs.map(str::to_string),
        tag_refs: tag_refs.map(str::to_string),
        status: STATUS_ACTIVE,
        notification_url: None,
    }
}

fn feed_ids(feeds: &[Feed]) -> Vec<&str> {
    feeds.iter().map(|f| f.id.as_str()).collect()
}

// ============================================================================
// Resolution
// ============================================================================

#[tokio::test]
async fn test_task_without_refs_covers_all_feeds() {
    let db = test_db().await;
    for id in ["A", "B", "C"] {
        db.upsert_feed(&test_feed(id, "https://example.com/rss")).await.unwrap();
    }
    let resolver = FeedResolver::new(db.clone());

    let feeds = resolver.get_feeds(Some(&test_task("T", None, None))).await;
    assert_eq!(feed_ids(&feeds), vec!["A", "B", "C"]);

    let feeds = resolver.get_feeds(None).await;
    assert_eq!(feeds.len(), 3);

    // Refs that match nothing fall back too.
    let feeds = resolver
        .get_feeds(Some(&test_task("T", Some(r#"["nope"]"#), None)))
        .await;
    assert_eq!(feeds.len(), 3);
}

#[tokio::test]
async fn test_tag_members_expand_after_explicit_feeds() {
    let db = test_db().await;
    for id in ["A", "B", "C"] {
        db.upsert_feed(&test_feed(id, "https://example.com/rss")).await.unwrap();
    }
    db.upsert_tag(&Tag {
        id: "tech".to_string(),
        name: "Tech".to_string(),
        feed_refs: Some(r#"[{"id": "A"}, {"id": "B"}]"#.to_string()),
    })
    .await
    .unwrap();
    let resolver = FeedResolver::new(db.clone());

    let only_tag = resolver
        .get_feeds(Some(&test_task("T", None, Some(r#"["tech"]"#))))
        .await;
    assert_eq!(feed_ids(&only_tag), vec!["A", "B"]);

    let mixed = resolver
        .get_feeds(Some(&test_task("T", Some("C,B"), Some("tech"))))
        .await;
    assert_eq!(feed_ids(&mixed), vec!["C", "B", "A"]);
}

#[tokio::test]
async fn test_malformed_refs_fall_back() {
    let db = test_db().await;
    db.upsert_feed(&test_feed("A", "https://example.com/rss")).await.unwrap();
    let resolver = FeedResolver::new(db.clone());

    let feeds = resolver
        .get_feeds(Some(&test_task("T", Some(r#"[{"id": "#), Some("[1, "))))
        .await;
    assert_eq!(feed_ids(&feeds), vec!["A"]);
}

// ============================================================================
// Work queue
// ============================================================================

#[tokio::test]
async fn test_queue_never_overlaps_units() {
    let queue = WorkQueue::new();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    for i in 0..20 {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        let done = Arc::clone(&done);
        assert!(queue.add_task(format!("unit-{}", i), async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
            running.fetch_sub(1, Ordering::SeqCst);
            done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
    }

    queue.wait_idle().await;

    assert_eq!(done.load(Ordering::SeqCst), 20);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    let info = queue.get_queue_info();
    assert_eq!(info.pending, 0);
    assert_eq!(info.failed, 0);
}

// ============================================================================
// End to end
// ============================================================================

const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Feed One</title>
    <link>https://example.com</link>
    <description>Test feed</description>
    <item>
      <guid isPermaLink="false">a1</guid>
      <title>First article</title>
      <link>https://example.com/a1</link>
      <description>Body of the first article</description>
    </item>
    <item>
      <guid isPermaLink="false">a2</guid>
      <title>Second article</title>
      <link>https://example.com/a2</link>
      <description>Body of the second article</description>
    </item>
  </channel>
</rss>"#;

fn completion() -> serde_json::Value {
    let content = json!({
        "summary": "Summary",
        "highlights": [{ "title": "Point", "detail": "Detail" }]
    })
    .to_string();
    json!({ "choices": [{ "message": { "content": content } }] })
}

async fn e2e_pipeline(db: Database, server: &MockServer) -> Pipeline {
    let mut config = Config::default();
    config.crawl.interval = 0;
    config.crawl.allow_private_hosts = true;
    config.scheduler.enabled = false;
    config.ai.enabled = true;
    config.ai.auto_generate_on_fetch = true;
    config.ai.api_url = format!("{}/v1/chat/completions", server.uri());

    let client = reqwest::Client::new();
    let source = HttpListingSource::new(client.clone())
        .allow_private_hosts(true)
        .with_backoff_base(Duration::from_millis(5));
    let generator = BriefGenerator::new(client.clone(), &config.ai)
        .with_api_key(Some(SecretString::from("test-key".to_string())))
        .with_retry_delay(Duration::from_millis(5))
        .with_backoff_base(Duration::from_millis(5));
    let briefs = BriefService::new(db.clone(), generator, true);
    let notifier = Notifier::new(client).allow_private_hosts(true);

    Pipeline::new(db, config, Arc::new(source), briefs, notifier)
}

/// Poll until the feed's crawl has completed at least once.
async fn wait_for_sync(db: &Database, feed_id: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let feed = db.get_feed(feed_id).await.unwrap().unwrap();
            if feed.sync_time.is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("crawl did not complete");
}

#[tokio::test]
async fn test_scheduled_task_crawls_ingests_and_briefs() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/f1.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(RSS))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion()))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(body_partial_json(json!({
            "task": { "id": "T" },
            "feed": { "id": "F1" },
            "count": 2
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let db = test_db().await;
    db.upsert_feed(&test_feed("F1", &format!("{}/f1.xml", server.uri())))
        .await
        .unwrap();
    db.upsert_feed(&test_feed("F2", "https://example.com/other.xml"))
        .await
        .unwrap();
    let mut task = test_task("T", Some(r#"["F1"]"#), None);
    task.notification_url = Some(format!("{}/hook", server.uri()));
    db.upsert_task(&task).await.unwrap();

    let resolved = FeedResolver::new(db.clone()).get_feeds(Some(&task)).await;
    assert_eq!(feed_ids(&resolved), vec!["F1"]);

    let pipeline = e2e_pipeline(db.clone(), &server).await;
    assert_eq!(pipeline.start_jobs(None).await.unwrap(), 1);

    let jobs = pipeline.scheduler().jobs().await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, "T");
    let next_fire = jobs[0].next_fire.unwrap();

    assert_eq!(pipeline.scheduler().fire_due(next_fire).await, 1);
    wait_for_sync(&db, "F1").await;
    pipeline.wait_idle().await;

    let stored = db.get_articles_for_feed("F1", None).await.unwrap();
    let mut ids: Vec<&str> = stored.iter().map(|a| a.id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["F1-a1", "F1-a2"]);

    for id in ["F1-a1", "F1-a2"] {
        let brief = db.get_brief_by_article(id).await.unwrap();
        assert!(brief.is_some(), "missing brief for {}", id);
    }
    assert_eq!(db.count_briefs().await.unwrap(), 2);
    assert!(db.get_articles_for_feed("F2", None).await.unwrap().is_empty());

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_rerun_adds_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/f1.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(RSS))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion()))
        .expect(2)
        .mount(&server)
        .await;

    let db = test_db().await;
    db.upsert_feed(&test_feed("F1", &format!("{}/f1.xml", server.uri())))
        .await
        .unwrap();
    db.upsert_task(&test_task("T", Some("F1"), None)).await.unwrap();

    let pipeline = e2e_pipeline(db.clone(), &server).await;
    pipeline.run_task(Some("T"), false).await.unwrap();
    pipeline.wait_idle().await;
    let first_sync = db.get_feed("F1").await.unwrap().unwrap();

    pipeline.run_task(Some("T"), false).await.unwrap();
    pipeline.wait_idle().await;

    assert_eq!(db.get_articles_for_feed("F1", None).await.unwrap().len(), 2);
    assert_eq!(db.count_briefs().await.unwrap(), 2);
    let second_sync = db.get_feed("F1").await.unwrap().unwrap();
    assert_eq!(second_sync.update_time, first_sync.update_time);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_slow_brief_does_not_hold_up_next_crawl() {
    let server = MockServer::start().await;
    for feed in ["/f1.xml", "/f2.xml"] {
        Mock::given(method("GET"))
            .and(path(feed))
            .respond_with(ResponseTemplate::new(200).set_body_string(RSS))
            .mount(&server)
            .await;
    }
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion())
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let db = test_db().await;
    db.upsert_feed(&test_feed("F1", &format!("{}/f1.xml", server.uri())))
        .await
        .unwrap();
    db.upsert_feed(&test_feed("F2", &format!("{}/f2.xml", server.uri())))
        .await
        .unwrap();
    db.upsert_task(&test_task("T", Some("F1,F2"), None)).await.unwrap();

    let pipeline = e2e_pipeline(db.clone(), &server).await;
    pipeline.run_task(Some("T"), false).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), pipeline.queue().wait_idle())
        .await
        .expect("crawls waited on enrichment");

    assert_eq!(pipeline.queue_info().completed, 2);
    assert_eq!(db.get_articles_for_feed("F2", None).await.unwrap().len(), 2);
    assert_eq!(db.count_briefs().await.unwrap(), 0);
    let briefs = pipeline.enrichment_queue().get_queue_info();
    assert!(briefs.pending + briefs.running > 0);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_failed_listing_still_completes_run() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/f1.xml"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let db = test_db().await;
    db.upsert_feed(&test_feed("F1", &format!("{}/f1.xml", server.uri())))
        .await
        .unwrap();
    db.upsert_task(&test_task("T", Some("F1"), None)).await.unwrap();

    let pipeline = e2e_pipeline(db.clone(), &server).await;
    pipeline.run_task(Some("T"), false).await.unwrap();
    pipeline.wait_idle().await;

    let feed = db.get_feed("F1").await.unwrap().unwrap();
    assert!(feed.sync_time.is_some());
    assert!(feed.update_time.is_none());
    assert_eq!(pipeline.queue_info().failed, 1);

    pipeline.shutdown().await;
}
