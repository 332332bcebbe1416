//! Cron scheduler: a registry of cron expressions mapped to async jobs.
//!
//! A single driver task wakes once per second and fires every job whose next
//! occurrence has passed. Jobs run on their own tokio tasks; the driver never
//! waits on them, so a slow, failing or panicking job cannot stall the
//! schedule or its siblings.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use croner::Cron;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

const TICK: Duration = Duration::from_secs(1);

/// An async job body. Arguments are captured by the closure.
pub type JobFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },
}

struct CronJob {
    expr: String,
    cron: Cron,
    tag: Option<String>,
    func: JobFn,
    next_fire: Option<DateTime<Utc>>,
}

impl CronJob {
    fn advance(&mut self, from: &DateTime<Utc>) {
        self.next_fire = self.cron.find_next_occurrence(from, false).ok();
    }
}

/// Snapshot of a registered job, for logging and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct JobInfo {
    pub id: String,
    pub expr: String,
    pub tag: Option<String>,
    pub next_fire: Option<DateTime<Utc>>,
}

/// Parse a five-field cron expression.
pub fn parse_cron(expr: &str) -> Result<Cron, SchedulerError> {
    Cron::new(expr)
        .parse()
        .map_err(|e| SchedulerError::InvalidCron {
            expr: expr.to_string(),
            reason: e.to_string(),
        })
}

pub struct Scheduler {
    jobs: Arc<RwLock<HashMap<String, CronJob>>>,
    driver: Mutex<Option<tokio::task::JoinHandle<()>>>,
    running: Arc<AtomicBool>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            driver: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register `func` under `expr`.
    ///
    /// Without a `job_id` a fresh UUID is generated. Re-adding an existing id
    /// replaces that job. Returns the id the job was stored under.
    pub async fn add_cron_job<F>(
        &self,
        func: F,
        expr: &str,
        job_id: Option<&str>,
        tag: Option<&str>,
    ) -> Result<String, SchedulerError>
    where
        F: Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        let cron = parse_cron(expr)?;
        let id = job_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut job = CronJob {
            expr: expr.to_string(),
            cron,
            tag: tag.map(str::to_string),
            func: Arc::new(func),
            next_fire: None,
        };
        job.advance(&Utc::now());

        tracing::info!(
            job_id = %id,
            cron = %expr,
            next_fire = ?job.next_fire,
            "Registered cron job"
        );

        let mut jobs = self.jobs.write().await;
        if jobs.insert(id.clone(), job).is_some() {
            tracing::debug!(job_id = %id, "Replaced existing cron job");
        }
        Ok(id)
    }

    /// Remove every registered job. The driver keeps running.
    pub async fn clear_all_jobs(&self) {
        let mut jobs = self.jobs.write().await;
        let count = jobs.len();
        jobs.clear();
        tracing::info!(removed = count, "Cleared all cron jobs");
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Registered jobs, sorted by id.
    pub async fn jobs(&self) -> Vec<JobInfo> {
        let jobs = self.jobs.read().await;
        let mut out: Vec<JobInfo> = jobs
            .iter()
            .map(|(id, job)| JobInfo {
                id: id.clone(),
                expr: job.expr.clone(),
                tag: job.tag.clone(),
                next_fire: job.next_fire,
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub async fn job_ids(&self) -> Vec<String> {
        self.jobs().await.into_iter().map(|j| j.id).collect()
    }

    /// Start the background driver. Calling it again while running is a no-op.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let jobs = Arc::clone(&self.jobs);
        let running = Arc::clone(&self.running);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            while running.load(Ordering::SeqCst) {
                ticker.tick().await;
                Self::fire_due_inner(&jobs, Utc::now()).await;
            }
        });

        *self.driver.lock().await = Some(handle);
        tracing::info!("Scheduler started");
    }

    /// Stop the driver. Jobs already fired keep running.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.driver.lock().await.take() {
            handle.abort();
            tracing::info!("Scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Fire every job due at `now` and return how many fired.
    ///
    /// This is one driver tick; exposed so callers can drive the schedule
    /// with an explicit clock.
    pub async fn fire_due(&self, now: DateTime<Utc>) -> usize {
        Self::fire_due_inner(&self.jobs, now).await
    }

    async fn fire_due_inner(jobs: &RwLock<HashMap<String, CronJob>>, now: DateTime<Utc>) -> usize {
        let due: Vec<(String, JobFn)> = {
            let mut jobs = jobs.write().await;
            jobs.iter_mut()
                .filter(|(_, job)| job.next_fire.is_some_and(|at| at <= now))
                .map(|(id, job)| {
                    job.advance(&now);
                    (id.clone(), Arc::clone(&job.func))
                })
                .collect()
        };

        for (id, func) in &due {
            tracing::debug!(job_id = %id, "Firing cron job");
            let id = id.clone();
            let fut = func();
            tokio::spawn(async move {
                if let Err(e) = fut.await {
                    tracing::error!(job_id = %id, error = %e, "Cron job failed");
                }
            });
        }
        due.len()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.driver.get_mut().take() {
            handle.abort();
        }
    }
}
