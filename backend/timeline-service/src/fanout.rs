//! Publish-time fan-out
//!
//! Authors below the follower threshold are pushed: a reference to the new
//! post is inserted into every follower's cache by a detached batch. Authors at
//! or above the threshold are pulled: nothing is written per follower and the
//! reader merges their posts at read time.
//!
//! Per-follower inserts are idempotent (insert-or-no-op by post id), so a
//! failed insert is simply retried with backoff, and a cancelled batch leaves
//! caches valid but stale.

use dashmap::DashSet;
use parking_lot::Mutex;
use resilience::{with_retry, RetryConfig};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::{FeedStore, InsertOutcome};
use crate::config::TimelineConfig;
use crate::content::ContentRepository;
use crate::error::{Result, TimelineError};
use crate::graph::SocialGraph;
use crate::metrics;
use crate::models::{FanoutMode, FeedEntry, Post, PostId};

/// Decides push vs pull and remembers which authors have pull-only posts.
#[derive(Debug)]
pub struct FanoutPolicy {
    threshold: usize,
    pull_history: DashSet<Uuid>,
}

impl FanoutPolicy {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            pull_history: DashSet::new(),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn mode_for(&self, follower_count: usize) -> FanoutMode {
        FanoutMode::for_follower_count(follower_count, self.threshold)
    }

    pub fn record_pull_publish(&self, author_id: Uuid) {
        self.pull_history.insert(author_id);
    }

    pub fn has_pull_history(&self, author_id: Uuid) -> bool {
        self.pull_history.contains(&author_id)
    }

    /// Whether readers must merge this author's posts at read time.
    ///
    /// True for authors currently in pull mode, and for authors that dropped
    /// back below the threshold after publishing in pull mode: those posts
    /// were never pushed.
    pub fn merges_at_read(&self, author_id: Uuid, follower_count: usize) -> bool {
        self.mode_for(follower_count) == FanoutMode::Pull || self.has_pull_history(author_id)
    }
}

/// Outcome of one publish's fan-out batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FanoutReport {
    pub post_id: PostId,
    pub author_id: Uuid,
    /// Followers in the snapshot taken at publish time
    pub targeted: usize,
    pub delivered: usize,
    pub duplicates: usize,
    /// Inserted into a full cache and immediately trimmed as oldest
    pub trimmed: usize,
    /// Gave up after retries
    pub dropped: usize,
    /// Never scheduled because of shutdown
    pub cancelled: usize,
}

impl FanoutReport {
    fn new(entry: &FeedEntry, targeted: usize) -> Self {
        Self {
            post_id: entry.post_id,
            author_id: entry.author_id,
            targeted,
            delivered: 0,
            duplicates: 0,
            trimmed: 0,
            dropped: 0,
            cancelled: 0,
        }
    }

    fn status(&self) -> &'static str {
        if self.cancelled > 0 {
            "cancelled"
        } else if self.dropped > 0 {
            "partial"
        } else {
            "complete"
        }
    }
}

#[derive(Debug, Default)]
struct FanoutCounters {
    push_published: AtomicU64,
    pull_published: AtomicU64,
    delivered: AtomicU64,
    duplicates: AtomicU64,
    trimmed: AtomicU64,
    dropped: AtomicU64,
    cancelled: AtomicU64,
}

impl FanoutCounters {
    fn absorb(&self, report: &FanoutReport) {
        self.delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.duplicates
            .fetch_add(report.duplicates as u64, Ordering::Relaxed);
        self.trimmed.fetch_add(report.trimmed as u64, Ordering::Relaxed);
        self.dropped.fetch_add(report.dropped as u64, Ordering::Relaxed);
        self.cancelled
            .fetch_add(report.cancelled as u64, Ordering::Relaxed);
    }
}

/// Cumulative fan-out statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FanoutStats {
    pub push_published: u64,
    pub pull_published: u64,
    pub delivered: u64,
    pub duplicates: u64,
    pub trimmed: u64,
    pub dropped: u64,
    pub cancelled: u64,
    pub pending_batches: usize,
}

#[derive(Debug, Clone)]
pub struct FanoutConfig {
    pub threshold: usize,
    pub workers: usize,
    pub retry: RetryConfig,
}

impl From<&TimelineConfig> for FanoutConfig {
    fn from(config: &TimelineConfig) -> Self {
        Self {
            threshold: config.fanout_threshold,
            workers: config.fanout_workers,
            retry: config.retry_config(),
        }
    }
}

pub struct FanoutEngine {
    content: Arc<dyn ContentRepository>,
    graph: Arc<SocialGraph>,
    feeds: Arc<dyn FeedStore>,
    policy: Arc<FanoutPolicy>,
    retry: RetryConfig,
    /// Shared by every batch: caps in-flight inserts engine-wide.
    permits: Arc<Semaphore>,
    counters: Arc<FanoutCounters>,
    batches: Mutex<JoinSet<FanoutReport>>,
    /// Batches spawned and not yet finished, whoever holds their handles.
    outstanding: Arc<Outstanding>,
    shutdown_tx: watch::Sender<bool>,
}

#[derive(Debug, Default)]
struct Outstanding {
    count: AtomicUsize,
    idle: Notify,
}

/// Held by a running batch; the last one to drop wakes waiting flushes.
struct OutstandingGuard(Arc<Outstanding>);

impl OutstandingGuard {
    fn new(outstanding: &Arc<Outstanding>) -> Self {
        outstanding.count.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(outstanding))
    }
}

impl Drop for OutstandingGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl FanoutEngine {
    pub fn new(
        config: FanoutConfig,
        content: Arc<dyn ContentRepository>,
        graph: Arc<SocialGraph>,
        feeds: Arc<dyn FeedStore>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            content,
            graph,
            feeds,
            policy: Arc::new(FanoutPolicy::new(config.threshold)),
            retry: config.retry,
            permits: Arc::new(Semaphore::new(config.workers.max(1))),
            counters: Arc::new(FanoutCounters::default()),
            batches: Mutex::new(JoinSet::new()),
            outstanding: Arc::new(Outstanding::default()),
            shutdown_tx,
        }
    }

    pub fn policy(&self) -> Arc<FanoutPolicy> {
        Arc::clone(&self.policy)
    }

    /// Store the post and start its fan-out.
    ///
    /// Returns as soon as the post is stored; push delivery continues in a
    /// detached batch.
    pub async fn publish_post(&self, author_id: Uuid, payload: String) -> Result<Post> {
        if *self.shutdown_tx.borrow() {
            return Err(TimelineError::ShuttingDown);
        }

        let post = self.content.create(author_id, payload).await?;
        let follower_count = self.graph.get_follower_count(author_id);
        let mode = self.policy.mode_for(follower_count);
        metrics::record_publish(mode.as_str());

        match mode {
            FanoutMode::Pull => {
                self.policy.record_pull_publish(author_id);
                self.counters.pull_published.fetch_add(1, Ordering::Relaxed);
                info!(
                    post_id = %post.id,
                    author_id = %author_id,
                    follower_count,
                    threshold = self.policy.threshold(),
                    "Published in pull mode, skipping per-follower writes"
                );
            }
            FanoutMode::Push => {
                self.counters.push_published.fetch_add(1, Ordering::Relaxed);
                let followers = self.graph.get_followers(author_id);
                if followers.is_empty() {
                    debug!(post_id = %post.id, author_id = %author_id, "No followers to fan out to");
                } else {
                    debug!(
                        post_id = %post.id,
                        author_id = %author_id,
                        followers = followers.len(),
                        "Scheduling push fan-out"
                    );
                    self.spawn_batch(FanoutBatch {
                        entry: post.to_entry(),
                        followers,
                        feeds: Arc::clone(&self.feeds),
                        permits: Arc::clone(&self.permits),
                        retry: self.retry.clone(),
                        counters: Arc::clone(&self.counters),
                        shutdown: self.shutdown_tx.subscribe(),
                    });
                }
            }
        }

        Ok(post)
    }

    fn spawn_batch(&self, batch: FanoutBatch) {
        let mut batches = self.batches.lock();
        while let Some(done) = batches.try_join_next() {
            if let Err(e) = done {
                log_batch_failure(&e);
            }
        }
        let guard = OutstandingGuard::new(&self.outstanding);
        batches.spawn(async move {
            let report = batch.run().await;
            drop(guard);
            report
        });
    }

    /// Wait for every outstanding batch and return the reports collected here.
    ///
    /// Batches that finished before this call may already have been reaped,
    /// and a concurrent `flush` or `shutdown` keeps the reports of the batches
    /// it drained. Either way this returns only once no batch is running, so
    /// [`FanoutEngine::stats`] reflects every one of them.
    pub async fn flush(&self) -> Vec<FanoutReport> {
        let mut reports = Vec::new();
        loop {
            let mut pending = std::mem::take(&mut *self.batches.lock());
            if pending.is_empty() {
                break;
            }
            while let Some(done) = pending.join_next().await {
                match done {
                    Ok(report) => reports.push(report),
                    Err(e) => log_batch_failure(&e),
                }
            }
        }
        self.wait_idle().await;
        reports
    }

    async fn wait_idle(&self) {
        loop {
            let idle = self.outstanding.idle.notified();
            if self.outstanding.count.load(Ordering::Acquire) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Stop scheduling inserts, let in-flight ones finish, and drain batches.
    pub async fn shutdown(&self) -> Vec<FanoutReport> {
        self.shutdown_tx.send_replace(true);
        info!("Fan-out engine shutting down");
        let reports = self.flush().await;
        let cancelled: usize = reports.iter().map(|r| r.cancelled).sum();
        info!(batches = reports.len(), cancelled, "Fan-out engine stopped");
        reports
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub fn stats(&self) -> FanoutStats {
        let c = &self.counters;
        FanoutStats {
            push_published: c.push_published.load(Ordering::Relaxed),
            pull_published: c.pull_published.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            trimmed: c.trimmed.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            pending_batches: self.outstanding.count.load(Ordering::Acquire),
        }
    }
}

fn log_batch_failure(e: &JoinError) {
    if e.is_cancelled() {
        warn!("Fan-out batch aborted");
    } else {
        error!(error = %e, "Fan-out batch panicked");
    }
}

/// Everything one detached batch needs; owns its own handles.
struct FanoutBatch {
    entry: FeedEntry,
    followers: Arc<[Uuid]>,
    feeds: Arc<dyn FeedStore>,
    permits: Arc<Semaphore>,
    retry: RetryConfig,
    counters: Arc<FanoutCounters>,
    shutdown: watch::Receiver<bool>,
}

impl FanoutBatch {
    async fn run(mut self) -> FanoutReport {
        let started = Instant::now();
        let followers = Arc::clone(&self.followers);
        let mut report = FanoutReport::new(&self.entry, followers.len());
        let mut deliveries: JoinSet<Option<InsertOutcome>> = JoinSet::new();

        for (scheduled, follower_id) in followers.iter().copied().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => None,
                permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                report.cancelled = followers.len() - scheduled;
                break;
            };

            let feeds = Arc::clone(&self.feeds);
            let retry = self.retry.clone();
            let entry = self.entry;
            deliveries.spawn(async move {
                let outcome = deliver(feeds.as_ref(), follower_id, entry, retry).await;
                drop(permit);
                outcome
            });

            while let Some(done) = deliveries.try_join_next() {
                tally(&mut report, done);
            }
        }

        while let Some(done) = deliveries.join_next().await {
            tally(&mut report, done);
        }

        self.counters.absorb(&report);
        metrics::record_fanout_inserts("delivered", report.delivered as u64);
        metrics::record_fanout_inserts("duplicate", report.duplicates as u64);
        metrics::record_fanout_inserts("trimmed", report.trimmed as u64);
        metrics::record_fanout_inserts("dropped", report.dropped as u64);
        metrics::record_fanout_inserts("cancelled", report.cancelled as u64);
        metrics::record_fanout_batch(report.status(), started.elapsed());

        info!(
            post_id = %report.post_id,
            author_id = %report.author_id,
            targeted = report.targeted,
            delivered = report.delivered,
            duplicates = report.duplicates,
            dropped = report.dropped,
            cancelled = report.cancelled,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Fan-out batch finished"
        );
        report
    }
}

fn tally(
    report: &mut FanoutReport,
    done: std::result::Result<Option<InsertOutcome>, JoinError>,
) {
    match done {
        Ok(Some(InsertOutcome::Inserted)) => report.delivered += 1,
        Ok(Some(InsertOutcome::AlreadyPresent)) => report.duplicates += 1,
        Ok(Some(InsertOutcome::Trimmed)) => report.trimmed += 1,
        Ok(None) => report.dropped += 1,
        Err(e) => {
            error!(post_id = %report.post_id, error = %e, "Fan-out insert task failed");
            report.dropped += 1;
        }
    }
}

/// Insert one follower's entry, retrying transient store errors.
///
/// Returns `None` once retries are exhausted; the follower simply misses this
/// post until a later publish or backfill touches their cache.
async fn deliver(
    feeds: &dyn FeedStore,
    follower_id: Uuid,
    entry: FeedEntry,
    retry: RetryConfig,
) -> Option<InsertOutcome> {
    match with_retry(retry, || feeds.insert(follower_id, entry)).await {
        Ok(outcome) => {
            debug!(
                follower_id = %follower_id,
                post_id = %entry.post_id,
                ?outcome,
                "Fan-out insert applied"
            );
            Some(outcome)
        }
        Err(e) => {
            let attempts = e.attempts();
            warn!(
                follower_id = %follower_id,
                post_id = %entry.post_id,
                author_id = %entry.author_id,
                attempts,
                error = %e.into_last_error(),
                "Dropping fan-out insert after retries"
            );
            None
        }
    }
}

/// Resolves once shutdown is signalled. Never resolves if the sender is gone.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
