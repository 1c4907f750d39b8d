//! Test Harness Module
//!
//! Provides infrastructure for timeline integration tests:
//! - Service construction with small, test-sized policy parameters
//! - User registration helpers
//! - Feed walking across cursor pages
//! - One-time tracing setup (set RUST_LOG to see service logs)

#![allow(dead_code)]

use once_cell::sync::Lazy;
use std::sync::Arc;
use timeline_service::{
    FeedEntry, FeedPage, InMemoryUserDirectory, PostId, TimelineConfig, TimelineService,
};
use uuid::Uuid;

static TRACING: Lazy<()> = Lazy::new(|| {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "warn".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
});

/// Test Environment
pub struct TestEnvironment {
    pub service: TimelineService,
    pub directory: Arc<InMemoryUserDirectory>,
}

impl TestEnvironment {
    /// Service with the given cache capacity (N), threshold (T) and backfill limit (M).
    pub fn new(feed_capacity: usize, fanout_threshold: usize, backfill_limit: usize) -> Self {
        Self::with_config(TimelineConfig {
            feed_capacity,
            fanout_threshold,
            backfill_limit,
            default_page_size: 20,
            max_page_size: 1_000,
            author_index_capacity: 2_000,
            fanout_workers: 16,
            fanout_max_retries: 2,
            fanout_initial_backoff_ms: 1,
            pull_timeout_ms: 2_000,
        })
    }

    pub fn with_config(config: TimelineConfig) -> Self {
        Lazy::force(&TRACING);
        let directory = Arc::new(InMemoryUserDirectory::new());
        let service = TimelineService::new(config, directory.clone())
            .expect("test config should be valid");
        Self { service, directory }
    }

    pub fn user(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.directory.register(id);
        id
    }

    pub fn users(&self, n: usize) -> Vec<Uuid> {
        (0..n).map(|_| self.user()).collect()
    }

    /// Page through the whole feed, returning every entry in order.
    pub async fn read_all(&self, user_id: Uuid, page_size: usize) -> Vec<FeedEntry> {
        let mut entries = Vec::new();
        let mut cursor = None;
        loop {
            let page: FeedPage = self
                .service
                .get_feed_page(user_id, cursor, Some(page_size))
                .await
                .expect("feed read should succeed");
            entries.extend(page.entries);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return entries,
            }
        }
    }

    pub async fn feed_ids(&self, user_id: Uuid, limit: usize) -> Vec<PostId> {
        self.service
            .get_feed_page(user_id, None, Some(limit))
            .await
            .expect("feed read should succeed")
            .entries
            .iter()
            .map(|e| e.post_id)
            .collect()
    }

    pub async fn cached_ids(&self, user_id: Uuid) -> Vec<PostId> {
        self.service
            .feeds()
            .get_page(user_id)
            .await
            .expect("cache read should succeed")
            .iter()
            .map(|e| e.post_id)
            .collect()
    }
}

/// Entries are strictly newest first with no duplicate posts.
pub fn assert_newest_first(entries: &[FeedEntry]) {
    for pair in entries.windows(2) {
        assert!(
            pair[0].key() > pair[1].key(),
            "feed out of order: {:?} before {:?}",
            pair[0],
            pair[1]
        );
    }
}
