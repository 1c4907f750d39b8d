//! Timeline service facade
//!
//! Owns the graph, the content store, the feed caches, the fan-out engine and
//! the reader, and exposes the boundary operations: publish, read, follow and
//! unfollow.

use resilience::{with_retry, RetryConfig};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::{FeedCache, FeedStore};
use crate::config::TimelineConfig;
use crate::content::{ContentRepository, ContentStore, UserDirectory};
use crate::cursor::FeedCursor;
use crate::error::{Result, TimelineError};
use crate::fanout::{FanoutConfig, FanoutEngine, FanoutReport, FanoutStats};
use crate::graph::SocialGraph;
use crate::keyed_lock::KeyedMutex;
use crate::metrics;
use crate::models::{FeedEntry, Post};
use crate::reader::{FeedPage, FeedReader, ReaderConfig};

/// Feed page as returned to callers, with posts hydrated.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedResponse {
    pub posts: Vec<Post>,
    pub cursor: Option<String>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FollowOutcome {
    Followed { backfilled: usize },
    AlreadyFollowing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnfollowOutcome {
    Unfollowed { purged: usize },
    NotFollowing,
}

pub struct TimelineService {
    config: TimelineConfig,
    graph: Arc<SocialGraph>,
    content: Arc<dyn ContentRepository>,
    feeds: Arc<dyn FeedStore>,
    fanout: FanoutEngine,
    reader: FeedReader,
    /// Serializes each follower's follow/unfollow with its backfill or purge.
    membership: KeyedMutex<Uuid>,
    retry: RetryConfig,
}

impl TimelineService {
    /// Build the service on the in-memory stores.
    pub fn new(config: TimelineConfig, directory: Arc<dyn UserDirectory>) -> Result<Self> {
        let content = Arc::new(ContentStore::new(directory, config.author_index_capacity));
        let feeds = Arc::new(FeedCache::new(config.feed_capacity));
        Self::with_stores(config, Arc::new(SocialGraph::new()), content, feeds)
    }

    /// Build the service on caller-supplied stores.
    pub fn with_stores(
        config: TimelineConfig,
        graph: Arc<SocialGraph>,
        content: Arc<dyn ContentRepository>,
        feeds: Arc<dyn FeedStore>,
    ) -> Result<Self> {
        config.validate()?;

        let fanout = FanoutEngine::new(
            FanoutConfig::from(&config),
            content.clone(),
            graph.clone(),
            feeds.clone(),
        );
        let reader = FeedReader::new(
            ReaderConfig::from(&config),
            graph.clone(),
            content.clone(),
            feeds.clone(),
            fanout.policy(),
        );

        info!(
            feed_capacity = config.feed_capacity,
            fanout_threshold = config.fanout_threshold,
            backfill_limit = config.backfill_limit,
            fanout_workers = config.fanout_workers,
            "Timeline service initialized"
        );

        Ok(Self {
            retry: config.retry_config(),
            config,
            graph,
            content,
            feeds,
            fanout,
            reader,
            membership: KeyedMutex::new(),
        })
    }

    pub fn config(&self) -> &TimelineConfig {
        &self.config
    }

    pub fn graph(&self) -> &Arc<SocialGraph> {
        &self.graph
    }

    pub fn content(&self) -> &Arc<dyn ContentRepository> {
        &self.content
    }

    pub fn feeds(&self) -> &Arc<dyn FeedStore> {
        &self.feeds
    }

    pub async fn publish_post(&self, author_id: Uuid, payload: impl Into<String>) -> Result<Post> {
        self.fanout.publish_post(author_id, payload.into()).await
    }

    /// Read one page of `user_id`'s feed.
    ///
    /// An empty cursor string is the same as no cursor. Posts that can no
    /// longer be loaded are skipped; pagination still follows the entries.
    pub async fn get_feed(
        &self,
        user_id: Uuid,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> Result<FeedResponse> {
        let cursor = match cursor {
            Some(raw) if !raw.is_empty() => Some(FeedCursor::decode(raw)?),
            _ => None,
        };

        let page = self.reader.get_feed(user_id, cursor, limit).await?;
        Ok(self.hydrate(user_id, page).await)
    }

    /// Entry-level page without hydration.
    pub async fn get_feed_page(
        &self,
        user_id: Uuid,
        cursor: Option<FeedCursor>,
        limit: Option<usize>,
    ) -> Result<FeedPage> {
        self.reader.get_feed(user_id, cursor, limit).await
    }

    async fn hydrate(&self, user_id: Uuid, page: FeedPage) -> FeedResponse {
        let mut posts = Vec::with_capacity(page.entries.len());
        for FeedEntry { post_id, .. } in page.entries {
            match self.content.get(post_id).await {
                Ok(Some(post)) => posts.push(post),
                Ok(None) => warn!(user_id = %user_id, post_id = %post_id, "Feed entry points at missing post"),
                Err(e) => warn!(
                    user_id = %user_id,
                    post_id = %post_id,
                    error = %e,
                    "Post lookup failed, skipping feed entry"
                ),
            }
        }

        FeedResponse {
            posts,
            cursor: page.next_cursor.map(|c| c.encode()),
            has_more: page.has_more,
        }
    }

    /// Follow `followee_id` and backfill their recent posts into the follower's cache.
    ///
    /// Backfill is best effort: if it fails the edge still stands and newer
    /// posts arrive through normal fan-out.
    pub async fn follow(&self, follower_id: Uuid, followee_id: Uuid) -> Result<FollowOutcome> {
        if follower_id == followee_id {
            return Err(TimelineError::SelfFollow(follower_id));
        }

        let _guard = self.membership.lock(follower_id).await;
        if self.graph.follow(follower_id, followee_id)?.is_none() {
            debug!(follower_id = %follower_id, followee_id = %followee_id, "Already following");
            return Ok(FollowOutcome::AlreadyFollowing);
        }

        let backfilled = self.backfill(follower_id, followee_id).await;
        info!(
            follower_id = %follower_id,
            followee_id = %followee_id,
            backfilled,
            "Follow created"
        );
        Ok(FollowOutcome::Followed { backfilled })
    }

    async fn backfill(&self, follower_id: Uuid, followee_id: Uuid) -> usize {
        let limit = self.config.backfill_limit;
        if limit == 0 {
            return 0;
        }

        let content = self.content.as_ref();
        let posts = match with_retry(self.retry.clone(), || {
            content.get_recent_by_author(followee_id, limit)
        })
        .await
        {
            Ok(posts) => posts,
            Err(e) => {
                warn!(
                    follower_id = %follower_id,
                    followee_id = %followee_id,
                    error = %e.into_last_error(),
                    "Backfill fetch failed, skipping"
                );
                return 0;
            }
        };
        if posts.is_empty() {
            return 0;
        }

        let entries: Vec<FeedEntry> = posts.iter().map(FeedEntry::from).collect();
        let feeds = self.feeds.as_ref();
        match with_retry(self.retry.clone(), || feeds.backfill(follower_id, entries.clone())).await
        {
            Ok(kept) => kept,
            Err(e) => {
                warn!(
                    follower_id = %follower_id,
                    followee_id = %followee_id,
                    error = %e.into_last_error(),
                    "Backfill write failed, skipping"
                );
                0
            }
        }
    }

    /// Remove the edge and purge the followee's entries from the follower's cache.
    ///
    /// A purge that still fails after retries is logged; the reader ignores
    /// entries from authors the user no longer follows, so reads stay correct.
    pub async fn unfollow(&self, follower_id: Uuid, followee_id: Uuid) -> Result<UnfollowOutcome> {
        let _guard = self.membership.lock(follower_id).await;
        if self.graph.unfollow(follower_id, followee_id).is_none() {
            debug!(follower_id = %follower_id, followee_id = %followee_id, "Not following");
            return Ok(UnfollowOutcome::NotFollowing);
        }

        let feeds = self.feeds.as_ref();
        let purged = match with_retry(self.retry.clone(), || {
            feeds.remove_by_author(follower_id, followee_id)
        })
        .await
        {
            Ok(purged) => purged,
            Err(e) => {
                error!(
                    follower_id = %follower_id,
                    followee_id = %followee_id,
                    attempts = e.attempts(),
                    error = %e.into_last_error(),
                    "Unfollow purge failed, stale entries left in cache"
                );
                0
            }
        };
        metrics::record_unfollow_purge(purged as u64);

        info!(
            follower_id = %follower_id,
            followee_id = %followee_id,
            purged,
            "Follow removed"
        );
        Ok(UnfollowOutcome::Unfollowed { purged })
    }

    pub fn get_followers(&self, user_id: Uuid) -> Vec<Uuid> {
        self.graph.get_followers(user_id).to_vec()
    }

    pub fn get_following(&self, user_id: Uuid) -> Vec<Uuid> {
        self.graph.get_following(user_id)
    }

    pub fn get_follower_count(&self, user_id: Uuid) -> usize {
        self.graph.get_follower_count(user_id)
    }

    pub fn is_following(&self, follower_id: Uuid, followee_id: Uuid) -> bool {
        self.graph.is_following(follower_id, followee_id)
    }

    /// Wait for all scheduled fan-out to land.
    pub async fn flush_fanout(&self) -> Vec<FanoutReport> {
        self.fanout.flush().await
    }

    pub fn fanout_stats(&self) -> FanoutStats {
        self.fanout.stats()
    }

    pub async fn shutdown(&self) -> Vec<FanoutReport> {
        self.fanout.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::InMemoryUserDirectory;

    fn service(directory: &Arc<InMemoryUserDirectory>) -> TimelineService {
        let config = TimelineConfig {
            feed_capacity: 10,
            fanout_threshold: 5,
            backfill_limit: 3,
            default_page_size: 5,
            max_page_size: 20,
            fanout_initial_backoff_ms: 1,
            ..Default::default()
        };
        TimelineService::new(config, directory.clone()).unwrap()
    }

    fn users(directory: &InMemoryUserDirectory, n: usize) -> Vec<Uuid> {
        (0..n)
            .map(|_| {
                let id = Uuid::new_v4();
                directory.register(id);
                id
            })
            .collect()
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let directory = Arc::new(InMemoryUserDirectory::new());
        let config = TimelineConfig {
            feed_capacity: 0,
            ..Default::default()
        };
        let result = TimelineService::new(config, directory);
        assert!(matches!(result, Err(TimelineError::Config(_))));
    }

    #[tokio::test]
    async fn test_follow_outcomes() {
        let directory = Arc::new(InMemoryUserDirectory::new());
        let svc = service(&directory);
        let ids = users(&directory, 2);

        assert_eq!(
            svc.follow(ids[0], ids[1]).await.unwrap(),
            FollowOutcome::Followed { backfilled: 0 }
        );
        assert_eq!(
            svc.follow(ids[0], ids[1]).await.unwrap(),
            FollowOutcome::AlreadyFollowing
        );
        assert!(matches!(
            svc.follow(ids[0], ids[0]).await,
            Err(TimelineError::SelfFollow(_))
        ));
        assert_eq!(svc.get_followers(ids[1]), vec![ids[0]]);
    }

    #[tokio::test]
    async fn test_follow_backfills_most_recent_posts() {
        let directory = Arc::new(InMemoryUserDirectory::new());
        let svc = service(&directory);
        let ids = users(&directory, 2);

        let mut posts = Vec::new();
        for i in 0..5 {
            posts.push(svc.publish_post(ids[1], format!("p{}", i)).await.unwrap());
        }

        let outcome = svc.follow(ids[0], ids[1]).await.unwrap();
        assert_eq!(outcome, FollowOutcome::Followed { backfilled: 3 });

        let cached = svc.feeds().get_page(ids[0]).await.unwrap();
        let cached_ids: Vec<_> = cached.iter().map(|e| e.post_id).collect();
        assert_eq!(cached_ids, vec![posts[4].id, posts[3].id, posts[2].id]);
    }

    #[tokio::test]
    async fn test_unfollow_purges_and_is_idempotent() {
        let directory = Arc::new(InMemoryUserDirectory::new());
        let svc = service(&directory);
        let ids = users(&directory, 2);

        svc.follow(ids[0], ids[1]).await.unwrap();
        svc.publish_post(ids[1], "one").await.unwrap();
        svc.publish_post(ids[1], "two").await.unwrap();
        svc.flush_fanout().await;

        assert_eq!(
            svc.unfollow(ids[0], ids[1]).await.unwrap(),
            UnfollowOutcome::Unfollowed { purged: 2 }
        );
        assert_eq!(
            svc.unfollow(ids[0], ids[1]).await.unwrap(),
            UnfollowOutcome::NotFollowing
        );
        assert_eq!(svc.feeds().len(ids[0]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_get_feed_hydrates_and_rejects_bad_cursor() {
        let directory = Arc::new(InMemoryUserDirectory::new());
        let svc = service(&directory);
        let ids = users(&directory, 2);

        svc.follow(ids[0], ids[1]).await.unwrap();
        let post = svc.publish_post(ids[1], "hello").await.unwrap();
        svc.flush_fanout().await;

        let response = svc.get_feed(ids[0], Some(""), None).await.unwrap();
        assert_eq!(response.posts, vec![post]);
        assert!(response.cursor.is_none());

        let err = svc.get_feed(ids[0], Some("garbage!"), None).await.unwrap_err();
        assert!(matches!(err, TimelineError::InvalidCursor(_)));
    }
}
