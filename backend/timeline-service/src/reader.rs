//! Feed assembly
//!
//! A page is the user's cached entries merged with recent posts from every
//! followee whose posts were not pushed. Both sources are cut at the cursor,
//! merged by [`FeedKey`] with post-id dedup, and the newest `limit` returned.

use futures::future::join_all;
use resilience::{with_timeout_result, TimeoutError};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::FeedStore;
use crate::config::TimelineConfig;
use crate::content::ContentRepository;
use crate::cursor::FeedCursor;
use crate::error::Result;
use crate::fanout::FanoutPolicy;
use crate::graph::SocialGraph;
use crate::metrics;
use crate::models::{FeedEntry, FeedKey};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedPage {
    /// Newest first
    pub entries: Vec<FeedEntry>,
    /// `None` once the feed is exhausted
    pub next_cursor: Option<FeedCursor>,
    pub has_more: bool,
}

#[derive(Debug, Clone)]
pub struct ReaderConfig {
    pub default_page_size: usize,
    pub max_page_size: usize,
    pub pull_timeout: Duration,
}

impl From<&TimelineConfig> for ReaderConfig {
    fn from(config: &TimelineConfig) -> Self {
        Self {
            default_page_size: config.default_page_size,
            max_page_size: config.max_page_size,
            pull_timeout: config.pull_timeout(),
        }
    }
}

pub struct FeedReader {
    graph: Arc<SocialGraph>,
    content: Arc<dyn ContentRepository>,
    feeds: Arc<dyn FeedStore>,
    policy: Arc<FanoutPolicy>,
    config: ReaderConfig,
}

impl FeedReader {
    pub fn new(
        config: ReaderConfig,
        graph: Arc<SocialGraph>,
        content: Arc<dyn ContentRepository>,
        feeds: Arc<dyn FeedStore>,
        policy: Arc<FanoutPolicy>,
    ) -> Self {
        Self {
            graph,
            content,
            feeds,
            policy,
            config,
        }
    }

    /// Page size after applying the default and clamping to `[1, max]`.
    pub fn page_size(&self, limit: Option<usize>) -> usize {
        limit
            .unwrap_or(self.config.default_page_size)
            .clamp(1, self.config.max_page_size)
    }

    pub async fn get_feed(
        &self,
        user_id: Uuid,
        cursor: Option<FeedCursor>,
        limit: Option<usize>,
    ) -> Result<FeedPage> {
        let limit = self.page_size(limit);
        let before = cursor.map(|c| c.key());
        let following: HashSet<Uuid> = self.graph.get_following(user_id).into_iter().collect();

        let mut merged: BTreeMap<FeedKey, FeedEntry> = BTreeMap::new();

        // Cached entries from authors since unfollowed can linger if a push
        // landed after the purge; the live follow set is authoritative.
        let cached = self.feeds.get_page(user_id).await?;
        let mut stale = 0usize;
        for entry in cached {
            if !following.contains(&entry.author_id) {
                stale += 1;
                continue;
            }
            if before.map_or(true, |b| entry.key() < b) {
                merged.insert(entry.key(), entry);
            }
        }
        let from_cache = merged.len();

        let pull_authors: Vec<Uuid> = following
            .iter()
            .copied()
            .filter(|author| {
                self.policy
                    .merges_at_read(*author, self.graph.get_follower_count(*author))
            })
            .collect();

        let pulled = if pull_authors.is_empty() {
            0
        } else {
            let entries = self.pull_recent(&pull_authors, before, limit + 1).await;
            let count = entries.len();
            for entry in entries {
                merged.entry(entry.key()).or_insert(entry);
            }
            count
        };
        metrics::record_feed_read(!pull_authors.is_empty());

        let has_more = merged.len() > limit;
        let entries: Vec<FeedEntry> = merged.into_values().rev().take(limit).collect();
        let next_cursor = if has_more {
            entries.last().map(FeedCursor::after_entry)
        } else {
            None
        };

        debug!(
            user_id = %user_id,
            limit,
            from_cache,
            stale,
            pull_authors = pull_authors.len(),
            pulled,
            returned = entries.len(),
            has_more,
            "Assembled feed page"
        );

        Ok(FeedPage {
            entries,
            next_cursor,
            has_more,
        })
    }

    /// Fetch up to `per_author` posts older than `before` from each author.
    ///
    /// Authors whose fetch fails or times out are left out of this page.
    async fn pull_recent(
        &self,
        authors: &[Uuid],
        before: Option<FeedKey>,
        per_author: usize,
    ) -> Vec<FeedEntry> {
        let fetches = authors.iter().map(|&author_id| async move {
            let fetch = self
                .content
                .get_recent_by_author_before(author_id, before, per_author);
            (
                author_id,
                with_timeout_result(self.config.pull_timeout, fetch).await,
            )
        });

        let mut entries = Vec::new();
        for (author_id, result) in join_all(fetches).await {
            match result {
                Ok(posts) => entries.extend(posts.iter().map(FeedEntry::from)),
                Err(TimeoutError::Elapsed(after)) => {
                    metrics::record_pull_failure("timeout");
                    warn!(
                        author_id = %author_id,
                        timeout_ms = after.as_millis() as u64,
                        "Pull fetch timed out, omitting author from page"
                    );
                }
                Err(TimeoutError::Failed(e)) => {
                    metrics::record_pull_failure("error");
                    warn!(
                        author_id = %author_id,
                        error = %e,
                        "Pull fetch failed, omitting author from page"
                    );
                }
            }
        }
        entries
    }
}
