//! Per-user materialized feeds
//!
//! [`FeedStore`] is the contract fan-out, follow backfill, unfollow purge and
//! the reader program against. [`FeedCache`] is the in-process implementation;
//! a durable ordered key-value store can stand in behind the same trait.
pub mod feed_cache;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::FeedEntry;

pub use feed_cache::{CacheStats, FeedCache};

/// Result of inserting one entry into a user's feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Entry is now in the feed.
    Inserted,
    /// The post was already present; nothing changed.
    AlreadyPresent,
    /// The feed is full of newer entries; the entry was trimmed immediately.
    Trimmed,
}

#[async_trait]
pub trait FeedStore: Send + Sync {
    /// Insert-or-no-op keyed by post id, followed by capacity trimming.
    async fn insert(&self, user_id: Uuid, entry: FeedEntry) -> Result<InsertOutcome>;

    /// Merge a batch with the insert rule and trim once. Returns entries kept.
    async fn backfill(&self, user_id: Uuid, entries: Vec<FeedEntry>) -> Result<usize>;

    /// Remove every entry authored by `author_id`. Returns entries removed.
    async fn remove_by_author(&self, user_id: Uuid, author_id: Uuid) -> Result<usize>;

    /// Owned newest-first copy of the user's feed.
    async fn get_page(&self, user_id: Uuid) -> Result<Vec<FeedEntry>>;

    async fn len(&self, user_id: Uuid) -> Result<usize>;
}
