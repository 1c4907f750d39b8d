//! Post storage and author validation seams
pub mod directory;
pub mod store;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{FeedKey, Post, PostId};

pub use directory::{InMemoryUserDirectory, UserDirectory};
pub use store::ContentStore;

/// Append-only post repository consumed by fan-out, backfill and pull reads.
#[async_trait]
pub trait ContentRepository: Send + Sync {
    /// Persist a new post, assigning its id and timestamp.
    async fn create(&self, author_id: Uuid, payload: String) -> Result<Post>;

    async fn get(&self, post_id: PostId) -> Result<Option<Post>>;

    /// Newest-first posts by `author_id` strictly older than `before`.
    async fn get_recent_by_author_before(
        &self,
        author_id: Uuid,
        before: Option<FeedKey>,
        limit: usize,
    ) -> Result<Vec<Post>>;

    /// Newest-first posts by `author_id`.
    async fn get_recent_by_author(&self, author_id: Uuid, limit: usize) -> Result<Vec<Post>> {
        self.get_recent_by_author_before(author_id, None, limit)
            .await
    }
}
