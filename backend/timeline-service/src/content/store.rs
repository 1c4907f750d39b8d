use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::{ContentRepository, UserDirectory};
use crate::error::{Result, TimelineError};
use crate::models::{now_micros, FeedKey, Post, PostId};

/// Hands out (id, timestamp) pairs so id order and time order agree.
#[derive(Debug)]
struct Sequencer {
    last_id: u64,
    last_created_at: DateTime<Utc>,
}

impl Sequencer {
    fn next(&mut self) -> (PostId, DateTime<Utc>) {
        self.last_id += 1;
        // Wall clock can step backwards; never hand out an older timestamp.
        self.last_created_at = now_micros().max(self.last_created_at);
        (PostId(self.last_id), self.last_created_at)
    }
}

type AuthorIndex = Arc<RwLock<BTreeMap<FeedKey, PostId>>>;

/// In-memory append-only post store.
///
/// Every post stays addressable by id. Each author additionally has a bounded
/// recency index ordered by [`FeedKey`], so "latest N" queries are a reverse
/// range scan instead of a walk over the author's full history.
pub struct ContentStore {
    directory: Arc<dyn UserDirectory>,
    sequencer: Mutex<Sequencer>,
    posts: DashMap<PostId, Post>,
    by_author: DashMap<Uuid, AuthorIndex>,
    index_capacity: usize,
}

impl ContentStore {
    pub fn new(directory: Arc<dyn UserDirectory>, index_capacity: usize) -> Self {
        Self {
            directory,
            sequencer: Mutex::new(Sequencer {
                last_id: 0,
                last_created_at: DateTime::<Utc>::MIN_UTC,
            }),
            posts: DashMap::new(),
            by_author: DashMap::new(),
            index_capacity: index_capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.posts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.posts.is_empty()
    }

    /// Number of posts currently reachable through an author's recency index.
    pub fn indexed_count(&self, author_id: Uuid) -> usize {
        self.by_author
            .get(&author_id)
            .map(|index| index.read().len())
            .unwrap_or(0)
    }

    fn author_index(&self, author_id: Uuid) -> AuthorIndex {
        self.by_author.entry(author_id).or_default().value().clone()
    }
}

#[async_trait]
impl ContentRepository for ContentStore {
    async fn create(&self, author_id: Uuid, payload: String) -> Result<Post> {
        if !self.directory.exists(author_id).await? {
            return Err(TimelineError::AuthorNotFound(author_id));
        }

        let index = self.author_index(author_id);
        // Holding the author's index across sequencing keeps that author's
        // index insertions in id order.
        let mut index = index.write();
        let (id, created_at) = self.sequencer.lock().next();

        let post = Post {
            id,
            author_id,
            created_at,
            payload,
        };
        self.posts.insert(id, post.clone());
        index.insert(post.key(), id);
        while index.len() > self.index_capacity {
            index.pop_first();
        }

        debug!(post_id = %id, author_id = %author_id, "Stored post");
        Ok(post)
    }

    async fn get(&self, post_id: PostId) -> Result<Option<Post>> {
        Ok(self.posts.get(&post_id).map(|p| p.value().clone()))
    }

    async fn get_recent_by_author_before(
        &self,
        author_id: Uuid,
        before: Option<FeedKey>,
        limit: usize,
    ) -> Result<Vec<Post>> {
        let Some(index) = self.by_author.get(&author_id).map(|i| i.value().clone()) else {
            return Ok(Vec::new());
        };

        let ids: Vec<PostId> = {
            let index = index.read();
            let ids = match before {
                Some(bound) => index.range(..bound).rev().take(limit).map(|(_, id)| *id).collect(),
                None => index.values().rev().take(limit).copied().collect(),
            };
            ids
        };

        ids.into_iter()
            .map(|id| {
                self.posts
                    .get(&id)
                    .map(|p| p.value().clone())
                    .ok_or_else(|| TimelineError::Internal(format!("indexed post {} missing", id)))
            })
            .collect()
    }
}
