use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{RwLock, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, TimelineError};
use crate::models::{now_micros, FollowEdge};

/// Both sides of one user's adjacency. Guarded by that user's lock.
#[derive(Debug, Default)]
struct Adjacency {
    /// follower id -> edge creation time
    followers: HashMap<Uuid, DateTime<Utc>>,
    /// followee id -> edge creation time
    following: HashMap<Uuid, DateTime<Utc>>,
}

type Node = Arc<RwLock<Adjacency>>;

/// In-memory follow graph with one lock per user.
///
/// A follow edge touches two users, so edge mutations take both users' write
/// locks in ascending id order. Reads take a single read lock and return owned
/// copies, so callers never alias live adjacency state.
#[derive(Debug, Default)]
pub struct SocialGraph {
    nodes: DashMap<Uuid, Node>,
}

impl SocialGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a follow edge.
    ///
    /// Returns `Ok(None)` when the edge already exists.
    pub fn follow(&self, follower_id: Uuid, followee_id: Uuid) -> Result<Option<FollowEdge>> {
        if follower_id == followee_id {
            return Err(TimelineError::SelfFollow(follower_id));
        }

        let follower = self.node(follower_id);
        let followee = self.node(followee_id);
        let (mut follower_adj, mut followee_adj) =
            lock_pair(follower_id, &follower, followee_id, &followee);

        if follower_adj.following.contains_key(&followee_id) {
            debug!(%follower_id, %followee_id, "Follow edge already exists");
            return Ok(None);
        }

        let created_at = now_micros();
        follower_adj.following.insert(followee_id, created_at);
        followee_adj.followers.insert(follower_id, created_at);

        debug!(%follower_id, %followee_id, "Created follow edge");
        Ok(Some(FollowEdge {
            follower_id,
            followee_id,
            created_at,
        }))
    }

    /// Remove a follow edge. Returns the removed edge, or `None` if absent.
    pub fn unfollow(&self, follower_id: Uuid, followee_id: Uuid) -> Option<FollowEdge> {
        if follower_id == followee_id {
            return None;
        }

        let follower = self.existing(follower_id)?;
        let followee = self.existing(followee_id)?;
        let (mut follower_adj, mut followee_adj) =
            lock_pair(follower_id, &follower, followee_id, &followee);

        let created_at = follower_adj.following.remove(&followee_id)?;
        followee_adj.followers.remove(&follower_id);

        debug!(%follower_id, %followee_id, "Removed follow edge");
        Some(FollowEdge {
            follower_id,
            followee_id,
            created_at,
        })
    }

    /// Point-in-time copy of a user's followers.
    pub fn get_followers(&self, user_id: Uuid) -> Arc<[Uuid]> {
        match self.existing(user_id) {
            Some(node) => node.read().followers.keys().copied().collect(),
            None => Arc::from(Vec::new()),
        }
    }

    /// Users `user_id` follows.
    pub fn get_following(&self, user_id: Uuid) -> Vec<Uuid> {
        self.existing(user_id)
            .map(|node| node.read().following.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn get_follower_count(&self, user_id: Uuid) -> usize {
        self.existing(user_id)
            .map(|node| node.read().followers.len())
            .unwrap_or(0)
    }

    pub fn get_following_count(&self, user_id: Uuid) -> usize {
        self.existing(user_id)
            .map(|node| node.read().following.len())
            .unwrap_or(0)
    }

    pub fn is_following(&self, follower_id: Uuid, followee_id: Uuid) -> bool {
        self.existing(follower_id)
            .map(|node| node.read().following.contains_key(&followee_id))
            .unwrap_or(false)
    }

    pub fn edge(&self, follower_id: Uuid, followee_id: Uuid) -> Option<FollowEdge> {
        let node = self.existing(follower_id)?;
        let created_at = *node.read().following.get(&followee_id)?;
        Some(FollowEdge {
            follower_id,
            followee_id,
            created_at,
        })
    }

    fn node(&self, user_id: Uuid) -> Node {
        // Clone the Arc out so the shard guard is released before locking.
        self.nodes.entry(user_id).or_default().value().clone()
    }

    fn existing(&self, user_id: Uuid) -> Option<Node> {
        self.nodes.get(&user_id).map(|n| n.value().clone())
    }
}

/// Write-lock two distinct users in id order, returning guards in argument order.
fn lock_pair<'a>(
    a_id: Uuid,
    a: &'a Node,
    b_id: Uuid,
    b: &'a Node,
) -> (
    RwLockWriteGuard<'a, Adjacency>,
    RwLockWriteGuard<'a, Adjacency>,
) {
    if a_id < b_id {
        let a_guard = a.write();
        let b_guard = b.write();
        (a_guard, b_guard)
    } else {
        let b_guard = b.write();
        let a_guard = a.write();
        (a_guard, b_guard)
    }
}
