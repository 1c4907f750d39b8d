use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Store-assigned post identifier. Strictly increasing per content store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostId(pub u64);

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable post record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: PostId,
    pub author_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub payload: String,
}

impl Post {
    pub fn key(&self) -> FeedKey {
        FeedKey::new(self.created_at, self.id)
    }

    pub fn to_entry(&self) -> FeedEntry {
        FeedEntry {
            post_id: self.id,
            author_id: self.author_id,
            created_at: self.created_at,
        }
    }
}

/// Reference to a post inside a feed. Never carries the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedEntry {
    pub post_id: PostId,
    pub author_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl FeedEntry {
    pub fn key(&self) -> FeedKey {
        FeedKey::new(self.created_at, self.post_id)
    }
}

impl From<&Post> for FeedEntry {
    fn from(post: &Post) -> Self {
        post.to_entry()
    }
}

/// Sort key shared by caches, recency indexes, merges and cursors.
///
/// Ascending `Ord` is (created_at, post_id); feeds are read in reverse so the
/// newest entry comes first and post id breaks timestamp ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FeedKey {
    pub created_at: DateTime<Utc>,
    pub post_id: PostId,
}

impl FeedKey {
    pub fn new(created_at: DateTime<Utc>, post_id: PostId) -> Self {
        Self {
            created_at,
            post_id,
        }
    }
}

/// Directed follow relationship.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowEdge {
    pub follower_id: Uuid,
    pub followee_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// How a publish reaches followers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanoutMode {
    /// Written into every follower's cache at publish time.
    Push,
    /// Merged into follower feeds at read time.
    Pull,
}

impl FanoutMode {
    pub fn for_follower_count(follower_count: usize, threshold: usize) -> Self {
        if follower_count >= threshold {
            FanoutMode::Pull
        } else {
            FanoutMode::Push
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FanoutMode::Push => "push",
            FanoutMode::Pull => "pull",
        }
    }
}

/// Wall clock truncated to the precision cursors carry.
pub(crate) fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_feed_key_orders_by_time_then_id() {
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let t1 = Utc.timestamp_opt(1_700_000_001, 0).unwrap();

        assert!(FeedKey::new(t0, PostId(9)) < FeedKey::new(t1, PostId(1)));
        assert!(FeedKey::new(t0, PostId(1)) < FeedKey::new(t0, PostId(2)));
    }

    #[test]
    fn test_fanout_mode_threshold_is_inclusive() {
        assert_eq!(FanoutMode::for_follower_count(9_999, 10_000), FanoutMode::Push);
        assert_eq!(FanoutMode::for_follower_count(10_000, 10_000), FanoutMode::Pull);
        assert_eq!(FanoutMode::for_follower_count(0, 0), FanoutMode::Pull);
    }

    #[test]
    fn test_post_serializes_camel_case() {
        let post = Post {
            id: PostId(7),
            author_id: Uuid::nil(),
            created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            payload: "hello".to_string(),
        };

        let json = serde_json::to_value(&post).unwrap();
        assert_eq!(json["id"], 7);
        assert!(json.get("authorId").is_some());
        assert!(json.get("createdAt").is_some());
    }
}
