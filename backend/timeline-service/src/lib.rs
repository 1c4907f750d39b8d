//! Personalized timeline generation
//!
//! Hybrid fan-out: posts from authors below the follower threshold are pushed
//! into bounded per-user caches at publish time; posts from larger authors are
//! merged in at read time. Feeds page newest-first with opaque cursors.
pub mod cache;
pub mod config;
pub mod content;
pub mod cursor;
pub mod error;
pub mod fanout;
pub mod graph;
pub mod keyed_lock;
pub mod metrics;
pub mod models;
pub mod reader;
pub mod service;

pub use cache::{FeedCache, FeedStore, InsertOutcome};
pub use config::{Config, TimelineConfig};
pub use content::{ContentRepository, ContentStore, InMemoryUserDirectory, UserDirectory};
pub use cursor::FeedCursor;
pub use error::{Result, TimelineError};
pub use fanout::{FanoutEngine, FanoutPolicy, FanoutReport, FanoutStats};
pub use graph::SocialGraph;
pub use models::{FanoutMode, FeedEntry, FeedKey, FollowEdge, Post, PostId};
pub use reader::{FeedPage, FeedReader};
pub use service::{FeedResponse, FollowOutcome, TimelineService, UnfollowOutcome};
