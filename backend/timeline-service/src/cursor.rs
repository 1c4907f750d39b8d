use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use std::fmt;

use crate::error::{Result, TimelineError};
use crate::models::{FeedEntry, FeedKey, PostId};

/// Opaque pagination position: the sort key of the last entry returned.
///
/// Encoded as base64 of `"{created_at_micros}:{post_id}"`. The next page starts
/// strictly after this position in newest-first order, so entries inserted
/// above it never shift later pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedCursor {
    pub created_at: DateTime<Utc>,
    pub post_id: PostId,
}

impl FeedCursor {
    pub fn from_key(key: FeedKey) -> Self {
        Self {
            created_at: key.created_at,
            post_id: key.post_id,
        }
    }

    pub fn after_entry(entry: &FeedEntry) -> Self {
        Self::from_key(entry.key())
    }

    pub fn key(&self) -> FeedKey {
        FeedKey::new(self.created_at, self.post_id)
    }

    pub fn encode(&self) -> String {
        let raw = format!("{}:{}", self.created_at.timestamp_micros(), self.post_id.0);
        general_purpose::STANDARD.encode(raw)
    }

    pub fn decode(cursor: &str) -> Result<Self> {
        let bytes = general_purpose::STANDARD
            .decode(cursor)
            .map_err(|e| TimelineError::InvalidCursor(format!("not base64: {}", e)))?;
        let raw = String::from_utf8(bytes)
            .map_err(|_| TimelineError::InvalidCursor("not utf-8".to_string()))?;

        let (micros, post_id) = raw
            .split_once(':')
            .ok_or_else(|| TimelineError::InvalidCursor("missing separator".to_string()))?;
        let micros: i64 = micros
            .parse()
            .map_err(|_| TimelineError::InvalidCursor(format!("bad timestamp: {}", micros)))?;
        let post_id: u64 = post_id
            .parse()
            .map_err(|_| TimelineError::InvalidCursor(format!("bad post id: {}", post_id)))?;
        let created_at = DateTime::from_timestamp_micros(micros)
            .ok_or_else(|| TimelineError::InvalidCursor("timestamp out of range".to_string()))?;

        Ok(Self {
            created_at,
            post_id: PostId(post_id),
        })
    }
}

impl fmt::Display for FeedCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}
