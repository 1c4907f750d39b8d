use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{FeedStore, InsertOutcome};
use crate::error::Result;
use crate::metrics;
use crate::models::{FeedEntry, FeedKey, PostId};

/// One user's feed: entries ordered by [`FeedKey`] plus a post id index.
///
/// The map is ascending, so the oldest entry is `first` (the trim end) and the
/// newest is `last`. Insert, lookup and eviction are all O(log N).
#[derive(Debug, Default)]
struct UserFeed {
    entries: BTreeMap<FeedKey, FeedEntry>,
    index: HashMap<PostId, FeedKey>,
}

impl UserFeed {
    /// Returns false if the post id is already present.
    fn put(&mut self, entry: FeedEntry) -> bool {
        if self.index.contains_key(&entry.post_id) {
            return false;
        }
        let key = entry.key();
        self.index.insert(entry.post_id, key);
        self.entries.insert(key, entry);
        true
    }

    /// Would `entry` be evicted straight away by a full feed?
    fn rejects(&self, entry: &FeedEntry, capacity: usize) -> bool {
        self.entries.len() >= capacity
            && self
                .entries
                .first_key_value()
                .map(|(oldest, _)| entry.key() < *oldest)
                .unwrap_or(false)
    }

    fn trim(&mut self, capacity: usize) -> usize {
        let mut evicted = 0;
        while self.entries.len() > capacity {
            match self.entries.pop_first() {
                Some((_, entry)) => {
                    self.index.remove(&entry.post_id);
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }

    fn remove_author(&mut self, author_id: Uuid) -> usize {
        let before = self.entries.len();
        let index = &mut self.index;
        self.entries.retain(|_, entry| {
            let keep = entry.author_id != author_id;
            if !keep {
                index.remove(&entry.post_id);
            }
            keep
        });
        before - self.entries.len()
    }

    fn newest_first(&self) -> Vec<FeedEntry> {
        self.entries.values().rev().copied().collect()
    }

    /// Rebuild the id index if it drifted from the ordered entries.
    fn repair(&mut self) {
        if self.index.len() != self.entries.len() {
            warn!(
                index_len = self.index.len(),
                entries_len = self.entries.len(),
                "Feed index out of sync, rebuilding"
            );
            self.index = self
                .entries
                .iter()
                .map(|(key, entry)| (entry.post_id, *key))
                .collect();
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub users: usize,
    pub entries: usize,
    pub evictions: u64,
    pub purged: u64,
}

/// Bounded, time-ordered feed cache with one mutex per user.
///
/// All mutations of a user's feed (insert, backfill, remove-by-author) run
/// under that user's lock and are therefore linearized; different users never
/// contend.
pub struct FeedCache {
    capacity: usize,
    feeds: DashMap<Uuid, Arc<Mutex<UserFeed>>>,
    evictions: AtomicU64,
    purged: AtomicU64,
}

impl FeedCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            feeds: DashMap::new(),
            evictions: AtomicU64::new(0),
            purged: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, user_id: Uuid, post_id: PostId) -> bool {
        self.existing(user_id)
            .map(|feed| feed.lock().index.contains_key(&post_id))
            .unwrap_or(false)
    }

    pub fn stats(&self) -> CacheStats {
        let feeds: Vec<_> = self.feeds.iter().map(|f| f.value().clone()).collect();
        CacheStats {
            users: feeds.len(),
            entries: feeds.iter().map(|f| f.lock().entries.len()).sum(),
            evictions: self.evictions.load(Ordering::Relaxed),
            purged: self.purged.load(Ordering::Relaxed),
        }
    }

    fn feed(&self, user_id: Uuid) -> Arc<Mutex<UserFeed>> {
        self.feeds.entry(user_id).or_default().value().clone()
    }

    fn existing(&self, user_id: Uuid) -> Option<Arc<Mutex<UserFeed>>> {
        self.feeds.get(&user_id).map(|f| f.value().clone())
    }

    fn note_evictions(&self, user_id: Uuid, evicted: usize) {
        if evicted > 0 {
            debug!(%user_id, evicted, "Trimmed feed to capacity");
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            metrics::record_evictions(evicted as u64);
        }
    }

    /// Synchronous core of [`FeedStore::insert`].
    pub fn insert_entry(&self, user_id: Uuid, entry: FeedEntry) -> InsertOutcome {
        let feed = self.feed(user_id);
        let mut feed = feed.lock();
        feed.repair();

        if feed.index.contains_key(&entry.post_id) {
            return InsertOutcome::AlreadyPresent;
        }
        if feed.rejects(&entry, self.capacity) {
            return InsertOutcome::Trimmed;
        }

        feed.put(entry);
        let evicted = feed.trim(self.capacity);
        drop(feed);
        self.note_evictions(user_id, evicted);
        InsertOutcome::Inserted
    }

    /// Synchronous core of [`FeedStore::backfill`].
    pub fn backfill_entries(&self, user_id: Uuid, entries: Vec<FeedEntry>) -> usize {
        if entries.is_empty() {
            return 0;
        }

        let feed = self.feed(user_id);
        let mut feed = feed.lock();
        feed.repair();

        let added: Vec<PostId> = entries
            .into_iter()
            .filter_map(|entry| feed.put(entry).then_some(entry.post_id))
            .collect();
        let evicted = feed.trim(self.capacity);
        let kept = added
            .iter()
            .filter(|id| feed.index.contains_key(*id))
            .count();
        drop(feed);

        self.note_evictions(user_id, evicted);
        kept
    }

    /// Synchronous core of [`FeedStore::remove_by_author`].
    pub fn remove_author_entries(&self, user_id: Uuid, author_id: Uuid) -> usize {
        let Some(feed) = self.existing(user_id) else {
            return 0;
        };
        let removed = feed.lock().remove_author(author_id);
        if removed > 0 {
            debug!(%user_id, %author_id, removed, "Purged author from feed");
            self.purged.fetch_add(removed as u64, Ordering::Relaxed);
        }
        removed
    }

    /// Synchronous core of [`FeedStore::get_page`].
    pub fn snapshot(&self, user_id: Uuid) -> Vec<FeedEntry> {
        self.existing(user_id)
            .map(|feed| feed.lock().newest_first())
            .unwrap_or_default()
    }

    pub fn entry_count(&self, user_id: Uuid) -> usize {
        self.existing(user_id)
            .map(|feed| feed.lock().entries.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl FeedStore for FeedCache {
    async fn insert(&self, user_id: Uuid, entry: FeedEntry) -> Result<InsertOutcome> {
        Ok(self.insert_entry(user_id, entry))
    }

    async fn backfill(&self, user_id: Uuid, entries: Vec<FeedEntry>) -> Result<usize> {
        Ok(self.backfill_entries(user_id, entries))
    }

    async fn remove_by_author(&self, user_id: Uuid, author_id: Uuid) -> Result<usize> {
        Ok(self.remove_author_entries(user_id, author_id))
    }

    async fn get_page(&self, user_id: Uuid) -> Result<Vec<FeedEntry>> {
        Ok(self.snapshot(user_id))
    }

    async fn len(&self, user_id: Uuid) -> Result<usize> {
        Ok(self.entry_count(user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn entry(id: u64, author: Uuid, secs: i64) -> FeedEntry {
        FeedEntry {
            post_id: PostId(id),
            author_id: author,
            created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs),
        }
    }

    fn assert_strictly_ordered(entries: &[FeedEntry]) {
        for pair in entries.windows(2) {
            assert!(pair[0].key() > pair[1].key(), "{:?} not before {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_insert_orders_newest_first() {
        let cache = FeedCache::new(10);
        let user = Uuid::new_v4();
        let author = Uuid::new_v4();

        for (id, secs) in [(1, 5), (2, 1), (3, 9), (4, 5)] {
            assert_eq!(cache.insert_entry(user, entry(id, author, secs)), InsertOutcome::Inserted);
        }

        let ids: Vec<u64> = cache.snapshot(user).iter().map(|e| e.post_id.0).collect();
        // Same timestamp for 1 and 4: higher post id first.
        assert_eq!(ids, vec![3, 4, 1, 2]);
    }

    #[test]
    fn test_insert_is_idempotent() {
        let cache = FeedCache::new(10);
        let user = Uuid::new_v4();
        let e = entry(1, Uuid::new_v4(), 0);

        assert_eq!(cache.insert_entry(user, e), InsertOutcome::Inserted);
        let once = cache.snapshot(user);
        assert_eq!(cache.insert_entry(user, e), InsertOutcome::AlreadyPresent);
        assert_eq!(cache.snapshot(user), once);
        assert_eq!(cache.entry_count(user), 1);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let cache = FeedCache::new(3);
        let user = Uuid::new_v4();
        let author = Uuid::new_v4();

        for id in 1..=5 {
            cache.insert_entry(user, entry(id, author, id as i64));
        }

        let ids: Vec<u64> = cache.snapshot(user).iter().map(|e| e.post_id.0).collect();
        assert_eq!(ids, vec![5, 4, 3]);
        assert_eq!(cache.stats().evictions, 2);

        // Older than everything in a full feed.
        assert_eq!(cache.insert_entry(user, entry(99, author, -10)), InsertOutcome::Trimmed);
        assert_eq!(cache.entry_count(user), 3);
        assert!(!cache.contains(user, PostId(99)));
    }

    #[test]
    fn test_backfill_merges_and_trims_once() {
        let cache = FeedCache::new(4);
        let user = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        cache.insert_entry(user, entry(10, a, 10));
        cache.insert_entry(user, entry(11, a, 11));

        let batch = vec![entry(1, b, 1), entry(2, b, 2), entry(12, b, 12), entry(10, a, 10)];
        let kept = cache.backfill_entries(user, batch);

        let snapshot = cache.snapshot(user);
        let ids: Vec<u64> = snapshot.iter().map(|e| e.post_id.0).collect();
        assert_eq!(ids, vec![12, 11, 10, 2]);
        assert_eq!(kept, 2); // 12 and 2 survive; 1 trimmed; 10 already present
        assert_strictly_ordered(&snapshot);
    }

    #[test]
    fn test_remove_by_author() {
        let cache = FeedCache::new(10);
        let user = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        for id in 1..=6 {
            let author = if id % 2 == 0 { a } else { b };
            cache.insert_entry(user, entry(id, author, id as i64));
        }

        assert_eq!(cache.remove_author_entries(user, a), 3);
        assert!(cache.snapshot(user).iter().all(|e| e.author_id == b));
        assert_eq!(cache.remove_author_entries(user, a), 0);
        assert_eq!(cache.remove_author_entries(Uuid::new_v4(), a), 0);

        // Removed ids can come back through a later insert.
        assert_eq!(cache.insert_entry(user, entry(2, a, 2)), InsertOutcome::Inserted);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let cache = FeedCache::new(10);
        let user = Uuid::new_v4();
        let author = Uuid::new_v4();
        cache.insert_entry(user, entry(1, author, 1));

        let mut copy = cache.snapshot(user);
        copy.clear();
        assert_eq!(cache.entry_count(user), 1);
    }

    #[test]
    fn test_concurrent_inserts_respect_invariants() {
        let cache = Arc::new(FeedCache::new(50));
        let user = Uuid::new_v4();
        let author = Uuid::new_v4();

        std::thread::scope(|scope| {
            for t in 0..4u64 {
                let cache = cache.clone();
                scope.spawn(move || {
                    for i in 0..200u64 {
                        // Overlapping ids across threads exercise the duplicate path.
                        let id = (i * 2 + t % 2) % 300;
                        cache.insert_entry(user, entry(id, author, id as i64));
                    }
                });
            }
        });

        let snapshot = cache.snapshot(user);
        assert_eq!(snapshot.len(), 50);
        assert_strictly_ordered(&snapshot);
        let ids: Vec<u64> = snapshot.iter().map(|e| e.post_id.0).collect();
        let expected: Vec<u64> = (0..300u64).rev().filter(|id| *id < 300).take(50).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_feed_store_trait_delegates() {
        let cache = FeedCache::new(5);
        let store: &dyn FeedStore = &cache;
        let user = Uuid::new_v4();
        let author = Uuid::new_v4();

        assert_eq!(store.insert(user, entry(1, author, 1)).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.backfill(user, vec![entry(2, author, 2)]).await.unwrap(), 1);
        assert_eq!(store.len(user).await.unwrap(), 2);
        assert_eq!(store.remove_by_author(user, author).await.unwrap(), 2);
        assert!(store.get_page(user).await.unwrap().is_empty());
    }
}
