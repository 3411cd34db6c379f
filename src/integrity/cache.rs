use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn advance(&self, by: Duration) {
        let step = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
        match self.now.lock() {
            Ok(mut now) => *now = *now + step,
            Err(poisoned) => {
                let mut now = poisoned.into_inner();
                *now = *now + step;
            }
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

struct CacheEntry<V> {
    value: V,
    inserted_at: DateTime<Utc>,
}

/// Map whose entries expire a fixed time after insertion.
pub struct TtlCache<K, V> {
    entries: RwLock<HashMap<K, CacheEntry<V>>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            clock,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn is_fresh(&self, entry: &CacheEntry<V>, now: DateTime<Utc>) -> bool {
        // A clock stepping backwards leaves the entry fresh.
        match (now - entry.inserted_at).to_std() {
            Ok(age) => age < self.ttl,
            Err(_) => true,
        }
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|entry| self.is_fresh(entry, now))
            .map(|entry| entry.value.clone())
    }

    pub async fn insert(&self, key: K, value: V) {
        let inserted_at = self.clock.now();
        self.entries
            .write()
            .await
            .insert(key, CacheEntry { value, inserted_at });
    }

    pub async fn invalidate(&self, key: &K) -> Option<V> {
        self.entries.write().await.remove(key).map(|entry| entry.value)
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Drops expired entries, returning how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| self.is_fresh(entry, now));
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> (Arc<ManualClock>, TtlCache<&'static str, u32>) {
        let clock = Arc::new(ManualClock::default());
        let cache = TtlCache::new(Duration::from_secs(300), clock.clone());
        (clock, cache)
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let (clock, cache) = cache();
        cache.insert("comprehensive", 1).await;
        clock.advance(Duration::from_secs(299));
        assert_eq!(cache.get(&"comprehensive").await, Some(1));
        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.get(&"comprehensive").await, None);
    }

    #[tokio::test]
    async fn test_invalidate_and_purge() {
        let (clock, cache) = cache();
        cache.insert("a", 1).await;
        cache.insert("b", 2).await;
        assert_eq!(cache.invalidate(&"a").await, Some(1));
        assert_eq!(cache.get(&"a").await, None);

        clock.advance(Duration::from_secs(600));
        cache.insert("c", 3).await;
        assert_eq!(cache.purge_expired().await, 1);
        assert_eq!(cache.len().await, 1);

        cache.clear().await;
        assert!(cache.is_empty().await);
    }
}
