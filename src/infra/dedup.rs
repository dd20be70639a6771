//! Time-bounded window of recently dispatched alert keys
//!
//! Collapses alerts re-emitted by detector replay into a single delivery.
//! Entries expire after the window and the oldest entry is evicted when
//! the window is full.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Dedup window statistics
#[derive(Default)]
pub struct DedupStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl DedupStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }
}

/// Sliding window of keys seen within `window`
pub struct DedupWindow<K> {
    window: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<K, Instant>>,
    stats: DedupStats,
}

impl<K> DedupWindow<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new(window: Duration, max_entries: usize) -> Self {
        Self {
            window,
            max_entries: max_entries.max(1),
            entries: Mutex::new(HashMap::new()),
            stats: DedupStats::default(),
        }
    }

    /// Whether `key` was marked within the window
    pub async fn contains(&self, key: &K) -> bool {
        let mut entries = self.entries.lock().await;

        if let Some(marked_at) = entries.get(key) {
            if marked_at.elapsed() > self.window {
                entries.remove(key);
                self.stats.expirations.fetch_add(1, Ordering::Relaxed);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        false
    }

    /// Record `key` as dispatched now
    pub async fn mark(&self, key: K) {
        let mut entries = self.entries.lock().await;

        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            self.purge_expired(&mut entries);
            if entries.len() >= self.max_entries {
                self.evict_oldest(&mut entries);
            }
        }

        entries.insert(key, Instant::now());
    }

    /// Drop expired entries
    pub async fn cleanup_expired(&self) {
        let mut entries = self.entries.lock().await;
        self.purge_expired(&mut entries);
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn stats(&self) -> &DedupStats {
        &self.stats
    }

    fn purge_expired(&self, entries: &mut HashMap<K, Instant>) {
        let window = self.window;
        let before = entries.len();
        entries.retain(|_, marked_at| marked_at.elapsed() <= window);
        let expired = (before - entries.len()) as u64;
        if expired > 0 {
            self.stats.expirations.fetch_add(expired, Ordering::Relaxed);
        }
    }

    fn evict_oldest(&self, entries: &mut HashMap<K, Instant>) {
        if let Some(oldest_key) = entries
            .iter()
            .min_by_key(|(_, marked_at)| **marked_at)
            .map(|(k, _)| k.clone())
        {
            entries.remove(&oldest_key);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_contains_within_window() {
        let window = DedupWindow::new(Duration::from_secs(60), 100);

        assert!(!window.contains(&"k1".to_string()).await);
        window.mark("k1".to_string()).await;
        assert!(window.contains(&"k1".to_string()).await);

        assert_eq!(window.stats().hits(), 1);
        assert_eq!(window.stats().misses(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let window = DedupWindow::new(Duration::from_secs(60), 100);
        window.mark("k1".to_string()).await;

        tokio::time::advance(Duration::from_secs(61)).await;

        assert!(!window.contains(&"k1".to_string()).await);
        assert_eq!(window.stats().expirations(), 1);
        assert!(window.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicts_oldest_when_full() {
        let window = DedupWindow::new(Duration::from_secs(600), 2);

        window.mark("a".to_string()).await;
        tokio::time::advance(Duration::from_millis(10)).await;
        window.mark("b".to_string()).await;
        tokio::time::advance(Duration::from_millis(10)).await;
        window.mark("c".to_string()).await;

        assert_eq!(window.len().await, 2);
        assert!(!window.contains(&"a".to_string()).await);
        assert!(window.contains(&"b".to_string()).await);
        assert!(window.contains(&"c".to_string()).await);
        assert_eq!(window.stats().evictions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_window_prefers_expired_over_eviction() {
        let window = DedupWindow::new(Duration::from_secs(5), 2);

        window.mark("a".to_string()).await;
        window.mark("b".to_string()).await;
        tokio::time::advance(Duration::from_secs(6)).await;
        window.mark("c".to_string()).await;

        assert_eq!(window.len().await, 1);
        assert_eq!(window.stats().evictions(), 0);
        assert_eq!(window.stats().expirations(), 2);
    }
}
