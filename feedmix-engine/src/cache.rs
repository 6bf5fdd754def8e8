// ---------------------------------------------------------------------------
// TTL Cache
// ---------------------------------------------------------------------------
//
// Keyed result cache with a time-to-live and a bounded entry count. Evicts by
// the active policy (LRU, LFU or FIFO) whenever the size limit is exceeded,
// including when the limit shrinks after a community-bucket change.
// ---------------------------------------------------------------------------

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::community::{CacheConfig, EvictionPolicy};

// ---------------------------------------------------------------------------
// CacheEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
	pub value: T,
	pub inserted_at: Instant,
	last_access: Instant,
	hits: u64,
	/// Insertion order, for FIFO eviction.
	seq: u64,
}

impl<T> CacheEntry<T> {
	pub fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
		now.saturating_duration_since(self.inserted_at) >= ttl
	}
}

// ---------------------------------------------------------------------------
// TtlCache
// ---------------------------------------------------------------------------

pub struct TtlCache<T> {
	entries: HashMap<String, CacheEntry<T>>,
	max_size: usize,
	ttl: Duration,
	policy: EvictionPolicy,
	next_seq: u64,
	evictions: u64,
}

impl<T: Clone> TtlCache<T> {
	pub fn new(config: &CacheConfig) -> Self {
		Self {
			entries: HashMap::new(),
			max_size: config.max_size.max(1),
			ttl: config.ttl,
			policy: config.eviction,
			next_seq: 0,
			evictions: 0,
		}
	}

	/// Apply a new configuration, evicting down to the new size if needed.
	pub fn reconfigure(&mut self, config: &CacheConfig) {
		self.max_size = config.max_size.max(1);
		self.ttl = config.ttl;
		self.policy = config.eviction;
		self.evict_to(self.max_size, None);
	}

	/// Get a live value by key. Expired entries are dropped on access.
	pub fn get(&mut self, key: &str) -> Option<T> {
		let now = Instant::now();
		let ttl = self.ttl;
		let expired = self.entries.get(key)?.is_expired(ttl, now);
		if expired {
			self.entries.remove(key);
			return None;
		}
		let entry = self.entries.get_mut(key)?;
		entry.hits += 1;
		entry.last_access = now;
		Some(entry.value.clone())
	}

	/// Insert or replace a value; the TTL restarts.
	pub fn put(&mut self, key: impl Into<String>, value: T) {
		let key = key.into();
		let now = Instant::now();
		let seq = self.next_seq;
		self.next_seq += 1;
		self.entries.insert(
			key.clone(),
			CacheEntry {
				value,
				inserted_at: now,
				last_access: now,
				hits: 0,
				seq,
			},
		);
		if self.entries.len() > self.max_size {
			self.purge_expired();
			self.evict_to(self.max_size, Some(&key));
		}
	}

	pub fn remove(&mut self, key: &str) -> bool {
		self.entries.remove(key).is_some()
	}

	pub fn clear(&mut self) {
		self.entries.clear();
	}

	/// Drop every expired entry. Returns how many were removed.
	pub fn purge_expired(&mut self) -> usize {
		let now = Instant::now();
		let ttl = self.ttl;
		let before = self.entries.len();
		self.entries.retain(|_, e| !e.is_expired(ttl, now));
		before - self.entries.len()
	}

	/// Evict down to `target` entries, never choosing `protect` (a fresh
	/// insert would otherwise always lose under LFU).
	fn evict_to(&mut self, target: usize, protect: Option<&str>) {
		if self.entries.len() <= target {
			return;
		}
		let excess = self.entries.len() - target;
		let mut ranked: Vec<(String, (u64, Instant, u64))> = self
			.entries
			.iter()
			.filter(|(k, _)| Some(k.as_str()) != protect)
			.map(|(k, e)| {
				let key = match self.policy {
					EvictionPolicy::Lru => (0, e.last_access, e.seq),
					EvictionPolicy::Lfu => (e.hits, e.last_access, e.seq),
					EvictionPolicy::Fifo => (0, e.inserted_at, e.seq),
				};
				(k.clone(), key)
			})
			.collect();
		ranked.sort_by(|a, b| a.1.cmp(&b.1));
		for (key, _) in ranked.into_iter().take(excess) {
			self.entries.remove(&key);
			self.evictions += 1;
		}
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn max_size(&self) -> usize {
		self.max_size
	}

	pub fn ttl(&self) -> Duration {
		self.ttl
	}

	pub fn policy(&self) -> EvictionPolicy {
		self.policy
	}

	pub fn evictions(&self) -> u64 {
		self.evictions
	}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;

	fn config(max_size: usize, ttl_ms: u64, eviction: EvictionPolicy) -> CacheConfig {
		CacheConfig {
			max_size,
			ttl: Duration::from_millis(ttl_ms),
			eviction,
		}
	}

	#[tokio::test(start_paused = true)]
	async fn put_and_get() {
		let mut cache = TtlCache::new(&config(10, 1_000, EvictionPolicy::Lru));
		cache.put("a", 1);
		assert_eq!(cache.get("a"), Some(1));
		assert_eq!(cache.get("missing"), None);
		assert_eq!(cache.len(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn entries_expire_after_ttl() {
		let mut cache = TtlCache::new(&config(10, 1_000, EvictionPolicy::Lru));
		cache.put("a", "x".to_string());
		tokio::time::advance(Duration::from_millis(999)).await;
		assert!(cache.get("a").is_some());
		tokio::time::advance(Duration::from_millis(1)).await;
		assert!(cache.get("a").is_none());
		assert!(cache.is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn lru_evicts_least_recently_used() {
		let mut cache = TtlCache::new(&config(3, 60_000, EvictionPolicy::Lru));
		cache.put("a", 1);
		tokio::time::advance(Duration::from_millis(1)).await;
		cache.put("b", 2);
		tokio::time::advance(Duration::from_millis(1)).await;
		cache.put("c", 3);
		tokio::time::advance(Duration::from_millis(1)).await;
		cache.get("a");
		tokio::time::advance(Duration::from_millis(1)).await;
		cache.put("d", 4);
		assert_eq!(cache.len(), 3);
		assert_eq!(cache.get("b"), None);
		assert_eq!(cache.get("a"), Some(1));
	}

	#[tokio::test(start_paused = true)]
	async fn lfu_evicts_least_frequently_used() {
		let mut cache = TtlCache::new(&config(2, 60_000, EvictionPolicy::Lfu));
		cache.put("a", 1);
		cache.put("b", 2);
		cache.get("a");
		cache.get("a");
		cache.get("b");
		cache.put("c", 3);
		assert_eq!(cache.len(), 2);
		assert_eq!(cache.get("c"), Some(3));
		assert_eq!(cache.get("a"), Some(1));
		assert_eq!(cache.get("b"), None);
	}

	#[tokio::test(start_paused = true)]
	async fn fifo_evicts_oldest_insert() {
		let mut cache = TtlCache::new(&config(2, 60_000, EvictionPolicy::Fifo));
		cache.put("a", 1);
		cache.put("b", 2);
		cache.get("a");
		cache.put("c", 3);
		assert_eq!(cache.get("a"), None);
		assert_eq!(cache.get("b"), Some(2));
	}

	#[tokio::test(start_paused = true)]
	async fn reconfigure_shrinks_to_new_size() {
		let mut cache = TtlCache::new(&config(10, 60_000, EvictionPolicy::Fifo));
		for i in 0..10 {
			cache.put(format!("k{i}"), i);
		}
		cache.reconfigure(&config(4, 30_000, EvictionPolicy::Lru));
		assert_eq!(cache.len(), 4);
		assert_eq!(cache.max_size(), 4);
		assert_eq!(cache.ttl(), Duration::from_millis(30_000));
		assert_eq!(cache.evictions(), 6);
	}

	#[tokio::test(start_paused = true)]
	async fn purge_expired_removes_only_stale() {
		let mut cache = TtlCache::new(&config(10, 100, EvictionPolicy::Lru));
		cache.put("old", 1);
		tokio::time::advance(Duration::from_millis(60)).await;
		cache.put("new", 2);
		tokio::time::advance(Duration::from_millis(50)).await;
		assert_eq!(cache.purge_expired(), 1);
		assert_eq!(cache.get("new"), Some(2));
	}
}
