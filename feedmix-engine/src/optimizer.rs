// ---------------------------------------------------------------------------
// Performance Optimizer
// ---------------------------------------------------------------------------
//
// Community-size-aware wrapper around arbitrary async scoring calls:
//
// 1. Cache — keyed TTL cache; a hit short-circuits the call.
// 2. Batching — misses are queued and flushed when the queue reaches the
//    bucket's batch size or its timeout elapses. A flush fans out with
//    bounded concurrency and every item settles independently.
// 3. Metrics — a trailing window of per-request samples feeds periodic
//    snapshots and the health check.
//
// All shared state sits behind one mutex that is never held across an await;
// every post-await update (metrics, cache insert) is one critical section.
// ---------------------------------------------------------------------------

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::cache::TtlCache;
use crate::community::{BatchConfig, CacheConfig, CommunityBucket};
use crate::error::FeedError;
use crate::lock;
use crate::tasks::TaskGroup;
use crate::types::now_ms;

const QUEUED_REQUEST_BYTES: f64 = 512.0;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const MIN_SAMPLES_FOR_HIT_RATE: usize = 20;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PerformanceTargets {
	pub max_avg_latency_ms: f64,
	pub min_throughput_rps: f64,
	pub max_error_rate: f64,
	pub min_cache_hit_rate: f64,
	pub max_memory_mb: f64,
}

impl Default for PerformanceTargets {
	fn default() -> Self {
		Self {
			max_avg_latency_ms: 100.0,
			min_throughput_rps: 0.0,
			max_error_rate: 0.05,
			min_cache_hit_rate: 0.2,
			max_memory_mb: 512.0,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OptimizerOptions {
	/// Global switch; when off every miss runs inline regardless of bucket.
	pub batching_enabled: bool,
	pub metrics_window: usize,
	pub metrics_window_ms: u64,
	pub metrics_interval_ms: u64,
	pub metrics_history: usize,
	/// Rough per-entry footprint used for the memory proxy.
	pub entry_bytes_estimate: usize,
	pub targets: PerformanceTargets,
}

impl Default for OptimizerOptions {
	fn default() -> Self {
		Self {
			batching_enabled: true,
			metrics_window: 1_000,
			metrics_window_ms: 60_000,
			metrics_interval_ms: 10_000,
			metrics_history: 60,
			entry_bytes_estimate: 2_048,
			targets: PerformanceTargets::default(),
		}
	}
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
	pub timestamp: u64,
	pub community_bucket: CommunityBucket,
	pub sample_count: usize,
	pub avg_latency_ms: f64,
	pub p95_latency_ms: f64,
	pub throughput_rps: f64,
	pub error_rate: f64,
	pub cache_hit_rate: f64,
	pub memory_mb: f64,
	pub cache_size: usize,
	pub queue_depth: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
	Healthy,
	Degraded,
	Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
	pub status: HealthStatus,
	pub healthy: bool,
	pub issues: Vec<String>,
	pub recommendations: Vec<String>,
	pub metrics: PerformanceMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizerStats {
	pub community_bucket: CommunityBucket,
	pub cache: CacheConfig,
	pub batch: BatchConfig,
	pub cache_size: usize,
	pub queue_depth: usize,
	pub total_requests: u64,
	pub total_errors: u64,
	pub cache_hits: u64,
	pub cache_misses: u64,
	pub batches_flushed: u64,
	pub evictions: u64,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct QueuedRequest<T> {
	id: String,
	cache_key: Option<String>,
	operation: BoxFuture<'static, Result<T, FeedError>>,
	enqueued_at: Instant,
	reply: oneshot::Sender<Result<T, FeedError>>,
}

struct RequestSample {
	at: Instant,
	latency_ms: f64,
	success: bool,
	cache_hit: bool,
}

struct OptimizerState<T> {
	bucket: CommunityBucket,
	cache: TtlCache<T>,
	batch: BatchConfig,
	queue: Vec<QueuedRequest<T>>,
	/// Bumped whenever the queue is taken, so stale timers become no-ops.
	generation: u64,
	timer: Option<JoinHandle<()>>,
	in_flight: Vec<JoinHandle<()>>,
	samples: VecDeque<RequestSample>,
	history: VecDeque<PerformanceMetrics>,
	total_requests: u64,
	total_errors: u64,
	cache_hits: u64,
	cache_misses: u64,
	batches_flushed: u64,
	shut_down: bool,
}

impl<T> OptimizerState<T> {
	fn record(&mut self, sample: RequestSample, options: &OptimizerOptions) {
		self.total_requests += 1;
		if !sample.success {
			self.total_errors += 1;
		}
		if sample.cache_hit {
			self.cache_hits += 1;
		} else {
			self.cache_misses += 1;
		}
		self.samples.push_back(sample);
		while self.samples.len() > options.metrics_window.max(1) {
			self.samples.pop_front();
		}
	}

	/// Take the pending queue, invalidating any armed timer.
	fn take_queue(&mut self) -> Vec<QueuedRequest<T>> {
		self.generation += 1;
		if let Some(timer) = self.timer.take() {
			timer.abort();
		}
		std::mem::take(&mut self.queue)
	}
}

struct Inner<T> {
	state: Mutex<OptimizerState<T>>,
	options: OptimizerOptions,
	tasks: TaskGroup,
}

// ---------------------------------------------------------------------------
// PerformanceOptimizer
// ---------------------------------------------------------------------------

pub struct PerformanceOptimizer<T> {
	inner: Arc<Inner<T>>,
}

impl<T> Clone for PerformanceOptimizer<T> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl<T: Clone + Send + 'static> PerformanceOptimizer<T> {
	pub fn new(options: OptimizerOptions, bucket: CommunityBucket) -> Self {
		let state = OptimizerState {
			bucket,
			cache: TtlCache::new(&bucket.cache_config()),
			batch: bucket.batch_config(),
			queue: Vec::new(),
			generation: 0,
			timer: None,
			in_flight: Vec::new(),
			samples: VecDeque::new(),
			history: VecDeque::new(),
			total_requests: 0,
			total_errors: 0,
			cache_hits: 0,
			cache_misses: 0,
			batches_flushed: 0,
			shut_down: false,
		};
		Self {
			inner: Arc::new(Inner {
				state: Mutex::new(state),
				options,
				tasks: TaskGroup::new("optimizer"),
			}),
		}
	}

	/// Start the periodic metrics collector.
	pub fn start(&self) {
		let weak = Arc::downgrade(&self.inner);
		let period = Duration::from_millis(self.inner.options.metrics_interval_ms);
		self.inner.tasks.spawn_periodic("metrics", period, move || {
			let weak = weak.clone();
			async move {
				if let Some(inner) = weak.upgrade() {
					let optimizer = PerformanceOptimizer { inner };
					optimizer.collect_metrics();
				}
			}
		});
	}

	/// Run `operation` through the cache and, on a miss, the batch queue.
	///
	/// Errors from the operation reach only this caller; queued siblings are
	/// unaffected. Dropping the returned future does not cancel queued work.
	pub async fn process_request<F>(
		&self,
		id: impl Into<String>,
		operation: F,
		cache_key: Option<String>,
	) -> Result<T, FeedError>
	where
		F: Future<Output = Result<T, FeedError>> + Send + 'static,
	{
		let id = id.into();
		let started = Instant::now();
		let operation = operation.boxed();

		let route = {
			let mut st = lock(&self.inner.state);
			if st.shut_down {
				return Err(FeedError::ShutDown);
			}

			if let Some(key) = cache_key.as_deref() {
				if let Some(value) = st.cache.get(key) {
					st.record(
						RequestSample {
							at: started,
							latency_ms: elapsed_ms(started),
							success: true,
							cache_hit: true,
						},
						&self.inner.options,
					);
					return Ok(value);
				}
			}

			if self.inner.options.batching_enabled && st.batch.enabled {
				let (tx, rx) = oneshot::channel();
				st.queue.push(QueuedRequest {
					id,
					cache_key,
					operation,
					enqueued_at: started,
					reply: tx,
				});
				if st.queue.len() >= st.batch.batch_size.max(1) {
					let batch = st.take_queue();
					let concurrency = st.batch.max_concurrency;
					spawn_flush(&self.inner, &mut st, batch, concurrency);
				} else if st.queue.len() == 1 {
					arm_timer(&self.inner, &mut st);
				}
				Route::Queued(rx)
			} else {
				Route::Inline(operation, cache_key)
			}
		};

		match route {
			Route::Queued(rx) => rx.await.unwrap_or(Err(FeedError::BatchCancelled)),
			Route::Inline(operation, cache_key) => {
				let result = operation.await;
				settle(&self.inner, cache_key, &result, started);
				result
			}
		}
	}

	/// Flush whatever is queued right now and wait for it to settle.
	pub async fn flush(&self) {
		let (batch, concurrency) = {
			let mut st = lock(&self.inner.state);
			let batch = st.take_queue();
			(batch, st.batch.max_concurrency)
		};
		if !batch.is_empty() {
			run_batch(Arc::clone(&self.inner), batch, concurrency).await;
		}
	}

	/// Switch cache/batch parameters to `bucket`. Returns whether anything
	/// changed. The cache is evicted down to the new size immediately.
	pub fn update_community_bucket(&self, bucket: CommunityBucket) -> bool {
		let mut st = lock(&self.inner.state);
		if st.bucket == bucket {
			return false;
		}
		let previous = st.bucket;
		let cache_config = bucket.cache_config();
		st.bucket = bucket;
		st.cache.reconfigure(&cache_config);
		st.batch = bucket.batch_config();
		if st.queue.len() >= st.batch.batch_size.max(1) {
			let batch = st.take_queue();
			let concurrency = st.batch.max_concurrency;
			spawn_flush(&self.inner, &mut st, batch, concurrency);
		}
		tracing::info!(
			from = ?previous,
			to = ?bucket,
			cache_max = cache_config.max_size,
			ttl_ms = cache_config.ttl.as_millis() as u64,
			batch_size = st.batch.batch_size,
			"Community bucket changed; optimizer reconfigured"
		);
		true
	}

	pub fn community_bucket(&self) -> CommunityBucket {
		lock(&self.inner.state).bucket
	}

	pub fn invalidate(&self, cache_key: &str) -> bool {
		lock(&self.inner.state).cache.remove(cache_key)
	}

	pub fn clear_cache(&self) {
		lock(&self.inner.state).cache.clear();
	}

	/// Aggregate the trailing window into a metrics record and keep it in the
	/// bounded history.
	pub fn collect_metrics(&self) -> PerformanceMetrics {
		let mut st = lock(&self.inner.state);
		st.cache.purge_expired();
		let metrics = compute_metrics(&st, &self.inner.options);
		st.history.push_back(metrics.clone());
		while st.history.len() > self.inner.options.metrics_history.max(1) {
			st.history.pop_front();
		}
		tracing::debug!(
			avg_latency_ms = metrics.avg_latency_ms,
			throughput_rps = metrics.throughput_rps,
			error_rate = metrics.error_rate,
			cache_hit_rate = metrics.cache_hit_rate,
			"Optimizer metrics collected"
		);
		metrics
	}

	pub fn metrics_history(&self) -> Vec<PerformanceMetrics> {
		lock(&self.inner.state).history.iter().cloned().collect()
	}

	pub fn health_check(&self) -> HealthReport {
		let metrics = {
			let st = lock(&self.inner.state);
			compute_metrics(&st, &self.inner.options)
		};
		evaluate_health(metrics, &self.inner.options.targets)
	}

	pub fn stats(&self) -> OptimizerStats {
		let st = lock(&self.inner.state);
		OptimizerStats {
			community_bucket: st.bucket,
			cache: CacheConfig {
				max_size: st.cache.max_size(),
				ttl: st.cache.ttl(),
				eviction: st.cache.policy(),
			},
			batch: st.batch.clone(),
			cache_size: st.cache.len(),
			queue_depth: st.queue.len(),
			total_requests: st.total_requests,
			total_errors: st.total_errors,
			cache_hits: st.cache_hits,
			cache_misses: st.cache_misses,
			batches_flushed: st.batches_flushed,
			evictions: st.cache.evictions(),
		}
	}

	/// Stop background loops, drain the pending batch and any in-flight
	/// flushes, then release cached state. Later requests fail with
	/// `ShutDown`.
	pub async fn shutdown(&self) {
		self.inner.tasks.shutdown().await;
		let (batch, concurrency, in_flight) = {
			let mut st = lock(&self.inner.state);
			st.shut_down = true;
			let batch = st.take_queue();
			let in_flight: Vec<JoinHandle<()>> = st.in_flight.drain(..).collect();
			(batch, st.batch.max_concurrency, in_flight)
		};
		let pending = batch.len();
		if pending > 0 {
			run_batch(Arc::clone(&self.inner), batch, concurrency).await;
		}
		for handle in in_flight {
			if let Err(e) = handle.await {
				tracing::error!(error = ?e, "Batch flush task failed during shutdown");
			}
		}
		let mut st = lock(&self.inner.state);
		st.cache.clear();
		st.samples.clear();
		tracing::info!(drained = pending, "Performance optimizer shut down");
	}
}

// ---------------------------------------------------------------------------
// Batch execution
// ---------------------------------------------------------------------------

enum Route<T> {
	Queued(oneshot::Receiver<Result<T, FeedError>>),
	Inline(BoxFuture<'static, Result<T, FeedError>>, Option<String>),
}

fn spawn_flush<T: Clone + Send + 'static>(
	inner: &Arc<Inner<T>>,
	st: &mut OptimizerState<T>,
	batch: Vec<QueuedRequest<T>>,
	concurrency: usize,
) {
	if batch.is_empty() {
		return;
	}
	st.in_flight.retain(|h| !h.is_finished());
	st.in_flight
		.push(tokio::spawn(run_batch(Arc::clone(inner), batch, concurrency)));
}

/// Flush the queue after the bucket's timeout unless it was taken first.
fn arm_timer<T: Clone + Send + 'static>(inner: &Arc<Inner<T>>, st: &mut OptimizerState<T>) {
	let generation = st.generation;
	let timeout = st.batch.timeout;
	let weak = Arc::downgrade(inner);
	st.timer = Some(tokio::spawn(async move {
		tokio::time::sleep(timeout).await;
		let Some(inner) = weak.upgrade() else {
			return;
		};
		let mut st = lock(&inner.state);
		if st.generation != generation || st.queue.is_empty() {
			return;
		}
		st.generation += 1;
		// This task's own handle; dropping it just detaches.
		st.timer = None;
		let batch = std::mem::take(&mut st.queue);
		let concurrency = st.batch.max_concurrency;
		spawn_flush(&inner, &mut st, batch, concurrency);
	}));
}

/// Execute a batch with bounded concurrency. Each item settles on its own
/// channel; one failure never touches its siblings.
async fn run_batch<T: Clone + Send + 'static>(
	inner: Arc<Inner<T>>,
	batch: Vec<QueuedRequest<T>>,
	concurrency: usize,
) {
	let size = batch.len();
	futures::stream::iter(batch)
		.for_each_concurrent(concurrency.max(1), |request| {
			let inner = Arc::clone(&inner);
			async move {
				let QueuedRequest {
					id,
					cache_key,
					operation,
					enqueued_at,
					reply,
				} = request;
				let result = operation.await;
				settle(&inner, cache_key, &result, enqueued_at);
				if let Err(e) = &result {
					tracing::debug!(request_id = %id, error = %e, "Batched operation failed");
				}
				if reply.send(result).is_err() {
					tracing::trace!(request_id = %id, "Caller went away before its batch settled");
				}
			}
		})
		.await;
	lock(&inner.state).batches_flushed += 1;
	tracing::trace!(size, "Batch settled");
}

/// Post-await bookkeeping for one request, in a single critical section.
fn settle<T: Clone>(
	inner: &Inner<T>,
	cache_key: Option<String>,
	result: &Result<T, FeedError>,
	started: Instant,
) {
	let mut st = lock(&inner.state);
	if let (Ok(value), Some(key)) = (result, cache_key) {
		st.cache.put(key, value.clone());
	}
	st.record(
		RequestSample {
			at: started,
			latency_ms: elapsed_ms(started),
			success: result.is_ok(),
			cache_hit: false,
		},
		&inner.options,
	);
}

// ---------------------------------------------------------------------------
// Metrics & health
// ---------------------------------------------------------------------------

fn elapsed_ms(started: Instant) -> f64 {
	started.elapsed().as_secs_f64() * 1000.0
}

fn compute_metrics<T: Clone>(st: &OptimizerState<T>, options: &OptimizerOptions) -> PerformanceMetrics {
	let now = Instant::now();
	let window = Duration::from_millis(options.metrics_window_ms);
	let recent: Vec<&RequestSample> = st
		.samples
		.iter()
		.filter(|s| now.saturating_duration_since(s.at) <= window)
		.collect();
	let n = recent.len();

	let mut latencies: Vec<f64> = recent.iter().map(|s| s.latency_ms).collect();
	latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
	let (avg, p95) = if n == 0 {
		(0.0, 0.0)
	} else {
		let idx = ((n as f64 * 0.95).ceil() as usize).saturating_sub(1).min(n - 1);
		(latencies.iter().sum::<f64>() / n as f64, latencies[idx])
	};

	let span_secs = recent
		.first()
		.map(|s| now.saturating_duration_since(s.at).as_secs_f64())
		.unwrap_or(0.0)
		.max(1.0);
	let ratio = |count: usize| if n == 0 { 0.0 } else { count as f64 / n as f64 };
	let errors = recent.iter().filter(|s| !s.success).count();
	let hits = recent.iter().filter(|s| s.cache_hit).count();

	let memory_bytes = st.cache.len() as f64 * options.entry_bytes_estimate as f64
		+ st.queue.len() as f64 * QUEUED_REQUEST_BYTES;

	PerformanceMetrics {
		timestamp: now_ms(),
		community_bucket: st.bucket,
		sample_count: n,
		avg_latency_ms: avg,
		p95_latency_ms: p95,
		throughput_rps: n as f64 / span_secs,
		error_rate: ratio(errors),
		cache_hit_rate: ratio(hits),
		memory_mb: memory_bytes / BYTES_PER_MB,
		cache_size: st.cache.len(),
		queue_depth: st.queue.len(),
	}
}

/// Compare a metrics record against targets, naming each problem and a
/// remediation hint.
pub fn evaluate_health(metrics: PerformanceMetrics, targets: &PerformanceTargets) -> HealthReport {
	let mut issues = Vec::new();
	let mut recommendations = Vec::new();
	let mut critical = false;

	if metrics.avg_latency_ms > targets.max_avg_latency_ms {
		issues.push(format!(
			"Average latency {:.1}ms exceeds target {:.1}ms",
			metrics.avg_latency_ms, targets.max_avg_latency_ms
		));
		recommendations.push("Increase cache TTL or batch size to absorb scoring latency".to_string());
	}
	if metrics.sample_count > 0 && metrics.error_rate > targets.max_error_rate {
		issues.push(format!(
			"Error rate {:.1}% exceeds target {:.1}%",
			metrics.error_rate * 100.0,
			targets.max_error_rate * 100.0
		));
		recommendations.push("Inspect failing scoring operations; errors are isolated per request".to_string());
		critical |= metrics.error_rate > targets.max_error_rate * 2.0;
	}
	if metrics.sample_count >= MIN_SAMPLES_FOR_HIT_RATE && metrics.cache_hit_rate < targets.min_cache_hit_rate {
		issues.push(format!(
			"Cache hit rate {:.1}% below target {:.1}%",
			metrics.cache_hit_rate * 100.0,
			targets.min_cache_hit_rate * 100.0
		));
		recommendations.push("Raise cache size or TTL, or use stabler cache keys".to_string());
	}
	if metrics.memory_mb > targets.max_memory_mb {
		issues.push(format!(
			"Estimated memory {:.1}MB exceeds ceiling {:.1}MB",
			metrics.memory_mb, targets.max_memory_mb
		));
		recommendations.push("Lower the cache max size for this community bucket".to_string());
		critical = true;
	}
	if metrics.sample_count > 0 && metrics.throughput_rps < targets.min_throughput_rps {
		issues.push(format!(
			"Throughput {:.2} rps below target {:.2} rps",
			metrics.throughput_rps, targets.min_throughput_rps
		));
		recommendations.push("Increase batch concurrency".to_string());
	}

	let status = if issues.is_empty() {
		HealthStatus::Healthy
	} else if critical {
		HealthStatus::Unhealthy
	} else {
		HealthStatus::Degraded
	};

	HealthReport {
		status,
		healthy: status == HealthStatus::Healthy,
		issues,
		recommendations,
		metrics,
	}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};

	fn optimizer(bucket: CommunityBucket) -> PerformanceOptimizer<u32> {
		PerformanceOptimizer::new(OptimizerOptions::default(), bucket)
	}

	fn unbatched() -> PerformanceOptimizer<u32> {
		PerformanceOptimizer::new(
			OptimizerOptions {
				batching_enabled: false,
				..Default::default()
			},
			CommunityBucket::Small,
		)
	}

	// -- cache ----------------------------------------------------------------

	#[tokio::test]
	async fn cache_hit_short_circuits_operation() {
		let opt = unbatched();
		let calls = Arc::new(AtomicUsize::new(0));
		for _ in 0..3 {
			let c = Arc::clone(&calls);
			let value = opt
				.process_request(
					"r",
					async move {
						c.fetch_add(1, Ordering::SeqCst);
						Ok(7)
					},
					Some("key".into()),
				)
				.await
				.unwrap();
			assert_eq!(value, 7);
		}
		assert_eq!(calls.load(Ordering::SeqCst), 1);
		let stats = opt.stats();
		assert_eq!(stats.cache_hits, 2);
		assert_eq!(stats.cache_misses, 1);
		assert_eq!(stats.cache_size, 1);
	}

	#[tokio::test]
	async fn failures_are_not_cached() {
		let opt = unbatched();
		let err = opt
			.process_request("r", async { Err(FeedError::Operation("boom".into())) }, Some("k".into()))
			.await;
		assert!(err.is_err());
		let ok = opt.process_request("r", async { Ok(1) }, Some("k".into())).await;
		assert_eq!(ok.unwrap(), 1);
		assert_eq!(opt.stats().total_errors, 1);
	}

	// -- batching -------------------------------------------------------------

	#[tokio::test]
	async fn failing_item_does_not_fail_its_batch() {
		// Small bucket: batch size 5.
		let opt = optimizer(CommunityBucket::Small);
		let mut handles = Vec::new();
		for i in 1..=5u32 {
			let opt = opt.clone();
			handles.push(tokio::spawn(async move {
				opt.process_request(
					format!("req-{i}"),
					async move {
						if i == 3 {
							Err(FeedError::Operation("item 3 failed".into()))
						} else {
							Ok(i * 10)
						}
					},
					None,
				)
				.await
			}));
		}
		let mut results = Vec::new();
		for h in handles {
			results.push(h.await.unwrap());
		}
		for (i, result) in results.iter().enumerate() {
			let n = i as u32 + 1;
			if n == 3 {
				assert!(matches!(result, Err(FeedError::Operation(_))));
			} else {
				assert_eq!(*result.as_ref().unwrap(), n * 10);
			}
		}
		let stats = opt.stats();
		assert_eq!(stats.total_requests, 5);
		assert_eq!(stats.total_errors, 1);
		assert_eq!(stats.batches_flushed, 1);
	}

	#[tokio::test(start_paused = true)]
	async fn partial_batch_flushes_on_timeout() {
		let opt = optimizer(CommunityBucket::Medium);
		let started = Instant::now();
		let (a, b) = tokio::join!(
			opt.process_request("a", async { Ok(1) }, None),
			opt.process_request("b", async { Ok(2) }, None),
		);
		assert_eq!(a.unwrap(), 1);
		assert_eq!(b.unwrap(), 2);
		assert!(started.elapsed() >= CommunityBucket::Medium.batch_config().timeout);
		assert_eq!(opt.stats().batches_flushed, 1);
	}

	#[tokio::test]
	async fn batched_successes_are_cached() {
		let opt = optimizer(CommunityBucket::Small);
		let value = opt.process_request("a", async { Ok(5) }, Some("k".into())).await;
		assert_eq!(value.unwrap(), 5);
		let again = opt
			.process_request("b", async { Err(FeedError::Operation("not called".into())) }, Some("k".into()))
			.await;
		assert_eq!(again.unwrap(), 5);
	}

	#[tokio::test]
	async fn shutdown_drains_pending_batch() {
		let opt = optimizer(CommunityBucket::Massive);
		let pending = {
			let opt = opt.clone();
			tokio::spawn(async move { opt.process_request("late", async { Ok(9) }, None).await })
		};
		while opt.stats().queue_depth == 0 {
			tokio::task::yield_now().await;
		}
		opt.shutdown().await;
		assert_eq!(pending.await.unwrap().unwrap(), 9);
		assert!(matches!(
			opt.process_request("after", async { Ok(1) }, None).await,
			Err(FeedError::ShutDown)
		));
	}

	// -- bucket changes -------------------------------------------------------

	#[tokio::test]
	async fn bucket_change_reapplies_configuration() {
		let opt = optimizer(CommunityBucket::Massive);
		{
			let mut st = lock(&opt.inner.state);
			for i in 0..2_000 {
				st.cache.put(format!("k{i}"), i);
			}
		}
		assert!(opt.update_community_bucket(CommunityBucket::Small));
		assert!(!opt.update_community_bucket(CommunityBucket::Small));
		let stats = opt.stats();
		assert_eq!(stats.community_bucket, CommunityBucket::Small);
		assert_eq!(stats.cache, CommunityBucket::Small.cache_config());
		assert_eq!(stats.batch, CommunityBucket::Small.batch_config());
		assert_eq!(stats.cache_size, 1_000);
		assert_eq!(stats.evictions, 1_000);
	}

	// -- health ---------------------------------------------------------------

	#[tokio::test]
	async fn health_flags_error_rate() {
		let opt = unbatched();
		for i in 0..10 {
			let _ = opt
				.process_request(
					"r",
					async move {
						if i % 2 == 0 {
							Err(FeedError::Operation("x".into()))
						} else {
							Ok(1)
						}
					},
					None,
				)
				.await;
		}
		let report = opt.health_check();
		assert!(!report.healthy);
		assert_eq!(report.status, HealthStatus::Unhealthy);
		assert!(report.issues.iter().any(|i| i.contains("Error rate")));
		assert!(!report.recommendations.is_empty());
		assert!((report.metrics.error_rate - 0.5).abs() < 1e-9);
	}

	#[tokio::test]
	async fn idle_optimizer_is_healthy() {
		let report = optimizer(CommunityBucket::Small).health_check();
		assert!(report.healthy);
		assert!(report.issues.is_empty());
	}

	#[test]
	fn memory_over_ceiling_is_unhealthy() {
		let metrics = PerformanceMetrics {
			timestamp: 0,
			community_bucket: CommunityBucket::Large,
			sample_count: 0,
			avg_latency_ms: 0.0,
			p95_latency_ms: 0.0,
			throughput_rps: 0.0,
			error_rate: 0.0,
			cache_hit_rate: 0.0,
			memory_mb: 900.0,
			cache_size: 0,
			queue_depth: 0,
		};
		let report = evaluate_health(metrics, &PerformanceTargets::default());
		assert_eq!(report.status, HealthStatus::Unhealthy);
		assert!(report.recommendations[0].contains("cache max size"));
	}

	#[tokio::test]
	async fn collected_metrics_are_kept_in_history() {
		let opt = unbatched();
		let _ = opt.process_request("r", async { Ok(1) }, None).await;
		let m = opt.collect_metrics();
		assert_eq!(m.sample_count, 1);
		assert_eq!(opt.metrics_history().len(), 1);
	}
}
