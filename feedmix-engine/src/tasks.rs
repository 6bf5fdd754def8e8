// ---------------------------------------------------------------------------
// Background task group
// ---------------------------------------------------------------------------
//
// Periodic loops (metrics collection, snapshotting, batch-timeout flushes,
// session cleanup) share one cancellation token and are shut down together.
// ---------------------------------------------------------------------------

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::lock;

pub struct TaskGroup {
	name: &'static str,
	token: CancellationToken,
	handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskGroup {
	pub fn new(name: &'static str) -> Self {
		Self {
			name,
			token: CancellationToken::new(),
			handles: Mutex::new(Vec::new()),
		}
	}

	pub fn is_cancelled(&self) -> bool {
		self.token.is_cancelled()
	}

	/// Run `tick` every `period` until the group is cancelled. The first tick
	/// fires one full period after spawning.
	pub fn spawn_periodic<F, Fut>(&self, label: &'static str, period: Duration, mut tick: F)
	where
		F: FnMut() -> Fut + Send + 'static,
		Fut: Future<Output = ()> + Send + 'static,
	{
		let token = self.token.clone();
		let group = self.name;
		let period = period.max(Duration::from_millis(1));
		let handle = tokio::spawn(async move {
			let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
			interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			tracing::debug!(group, label, period_ms = period.as_millis() as u64, "Background loop started");
			loop {
				tokio::select! {
					biased;
					_ = token.cancelled() => break,
					_ = interval.tick() => tick().await,
				}
			}
			tracing::debug!(group, label, "Background loop stopped");
		});
		lock(&self.handles).push(handle);
	}

	/// Cancel every loop and wait for them to exit.
	pub async fn shutdown(&self) {
		self.token.cancel();
		let handles: Vec<JoinHandle<()>> = lock(&self.handles).drain(..).collect();
		for handle in handles {
			if let Err(e) = handle.await {
				tracing::error!(group = self.name, error = ?e, "Background loop panicked");
			}
		}
	}

	pub fn len(&self) -> usize {
		lock(&self.handles).len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

impl Drop for TaskGroup {
	fn drop(&mut self) {
		self.token.cancel();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Arc;
	use std::sync::atomic::{AtomicUsize, Ordering};

	#[tokio::test(start_paused = true)]
	async fn periodic_loop_ticks_until_shutdown() {
		let group = TaskGroup::new("test");
		let count = Arc::new(AtomicUsize::new(0));
		let c = Arc::clone(&count);
		group.spawn_periodic("counter", Duration::from_millis(10), move || {
			let c = Arc::clone(&c);
			async move {
				c.fetch_add(1, Ordering::SeqCst);
			}
		});
		assert_eq!(group.len(), 1);

		tokio::time::sleep(Duration::from_millis(35)).await;
		let seen = count.load(Ordering::SeqCst);
		assert!(seen >= 3, "expected at least 3 ticks, saw {seen}");

		group.shutdown().await;
		assert!(group.is_cancelled());
		assert!(group.is_empty());
		let after = count.load(Ordering::SeqCst);
		tokio::time::sleep(Duration::from_millis(50)).await;
		assert_eq!(count.load(Ordering::SeqCst), after);
	}
}
