pub mod cache;
pub mod checksum;
pub mod community;
pub mod config;
pub mod error;
pub mod learning_buffer;
pub mod light_ranker;
pub mod local;
pub mod mixer;
pub mod optimizer;
pub mod orchestrator;
pub mod personalization;
pub mod protocol;
pub mod scoring;
pub mod server;
pub mod snapshot_archive;
pub mod sync;
pub mod tasks;
pub mod transport;
pub mod types;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
