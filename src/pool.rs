//! A cancellable group of cooperating background tasks.
//!
//! Every long-lived task of the configuration plane (provider loops, the
//! watcher's event loop) runs inside a [`Pool`]. Tasks receive a
//! [`CancellationToken`] and must return promptly once it fires; the pool
//! never aborts a task on its own.
use std::{
	future::Future,
	panic::AssertUnwindSafe,
	sync::atomic::{AtomicBool, Ordering},
};

use futures::FutureExt;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error};

/// Returned by [`Pool::go`] once the pool has been stopped.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("worker pool is closed")]
pub struct PoolClosed;

/// Cancellable group of tasks with a start/stop/join lifecycle.
#[derive(Debug, Default)]
pub struct Pool {
	/// Fired on [`Pool::stop`], observed by every task.
	token: CancellationToken,
	/// Tracks running tasks so `stop` can wait for them.
	tracker: TaskTracker,
	/// Set once `stop` has been called.
	closed: AtomicBool,
}

impl Pool {
	/// Create an empty, running pool.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Submit a task. The closure receives the pool's cancellation token.
	///
	/// A panicking task is logged and dropped; the pool and its other tasks
	/// keep running.
	pub fn go<F, Fut>(&self, task: F) -> Result<(), PoolClosed>
	where
		F: FnOnce(CancellationToken) -> Fut,
		Fut: Future<Output = ()> + Send + 'static,
	{
		if self.is_closed() {
			return Err(PoolClosed);
		}
		let future = AssertUnwindSafe(task(self.token.child_token())).catch_unwind();
		self.tracker.spawn(async move {
			if let Err(panic) = future.await {
				let message = panic
					.downcast_ref::<&str>()
					.map(|s| (*s).to_owned())
					.or_else(|| panic.downcast_ref::<String>().cloned())
					.unwrap_or_else(|| "unknown panic payload".to_owned());
				error!(
					"worker task panicked: {message}\n{}",
					std::backtrace::Backtrace::force_capture()
				);
			}
		});
		Ok(())
	}

	/// A token that fires when the pool stops. Useful for nested loops that
	/// are not themselves submitted through [`Pool::go`].
	#[must_use]
	pub fn token(&self) -> CancellationToken {
		self.token.child_token()
	}

	/// Whether [`Pool::stop`] has been called.
	#[must_use]
	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Acquire)
	}

	/// Signal every task and wait until all of them have returned.
	pub async fn stop(&self) {
		if self.closed.swap(true, Ordering::AcqRel) {
			self.tracker.wait().await;
			return;
		}
		debug!("stopping worker pool with {} tasks", self.tracker.len());
		self.token.cancel();
		self.tracker.close();
		self.tracker.wait().await;
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use std::{
		sync::{
			atomic::{AtomicUsize, Ordering},
			Arc,
		},
		time::Duration,
	};

	use super::{Pool, PoolClosed};

	#[tokio::test]
	async fn stop_waits_for_cancelled_tasks() {
		let pool = Pool::new();
		let finished = Arc::new(AtomicUsize::new(0));
		for _ in 0..3 {
			let finished = finished.clone();
			pool.go(|token| async move {
				token.cancelled().await;
				tokio::time::sleep(Duration::from_millis(20)).await;
				finished.fetch_add(1, Ordering::SeqCst);
			})
			.unwrap();
		}
		pool.stop().await;
		assert_eq!(finished.load(Ordering::SeqCst), 3, "stop must join every task");
	}

	#[tokio::test]
	async fn stopped_pool_rejects_tasks() {
		let pool = Pool::new();
		pool.stop().await;
		assert_eq!(pool.go(|_| async {}), Err(PoolClosed));
	}

	#[tokio::test]
	async fn panicking_task_does_not_poison_pool() {
		let pool = Pool::new();
		pool.go(|_| async { panic!("boom") }).unwrap();
		tokio::time::sleep(Duration::from_millis(10)).await;

		let (tx, rx) = tokio::sync::oneshot::channel();
		pool.go(|_| async move {
			let _ = tx.send(());
		})
		.unwrap();
		rx.await.unwrap();
		pool.stop().await;
	}
}
