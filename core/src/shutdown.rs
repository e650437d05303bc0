//! Graceful shutdown signal shared by every accept loop and in-flight
//! connection. A single [`Shutdown`] is cloned into every task; cancelling
//! the originating [`ShutdownHandle`] wakes every clone's [`Shutdown::cancelled`]
//! future exactly once.

use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug)]
struct Inner {
	notify: Notify,
	cancelled: std::sync::atomic::AtomicBool,
}

/// Held by the process's main task; calling [`ShutdownHandle::trigger`]
/// (e.g. from a SIGINT handler) cancels every outstanding [`Shutdown`].
#[derive(Clone, Debug)]
pub struct ShutdownHandle(Arc<Inner>);

#[derive(Clone, Debug)]
pub struct Shutdown(Arc<Inner>);

pub fn new() -> (ShutdownHandle, Shutdown) {
	let inner = Arc::new(Inner {
		notify: Notify::new(),
		cancelled: std::sync::atomic::AtomicBool::new(false),
	});
	(ShutdownHandle(inner.clone()), Shutdown(inner))
}

impl ShutdownHandle {
	pub fn trigger(&self) {
		self.0.cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
		self.0.notify.notify_waiters();
	}
}

impl Shutdown {
	pub fn is_cancelled(&self) -> bool {
		self.0.cancelled.load(std::sync::atomic::Ordering::SeqCst)
	}

	/// Resolves once [`ShutdownHandle::trigger`] has been called. Resolves
	/// immediately if it already has been.
	pub async fn cancelled(&self) {
		if self.is_cancelled() {
			return;
		}
		let notified = self.0.notify.notified();
		if self.is_cancelled() {
			return;
		}
		notified.await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn trigger_wakes_existing_waiters() {
		let (handle, shutdown) = new();
		let waiter = tokio::spawn({
			let shutdown = shutdown.clone();
			async move {
				shutdown.cancelled().await;
			}
		});
		tokio::task::yield_now().await;
		handle.trigger();
		waiter.await.unwrap();
		assert!(shutdown.is_cancelled());
	}

	#[tokio::test]
	async fn cancelled_resolves_immediately_after_trigger() {
		let (handle, shutdown) = new();
		handle.trigger();
		shutdown.cancelled().await;
	}
}
