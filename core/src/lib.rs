//! Small, shared primitives used across the gateway crates: a prelude of
//! common re-exports, a monotonic connection id for log correlation, and a
//! graceful-shutdown handle built on a broadcast channel.

pub mod prelude;
pub mod shutdown;

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-lifetime monotonic id, used only to correlate log lines for a
/// single connection. Not part of any wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
	pub fn next() -> Self {
		static NEXT: AtomicU64 = AtomicU64::new(1);
		Self(NEXT.fetch_add(1, Ordering::Relaxed))
	}
}

impl std::fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "conn-{}", self.0)
	}
}
