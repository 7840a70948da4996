//! The clock origin and the three id counters that correlate events across every layer
//! of the stack (§3 of the design doc: `Beginning`, `DialId`, `ConnId`, `TransactionId`).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::handler::EventHandler;

/// Wall-clock instant captured once at client construction. Every event's `time` field is
/// a duration measured from this instant, never a raw `SystemTime`, so two clients never
/// need to agree on wall-clock skew to compare their own event streams.
#[derive(Clone, Copy, Debug)]
pub struct Beginning(Instant);

impl Beginning {
	pub fn now() -> Self {
		Beginning(Instant::now())
	}

	/// Duration elapsed since this origin, to be stamped on an event at the moment it is
	/// produced.
	pub fn elapsed(&self) -> Duration {
		self.0.elapsed()
	}
}

impl Default for Beginning {
	fn default() -> Self {
		Self::now()
	}
}

macro_rules! id_type {
	($name:ident) => {
		#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, serde::Serialize)]
		pub struct $name(u64);

		impl $name {
			pub fn as_u64(self) -> u64 {
				self.0
			}
		}

		impl std::fmt::Display for $name {
			fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
				write!(f, "{}", self.0)
			}
		}
	};
}

id_type!(DialId);
id_type!(ConnId);
id_type!(TransactionId);

/// Atomic, strictly-increasing id allocator. Three of these live on the client: one each
/// for `DialId`, `ConnId`, `TransactionId`. `Ordering::Relaxed` is enough since callers only
/// need uniqueness, not synchronization with other memory operations.
#[derive(Debug, Default)]
pub struct IdCounter(AtomicU64);

impl IdCounter {
	pub fn new() -> Self {
		// Start at 1 so that "0" can be reserved as an unset sentinel if ever needed.
		IdCounter(AtomicU64::new(1))
	}

	fn next(&self) -> u64 {
		self.0.fetch_add(1, Ordering::Relaxed)
	}
}

#[derive(Debug, Default)]
pub struct IdCounters {
	dial: IdCounter,
	conn: IdCounter,
	transaction: IdCounter,
}

impl IdCounters {
	pub fn new() -> Self {
		IdCounters {
			dial: IdCounter::new(),
			conn: IdCounter::new(),
			transaction: IdCounter::new(),
		}
	}

	pub fn next_dial_id(&self) -> DialId {
		DialId(self.dial.next())
	}

	pub fn next_conn_id(&self) -> ConnId {
		ConnId(self.conn.next())
	}

	pub fn next_transaction_id(&self) -> TransactionId {
		TransactionId(self.transaction.next())
	}
}

/// Carries everything a single request/dial needs to stamp and route its events:
/// the clock origin, the handler to call, and whichever ids are already known when the
/// context is built. In a language with ambient context values (Go's `context.Context`)
/// this would ride along implicitly; here it's an explicit struct threaded by reference
/// down every call path, and captured by value in hook closures where needed.
#[derive(Clone)]
pub struct RequestContext {
	pub beginning: Beginning,
	pub handler: Arc<dyn EventHandler>,
	pub dial_id: Option<DialId>,
	pub transaction_id: Option<TransactionId>,
	pub cancel: tokio_util::sync::CancellationToken,
	pub deadline: Option<Instant>,
}

impl RequestContext {
	pub fn new(beginning: Beginning, handler: Arc<dyn EventHandler>) -> Self {
		RequestContext {
			beginning,
			handler,
			dial_id: None,
			transaction_id: None,
			cancel: tokio_util::sync::CancellationToken::new(),
			deadline: None,
		}
	}

	pub fn with_dial_id(mut self, id: DialId) -> Self {
		self.dial_id = Some(id);
		self
	}

	pub fn with_transaction_id(mut self, id: TransactionId) -> Self {
		self.transaction_id = Some(id);
		self
	}

	pub fn with_deadline(mut self, deadline: Instant) -> Self {
		self.deadline = Some(deadline);
		self
	}

	pub fn elapsed(&self) -> Duration {
		self.beginning.elapsed()
	}

	pub fn is_cancelled(&self) -> bool {
		self.cancel.is_cancelled()
	}

	/// Races `fut` against cancellation and the deadline, returning `None` if either fires
	/// first.
	pub async fn race<T>(&self, fut: impl std::future::Future<Output = T>) -> Option<T> {
		let timeout = async {
			match self.deadline {
				Some(d) => tokio::time::sleep_until(d.into()).await,
				None => std::future::pending().await,
			}
		};
		tokio::select! {
			biased;
			_ = self.cancel.cancelled() => None,
			_ = timeout => None,
			v = fut => Some(v),
		}
	}
}
