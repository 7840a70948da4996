//! Sinks for [`Measurement`] events (§4.1 of the design doc).

use parking_lot::Mutex;

use crate::measurement::Measurement;

/// Receives every measurement produced by a client. Implementations must be cheap and
/// non-blocking -- they're invoked inline on the hot path of dialing/reading/writing, never
/// from a dedicated task.
pub trait EventHandler: Send + Sync {
	fn on_measurement(&self, m: Measurement);
}

/// Discards everything. The default handler for callers who only want the final response
/// and don't care about the trace.
#[derive(Debug, Default)]
pub struct NullHandler;

impl EventHandler for NullHandler {
	fn on_measurement(&self, _m: Measurement) {}
}

/// Logs each event at `debug` level via `tracing`, tagged with its `kind()`.
#[derive(Debug, Default)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
	fn on_measurement(&self, m: Measurement) {
		tracing::debug!(kind = m.kind(), measurement = ?m, "netx event");
	}
}

/// Appends every measurement to an in-memory buffer. Intended for tests that want to
/// assert on the exact event sequence a transaction produced.
#[derive(Debug, Default)]
pub struct BufferingHandler {
	events: Mutex<Vec<Measurement>>,
}

impl BufferingHandler {
	pub fn new() -> Self {
		BufferingHandler { events: Mutex::new(Vec::new()) }
	}

	/// Snapshot of everything recorded so far, in order.
	pub fn events(&self) -> Vec<Measurement> {
		self.events.lock().clone()
	}

	/// Only the events matching the given `kind()`, in order.
	pub fn events_of_kind(&self, kind: &str) -> Vec<Measurement> {
		self.events.lock().iter().filter(|m| m.kind() == kind).cloned().collect()
	}

	pub fn len(&self) -> usize {
		self.events.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn clear(&self) {
		self.events.lock().clear();
	}
}

impl EventHandler for BufferingHandler {
	fn on_measurement(&self, m: Measurement) {
		self.events.lock().push(m);
	}
}
