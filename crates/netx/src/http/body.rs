//! Response body wrapper (§4.8 step 9 of the design doc). Each frame read through here is
//! turned into an `HttpResponseBodyPart` event, and the body's `Drop` emits the terminal
//! `HttpResponseDone` exactly once.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;

use crate::clock::{Beginning, TransactionId};
use crate::handler::EventHandler;
use crate::measurement::{HttpResponseBodyPartEvent, HttpResponseDoneEvent, Measurement};

pin_project! {
	/// Wraps any `http_body::Body<Data = Bytes>` and emits a `HttpResponseBodyPart` event
	/// per frame plus one terminal `HttpResponseDone` on drop.
	pub struct MeasuringBody<B> {
		#[pin]
		inner: B,
		shared: Arc<Shared>,
	}
}

struct Shared {
	transaction_id: TransactionId,
	beginning: Beginning,
	handler: Arc<dyn EventHandler>,
	include_data: bool,
	done: AtomicBool,
}

impl<B> MeasuringBody<B> {
	pub fn new(
		inner: B,
		transaction_id: TransactionId,
		beginning: Beginning,
		handler: Arc<dyn EventHandler>,
		include_data: bool,
	) -> Self {
		MeasuringBody {
			inner,
			shared: Arc::new(Shared { transaction_id, beginning, handler, include_data, done: AtomicBool::new(false) }),
		}
	}

	fn emit_done(shared: &Shared, error: Option<String>) {
		if shared.done.swap(true, Ordering::AcqRel) {
			return;
		}
		shared.handler.on_measurement(Measurement::HttpResponseDone(HttpResponseDoneEvent {
			transaction_id: shared.transaction_id,
			error,
			time: shared.beginning.elapsed(),
		}));
	}
}

impl<B> Drop for MeasuringBody<B> {
	fn drop(&mut self) {
		Self::emit_done(&self.shared, None);
	}
}

impl<B> Body for MeasuringBody<B>
where
	B: Body<Data = Bytes>,
	B::Error: std::fmt::Display,
{
	type Data = Bytes;
	type Error = B::Error;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
		let this = self.project();
		let shared: &Shared = &**this.shared;
		let start = shared.beginning.elapsed();
		let poll = this.inner.poll_frame(cx);
		if let Poll::Ready(frame) = &poll {
			let duration = shared.beginning.elapsed().saturating_sub(start);
			let time = shared.beginning.elapsed();
			match frame {
				Some(Ok(f)) => {
					if let Some(data) = f.data_ref() {
						shared.handler.on_measurement(Measurement::HttpResponseBodyPart(HttpResponseBodyPartEvent {
							transaction_id: shared.transaction_id,
							num_bytes: data.len(),
							duration,
							data: shared.include_data.then(|| data.to_vec()),
							error: None,
							time,
						}));
					}
				},
				Some(Err(e)) => {
					let msg = e.to_string();
					shared.handler.on_measurement(Measurement::HttpResponseBodyPart(HttpResponseBodyPartEvent {
						transaction_id: shared.transaction_id,
						num_bytes: 0,
						duration,
						data: None,
						error: Some(msg.clone()),
						time,
					}));
					Self::emit_done(shared, Some(msg));
				},
				None => {
					Self::emit_done(shared, None);
				},
			}
		}
		poll
	}

	fn is_end_stream(&self) -> bool {
		self.inner.is_end_stream()
	}

	fn size_hint(&self) -> SizeHint {
		self.inner.size_hint()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::clock::IdCounters;
	use crate::handler::BufferingHandler;
	use http_body_util::{BodyExt, Full};

	#[tokio::test]
	async fn reads_body_and_emits_parts_then_done() {
		let handler = Arc::new(BufferingHandler::new());
		let txn = IdCounters::new().next_transaction_id();
		let beginning = Beginning::now();
		let inner = Full::new(Bytes::from_static(b"hello world"));
		let body = MeasuringBody::new(inner, txn, beginning, handler.clone(), true);

		let collected = body.collect().await.unwrap().to_bytes();
		assert_eq!(collected, Bytes::from_static(b"hello world"));
		assert_eq!(handler.events_of_kind("http_response_body_part").len(), 1);
		assert_eq!(handler.events_of_kind("http_response_done").len(), 1);
	}

	#[tokio::test]
	async fn drop_without_reading_still_emits_done_once() {
		let handler = Arc::new(BufferingHandler::new());
		let txn = IdCounters::new().next_transaction_id();
		let beginning = Beginning::now();
		let inner = Full::new(Bytes::from_static(b"x"));
		{
			let _body = MeasuringBody::new(inner, txn, beginning, handler.clone(), false);
		}
		assert_eq!(handler.events_of_kind("http_response_done").len(), 1);
	}
}
