//! Measuring Connection (§4.2 of the design doc): wraps an established byte-stream or
//! datagram socket and turns its I/O into `Read`/`Write`/`ReadFrom`/`WriteTo`/`Close` events.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;

use crate::clock::{Beginning, ConnId};
use crate::handler::EventHandler;
use crate::measurement::{CloseEvent, DatagramEvent, Measurement, ReadWriteEvent};

pin_project! {
	/// Wraps any `AsyncRead + AsyncWrite` stream (a plain `TcpStream` or a `tokio_rustls`
	/// `TlsStream`) and emits an event for every read, write, and the first close.
	pub struct MeasuringConn<S> {
		#[pin]
		inner: S,
		shared: Arc<Shared>,
	}
}

/// Aggregate byte counters shared across every connection a single dialer creates,
/// mirroring the dialer-level `BytesRead`/`BytesWritten` fields in the original
/// implementation that every `measurableConn.Read`/`Write` folds into alongside its own
/// per-connection count.
#[derive(Debug, Default)]
pub struct ByteCounters {
	read: AtomicU64,
	written: AtomicU64,
}

impl ByteCounters {
	pub fn bytes_read(&self) -> u64 {
		self.read.load(Ordering::Relaxed)
	}

	pub fn bytes_written(&self) -> u64 {
		self.written.load(Ordering::Relaxed)
	}

	fn add_read(&self, n: u64) {
		self.read.fetch_add(n, Ordering::Relaxed);
	}

	fn add_written(&self, n: u64) {
		self.written.fetch_add(n, Ordering::Relaxed);
	}
}

struct Shared {
	conn_id: ConnId,
	beginning: Beginning,
	handler: Arc<dyn EventHandler>,
	include_data: bool,
	bytes_read: AtomicU64,
	bytes_written: AtomicU64,
	closed: AtomicBool,
	dialer_counters: Option<Arc<ByteCounters>>,
}

impl<S> MeasuringConn<S> {
	pub fn new(
		inner: S,
		conn_id: ConnId,
		beginning: Beginning,
		handler: Arc<dyn EventHandler>,
		include_data: bool,
		dialer_counters: Option<Arc<ByteCounters>>,
	) -> Self {
		MeasuringConn {
			inner,
			shared: Arc::new(Shared {
				conn_id,
				beginning,
				handler,
				include_data,
				bytes_read: AtomicU64::new(0),
				bytes_written: AtomicU64::new(0),
				closed: AtomicBool::new(false),
				dialer_counters,
			}),
		}
	}

	pub fn conn_id(&self) -> ConnId {
		self.shared.conn_id
	}

	pub fn get_ref(&self) -> &S {
		&self.inner
	}

	pub fn bytes_read(&self) -> u64 {
		self.shared.bytes_read.load(Ordering::Relaxed)
	}

	pub fn bytes_written(&self) -> u64 {
		self.shared.bytes_written.load(Ordering::Relaxed)
	}

	/// Emits `Close` exactly once, idempotently, regardless of how many times it's called
	/// (e.g. once from an explicit shutdown and once from `Drop`).
	pub fn emit_close(&self, error: Option<String>) {
		if self.shared.closed.swap(true, Ordering::AcqRel) {
			return;
		}
		self.shared.handler.on_measurement(Measurement::Close(CloseEvent {
			conn_id: self.shared.conn_id,
			duration: std::time::Duration::ZERO,
			error,
			time: self.shared.beginning.elapsed(),
		}));
	}
}

impl<S> Drop for MeasuringConn<S> {
	fn drop(&mut self) {
		self.emit_close(None);
	}
}

impl<S: AsyncRead> AsyncRead for MeasuringConn<S> {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<std::io::Result<()>> {
		let this = self.project();
		let shared = this.shared;
		let before = buf.filled().len();
		let start = shared.beginning.elapsed();
		let poll = this.inner.poll_read(cx, buf);
		if let Poll::Ready(result) = &poll {
			let duration = shared.beginning.elapsed().saturating_sub(start);
			let time = shared.beginning.elapsed();
			match result {
				Ok(()) => {
					let num_bytes = buf.filled().len() - before;
					shared.bytes_read.fetch_add(num_bytes as u64, Ordering::Relaxed);
					if let Some(counters) = &shared.dialer_counters {
						counters.add_read(num_bytes as u64);
					}
					let data = shared
						.include_data
						.then(|| buf.filled()[before..].to_vec());
					shared.handler.on_measurement(Measurement::Read(ReadWriteEvent {
						conn_id: shared.conn_id,
						num_bytes,
						duration,
						data,
						error: None,
						time,
					}));
				},
				Err(e) => {
					shared.handler.on_measurement(Measurement::Read(ReadWriteEvent {
						conn_id: shared.conn_id,
						num_bytes: 0,
						duration,
						data: None,
						error: Some(e.to_string()),
						time,
					}));
				},
			}
		}
		poll
	}
}

impl<S: AsyncWrite> AsyncWrite for MeasuringConn<S> {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<std::io::Result<usize>> {
		let this = self.project();
		let shared = this.shared;
		let start = shared.beginning.elapsed();
		let poll = this.inner.poll_write(cx, buf);
		if let Poll::Ready(result) = &poll {
			let duration = shared.beginning.elapsed().saturating_sub(start);
			let time = shared.beginning.elapsed();
			match result {
				Ok(num_bytes) => {
					shared.bytes_written.fetch_add(*num_bytes as u64, Ordering::Relaxed);
					if let Some(counters) = &shared.dialer_counters {
						counters.add_written(*num_bytes as u64);
					}
					let data = shared.include_data.then(|| buf[..*num_bytes].to_vec());
					shared.handler.on_measurement(Measurement::Write(ReadWriteEvent {
						conn_id: shared.conn_id,
						num_bytes: *num_bytes,
						duration,
						data,
						error: None,
						time,
					}));
				},
				Err(e) => {
					shared.handler.on_measurement(Measurement::Write(ReadWriteEvent {
						conn_id: shared.conn_id,
						num_bytes: 0,
						duration,
						data: None,
						error: Some(e.to_string()),
						time,
					}));
				},
			}
		}
		poll
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		self.project().inner.poll_flush(cx)
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		self.project().inner.poll_shutdown(cx)
	}
}

/// Datagram counterpart of [`MeasuringConn`] for UDP-based DNS transports. `tokio::net::
/// UdpSocket` has no stream-like poll interface worth wrapping generically, so this is a
/// small dedicated type rather than a second `AsyncRead`/`AsyncWrite` impl.
pub struct MeasuringUdpSocket {
	inner: UdpSocket,
	conn_id: ConnId,
	beginning: Beginning,
	handler: Arc<dyn EventHandler>,
	include_data: bool,
	bytes_read: AtomicU64,
	bytes_written: AtomicU64,
	closed: AtomicBool,
	dialer_counters: Option<Arc<ByteCounters>>,
}

impl MeasuringUdpSocket {
	pub fn new(
		inner: UdpSocket,
		conn_id: ConnId,
		beginning: Beginning,
		handler: Arc<dyn EventHandler>,
		include_data: bool,
		dialer_counters: Option<Arc<ByteCounters>>,
	) -> Self {
		MeasuringUdpSocket {
			inner,
			conn_id,
			beginning,
			handler,
			include_data,
			bytes_read: AtomicU64::new(0),
			bytes_written: AtomicU64::new(0),
			closed: AtomicBool::new(false),
			dialer_counters,
		}
	}

	pub fn conn_id(&self) -> ConnId {
		self.conn_id
	}

	pub async fn send_to(&self, buf: &[u8], dest: SocketAddr) -> std::io::Result<usize> {
		let start = self.beginning.elapsed();
		let result = self.inner.send_to(buf, dest).await;
		let duration = self.beginning.elapsed().saturating_sub(start);
		let time = self.beginning.elapsed();
		match &result {
			Ok(n) => {
				self.bytes_written.fetch_add(*n as u64, Ordering::Relaxed);
				if let Some(counters) = &self.dialer_counters {
					counters.add_written(*n as u64);
				}
				self.handler.on_measurement(Measurement::WriteTo(DatagramEvent {
					conn_id: self.conn_id,
					num_bytes: *n,
					duration,
					data: self.include_data.then(|| buf[..*n].to_vec()),
					src_address: None,
					dest_address: Some(dest),
					error: None,
					time,
				}));
			},
			Err(e) => {
				self.handler.on_measurement(Measurement::WriteTo(DatagramEvent {
					conn_id: self.conn_id,
					num_bytes: 0,
					duration,
					data: None,
					src_address: None,
					dest_address: Some(dest),
					error: Some(e.to_string()),
					time,
				}));
			},
		}
		result
	}

	pub async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
		let start = self.beginning.elapsed();
		let result = self.inner.recv_from(buf).await;
		let duration = self.beginning.elapsed().saturating_sub(start);
		let time = self.beginning.elapsed();
		match &result {
			Ok((n, src)) => {
				self.bytes_read.fetch_add(*n as u64, Ordering::Relaxed);
				if let Some(counters) = &self.dialer_counters {
					counters.add_read(*n as u64);
				}
				self.handler.on_measurement(Measurement::ReadFrom(DatagramEvent {
					conn_id: self.conn_id,
					num_bytes: *n,
					duration,
					data: self.include_data.then(|| buf[..*n].to_vec()),
					src_address: Some(*src),
					dest_address: None,
					error: None,
					time,
				}));
			},
			Err(e) => {
				self.handler.on_measurement(Measurement::ReadFrom(DatagramEvent {
					conn_id: self.conn_id,
					num_bytes: 0,
					duration,
					data: None,
					src_address: None,
					dest_address: None,
					error: Some(e.to_string()),
					time,
				}));
			},
		}
		result
	}

	pub fn emit_close(&self, error: Option<String>) {
		if self.closed.swap(true, Ordering::AcqRel) {
			return;
		}
		self.handler.on_measurement(Measurement::Close(CloseEvent {
			conn_id: self.conn_id,
			duration: std::time::Duration::ZERO,
			error,
			time: self.beginning.elapsed(),
		}));
	}
}

impl Drop for MeasuringUdpSocket {
	fn drop(&mut self) {
		self.emit_close(None);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::clock::IdCounters;
	use crate::handler::BufferingHandler;
	use tokio::io::{AsyncReadExt, AsyncWriteExt};
	use tokio::net::{TcpListener, TcpStream};

	async fn loopback_pair() -> (TcpStream, TcpStream) {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let connect = TcpStream::connect(addr);
		let (accept, connect) = tokio::join!(listener.accept(), connect);
		(accept.unwrap().0, connect.unwrap())
	}

	#[tokio::test]
	async fn emits_read_write_and_close_once() {
		let (server, client) = loopback_pair().await;
		let handler = Arc::new(BufferingHandler::new());
		let beginning = Beginning::now();
		let conn_id = IdCounters::new().next_conn_id();
		let mut measuring = MeasuringConn::new(client, conn_id, beginning, handler.clone(), true, None);
		let mut server = server;

		measuring.write_all(b"hello").await.unwrap();
		let mut buf = [0u8; 5];
		server.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"hello");

		server.write_all(b"world").await.unwrap();
		let mut readback = [0u8; 5];
		measuring.read_exact(&mut readback).await.unwrap();
		assert_eq!(&readback, b"world");

		measuring.emit_close(None);
		measuring.emit_close(None);

		assert_eq!(handler.events_of_kind("write").len(), 1);
		assert_eq!(handler.events_of_kind("read").len(), 1);
		assert_eq!(handler.events_of_kind("close").len(), 1);
	}
}
