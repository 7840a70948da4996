//! HTTP Transport (§4.8 of the design doc). Dials a fresh connection per transaction via
//! the top Measuring Dialer, drives the HTTP/1.1 or HTTP/2 exchange directly via
//! `hyper::client::conn` (chosen by negotiated ALPN), and produces the full HTTP-level
//! event sequence. Connection pooling is out of scope (see §1 Non-goals): every call dials
//! anew.

pub mod body;

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::{Request, Response, Uri};
use http_body_util::Full;
use hyper_util::rt::{TokioExecutor, TokioIo};

use crate::clock::{Beginning, IdCounters, RequestContext};
use crate::dialer::Network;
use crate::dialer::measuring::{MeasuringDialer, Socket};
use crate::error::HttpTransportError;
use crate::handler::EventHandler;
use crate::http::body::MeasuringBody;
use crate::measurement::{
	HttpConnectionReadyEvent, HttpRequestDoneEvent, HttpRequestHeadersDoneEvent, HttpResponseHeadersDoneEvent,
	HttpResponseStartEvent, Measurement,
};

pub type ResponseBody = MeasuringBody<hyper::body::Incoming>;

pub struct HttpTransport {
	dialer: Arc<MeasuringDialer>,
	ids: Arc<IdCounters>,
	beginning: Beginning,
	handler: Arc<dyn EventHandler>,
	include_data: bool,
}

impl HttpTransport {
	pub fn new(
		dialer: Arc<MeasuringDialer>,
		ids: Arc<IdCounters>,
		beginning: Beginning,
		handler: Arc<dyn EventHandler>,
		include_data: bool,
	) -> Self {
		HttpTransport { dialer, ids, beginning, handler, include_data }
	}

	pub async fn do_request(
		&self,
		req: Request<Full<Bytes>>,
	) -> Result<Response<ResponseBody>, HttpTransportError> {
		let transaction_id = self.ids.next_transaction_id();
		let ctx = RequestContext::new(self.beginning, self.handler.clone()).with_transaction_id(transaction_id);

		let uri = req.uri().clone();
		let (_scheme, host, port, tls_config) = split_uri(&uri)?;

		let socket = self
			.dialer
			.dial_context(&ctx, &self.ids, Network::Tcp, &host, port, tls_config)
			.await
			.map_err(HttpTransportError::Dial)?;

		self.run_on_socket(&ctx, transaction_id, socket, req).await
	}

	pub fn ids(&self) -> &Arc<IdCounters> {
		&self.ids
	}

	/// Runs the request/response half of a transaction (steps 4-9) over an already
	/// established socket. Split out from [`HttpTransport::do_request`] so a caller that
	/// dials its own socket -- e.g. the client facade routing through a forward/CONNECT
	/// proxy -- can reuse the same handshake/event machinery without re-dialing.
	pub async fn run_on_socket(
		&self,
		ctx: &RequestContext,
		transaction_id: crate::clock::TransactionId,
		socket: Socket,
		req: Request<Full<Bytes>>,
	) -> Result<Response<ResponseBody>, HttpTransportError> {
		let (local_addr, remote_addr, negotiated_h2) = socket_info(&socket);

		ctx.handler.on_measurement(Measurement::HttpConnectionReady(HttpConnectionReadyEvent {
			transaction_id,
			local_address: local_addr,
			remote_address: remote_addr,
			network: "tcp".to_string(),
			time: ctx.elapsed(),
		}));

		ctx.handler.on_measurement(Measurement::HttpRequestHeadersDone(HttpRequestHeadersDoneEvent {
			transaction_id,
			method: req.method().clone(),
			url: req.uri().to_string(),
			headers: req.headers().clone(),
			time: ctx.elapsed(),
		}));

		let response = self.send(ctx, socket, negotiated_h2, req).await;

		match response {
			Ok(resp) => {
				ctx.handler.on_measurement(Measurement::HttpRequestDone(HttpRequestDoneEvent {
					transaction_id,
					error: None,
					time: ctx.elapsed(),
				}));
				ctx.handler.on_measurement(Measurement::HttpResponseStart(HttpResponseStartEvent {
					transaction_id,
					time: ctx.elapsed(),
				}));
				let (parts, body) = resp.into_parts();
				ctx.handler.on_measurement(Measurement::HttpResponseHeadersDone(HttpResponseHeadersDoneEvent {
					transaction_id,
					status_code: parts.status,
					headers: parts.headers.clone(),
					time: ctx.elapsed(),
				}));
				let wrapped =
					MeasuringBody::new(body, transaction_id, self.beginning, self.handler.clone(), self.include_data);
				Ok(Response::from_parts(parts, wrapped))
			},
			Err(e) => {
				ctx.handler.on_measurement(Measurement::HttpRequestDone(HttpRequestDoneEvent {
					transaction_id,
					error: Some(e.to_string()),
					time: ctx.elapsed(),
				}));
				Err(e)
			},
		}
	}

	async fn send(
		&self,
		ctx: &RequestContext,
		socket: Socket,
		negotiated_h2: bool,
		req: Request<Full<Bytes>>,
	) -> Result<Response<hyper::body::Incoming>, HttpTransportError> {
		let use_h2 = negotiated_h2 || req.version() == http::Version::HTTP_2;
		if use_h2 {
			let io = match socket {
				Socket::Tls(stream) => TokioIo::new(*stream),
				Socket::Plain(_) => {
					return Err(HttpTransportError::Handshake(
						"http/2 requires a negotiated tls connection".to_string(),
					));
				},
			};
			let (mut sender, conn) = hyper::client::conn::http2::handshake(TokioExecutor::new(), io)
				.await
				.map_err(|e| HttpTransportError::Handshake(e.to_string()))?;
			tokio::spawn(async move {
				let _ = conn.await;
			});
			let fut = sender.send_request(req);
			ctx.race(fut).await.ok_or(HttpTransportError::Cancelled)?.map_err(|e| HttpTransportError::Send(e.to_string()))
		} else {
			match socket {
				Socket::Plain(stream) => self.send_h1(ctx, TokioIo::new(stream), req).await,
				Socket::Tls(stream) => self.send_h1(ctx, TokioIo::new(*stream), req).await,
			}
		}
	}

	async fn send_h1<IO>(
		&self,
		ctx: &RequestContext,
		io: IO,
		req: Request<Full<Bytes>>,
	) -> Result<Response<hyper::body::Incoming>, HttpTransportError>
	where
		IO: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
	{
		let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
			.await
			.map_err(|e| HttpTransportError::Handshake(e.to_string()))?;
		tokio::spawn(async move {
			let _ = conn.await;
		});
		let fut = sender.send_request(req);
		ctx.race(fut).await.ok_or(HttpTransportError::Cancelled)?.map_err(|e| HttpTransportError::Send(e.to_string()))
	}

	/// Documented non-goal: no connection pooling. Kept for API parity with the client
	/// facade described in §6.
	pub fn close_idle_connections(&self) {}
}

fn split_uri(uri: &Uri) -> Result<(&'static str, String, u16, Option<Arc<rustls::ClientConfig>>), HttpTransportError> {
	let host = uri
		.host()
		.ok_or_else(|| HttpTransportError::InvalidRequest("request uri has no host".to_string()))?
		.to_string();
	let is_https = match uri.scheme_str() {
		Some("https") => true,
		Some("http") | None => false,
		Some(other) => {
			return Err(HttpTransportError::InvalidRequest(format!("unsupported scheme {other:?}")));
		},
	};
	let port = uri.port_u16().unwrap_or(if is_https { 443 } else { 80 });
	let tls_config = is_https.then(crate::tls_config::default_client_config);
	Ok((if is_https { "https" } else { "http" }, host, port, tls_config))
}

fn socket_info(socket: &Socket) -> (SocketAddr, SocketAddr, bool) {
	match socket {
		Socket::Plain(stream) => {
			let tcp = stream.get_ref();
			(
				tcp.local_addr().unwrap_or_else(|_| unspecified()),
				tcp.peer_addr().unwrap_or_else(|_| unspecified()),
				false,
			)
		},
		Socket::Tls(stream) => {
			let (tcp, session) = stream.get_ref();
			let negotiated_h2 = session.alpn_protocol() == Some(b"h2");
			(
				tcp.get_ref().local_addr().unwrap_or_else(|_| unspecified()),
				tcp.get_ref().peer_addr().unwrap_or_else(|_| unspecified()),
				negotiated_h2,
			)
		},
	}
}

fn unspecified() -> SocketAddr {
	SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0)
}
