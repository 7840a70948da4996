//! Dialer base (§4.3 of the design doc): a single, unretried connect to a known IP,
//! wrapped as a [`MeasuringConn`](crate::conn::MeasuringConn).

pub mod measuring;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpStream, UdpSocket};

use crate::clock::{ConnId, IdCounters, RequestContext};
use crate::conn::{ByteCounters, MeasuringConn, MeasuringUdpSocket};
use crate::error::ConnectError;
use crate::measurement::{ConnectEvent, Measurement};

/// Network family requested of [`DialerBase::dial_host_port`]. `*4`/`*6` pin the socket to
/// one IP family; the bare variants accept whichever family `ip` happens to be.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
	Tcp,
	Tcp4,
	Tcp6,
	Udp,
	Udp4,
	Udp6,
}

impl Network {
	pub fn as_str(self) -> &'static str {
		match self {
			Network::Tcp => "tcp",
			Network::Tcp4 => "tcp4",
			Network::Tcp6 => "tcp6",
			Network::Udp => "udp",
			Network::Udp4 => "udp4",
			Network::Udp6 => "udp6",
		}
	}

	pub fn is_udp(self) -> bool {
		matches!(self, Network::Udp | Network::Udp4 | Network::Udp6)
	}

	fn check_family(self, ip: IpAddr) -> bool {
		match self {
			Network::Tcp4 | Network::Udp4 => ip.is_ipv4(),
			Network::Tcp6 | Network::Udp6 => ip.is_ipv6(),
			_ => true,
		}
	}
}

pub enum DialedConn {
	Stream(MeasuringConn<TcpStream>),
	Datagram(MeasuringUdpSocket),
}

impl DialedConn {
	pub fn conn_id(&self) -> ConnId {
		match self {
			DialedConn::Stream(c) => c.conn_id(),
			DialedConn::Datagram(c) => c.conn_id(),
		}
	}
}

/// Connects to a single, already-resolved `(ip, port)` pair. Never performs DNS lookups --
/// that's the resolver's job, a layer up. Holds only the id counters needed to allocate a
/// fresh `ConnId` per successful connect; callers supply everything else via the
/// `RequestContext`.
#[derive(Clone, Debug, Default)]
pub struct DialerBase {
	pub include_data: bool,
	byte_counters: Option<Arc<ByteCounters>>,
}

impl DialerBase {
	pub fn new(include_data: bool) -> Self {
		DialerBase { include_data, byte_counters: None }
	}

	/// Folds every connection this base creates into `counters` as well as its own
	/// per-connection byte counts, so a dialer that owns several of these bases (plain and
	/// TLS) can report one aggregate total.
	pub fn with_byte_counters(mut self, counters: Arc<ByteCounters>) -> Self {
		self.byte_counters = Some(counters);
		self
	}

	/// Performs a single connect attempt, honoring the context's cancellation/deadline and
	/// `timeout` (whichever elapses first), and emits exactly one `Connect` event.
	pub async fn dial_host_port(
		&self,
		ctx: &RequestContext,
		ids: &IdCounters,
		network: Network,
		ip: IpAddr,
		port: u16,
		timeout: Duration,
	) -> Result<DialedConn, ConnectError> {
		assert!(network.check_family(ip), "ip family does not match requested network");
		let address = SocketAddr::new(ip, port);
		let start = ctx.elapsed();

		let attempt = tokio::time::timeout(timeout, async {
			if network.is_udp() {
				let bind_addr = if ip.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
				let socket = UdpSocket::bind(bind_addr).await?;
				socket.connect(address).await?;
				Ok::<_, std::io::Error>(DialTarget::Udp(socket))
			} else {
				let stream = TcpStream::connect(address).await?;
				Ok(DialTarget::Tcp(stream))
			}
		});

		let outcome: Result<DialTarget, ConnectError> = match ctx.race(attempt).await {
			None => Err(ConnectError::Timeout { address }),
			Some(Err(_elapsed)) => Err(ConnectError::Timeout { address }),
			Some(Ok(Err(source))) => Err(ConnectError::Io { address, source }),
			Some(Ok(Ok(target))) => Ok(target),
		};
		let duration = ctx.elapsed().saturating_sub(start);

		let conn_id = outcome.is_ok().then(|| ids.next_conn_id());
		ctx.handler.on_measurement(Measurement::Connect(ConnectEvent {
			conn_id,
			dial_id: ctx.dial_id.expect("dial_id must be set before dialing"),
			network: network.as_str().to_string(),
			address,
			duration,
			error: outcome.as_ref().err().map(|e| e.to_string()),
			time: ctx.elapsed(),
		}));

		let target = outcome?;
		let conn_id = conn_id.expect("Ok outcome always allocates a conn_id above");
		Ok(self.wrap(target, conn_id, ctx))
	}

	fn wrap(&self, target: DialTarget, conn_id: ConnId, ctx: &RequestContext) -> DialedConn {
		match target {
			DialTarget::Tcp(stream) => DialedConn::Stream(MeasuringConn::new(
				stream,
				conn_id,
				ctx.beginning,
				ctx.handler.clone(),
				self.include_data,
				self.byte_counters.clone(),
			)),
			DialTarget::Udp(socket) => DialedConn::Datagram(MeasuringUdpSocket::new(
				socket,
				conn_id,
				ctx.beginning,
				ctx.handler.clone(),
				self.include_data,
				self.byte_counters.clone(),
			)),
		}
	}
}

enum DialTarget {
	Tcp(TcpStream),
	Udp(UdpSocket),
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::handler::{BufferingHandler, NullHandler};
	use std::sync::Arc;
	use tokio::net::TcpListener;

	#[tokio::test]
	async fn dials_successfully_and_emits_connect() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			let _ = listener.accept().await;
		});

		let handler = Arc::new(BufferingHandler::new());
		let ids = IdCounters::new();
		let dial_id = ids.next_dial_id();
		let ctx = RequestContext::new(crate::clock::Beginning::now(), handler.clone())
			.with_dial_id(dial_id);
		let dialer = DialerBase::new(false);

		let conn = dialer
			.dial_host_port(&ctx, &ids, Network::Tcp, addr.ip(), addr.port(), Duration::from_secs(5))
			.await
			.unwrap();
		assert!(matches!(conn, DialedConn::Stream(_)));
		assert_eq!(handler.events_of_kind("connect").len(), 1);
	}

	#[tokio::test]
	async fn connect_failure_emits_connect_with_error() {
		// Port 1 is reserved and nothing listens there on a typical CI sandbox; the
		// connection should be actively refused almost immediately.
		let handler = Arc::new(NullHandler);
		let ids = IdCounters::new();
		let dial_id = ids.next_dial_id();
		let ctx = RequestContext::new(crate::clock::Beginning::now(), handler).with_dial_id(dial_id);
		let dialer = DialerBase::new(false);
		let result = dialer
			.dial_host_port(
				&ctx,
				&ids,
				Network::Tcp,
				"127.0.0.1".parse().unwrap(),
				1,
				Duration::from_secs(2),
			)
			.await;
		assert!(result.is_err());
	}
}
