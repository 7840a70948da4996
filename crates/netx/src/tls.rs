//! Measuring TLS Dialer (§4.6 of the design doc): dials (or wraps) a stream, performs a
//! rustls handshake against an arbitrary host/port with an injected `ClientConfig`, and
//! emits a `TlsHandshake` event.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls_pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::clock::{IdCounters, RequestContext};
use crate::conn::{ByteCounters, MeasuringConn};
use crate::dialer::{DialedConn, DialerBase, Network};
use crate::error::TlsHandshakeError;
use crate::measurement::{Measurement, TlsHandshakeEvent};

#[derive(Clone, Debug)]
pub struct MeasuringTlsDialer {
	dialer: DialerBase,
	connect_timeout: Duration,
	handshake_timeout: Duration,
}

impl MeasuringTlsDialer {
	pub fn new(connect_timeout: Duration, handshake_timeout: Duration, include_data: bool) -> Self {
		MeasuringTlsDialer { dialer: DialerBase::new(include_data), connect_timeout, handshake_timeout }
	}

	/// Folds the raw (pre-TLS) TCP connections this dialer establishes into `counters`,
	/// same as [`crate::dialer::DialerBase::with_byte_counters`].
	pub fn with_byte_counters(mut self, counters: Arc<ByteCounters>) -> Self {
		self.dialer = self.dialer.with_byte_counters(counters);
		self
	}

	/// Dials a fresh TCP connection to `ip:port` and performs a TLS handshake over it with
	/// SNI set to `host` (unless `config` already carries an override via the caller). Never
	/// retries -- that's the top dialer's job.
	pub async fn dial_tls(
		&self,
		ctx: &RequestContext,
		ids: &IdCounters,
		network: Network,
		ip: IpAddr,
		port: u16,
		host: &str,
		config: Arc<rustls::ClientConfig>,
	) -> Result<TlsStream<MeasuringConn<TcpStream>>, TlsHandshakeError> {
		let conn = self
			.dialer
			.dial_host_port(ctx, ids, network, ip, port, self.connect_timeout)
			.await
			.map_err(|e| TlsHandshakeError::Handshake(std::io::Error::other(e.to_string())))?;
		let DialedConn::Stream(tcp) = conn else {
			unreachable!("TLS always dials a byte stream")
		};
		let conn_id = tcp.conn_id();
		let server_name = build_server_name(host, ip)
			.map_err(|_| TlsHandshakeError::InvalidServerName(host.to_string()))?;
		self.handshake_over(ctx, Some(conn_id), tcp, host, server_name, config).await
	}

	/// Performs a TLS handshake over an already-established stream, e.g. one that came out
	/// of a proxy `CONNECT` tunnel rather than a fresh dial. `conn_id` is whatever identifies
	/// the underlying connection for event correlation, if one has already been allocated.
	pub async fn handshake_over<S>(
		&self,
		ctx: &RequestContext,
		conn_id: Option<crate::clock::ConnId>,
		stream: S,
		host: &str,
		server_name: ServerName<'static>,
		config: Arc<rustls::ClientConfig>,
	) -> Result<TlsStream<S>, TlsHandshakeError>
	where
		S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
	{
		let next_protos: Vec<String> = config
			.alpn_protocols
			.iter()
			.map(|p| String::from_utf8_lossy(p).to_string())
			.collect();

		let start = ctx.elapsed();
		let handshake = TlsConnector::from(config).connect(server_name.clone(), stream);
		let timed = tokio::time::timeout(self.handshake_timeout, handshake);

		let result = ctx.race(timed).await;
		let duration = ctx.elapsed().saturating_sub(start);

		let stream = match result {
			None => return Err(TlsHandshakeError::Timeout),
			Some(Err(_elapsed)) => {
				self.emit_failure(ctx, conn_id, host, &next_protos, duration, "tls handshake timed out");
				return Err(TlsHandshakeError::Timeout);
			},
			Some(Ok(Err(e))) => {
				self.emit_failure(ctx, conn_id, host, &next_protos, duration, &e.to_string());
				return Err(TlsHandshakeError::Handshake(e));
			},
			Some(Ok(Ok(stream))) => stream,
		};

		let (_, session) = stream.get_ref();
		let cipher_suite = session.negotiated_cipher_suite().map(|cs| format!("{cs:?}"));
		let version = session.protocol_version().map(|v| format!("{v:?}"));
		let negotiated_protocol =
			session.alpn_protocol().map(|p| String::from_utf8_lossy(p).to_string());
		let peer_certificates = session
			.peer_certificates()
			.map(|certs| certs.iter().map(|c| c.as_ref().to_vec()).collect())
			.unwrap_or_default();

		ctx.handler.on_measurement(Measurement::TlsHandshake(TlsHandshakeEvent {
			conn_id,
			server_name: host.to_string(),
			next_protos,
			duration,
			cipher_suite,
			version,
			negotiated_protocol,
			peer_certificates,
			error: None,
			time: ctx.elapsed(),
		}));

		Ok(stream)
	}

	fn emit_failure(
		&self,
		ctx: &RequestContext,
		conn_id: Option<crate::clock::ConnId>,
		host: &str,
		next_protos: &[String],
		duration: Duration,
		error: &str,
	) {
		ctx.handler.on_measurement(Measurement::TlsHandshake(TlsHandshakeEvent {
			conn_id,
			server_name: host.to_string(),
			next_protos: next_protos.to_vec(),
			duration,
			cipher_suite: None,
			version: None,
			negotiated_protocol: None,
			peer_certificates: Vec::new(),
			error: Some(error.to_string()),
			time: ctx.elapsed(),
		}));
	}
}

fn build_server_name(
	host: &str,
	ip: IpAddr,
) -> Result<ServerName<'static>, rustls_pki_types::InvalidDnsNameError> {
	if host.is_empty() {
		return Ok(ServerName::IpAddress(ip.into()));
	}
	server_name_for_host(host)
}

/// Builds a [`ServerName`] from a host string with no fallback IP -- for callers (e.g. the
/// client facade's proxy `CONNECT` path) that only know the target by name.
pub(crate) fn server_name_for_host(host: &str) -> Result<ServerName<'static>, rustls_pki_types::InvalidDnsNameError> {
	match host.parse::<IpAddr>() {
		Ok(ip) => Ok(ServerName::IpAddress(ip.into())),
		Err(_) => Ok(ServerName::DnsName(rustls_pki_types::DnsName::try_from(host.to_string())?)),
	}
}
