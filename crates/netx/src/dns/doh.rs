//! DNS-over-HTTPS (§4.4 of the design doc): POSTs the wire query to a configured URL and
//! reads the wire reply back from the response body, capped at a configurable size.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http_body_util::{BodyExt, Full, Limited};
use hyper::Request;
use hyper::body::Bytes;
use url::Url;

use crate::clock::{IdCounters, RequestContext};
use crate::dialer::{DialedConn, DialerBase, Network};
use crate::dns::DnsTransport;
use crate::dns::resolver::{HostResolver, SystemResolver};
use crate::error::DnsError;
use crate::tls::MeasuringTlsDialer;

/// DNS-over-HTTPS. The URL's host is resolved with a *separate* resolver -- by default the
/// platform stub resolver, never the `OoniResolver` this transport might itself be backing
/// -- so that configuring `doh` as the active DNS backend can never recurse into itself (see
/// the design doc's "Cyclic reference between DoH and the measuring dialer" note).
#[derive(Debug)]
pub struct Doh {
	pub url: Url,
	pub timeout: Duration,
	pub max_reply_bytes: usize,
	dialer: DialerBase,
	tls: MeasuringTlsDialer,
	host_resolver: Arc<dyn HostResolver>,
}

impl Doh {
	pub fn new(url: Url, timeout: Duration, max_reply_bytes: usize, include_data: bool) -> Result<Self, DnsError> {
		Ok(Doh {
			url,
			timeout,
			max_reply_bytes,
			dialer: DialerBase::new(include_data),
			tls: MeasuringTlsDialer::new(timeout, timeout, include_data),
			host_resolver: Arc::new(SystemResolver::new()?),
		})
	}

	/// Same as [`Doh::new`] but with an explicit resolver for the URL's own host --
	/// primarily so tests can point it at a loopback address without a real DNS lookup.
	pub fn with_resolver(
		url: Url,
		timeout: Duration,
		max_reply_bytes: usize,
		include_data: bool,
		host_resolver: Arc<dyn HostResolver>,
	) -> Self {
		Doh {
			url,
			timeout,
			max_reply_bytes,
			dialer: DialerBase::new(include_data),
			tls: MeasuringTlsDialer::new(timeout, timeout, include_data),
			host_resolver,
		}
	}

	async fn resolve_server_addr(&self, ctx: &RequestContext, ids: &IdCounters) -> Result<std::net::SocketAddr, DnsError> {
		let host = self.url.host_str().ok_or_else(|| {
			DnsError::Transport(std::io::Error::new(std::io::ErrorKind::InvalidInput, "doh url has no host"))
		})?;
		let port = self.url.port_or_known_default().unwrap_or(443);
		if let Ok(ip) = host.parse::<std::net::IpAddr>() {
			return Ok(std::net::SocketAddr::new(ip, port));
		}
		let ip = self
			.host_resolver
			.lookup_host(ctx, ids, host)
			.await?
			.into_iter()
			.next()
			.ok_or_else(|| DnsError::NoAddresses { hostname: host.to_string() })?;
		Ok(std::net::SocketAddr::new(ip, port))
	}
}

#[async_trait]
impl DnsTransport for Doh {
	async fn round_trip(
		&self,
		ctx: &RequestContext,
		ids: &IdCounters,
		query: &[u8],
	) -> Result<Vec<u8>, DnsError> {
		let addr = self.resolve_server_addr(ctx, ids).await?;
		let https = self.url.scheme() == "https";
		let host = self.url.host_str().unwrap_or_default();
		let path = if self.url.query().is_some() {
			format!("{}?{}", self.url.path(), self.url.query().unwrap())
		} else {
			self.url.path().to_string()
		};

		let request = Request::post(path)
			.header("host", host)
			.header("content-type", "application/dns-message")
			.header("accept", "application/dns-message")
			.body(Full::new(Bytes::copy_from_slice(query)))
			.map_err(|e| DnsError::Transport(std::io::Error::other(e.to_string())))?;

		let fut = async {
			let reply = if https {
				let stream = self
					.tls
					.dial_tls(
						ctx,
						ids,
						Network::Tcp,
						addr.ip(),
						addr.port(),
						host,
						crate::tls_config::default_client_config(),
					)
					.await
					.map_err(|e| DnsError::Transport(std::io::Error::other(e.to_string())))?;
				self.send_over(stream, request).await?
			} else {
				let conn = self
					.dialer
					.dial_host_port(ctx, ids, Network::Tcp, addr.ip(), addr.port(), self.timeout)
					.await
					.map_err(|e| DnsError::Transport(std::io::Error::other(e.to_string())))?;
				let DialedConn::Stream(stream) = conn else {
					unreachable!("Network::Tcp always dials a byte stream")
				};
				self.send_over(stream, request).await?
			};
			Ok::<_, DnsError>(reply)
		};

		ctx.race(tokio::time::timeout(self.timeout, fut))
			.await
			.ok_or(DnsError::Timeout)?
			.map_err(|_| DnsError::Timeout)?
	}
}

impl Doh {
	async fn send_over<S>(&self, stream: S, request: Request<Full<Bytes>>) -> Result<Vec<u8>, DnsError>
	where
		S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
	{
		let io = hyper_util::rt::TokioIo::new(stream);
		let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
			.await
			.map_err(|e| DnsError::Transport(std::io::Error::other(e.to_string())))?;
		tokio::spawn(async move {
			let _ = conn.await;
		});
		let response = sender
			.send_request(request)
			.await
			.map_err(|e| DnsError::Transport(std::io::Error::other(e.to_string())))?;
		let body = Limited::new(response.into_body(), self.max_reply_bytes)
			.collect()
			.await
			.map_err(|_| {
				DnsError::Transport(std::io::Error::new(
					std::io::ErrorKind::InvalidData,
					format!("doh reply exceeded {} bytes", self.max_reply_bytes),
				))
			})?
			.to_bytes();
		Ok(body.to_vec())
	}
}
