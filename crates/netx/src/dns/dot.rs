use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::{IdCounters, RequestContext};
use crate::dialer::Network;
use crate::dns::DnsTransport;
use crate::dns::tcp::length_prefixed_round_trip;
use crate::error::DnsError;
use crate::tls::MeasuringTlsDialer;

/// DNS-over-TLS: identical framing to [`crate::dns::tcp::Tcp`], but the connection is a TLS
/// session (no ALPN) with SNI set to the configured server name.
#[derive(Debug)]
pub struct Dot {
	pub server: SocketAddr,
	pub server_name: String,
	pub timeout: Duration,
	tls: MeasuringTlsDialer,
	config: Arc<rustls::ClientConfig>,
}

impl Dot {
	pub fn new(server: SocketAddr, server_name: String, timeout: Duration, include_data: bool) -> Self {
		Dot {
			server,
			server_name,
			timeout,
			tls: MeasuringTlsDialer::new(timeout, timeout, include_data),
			config: crate::tls_config::client_config_without_alpn(),
		}
	}
}

#[async_trait]
impl DnsTransport for Dot {
	async fn round_trip(
		&self,
		ctx: &RequestContext,
		ids: &IdCounters,
		query: &[u8],
	) -> Result<Vec<u8>, DnsError> {
		let mut stream = self
			.tls
			.dial_tls(
				ctx,
				ids,
				Network::Tcp,
				self.server.ip(),
				self.server.port(),
				&self.server_name,
				self.config.clone(),
			)
			.await
			.map_err(|e| DnsError::Transport(std::io::Error::other(e.to_string())))?;

		let fut = length_prefixed_round_trip(&mut stream, query);
		let timed = tokio::time::timeout(self.timeout, fut);
		ctx
			.race(timed)
			.await
			.ok_or(DnsError::Timeout)?
			.map_err(|_| DnsError::Timeout)?
			.map_err(DnsError::Transport)
	}
}
