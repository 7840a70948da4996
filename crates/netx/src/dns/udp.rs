use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::{IdCounters, RequestContext};
use crate::dialer::{DialedConn, DialerBase, Network};
use crate::dns::DnsTransport;
use crate::error::DnsError;

const MAX_DATAGRAM_SIZE: usize = 4096;

/// Dials a fresh UDP socket per call, writes the query as a single datagram, reads one
/// datagram back, and lets the socket close on drop.
#[derive(Debug)]
pub struct Udp {
	pub server: SocketAddr,
	pub timeout: Duration,
	dialer: DialerBase,
}

impl Udp {
	pub fn new(server: SocketAddr, timeout: Duration, include_data: bool) -> Self {
		Udp { server, timeout, dialer: DialerBase::new(include_data) }
	}
}

#[async_trait]
impl DnsTransport for Udp {
	async fn round_trip(
		&self,
		ctx: &RequestContext,
		ids: &IdCounters,
		query: &[u8],
	) -> Result<Vec<u8>, DnsError> {
		let conn = self
			.dialer
			.dial_host_port(ctx, ids, Network::Udp, self.server.ip(), self.server.port(), self.timeout)
			.await
			.map_err(|e| DnsError::Transport(std::io::Error::other(e.to_string())))?;
		let DialedConn::Datagram(socket) = conn else {
			unreachable!("Network::Udp always dials a datagram socket")
		};

		let send = tokio::time::timeout(self.timeout, socket.send_to(query, self.server));
		ctx.race(send).await.ok_or(DnsError::Timeout)?.map_err(|_| DnsError::Timeout)?.map_err(DnsError::Transport)?;

		let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
		let recv = tokio::time::timeout(self.timeout, socket.recv_from(&mut buf));
		let (n, _src) = ctx
			.race(recv)
			.await
			.ok_or(DnsError::Timeout)?
			.map_err(|_| DnsError::Timeout)?
			.map_err(DnsError::Transport)?;
		buf.truncate(n);
		Ok(buf)
	}
}
