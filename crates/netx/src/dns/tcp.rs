use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::clock::{IdCounters, RequestContext};
use crate::dialer::{DialedConn, DialerBase, Network};
use crate::dns::DnsTransport;
use crate::error::DnsError;

/// Maximum length-prefixed message size accepted from the wire, well above any legitimate
/// DNS reply (64 KiB is the protocol's own ceiling, since the length prefix is 16 bits).
const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

/// Dials a fresh TCP connection per call and speaks the standard 2-byte big-endian length
/// prefix framing shared by plain DNS-over-TCP and DoT.
#[derive(Debug)]
pub struct Tcp {
	pub server: SocketAddr,
	pub timeout: Duration,
	dialer: DialerBase,
}

impl Tcp {
	pub fn new(server: SocketAddr, timeout: Duration, include_data: bool) -> Self {
		Tcp { server, timeout, dialer: DialerBase::new(include_data) }
	}
}

/// Writes `query` with its 2-byte length prefix, then reads a length-prefixed reply back.
/// Shared by [`Tcp`] and [`crate::dns::dot::Dot`] once the latter has an established
/// (possibly TLS-wrapped) stream.
pub(crate) async fn length_prefixed_round_trip<S>(stream: &mut S, query: &[u8]) -> std::io::Result<Vec<u8>>
where
	S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
	if query.len() > MAX_MESSAGE_SIZE {
		return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, "query too large"));
	}
	let len = (query.len() as u16).to_be_bytes();
	stream.write_all(&len).await?;
	stream.write_all(query).await?;
	stream.flush().await?;

	let mut len_buf = [0u8; 2];
	stream.read_exact(&mut len_buf).await?;
	let reply_len = u16::from_be_bytes(len_buf) as usize;
	let mut reply = vec![0u8; reply_len];
	stream.read_exact(&mut reply).await?;
	Ok(reply)
}

#[async_trait]
impl DnsTransport for Tcp {
	async fn round_trip(
		&self,
		ctx: &RequestContext,
		ids: &IdCounters,
		query: &[u8],
	) -> Result<Vec<u8>, DnsError> {
		let conn = self
			.dialer
			.dial_host_port(ctx, ids, Network::Tcp, self.server.ip(), self.server.port(), self.timeout)
			.await
			.map_err(|e| DnsError::Transport(std::io::Error::other(e.to_string())))?;
		let DialedConn::Stream(mut stream) = conn else {
			unreachable!("Network::Tcp always dials a byte stream")
		};

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
