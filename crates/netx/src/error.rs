//! Error taxonomy (§4.2 of the design doc). Every fallible operation in the stack returns
//! one of these instead of `anyhow::Error` so callers can classify failures (timeout vs.
//! temporary vs. terminal) without string matching.

use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DnsError {
	#[error("dns query timed out")]
	Timeout,
	/// Both A and AAAA queries came back `NOERROR` but carried zero address records --
	/// distinct from [`DnsError::NoAddresses`], which covers the system resolver (no
	/// per-query-type visibility to know whether the server replied at all).
	#[error("no answer received for {hostname}")]
	NoAnswer { hostname: String },
	#[error("dns transport error: {0}")]
	Transport(#[source] std::io::Error),
	#[error("malformed dns message: {0}")]
	Protocol(#[from] ResolverProtocolError),
	#[error("resolver returned no addresses for {hostname}")]
	NoAddresses { hostname: String },
}

impl DnsError {
	pub fn is_timeout(&self) -> bool {
		matches!(self, DnsError::Timeout)
	}

	pub fn is_temporary(&self) -> bool {
		matches!(self, DnsError::Timeout | DnsError::Transport(_))
	}
}

#[derive(Debug, Error)]
pub enum ResolverProtocolError {
	#[error("failed to encode dns query: {0}")]
	Encode(String),
	#[error("failed to decode dns reply: {0}")]
	Decode(String),
	#[error("dns reply id {got} did not match query id {expected}")]
	IdMismatch { expected: u16, got: u16 },
	#[error("dns server replied with rcode {0}")]
	ServerError(String),
}

#[derive(Debug, Error)]
pub enum ConnectError {
	#[error("connect to {address} timed out")]
	Timeout { address: SocketAddr },
	#[error("connect to {address} failed: {source}")]
	Io { address: SocketAddr, #[source] source: std::io::Error },
}

impl ConnectError {
	pub fn is_timeout(&self) -> bool {
		matches!(self, ConnectError::Timeout { .. })
	}

	pub fn is_temporary(&self) -> bool {
		// Connection refused/reset are treated as temporary: a retry against another
		// address (or the same one, after backoff) may succeed.
		match self {
			ConnectError::Timeout { .. } => true,
			ConnectError::Io { source, .. } => matches!(
				source.kind(),
				std::io::ErrorKind::ConnectionRefused
					| std::io::ErrorKind::ConnectionReset
					| std::io::ErrorKind::TimedOut
			),
		}
	}

	pub fn address(&self) -> SocketAddr {
		match self {
			ConnectError::Timeout { address } | ConnectError::Io { address, .. } => *address,
		}
	}
}

/// All attempts in a dial's address list failed. Preserves one error per address so
/// callers can see exactly why each candidate was rejected, mirroring the source's
/// dial errors accumulated across retries against resolved addresses.
#[derive(Debug, Error)]
#[error("all {} connection attempts failed: {}", .attempts.len(), summarize(.attempts))]
pub struct ManyConnectFailed {
	pub attempts: Vec<ConnectError>,
}

impl ManyConnectFailed {
	/// True if every failed attempt timed out rather than being actively refused/reset.
	pub fn is_timeout(&self) -> bool {
		!self.attempts.is_empty() && self.attempts.iter().all(ConnectError::is_timeout)
	}

	/// True if at least one attempt failed in a way a caller might reasonably retry.
	pub fn is_temporary(&self) -> bool {
		self.attempts.iter().any(ConnectError::is_temporary)
	}
}

fn summarize(attempts: &[ConnectError]) -> String {
	attempts.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
}

/// Aggregate across every attempt of the outer backoff loop (§4.7 step 4). Preserves one
/// `ManyConnectFailed` (or DNS failure) per attempt so callers can see how many rounds were
/// tried and why each one failed.
#[derive(Debug, Error)]
#[error("dial context timed out after {attempts} attempt(s): {}", summarize_attempts(.errors))]
pub struct DialContextTimeout {
	pub attempts: usize,
	pub errors: Vec<DialAttemptError>,
}

impl DialContextTimeout {
	/// Always `true`: exhausting the outer retry/backoff loop is itself a timeout.
	pub fn is_timeout(&self) -> bool {
		true
	}

	/// True if a retry might plausibly succeed -- i.e. every attempt failed for a
	/// temporary reason rather than, say, a DNS hard failure (NXDOMAIN).
	pub fn is_temporary(&self) -> bool {
		self.errors.iter().any(|e| match e {
			DialAttemptError::Connect(many) => many.is_temporary(),
			DialAttemptError::SingleConnect(single) => single.is_temporary(),
			DialAttemptError::Dns(dns) => dns.is_temporary(),
			DialAttemptError::Cancelled => false,
		})
	}
}

fn summarize_attempts(errors: &[DialAttemptError]) -> String {
	errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
}

/// One failed attempt inside [`DialContextTimeout`]: either the whole bundle failed to
/// connect, a single address was tried and failed, or the loop was aborted by cancellation
/// before another attempt could start.
#[derive(Debug, Error)]
pub enum DialAttemptError {
	#[error(transparent)]
	Connect(#[from] ManyConnectFailed),
	/// The address list held exactly one candidate, so its failure is reported directly
	/// rather than wrapped in a one-element [`ManyConnectFailed`] -- mirrors the source's
	/// `len(Errors) == 1` unwrap in `dialContextDNS`.
	#[error(transparent)]
	SingleConnect(ConnectError),
	#[error(transparent)]
	Dns(#[from] DnsError),
	#[error("context cancelled during backoff sleep")]
	Cancelled,
}

#[derive(Debug, Error)]
pub enum DialError {
	#[error(transparent)]
	ContextTimeout(#[from] DialContextTimeout),
	#[error(transparent)]
	Dns(#[from] DnsError),
	#[error(transparent)]
	Connect(#[from] ManyConnectFailed),
	#[error("dial was cancelled")]
	Cancelled,
}

impl DialError {
	pub fn is_timeout(&self) -> bool {
		match self {
			DialError::ContextTimeout(e) => e.is_timeout(),
			DialError::Dns(e) => e.is_timeout(),
			DialError::Connect(_) | DialError::Cancelled => false,
		}
	}

	pub fn is_temporary(&self) -> bool {
		match self {
			DialError::ContextTimeout(e) => e.is_temporary(),
			DialError::Connect(e) => e.is_temporary(),
			DialError::Dns(e) => e.is_temporary(),
			DialError::Cancelled => false,
		}
	}
}

#[derive(Debug, Error)]
pub enum TlsHandshakeError {
	#[error("tls handshake timed out")]
	Timeout,
	#[error("tls handshake failed: {0}")]
	Handshake(#[source] std::io::Error),
	#[error("invalid server name {0:?}")]
	InvalidServerName(String),
}

impl TlsHandshakeError {
	pub fn is_timeout(&self) -> bool {
		matches!(self, TlsHandshakeError::Timeout)
	}
}

#[derive(Debug, Error)]
pub enum HttpTransportError {
	#[error(transparent)]
	Dial(#[from] DialError),
	#[error(transparent)]
	Tls(#[from] TlsHandshakeError),
	#[error("http handshake failed: {0}")]
	Handshake(String),
	#[error("sending request failed: {0}")]
	Send(String),
	#[error("invalid request: {0}")]
	InvalidRequest(String),
	#[error("request timed out")]
	Timeout,
	#[error("request was cancelled")]
	Cancelled,
	#[error("proxy error: {0}")]
	Proxy(String),
}

impl HttpTransportError {
	pub fn is_timeout(&self) -> bool {
		match self {
			HttpTransportError::Timeout => true,
			HttpTransportError::Dial(e) => e.is_timeout(),
			HttpTransportError::Tls(e) => e.is_timeout(),
			_ => false,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::net::SocketAddr;

	fn addr() -> SocketAddr {
		"127.0.0.1:0".parse().unwrap()
	}

	#[test]
	fn dial_context_timeout_is_always_a_timeout() {
		let err = DialContextTimeout { attempts: 5, errors: Vec::new() };
		assert!(err.is_timeout());
	}

	#[test]
	fn many_connect_failed_is_timeout_only_when_every_attempt_timed_out() {
		let all_timeouts = ManyConnectFailed { attempts: vec![ConnectError::Timeout { address: addr() }] };
		assert!(all_timeouts.is_timeout());

		let mixed = ManyConnectFailed {
			attempts: vec![
				ConnectError::Timeout { address: addr() },
				ConnectError::Io { address: addr(), source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused) },
			],
		};
		assert!(!mixed.is_timeout());
		assert!(mixed.is_temporary());
	}
}
