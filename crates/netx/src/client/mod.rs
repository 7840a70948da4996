//! Client facade (§4.9 of the design doc): composes the clock/handler, the top Measuring
//! Dialer, and the HTTP Transport into a ready-to-use HTTP client with a swappable DNS
//! backend, plus environment-proxy routing with an HTTP `CONNECT` tunnel handshake for
//! HTTPS targets.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use bytes::Bytes;
use http::{Request, Response, Uri};
use http_body_util::Full;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use url::Url;

use crate::clock::{Beginning, IdCounters, RequestContext};
use crate::config::Config;
use crate::dialer::Network;
use crate::dialer::measuring::{MeasuringDialer, Socket};
use crate::dns::doh::Doh;
use crate::dns::dot::Dot;
use crate::dns::resolver::{HostResolver, OoniResolver, SystemResolver};
use crate::dns::tcp::Tcp;
use crate::dns::udp::Udp;
use crate::error::{DnsError, HttpTransportError, TlsHandshakeError};
use crate::handler::EventHandler;
use crate::http::{HttpTransport, ResponseBody};

/// Which DNS backend [`Client::configure_dns`] should switch to. Takes a human-typed
/// address rather than an already-resolved socket address, with default ports injected
/// the way the facade described in the design doc requires.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DnsNetwork {
	/// Delegates to the OS stub resolver, bypassing the OONI resolver entirely.
	System,
	Udp,
	Tcp,
	Dot,
	Doh,
}

#[derive(Debug, Error)]
pub enum ClientError {
	#[error(transparent)]
	Http(#[from] HttpTransportError),
	#[error(transparent)]
	Dns(#[from] DnsError),
	#[error(transparent)]
	Tls(#[from] TlsHandshakeError),
	#[error("invalid url {0:?}: {1}")]
	InvalidUrl(String, String),
	#[error("invalid dns backend address {0:?}: {1}")]
	InvalidDnsAddress(String, String),
}

/// Everything that changes when [`Client::configure_dns`] swaps the resolver: the resolver
/// itself and the dialer/transport built on top of it. Held behind a single `RwLock` so a
/// `do_request` in flight always sees one consistent generation of the three.
struct ClientState {
	dialer: Arc<MeasuringDialer>,
	transport: Arc<HttpTransport>,
}

/// Instrumented HTTP client: wires the clock, event handler, DNS resolver, measuring
/// dialer, and HTTP transport together, and exposes the small surface a caller needs
/// (`get`/`do_request`, `configure_dns`, `close_idle_connections`).
pub struct Client {
	beginning: Beginning,
	handler: Arc<dyn EventHandler>,
	ids: Arc<IdCounters>,
	config: Config,
	proxy_tls: Arc<crate::tls::MeasuringTlsDialer>,
	proxies: ProxyConfig,
	state: RwLock<Arc<ClientState>>,
}

impl Client {
	/// Builds a client using default timeouts/backoff (see [`Config::default`]) and the OS
	/// stub resolver as the initial DNS backend.
	pub fn new(beginning: Beginning, handler: Arc<dyn EventHandler>) -> Result<Self, ClientError> {
		Self::with_config(beginning, handler, Config::default())
	}

	pub fn with_config(beginning: Beginning, handler: Arc<dyn EventHandler>, config: Config) -> Result<Self, ClientError> {
		let ids = Arc::new(IdCounters::new());
		let resolver: Arc<dyn HostResolver> = Arc::new(SystemResolver::new()?);
		let state = build_state(resolver, &config, ids.clone(), beginning, handler.clone());
		let proxy_tls = Arc::new(crate::tls::MeasuringTlsDialer::new(
			config.connect_timeout,
			config.tls_handshake_timeout,
			config.include_data,
		));
		Ok(Client {
			beginning,
			handler,
			ids,
			config,
			proxy_tls,
			proxies: ProxyConfig::from_env(),
			state: RwLock::new(Arc::new(state)),
		})
	}

	/// Switches the active DNS backend. `address` is `host[:port]` for `Udp`/`Tcp`/`Dot`
	/// (a bare hostname is resolved once, synchronously, via the OS resolver, with the
	/// result used for dialing and the original host kept as the TLS server name for `Dot`)
	/// or a full URL for `Doh`. Default ports are injected when absent: 53 for `Udp`/`Tcp`,
	/// 853 for `Dot`.
	pub fn configure_dns(&self, network: DnsNetwork, address: &str) -> Result<(), ClientError> {
		let resolver: Arc<dyn HostResolver> = match network {
			DnsNetwork::System => Arc::new(SystemResolver::new()?),
			DnsNetwork::Udp => {
				let (server, _name) = resolve_config_address(address, 53)?;
				Arc::new(OoniResolver::new(Arc::new(Udp::new(server, self.config.dns_timeout, self.config.include_data))))
			},
			DnsNetwork::Tcp => {
				let (server, _name) = resolve_config_address(address, 53)?;
				Arc::new(OoniResolver::new(Arc::new(Tcp::new(server, self.config.dns_timeout, self.config.include_data))))
			},
			DnsNetwork::Dot => {
				let (server, server_name) = resolve_config_address(address, 853)?;
				Arc::new(OoniResolver::new(Arc::new(Dot::new(
					server,
					server_name,
					self.config.dns_timeout,
					self.config.include_data,
				))))
			},
			DnsNetwork::Doh => {
				let url = Url::parse(address).map_err(|e| ClientError::InvalidUrl(address.to_string(), e.to_string()))?;
				let doh = Doh::new(url, self.config.dns_timeout, self.config.doh_max_reply_bytes, self.config.include_data)?;
				Arc::new(OoniResolver::new(Arc::new(doh)))
			},
		};

		let new_state = build_state(resolver, &self.config, self.ids.clone(), self.beginning, self.handler.clone());
		*self.state.write() = Arc::new(new_state);
		Ok(())
	}

	/// Performs a `GET` request against `url`.
	pub async fn get(&self, url: &str) -> Result<Response<ResponseBody>, ClientError> {
		let uri: Uri = url.parse().map_err(|e: http::uri::InvalidUri| ClientError::InvalidUrl(url.to_string(), e.to_string()))?;
		let req = Request::get(uri)
			.body(Full::new(Bytes::new()))
			.expect("GET with an empty body is always a valid request");
		self.do_request(req).await
	}

	/// Performs `req`, routing through an environment-configured proxy when one applies to
	/// the request's scheme and host. The returned response's body must be consumed or
	/// dropped to release the underlying connection (see §1 Non-goals: no pooling).
	pub async fn do_request(&self, req: Request<Full<Bytes>>) -> Result<Response<ResponseBody>, ClientError> {
		let state = self.state.read().clone();

		let host = req
			.uri()
			.host()
			.ok_or_else(|| ClientError::InvalidUrl(req.uri().to_string(), "request uri has no host".to_string()))?
			.to_string();
		let is_https = req.uri().scheme_str() == Some("https");

		if let Some(proxy) = self.proxies.select(is_https, &host) {
			return self.do_request_via_proxy(&state, proxy, req).await.map_err(Into::into);
		}

		state.transport.do_request(req).await.map_err(Into::into)
	}

	/// No-op: every transaction dials fresh (see §1 Non-goals: no connection pooling).
	/// Kept for API parity with callers migrating from a pooling client.
	pub fn close_idle_connections(&self) {}

	async fn do_request_via_proxy(
		&self,
		state: &ClientState,
		proxy: &Url,
		req: Request<Full<Bytes>>,
	) -> Result<Response<ResponseBody>, HttpTransportError> {
		let proxy_host = proxy.host_str().unwrap_or_default();
		let proxy_port = proxy.port_or_known_default().unwrap_or(80);

		let transaction_id = state.transport.ids().next_transaction_id();
		let ctx = RequestContext::new(self.beginning, self.handler.clone()).with_transaction_id(transaction_id);

		let proxy_socket = state
			.dialer
			.dial_context(&ctx, state.transport.ids(), Network::Tcp, proxy_host, proxy_port, None)
			.await
			.map_err(HttpTransportError::Dial)?;

		let target_host = req.uri().host().unwrap_or_default().to_string();
		let target_port = req.uri().port_u16().unwrap_or(if req.uri().scheme_str() == Some("https") { 443 } else { 80 });

		if req.uri().scheme_str() != Some("https") {
			// Plain HTTP: the proxy speaks to the origin on our behalf, so the request is
			// sent to the proxy as-is (its absolute-form URI already carries scheme+host).
			return state.transport.run_on_socket(&ctx, transaction_id, proxy_socket, req).await;
		}

		let Socket::Plain(mut tunnel) = proxy_socket else {
			unreachable!("dial_context with tls_config=None always returns a plain socket")
		};
		connect_tunnel_handshake(&mut tunnel, &target_host, target_port)
			.await
			.map_err(|e| HttpTransportError::Proxy(e.to_string()))?;

		let server_name = crate::tls::server_name_for_host(&target_host)
			.map_err(|_| HttpTransportError::Tls(TlsHandshakeError::InvalidServerName(target_host.clone())))?;
		let tls_stream = self
			.proxy_tls
			.handshake_over(&ctx, None, tunnel, &target_host, server_name, crate::tls_config::default_client_config())
			.await
			.map_err(HttpTransportError::Tls)?;

		state
			.transport
			.run_on_socket(&ctx, transaction_id, Socket::Tls(Box::new(tls_stream)), req)
			.await
	}
}

fn build_state(
	resolver: Arc<dyn HostResolver>,
	config: &Config,
	ids: Arc<IdCounters>,
	beginning: Beginning,
	handler: Arc<dyn EventHandler>,
) -> ClientState {
	let dialer = Arc::new(MeasuringDialer::new(
		resolver.clone(),
		config.connect_timeout,
		config.tls_handshake_timeout,
		config.backoff_start,
		config.backoff_max,
		config.include_data,
	));
	let transport = Arc::new(HttpTransport::new(dialer.clone(), ids, beginning, handler, config.include_data));
	ClientState { dialer, transport }
}

/// Resolves `address` (`host[:port]`, host may be a literal IP or a hostname) to a
/// `SocketAddr`, falling back to `default_port` when no port is given. Returns the original
/// host string alongside, for use as a TLS server name (`Dot`).
fn resolve_config_address(address: &str, default_port: u16) -> Result<(SocketAddr, String), ClientError> {
	let (host, port) = match address.rsplit_once(':') {
		Some((h, p)) if !h.is_empty() && p.parse::<u16>().is_ok() => (h, p.parse().unwrap()),
		_ => (address, default_port),
	};
	let resolved = (host, port)
		.to_socket_addrs()
		.map_err(|e| ClientError::InvalidDnsAddress(address.to_string(), e.to_string()))?
		.next()
		.ok_or_else(|| ClientError::InvalidDnsAddress(address.to_string(), "no addresses found".to_string()))?;
	Ok((resolved, host.to_string()))
}

/// HTTP `CONNECT` tunnel handshake against a proxy-discovered destination.
async fn connect_tunnel_handshake<S>(conn: &mut S, dest_host: &str, dest_port: u16) -> Result<(), std::io::Error>
where
	S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
	let dest = format!("{dest_host}:{dest_port}");
	let request = format!("CONNECT {dest} HTTP/1.1\r\nHost: {dest}\r\n\r\n");
	conn.write_all(request.as_bytes()).await?;

	let mut buf = [0u8; 8192];
	let mut pos = 0;
	loop {
		let n = conn.read(&mut buf[pos..]).await?;
		if n == 0 {
			return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "proxy closed connection during CONNECT"));
		}
		pos += n;
		let received = &buf[..pos];
		if received.starts_with(b"HTTP/1.1 200") || received.starts_with(b"HTTP/1.0 200") {
			if received.ends_with(b"\r\n\r\n") {
				return Ok(());
			}
			if pos == buf.len() {
				return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "proxy CONNECT response headers too long"));
			}
		} else if received.starts_with(b"HTTP/1.1 407") {
			return Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "proxy requires authentication"));
		} else if pos >= 12 {
			return Err(std::io::Error::new(std::io::ErrorKind::Other, "proxy CONNECT failed"));
		}
	}
}

/// `HTTP_PROXY`/`HTTPS_PROXY`/`NO_PROXY` read once at client construction, per §6 of the
/// design doc. Lowercase and uppercase variants are both honored, matching common practice
/// across HTTP client libraries.
struct ProxyConfig {
	http: Option<Url>,
	https: Option<Url>,
	no_proxy: Vec<String>,
}

impl ProxyConfig {
	fn from_env() -> Self {
		let env = |names: &[&str]| names.iter().find_map(|n| std::env::var(n).ok()).filter(|v| !v.is_empty());
		let parse = |v: Option<String>| v.and_then(|v| Url::parse(&v).ok());
		let no_proxy = env(&["NO_PROXY", "no_proxy"])
			.map(|v| v.split(',').map(|h| h.trim().to_ascii_lowercase()).filter(|h| !h.is_empty()).collect())
			.unwrap_or_default();
		ProxyConfig {
			http: parse(env(&["HTTP_PROXY", "http_proxy"])),
			https: parse(env(&["HTTPS_PROXY", "https_proxy"])),
			no_proxy,
		}
	}

	fn select(&self, is_https: bool, host: &str) -> Option<&Url> {
		if self.no_proxy.iter().any(|n| n == "*" || host.eq_ignore_ascii_case(n) || host.to_ascii_lowercase().ends_with(&format!(".{n}"))) {
			return None;
		}
		if is_https { self.https.as_ref() } else { self.http.as_ref() }
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn resolve_config_address_accepts_literal_ip_with_port() {
		let (addr, host) = resolve_config_address("127.0.0.1:5353", 53).unwrap();
		assert_eq!(addr, "127.0.0.1:5353".parse().unwrap());
		assert_eq!(host, "127.0.0.1");
	}

	#[test]
	fn resolve_config_address_injects_default_port() {
		let (addr, _) = resolve_config_address("127.0.0.1", 853).unwrap();
		assert_eq!(addr.port(), 853);
	}

	#[test]
	fn proxy_config_no_proxy_matches_suffix_and_exact() {
		let cfg = ProxyConfig {
			http: Url::parse("http://proxy.local:8080").ok(),
			https: None,
			no_proxy: vec!["internal.example".to_string()],
		};
		assert!(cfg.select(false, "api.internal.example").is_none());
		assert!(cfg.select(false, "internal.example").is_none());
		assert!(cfg.select(false, "example.com").is_some());
	}

	#[test]
	fn proxy_config_wildcard_disables_all_proxying() {
		let cfg = ProxyConfig {
			http: Url::parse("http://proxy.local:8080").ok(),
			https: Url::parse("http://proxy.local:8080").ok(),
			no_proxy: vec!["*".to_string()],
		};
		assert!(cfg.select(false, "example.com").is_none());
		assert!(cfg.select(true, "example.com").is_none());
	}
}
