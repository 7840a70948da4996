//! Exercises the [`MeasuringTlsDialer`] against an in-process TLS fixture server backed by
//! a freshly generated self-signed certificate: no static testdata files, no real network
//! access, just a loopback listener and a client config that trusts that one certificate.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use assert_matches::assert_matches;
use rcgen::{CertificateParams, KeyPair};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use netx::clock::{Beginning, IdCounters, RequestContext};
use netx::dialer::Network;
use netx::handler::BufferingHandler;
use netx::tls::MeasuringTlsDialer;
use netx::Measurement;

/// A self-signed certificate for "localhost", plus the client-side `RootCertStore` that
/// trusts exactly that certificate -- standing in for the CA bundle a real deployment would
/// use, without pulling in a second CA keypair.
struct TestCert {
	cert_der: CertificateDer<'static>,
	key_der: PrivateKeyDer<'static>,
}

fn generate_self_signed(name: &str) -> TestCert {
	let mut params = CertificateParams::default();
	params.distinguished_name.push(rcgen::DnType::CommonName, name);
	params.subject_alt_names = vec![rcgen::SanType::DnsName(name.to_string().try_into().unwrap())];
	let keypair = KeyPair::generate().unwrap();
	let cert = params.self_signed(&keypair).unwrap();
	let cert_der = CertificateDer::from(cert.der().to_vec());
	let key_pem = keypair.serialize_pem();
	let key_der = rustls_pemfile::private_key(&mut key_pem.as_bytes()).unwrap().unwrap();
	TestCert { cert_der, key_der }
}

fn server_config(cert: &TestCert) -> rustls::ServerConfig {
	let mut config = rustls::ServerConfig::builder()
		.with_no_client_auth()
		.with_single_cert(vec![cert.cert_der.clone()], cert.key_der.clone_key())
		.unwrap();
	config.alpn_protocols = vec![b"http/1.1".to_vec()];
	config
}

fn client_config(cert: &TestCert) -> Arc<rustls::ClientConfig> {
	let mut roots = rustls::RootCertStore::empty();
	roots.add(cert.cert_der.clone()).unwrap();
	let mut config = rustls::ClientConfig::builder()
		.with_root_certificates(roots)
		.with_no_client_auth();
	config.alpn_protocols = vec![b"http/1.1".to_vec()];
	Arc::new(config)
}

/// Spawns a TLS listener that accepts exactly one handshake, writes `greeting` over the
/// encrypted connection, then closes. Returns the address it bound to.
async fn spawn_tls_server(config: rustls::ServerConfig, greeting: &'static [u8]) -> std::net::SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let acceptor = TlsAcceptor::from(Arc::new(config));
	tokio::spawn(async move {
		let Ok((socket, _)) = listener.accept().await else { return };
		let Ok(mut tls) = acceptor.accept(socket).await else { return };
		let _ = tls.write_all(greeting).await;
		let _ = tls.shutdown().await;
	});
	addr
}

fn init_logging() {
	let _ = tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).try_init();
}

#[tokio::test]
async fn dial_tls_against_loopback_server_emits_a_successful_handshake_event() {
	init_logging();
	let cert = generate_self_signed("localhost");
	let addr = spawn_tls_server(server_config(&cert), b"hello over tls").await;

	let handler = Arc::new(BufferingHandler::new());
	let ids = IdCounters::new();
	let ctx = RequestContext::new(Beginning::now(), handler.clone()).with_dial_id(ids.next_dial_id());

	let dialer = MeasuringTlsDialer::new(
		std::time::Duration::from_secs(5),
		std::time::Duration::from_secs(5),
		false,
	);
	let mut stream = dialer
		.dial_tls(&ctx, &ids, Network::Tcp, IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port(), "localhost", client_config(&cert))
		.await
		.unwrap();

	let mut buf = Vec::new();
	stream.read_to_end(&mut buf).await.unwrap();
	assert_eq!(buf, b"hello over tls");

	let events = handler.events_of_kind("tls_handshake");
	assert_eq!(events.len(), 1);
	assert_matches!(&events[0], Measurement::TlsHandshake(e) => {
		assert!(e.error.is_none());
		assert_eq!(e.negotiated_protocol.as_deref(), Some("http/1.1"));
		assert!(!e.peer_certificates.is_empty());
		assert_eq!(e.server_name, "localhost");
	});
}

#[tokio::test]
async fn dial_tls_against_a_server_with_an_untrusted_cert_emits_a_failed_handshake_event() {
	init_logging();
	let server_cert = generate_self_signed("localhost");
	let other_cert = generate_self_signed("localhost");
	let addr = spawn_tls_server(server_config(&server_cert), b"unused").await;

	let handler = Arc::new(BufferingHandler::new());
	let ids = IdCounters::new();
	let ctx = RequestContext::new(Beginning::now(), handler.clone()).with_dial_id(ids.next_dial_id());

	let dialer = MeasuringTlsDialer::new(
		std::time::Duration::from_secs(5),
		std::time::Duration::from_secs(5),
		false,
	);
	// Trusts a different self-signed cert than the one the server actually presents, so the
	// handshake must fail at certificate verification.
	let result = dialer
		.dial_tls(&ctx, &ids, Network::Tcp, IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port(), "localhost", client_config(&other_cert))
		.await;
	assert!(result.is_err());

	let events = handler.events_of_kind("tls_handshake");
	assert_eq!(events.len(), 1);
	assert_matches!(&events[0], Measurement::TlsHandshake(e) => {
		assert!(e.error.is_some());
		assert!(e.peer_certificates.is_empty());
	});
}
