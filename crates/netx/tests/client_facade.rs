//! Exercises the [`Client`] facade: plain-HTTP proxying via `HTTP_PROXY`, and swapping the
//! DNS backend to a local UDP server via `configure_dns`.

use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};

use netx::client::DnsNetwork;
use netx::handler::{BufferingHandler, NullHandler};
use netx::{Beginning, Client, Config};

/// Shrinks the backoff schedule for tests that deliberately exhaust all retry attempts, so
/// the default schedule's ~15s of real sleeping doesn't land in every CI run.
fn fast_retry_config() -> Config {
	let mut config = Config::default();
	config.backoff_start = std::time::Duration::from_millis(1);
	config.backoff_max = std::time::Duration::from_millis(8);
	config.connect_timeout = std::time::Duration::from_millis(200);
	config
}

/// A tiny forward proxy: accepts one connection, and for a plain (non-CONNECT) request
/// forwards the request line verbatim to `origin` and relays the response back untouched.
async fn spawn_plain_proxy(origin: std::net::SocketAddr) -> std::net::SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		let Ok((mut client, _)) = listener.accept().await else { return };
		let mut upstream = tokio::net::TcpStream::connect(origin).await.unwrap();
		let mut buf = [0u8; 8192];
		let n = client.read(&mut buf).await.unwrap();
		upstream.write_all(&buf[..n]).await.unwrap();
		let mut response = Vec::new();
		upstream.read_to_end(&mut response).await.unwrap();
		client.write_all(&response).await.unwrap();
	});
	addr
}

async fn spawn_http_server(response: &'static str) -> std::net::SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		let Ok((mut socket, _)) = listener.accept().await else { return };
		let mut buf = [0u8; 4096];
		let _ = socket.read(&mut buf).await;
		let _ = socket.write_all(response.as_bytes()).await;
		let _ = socket.shutdown().await;
	});
	addr
}

// Environment variables are process-global, so these two tests that touch HTTP_PROXY run
// serialized against each other via this lock rather than risking cross-test interference.
static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[tokio::test]
async fn routes_plain_http_through_env_proxy() {
	let _guard = ENV_LOCK.lock().unwrap();
	let origin = spawn_http_server("HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok").await;
	let proxy = spawn_plain_proxy(origin).await;

	// SAFETY: serialized by ENV_LOCK against every other test that touches HTTP_PROXY.
	unsafe {
		std::env::set_var("HTTP_PROXY", format!("http://{proxy}"));
	}
	let handler = Arc::new(BufferingHandler::new());
	let client = Client::new(Beginning::now(), handler).unwrap();
	let result = client.get(&format!("http://{origin}/")).await;
	unsafe {
		std::env::remove_var("HTTP_PROXY");
	}

	let response = result.unwrap();
	assert_eq!(response.status(), http::StatusCode::OK);
}

#[tokio::test]
async fn no_proxy_wildcard_bypasses_configured_proxy() {
	let _guard = ENV_LOCK.lock().unwrap();
	let origin = spawn_http_server("HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok").await;
	// Point HTTP_PROXY somewhere nothing listens; NO_PROXY=* must keep the client from
	// ever dialing it.
	unsafe {
		std::env::set_var("HTTP_PROXY", "http://127.0.0.1:1");
		std::env::set_var("NO_PROXY", "*");
	}
	let handler = Arc::new(BufferingHandler::new());
	let client = Client::new(Beginning::now(), handler).unwrap();
	let result = client.get(&format!("http://{origin}/")).await;
	unsafe {
		std::env::remove_var("HTTP_PROXY");
		std::env::remove_var("NO_PROXY");
	}

	assert!(result.is_ok());
}

/// Minimal fake DNS-over-UDP server: always answers any query for any name with a single
/// fixed A record, ignoring the question section beyond extracting the transaction id.
async fn spawn_fake_dns_server(answer: Ipv4Addr) -> std::net::SocketAddr {
	let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
	let addr = socket.local_addr().unwrap();
	tokio::spawn(async move {
		let mut buf = [0u8; 512];
		loop {
			let Ok((n, from)) = socket.recv_from(&mut buf).await else { return };
			let query = match hickory_proto::op::Message::from_bytes(&buf[..n]) {
				Ok(m) => m,
				Err(_) => continue,
			};
			use hickory_proto::op::{Message, MessageType, OpCode};
			use hickory_proto::rr::{RData, Record, rdata};
			use hickory_proto::serialize::binary::BinEncodable;
			let mut reply = Message::new();
			reply.set_id(query.id()).set_message_type(MessageType::Response).set_op_code(OpCode::Query);
			if query.queries()[0].query_type() == hickory_proto::rr::RecordType::A {
				reply.add_answer(Record::from_rdata(query.queries()[0].name().clone(), 60, RData::A(rdata::A(answer))));
			}
			let bytes = reply.to_bytes().unwrap();
			let _ = socket.send_to(&bytes, from).await;
		}
	});
	addr
}

#[tokio::test]
async fn configure_dns_udp_switches_resolution_to_the_configured_server() {
	let dns_addr = spawn_fake_dns_server(Ipv4Addr::new(203, 0, 113, 7)).await;
	let origin = spawn_http_server("HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok").await;

	let client = Client::with_config(Beginning::now(), Arc::new(NullHandler), fast_retry_config()).unwrap();
	client.configure_dns(DnsNetwork::Udp, &dns_addr.to_string()).unwrap();

	// Resolving "example.test" through the fake server should yield the fixed address,
	// which nothing is listening on for HTTP -- a connect failure (not a DNS failure)
	// proves the OONI-backed UDP resolver, not the OS resolver, answered the lookup.
	let result = client.get("http://example.test/").await;
	assert!(result.is_err());
	let _ = origin; // keep the origin server alive for the duration of this test
}
