//! The tagged event type delivered to every [`EventHandler`](crate::handler::EventHandler)
//! and its payloads (§3 of the design doc).

use std::net::SocketAddr;
use std::time::Duration;

use http::{HeaderMap, Method, StatusCode};
use serde::Serialize;

use crate::clock::{ConnId, DialId, TransactionId};

/// A single observable step of a transaction, stamped with the duration since the
/// client's `Beginning`. Exactly one variant's payload is populated per event -- this
/// mirrors the Go source's tagged struct (`Measurement` with one non-nil field) as a
/// proper Rust enum instead.
#[derive(Debug, Clone, Serialize)]
#[non_exhaustive]
pub enum Measurement {
	Resolve(ResolveEvent),
	DnsQuery(DnsQueryEvent),
	DnsReply(DnsReplyEvent),
	Connect(ConnectEvent),
	Read(ReadWriteEvent),
	Write(ReadWriteEvent),
	ReadFrom(DatagramEvent),
	WriteTo(DatagramEvent),
	Close(CloseEvent),
	TlsHandshake(TlsHandshakeEvent),
	HttpConnectionReady(HttpConnectionReadyEvent),
	HttpRequestHeadersDone(HttpRequestHeadersDoneEvent),
	HttpRequestDone(HttpRequestDoneEvent),
	HttpResponseStart(HttpResponseStartEvent),
	HttpResponseHeadersDone(HttpResponseHeadersDoneEvent),
	HttpResponseBodyPart(HttpResponseBodyPartEvent),
	HttpResponseDone(HttpResponseDoneEvent),
	Extension(ExtensionEvent),
}

impl Measurement {
	/// Short, stable name for log lines and test assertions -- avoids a giant `match` at
	/// every call site that just wants to know "what kind of event was this".
	pub fn kind(&self) -> &'static str {
		match self {
			Measurement::Resolve(_) => "resolve",
			Measurement::DnsQuery(_) => "dns_query",
			Measurement::DnsReply(_) => "dns_reply",
			Measurement::Connect(_) => "connect",
			Measurement::Read(_) => "read",
			Measurement::Write(_) => "write",
			Measurement::ReadFrom(_) => "read_from",
			Measurement::WriteTo(_) => "write_to",
			Measurement::Close(_) => "close",
			Measurement::TlsHandshake(_) => "tls_handshake",
			Measurement::HttpConnectionReady(_) => "http_connection_ready",
			Measurement::HttpRequestHeadersDone(_) => "http_request_headers_done",
			Measurement::HttpRequestDone(_) => "http_request_done",
			Measurement::HttpResponseStart(_) => "http_response_start",
			Measurement::HttpResponseHeadersDone(_) => "http_response_headers_done",
			Measurement::HttpResponseBodyPart(_) => "http_response_body_part",
			Measurement::HttpResponseDone(_) => "http_response_done",
			Measurement::Extension(_) => "extension",
		}
	}

	pub fn transaction_id(&self) -> Option<TransactionId> {
		match self {
			Measurement::HttpConnectionReady(e) => Some(e.transaction_id),
			Measurement::HttpRequestHeadersDone(e) => Some(e.transaction_id),
			Measurement::HttpRequestDone(e) => Some(e.transaction_id),
			Measurement::HttpResponseStart(e) => Some(e.transaction_id),
			Measurement::HttpResponseHeadersDone(e) => Some(e.transaction_id),
			Measurement::HttpResponseBodyPart(e) => Some(e.transaction_id),
			Measurement::HttpResponseDone(e) => Some(e.transaction_id),
			_ => None,
		}
	}
}

fn serialize_headers<S: serde::Serializer>(h: &HeaderMap, s: S) -> Result<S::Ok, S::Error> {
	use serde::ser::SerializeMap;
	let mut map = s.serialize_map(Some(h.len()))?;
	for (k, v) in h.iter() {
		map.serialize_entry(k.as_str(), v.to_str().unwrap_or(""))?;
	}
	map.end()
}

fn serialize_error<S: serde::Serializer>(
	e: &Option<String>,
	s: S,
) -> Result<S::Ok, S::Error> {
	s.serialize_str(e.as_deref().unwrap_or(""))
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolveEvent {
	pub dial_id: DialId,
	pub hostname: String,
	pub addresses: Vec<std::net::IpAddr>,
	pub duration: Duration,
	pub error: Option<String>,
	pub time: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct DnsQueryEvent {
	pub dial_id: DialId,
	pub query_type: DnsQueryType,
	#[serde(with = "hex_bytes")]
	pub raw: Vec<u8>,
	pub time: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct DnsReplyEvent {
	pub dial_id: DialId,
	pub query_type: DnsQueryType,
	#[serde(with = "hex_bytes")]
	pub raw: Vec<u8>,
	pub error: Option<String>,
	pub time: Duration,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
pub enum DnsQueryType {
	A,
	Aaaa,
}

mod hex_bytes {
	pub fn serialize<S: serde::Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
		s.serialize_str(&v.iter().map(|b| format!("{b:02x}")).collect::<String>())
	}
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectEvent {
	pub conn_id: Option<ConnId>,
	pub dial_id: DialId,
	pub network: String,
	pub address: SocketAddr,
	pub duration: Duration,
	pub error: Option<String>,
	pub time: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadWriteEvent {
	pub conn_id: ConnId,
	pub num_bytes: usize,
	pub duration: Duration,
	#[serde(with = "hex_bytes_opt")]
	pub data: Option<Vec<u8>>,
	pub error: Option<String>,
	pub time: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatagramEvent {
	pub conn_id: ConnId,
	pub num_bytes: usize,
	pub duration: Duration,
	#[serde(with = "hex_bytes_opt")]
	pub data: Option<Vec<u8>>,
	pub src_address: Option<SocketAddr>,
	pub dest_address: Option<SocketAddr>,
	pub error: Option<String>,
	pub time: Duration,
}

mod hex_bytes_opt {
	pub fn serialize<S: serde::Serializer>(v: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
		match v {
			Some(v) => s.serialize_str(&v.iter().map(|b| format!("{b:02x}")).collect::<String>()),
			None => s.serialize_none(),
		}
	}
}

#[derive(Debug, Clone, Serialize)]
pub struct CloseEvent {
	pub conn_id: ConnId,
	pub duration: Duration,
	pub error: Option<String>,
	pub time: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct TlsHandshakeEvent {
	pub conn_id: Option<ConnId>,
	pub server_name: String,
	pub next_protos: Vec<String>,
	pub duration: Duration,
	pub cipher_suite: Option<String>,
	pub version: Option<String>,
	pub negotiated_protocol: Option<String>,
	#[serde(skip)]
	pub peer_certificates: Vec<Vec<u8>>,
	pub error: Option<String>,
	pub time: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct HttpConnectionReadyEvent {
	pub transaction_id: TransactionId,
	pub local_address: SocketAddr,
	pub remote_address: SocketAddr,
	pub network: String,
	pub time: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct HttpRequestHeadersDoneEvent {
	pub transaction_id: TransactionId,
	#[serde(with = "method_str")]
	pub method: Method,
	pub url: String,
	#[serde(serialize_with = "serialize_headers")]
	pub headers: HeaderMap,
	pub time: Duration,
}

mod method_str {
	use http::Method;
	pub fn serialize<S: serde::Serializer>(v: &Method, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_str(v.as_str())
	}
}

#[derive(Debug, Clone, Serialize)]
pub struct HttpRequestDoneEvent {
	pub transaction_id: TransactionId,
	#[serde(serialize_with = "serialize_error")]
	pub error: Option<String>,
	pub time: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct HttpResponseStartEvent {
	pub transaction_id: TransactionId,
	pub time: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct HttpResponseHeadersDoneEvent {
	pub transaction_id: TransactionId,
	#[serde(with = "status_u16")]
	pub status_code: StatusCode,
	#[serde(serialize_with = "serialize_headers")]
	pub headers: HeaderMap,
	pub time: Duration,
}

mod status_u16 {
	use http::StatusCode;
	pub fn serialize<S: serde::Serializer>(v: &StatusCode, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_u16(v.as_u16())
	}
}

#[derive(Debug, Clone, Serialize)]
pub struct HttpResponseBodyPartEvent {
	pub transaction_id: TransactionId,
	pub num_bytes: usize,
	pub duration: Duration,
	#[serde(with = "hex_bytes_opt")]
	pub data: Option<Vec<u8>>,
	pub error: Option<String>,
	pub time: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct HttpResponseDoneEvent {
	pub transaction_id: TransactionId,
	#[serde(serialize_with = "serialize_error")]
	pub error: Option<String>,
	pub time: Duration,
}

/// Open-ended payload so adapters (e.g. a downstream probe implementation) can inject
/// their own measurements onto the same handler without the core needing to know about
/// them.
#[derive(Debug, Clone, Serialize)]
pub struct ExtensionEvent {
	pub name: String,
	pub payload: serde_json::Value,
	pub time: Duration,
}
