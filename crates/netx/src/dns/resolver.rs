//! OONI Resolver (§4.5 of the design doc): issues concurrent A+AAAA queries over a chosen
//! [`DnsTransport`] and merges the results, plus the `System` backend that bypasses all of
//! the above in favor of the OS stub resolver.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::clock::{IdCounters, RequestContext};
use crate::dns::DnsTransport;
use crate::dns::message::{build_query, parse_reply};
use crate::error::{DnsError, ResolverProtocolError};
use crate::measurement::{DnsQueryEvent, DnsQueryType, DnsReplyEvent, Measurement};

/// What the top dialer actually calls: resolve a hostname to a list of addresses. Both the
/// OONI resolver and the system resolver implement this so `configure_dns` can swap between
/// them transparently.
#[async_trait]
pub trait HostResolver: Send + Sync {
	async fn lookup_host(&self, ctx: &RequestContext, ids: &IdCounters, hostname: &str) -> Result<Vec<IpAddr>, DnsError>;
}

/// Issues A and AAAA queries concurrently over an injected [`DnsTransport`], emitting
/// `DnsQuery`/`DnsReply` events around each, and merges their results per §4.5's rule.
pub struct OoniResolver {
	transport: Arc<dyn DnsTransport>,
}

impl OoniResolver {
	pub fn new(transport: Arc<dyn DnsTransport>) -> Self {
		OoniResolver { transport }
	}

	async fn query_one(
		&self,
		ctx: &RequestContext,
		ids: &IdCounters,
		hostname: &str,
		qtype: DnsQueryType,
	) -> Result<Vec<IpAddr>, DnsError> {
		// The DialId already attached to `ctx` doubles as the 16-bit DNS message id.
		// Truncating a 64-bit counter is fine here since only wire-level uniqueness with the
		// matching reply matters, not global uniqueness -- and reusing it (rather than
		// minting a fresh one) keeps the A and AAAA queries of one lookup on the same id,
		// as a packet capture would show for two queries issued under one dial attempt.
		let id = (ctx.dial_id.expect("dial_id must be set before resolving").as_u64() & 0xffff) as u16;
		let query = build_query(id, hostname, qtype)?;

		ctx.handler.on_measurement(Measurement::DnsQuery(DnsQueryEvent {
			dial_id: ctx.dial_id.expect("dial_id must be set before resolving"),
			query_type: qtype,
			raw: query.clone(),
			time: ctx.elapsed(),
		}));

		let reply_bytes = self.transport.round_trip(ctx, ids, &query).await;

		let (raw, outcome): (Vec<u8>, Result<Vec<IpAddr>, DnsError>) = match reply_bytes {
			Ok(bytes) => {
				let outcome = match parse_reply(&bytes) {
					Ok(parsed) if parsed.id != id => {
						Err(ResolverProtocolError::IdMismatch { expected: id, got: parsed.id }.into())
					},
					Ok(parsed) if parsed.response_code != hickory_proto::op::ResponseCode::NoError => {
						Err(ResolverProtocolError::ServerError(format!("{:?}", parsed.response_code)).into())
					},
					Ok(parsed) => Ok(parsed.addresses),
					Err(e) => Err(e.into()),
				};
				(bytes, outcome)
			},
			Err(e) => (Vec::new(), Err(e)),
		};

		ctx.handler.on_measurement(Measurement::DnsReply(DnsReplyEvent {
			dial_id: ctx.dial_id.expect("dial_id must be set before resolving"),
			query_type: qtype,
			raw,
			error: outcome.as_ref().err().map(|e| e.to_string()),
			time: ctx.elapsed(),
		}));

		outcome
	}
}

#[async_trait]
impl HostResolver for OoniResolver {
	async fn lookup_host(&self, ctx: &RequestContext, ids: &IdCounters, hostname: &str) -> Result<Vec<IpAddr>, DnsError> {
		let (a, aaaa) = tokio::join!(
			self.query_one(ctx, ids, hostname, DnsQueryType::A),
			self.query_one(ctx, ids, hostname, DnsQueryType::Aaaa),
		);

		match (a, aaaa) {
			(Ok(mut a_addrs), Ok(aaaa_addrs)) => {
				a_addrs.extend(aaaa_addrs);
				if a_addrs.is_empty() {
					return Err(DnsError::NoAnswer { hostname: hostname.to_string() });
				}
				Ok(a_addrs)
			},
			(Ok(mut a_addrs), Err(_)) if !a_addrs.is_empty() => {
				a_addrs.shrink_to_fit();
				Ok(a_addrs)
			},
			(Err(_), Ok(aaaa_addrs)) if !aaaa_addrs.is_empty() => Ok(aaaa_addrs),
			(Err(e), Err(_)) => Err(e),
			(Err(e), Ok(_)) => Err(e),
			(Ok(_), Err(e)) => Err(e),
		}
	}
}

/// Delegates to `hickory-resolver`'s async stub resolver. Bypasses the OONI resolver (and
/// its events) entirely, as documented in §4.9.
pub struct SystemResolver {
	inner: hickory_resolver::TokioResolver,
}

impl SystemResolver {
	pub fn new() -> Result<Self, DnsError> {
		let inner = hickory_resolver::Resolver::builder_tokio()
			.map_err(|e| DnsError::Transport(std::io::Error::other(e.to_string())))?
			.build();
		Ok(SystemResolver { inner })
	}
}

#[async_trait]
impl HostResolver for SystemResolver {
	async fn lookup_host(&self, _ctx: &RequestContext, _ids: &IdCounters, hostname: &str) -> Result<Vec<IpAddr>, DnsError> {
		let lookup = self
			.inner
			.lookup_ip(hostname)
			.await
			.map_err(|e| DnsError::Transport(std::io::Error::other(e.to_string())))?;
		let addresses: Vec<IpAddr> = lookup.iter().collect();
		if addresses.is_empty() {
			return Err(DnsError::NoAddresses { hostname: hostname.to_string() });
		}
		Ok(addresses)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::clock::Beginning;
	use crate::handler::NullHandler;
	use std::net::Ipv4Addr;
	use std::sync::Mutex;

	/// Canned transport: replies to an A query and an AAAA query with whatever bytes were
	/// registered for each, or fails the round trip if none were.
	#[derive(Debug, Default)]
	struct FakeTransport {
		a_reply: Mutex<Option<Result<Vec<u8>, ()>>>,
		aaaa_reply: Mutex<Option<Result<Vec<u8>, ()>>>,
	}

	impl FakeTransport {
		fn reply_a(bytes: Vec<u8>) -> Self {
			FakeTransport { a_reply: Mutex::new(Some(Ok(bytes))), aaaa_reply: Mutex::new(Some(Err(()))) }
		}

		fn reply_both(a: Vec<u8>, aaaa: Vec<u8>) -> Self {
			FakeTransport { a_reply: Mutex::new(Some(Ok(a))), aaaa_reply: Mutex::new(Some(Ok(aaaa))) }
		}
	}

	#[async_trait]
	impl DnsTransport for FakeTransport {
		async fn round_trip(&self, _ctx: &RequestContext, _ids: &IdCounters, query: &[u8]) -> Result<Vec<u8>, DnsError> {
			let message = hickory_proto::op::Message::from_bytes(query).unwrap();
			let qtype = message.queries()[0].query_type();
			let slot = if qtype == hickory_proto::rr::RecordType::A { &self.a_reply } else { &self.aaaa_reply };
			match slot.lock().unwrap().take() {
				Some(Ok(bytes)) => Ok(bytes),
				_ => Err(DnsError::Transport(std::io::Error::other("no reply registered"))),
			}
		}
	}

	fn reply_with(id: u16, addrs: &[IpAddr]) -> Vec<u8> {
		use hickory_proto::op::{Message, MessageType, OpCode};
		use hickory_proto::rr::{Name, RData, Record, rdata};
		use hickory_proto::serialize::binary::BinEncodable;
		let mut message = Message::new();
		message.set_id(id).set_message_type(MessageType::Response).set_op_code(OpCode::Query);
		let name = Name::from_ascii("example.com.").unwrap();
		for addr in addrs {
			let rdata = match addr {
				IpAddr::V4(v4) => RData::A(rdata::A(*v4)),
				IpAddr::V6(v6) => RData::AAAA(rdata::AAAA(*v6)),
			};
			message.add_answer(Record::from_rdata(name.clone(), 60, rdata));
		}
		message.to_bytes().unwrap()
	}

	fn ctx_and_ids() -> (RequestContext, IdCounters) {
		let ids = IdCounters::new();
		let ctx = RequestContext::new(Beginning::now(), std::sync::Arc::new(NullHandler)).with_dial_id(ids.next_dial_id());
		(ctx, ids)
	}

	#[tokio::test]
	async fn merges_a_and_aaaa_when_both_succeed() {
		let v4 = IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34));
		let v6: IpAddr = "2606:2800:220:1:248:1893:25c8:1946".parse().unwrap();
		// IDs are derived from the dial id's low 16 bits (masked to 0xffff); the first
		// query issued (A) gets dial_id as-is, but both queries share the same dial_id in
		// this resolver, so craft replies with that exact id.
		let (ctx, ids) = ctx_and_ids();
		let id = (ctx.dial_id.unwrap().as_u64() & 0xffff) as u16;
		let resolver = OoniResolver::new(std::sync::Arc::new(FakeTransport::reply_both(
			reply_with(id, &[v4]),
			reply_with(id, &[v6]),
		)));
		let mut addrs = resolver.lookup_host(&ctx, &ids, "example.com").await.unwrap();
		addrs.sort();
		let mut expected = vec![v4, v6];
		expected.sort();
		assert_eq!(addrs, expected);
	}

	#[tokio::test]
	async fn falls_back_to_a_when_aaaa_transport_fails() {
		let v4 = IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34));
		let (ctx, ids) = ctx_and_ids();
		let id = (ctx.dial_id.unwrap().as_u64() & 0xffff) as u16;
		let resolver = OoniResolver::new(std::sync::Arc::new(FakeTransport::reply_a(reply_with(id, &[v4]))));
		let addrs = resolver.lookup_host(&ctx, &ids, "example.com").await.unwrap();
		assert_eq!(addrs, vec![v4]);
	}

	#[tokio::test]
	async fn empty_answers_on_both_queries_is_no_answer() {
		let (ctx, ids) = ctx_and_ids();
		let id = (ctx.dial_id.unwrap().as_u64() & 0xffff) as u16;
		let resolver =
			OoniResolver::new(std::sync::Arc::new(FakeTransport::reply_both(reply_with(id, &[]), reply_with(id, &[]))));
		let err = resolver.lookup_host(&ctx, &ids, "example.com").await.unwrap_err();
		assert!(matches!(err, DnsError::NoAnswer { .. }));
	}
}
