//! Wire encode/decode for DNS queries and replies, built entirely on `hickory-proto` (the
//! third-party DNS codec the crate depends on rather than reimplementing -- see §1 of the
//! design doc).

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use std::net::IpAddr;

use crate::error::ResolverProtocolError;
use crate::measurement::DnsQueryType;

impl DnsQueryType {
	fn record_type(self) -> RecordType {
		match self {
			DnsQueryType::A => RecordType::A,
			DnsQueryType::Aaaa => RecordType::AAAA,
		}
	}
}

/// Builds a single-question query message for `hostname`, recursion desired, class IN.
pub fn build_query(id: u16, hostname: &str, qtype: DnsQueryType) -> Result<Vec<u8>, ResolverProtocolError> {
	let name = Name::from_ascii(ensure_fqdn(hostname))
		.map_err(|e| ResolverProtocolError::Encode(e.to_string()))?;
	let mut query = Query::query(name, qtype.record_type());
	query.set_query_class(DNSClass::IN);

	let mut message = Message::new();
	message
		.set_id(id)
		.set_message_type(MessageType::Query)
		.set_op_code(OpCode::Query)
		.set_recursion_desired(true)
		.add_query(query);

	message.to_bytes().map_err(|e| ResolverProtocolError::Encode(e.to_string()))
}

fn ensure_fqdn(hostname: &str) -> String {
	if hostname.ends_with('.') { hostname.to_string() } else { format!("{hostname}.") }
}

/// Parsed view of a decoded reply: just what the resolver needs (addresses, response code).
pub struct ParsedReply {
	pub id: u16,
	pub response_code: ResponseCode,
	pub addresses: Vec<IpAddr>,
}

pub fn parse_reply(bytes: &[u8]) -> Result<ParsedReply, ResolverProtocolError> {
	let message =
		Message::from_bytes(bytes).map_err(|e| ResolverProtocolError::Decode(e.to_string()))?;
	let addresses = message
		.answers()
		.iter()
		.filter_map(|record: &Record| match record.data() {
			RData::A(addr) => Some(IpAddr::V4(addr.0)),
			RData::AAAA(addr) => Some(IpAddr::V6(addr.0)),
			_ => None,
		})
		.collect();
	Ok(ParsedReply { id: message.id(), response_code: message.response_code(), addresses })
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn builds_and_round_trips_a_query_shape() {
		let bytes = build_query(42, "example.com", DnsQueryType::A).unwrap();
		let message = Message::from_bytes(&bytes).unwrap();
		assert_eq!(message.id(), 42);
		assert_eq!(message.queries().len(), 1);
		assert_eq!(message.queries()[0].query_type(), RecordType::A);
	}

	#[test]
	fn ensure_fqdn_appends_trailing_dot() {
		assert_eq!(ensure_fqdn("example.com"), "example.com.");
		assert_eq!(ensure_fqdn("example.com."), "example.com.");
	}
}
