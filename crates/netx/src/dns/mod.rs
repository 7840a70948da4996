//! DNS transports and the OONI-style resolver built on top of them (§4.4/§4.5 of the
//! design doc).

pub mod dot;
pub mod doh;
pub mod message;
pub mod resolver;
pub mod tcp;
pub mod udp;

use async_trait::async_trait;

use crate::clock::{IdCounters, RequestContext};
use crate::error::DnsError;

/// One query/reply round trip over a concrete wire protocol. Implementations never emit
/// `DnsQuery`/`DnsReply` themselves -- the resolver does, so the choice of transport stays
/// transparent to it.
#[async_trait]
pub trait DnsTransport: Send + Sync + std::fmt::Debug {
	async fn round_trip(
		&self,
		ctx: &RequestContext,
		ids: &IdCounters,
		query: &[u8],
	) -> Result<Vec<u8>, DnsError>;
}
