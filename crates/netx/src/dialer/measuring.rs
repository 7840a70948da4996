//! Measuring Dialer, the top of the dial stack (§4.7 of the design doc): resolve, iterate
//! candidate addresses, connect (optionally over TLS), all wrapped in an outer
//! exponential-backoff retry loop.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::SmallRng;
use rand_distr::{Distribution, Normal};

use crate::clock::{IdCounters, RequestContext};
use crate::conn::{ByteCounters, MeasuringConn};
use crate::dialer::{DialedConn, DialerBase, Network};
use crate::dns::resolver::HostResolver;
use crate::error::{ConnectError, DialAttemptError, DialContextTimeout, DialError, ManyConnectFailed};
use crate::measurement::{Measurement, ResolveEvent};
use crate::tls::MeasuringTlsDialer;

/// Socket handed back by [`MeasuringDialer::dial_context`]: either a plain TCP stream or a
/// TLS session, both measured at the wire level.
pub enum Socket {
	Plain(MeasuringConn<tokio::net::TcpStream>),
	Tls(Box<tokio_rustls::client::TlsStream<MeasuringConn<tokio::net::TcpStream>>>),
}

/// Backoff schedule: a fixed list of means, starting at `start`, doubling each step, and
/// capped at `max` (inclusive) -- mirroring the source's `for mean := start; mean <= max;
/// mean *= 2` loop. One attempt is made per entry, so the schedule's length is also the
/// total number of connect attempts `dial_context` will make. Jitter for a given attempt is
/// drawn from `Normal(mean, 0.05 * mean)`, floored at zero.
struct Backoff {
	means: Vec<Duration>,
}

impl Backoff {
	fn new(start: Duration, max: Duration) -> Self {
		let mut means = Vec::new();
		let mut mean = start;
		loop {
			means.push(mean);
			if mean >= max {
				break;
			}
			mean = (mean * 2).min(max);
		}
		Backoff { means }
	}

	fn attempts(&self) -> usize {
		self.means.len()
	}

	/// Jittered sleep duration to wait after the attempt at `index` (0-based) before the
	/// next one, or `None` if `index` is out of range.
	fn sleep_after(&self, index: usize, rng: &mut SmallRng) -> Option<Duration> {
		let mean = *self.means.get(index)?;
		let std_dev = mean.as_secs_f64() * 0.05;
		let normal = Normal::new(mean.as_secs_f64(), std_dev.max(1e-9)).expect("valid normal params");
		let sampled = normal.sample(rng).max(0.0);
		Some(Duration::from_secs_f64(sampled))
	}
}

pub struct MeasuringDialer {
	base: DialerBase,
	tls: MeasuringTlsDialer,
	resolver: Arc<dyn HostResolver>,
	connect_timeout: Duration,
	backoff_start: Duration,
	backoff_max: Duration,
	byte_counters: Arc<ByteCounters>,
}

impl MeasuringDialer {
	pub fn new(
		resolver: Arc<dyn HostResolver>,
		connect_timeout: Duration,
		tls_handshake_timeout: Duration,
		backoff_start: Duration,
		backoff_max: Duration,
		include_data: bool,
	) -> Self {
		let byte_counters = Arc::new(ByteCounters::default());
		MeasuringDialer {
			base: DialerBase::new(include_data).with_byte_counters(byte_counters.clone()),
			tls: MeasuringTlsDialer::new(connect_timeout, tls_handshake_timeout, include_data)
				.with_byte_counters(byte_counters.clone()),
			resolver,
			connect_timeout,
			backoff_start,
			backoff_max,
			byte_counters,
		}
	}

	/// Total bytes read across every connection this dialer has ever established,
	/// mirroring the original's dialer-level `BytesRead` counter.
	pub fn bytes_read(&self) -> u64 {
		self.byte_counters.bytes_read()
	}

	/// Total bytes written across every connection this dialer has ever established.
	pub fn bytes_written(&self) -> u64 {
		self.byte_counters.bytes_written()
	}

	/// Resolves `host:port`, then connects (plain or TLS) with retry/backoff across the
	/// whole resolve+connect bundle. `ids` supplies the `DialId`/`ConnId` counters; the
	/// returned context will have carried a fresh `DialId` throughout.
	pub async fn dial_context(
		&self,
		ctx: &RequestContext,
		ids: &IdCounters,
		network: Network,
		host: &str,
		port: u16,
		tls_config: Option<Arc<rustls::ClientConfig>>,
	) -> Result<Socket, DialError> {
		let dial_id = ids.next_dial_id();
		let ctx = ctx.clone().with_dial_id(dial_id);

		let mut rng = SmallRng::from_os_rng();
		let backoff = Backoff::new(self.backoff_start, self.backoff_max);
		let mut attempts: Vec<DialAttemptError> = Vec::new();

		for attempt_index in 0..backoff.attempts() {
			if ctx.is_cancelled() {
				return Err(DialError::Cancelled);
			}

			let addresses = match self.resolve(&ctx, ids, host).await {
				Ok(addresses) => addresses,
				Err(dns_err) => {
					attempts.push(DialAttemptError::Dns(
						// `resolve` only ever returns `DialError::Dns`; unwrap that
						// layer back out so it can be recorded per-attempt.
						match dns_err {
							DialError::Dns(e) => e,
							other => return Err(other),
						},
					));
					if !self.sleep_before_retry(&backoff, attempt_index, &ctx, &mut rng, &mut attempts).await {
						return Err(DialContextTimeout { attempts: attempts.len(), errors: attempts }.into());
					}
					continue;
				},
			};

			match self
				.try_connect_any(&ctx, ids, network, host, &addresses, port, tls_config.clone())
				.await
			{
				Ok(socket) => return Ok(socket),
				Err(many) => {
					tracing::debug!(dial_id = %dial_id, error = %many, "connect attempt failed, backing off");
					attempts.push(unwrap_connect_failure(many));
					if !self.sleep_before_retry(&backoff, attempt_index, &ctx, &mut rng, &mut attempts).await {
						return Err(DialContextTimeout { attempts: attempts.len(), errors: attempts }.into());
					}
				},
			}
		}

		Err(DialContextTimeout { attempts: attempts.len(), errors: attempts }.into())
	}

	/// Sleeps out the backoff interval before the next scheduled attempt, if there is one
	/// (the schedule's last entry is never followed by a sleep). Respects cancellation,
	/// returning `false` (after recording a [`DialAttemptError::Cancelled`]) if the context
	/// fired first.
	async fn sleep_before_retry(
		&self,
		backoff: &Backoff,
		attempt_index: usize,
		ctx: &RequestContext,
		rng: &mut SmallRng,
		attempts: &mut Vec<DialAttemptError>,
	) -> bool {
		if attempt_index + 1 >= backoff.attempts() {
			return true;
		}
		let sleep = backoff.sleep_after(attempt_index, rng).expect("index within schedule");
		let deadline = tokio::time::Instant::now() + sleep;
		if ctx.race(tokio::time::sleep_until(deadline)).await.is_none() {
			attempts.push(DialAttemptError::Cancelled);
			return false;
		}
		true
	}

	/// Resolves `host` to a list of addresses, emitting the summary `Resolve` event. A
	/// literal IP address skips resolution entirely, per §4.7 step 2.
	async fn resolve(
		&self,
		ctx: &RequestContext,
		ids: &IdCounters,
		host: &str,
	) -> Result<Vec<IpAddr>, DialError> {
		if let Ok(ip) = host.parse::<IpAddr>() {
			return Ok(vec![ip]);
		}

		let start = ctx.elapsed();
		let result = self.resolver.lookup_host(ctx, ids, host).await;
		let duration = ctx.elapsed().saturating_sub(start);

		ctx.handler.on_measurement(Measurement::Resolve(ResolveEvent {
			dial_id: ctx.dial_id.expect("dial_id set in dial_context"),
			hostname: host.to_string(),
			addresses: result.as_ref().cloned().unwrap_or_default(),
			duration,
			error: result.as_ref().err().map(|e| e.to_string()),
			time: ctx.elapsed(),
		}));

		Ok(result?)
	}

	/// Tries every candidate address in order, returning the first success. On total
	/// failure returns the aggregate; callers decide whether to retry.
	async fn try_connect_any(
		&self,
		ctx: &RequestContext,
		ids: &IdCounters,
		network: Network,
		host: &str,
		addresses: &[IpAddr],
		port: u16,
		tls_config: Option<Arc<rustls::ClientConfig>>,
	) -> Result<Socket, ManyConnectFailed> {
		let mut attempts = Vec::new();
		for &ip in addresses {
			let result = match &tls_config {
				Some(cfg) => {
					self
						.tls
						.dial_tls(ctx, ids, network, ip, port, host, cfg.clone())
						.await
						.map(|stream| Socket::Tls(Box::new(stream)))
						.map_err(|e| ConnectError::Io {
							address: SocketAddr::new(ip, port),
							source: std::io::Error::other(e.to_string()),
						})
				},
				None => self
					.base
					.dial_host_port(ctx, ids, network, ip, port, self.connect_timeout)
					.await
					.map(|conn| match conn {
						DialedConn::Stream(s) => Socket::Plain(s),
						DialedConn::Datagram(_) => {
							unreachable!("HTTP/TLS dialing never requests a datagram socket")
						},
					}),
			};
			match result {
				Ok(socket) => return Ok(socket),
				Err(e) => attempts.push(e),
			}
		}
		Err(ManyConnectFailed { attempts })
	}
}

/// Unwraps a single-address failure back to its underlying [`ConnectError`] instead of
/// wrapping it in a one-element [`ManyConnectFailed`], mirroring the source's `len(Errors)
/// == 1` special case in `dialContextDNS`.
fn unwrap_connect_failure(many: ManyConnectFailed) -> DialAttemptError {
	if many.attempts.len() == 1 {
		DialAttemptError::SingleConnect(many.attempts.into_iter().next().expect("len checked above"))
	} else {
		DialAttemptError::Connect(many)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn backoff_schedule_caps_at_max_and_terminates() {
		let mut rng = SmallRng::from_os_rng();
		let backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(4));
		let mut count = 0;
		while backoff.sleep_after(count, &mut rng).is_some() {
			count += 1;
			assert!(count < 100, "backoff schedule did not terminate");
		}
		// 1ms -> 2ms -> 4ms(capped, terminal) = 3 attempts
		assert_eq!(count, 3);
	}

	fn addr() -> SocketAddr {
		"127.0.0.1:0".parse().unwrap()
	}

	#[test]
	fn single_candidate_failure_unwraps_to_single_connect() {
		let many = ManyConnectFailed { attempts: vec![ConnectError::Timeout { address: addr() }] };
		assert!(matches!(unwrap_connect_failure(many), DialAttemptError::SingleConnect(_)));
	}

	#[test]
	fn multiple_candidate_failures_stay_wrapped() {
		let many = ManyConnectFailed {
			attempts: vec![
				ConnectError::Timeout { address: addr() },
				ConnectError::Timeout { address: addr() },
			],
		};
		assert!(matches!(unwrap_connect_failure(many), DialAttemptError::Connect(_)));
	}
}
