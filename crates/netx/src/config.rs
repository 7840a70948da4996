//! Dialer/resolver timing knobs (§1 "Configuration" of the design doc). Split into
//! `RawConfig`, what deserializes from a config file (every field optional, human-friendly
//! duration strings), and `Config`, what the rest of the crate actually reads (every field
//! populated with its default).

use std::time::Duration;

use netx_core::serde_dur;
use serde::{Deserialize, Serialize};

const DEFAULT_DNS_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_DOH_MAX_REPLY_BYTES: usize = 8 * 1024;
const DEFAULT_BACKOFF_START: Duration = Duration::from_millis(500);
const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(8);

/// On-disk/user-facing form: every field optional so a config file only needs to set what
/// it wants to override.
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawConfig {
	#[serde(default, with = "serde_dur::option")]
	pub dns_timeout: Option<Duration>,
	#[serde(default, with = "serde_dur::option")]
	pub connect_timeout: Option<Duration>,
	#[serde(default, with = "serde_dur::option")]
	pub tls_handshake_timeout: Option<Duration>,
	#[serde(default)]
	pub doh_max_reply_bytes: Option<usize>,
	#[serde(default, with = "serde_dur::option")]
	pub backoff_start: Option<Duration>,
	#[serde(default, with = "serde_dur::option")]
	pub backoff_max: Option<Duration>,
	/// Populate the `data` field on byte-level events (`Read`/`Write`/body parts). Off by
	/// default: most deployments only want sizes/durations, and copying every buffer is
	/// wasted work and memory for them.
	#[serde(default)]
	pub include_data: Option<bool>,
}

impl RawConfig {
	pub fn build(self) -> Config {
		Config {
			dns_timeout: self.dns_timeout.unwrap_or(DEFAULT_DNS_TIMEOUT),
			connect_timeout: self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
			tls_handshake_timeout: self
				.tls_handshake_timeout
				.unwrap_or(DEFAULT_TLS_HANDSHAKE_TIMEOUT),
			doh_max_reply_bytes: self.doh_max_reply_bytes.unwrap_or(DEFAULT_DOH_MAX_REPLY_BYTES),
			backoff_start: self.backoff_start.unwrap_or(DEFAULT_BACKOFF_START),
			backoff_max: self.backoff_max.unwrap_or(DEFAULT_BACKOFF_MAX),
			include_data: self.include_data.unwrap_or(false),
		}
	}
}

/// Fully resolved configuration, every field populated. What the rest of the crate reads.
#[derive(Serialize, Clone, Copy, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Config {
	#[serde(with = "serde_dur")]
	pub dns_timeout: Duration,
	#[serde(with = "serde_dur")]
	pub connect_timeout: Duration,
	#[serde(with = "serde_dur")]
	pub tls_handshake_timeout: Duration,
	pub doh_max_reply_bytes: usize,
	#[serde(with = "serde_dur")]
	pub backoff_start: Duration,
	#[serde(with = "serde_dur")]
	pub backoff_max: Duration,
	pub include_data: bool,
}

impl Default for Config {
	fn default() -> Self {
		RawConfig::default().build()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn raw_config_defaults_match_config_default() {
		let from_raw = RawConfig::default().build();
		let default = Config::default();
		assert_eq!(from_raw.dns_timeout, default.dns_timeout);
		assert_eq!(from_raw.backoff_max, default.backoff_max);
	}

	#[test]
	fn raw_config_parses_human_durations() {
		let raw: RawConfig = serde_json::from_str(
			r#"{"dnsTimeout": "2s", "connectTimeout": "15s", "includeData": true}"#,
		)
		.unwrap();
		let cfg = raw.build();
		assert_eq!(cfg.dns_timeout, Duration::from_secs(2));
		assert_eq!(cfg.connect_timeout, Duration::from_secs(15));
		assert!(cfg.include_data);
		// untouched fields keep their defaults
		assert_eq!(cfg.tls_handshake_timeout, DEFAULT_TLS_HANDSHAKE_TIMEOUT);
	}

	#[test]
	fn raw_config_rejects_unknown_fields() {
		let err = serde_json::from_str::<RawConfig>(r#"{"bogusField": 1}"#);
		assert!(err.is_err());
	}
}
