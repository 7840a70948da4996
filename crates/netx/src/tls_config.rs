//! TLS `ClientConfig` defaults (§6 "TLS defaults" of the design doc): system trust store,
//! ALPN `{h2, http/1.1}`. No client certs, custom roots, or insecure-verifier overrides --
//! this crate speaks to arbitrary measurement targets, not a fixed, operator-configured
//! backend registry.

use std::sync::Arc;

use once_cell::sync::Lazy;
use rustls::ClientConfig;

static SYSTEM_ROOTS: Lazy<Arc<rustls::RootCertStore>> = Lazy::new(|| {
	let mut store = rustls::RootCertStore::empty();
	let result = rustls_native_certs::load_native_certs();
	for err in &result.errors {
		tracing::warn!(%err, "failed to load a native cert");
	}
	store.add_parsable_certificates(result.certs);
	Arc::new(store)
});

/// Builds the default `ClientConfig`: system root store, TLS 1.2+1.3, ALPN `h2` then
/// `http/1.1` (in descending preference order, as `rustls` expects).
pub fn default_client_config() -> Arc<ClientConfig> {
	let mut cfg = ClientConfig::builder()
		.with_root_certificates(SYSTEM_ROOTS.clone())
		.with_no_client_auth();
	cfg.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
	Arc::new(cfg)
}

/// Same as [`default_client_config`] but restricted to a single ALPN protocol, for DNS
/// transports (DoT) that must not negotiate HTTP.
pub fn client_config_without_alpn() -> Arc<ClientConfig> {
	let cfg = ClientConfig::builder()
		.with_root_certificates(SYSTEM_ROOTS.clone())
		.with_no_client_auth();
	Arc::new(cfg)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_config_prefers_h2_then_http11() {
		let cfg = default_client_config();
		assert_eq!(cfg.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
	}
}
