//! `netx`: an instrumented DNS/TCP/TLS/HTTP client stack for network measurement.
//!
//! The crate is a layered composition -- clock/ids, event handler, measuring connection,
//! dialer base, DNS transports, the OONI-style resolver, a measuring TLS dialer, the top
//! measuring dialer (resolve + connect + retry/backoff), and an HTTP transport that stitches
//! all of it into one timestamped event stream per transaction. See `DESIGN.md` at the
//! workspace root for how each module is grounded.

pub mod client;
pub mod clock;
pub mod conn;
pub mod config;
pub mod dialer;
pub mod dns;
pub mod error;
pub mod handler;
pub mod http;
pub mod measurement;
pub mod tls;
pub mod tls_config;

pub use client::{Client, ClientError};
pub use clock::{Beginning, ConnId, DialId, RequestContext, TransactionId};
pub use config::Config;
pub use handler::{BufferingHandler, EventHandler, LoggingHandler, NullHandler};
pub use measurement::Measurement;
