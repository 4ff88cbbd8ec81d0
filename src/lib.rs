//! WHOIS Gateway
//!
//! Terminates WHOIS (RFC 3912) TCP connections, turns each single-line query into
//! an HTTP GET against a configurable upstream, and writes the upstream body back
//! in WHOIS wire format. Clients are rate limited per IP, and shutdown waits for
//! in-flight connections to finish.

pub mod config;
pub mod proxy;
pub mod query;
pub mod rate_limit;
pub mod security;
pub mod server;
pub mod translate;
pub mod upstream;

#[cfg(test)]
mod test_support;

// Re-export commonly used types and functions
pub use config::{Cli, FileConfig, GatewayConfig, load_config_file};
pub use proxy::{Gateway, handle_connection};
pub use query::is_valid_query;
pub use rate_limit::{FixedWindowLimiter, RateLimitDecision, RateLimiter, RateSpec};
pub use security::{ExemptList, client_key};
pub use server::WhoisServer;
pub use translate::translate_line_endings;
pub use upstream::{
    HeaderPair, UpstreamError, UpstreamRequester, UpstreamSettings, UpstreamTemplate,
};
