use anyhow::{Context, Result, anyhow};
use std::{net::SocketAddr, sync::Arc};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, error, info, warn};

use crate::config::GatewayConfig;
use crate::query::is_valid_query;
use crate::rate_limit::{FixedWindowLimiter, RateLimiter};
use crate::security::{ExemptList, client_key};
use crate::translate::translate_line_endings;
use crate::upstream::UpstreamRequester;

/// Longest query line read from a client, terminator included.
pub const MAX_QUERY_LINE: u64 = 1024;

pub const RATE_LIMITED: &[u8] = b"Rate limited\r\n";
pub const INVALID_QUERY: &[u8] = b"Invalid query\r\n";

/// Collaborators shared by every connection handler.
pub struct Gateway {
    upstream: UpstreamRequester,
    limiter: Arc<dyn RateLimiter>,
    exempt: ExemptList,
}

impl Gateway {
    #[must_use]
    pub fn new(
        upstream: UpstreamRequester,
        limiter: Arc<dyn RateLimiter>,
        exempt: ExemptList,
    ) -> Self {
        Self {
            upstream,
            limiter,
            exempt,
        }
    }

    /// Builds the gateway with the in-memory fixed-window limiter.
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        Ok(Self::new(
            UpstreamRequester::new(&config.upstream)?,
            Arc::new(FixedWindowLimiter::new(config.rate)),
            config.rate_limit_exempt.clone(),
        ))
    }

    fn should_limit(&self, peer: &SocketAddr) -> bool {
        if self.exempt.contains(peer.ip()) {
            debug!(client_addr = %peer, "Client exempt from rate limiting");
            return false;
        }

        let ip = client_key(peer);
        match self.limiter.check(&ip) {
            Ok(decision) if !decision.allowed => {
                warn!(
                    ip = %ip,
                    reset_after_secs = decision.reset_after.as_secs(),
                    "Rate limit reached"
                );
                true
            }
            Ok(_) => false,
            Err(e) => {
                error!(ip = %ip, error = %e, "Error getting limit for ip");
                false
            }
        }
    }
}

/// Serves exactly one WHOIS query on `stream`, then shuts its write side down.
///
/// Rejected input (rate limited, malformed query) is answered with a single
/// line and is not an error. Upstream failures are answered with a generic
/// line and returned to the caller for logging.
#[tracing::instrument(skip(stream, peer, gateway), fields(client_addr = %peer))]
pub async fn handle_connection<S>(mut stream: S, peer: SocketAddr, gateway: &Gateway) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = serve_query(&mut stream, peer, gateway).await;

    if let Err(e) = stream.shutdown().await {
        debug!(error = %e, "Failed to shut down client stream");
    }
    result
}

async fn serve_query<S>(stream: &mut S, peer: SocketAddr, gateway: &Gateway) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if gateway.should_limit(&peer) {
        return reply(stream, RATE_LIMITED).await;
    }

    let Some(query) = read_query(stream).await? else {
        info!("Query line unreadable");
        return reply(stream, INVALID_QUERY).await;
    };

    info!(query = %query, ip = %peer, "Received query");

    if !is_valid_query(&query) {
        info!(query = %query, "Query did not match pattern");
        return reply(stream, INVALID_QUERY).await;
    }

    match gateway.upstream.fetch(&query).await {
        Ok(body) => {
            let response = translate_line_endings(&body);
            stream
                .write_all(&response)
                .await
                .context("Failed to write WHOIS response")?;
            debug!(bytes = response.len(), "Response sent");
            Ok(())
        }
        Err(e) => {
            if let Err(write_err) = stream.write_all(e.client_message()).await {
                debug!(error = %write_err, "Failed to notify client of upstream failure");
            }
            Err(e).with_context(|| format!("Upstream lookup failed for {query}"))
        }
    }
}

async fn reply<S: AsyncWrite + Unpin>(stream: &mut S, line: &[u8]) -> Result<()> {
    stream
        .write_all(line)
        .await
        .context("Failed to write reply to client")
}

/// Reads the single query line and strips its terminator.
///
/// Returns `None` for a line that is over-long or not UTF-8. A connection that
/// closes before a full line arrives is an error.
async fn read_query<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Option<String>> {
    let mut line = Vec::new();
    let mut reader = BufReader::new(stream.take(MAX_QUERY_LINE));
    let read = reader
        .read_until(b'\n', &mut line)
        .await
        .context("Failed to read query")?;

    if line.last() != Some(&b'\n') {
        if read as u64 >= MAX_QUERY_LINE {
            return Ok(None);
        }
        return Err(anyhow!("Connection closed before a query line arrived"));
    }

    while matches!(line.last(), Some(b'\r' | b'\n')) {
        line.pop();
    }
    Ok(String::from_utf8(line).ok())
}
