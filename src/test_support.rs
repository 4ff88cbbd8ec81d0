//! Fakes shared by the handler and server tests.

use anyhow::{Context, Result};
use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::{sleep, timeout},
};

use crate::proxy::Gateway;
use crate::rate_limit::{RateLimitDecision, RateLimiter};
use crate::security::ExemptList;
use crate::upstream::{
    DEFAULT_MAX_BODY_BYTES, UpstreamRequester, UpstreamSettings, UpstreamTemplate,
};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP server answering every request with a fixed status and body, and
/// recording each request head it receives.
pub struct FakeUpstream {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
}

impl FakeUpstream {
    pub async fn start(status: u16, body: &'static str) -> Result<Self> {
        Self::start_with_delay(status, body, Duration::ZERO).await
    }

    pub async fn start_with_delay(
        status: u16,
        body: &'static str,
        delay: Duration,
    ) -> Result<Self> {
        Self::serve(status, body, body.len(), delay).await
    }

    /// Declares `declared_len` bytes of body but closes after sending `body`.
    pub async fn start_truncated(declared_len: usize, body: &'static str) -> Result<Self> {
        Self::serve(200, body, declared_len, Duration::ZERO).await
    }

    async fn serve(
        status: u16,
        body: &'static str,
        content_length: usize,
        delay: Duration,
    ) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("Failed to bind fake upstream")?;
        let addr = listener
            .local_addr()
            .context("Failed to get fake upstream local address")?;
        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = requests.clone();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    let Some(head) = read_request_head(&mut stream).await else {
                        return;
                    };
                    recorded.lock().unwrap().push(head);
                    sleep(delay).await;

                    let reason = if status == 200 { "OK" } else { "Error" };
                    let response = format!(
                        "HTTP/1.1 {status} {reason}\r\n\
                         Content-Type: text/plain\r\n\
                         Content-Length: {content_length}\r\n\
                         Connection: close\r\n\r\n{body}"
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        Ok(Self { addr, requests })
    }

    /// Template pointing at this server with the query in `q`.
    pub fn template(&self) -> String {
        format!("http://{}/whois?q={{{{query}}}}", self.addr)
    }

    /// Request heads received so far, lowercased.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

async fn read_request_head(stream: &mut TcpStream) -> Option<String> {
    let mut head = Vec::new();
    let mut buffer = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut buffer).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => head.extend_from_slice(&buffer[..n]),
        }
    }
    Some(String::from_utf8_lossy(&head).to_lowercase())
}

/// Limiter returning the same answer for every key, counting calls.
pub struct StaticLimiter {
    allowed: bool,
    calls: AtomicUsize,
}

impl StaticLimiter {
    pub fn new(allowed: bool) -> Arc<Self> {
        Arc::new(Self {
            allowed,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RateLimiter for StaticLimiter {
    fn check(&self, _key: &str) -> Result<RateLimitDecision> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(RateLimitDecision {
            allowed: self.allowed,
            remaining: 0,
            reset_after: Duration::from_secs(30),
        })
    }
}

pub fn upstream_settings(template: &str, headers: &[&str]) -> UpstreamSettings {
    UpstreamSettings {
        template: UpstreamTemplate::parse(template).unwrap(),
        headers: headers.iter().map(|h| h.parse().unwrap()).collect(),
        timeout: None,
        max_body_bytes: DEFAULT_MAX_BODY_BYTES,
    }
}

/// Gateway whose HTTP client ignores proxy settings from the environment.
pub fn gateway(settings: &UpstreamSettings, limiter: Arc<dyn RateLimiter>) -> Gateway {
    let client = reqwest::Client::builder().no_proxy().build().unwrap();
    let upstream = UpstreamRequester::with_client(client, settings).unwrap();
    Gateway::new(upstream, limiter, ExemptList::default())
}

/// Sends one raw query line and collects everything until the server closes.
pub async fn whois_query(addr: SocketAddr, line: &[u8]) -> Result<Vec<u8>> {
    let mut stream = TcpStream::connect(addr)
        .await
        .context("Failed to connect to gateway")?;
    stream
        .write_all(line)
        .await
        .context("Failed to send query")?;

    let mut response = Vec::new();
    timeout(TEST_TIMEOUT, stream.read_to_end(&mut response))
        .await
        .context("Timeout waiting for response")?
        .context("Failed to read response")?;
    Ok(response)
}
