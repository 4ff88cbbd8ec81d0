use anyhow::{Context, Result, anyhow, bail};
use futures_util::StreamExt;
use reqwest::{
    Client, StatusCode, Url,
    header::{HOST, HeaderName, HeaderValue},
};
use std::{str::FromStr, time::Duration};
use thiserror::Error;
use tracing::{debug, warn};

/// Token in the upstream URL template replaced by the encoded query.
pub const QUERY_PLACEHOLDER: &str = "{{query}}";

/// Default cap on the upstream body size.
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

const SAMPLE_QUERY: &str = "example.com";

/// An extra header attached to every upstream request, parsed from `Name: Value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderPair {
    pub name: String,
    pub value: String,
}

impl HeaderPair {
    /// A `Host` header overrides the request authority instead of being sent
    /// as an ordinary header.
    #[must_use]
    pub fn is_host(&self) -> bool {
        self.name.eq_ignore_ascii_case(HOST.as_str())
    }
}

impl FromStr for HeaderPair {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (name, value) = s
            .split_once(':')
            .ok_or_else(|| anyhow!("Invalid header value; {s}"))?;
        let name = name.trim();
        if name.is_empty() {
            bail!("Invalid header value; {s}");
        }

        Ok(Self {
            name: name.to_string(),
            value: value.trim_start().to_string(),
        })
    }
}

/// Upstream URL template containing [`QUERY_PLACEHOLDER`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTemplate(String);

impl UpstreamTemplate {
    /// Validates that the template yields an absolute `http` or `https` URL
    /// once a query is substituted in.
    pub fn parse(template: &str) -> Result<Self> {
        let template = Self(template.to_string());
        let sample = template.render(SAMPLE_QUERY);
        let url = Url::parse(&sample)
            .with_context(|| format!("Failed to parse upstream; {}", template.0))?;

        if !matches!(url.scheme(), "http" | "https") {
            bail!(
                "Failed to parse upstream; unsupported scheme '{}' in {}",
                url.scheme(),
                template.0
            );
        }
        if !template.has_placeholder() {
            warn!(
                upstream = %template.0,
                "Upstream template has no {QUERY_PLACEHOLDER} placeholder; \
                 every query hits the same URL"
            );
        }

        Ok(template)
    }

    #[must_use]
    pub fn has_placeholder(&self) -> bool {
        self.0.contains(QUERY_PLACEHOLDER)
    }

    /// Replaces every placeholder occurrence with the percent-encoded query.
    #[must_use]
    pub fn render(&self, query: &str) -> String {
        self.0.replace(QUERY_PLACEHOLDER, &urlencoding::encode(query))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Failure of a single upstream lookup.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("Failed to build upstream URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("Upstream request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("Response is not 200; code={}", .0.as_u16())]
    Status(StatusCode),
    #[error("Failed to read upstream body: {0}")]
    Body(#[source] reqwest::Error),
    #[error("Upstream body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },
}

impl UpstreamError {
    /// Line written back to the WHOIS client for this failure.
    #[must_use]
    pub const fn client_message(&self) -> &'static [u8] {
        match self {
            Self::InvalidUrl { .. } | Self::Transport(_) => b"Upstream query failed\r\n",
            Self::Status(_) => b"Invalid query\r\n",
            Self::Body(_) | Self::BodyTooLarge { .. } => b"Error reading upstream body\r\n",
        }
    }
}

/// Fully resolved upstream request for one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamRequest {
    pub url: Url,
    /// Authority override taken from a configured `Host` header.
    pub host: Option<HeaderValue>,
    /// Ordinary headers in configuration order.
    pub headers: Vec<(HeaderName, HeaderValue)>,
}

/// Upstream settings taken from the gateway configuration.
#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub template: UpstreamTemplate,
    pub headers: Vec<HeaderPair>,
    pub timeout: Option<Duration>,
    pub max_body_bytes: usize,
}

/// Issues one HTTP GET per WHOIS query.
pub struct UpstreamRequester {
    client: Client,
    template: UpstreamTemplate,
    host: Option<HeaderValue>,
    headers: Vec<(HeaderName, HeaderValue)>,
    max_body_bytes: usize,
}

impl UpstreamRequester {
    pub fn new(settings: &UpstreamSettings) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = settings.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().context("Failed to build HTTP client")?;
        Self::with_client(client, settings)
    }

    /// Uses a caller-provided client; the settings' timeout is not applied.
    pub fn with_client(client: Client, settings: &UpstreamSettings) -> Result<Self> {
        let mut host = None;
        let mut headers = Vec::with_capacity(settings.headers.len());

        for pair in &settings.headers {
            let value = HeaderValue::from_str(&pair.value)
                .with_context(|| format!("Invalid value for header {}", pair.name))?;
            if pair.is_host() {
                host = Some(value);
                continue;
            }
            let name = HeaderName::from_bytes(pair.name.as_bytes())
                .with_context(|| format!("Invalid header name {}", pair.name))?;
            headers.push((name, value));
        }

        Ok(Self {
            client,
            template: settings.template.clone(),
            host,
            headers,
            max_body_bytes: settings.max_body_bytes,
        })
    }

    pub fn build_request(&self, query: &str) -> Result<UpstreamRequest, UpstreamError> {
        let rendered = self.template.render(query);
        let url = Url::parse(&rendered).map_err(|e| UpstreamError::InvalidUrl {
            url: rendered.clone(),
            reason: e.to_string(),
        })?;

        Ok(UpstreamRequest {
            url,
            host: self.host.clone(),
            headers: self.headers.clone(),
        })
    }

    /// Fetches the upstream body for `query`. Only a `200 OK` counts as success.
    pub async fn fetch(&self, query: &str) -> Result<Vec<u8>, UpstreamError> {
        let request = self.build_request(query)?;
        debug!(url = %request.url, "Querying upstream");

        let mut builder = self.client.get(request.url);
        for (name, value) in request.headers {
            builder = builder.header(name, value);
        }
        if let Some(host) = request.host {
            builder = builder.header(HOST, host);
        }

        let response = builder.send().await.map_err(UpstreamError::Transport)?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(UpstreamError::Status(status));
        }

        let mut body = Vec::new();
        let mut chunks = response.bytes_stream();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(UpstreamError::Body)?;
            if body.len() + chunk.len() > self.max_body_bytes {
                return Err(UpstreamError::BodyTooLarge {
                    limit: self.max_body_bytes,
                });
            }
            body.extend_from_slice(&chunk);
        }

        debug!(bytes = body.len(), "Upstream body received");
        Ok(body)
    }
}
