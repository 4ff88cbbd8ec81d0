use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use serde::Deserialize;
use std::{
    fs,
    net::{SocketAddr, ToSocketAddrs},
    path::{Path, PathBuf},
    time::Duration,
};

use crate::rate_limit::RateSpec;
use crate::security::ExemptList;
use crate::upstream::{DEFAULT_MAX_BODY_BYTES, HeaderPair, UpstreamSettings, UpstreamTemplate};

pub const DEFAULT_LISTEN: &str = ":43";
pub const DEFAULT_UPSTREAM: &str = "http://example.com:80/whois?format=plain&query={{query}}";
pub const DEFAULT_RATE: &str = "3-M";

/// Command-line flags. Each one overrides the matching key of the config file.
#[derive(Debug, Default, Parser)]
#[command(name = "whois-gateway", version, about = "WHOIS to HTTP gateway")]
pub struct Cli {
    /// TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Address the WHOIS listener binds to [default: :43]
    #[arg(long)]
    pub listen: Option<String>,

    /// Upstream URL template; {{query}} is replaced by the encoded query
    #[arg(long)]
    pub upstream: Option<String>,

    /// Requests allowed per client IP as <count>-<period>, period one of S, M, H, D [default: 3-M]
    #[arg(long)]
    pub rate: Option<String>,

    /// Header added to upstream requests. May be used multiple times.
    #[arg(long = "header", value_name = "NAME: VALUE")]
    pub headers: Vec<String>,

    /// Overall timeout for each upstream request
    #[arg(long)]
    pub upstream_timeout_secs: Option<u64>,

    /// Largest upstream body accepted
    #[arg(long)]
    pub max_body_bytes: Option<usize>,

    /// Client IP or CIDR exempt from rate limiting. May be used multiple times.
    #[arg(long = "rate-limit-exempt", value_name = "IP|CIDR")]
    pub rate_limit_exempt: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub listen: Option<String>,
    pub upstream: Option<String>,
    pub rate: Option<String>,
    #[serde(default)]
    pub headers: Vec<String>,
    pub upstream_timeout_secs: Option<u64>,
    pub max_body_bytes: Option<usize>,
    #[serde(default)]
    pub rate_limit_exempt: Vec<String>,
}

pub fn load_config_file(path: &Path) -> Result<FileConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse {} as valid TOML", path.display()))
}

/// Validated, immutable gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen: SocketAddr,
    pub upstream: UpstreamSettings,
    pub rate: RateSpec,
    pub rate_limit_exempt: ExemptList,
}

impl GatewayConfig {
    /// Loads the file named by `--config`, if any, and applies the flags on top.
    pub fn resolve(cli: Cli) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => load_config_file(path)?,
            None => FileConfig::default(),
        };
        Self::from_sources(file, cli)
    }

    pub fn from_sources(file: FileConfig, cli: Cli) -> Result<Self> {
        let listen = cli
            .listen
            .or(file.listen)
            .unwrap_or_else(|| DEFAULT_LISTEN.to_string());
        let upstream = cli
            .upstream
            .or(file.upstream)
            .unwrap_or_else(|| DEFAULT_UPSTREAM.to_string());
        let rate = cli
            .rate
            .or(file.rate)
            .unwrap_or_else(|| DEFAULT_RATE.to_string());

        let headers = file
            .headers
            .iter()
            .chain(&cli.headers)
            .map(|h| h.parse::<HeaderPair>())
            .collect::<Result<Vec<_>>>()?;

        let max_body_bytes = cli
            .max_body_bytes
            .or(file.max_body_bytes)
            .unwrap_or(DEFAULT_MAX_BODY_BYTES);
        if max_body_bytes == 0 {
            bail!("max_body_bytes must be greater than zero");
        }

        let timeout = cli
            .upstream_timeout_secs
            .or(file.upstream_timeout_secs)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let exempt: Vec<_> = file
            .rate_limit_exempt
            .into_iter()
            .chain(cli.rate_limit_exempt)
            .collect();

        Ok(Self {
            listen: parse_listen_addr(&listen)?,
            upstream: UpstreamSettings {
                template: UpstreamTemplate::parse(&upstream)?,
                headers,
                timeout,
                max_body_bytes,
            },
            rate: rate.parse::<RateSpec>().context("Invalid rate")?,
            rate_limit_exempt: ExemptList::parse(exempt.as_slice())?,
        })
    }
}

/// Resolves a `host:port` listen address. A bare `:port` binds every IPv4
/// interface.
pub fn parse_listen_addr(addr: &str) -> Result<SocketAddr> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };

    full.to_socket_addrs()
        .with_context(|| format!("Failed to parse addr; address={addr}"))?
        .next()
        .ok_or_else(|| anyhow!("Failed to parse addr; address={addr} resolved to nothing"))
}
