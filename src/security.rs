use anyhow::{Result, anyhow};
use ipnet::IpNet;
use std::net::{IpAddr, SocketAddr};

/// Derives the rate-limit key for a connection: the client IP with the port
/// stripped. IPv4-mapped IPv6 peers are keyed by their IPv4 address.
#[must_use]
pub fn client_key(peer: &SocketAddr) -> String {
    peer.ip().to_canonical().to_string()
}

/// Clients that bypass rate limiting.
#[derive(Debug, Clone, Default)]
pub struct ExemptList {
    networks: Vec<IpNet>,
}

impl ExemptList {
    /// Parses entries that are either a single IP address or a CIDR subnet.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self> {
        let networks = entries
            .iter()
            .map(|entry| {
                let entry = entry.as_ref().trim();
                // Try parsing as individual IP address first
                if let Ok(ip) = entry.parse::<IpAddr>() {
                    Ok(IpNet::from(ip))
                } else {
                    entry.parse::<IpNet>().map_err(|_| {
                        anyhow!("Invalid IP address or CIDR in rate_limit_exempt: {entry}")
                    })
                }
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { networks })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.networks.iter().any(|net| net.contains(&ip))
    }
}
