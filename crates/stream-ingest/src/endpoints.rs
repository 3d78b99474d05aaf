//! Candidate endpoint construction for the stream producer.

use std::{
    collections::HashSet,
    net::{IpAddr, UdpSocket},
    sync::OnceLock,
};

use tracing::debug;

use crate::types::Endpoint;

/// Where the producer may be reachable, grouped by trust.
#[derive(Clone, Debug, Default)]
pub struct EndpointPlan {
    pub host: String,
    pub port: u16,
    /// Addresses that have served frames before.
    pub known_good: Vec<String>,
    /// Environment-specific last resorts (bridge gateways, mDNS names).
    pub fallbacks: Vec<String>,
    pub include_loopback: bool,
    pub include_local_ip: bool,
}

impl EndpointPlan {
    /// Ordered, de-duplicated candidate list.
    ///
    /// `remembered` holds hosts that connected during this process lifetime and
    /// is tried right after the configured host.
    pub fn candidates(&self, remembered: &[String]) -> Vec<Endpoint> {
        let local_ip = if self.include_local_ip {
            outbound_ip().map(|ip| ip.to_string())
        } else {
            None
        };
        self.candidates_with_local_ip(remembered, local_ip.as_deref())
    }

    pub(crate) fn candidates_with_local_ip(
        &self,
        remembered: &[String],
        local_ip: Option<&str>,
    ) -> Vec<Endpoint> {
        let mut hosts: Vec<&str> = Vec::new();
        hosts.push(&self.host);
        hosts.extend(remembered.iter().map(String::as_str));
        hosts.extend(self.known_good.iter().map(String::as_str));
        if self.include_loopback {
            hosts.extend(["127.0.0.1", "localhost"]);
        }
        hosts.extend(local_ip);
        hosts.extend(self.fallbacks.iter().map(String::as_str));

        let mut seen = HashSet::new();
        hosts
            .into_iter()
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .filter(|host| seen.insert(host.to_ascii_lowercase()))
            .map(|host| Endpoint::new(host, self.port))
            .collect()
    }
}

/// IPv4 address of the interface used for outbound routing.
///
/// Only a successful lookup is cached, so a device that boots before its
/// route is up picks the address up on a later attempt. No packet is sent;
/// connecting a UDP socket only selects a route.
pub fn outbound_ip() -> Option<IpAddr> {
    static LOCAL_IP: OnceLock<IpAddr> = OnceLock::new();
    cached_lookup(&LOCAL_IP, route_local_ip)
}

fn route_local_ip() -> Option<IpAddr> {
    let lookup = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip())
    };
    match lookup() {
        Ok(ip) if !ip.is_unspecified() => Some(ip),
        Ok(_) => None,
        Err(err) => {
            debug!("local address lookup failed: {err}");
            None
        }
    }
}

fn cached_lookup(
    cache: &OnceLock<IpAddr>,
    lookup: impl FnOnce() -> Option<IpAddr>,
) -> Option<IpAddr> {
    if let Some(ip) = cache.get() {
        return Some(*ip);
    }
    let ip = lookup()?;
    Some(*cache.get_or_init(|| ip))
}
