//! Caller-by-source-IP resolution (spec §4.2).

use std::net::IpAddr;
use std::sync::Arc;

use axum::http::HeaderMap;
use ipnetwork::IpNetwork;
use uuid::Uuid;

use crate::error::ApiError;
use crate::store::Store;

/// The set of network hops whose `X-Forwarded-For` header may be trusted.
/// Built once from config at startup.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxies {
    networks: Vec<IpNetwork>,
}

impl TrustedProxies {
    pub fn new(entries: &[String]) -> Result<Self, ApiError> {
        let networks = entries
            .iter()
            .map(|s| crate::store::parse_ip_or_cidr(s))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { networks })
    }

    pub fn trusts(&self, peer: IpAddr) -> bool {
        self.networks.iter().any(|n| n.contains(peer))
    }
}

/// Determines the address to treat as "the caller" for a request: the
/// leftmost `X-Forwarded-For` entry if `peer` is a trusted proxy hop,
/// otherwise the raw socket peer address. Untrusted forwarded headers are
/// ignored outright (spec §4.2: "to prevent spoofing").
pub fn caller_ip(peer: IpAddr, headers: &HeaderMap, trusted: &TrustedProxies) -> IpAddr {
    if !trusted.trusts(peer) {
        return peer;
    }

    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .and_then(|s| s.parse::<IpAddr>().ok())
        .unwrap_or(peer)
}

pub struct Resolver {
    store: Arc<dyn Store>,
}

impl Resolver {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn resolve(&self, ip: IpAddr) -> Result<Uuid, ApiError> {
        self.store.resolve_by_ip(ip).await?.ok_or(ApiError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn untrusted_peer_ignores_forwarded_header() {
        let trusted = TrustedProxies::new(&["10.0.0.0/8".into()]).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4"));

        let peer: IpAddr = "203.0.113.9".parse().unwrap();
        assert_eq!(caller_ip(peer, &headers, &trusted), peer);
    }

    #[test]
    fn trusted_peer_honors_leftmost_forwarded_entry() {
        let trusted = TrustedProxies::new(&["10.0.0.0/8".into()]).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4, 10.0.0.1"));

        let peer: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(caller_ip(peer, &headers, &trusted), "1.2.3.4".parse::<IpAddr>().unwrap());
    }
}
