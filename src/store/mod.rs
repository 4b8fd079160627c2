//! The instance-binding store: the transactional triple-store of
//! `{instance, metadata, userdata, ip-bindings}` described in spec §3/§4.1.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::ApiError;

#[derive(Debug, Clone)]
pub struct MetadataRecord {
    pub instance_id: Uuid,
    pub blob: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct UserdataRecord {
    pub instance_id: Uuid,
    pub blob: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A bound IP address or CIDR range, stored as entered by the caller.
///
/// `address` preserves the caller's original string (spec: "implementations
/// MUST preserve the original string on insert"); `network` is its
/// canonical form, used for both conflict comparison and containment
/// matching.
#[derive(Debug, Clone)]
pub struct IpBinding {
    pub address: String,
    pub network: IpNetwork,
    pub instance_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Parses a bare address or CIDR string into its canonical `IpNetwork`,
/// treating a bare address as a `/32` (v4) or `/128` (v6) per spec §4.1.
pub fn parse_ip_or_cidr(input: &str) -> Result<IpNetwork, ApiError> {
    if let Ok(net) = input.parse::<IpNetwork>() {
        return Ok(net);
    }
    input
        .parse::<std::net::IpAddr>()
        .map(IpNetwork::from)
        .map_err(|_| {
            ApiError::BadRequest(vec![crate::error::FieldMessage::new(
                "ipAddresses",
                format!("'{input}' is not a valid IP address or CIDR block"),
            )])
        })
}

/// Deduplicates addresses case-insensitively on their canonical form while
/// preserving the first-seen original string, per spec §4.1 tie-break rule.
pub fn dedup_ips(ips: &[String]) -> Result<Vec<(String, IpNetwork)>, ApiError> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(ips.len());
    for raw in ips {
        let net = parse_ip_or_cidr(raw)?;
        let key = net.to_string().to_lowercase();
        if seen.insert(key) {
            out.push((raw.clone(), net));
        }
    }
    Ok(out)
}

/// Public contract of the instance-binding store (spec §4.1).
///
/// Every operation takes the caller's `CancellationToken`: mutating
/// operations check it between retry attempts, and honor it as a rollback
/// signal for the in-flight transaction (spec §5).
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn upsert_metadata(
        &self,
        instance_id: Uuid,
        ips: &[String],
        blob: Value,
        cancel: &CancellationToken,
    ) -> Result<(), ApiError>;

    async fn upsert_userdata(
        &self,
        instance_id: Uuid,
        ips: &[String],
        blob: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<(), ApiError>;

    async fn find_metadata(&self, instance_id: Uuid) -> Result<Option<MetadataRecord>, ApiError>;

    async fn find_userdata(&self, instance_id: Uuid) -> Result<Option<UserdataRecord>, ApiError>;

    /// Removes the metadata record; also removes all IP bindings for the
    /// instance iff no userdata remains (spec §4.1).
    async fn delete_metadata(&self, instance_id: Uuid) -> Result<bool, ApiError>;

    /// Symmetric to `delete_metadata`.
    async fn delete_userdata(&self, instance_id: Uuid) -> Result<bool, ApiError>;

    /// Resolves the instance owning a binding that contains `ip`.
    async fn resolve_by_ip(&self, ip: std::net::IpAddr) -> Result<Option<Uuid>, ApiError>;

    /// Cheap liveness probe for the `/healthz/readiness` endpoint.
    async fn ping(&self) -> bool;
}
