//! Outbound client to the authoritative upstream origin (spec §4.4),
//! generalized from the upstream proxy's own client (`s3_client.rs`): a
//! thin typed wrapper around an HTTP client, mapping transport status codes
//! into the local error taxonomy.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::ApiError;

#[derive(Debug, Clone, Deserialize)]
pub struct MetadataLookupRecord {
    pub id: Uuid,
    #[serde(rename = "ipAddresses", default)]
    pub ip_addresses: Vec<String>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserdataLookupRecord {
    pub id: Uuid,
    #[serde(rename = "ipAddresses", default)]
    pub ip_addresses: Vec<String>,
    #[serde(with = "userdata_bytes")]
    pub userdata: Vec<u8>,
}

/// Upstream userdata travels as a JSON string; we treat it as raw bytes
/// internally (spec: "userdata may be any byte sequence").
mod userdata_bytes {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(s.into_bytes())
    }
}

/// Capability consumed by `CacheCoordinator` on cache miss (spec §4.4).
#[async_trait]
pub trait LookupClient: Send + Sync + 'static {
    async fn get_metadata_by_id(&self, id: Uuid) -> Result<Option<MetadataLookupRecord>, ApiError>;
    async fn get_metadata_by_ip(&self, ip: IpAddr) -> Result<Option<MetadataLookupRecord>, ApiError>;
    async fn get_userdata_by_id(&self, id: Uuid) -> Result<Option<UserdataLookupRecord>, ApiError>;
    async fn get_userdata_by_ip(&self, ip: IpAddr) -> Result<Option<UserdataLookupRecord>, ApiError>;
}

const USER_AGENT: &str = concat!("metabindd/", env!("CARGO_PKG_VERSION"));

pub struct HttpLookupClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpLookupClient {
    pub fn new(base_url: String) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(ApiError::internal)?;
        Ok(Self { client, base_url })
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<Option<T>, ApiError> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(ApiError::internal)?;

        match response.status().as_u16() {
            200 => {
                let body = response.json::<T>().await.map_err(ApiError::internal)?;
                Ok(Some(body))
            }
            404 => Ok(None),
            other => Err(ApiError::Upstream(other)),
        }
    }
}

#[async_trait]
impl LookupClient for HttpLookupClient {
    async fn get_metadata_by_id(&self, id: Uuid) -> Result<Option<MetadataLookupRecord>, ApiError> {
        self.get(&format!("/device-metadata/{id}"), &[]).await
    }

    async fn get_metadata_by_ip(&self, ip: IpAddr) -> Result<Option<MetadataLookupRecord>, ApiError> {
        self.get("/device-metadata", &[("ip_address", &ip.to_string())]).await
    }

    async fn get_userdata_by_id(&self, id: Uuid) -> Result<Option<UserdataLookupRecord>, ApiError> {
        self.get(&format!("/device-userdata/{id}"), &[]).await
    }

    async fn get_userdata_by_ip(&self, ip: IpAddr) -> Result<Option<UserdataLookupRecord>, ApiError> {
        self.get("/device-userdata", &[("ip_address", &ip.to_string())]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn maps_200_to_record() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/device-metadata/11111111-1111-1111-1111-111111111111"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "11111111-1111-1111-1111-111111111111",
                "ipAddresses": ["3.4.5.6"],
                "metadata": {"some": "m"}
            })))
            .mount(&server)
            .await;

        let client = HttpLookupClient::new(server.uri()).unwrap();
        let record = client
            .get_metadata_by_id(Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.ip_addresses, vec!["3.4.5.6".to_string()]);
    }

    #[tokio::test]
    async fn maps_404_to_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/device-metadata/22222222-2222-2222-2222-222222222222"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = HttpLookupClient::new(server.uri()).unwrap();
        let record = client
            .get_metadata_by_id(Uuid::parse_str("22222222-2222-2222-2222-222222222222").unwrap())
            .await
            .unwrap();
        assert!(record.is_none());
    }

    #[tokio::test]
    async fn maps_other_status_to_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/device-metadata/33333333-3333-3333-3333-333333333333"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = HttpLookupClient::new(server.uri()).unwrap();
        let err = client
            .get_metadata_by_id(Uuid::parse_str("33333333-3333-3333-3333-333333333333").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Upstream(503)));
    }
}
