//! Read-only projection of a stored metadata blob onto the EC2-style
//! `/2009-04-04/meta-data/...` tree (spec §4.5). Pure and uncached: every
//! request recomputes the view from the stored JSON (spec §9).

use serde::Deserialize;
use serde_json::Value;

use crate::error::ApiError;

#[derive(Debug, Deserialize, Default)]
struct Schema {
    id: Option<String>,
    hostname: Option<String>,
    iqn: Option<String>,
    plan: Option<String>,
    facility: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    ssh_keys: Vec<String>,
    operating_system: Option<OperatingSystem>,
    spot: Option<Spot>,
    network: Option<Network>,
}

#[derive(Debug, Deserialize, Default)]
struct OperatingSystem {
    slug: Option<String>,
    distro: Option<String>,
    version: Option<String>,
    image_tag: Option<String>,
    license_activation: Option<LicenseActivation>,
}

#[derive(Debug, Deserialize, Default)]
struct LicenseActivation {
    state: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct Spot {
    termination_time: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct Network {
    #[serde(default)]
    addresses: Vec<NetworkAddress>,
}

#[derive(Debug, Deserialize, Clone)]
struct NetworkAddress {
    address: String,
    address_family: u8,
    #[serde(default)]
    public: bool,
}

pub struct Ec2Projector {
    schema: Schema,
}

impl Ec2Projector {
    pub fn new(blob: &Value) -> Result<Self, ApiError> {
        let schema = serde_json::from_value(blob.clone()).map_err(ApiError::internal)?;
        Ok(Self { schema })
    }

    fn public_ipv4(&self) -> Vec<&str> {
        self.filter_addresses(4, true)
    }

    fn public_ipv6(&self) -> Vec<&str> {
        self.filter_addresses(6, true)
    }

    fn local_ipv4(&self) -> Vec<&str> {
        self.filter_addresses(4, false)
    }

    fn filter_addresses(&self, family: u8, public: bool) -> Vec<&str> {
        self.schema
            .network
            .as_ref()
            .map(|n| {
                n.addresses
                    .iter()
                    .filter(|a| a.address_family == family && a.public == public)
                    .map(|a| a.address.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The fixed top-level key order from spec §4.5, with the conditional
    /// trailing keys appended only when they apply.
    pub fn list_top_level(&self) -> Vec<String> {
        let mut keys = vec![
            "instance-id".to_string(),
            "hostname".to_string(),
            "iqn".to_string(),
            "plan".to_string(),
            "facility".to_string(),
            "tags".to_string(),
            "operating-system".to_string(),
            "public-keys".to_string(),
        ];

        if self.schema.spot.is_some() {
            keys.push("spot".to_string());
        }
        if !self.public_ipv4().is_empty() {
            keys.push("public-ipv4".to_string());
        }
        if !self.public_ipv6().is_empty() {
            keys.push("public-ipv6".to_string());
        }
        if !self.local_ipv4().is_empty() {
            keys.push("local-ipv4".to_string());
        }

        keys
    }

    /// Resolves `path` (leading/trailing slashes trimmed) to its list of
    /// string values, or `NotFound` for an unknown leaf or empty filter.
    pub fn get(&self, path: &str) -> Result<Vec<String>, ApiError> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(self.list_top_level());
        }

        let (head, rest) = match trimmed.split_once('/') {
            Some((head, rest)) => (head, Some(rest)),
            None => (trimmed, None),
        };

        match head {
            "instance-id" => self.leaf(self.schema.id.as_deref()),
            "hostname" => self.leaf(self.schema.hostname.as_deref()),
            "iqn" => self.leaf(self.schema.iqn.as_deref()),
            "plan" => self.leaf(self.schema.plan.as_deref()),
            "facility" => self.leaf(self.schema.facility.as_deref()),
            "tags" => {
                if self.schema.tags.is_empty() {
                    Err(ApiError::NotFound)
                } else {
                    Ok(self.schema.tags.clone())
                }
            }
            "public-keys" => {
                if self.schema.ssh_keys.is_empty() {
                    Err(ApiError::NotFound)
                } else {
                    Ok(self.schema.ssh_keys.clone())
                }
            }
            "operating-system" => self.get_operating_system(rest),
            "spot" => self.get_spot(rest),
            "public-ipv4" => self.non_empty(self.public_ipv4()),
            "public-ipv6" => self.non_empty(self.public_ipv6()),
            "local-ipv4" => self.non_empty(self.local_ipv4()),
            _ => Err(ApiError::NotFound),
        }
    }

    fn get_operating_system(&self, rest: Option<&str>) -> Result<Vec<String>, ApiError> {
        let os = self.schema.operating_system.as_ref().ok_or(ApiError::NotFound)?;
        match rest {
            None => Ok(vec![
                "slug".to_string(),
                "distro".to_string(),
                "version".to_string(),
                "image-tag".to_string(),
                "license-activation".to_string(),
            ]),
            Some("slug") => self.leaf(os.slug.as_deref()),
            Some("distro") => self.leaf(os.distro.as_deref()),
            Some("version") => self.leaf(os.version.as_deref()),
            Some("image-tag") => self.leaf(os.image_tag.as_deref()),
            Some("license-activation") => {
                let activation = os.license_activation.as_ref().ok_or(ApiError::NotFound)?;
                if activation.state.is_some() {
                    Ok(vec!["state".to_string()])
                } else {
                    Err(ApiError::NotFound)
                }
            }
            Some("license-activation/state") => {
                let activation = os.license_activation.as_ref().ok_or(ApiError::NotFound)?;
                self.leaf(activation.state.as_deref())
            }
            _ => Err(ApiError::NotFound),
        }
    }

    fn get_spot(&self, rest: Option<&str>) -> Result<Vec<String>, ApiError> {
        let spot = self.schema.spot.as_ref().ok_or(ApiError::NotFound)?;
        match rest {
            None => Ok(vec!["termination-time".to_string()]),
            Some("termination-time") => self.leaf(spot.termination_time.as_deref()),
            _ => Err(ApiError::NotFound),
        }
    }

    fn leaf(&self, value: Option<&str>) -> Result<Vec<String>, ApiError> {
        value.map(|v| vec![v.to_string()]).ok_or(ApiError::NotFound)
    }

    fn non_empty(&self, values: Vec<&str>) -> Result<Vec<String>, ApiError> {
        if values.is_empty() {
            Err(ApiError::NotFound)
        } else {
            Ok(values.into_iter().map(str::to_string).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "id": "abc123",
            "hostname": "host-1",
            "operating_system": {
                "slug": "ubuntu_20_04",
                "distro": "ubuntu",
                "version": "20.04",
                "license_activation": { "state": "unlicensed" }
            },
            "network": {
                "addresses": [
                    { "address": "203.0.113.5", "address_family": 4, "public": true },
                    { "address": "2001:db8::1", "address_family": 6, "public": true },
                    { "address": "10.0.0.5", "address_family": 4, "public": false }
                ]
            }
        })
    }

    #[test]
    fn top_level_order_includes_present_network_filters() {
        let projector = Ec2Projector::new(&sample()).unwrap();
        let keys = projector.list_top_level();
        assert_eq!(
            keys,
            vec![
                "instance-id",
                "hostname",
                "iqn",
                "plan",
                "facility",
                "tags",
                "operating-system",
                "public-keys",
                "public-ipv4",
                "public-ipv6",
                "local-ipv4",
            ]
        );
    }

    #[test]
    fn public_ipv4_returns_single_matching_address() {
        let projector = Ec2Projector::new(&sample()).unwrap();
        assert_eq!(projector.get("public-ipv4").unwrap(), vec!["203.0.113.5"]);
    }

    #[test]
    fn license_activation_state_path() {
        let projector = Ec2Projector::new(&sample()).unwrap();
        assert_eq!(
            projector.get("/operating-system/license-activation/state/").unwrap(),
            vec!["unlicensed"]
        );
    }

    #[test]
    fn spot_is_not_found_when_absent() {
        let projector = Ec2Projector::new(&sample()).unwrap();
        assert!(matches!(projector.get("spot"), Err(ApiError::NotFound)));
    }

    #[test]
    fn empty_path_matches_list_top_level() {
        let projector = Ec2Projector::new(&sample()).unwrap();
        assert_eq!(projector.get("").unwrap(), projector.list_top_level());
    }
}
