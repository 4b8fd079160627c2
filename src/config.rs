use std::collections::HashMap;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub listen: String,

    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub logging: LoggingConfig,

    pub db: DatabaseConfig,

    #[serde(default)]
    pub oidc: OidcConfig,

    #[serde(default)]
    pub lookup: LookupConfig,

    #[serde(default)]
    pub crdb: CrdbConfig,

    #[serde(default)]
    pub trusted_proxies: Vec<String>,

    #[serde(default)]
    pub template_fields: HashMap<String, String>,

    #[serde(default)]
    pub admin: AdminConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub pretty: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub uri: String,
}

/// Parsed but unconsumed here: JWT/OIDC verification is an external
/// collaborator (spec §1). Kept so the config surface matches the
/// deployed service and a verifier can be wired in without a config
/// migration.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct OidcConfig {
    #[serde(default)]
    pub enabled: bool,
    pub audience: Option<String>,
    pub issuer: Option<String>,
    pub jwksuri: Option<String>,
    #[serde(default)]
    pub claims: OidcClaims,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct OidcClaims {
    pub roles: Option<String>,
    pub username: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LookupConfig {
    #[serde(default)]
    pub enabled: bool,
    pub base_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CrdbConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_interval", with = "duration_millis")]
    pub retry_interval: Duration,
    #[serde(default = "default_tx_timeout", with = "duration_millis")]
    pub tx_timeout: Duration,
}

impl Default for CrdbConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_retries: default_max_retries(),
            retry_interval: default_retry_interval(),
            tx_timeout: default_tx_timeout(),
        }
    }
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_interval() -> Duration {
    Duration::from_millis(50)
}

fn default_tx_timeout() -> Duration {
    Duration::from_millis(5_000)
}

mod duration_millis {
    use super::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }

    #[allow(dead_code)]
    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AdminConfig {
    pub bearer_token: Option<String>,
}

impl Settings {
    pub fn new(config_path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let s = Config::builder()
            .add_source(File::with_name(config_path).required(false))
            .add_source(Environment::with_prefix("METABINDD").separator("__"))
            .build()?;

        Ok(s.try_deserialize()?)
    }
}
