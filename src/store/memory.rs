//! An in-process `Store` implementation backing unit tests and local/dev
//! runs without a live Postgres. It implements the same six-phase upsert
//! algorithm and invariants as `store::postgres`, just over a `Mutex`-guarded
//! map instead of SQL tables.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use ipnetwork::IpNetwork;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{dedup_ips, IpBinding, MetadataRecord, Store, UserdataRecord};
use crate::error::ApiError;

#[derive(Default)]
struct Tables {
    metadata: HashMap<Uuid, MetadataRecord>,
    userdata: HashMap<Uuid, UserdataRecord>,
    // Keyed by canonical address string, matching the Postgres `address`
    // primary key, which is what enforces the single-owner invariant.
    bindings: HashMap<String, IpBinding>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn run_upsert_phases(tables: &mut Tables, instance_id: Uuid, ips: &[String]) -> Result<(), ApiError> {
        let wanted = dedup_ips(ips)?;
        let wanted_keys: std::collections::HashSet<String> =
            wanted.iter().map(|(_, net)| net.to_string().to_lowercase()).collect();

        // Phase 2/3: conflicting bindings owned by someone else are taken over.
        for key in &wanted_keys {
            if let Some(existing) = tables.bindings.get(key) {
                if existing.instance_id != instance_id {
                    tables.bindings.remove(key);
                }
            }
        }

        // Phase 4: prune bindings owned by `self` no longer in `ips`.
        tables
            .bindings
            .retain(|key, binding| !(binding.instance_id == instance_id && !wanted_keys.contains(key)));

        // Phase 5: insert new bindings.
        for (original, net) in &wanted {
            let key = net.to_string().to_lowercase();
            tables.bindings.entry(key).or_insert_with(|| IpBinding {
                address: original.clone(),
                network: *net,
                instance_id,
                created_at: Utc::now(),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_metadata(
        &self,
        instance_id: Uuid,
        ips: &[String],
        blob: Value,
        cancel: &CancellationToken,
    ) -> Result<(), ApiError> {
        if cancel.is_cancelled() {
            return Err(ApiError::Cancelled);
        }
        let mut tables = self.tables.lock().unwrap();
        Self::run_upsert_phases(&mut tables, instance_id, ips)?;

        let now = Utc::now();
        tables
            .metadata
            .entry(instance_id)
            .and_modify(|record| {
                record.blob = blob.clone();
                record.updated_at = now;
            })
            .or_insert(MetadataRecord {
                instance_id,
                blob,
                created_at: now,
                updated_at: now,
            });
        Ok(())
    }

    async fn upsert_userdata(
        &self,
        instance_id: Uuid,
        ips: &[String],
        blob: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<(), ApiError> {
        if cancel.is_cancelled() {
            return Err(ApiError::Cancelled);
        }
        let mut tables = self.tables.lock().unwrap();
        Self::run_upsert_phases(&mut tables, instance_id, ips)?;

        let now = Utc::now();
        tables
            .userdata
            .entry(instance_id)
            .and_modify(|record| {
                record.blob = blob.clone();
                record.updated_at = now;
            })
            .or_insert(UserdataRecord {
                instance_id,
                blob,
                created_at: now,
                updated_at: now,
            });
        Ok(())
    }

    async fn find_metadata(&self, instance_id: Uuid) -> Result<Option<MetadataRecord>, ApiError> {
        Ok(self.tables.lock().unwrap().metadata.get(&instance_id).cloned())
    }

    async fn find_userdata(&self, instance_id: Uuid) -> Result<Option<UserdataRecord>, ApiError> {
        Ok(self.tables.lock().unwrap().userdata.get(&instance_id).cloned())
    }

    async fn delete_metadata(&self, instance_id: Uuid) -> Result<bool, ApiError> {
        let mut tables = self.tables.lock().unwrap();
        let deleted = tables.metadata.remove(&instance_id).is_some();
        if deleted && !tables.userdata.contains_key(&instance_id) {
            tables.bindings.retain(|_, b| b.instance_id != instance_id);
        }
        Ok(deleted)
    }

    async fn delete_userdata(&self, instance_id: Uuid) -> Result<bool, ApiError> {
        let mut tables = self.tables.lock().unwrap();
        let deleted = tables.userdata.remove(&instance_id).is_some();
        if deleted && !tables.metadata.contains_key(&instance_id) {
            tables.bindings.retain(|_, b| b.instance_id != instance_id);
        }
        Ok(deleted)
    }

    async fn resolve_by_ip(&self, ip: IpAddr) -> Result<Option<Uuid>, ApiError> {
        let tables = self.tables.lock().unwrap();
        // Prefer the most specific (longest prefix) match, mirroring the
        // `ORDER BY masklen(network) DESC` tie-break in the Postgres impl.
        let best: Option<&IpBinding> = tables
            .bindings
            .values()
            .filter(|b| network_contains(&b.network, &ip))
            .max_by_key(|b| b.network.prefix());
        Ok(best.map(|b| b.instance_id))
    }

    async fn ping(&self) -> bool {
        true
    }
}

fn network_contains(net: &IpNetwork, ip: &IpAddr) -> bool {
    net.contains(*ip)
}
