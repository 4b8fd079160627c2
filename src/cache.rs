//! Read-through orchestration: Store → LookupClient → Store.write-back
//! (spec §4.3).

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::ApiError;
use crate::lookup::LookupClient;
use crate::store::{MetadataRecord, Store, UserdataRecord};

/// Lock-free counters incremented at each decision boundary (spec §4.3's
/// "observability contract"). Prometheus *export* of these values is an
/// external collaborator (spec §1); this struct is the seam such an
/// exporter would read from via `snapshot()`.
#[derive(Default)]
pub struct CacheCounters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub lookup_requests: AtomicU64,
    pub lookup_errors: AtomicU64,
    pub store_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheCountersSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub lookup_requests: u64,
    pub lookup_errors: u64,
    pub store_errors: u64,
}

impl CacheCounters {
    pub fn snapshot(&self) -> CacheCountersSnapshot {
        CacheCountersSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            lookup_requests: self.lookup_requests.load(Ordering::Relaxed),
            lookup_errors: self.lookup_errors.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }
}

pub struct CacheCoordinator {
    store: Arc<dyn Store>,
    lookup: Option<Arc<dyn LookupClient>>,
    counters: CacheCounters,
}

impl CacheCoordinator {
    pub fn new(store: Arc<dyn Store>, lookup: Option<Arc<dyn LookupClient>>) -> Self {
        Self {
            store,
            lookup,
            counters: CacheCounters::default(),
        }
    }

    pub fn counters(&self) -> &CacheCounters {
        &self.counters
    }

    pub async fn metadata_by_id(&self, id: Uuid, cancel: &CancellationToken) -> Result<MetadataRecord, ApiError> {
        if let Some(record) = self.store.find_metadata(id).await? {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(record);
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        let Some(lookup) = &self.lookup else {
            return Err(ApiError::NotFound);
        };

        self.counters.lookup_requests.fetch_add(1, Ordering::Relaxed);
        let upstream = lookup.get_metadata_by_id(id).await.inspect_err(|_| {
            self.counters.lookup_errors.fetch_add(1, Ordering::Relaxed);
        })?;
        let Some(upstream) = upstream else {
            return Err(ApiError::NotFound);
        };

        self.write_back_metadata(upstream, cancel).await
    }

    pub async fn metadata_by_ip(&self, ip: IpAddr, id: Option<Uuid>, cancel: &CancellationToken) -> Result<MetadataRecord, ApiError> {
        if let Some(id) = id {
            if let Some(record) = self.store.find_metadata(id).await? {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(record);
            }
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        let Some(lookup) = &self.lookup else {
            return Err(ApiError::NotFound);
        };

        self.counters.lookup_requests.fetch_add(1, Ordering::Relaxed);
        let upstream = lookup.get_metadata_by_ip(ip).await.inspect_err(|_| {
            self.counters.lookup_errors.fetch_add(1, Ordering::Relaxed);
        })?;
        let Some(upstream) = upstream else {
            return Err(ApiError::NotFound);
        };

        self.write_back_metadata(upstream, cancel).await
    }

    pub async fn userdata_by_id(&self, id: Uuid, cancel: &CancellationToken) -> Result<UserdataRecord, ApiError> {
        if let Some(record) = self.store.find_userdata(id).await? {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(record);
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        let Some(lookup) = &self.lookup else {
            return Err(ApiError::NotFound);
        };

        self.counters.lookup_requests.fetch_add(1, Ordering::Relaxed);
        let upstream = lookup.get_userdata_by_id(id).await.inspect_err(|_| {
            self.counters.lookup_errors.fetch_add(1, Ordering::Relaxed);
        })?;
        let Some(upstream) = upstream else {
            return Err(ApiError::NotFound);
        };

        self.write_back_userdata(upstream, cancel).await
    }

    pub async fn userdata_by_ip(&self, ip: IpAddr, id: Option<Uuid>, cancel: &CancellationToken) -> Result<UserdataRecord, ApiError> {
        if let Some(id) = id {
            if let Some(record) = self.store.find_userdata(id).await? {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(record);
            }
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        let Some(lookup) = &self.lookup else {
            return Err(ApiError::NotFound);
        };

        self.counters.lookup_requests.fetch_add(1, Ordering::Relaxed);
        let upstream = lookup.get_userdata_by_ip(ip).await.inspect_err(|_| {
            self.counters.lookup_errors.fetch_add(1, Ordering::Relaxed);
        })?;
        let Some(upstream) = upstream else {
            return Err(ApiError::NotFound);
        };

        self.write_back_userdata(upstream, cancel).await
    }

    async fn write_back_metadata(
        &self,
        upstream: crate::lookup::MetadataLookupRecord,
        cancel: &CancellationToken,
    ) -> Result<MetadataRecord, ApiError> {
        let blob: Value = upstream.metadata;
        if let Err(err) = self
            .store
            .upsert_metadata(upstream.id, &upstream.ip_addresses, blob.clone(), cancel)
            .await
        {
            self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
            return Err(err);
        }

        self.store
            .find_metadata(upstream.id)
            .await?
            .ok_or(ApiError::NotFound)
    }

    async fn write_back_userdata(
        &self,
        upstream: crate::lookup::UserdataLookupRecord,
        cancel: &CancellationToken,
    ) -> Result<UserdataRecord, ApiError> {
        if let Err(err) = self
            .store
            .upsert_userdata(upstream.id, &upstream.ip_addresses, upstream.userdata.clone(), cancel)
            .await
        {
            self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
            return Err(err);
        }

        self.store
            .find_userdata(upstream.id)
            .await?
            .ok_or(ApiError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::{MetadataLookupRecord, UserdataLookupRecord};
    use crate::store::memory::MemoryStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeLookup {
        metadata_by_ip: Mutex<Option<MetadataLookupRecord>>,
    }

    #[async_trait]
    impl LookupClient for FakeLookup {
        async fn get_metadata_by_id(&self, _id: Uuid) -> Result<Option<MetadataLookupRecord>, ApiError> {
            Ok(self.metadata_by_ip.lock().unwrap().clone())
        }
        async fn get_metadata_by_ip(&self, _ip: IpAddr) -> Result<Option<MetadataLookupRecord>, ApiError> {
            Ok(self.metadata_by_ip.lock().unwrap().clone())
        }
        async fn get_userdata_by_id(&self, _id: Uuid) -> Result<Option<UserdataLookupRecord>, ApiError> {
            Ok(None)
        }
        async fn get_userdata_by_ip(&self, _ip: IpAddr) -> Result<Option<UserdataLookupRecord>, ApiError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn cache_miss_writes_back_and_subsequent_read_is_a_hit() {
        let id = Uuid::new_v4();
        let lookup = Arc::new(FakeLookup {
            metadata_by_ip: Mutex::new(Some(MetadataLookupRecord {
                id,
                ip_addresses: vec!["3.4.5.6".into()],
                metadata: serde_json::json!({"some": "m"}),
            })),
        });
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let coordinator = CacheCoordinator::new(store.clone(), Some(lookup.clone()));
        let cancel = CancellationToken::new();

        let record = coordinator
            .metadata_by_ip("3.4.5.6".parse().unwrap(), None, &cancel)
            .await
            .unwrap();
        assert_eq!(record.blob, serde_json::json!({"some": "m"}));
        assert_eq!(coordinator.counters().snapshot().misses, 1);

        // now resolvable directly from the store without the upstream
        assert_eq!(store.resolve_by_ip("3.4.5.6".parse().unwrap()).await.unwrap(), Some(id));
        let second = coordinator.metadata_by_id(id, &cancel).await.unwrap();
        assert_eq!(second.blob, record.blob);
        assert_eq!(coordinator.counters().snapshot().hits, 1);
    }

    #[tokio::test]
    async fn disabled_lookup_surfaces_not_found_on_miss() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let coordinator = CacheCoordinator::new(store, None);
        let cancel = CancellationToken::new();

        let err = coordinator.metadata_by_id(Uuid::new_v4(), &cancel).await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound));
    }
}
