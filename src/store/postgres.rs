use std::net::IpAddr;

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use serde_json::Value;
use sqlx::postgres::PgPool;
use sqlx::Row;
use tokio_util::sync::CancellationToken;
use tracing::{debug_span, Instrument};
use uuid::Uuid;

use super::{dedup_ips, MetadataRecord, Store, UserdataRecord};
use crate::config::CrdbConfig;
use crate::error::ApiError;
use crate::error::try_storage;

pub struct PostgresStore {
    pool: PgPool,
    retry: CrdbConfig,
}

impl PostgresStore {
    pub async fn connect(db_uri: &str, retry: CrdbConfig) -> Result<Self, ApiError> {
        let pool = PgPool::connect(db_uri).await.map_err(ApiError::storage)?;

        tracing::info!("starting database migration");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(ApiError::storage)?;
        tracing::info!("finished database migration");

        Ok(Self { pool, retry })
    }

    /// Runs `body` inside a serializable transaction, retrying on
    /// serialization/deadlock failures up to `self.retry.max_retries`
    /// times, aborting early if the storage engine reports a non-transient
    /// error. Each attempt gets its own correlation id span.
    async fn with_retry<F, Fut, T>(&self, op: &str, cancel: &CancellationToken, body: F) -> Result<T, ApiError>
    where
        F: Fn(sqlx::Transaction<'static, sqlx::Postgres>) -> Fut,
        Fut: std::future::Future<Output = Result<(T, sqlx::Transaction<'static, sqlx::Postgres>), sqlx::Error>>,
    {
        let correlation_id = Uuid::new_v4();
        let span = tracing::info_span!("upsert", %correlation_id, op);

        async move {
            let mut attempt: u32 = 0;
            loop {
                if cancel.is_cancelled() {
                    return Err(ApiError::Cancelled);
                }

                attempt += 1;
                let tx = try_storage!(self.pool.begin().await);

                let attempt_span = debug_span!("attempt", attempt);
                let attempt_fut = tokio::time::timeout(self.retry.tx_timeout, body(tx)).instrument(attempt_span);

                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        tracing::info!(attempt, "upsert cancelled by caller, rolling back");
                        return Err(ApiError::Cancelled);
                    }
                    outcome = attempt_fut => outcome,
                };

                let result = match outcome {
                    Ok(inner) => inner,
                    Err(_) => {
                        tracing::warn!(attempt, "transaction timed out");
                        if attempt >= self.retry.max_retries {
                            return Err(ApiError::Storage("transaction timed out after max retries".into()));
                        }
                        tokio::time::sleep(self.retry.retry_interval).await;
                        continue;
                    }
                };

                match result {
                    Ok((value, tx)) => {
                        try_storage!(tx.commit().await);
                        return Ok(value);
                    }
                    Err(err) if is_transient(&err) && attempt < self.retry.max_retries => {
                        tracing::warn!(attempt, error = %err, "transient storage error, retrying");
                        tokio::time::sleep(self.retry.retry_interval).await;
                        continue;
                    }
                    Err(err) => {
                        crate::error::log(&err);
                        return Err(ApiError::Storage(err.to_string()));
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}

/// Classifies Postgres errors the storage engine reports for lock-ordering
/// and serialization conflicts as transient (spec §4.1's "serialization
/// failures, deadlock-like retry signals").
fn is_transient(err: &sqlx::Error) -> bool {
    let Some(db_err) = err.as_database_error() else {
        return false;
    };
    matches!(db_err.code().as_deref(), Some("40001") | Some("40P01"))
}

/// Executes the six-phase upsert algorithm from spec §4.1 against `tx`,
/// shared between metadata and userdata upserts (they differ only in which
/// payload table is written in phase 6).
async fn run_upsert_phases(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    instance_id: Uuid,
    ips: &[String],
) -> Result<(), sqlx::Error> {
    let wanted = dedup_ips(ips).map_err(|_| sqlx::Error::Protocol("invalid ip address".into()))?;
    let wanted_addresses: Vec<String> = wanted.iter().map(|(_, net)| net.to_string().to_lowercase()).collect();

    // Phase 1: lock set. Lock every binding owned by `self` and every
    // binding whose address is in `ips`, in a stable order to avoid
    // deadlocking against a concurrent upsert locking the same rows.
    let _owned_locked = sqlx::query(
        "SELECT address FROM ip_bindings WHERE instance_id = $1 ORDER BY address FOR UPDATE",
    )
    .bind(instance_id)
    .fetch_all(&mut **tx)
    .await?;

    let _conflict_locked = if wanted_addresses.is_empty() {
        Vec::new()
    } else {
        sqlx::query(
            "SELECT address FROM ip_bindings WHERE address = ANY($1) ORDER BY address FOR UPDATE",
        )
        .bind(&wanted_addresses)
        .fetch_all(&mut **tx)
        .await?
    };

    // Phase 2/3: conflicting bindings (owned by someone else) are deleted
    // outright — the IP takeover the spec requires, without cascading into
    // the old owner's payload (spec §9 open question, resolved: no cascade).
    if !wanted_addresses.is_empty() {
        sqlx::query("DELETE FROM ip_bindings WHERE address = ANY($1) AND instance_id <> $2")
            .bind(&wanted_addresses)
            .bind(instance_id)
            .execute(&mut **tx)
            .await?;
    }

    // Phase 4: prune stale bindings owned by `self` that are not in `ips`.
    if wanted_addresses.is_empty() {
        sqlx::query("DELETE FROM ip_bindings WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&mut **tx)
            .await?;
    } else {
        sqlx::query("DELETE FROM ip_bindings WHERE instance_id = $1 AND address <> ALL($2)")
            .bind(instance_id)
            .bind(&wanted_addresses)
            .execute(&mut **tx)
            .await?;
    }

    // Phase 5: insert new bindings. `ON CONFLICT DO NOTHING` makes this
    // idempotent against a binding we already own (re-upsert with the same
    // IP set).
    for (original, net) in &wanted {
        let canonical = net.to_string().to_lowercase();
        sqlx::query(
            "INSERT INTO ip_bindings (address, original_address, network, instance_id, created_at)
             VALUES ($1, $2, $3, $4, now())
             ON CONFLICT (address) DO NOTHING",
        )
        .bind(&canonical)
        .bind(original)
        .bind(net)
        .bind(instance_id)
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}

#[async_trait]
impl Store for PostgresStore {
    async fn upsert_metadata(
        &self,
        instance_id: Uuid,
        ips: &[String],
        blob: Value,
        cancel: &CancellationToken,
    ) -> Result<(), ApiError> {
        let ips = ips.to_vec();
        self.with_retry("upsert_metadata", cancel, move |mut tx| {
            let ips = ips.clone();
            let blob = blob.clone();
            async move {
                run_upsert_phases(&mut tx, instance_id, &ips).await?;

                sqlx::query(
                    "INSERT INTO metadata_records (instance_id, blob, created_at, updated_at)
                     VALUES ($1, $2, now(), now())
                     ON CONFLICT (instance_id) DO UPDATE SET blob = EXCLUDED.blob, updated_at = now()",
                )
                .bind(instance_id)
                .bind(&blob)
                .execute(&mut *tx)
                .instrument(debug_span!("db_upsert_metadata"))
                .await?;

                Ok(((), tx))
            }
        })
        .await
    }

    async fn upsert_userdata(
        &self,
        instance_id: Uuid,
        ips: &[String],
        blob: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<(), ApiError> {
        let ips = ips.to_vec();
        self.with_retry("upsert_userdata", cancel, move |mut tx| {
            let ips = ips.clone();
            let blob = blob.clone();
            async move {
                run_upsert_phases(&mut tx, instance_id, &ips).await?;

                sqlx::query(
                    "INSERT INTO userdata_records (instance_id, blob, created_at, updated_at)
                     VALUES ($1, $2, now(), now())
                     ON CONFLICT (instance_id) DO UPDATE SET blob = EXCLUDED.blob, updated_at = now()",
                )
                .bind(instance_id)
                .bind(&blob)
                .execute(&mut *tx)
                .instrument(debug_span!("db_upsert_userdata"))
                .await?;

                Ok(((), tx))
            }
        })
        .await
    }

    async fn find_metadata(&self, instance_id: Uuid) -> Result<Option<MetadataRecord>, ApiError> {
        let row = try_storage!(
            sqlx::query("SELECT instance_id, blob, created_at, updated_at FROM metadata_records WHERE instance_id = $1")
                .bind(instance_id)
                .fetch_optional(&self.pool)
                .await
        );
        Ok(row.map(|row| MetadataRecord {
            instance_id: row.get("instance_id"),
            blob: row.get("blob"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }))
    }

    async fn find_userdata(&self, instance_id: Uuid) -> Result<Option<UserdataRecord>, ApiError> {
        let row = try_storage!(
            sqlx::query("SELECT instance_id, blob, created_at, updated_at FROM userdata_records WHERE instance_id = $1")
                .bind(instance_id)
                .fetch_optional(&self.pool)
                .await
        );
        Ok(row.map(|row| UserdataRecord {
            instance_id: row.get("instance_id"),
            blob: row.get("blob"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }))
    }

    async fn delete_metadata(&self, instance_id: Uuid) -> Result<bool, ApiError> {
        let mut tx = try_storage!(self.pool.begin().await);

        let deleted = try_storage!(
            sqlx::query("DELETE FROM metadata_records WHERE instance_id = $1")
                .bind(instance_id)
                .execute(&mut *tx)
                .await
        )
        .rows_affected()
            > 0;

        if deleted {
            let has_userdata = try_storage!(
                sqlx::query("SELECT 1 FROM userdata_records WHERE instance_id = $1")
                    .bind(instance_id)
                    .fetch_optional(&mut *tx)
                    .await
            )
            .is_some();

            if !has_userdata {
                try_storage!(
                    sqlx::query("DELETE FROM ip_bindings WHERE instance_id = $1")
                        .bind(instance_id)
                        .execute(&mut *tx)
                        .await
                );
            }
        }

        try_storage!(tx.commit().await);
        Ok(deleted)
    }

    async fn delete_userdata(&self, instance_id: Uuid) -> Result<bool, ApiError> {
        let mut tx = try_storage!(self.pool.begin().await);

        let deleted = try_storage!(
            sqlx::query("DELETE FROM userdata_records WHERE instance_id = $1")
                .bind(instance_id)
                .execute(&mut *tx)
                .await
        )
        .rows_affected()
            > 0;

        if deleted {
            let has_metadata = try_storage!(
                sqlx::query("SELECT 1 FROM metadata_records WHERE instance_id = $1")
                    .bind(instance_id)
                    .fetch_optional(&mut *tx)
                    .await
            )
            .is_some();

            if !has_metadata {
                try_storage!(
                    sqlx::query("DELETE FROM ip_bindings WHERE instance_id = $1")
                        .bind(instance_id)
                        .execute(&mut *tx)
                        .await
                );
            }
        }

        try_storage!(tx.commit().await);
        Ok(deleted)
    }

    async fn resolve_by_ip(&self, ip: IpAddr) -> Result<Option<Uuid>, ApiError> {
        let net = IpNetwork::from(ip);
        let row = try_storage!(
            sqlx::query("SELECT instance_id FROM ip_bindings WHERE network >>= $1 ORDER BY masklen(network) DESC LIMIT 1")
                .bind(net)
                .fetch_optional(&self.pool)
                .await
        );
        Ok(row.map(|row| row.get("instance_id")))
    }

    async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}
