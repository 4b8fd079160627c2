//! The instance-facing surface: `/api/v1/metadata`, `/api/v1/userdata`, and
//! the EC2-compatible `/2009-04-04/...` tree (spec §6). Every route
//! identifies its caller by source IP via the `Resolver`.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::AppState;
use crate::ec2::Ec2Projector;
use crate::error::ApiError;
use crate::resolver::caller_ip;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/v1/metadata", get(get_metadata))
        .route("/api/v1/userdata", get(get_userdata))
        .route("/2009-04-04/meta-data", get(meta_data_root))
        .route("/2009-04-04/meta-data/*subpath", get(meta_data_path))
        .route("/2009-04-04/user-data", get(get_userdata))
}

fn source_ip(peer: SocketAddr, headers: &HeaderMap, state: &AppState) -> IpAddr {
    caller_ip(peer.ip(), headers, &state.trusted_proxies)
}

/// Resolves the caller's metadata JSON, augmented with template fields.
/// Tries the direct `Resolver` (store-backed) first; on `NotFound`, falls
/// through to the cache's by-IP miss path, which may still recover the
/// record from the upstream lookup service.
async fn resolve_metadata_blob(state: &AppState, ip: IpAddr, cancel: &CancellationToken) -> Result<Value, ApiError> {
    let blob = match state.resolver.resolve(ip).await {
        Ok(id) => state.cache.metadata_by_id(id, cancel).await?.blob,
        Err(ApiError::NotFound) => state.cache.metadata_by_ip(ip, None, cancel).await?.blob,
        Err(err) => return Err(err),
    };
    Ok(state.template.augment(&blob))
}

async fn resolve_userdata_bytes(state: &AppState, ip: IpAddr, cancel: &CancellationToken) -> Result<Vec<u8>, ApiError> {
    match state.resolver.resolve(ip).await {
        Ok(id) => Ok(state.cache.userdata_by_id(id, cancel).await?.blob),
        Err(ApiError::NotFound) => Ok(state.cache.userdata_by_ip(ip, None, cancel).await?.blob),
        Err(err) => Err(err),
    }
}

async fn get_metadata(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let ip = source_ip(peer, &headers, &state);
    let cancel = CancellationToken::new();
    Ok(Json(resolve_metadata_blob(&state, ip, &cancel).await?))
}

async fn get_userdata(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let ip = source_ip(peer, &headers, &state);
    let cancel = CancellationToken::new();
    let bytes = resolve_userdata_bytes(&state, ip, &cancel).await?;
    Ok(([(header::CONTENT_TYPE, "text/plain")], bytes))
}

async fn meta_data_root(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    render_ec2_path(&state, peer, &headers, "").await
}

async fn meta_data_path(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(subpath): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    render_ec2_path(&state, peer, &headers, &subpath).await
}

async fn render_ec2_path(
    state: &AppState,
    peer: SocketAddr,
    headers: &HeaderMap,
    path: &str,
) -> Result<impl IntoResponse, ApiError> {
    let ip = source_ip(peer, headers, state);
    let cancel = CancellationToken::new();
    let blob = resolve_metadata_blob(state, ip, &cancel).await?;
    let projector = Ec2Projector::new(&blob)?;
    let values = projector.get(path)?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain")],
        values.join("\n"),
    ))
}
