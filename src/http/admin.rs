//! Admin upsert/delete endpoints (spec §6): `/api/v1/device-metadata[/:id]`,
//! `/api/v1/device-userdata[/:id]`, gated by a single bearer credential
//! (spec §1 Non-goals: no authorization model beyond this).

use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use validator::{Validate, ValidationError};

use super::AppState;
use crate::error::{ApiError, FieldMessage};
use crate::store::parse_ip_or_cidr;

pub fn router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/v1/device-metadata", post(upsert_metadata))
        .route(
            "/api/v1/device-metadata/:id",
            get(get_metadata).head(get_metadata).delete(delete_metadata),
        )
        .route("/api/v1/device-userdata", post(upsert_userdata))
        .route(
            "/api/v1/device-userdata/:id",
            get(get_userdata).head(get_userdata).delete(delete_userdata),
        )
        .layer(middleware::from_fn_with_state(state, require_bearer))
}

async fn require_bearer(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let Some(expected) = &state.admin_token else {
        return next.run(request).await;
    };

    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == expected);

    if authorized {
        next.run(request).await
    } else {
        StatusCode::UNAUTHORIZED.into_response()
    }
}

fn validate_ip_addresses(ips: &[String]) -> Result<(), ValidationError> {
    for ip in ips {
        if parse_ip_or_cidr(ip).is_err() {
            let mut err = ValidationError::new("invalid_ip_or_cidr");
            err.message = Some(format!("'{ip}' is not a valid IP address or CIDR block").into());
            return Err(err);
        }
    }
    Ok(())
}

fn validate_non_empty_metadata(metadata: &Value) -> Result<(), ValidationError> {
    let is_empty = match metadata {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    };
    if is_empty {
        return Err(ValidationError::new("metadata_must_be_non_empty"));
    }
    Ok(())
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpsertMetadataBody {
    pub id: Uuid,
    #[validate(custom(function = "validate_non_empty_metadata"))]
    pub metadata: Value,
    #[serde(default, rename = "ipAddresses")]
    #[validate(custom(function = "validate_ip_addresses"))]
    pub ip_addresses: Vec<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpsertUserdataBody {
    pub id: Uuid,
    #[serde(default)]
    pub userdata: String,
    #[serde(default, rename = "ipAddresses")]
    #[validate(custom(function = "validate_ip_addresses"))]
    pub ip_addresses: Vec<String>,
}

/// Converts a `validator::ValidationErrors` into the per-field message
/// contract `ApiError::BadRequest` carries (spec §6).
fn into_bad_request(errors: validator::ValidationErrors) -> ApiError {
    let fields = errors
        .field_errors()
        .into_iter()
        .flat_map(|(field, errs)| {
            errs.iter().map(move |e| {
                let message = e
                    .message
                    .clone()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| e.code.to_string());
                FieldMessage::new(field, message)
            })
        })
        .collect();
    ApiError::BadRequest(fields)
}

/// Re-parses a loosely-typed JSON body into `T`, turning a missing field, a
/// wrong-typed field, or an unparsable `id` into the same `BadRequest`
/// field-message contract `Validate` produces below, instead of axum's
/// default 422 `JsonDataError` response (spec §6: "400 on validation
/// errors ... body carries a list of field/condition messages").
fn parse_body<T: serde::de::DeserializeOwned>(raw: Value) -> Result<T, ApiError> {
    serde_json::from_value(raw).map_err(|err| ApiError::BadRequest(vec![FieldMessage::new("body", err.to_string())]))
}

async fn upsert_metadata(State(state): State<Arc<AppState>>, Json(raw): Json<Value>) -> Result<StatusCode, ApiError> {
    let body: UpsertMetadataBody = parse_body(raw)?;
    body.validate().map_err(into_bad_request)?;
    let cancel = CancellationToken::new();
    state
        .store
        .upsert_metadata(body.id, &body.ip_addresses, body.metadata, &cancel)
        .await?;
    Ok(StatusCode::OK)
}

async fn upsert_userdata(State(state): State<Arc<AppState>>, Json(raw): Json<Value>) -> Result<StatusCode, ApiError> {
    let body: UpsertUserdataBody = parse_body(raw)?;
    body.validate().map_err(into_bad_request)?;
    let cancel = CancellationToken::new();
    state
        .store
        .upsert_userdata(body.id, &body.ip_addresses, body.userdata.into_bytes(), &cancel)
        .await?;
    Ok(StatusCode::OK)
}

async fn get_metadata(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Result<Json<Value>, ApiError> {
    let record = state.store.find_metadata(id).await?.ok_or(ApiError::NotFound)?;
    Ok(Json(state.template.augment(&record.blob)))
}

async fn get_userdata(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Result<impl IntoResponse, ApiError> {
    let record = state.store.find_userdata(id).await?.ok_or(ApiError::NotFound)?;
    Ok(([(header::CONTENT_TYPE, "text/plain")], record.blob))
}

async fn delete_metadata(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Result<StatusCode, ApiError> {
    if state.store.delete_metadata(id).await? {
        Ok(StatusCode::OK)
    } else {
        Err(ApiError::NotFound)
    }
}

async fn delete_userdata(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Result<StatusCode, ApiError> {
    if state.store.delete_userdata(id).await? {
        Ok(StatusCode::OK)
    } else {
        Err(ApiError::NotFound)
    }
}
