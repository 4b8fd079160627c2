//! The HTTP facade (spec §6): axum router wiring the instance-binding core
//! to the public and admin surfaces. Grounded on `other_examples`' axum
//! admin-handler modules (the teacher's own HTTP layer is the
//! S3-protocol-specific `s3s::S3` trait and doesn't generalize here).

mod admin;
mod health;
mod public;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::cache::CacheCoordinator;
use crate::resolver::{Resolver, TrustedProxies};
use crate::store::Store;
use crate::template::TemplateAugmenter;

pub struct AppState {
    pub cache: Arc<CacheCoordinator>,
    pub resolver: Arc<Resolver>,
    pub store: Arc<dyn Store>,
    pub template: Arc<TemplateAugmenter>,
    pub trusted_proxies: Arc<TrustedProxies>,
    pub admin_token: Option<String>,
}

pub fn router(state: Arc<AppState>) -> Router {
    let admin_routes = admin::router(state.clone());

    Router::new()
        .merge(public::router())
        .merge(health::router())
        .merge(admin_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
