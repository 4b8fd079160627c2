use std::io::IsTerminal;
use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use metabindd::cache::CacheCoordinator;
use metabindd::config::Settings;
use metabindd::lookup::{self, HttpLookupClient};
use metabindd::resolver::{Resolver, TrustedProxies};
use metabindd::store::postgres::PostgresStore;
use metabindd::store::Store;
use metabindd::template::TemplateAugmenter;
use metabindd::http;

#[derive(Debug, Parser)]
#[command(version)]
struct Opt {
    /// Path to the configuration file (layered under `METABINDD_` env vars).
    #[arg(long, short, default_value = "config")]
    config: String,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let opt = Opt::parse();
    let settings = Settings::new(&opt.config)?;
    setup_tracing(&settings)?;

    let store: Arc<dyn Store> = Arc::new(PostgresStore::connect(&settings.db.uri, settings.crdb.clone()).await?);

    let lookup = if settings.lookup.enabled {
        let base_url = settings
            .lookup
            .base_url
            .clone()
            .ok_or("lookup.enabled is true but lookup.base_url is unset")?;
        Some(Arc::new(HttpLookupClient::new(base_url)?) as Arc<dyn lookup::LookupClient>)
    } else {
        None
    };

    let resolver = Arc::new(Resolver::new(store.clone()));
    let cache = Arc::new(CacheCoordinator::new(store.clone(), lookup));
    let template = Arc::new(TemplateAugmenter::new(settings.template_fields.clone()));
    let trusted_proxies = Arc::new(TrustedProxies::new(&settings.trusted_proxies)?);

    let state = Arc::new(http::AppState {
        cache,
        resolver,
        store,
        template,
        trusted_proxies,
        admin_token: settings.admin.bearer_token.clone(),
    });

    let addr: SocketAddr = settings.listen.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;

    info!("server is running at http://{local_addr}");
    axum::serve(
        listener,
        http::router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("server is stopped");
    Ok(())
}

fn setup_tracing(settings: &Settings) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::from_default_env();
    let enable_color = std::io::stdout().is_terminal();

    let builder = tracing_subscriber::fmt().with_env_filter(env_filter).with_ansi(enable_color);

    if settings.logging.pretty {
        builder.pretty().init();
    } else {
        builder.init();
    }

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
