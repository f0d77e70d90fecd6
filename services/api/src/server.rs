use crate::cli::ServeArgs;
use crate::infra::{open_backend, AppState, Backend};
use crate::routes::with_adoption_routes;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use pet_adoption::adoption::{
    AdoptionBackend, AdoptionDesk, LocalImageHost, StaticTokenAuthenticator,
};
use pet_adoption::config::AppConfig;
use pet_adoption::error::AppError;
use pet_adoption::telemetry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry)?;

    match open_backend(&config.storage).await? {
        Backend::Memory(store) => serve_with(config, store).await,
        Backend::Postgres(store) => serve_with(config, store).await,
    }
}

async fn serve_with<B>(config: AppConfig, backend: Arc<B>) -> Result<(), AppError>
where
    B: AdoptionBackend + 'static,
{
    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    if config.auth.tokens.is_empty() {
        warn!("APP_ADMIN_TOKENS is empty; administrative routes will reject every caller");
    }
    let authenticator = StaticTokenAuthenticator::new(config.auth.tokens.clone());
    let images = Arc::new(LocalImageHost::new(
        config.uploads.directory.clone(),
        config.uploads.public_base_url.clone(),
    ));
    let desk = Arc::new(AdoptionDesk::new(
        backend,
        Arc::new(authenticator),
        images.clone(),
    ));

    let app = with_adoption_routes(desk, images)
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(?config.environment, %addr, "pet adoption api ready");

    axum::serve(listener, app).await?;
    Ok(())
}
