use crate::cli::ServeArgs;
use crate::infra::{build_service, AppState, SeedDocument};
use crate::routes::with_billing_routes;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::info;
use visit_billing::config::AppConfig;
use visit_billing::error::AppError;
use visit_billing::telemetry;

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry)?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    let seed = match (args.seed.take(), args.demo_data) {
        (Some(path), _) => SeedDocument::from_path(&path)?,
        (None, true) => SeedDocument::demo()?,
        (None, false) => SeedDocument::default(),
    };
    let service = build_service(&config.billing, seed)?;

    let app = with_billing_routes(service)
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(?config.environment, %addr, "visit billing service ready");

    axum::serve(listener, app).await?;
    Ok(())
}
