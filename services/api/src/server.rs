use crate::cli::ServeArgs;
use crate::infra::{build_service, AppState};
use crate::routes::with_loan_routes;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use coop_loans::config::AppConfig;
use coop_loans::error::AppError;
use coop_loans::telemetry;
use coop_loans::workflows::loans::spawn_sweep_loop;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::info;

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

    let (service, _outbox) = build_service(&config.loans)?;
    let service = Arc::new(service);

    let sweep = if args.no_sweep {
        None
    } else {
        let every = config.loans.sweep_interval();
        info!(interval_seconds = every.as_secs(), "starting reminder/expiry sweep");
        Some(spawn_sweep_loop(service.clone(), every))
    };

    let app = with_loan_routes(service)
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(?config.environment, %addr, auto_assign = config.loans.auto_assign, "cooperative loan orchestrator ready");

    let served = axum::serve(listener, app).await;
    if let Some(handle) = sweep {
        handle.abort();
    }
    served?;
    Ok(())
}
