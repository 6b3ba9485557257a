use anyhow::{Context, Result};
use axum::{routing::get, Router};
use common_health::HealthRegistry;
use common_metrics::{serve, setup_metrics_routes};
use futures::future::ready;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use behavior_pipeline::{config::Config, service::BehaviorPipelineService};

pub async fn index() -> &'static str {
    "behavior pipeline service"
}

fn start_server(bind: String, readiness: HealthRegistry) -> Result<JoinHandle<()>> {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(move || ready(readiness.get_status())))
        .route("/_liveness", get(|| ready("ok")));
    let router = setup_metrics_routes(router).context("Failed to install metrics recorder")?;

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("Failed to serve metrics on {bind}: {e:#}");
        }
    }))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_JSON").is_ok_and(|v| v.eq_ignore_ascii_case("true"));

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_current_span(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting behavior pipeline service");

    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;

    info!("Configuration loaded: {:?}", config);

    let bind = config.bind_address();
    let service = BehaviorPipelineService::new(config)
        .await
        .context("Failed to create behavior pipeline service")?;

    let server_handle = start_server(bind.clone(), service.readiness())?;
    info!("Started metrics server on {bind}");

    // Blocks until ctrl-c
    service.run().await?;

    server_handle.abort();

    Ok(())
}
