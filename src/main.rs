use tracing_subscriber::EnvFilter;

use cleancar_classifier::{api, loader, AppContext, ServiceConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = ServiceConfig::from_env()?;
    let port = cfg.port;
    tracing::info!("starting {} on port {}", api::SERVICE_NAME, port);

    let ctx = AppContext::new(cfg)?;

    // Load in the background; prediction endpoints answer 503 until ready
    let load_ctx = ctx.clone();
    tokio::spawn(async move {
        if let Err(e) = loader::run_startup(load_ctx, loader::load_resources).await {
            tracing::error!("startup sequencing error: {:#}", e);
        }
    });

    let app = api::router(ctx);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
