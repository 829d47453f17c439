use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use generate_service::{ServerConfig, TchGenerator, build_router, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();

    let config = ServerConfig::parse();
    tracing::info!(
        model = %config.huggingface_model,
        kind = ?config.model_type,
        "loading model artifacts"
    );

    let generator = Arc::new(TchGenerator::load(&config)?);
    let router = build_router(generator);

    let listener = TcpListener::bind(config.listen_addr()).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "REST server ready");

    axum::serve(listener, router).await?;

    Ok(())
}
