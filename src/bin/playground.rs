use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use generate_service::{
    BackendClient, PlaygroundConfig, PlaygroundState, build_playground_router, telemetry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();

    let config = PlaygroundConfig::parse();
    let state = PlaygroundState {
        display_name: Arc::from(config.displayed_model_name.as_str()),
        backend: BackendClient::new(config.backend.clone()),
    };
    let router = build_playground_router(state);

    let listener = TcpListener::bind(config.listen_addr()).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, backend = %config.backend, "playground ready");

    axum::serve(listener, router).await?;

    Ok(())
}
