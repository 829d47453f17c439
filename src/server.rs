use std::{sync::Arc, time::Instant};

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    routing::{get, post},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    error::ServiceError,
    model::{GenerationOutput, GenerationRequest, GenerationResponse, TextGenerator},
};

#[derive(Clone)]
pub struct AppState {
    pub generator: Arc<dyn TextGenerator>,
}

pub fn build_router(generator: Arc<dyn TextGenerator>) -> Router {
    let state = AppState { generator };

    Router::new()
        .route("/health", get(health))
        .route("/generate", post(generate))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "ok"
}

/// The body is taken raw so malformed JSON reports through [`ServiceError`]
/// like every other failure.
async fn generate(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<GenerationResponse>, ServiceError> {
    let start = Instant::now();
    let GenerationRequest {
        context,
        output_logits,
        mut options,
    } = GenerationRequest::from_slice(&body)?;

    let return_dict = options.return_dict_in_generate;
    if output_logits && return_dict {
        options.output_scores = true;
    }

    let generated = state.generator.generate(context.clone(), options).await?;
    let output = GenerationOutput::shape(generated, return_dict, output_logits);
    let compute_time = start.elapsed().as_secs_f64();

    info!(
        model = state.generator.name(),
        compute_time,
        prompt_chars = context.chars().count(),
        "generation finished"
    );

    Ok(Json(GenerationResponse {
        compute_time,
        context,
        output,
    }))
}
