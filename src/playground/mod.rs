//! Browser playground: one HTML form that posts prompts to the generation
//! endpoint and shows what comes back.

mod client;
mod examples;
mod form;

use std::sync::Arc;

use askama::Template;
use axum::{
    Form, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub use client::{BackendClient, Completion, RequestFailure, format_seconds};
pub use examples::{EXAMPLE_PROMPTS, default_temperature, example_index};
pub use form::{GeneratePayload, GenerationForm};

use form::{MAX_NEW_TOKENS_RANGE, MAX_PROMPT_CHARS, N_RANGE, TEMPERATURE_RANGE, TOP_P_RANGE};

#[derive(Clone)]
pub struct PlaygroundState {
    pub display_name: Arc<str>,
    pub backend: BackendClient,
}

pub fn build_playground_router(state: PlaygroundState) -> Router {
    Router::new()
        .route("/", get(show).post(submit))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Clone, Copy)]
pub struct Bounds<T> {
    pub min: T,
    pub max: T,
}

impl<T> From<(T, T)> for Bounds<T> {
    fn from((min, max): (T, T)) -> Self {
        Self { min, max }
    }
}

pub struct CompletedView {
    pub texts: Vec<String>,
    pub elapsed: String,
}

pub enum Outcome {
    Pending,
    Completed(CompletedView),
    Failed(String),
}

#[derive(Template)]
#[template(path = "playground.html")]
pub struct PlaygroundPage {
    pub title: String,
    pub examples: &'static [&'static str],
    pub selected: usize,
    pub form: GenerationForm,
    pub max_prompt_chars: usize,
    pub max_new_tokens_bounds: Bounds<u32>,
    pub n_bounds: Bounds<u32>,
    pub temperature_bounds: Bounds<f64>,
    pub top_p_bounds: Bounds<f64>,
    pub outcome: Outcome,
}

impl PlaygroundPage {
    pub fn new(display_name: &str, form: GenerationForm, outcome: Outcome) -> Self {
        Self {
            title: format!("{display_name} Playground"),
            examples: &EXAMPLE_PROMPTS,
            selected: form.selected_example(),
            form,
            max_prompt_chars: MAX_PROMPT_CHARS,
            max_new_tokens_bounds: MAX_NEW_TOKENS_RANGE.into(),
            n_bounds: N_RANGE.into(),
            temperature_bounds: TEMPERATURE_RANGE.into(),
            top_p_bounds: TOP_P_RANGE.into(),
            outcome,
        }
    }
}

impl IntoResponse for PlaygroundPage {
    fn into_response(self) -> Response {
        match self.render() {
            Ok(body) => Html(body).into_response(),
            Err(err) => {
                warn!(error = %err, "failed to render playground page");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ShowQuery {
    example: Option<usize>,
}

async fn show(
    State(state): State<PlaygroundState>,
    Query(query): Query<ShowQuery>,
) -> PlaygroundPage {
    let form = GenerationForm::for_example(query.example.unwrap_or(0));
    PlaygroundPage::new(&state.display_name, form, Outcome::Pending)
}

async fn submit(
    State(state): State<PlaygroundState>,
    Form(form): Form<GenerationForm>,
) -> PlaygroundPage {
    let form = form.clamped();
    let payload = form.payload();

    let outcome = match state.backend.generate(&payload).await {
        Ok(completion) => {
            info!(
                sequences = completion.texts.len(),
                compute_time = completion.compute_time,
                "generation completed"
            );
            Outcome::Completed(CompletedView {
                elapsed: format_seconds(completion.compute_time),
                texts: completion.texts,
            })
        }
        Err(failure) => {
            warn!(backend = state.backend.url(), status = ?failure.status, "generation request failed");
            Outcome::Failed(failure.to_string())
        }
    };

    PlaygroundPage::new(&state.display_name, form, outcome)
}
