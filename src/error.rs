use std::error::Error as _;

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("request body is not a JSON object: {0}")]
    InvalidPayload(#[source] serde_json::Error),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("invalid generation options: {0}")]
    InvalidOptions(#[source] serde_json::Error),
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("model execution failed: {0}")]
    Inference(String),
}

impl ServiceError {
    /// Renders the error and its source chain, one cause per line.
    pub fn trace(&self) -> String {
        let mut trace = format!("ServiceError: {self}\n");
        let mut source = self.source();
        while let Some(cause) = source {
            trace.push_str(&format!("  caused by: {cause}\n"));
            source = cause.source();
        }
        trace
    }
}

#[cfg(feature = "tch-backend")]
impl From<tch::TchError> for ServiceError {
    fn from(err: tch::TchError) -> Self {
        ServiceError::Inference(err.to_string())
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let trace = self.trace();
        tracing::error!(error = %self, %trace, "generation request failed");

        (
            StatusCode::BAD_REQUEST,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            trace,
        )
            .into_response()
    }
}
