#![allow(dead_code)]

use std::net::SocketAddr;

use async_trait::async_trait;
use axum::Router;
use tokio::net::TcpListener;

use generate_service::{GenerateOptions, GeneratedText, ServiceError, TextGenerator};

/// Generator that continues the prompt with numbered suffixes.
pub struct EchoGenerator;

#[async_trait]
impl TextGenerator for EchoGenerator {
    async fn generate(
        &self,
        context: String,
        options: GenerateOptions,
    ) -> Result<GeneratedText, ServiceError> {
        if context.is_empty() {
            return Err(ServiceError::Tokenizer("input produced no tokens".into()));
        }

        let count = options.num_return_sequences.unwrap_or(1);
        let scores = if options.output_scores {
            vec![vec![vec![0.25, 0.75]; count]]
        } else {
            Vec::new()
        };
        let beam_indices = options
            .num_beams
            .filter(|&beams| beams > 1)
            .map(|_| (0..count).map(|i| vec![i as i64]).collect());

        Ok(GeneratedText {
            sequences: (0..count).map(|i| format!("{context} continuation {i}")).collect(),
            sequences_scores: (0..count).map(|i| -0.5 - i as f32).collect(),
            scores,
            beam_indices,
        })
    }

    fn name(&self) -> &str {
        "echo"
    }
}

pub async fn spawn(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}
