use std::sync::Arc;

use async_trait::async_trait;
use tokio::task;

use crate::{
    config::ServerConfig,
    error::ServiceError,
    model::{GenerateOptions, GeneratedText, TextGenerator, loader::ModelInstance},
};

/// [`TextGenerator`] backed by a TorchScript module running under libtorch.
pub struct TchGenerator {
    model: Arc<ModelInstance>,
}

impl TchGenerator {
    pub fn load(config: &ServerConfig) -> anyhow::Result<Self> {
        let model = ModelInstance::load(config)?;
        Ok(Self {
            model: Arc::new(model),
        })
    }
}

#[async_trait]
impl TextGenerator for TchGenerator {
    async fn generate(
        &self,
        context: String,
        options: GenerateOptions,
    ) -> Result<GeneratedText, ServiceError> {
        let model = self.model.clone();

        task::spawn_blocking(move || model.generate(&context, &options))
            .await
            .map_err(|err| ServiceError::Inference(format!("inference task failed: {err}")))?
    }

    fn name(&self) -> &str {
        self.model.name()
    }
}
