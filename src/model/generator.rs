use async_trait::async_trait;

use crate::{
    error::ServiceError,
    model::{GenerateOptions, GeneratedText},
};

/// Something that turns a prompt plus generation options into decoded text.
///
/// The server holds exactly one of these for its whole lifetime.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(
        &self,
        context: String,
        options: GenerateOptions,
    ) -> Result<GeneratedText, ServiceError>;

    /// Short label used in logs and the health check.
    fn name(&self) -> &str;
}
